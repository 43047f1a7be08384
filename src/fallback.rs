// ============================================================================
// Station fallback chain
// ============================================================================
//
// live feed -> static schedule -> third party -> synthetic
//
// The first tier with a non-empty answer wins. Errors and empty answers both
// move on to the next tier, and the synthetic tier always answers, so a
// caller never sees "no data at all".

use crate::error::{Result, TransitError};
use crate::feed::TransitFeed;
use crate::models::{DataSource, StationArrival, TierResult, current_timestamp};
use crate::proximity::find_landmark;
use crate::schedule::StaticSchedule;
use crate::third_party::TripUpdateFeed;
use chrono::Utc;
use chrono_tz::America::Toronto;
use log::{debug, error, info, warn};
use lru::LruCache;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const MAX_ROUTES_PER_STATION: usize = 6;
const ARRIVALS_PER_ROUTE: usize = 3;

/// One tier of the chain.
pub trait ArrivalSource: Send + Sync {
    fn source(&self) -> DataSource;

    fn arrivals(&self, station_id: &str) -> Result<Vec<StationArrival>>;
}

/// Feed stop id for a station identifier: landmark keys map to their stop,
/// anything else is already a stop id.
pub fn feed_stop_id(station_id: &str) -> &str {
    find_landmark(station_id).map(|l| l.stop_id).unwrap_or(station_id)
}

/// `union_station` -> `Union Station`
pub fn display_name(station_id: &str) -> String {
    station_id
        .replace('_', " ")
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

// ============================================================================
// Tiers
// ============================================================================

pub struct LiveFeedTier {
    feed: Arc<dyn TransitFeed>,
    max_per_direction: usize,
}

impl LiveFeedTier {
    pub fn new(feed: Arc<dyn TransitFeed>, max_per_direction: usize) -> Self {
        LiveFeedTier { feed, max_per_direction }
    }
}

impl ArrivalSource for LiveFeedTier {
    fn source(&self) -> DataSource {
        DataSource::LiveFeed
    }

    fn arrivals(&self, station_id: &str) -> Result<Vec<StationArrival>> {
        let groups = self.feed.predictions(feed_stop_id(station_id))?;
        let station_name = display_name(station_id);
        let now = current_timestamp();

        Ok(groups
            .into_iter()
            .filter_map(|group| {
                let minutes: Vec<f64> = group
                    .directions
                    .iter()
                    .flat_map(|d| d.predictions.iter().take(self.max_per_direction).map(|p| p.minutes))
                    .collect();

                StationArrival::from_minutes(
                    group.route_title,
                    "TTC",
                    station_name.clone(),
                    minutes,
                    ARRIVALS_PER_ROUTE,
                    DataSource::LiveFeed,
                    now,
                )
            })
            .collect())
    }
}

pub struct ScheduleTier {
    schedule: StaticSchedule,
}

impl ScheduleTier {
    pub fn new(schedule: StaticSchedule) -> Self {
        ScheduleTier { schedule }
    }
}

impl ArrivalSource for ScheduleTier {
    fn source(&self) -> DataSource {
        DataSource::StaticSchedule
    }

    fn arrivals(&self, station_id: &str) -> Result<Vec<StationArrival>> {
        let now = Utc::now().with_timezone(&Toronto);
        Ok(self
            .schedule
            .scheduled_arrivals(feed_stop_id(station_id), now, MAX_ROUTES_PER_STATION))
    }
}

pub struct ThirdPartyTier {
    feed: TripUpdateFeed,
}

impl ThirdPartyTier {
    pub fn new(feed: TripUpdateFeed) -> Self {
        ThirdPartyTier { feed }
    }
}

impl ArrivalSource for ThirdPartyTier {
    fn source(&self) -> DataSource {
        DataSource::ThirdParty
    }

    fn arrivals(&self, station_id: &str) -> Result<Vec<StationArrival>> {
        self.feed.arrivals(
            feed_stop_id(station_id),
            &display_name(station_id),
            current_timestamp(),
            MAX_ROUTES_PER_STATION,
        )
    }
}

// ============================================================================
// Synthetic placeholder
// ============================================================================

const SYNTHETIC_ROSTER: &[(&str, &str)] = &[
    ("Line 1", "Subway"),
    ("Line 2", "Subway"),
    ("501", "Streetcar"),
    ("504", "Streetcar"),
    ("505", "Streetcar"),
    ("506", "Streetcar"),
    ("510", "Streetcar"),
    ("29", "Bus"),
    ("35", "Bus"),
    ("52", "Bus"),
];
const SYNTHETIC_ROUTES: usize = 4;

/// Placeholder arrivals, a pure function of the station id.
///
/// Four distinct routes from the roster; each gets a first arrival in
/// 1.0..=6.0 minutes and two more at +4.0..=8.0 minute gaps.
pub fn synthetic_arrivals(station_id: &str, generated_at: i64) -> Vec<StationArrival> {
    let mut rng = StdRng::seed_from_u64(seahash::hash(station_id.as_bytes()));
    let picked: Vec<(&str, &str)> = SYNTHETIC_ROSTER
        .choose_multiple(&mut rng, SYNTHETIC_ROUTES)
        .copied()
        .collect();
    let station_name = display_name(station_id);

    picked
        .into_iter()
        .filter_map(|(route_name, route_type)| {
            // tenths of a minute, so the output is exact to one decimal
            let mut tenths: u32 = rng.random_range(10..=60);
            let mut minutes = vec![f64::from(tenths) / 10.0];
            for _ in 0..2 {
                tenths += rng.random_range(40..=80);
                minutes.push(f64::from(tenths) / 10.0);
            }

            StationArrival::from_minutes(
                route_name,
                route_type,
                station_name.clone(),
                minutes,
                ARRIVALS_PER_ROUTE,
                DataSource::Synthetic,
                generated_at,
            )
        })
        .collect()
}

// ============================================================================
// Chain
// ============================================================================

struct CachedResult {
    stored_at: Instant,
    result: TierResult,
}

pub struct FallbackChain {
    tiers: Vec<Box<dyn ArrivalSource>>,
    cache: Mutex<LruCache<String, CachedResult>>,
    ttl: Duration,
}

impl FallbackChain {
    pub fn new(tiers: Vec<Box<dyn ArrivalSource>>, ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        FallbackChain {
            tiers,
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Arrivals for one station from the first tier that has any.
    pub fn arrivals(&self, station_id: &str) -> TierResult {
        if let Some(hit) = self.cached(station_id) {
            debug!("Chain cache hit for {}", station_id);
            return hit;
        }

        let result = self.resolve(station_id);

        let mut cache = self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.put(
            station_id.to_string(),
            CachedResult {
                stored_at: Instant::now(),
                result: result.clone(),
            },
        );
        result
    }

    fn cached(&self, station_id: &str) -> Option<TierResult> {
        let mut cache = self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = cache
            .get(station_id)
            .map(|entry| (entry.stored_at.elapsed() < self.ttl, entry.result.clone()));

        match entry {
            Some((true, result)) => Some(result),
            Some((false, _)) => {
                cache.pop(station_id);
                None
            }
            None => None,
        }
    }

    fn resolve(&self, station_id: &str) -> TierResult {
        for tier in &self.tiers {
            let source = tier.source();
            match tier.arrivals(station_id) {
                Ok(mut arrivals) if !arrivals.is_empty() => {
                    for arrival in &mut arrivals {
                        arrival.data_source = source;
                    }
                    info!("✓ {} arrivals for {} from {}", arrivals.len(), station_id, source);
                    return TierResult {
                        station_id: station_id.to_string(),
                        source,
                        arrivals,
                    };
                }
                Ok(_) => debug!("{} has no data for {}", source, station_id),
                Err(e) => warn!("⚠️  {} failed for {}: {}", source, station_id, e),
            }
        }

        warn!("⚠️  All data sources failed for {}, using synthetic data", station_id);
        let arrivals = synthetic_arrivals(station_id, current_timestamp());
        if arrivals.is_empty() {
            error!("❌ {}", TransitError::NoDataAnySource(station_id.to_string()));
        }

        TierResult {
            station_id: station_id.to_string(),
            source: DataSource::Synthetic,
            arrivals,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behaviour {
        Fail,
        Empty,
        Answer,
    }

    struct ScriptedTier {
        source: DataSource,
        behaviour: Behaviour,
        calls: Arc<AtomicUsize>,
    }

    fn tier(source: DataSource, behaviour: Behaviour) -> (Box<dyn ArrivalSource>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let tier = ScriptedTier {
            source,
            behaviour,
            calls: Arc::clone(&calls),
        };
        (Box::new(tier), calls)
    }

    impl ArrivalSource for ScriptedTier {
        fn source(&self) -> DataSource {
            self.source
        }

        fn arrivals(&self, station_id: &str) -> Result<Vec<StationArrival>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Fail => Err(TransitError::UpstreamUnavailable("down".to_string())),
                Behaviour::Empty => Ok(Vec::new()),
                // Deliberately mislabelled: the chain must retag it
                Behaviour::Answer => Ok(StationArrival::from_minutes(
                    "510",
                    "Streetcar",
                    display_name(station_id),
                    vec![4.0, 12.0],
                    3,
                    DataSource::Synthetic,
                    0,
                )
                .into_iter()
                .collect()),
            }
        }
    }

    #[test]
    fn test_synthetic_guarantee_when_all_tiers_fail() {
        let (live, _) = tier(DataSource::LiveFeed, Behaviour::Fail);
        let (schedule, _) = tier(DataSource::StaticSchedule, Behaviour::Empty);
        let (third, _) = tier(DataSource::ThirdParty, Behaviour::Fail);
        let chain = FallbackChain::new(vec![live, schedule, third], Duration::from_secs(30), 8);

        for station in ["union_station", "14242", "", "nowhere_at_all"] {
            let result = chain.arrivals(station);
            assert_eq!(result.source, DataSource::Synthetic);
            assert!(!result.arrivals.is_empty());
        }
    }

    #[test]
    fn test_first_non_empty_tier_wins_and_is_tagged() {
        let (live, live_calls) = tier(DataSource::LiveFeed, Behaviour::Empty);
        let (schedule, schedule_calls) = tier(DataSource::StaticSchedule, Behaviour::Answer);
        let (third, third_calls) = tier(DataSource::ThirdParty, Behaviour::Answer);
        let chain = FallbackChain::new(vec![live, schedule, third], Duration::from_secs(30), 8);

        let result = chain.arrivals("spadina_station");

        assert_eq!(result.source, DataSource::StaticSchedule);
        assert!(result.arrivals.iter().all(|a| a.data_source == DataSource::StaticSchedule));
        assert_eq!(result.arrivals[0].station_name, "Spadina Station");
        assert_eq!(live_calls.load(Ordering::SeqCst), 1);
        assert_eq!(schedule_calls.load(Ordering::SeqCst), 1);
        assert_eq!(third_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cache_absorbs_repeat_queries() {
        let (live, calls) = tier(DataSource::LiveFeed, Behaviour::Answer);
        let chain = FallbackChain::new(vec![live], Duration::from_secs(30), 8);

        let first = chain.arrivals("union_station");
        let second = chain.arrivals("union_station");
        chain.arrivals("king_station");

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_expired_entries_are_refetched() {
        let (live, calls) = tier(DataSource::LiveFeed, Behaviour::Answer);
        let chain = FallbackChain::new(vec![live], Duration::ZERO, 8);

        chain.arrivals("union_station");
        chain.arrivals("union_station");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_synthetic_arrivals_are_deterministic() {
        let a = synthetic_arrivals("union_station", 1_700_000_000);
        let b = synthetic_arrivals("union_station", 1_700_000_000);
        assert_eq!(a, b);

        assert_eq!(a.len(), 4);
        let mut names: Vec<_> = a.iter().map(|s| s.route_name.clone()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 4);

        for arrival in &a {
            assert_eq!(arrival.next_arrivals.len(), 3);
            assert!((1.0..=6.0).contains(&arrival.closest_arrival));
            for gap in arrival.next_arrivals.windows(2).map(|w| w[1] - w[0]) {
                assert!((3.99..=8.01).contains(&gap), "gap {gap}");
            }
            for m in &arrival.next_arrivals {
                assert_eq!((m * 10.0).round() / 10.0, *m);
            }
            assert_eq!(arrival.station_name, "Union Station");
            assert_eq!(arrival.data_source, DataSource::Synthetic);
        }
    }

    #[test]
    fn test_synthetic_arrivals_vary_by_station() {
        let union = synthetic_arrivals("union_station", 0);
        let differs = ["king_station", "queen_station", "spadina_station", "eglinton_station"]
            .iter()
            .any(|id| {
                let other = synthetic_arrivals(id, 0);
                other.len() != union.len()
                    || other
                        .iter()
                        .zip(&union)
                        .any(|(a, b)| a.route_name != b.route_name || a.next_arrivals != b.next_arrivals)
            });
        assert!(differs);
    }

    #[test]
    fn test_display_name_and_stop_resolution() {
        assert_eq!(display_name("bloor_yonge_station"), "Bloor Yonge Station");
        assert_eq!(display_name("14242"), "14242");
        assert_eq!(feed_stop_id("eglinton_station"), "14242");
        assert_eq!(feed_stop_id("5292"), "5292");
    }
}
