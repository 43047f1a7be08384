// ============================================================================
// Transit service facade
// ============================================================================
//
// The upward API: coordinates in, ready-to-display options out. Callers never
// deal with discovery, persistence or tiers directly.

use crate::config::TransitConfig;
use crate::discovery::RouteDiscoveryEngine;
use crate::error::{Result, TransitError};
use crate::fallback::{ArrivalSource, FallbackChain, LiveFeedTier, ScheduleTier, ThirdPartyTier};
use crate::feed::{NextBusClient, TransitFeed};
use crate::geo::is_valid_coordinate;
use crate::models::{AggregatedOption, NearestStation, TierResult, TopologySnapshot, current_timestamp};
use crate::predictions::PredictionAggregator;
use crate::proximity::{ProximityIndex, nearest_landmarks, nearest_stops};
use crate::schedule::StaticSchedule;
use crate::store::TopologyStore;
use crate::third_party::TripUpdateFeed;
use log::{info, warn};
use rayon::ThreadPool;
use rayon::prelude::*;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopologyStats {
    pub routes: usize,
    pub stops: usize,
    pub discovered_at: i64,
    pub age_days: i64,
    pub format_version: u32,
}

impl TopologyStats {
    fn of(snapshot: &TopologySnapshot) -> Self {
        TopologyStats {
            routes: snapshot.routes.len(),
            stops: snapshot.stops.len(),
            discovered_at: snapshot.discovered_at,
            age_days: snapshot.age_days(current_timestamp()),
            format_version: snapshot.format_version,
        }
    }
}

pub struct TransitService {
    config: TransitConfig,
    pool: Arc<ThreadPool>,
    engine: Arc<RouteDiscoveryEngine>,
    proximity: ProximityIndex,
    aggregator: PredictionAggregator,
    chain: FallbackChain,
}

impl TransitService {
    /// Service backed by the live NextBus feed.
    pub fn new(config: TransitConfig) -> Result<Self> {
        let feed = NextBusClient::new(&config)?;
        Self::with_feed(config, Arc::new(feed))
    }

    pub fn with_feed(config: TransitConfig, feed: Arc<dyn TransitFeed>) -> Result<Self> {
        let store = TopologyStore::from_config(&config);
        Self::with_parts(config, feed, store)
    }

    pub fn with_parts(config: TransitConfig, feed: Arc<dyn TransitFeed>, store: TopologyStore) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("maple-worker-{}", i))
            .build()
            .map_err(|e| TransitError::Startup(format!("Failed to create worker pool: {}", e)))?;
        let pool = Arc::new(pool);

        let engine = Arc::new(RouteDiscoveryEngine::new(
            Arc::clone(&feed),
            store,
            Arc::clone(&pool),
            config.topology_max_age_days,
        ));

        let aggregator = PredictionAggregator::new(
            Arc::clone(&feed),
            Arc::clone(&pool),
            config.max_predictions_per_direction,
        );

        let chain = FallbackChain::new(
            build_tiers(&config, feed),
            config.chain_cache_ttl(),
            config.chain_cache_capacity,
        );

        Ok(TransitService {
            proximity: ProximityIndex::new(Arc::clone(&engine)),
            config,
            pool,
            engine,
            aggregator,
            chain,
        })
    }

    pub fn config(&self) -> &TransitConfig {
        &self.config
    }

    /// Rejects coordinates that are malformed or outside the service area.
    pub fn check_coordinate(&self, lat: f64, lon: f64) -> Result<()> {
        if !is_valid_coordinate(lat, lon) {
            return Err(TransitError::InvalidCoordinate { lat, lon });
        }
        if !self.config.service_area.contains(lat, lon) {
            return Err(TransitError::OutsideServiceArea { lat, lon });
        }
        Ok(())
    }

    /// Live options around a coordinate, closest stop first. Falls back to
    /// station-level tiers when the live path has nothing at all.
    pub fn nearest_stops_with_predictions(
        &self,
        lat: f64,
        lon: f64,
        radius_m: Option<f64>,
    ) -> Result<Vec<AggregatedOption>> {
        self.check_coordinate(lat, lon)?;
        let radius = radius_m.filter(|r| r.is_finite() && *r > 0.0).unwrap_or(self.config.search_radius_m);

        let stops = self.proximity.nearest(lat, lon, radius, self.config.max_stops)?;
        info!("📍 Found {} stops within {}m, getting predictions...", stops.len(), radius);

        let mut options = self.aggregator.options_for_stops(&stops);

        if options.is_empty() {
            info!("🔄 No live options near ({}, {}), falling back to stations", lat, lon);
            options = self.station_fallback_options(lat, lon)?;
        }

        options.sort_by(|a, b| {
            a.distance_meters
                .total_cmp(&b.distance_meters)
                .then(a.closest_arrival.total_cmp(&b.closest_arrival))
        });

        info!("✓ Returning {} options", options.len());
        Ok(options)
    }

    /// Closest stations by straight-line distance. Uses the discovered
    /// topology within the station search radius, else the landmark table.
    pub fn find_nearest_stations(&self, lat: f64, lon: f64, max_count: usize) -> Result<Vec<NearestStation>> {
        self.check_coordinate(lat, lon)?;

        let from_topology: Vec<NearestStation> = match self.engine.load_or_discover() {
            Ok(snapshot) => nearest_stops(&snapshot, lat, lon, self.config.station_search_radius_m, max_count)
                .into_iter()
                .map(|stop| NearestStation {
                    id: stop.stop_id,
                    lat: stop.lat,
                    lon: stop.lon,
                    distance_meters: stop.distance_meters,
                })
                .collect(),
            Err(e) => {
                warn!("⚠️  Topology unavailable for station search ({}), using landmarks", e);
                Vec::new()
            }
        };

        if from_topology.is_empty() {
            return Ok(nearest_landmarks(lat, lon, max_count));
        }
        Ok(from_topology)
    }

    /// Tiered arrivals for one station; never empty.
    pub fn station_arrivals(&self, station_id: &str) -> TierResult {
        self.chain.arrivals(station_id)
    }

    pub fn topology_stats(&self) -> TopologyStats {
        TopologyStats::of(&self.engine.snapshot())
    }

    /// Deliberate invalidation: discards the held topology in favour of a
    /// fresh pass. The old snapshot stays in place if the pass fails.
    pub fn rediscover(&self) -> Result<TopologyStats> {
        let snapshot = self.engine.rediscover()?;
        Ok(TopologyStats::of(&snapshot))
    }

    /// Startup warm-up: stored topology if fresh, otherwise discovery.
    pub fn warm_up(&self) -> Result<TopologyStats> {
        let snapshot = self.engine.load_or_discover()?;
        Ok(TopologyStats::of(&snapshot))
    }

    fn station_fallback_options(&self, lat: f64, lon: f64) -> Result<Vec<AggregatedOption>> {
        let stations = self.find_nearest_stations(lat, lon, self.config.fallback_stations)?;

        let per_station: Vec<Vec<AggregatedOption>> = self.pool.install(|| {
            stations
                .par_iter()
                .map(|station| {
                    let result = self.chain.arrivals(&station.id);
                    result
                        .arrivals
                        .into_iter()
                        .map(|arrival| AggregatedOption {
                            stop_id: station.id.clone(),
                            stop_title: arrival.station_name,
                            distance_meters: station.distance_meters,
                            route_tag: arrival.route_name.clone(),
                            route_title: arrival.route_name,
                            direction_label: String::new(),
                            closest_arrival: arrival.closest_arrival,
                            next_arrivals: arrival.next_arrivals,
                            vehicles: Vec::new(),
                            data_source: result.source,
                        })
                        .collect()
                })
                .collect()
        });

        Ok(per_station.into_iter().flatten().collect())
    }
}

fn build_tiers(config: &TransitConfig, feed: Arc<dyn TransitFeed>) -> Vec<Box<dyn ArrivalSource>> {
    let mut tiers: Vec<Box<dyn ArrivalSource>> =
        vec![Box::new(LiveFeedTier::new(feed, config.max_predictions_per_direction))];

    if let Some(source) = &config.static_gtfs {
        tiers.push(Box::new(ScheduleTier::new(StaticSchedule::new(
            source,
            &config.cache_dir,
            config.schedule_max_age_days,
            config.request_timeout(),
        ))));
    }

    if let Some(url) = &config.third_party_trip_updates_url {
        match TripUpdateFeed::new(url, config.request_timeout()) {
            Ok(feed) => tiers.push(Box::new(ThirdPartyTier::new(feed))),
            Err(e) => warn!("⚠️  Third-party tier disabled: {}", e),
        }
    }

    info!("✓ Fallback chain with {} data tiers (+ synthetic)", tiers.len());
    tiers
}
