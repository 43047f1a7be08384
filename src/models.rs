// Data model for the discovered route/stop graph and the per-request
// real-time views built on top of it.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Bumped whenever the persisted shape of `TopologySnapshot` changes.
pub const TOPOLOGY_FORMAT_VERSION: u32 = 1;

const SECONDS_PER_DAY: i64 = 86_400;

pub fn current_timestamp() -> i64 {
    Utc::now().timestamp()
}

// ============================================================================
// Provenance
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataSource {
    #[serde(rename = "nextbus")]
    LiveFeed,
    #[serde(rename = "gtfs_static")]
    StaticSchedule,
    #[serde(rename = "third_party")]
    ThirdParty,
    #[serde(rename = "synthetic")]
    Synthetic,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::LiveFeed => "nextbus",
            DataSource::StaticSchedule => "gtfs_static",
            DataSource::ThirdParty => "third_party",
            DataSource::Synthetic => "synthetic",
        }
    }
}

impl std::fmt::Display for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Topology
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub stop_id: String,
    pub stop_code: String,
    /// Intersection or station name, e.g. "Spadina Ave At College St"
    pub title: String,
    pub lat: f64,
    pub lon: f64,
    /// Route tags serving this stop, rebuilt on every discovery pass.
    pub routes: Vec<String>,
    /// Distance from the query point; only meaningful on query results.
    pub distance_meters: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub tag: String,
    pub title: String,
    /// Stops in feed order, as ids into the owning snapshot.
    pub stop_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub format_version: u32,
    /// Unix seconds at which discovery finished.
    pub discovered_at: i64,
    pub routes: BTreeMap<String, Route>,
    /// Stops in discovery order.
    pub stops: Vec<Stop>,
    /// Reverse index: stop id -> route tags serving it.
    pub stop_routes: HashMap<String, Vec<String>>,
    #[serde(skip)]
    stop_positions: HashMap<String, usize>,
}

impl TopologySnapshot {
    pub fn empty() -> Self {
        TopologySnapshot {
            format_version: TOPOLOGY_FORMAT_VERSION,
            discovered_at: 0,
            routes: BTreeMap::new(),
            stops: Vec::new(),
            stop_routes: HashMap::new(),
            stop_positions: HashMap::new(),
        }
    }

    /// True only for a snapshot no pass has produced. A pass keeps at least
    /// one route even when none of its routes has stops.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty() && self.stops.is_empty()
    }

    /// Rebuilds the stop id lookup. Must be called after deserializing.
    pub fn reindex(&mut self) {
        self.stop_positions = self
            .stops
            .iter()
            .enumerate()
            .map(|(i, stop)| (stop.stop_id.clone(), i))
            .collect();
    }

    pub fn stop(&self, stop_id: &str) -> Option<&Stop> {
        self.stop_positions.get(stop_id).map(|&i| &self.stops[i])
    }

    pub fn route(&self, tag: &str) -> Option<&Route> {
        self.routes.get(tag)
    }

    pub fn route_stops(&self, tag: &str) -> Vec<&Stop> {
        self.routes
            .get(tag)
            .map(|route| route.stop_ids.iter().filter_map(|id| self.stop(id)).collect())
            .unwrap_or_default()
    }

    pub fn age_days(&self, now: i64) -> i64 {
        now.saturating_sub(self.discovered_at).max(0) / SECONDS_PER_DAY
    }
}

/// Accumulates routes during a discovery pass.
///
/// The first observation of a stop id fixes its title and coordinates; later
/// observations only add the route tag to the reverse index.
#[derive(Debug, Default)]
pub struct TopologyBuilder {
    routes: BTreeMap<String, Route>,
    stops: Vec<Stop>,
    stop_positions: HashMap<String, usize>,
    stop_routes: HashMap<String, Vec<String>>,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route(&mut self, tag: &str, title: &str, stops: impl IntoIterator<Item = Stop>) {
        let mut stop_ids = Vec::new();

        for stop in stops {
            let stop_id = stop.stop_id.clone();

            if !self.stop_positions.contains_key(&stop_id) {
                self.stop_positions.insert(stop_id.clone(), self.stops.len());
                self.stops.push(Stop {
                    routes: Vec::new(),
                    distance_meters: 0.0,
                    ..stop
                });
            }

            let serving = self.stop_routes.entry(stop_id.clone()).or_default();
            if !serving.iter().any(|t| t == tag) {
                serving.push(tag.to_string());
            }

            stop_ids.push(stop_id);
        }

        self.routes.insert(
            tag.to_string(),
            Route {
                tag: tag.to_string(),
                title: title.to_string(),
                stop_ids,
            },
        );
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn build(self, discovered_at: i64) -> TopologySnapshot {
        let TopologyBuilder {
            routes,
            mut stops,
            stop_positions,
            stop_routes,
        } = self;

        for stop in &mut stops {
            stop.routes = stop_routes.get(&stop.stop_id).cloned().unwrap_or_default();
        }

        TopologySnapshot {
            format_version: TOPOLOGY_FORMAT_VERSION,
            discovered_at,
            routes,
            stops,
            stop_routes,
            stop_positions,
        }
    }
}

// ============================================================================
// Real-time data
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehiclePosition {
    pub vehicle_id: String,
    pub lat: f64,
    pub lon: f64,
    pub heading: f64,
    pub speed_kmh: f64,
    pub route_tag: String,
    pub direction_tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub route_tag: String,
    pub route_title: String,
    /// e.g. "East - 504a King towards Broadview Station"
    pub direction_label: String,
    pub stop_id: String,
    pub arrival_seconds: f64,
    pub arrival_minutes: f64,
    pub vehicle_id: Option<String>,
    /// Last known position of `vehicle_id`, when the same poll reported it.
    pub vehicle: Option<VehiclePosition>,
    pub data_source: DataSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionVehicle {
    #[serde(flatten)]
    pub position: VehiclePosition,
    /// True when the vehicle is predicted to arrive at the option's stop.
    pub predicted: bool,
}

/// One route + direction observed at one stop, ready for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedOption {
    pub stop_id: String,
    pub stop_title: String,
    pub distance_meters: f64,
    pub route_tag: String,
    pub route_title: String,
    pub direction_label: String,
    pub closest_arrival: f64,
    /// Upcoming arrivals in minutes, ascending.
    pub next_arrivals: Vec<f64>,
    pub vehicles: Vec<OptionVehicle>,
    pub data_source: DataSource,
}

// ============================================================================
// Station-level fallback results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationArrival {
    pub route_name: String,
    pub route_type: String,
    pub station_name: String,
    pub closest_arrival: f64,
    pub next_arrivals: Vec<f64>,
    pub data_source: DataSource,
    pub last_updated: i64,
}

impl StationArrival {
    /// Builds an arrival from unsorted minute values, keeping only strictly
    /// positive ones. Returns `None` when nothing remains.
    pub fn from_minutes(
        route_name: impl Into<String>,
        route_type: impl Into<String>,
        station_name: impl Into<String>,
        mut minutes: Vec<f64>,
        limit: usize,
        data_source: DataSource,
        last_updated: i64,
    ) -> Option<Self> {
        minutes.retain(|m| *m > 0.0);
        minutes.sort_by(|a, b| a.total_cmp(b));
        minutes.truncate(limit);

        let closest = *minutes.first()?;
        Some(StationArrival {
            route_name: route_name.into(),
            route_type: route_type.into(),
            station_name: station_name.into(),
            closest_arrival: closest,
            next_arrivals: minutes,
            data_source,
            last_updated,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierResult {
    pub station_id: String,
    pub source: DataSource,
    pub arrivals: Vec<StationArrival>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearestStation {
    pub id: String,
    pub lat: f64,
    pub lon: f64,
    pub distance_meters: f64,
}
