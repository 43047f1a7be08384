//! Nearest-stop lookup over the discovered topology.

use crate::discovery::RouteDiscoveryEngine;
use crate::error::Result;
use crate::geo::{BoundingBox, haversine_meters};
use crate::models::{NearestStation, Stop, TopologySnapshot};
use std::sync::Arc;

/// A subway station with a known live-feed stop id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LandmarkStation {
    pub key: &'static str,
    pub stop_id: &'static str,
    pub lat: f64,
    pub lon: f64,
}

const fn landmark(key: &'static str, stop_id: &'static str, lat: f64, lon: f64) -> LandmarkStation {
    LandmarkStation { key, stop_id, lat, lon }
}

pub const LANDMARK_STATIONS: &[LandmarkStation] = &[
    landmark("union_station", "425", 43.6452, -79.3806),
    landmark("king_station", "425", 43.6484, -79.3775),
    landmark("queen_station", "425", 43.6526, -79.3794),
    landmark("dundas_station", "425", 43.6561, -79.3802),
    landmark("college_station", "425", 43.6613, -79.3830),
    landmark("wellesley_station", "425", 43.6656, -79.3846),
    landmark("rosedale_station", "425", 43.6719, -79.3862),
    landmark("spadina_station", "5265", 43.6709, -79.4000),
    landmark("eglinton_station", "14242", 43.7200, -79.4000),
    landmark("bloor_yonge_station", "9126", 43.6709, -79.3868),
];

pub fn find_landmark(key: &str) -> Option<&'static LandmarkStation> {
    LANDMARK_STATIONS.iter().find(|l| l.key == key)
}

pub struct ProximityIndex {
    engine: Arc<RouteDiscoveryEngine>,
}

impl ProximityIndex {
    pub fn new(engine: Arc<RouteDiscoveryEngine>) -> Self {
        ProximityIndex { engine }
    }

    /// Stops within `radius_m`, closest first, at most `max_count`.
    /// Runs discovery first if nothing has been discovered yet.
    pub fn nearest(&self, lat: f64, lon: f64, radius_m: f64, max_count: usize) -> Result<Vec<Stop>> {
        let snapshot = self.engine.load_or_discover()?;
        Ok(nearest_stops(&snapshot, lat, lon, radius_m, max_count))
    }
}

pub fn nearest_stops(
    snapshot: &TopologySnapshot,
    lat: f64,
    lon: f64,
    radius_m: f64,
    max_count: usize,
) -> Vec<Stop> {
    let bbox = BoundingBox::around(lat, lon, radius_m);

    let mut found: Vec<Stop> = snapshot
        .stops
        .iter()
        .filter(|stop| bbox.contains(stop.lat, stop.lon))
        .filter_map(|stop| {
            let distance = haversine_meters(lat, lon, stop.lat, stop.lon);
            (distance <= radius_m).then(|| Stop {
                distance_meters: distance,
                ..stop.clone()
            })
        })
        .collect();

    // sort_by is stable: equal distances keep discovery order
    found.sort_by(|a, b| a.distance_meters.total_cmp(&b.distance_meters));
    found.truncate(max_count);
    found
}

/// Landmark stations ranked by distance, with no radius limit.
pub fn nearest_landmarks(lat: f64, lon: f64, max_count: usize) -> Vec<NearestStation> {
    let mut stations: Vec<NearestStation> = LANDMARK_STATIONS
        .iter()
        .map(|l| NearestStation {
            id: l.key.to_string(),
            lat: l.lat,
            lon: l.lon,
            distance_meters: haversine_meters(lat, lon, l.lat, l.lon),
        })
        .collect();

    stations.sort_by(|a, b| a.distance_meters.total_cmp(&b.distance_meters));
    stations.truncate(max_count);
    stations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::destination_point;
    use crate::models::TopologyBuilder;

    const QUERY: (f64, f64) = (43.6532, -79.3832);

    fn stop_from_query(id: &str, bearing: f64, meters: f64) -> Stop {
        let (lat, lon) = destination_point(QUERY.0, QUERY.1, bearing, meters);
        Stop {
            stop_id: id.to_string(),
            stop_code: id.to_string(),
            title: id.to_string(),
            lat,
            lon,
            routes: Vec::new(),
            distance_meters: 0.0,
        }
    }

    fn stop_north_of_query(id: &str, meters: f64) -> Stop {
        stop_from_query(id, 0.0, meters)
    }

    fn snapshot_of(stops: Vec<Stop>) -> TopologySnapshot {
        let mut builder = TopologyBuilder::new();
        builder.add_route("97", "97-Yonge", stops);
        builder.build(0)
    }

    #[test]
    fn test_radius_excludes_far_stop() {
        let snapshot = snapshot_of(vec![
            stop_north_of_query("far", 5_000.0),
            stop_north_of_query("mid", 650.0),
            stop_north_of_query("near", 20.0),
        ]);

        let ids: Vec<_> = nearest_stops(&snapshot, QUERY.0, QUERY.1, 700.0, 10)
            .into_iter()
            .map(|s| s.stop_id)
            .collect();

        assert_eq!(ids, vec!["near", "mid"]);
    }

    #[test]
    fn test_stop_at_query_point_comes_first() {
        let snapshot = snapshot_of(vec![
            stop_north_of_query("a", 100.0),
            stop_north_of_query("b", 40.0),
            stop_north_of_query("here", 0.0),
        ]);

        let result = nearest_stops(&snapshot, QUERY.0, QUERY.1, 500.0, 3);
        assert_eq!(result[0].stop_id, "here");
        assert!(result[0].distance_meters < 0.001);
    }

    #[test]
    fn test_stops_just_inside_radius_survive_prefilter() {
        let radius = 700.0;
        let snapshot = snapshot_of(vec![
            stop_from_query("north", 0.0, radius * 0.999),
            stop_from_query("east", 90.0, radius * 0.999),
            stop_from_query("south", 180.0, radius * 0.999),
            stop_from_query("west", 270.0, radius * 0.999),
            stop_from_query("outside", 45.0, radius * 1.001),
        ]);

        let mut ids: Vec<_> = nearest_stops(&snapshot, QUERY.0, QUERY.1, radius, 10)
            .into_iter()
            .map(|s| s.stop_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["east", "north", "south", "west"]);
    }

    #[test]
    fn test_results_sorted_bounded_and_within_radius() {
        let stops: Vec<Stop> = (0..60)
            .map(|i| {
                let mut stop = stop_north_of_query(&format!("s{i}"), (i * 37 % 1_500) as f64);
                stop.lon += ((i % 7) as f64 - 3.0) * 0.001;
                stop
            })
            .collect();
        let snapshot = snapshot_of(stops);

        for (radius, max) in [(300.0, 5), (700.0, 10), (1_200.0, 100), (50.0, 0)] {
            let result = nearest_stops(&snapshot, QUERY.0, QUERY.1, radius, max);
            assert!(result.len() <= max);
            assert!(result.iter().all(|s| s.distance_meters <= radius));
            assert!(result.windows(2).all(|w| w[0].distance_meters <= w[1].distance_meters));
        }
    }

    #[test]
    fn test_ties_keep_discovery_order() {
        let snapshot = snapshot_of(vec![
            Stop {
                stop_id: "first".to_string(),
                ..stop_north_of_query("x", 100.0)
            },
            Stop {
                stop_id: "second".to_string(),
                ..stop_north_of_query("x", 100.0)
            },
        ]);

        let ids: Vec<_> = nearest_stops(&snapshot, QUERY.0, QUERY.1, 700.0, 10)
            .into_iter()
            .map(|s| s.stop_id)
            .collect();
        assert_eq!(ids, vec!["first", "second"]);
    }

    #[test]
    fn test_nearest_landmarks() {
        let stations = nearest_landmarks(43.6452, -79.3806, 3);
        assert_eq!(stations.len(), 3);
        assert_eq!(stations[0].id, "union_station");
        assert_eq!(stations[1].id, "king_station");
        assert_eq!(find_landmark("spadina_station").unwrap().stop_id, "5265");
        assert!(find_landmark("kipling_station").is_none());
    }
}
