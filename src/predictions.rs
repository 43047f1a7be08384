// Live predictions and vehicle positions, grouped into per-direction options.

use crate::feed::TransitFeed;
use crate::geo::rounded_coordinate;
use crate::models::{AggregatedOption, DataSource, OptionVehicle, Prediction, Stop, VehiclePosition};
use log::{debug, info, warn};
use rayon::ThreadPool;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// One vehicleLocations poll, keyed by vehicle id.
pub type VehicleMap = HashMap<String, VehiclePosition>;

pub struct PredictionAggregator {
    feed: Arc<dyn TransitFeed>,
    pool: Arc<ThreadPool>,
    max_per_direction: usize,
}

impl PredictionAggregator {
    pub fn new(feed: Arc<dyn TransitFeed>, pool: Arc<ThreadPool>, max_per_direction: usize) -> Self {
        PredictionAggregator {
            feed,
            pool,
            max_per_direction,
        }
    }

    /// One upstream poll; an empty map when it fails.
    pub fn all_vehicle_positions(&self) -> VehicleMap {
        match self.feed.vehicle_locations() {
            Ok(vehicles) => {
                let map: VehicleMap = vehicles.into_iter().map(|v| (v.vehicle_id.clone(), v)).collect();
                info!("🚌 Got {} vehicle locations", map.len());
                map
            }
            Err(e) => {
                warn!("⚠️  Failed to get vehicle locations: {}", e);
                VehicleMap::new()
            }
        }
    }

    /// Live predictions at one stop, restricted to `known_routes` when it is
    /// non-empty. Upstream failures yield an empty list.
    pub fn predictions_for_stop(&self, stop: &Stop, known_routes: &[String], vehicles: &VehicleMap) -> Vec<Prediction> {
        let groups = match self.feed.predictions(&stop.stop_id) {
            Ok(groups) => groups,
            Err(e) => {
                warn!("⚠️  Failed to get predictions for {}: {}", stop.stop_id, e);
                return Vec::new();
            }
        };

        let mut predictions = Vec::new();

        for group in groups {
            if !known_routes.is_empty() && !known_routes.contains(&group.route_tag) {
                continue;
            }

            for direction in &group.directions {
                for p in direction.predictions.iter().take(self.max_per_direction) {
                    predictions.push(Prediction {
                        route_tag: group.route_tag.clone(),
                        route_title: group.route_title.clone(),
                        direction_label: direction.label.clone(),
                        stop_id: stop.stop_id.clone(),
                        arrival_seconds: p.seconds,
                        arrival_minutes: p.minutes,
                        vehicle_id: p.vehicle_id.clone(),
                        vehicle: p.vehicle_id.as_ref().and_then(|id| vehicles.get(id)).cloned(),
                        data_source: DataSource::LiveFeed,
                    });
                }
            }
        }

        debug!("Got {} predictions for stop {}", predictions.len(), stop.stop_id);
        predictions
    }

    /// Options for every stop, in stop order. Vehicle positions are polled
    /// once and shared read-only across the per-stop fetches.
    pub fn options_for_stops(&self, stops: &[Stop]) -> Vec<AggregatedOption> {
        if stops.is_empty() {
            return Vec::new();
        }

        let vehicles = self.all_vehicle_positions();
        let vehicles = &vehicles;

        let per_stop: Vec<Vec<AggregatedOption>> = self.pool.install(|| {
            stops
                .par_iter()
                .map(|stop| {
                    let predictions = self.predictions_for_stop(stop, &stop.routes, vehicles);
                    aggregate_options(stop, predictions, vehicles)
                })
                .collect()
        });

        per_stop.into_iter().flatten().collect()
    }
}

/// Running vehicles on `route_tag`, ordered by vehicle id.
pub fn vehicles_on_route(route_tag: &str, vehicles: &VehicleMap) -> Vec<VehiclePosition> {
    let mut on_route: Vec<VehiclePosition> = vehicles
        .values()
        .filter(|v| v.route_tag == route_tag)
        .cloned()
        .collect();
    on_route.sort_by(|a, b| a.vehicle_id.cmp(&b.vehicle_id));
    on_route
}

/// Groups one stop's predictions by route and direction.
///
/// Only strictly positive arrival times count; a group with none left emits
/// nothing. Options keep the order in which their group first appeared and
/// are then stably ordered by closest arrival.
pub fn aggregate_options(stop: &Stop, predictions: Vec<Prediction>, vehicles: &VehicleMap) -> Vec<AggregatedOption> {
    let mut order: Vec<(String, String, String)> = Vec::new();
    let mut buckets: HashMap<(String, String, String), Vec<Prediction>> = HashMap::new();

    for prediction in predictions {
        let key = (
            prediction.route_tag.clone(),
            prediction.route_title.clone(),
            prediction.direction_label.clone(),
        );
        if !buckets.contains_key(&key) {
            order.push(key.clone());
        }
        buckets.entry(key).or_default().push(prediction);
    }

    let mut options: Vec<AggregatedOption> = order
        .into_iter()
        .filter_map(|key| {
            let mut bucket = buckets.remove(&key)?;
            bucket.retain(|p| p.arrival_minutes > 0.0);
            bucket.sort_by(|a, b| a.arrival_minutes.total_cmp(&b.arrival_minutes));

            let closest = bucket.first()?.arrival_minutes;
            let (route_tag, route_title, direction_label) = key;
            let vehicles = option_vehicles(&route_tag, &bucket, vehicles);

            Some(AggregatedOption {
                stop_id: stop.stop_id.clone(),
                stop_title: stop.title.clone(),
                distance_meters: stop.distance_meters,
                route_tag,
                route_title,
                direction_label,
                closest_arrival: closest,
                next_arrivals: bucket.iter().map(|p| p.arrival_minutes).collect(),
                vehicles,
                data_source: DataSource::LiveFeed,
            })
        })
        .collect();

    options.sort_by(|a, b| a.closest_arrival.total_cmp(&b.closest_arrival));
    options
}

// Predicted vehicles first, then the rest of the route's fleet. Dedup is by
// rounded coordinate: the two polls can disagree on a vehicle by one cycle.
fn option_vehicles(route_tag: &str, bucket: &[Prediction], vehicles: &VehicleMap) -> Vec<OptionVehicle> {
    let mut seen = HashSet::new();
    let mut attached = Vec::new();

    for position in bucket.iter().filter_map(|p| p.vehicle.as_ref()) {
        if seen.insert(rounded_coordinate(position.lat, position.lon)) {
            attached.push(OptionVehicle {
                position: position.clone(),
                predicted: true,
            });
        }
    }

    for position in vehicles_on_route(route_tag, vehicles) {
        if seen.insert(rounded_coordinate(position.lat, position.lon)) {
            attached.push(OptionVehicle {
                position,
                predicted: false,
            });
        }
    }

    attached
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, TransitError};
    use crate::feed::{DirectionPredictions, FeedPrediction, RouteConfig, RouteSummary, StopPredictions};

    fn stop(id: &str, routes: &[&str]) -> Stop {
        Stop {
            stop_id: id.to_string(),
            stop_code: id.to_string(),
            title: "King St West At Spadina Ave".to_string(),
            lat: 43.6456,
            lon: -79.3952,
            routes: routes.iter().map(|r| r.to_string()).collect(),
            distance_meters: 42.0,
        }
    }

    fn vehicle(id: &str, route: &str, lat: f64, lon: f64) -> VehiclePosition {
        VehiclePosition {
            vehicle_id: id.to_string(),
            lat,
            lon,
            heading: 90.0,
            speed_kmh: 20.0,
            route_tag: route.to_string(),
            direction_tag: None,
        }
    }

    fn prediction(route: &str, direction: &str, minutes: f64, vehicle: Option<VehiclePosition>) -> Prediction {
        Prediction {
            route_tag: route.to_string(),
            route_title: format!("{route}-King"),
            direction_label: direction.to_string(),
            stop_id: "s".to_string(),
            arrival_seconds: minutes * 60.0,
            arrival_minutes: minutes,
            vehicle_id: vehicle.as_ref().map(|v| v.vehicle_id.clone()),
            vehicle,
            data_source: DataSource::LiveFeed,
        }
    }

    #[test]
    fn test_same_route_direction_grouped() {
        let options = aggregate_options(
            &stop("s", &["504"]),
            vec![
                prediction("504", "Eastbound", 11.0, None),
                prediction("504", "Eastbound", 3.0, None),
            ],
            &VehicleMap::new(),
        );

        assert_eq!(options.len(), 1);
        assert_eq!(options[0].next_arrivals, vec![3.0, 11.0]);
        assert_eq!(options[0].closest_arrival, 3.0);
        assert_eq!(options[0].distance_meters, 42.0);
    }

    #[test]
    fn test_non_positive_arrivals_never_emitted() {
        let options = aggregate_options(
            &stop("s", &[]),
            vec![
                prediction("504", "Eastbound", 0.0, None),
                prediction("504", "Westbound", -2.0, None),
                prediction("504", "Westbound", 0.0, None),
                prediction("510", "Northbound", 0.0, None),
                prediction("510", "Northbound", 6.0, None),
            ],
            &VehicleMap::new(),
        );

        assert_eq!(options.len(), 1);
        assert_eq!(options[0].route_tag, "510");
        assert_eq!(options[0].next_arrivals, vec![6.0]);
        assert!(options.iter().all(|o| o.closest_arrival > 0.0));
    }

    #[test]
    fn test_route_vehicles_deduplicated_by_coordinate() {
        let predicted = vehicle("4417", "504", 43.64410, -79.39900);
        let mut vehicles = VehicleMap::new();
        // Same car, position reported a few meters off by the other poll
        vehicles.insert("4417".to_string(), vehicle("4417", "504", 43.64412, -79.39902));
        vehicles.insert("4420".to_string(), vehicle("4420", "504", 43.6500, -79.3700));
        vehicles.insert("8100".to_string(), vehicle("8100", "29", 43.7000, -79.4300));

        let options = aggregate_options(
            &stop("s", &["504"]),
            vec![prediction("504", "Eastbound", 4.0, Some(predicted))],
            &vehicles,
        );

        let attached: Vec<(&str, bool)> = options[0]
            .vehicles
            .iter()
            .map(|v| (v.position.vehicle_id.as_str(), v.predicted))
            .collect();
        assert_eq!(attached, vec![("4417", true), ("4420", false)]);
    }

    #[test]
    fn test_vehicles_on_route() {
        let mut vehicles = VehicleMap::new();
        vehicles.insert("b".to_string(), vehicle("b", "505", 43.6, -79.4));
        vehicles.insert("a".to_string(), vehicle("a", "505", 43.7, -79.4));
        vehicles.insert("c".to_string(), vehicle("c", "506", 43.7, -79.4));

        let ids: Vec<_> = vehicles_on_route("505", &vehicles).into_iter().map(|v| v.vehicle_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    struct PredictionFeed;

    impl TransitFeed for PredictionFeed {
        fn route_list(&self) -> Result<Vec<RouteSummary>> {
            Ok(Vec::new())
        }

        fn route_config(&self, route_tag: &str) -> Result<RouteConfig> {
            Err(TransitError::UpstreamUnavailable(route_tag.to_string()))
        }

        fn predictions(&self, stop_id: &str) -> Result<Vec<StopPredictions>> {
            if stop_id == "broken" {
                return Err(TransitError::UpstreamUnavailable("timeout".to_string()));
            }

            let direction = |label: &str, minutes: &[f64]| DirectionPredictions {
                label: label.to_string(),
                predictions: minutes
                    .iter()
                    .map(|m| FeedPrediction {
                        seconds: m * 60.0,
                        minutes: *m,
                        vehicle_id: Some("4417".to_string()),
                    })
                    .collect(),
            };

            Ok(vec![
                StopPredictions {
                    route_tag: "504".to_string(),
                    route_title: "504-King".to_string(),
                    stop_title: "King".to_string(),
                    directions: vec![
                        direction("East", &[2.0, 9.0, 15.0, 22.0]),
                        direction("West", &[5.0]),
                    ],
                },
                StopPredictions {
                    route_tag: "310".to_string(),
                    route_title: "310-Spadina Night".to_string(),
                    stop_title: "King".to_string(),
                    directions: vec![direction("North", &[7.0])],
                },
            ])
        }

        fn vehicle_locations(&self) -> Result<Vec<VehiclePosition>> {
            Ok(vec![vehicle("4417", "504", 43.6441, -79.3990)])
        }
    }

    fn aggregator() -> PredictionAggregator {
        let pool = Arc::new(rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap());
        PredictionAggregator::new(Arc::new(PredictionFeed), pool, 3)
    }

    #[test]
    fn test_predictions_for_stop_filters_and_limits() {
        let aggregator = aggregator();
        let vehicles = aggregator.all_vehicle_positions();
        let predictions = aggregator.predictions_for_stop(&stop("s", &["504"]), &["504".to_string()], &vehicles);

        assert_eq!(predictions.len(), 4);
        assert!(predictions.iter().all(|p| p.route_tag == "504"));
        assert!(predictions[0].vehicle.is_some());

        let unfiltered = aggregator.predictions_for_stop(&stop("s", &[]), &[], &vehicles);
        assert_eq!(unfiltered.len(), 5);
    }

    #[test]
    fn test_one_failing_stop_does_not_abort_others() {
        let options = aggregator().options_for_stops(&[stop("broken", &["504"]), stop("ok", &["504"])]);

        assert_eq!(options.len(), 2);
        assert!(options.iter().all(|o| o.stop_id == "ok"));
        assert_eq!(options[0].direction_label, "East");
        assert_eq!(options[0].next_arrivals, vec![2.0, 9.0, 15.0]);
    }
}
