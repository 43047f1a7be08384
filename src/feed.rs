// Upstream real-time feed adapter (NextBus / Umo publicJSONFeed).
//
// Commands: routeList, routeConfig, predictions, vehicleLocations
// Example: https://retro.umoiq.com/service/publicJSONFeed?command=routeList&a=ttc
//
// The feed returns a bare object instead of a one-element array whenever a
// list has a single entry, and numbers as strings. Both are normalized here;
// nothing outside this module sees the wire shapes.

use crate::config::TransitConfig;
use crate::error::{Result, TransitError};
use crate::models::{Stop, VehiclePosition};
use log::debug;
use reqwest::blocking;
use serde::Deserialize;

// ============================================================================
// Normalized feed data
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct RouteSummary {
    pub tag: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteConfig {
    pub tag: String,
    pub title: String,
    pub stops: Vec<Stop>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedPrediction {
    pub seconds: f64,
    pub minutes: f64,
    pub vehicle_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectionPredictions {
    pub label: String,
    pub predictions: Vec<FeedPrediction>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopPredictions {
    pub route_tag: String,
    pub route_title: String,
    pub stop_title: String,
    pub directions: Vec<DirectionPredictions>,
}

/// The four upstream commands this service relies on.
pub trait TransitFeed: Send + Sync {
    fn route_list(&self) -> Result<Vec<RouteSummary>>;

    fn route_config(&self, route_tag: &str) -> Result<RouteConfig>;

    fn predictions(&self, stop_id: &str) -> Result<Vec<StopPredictions>>;

    fn vehicle_locations(&self) -> Result<Vec<VehiclePosition>>;
}

// ============================================================================
// HTTP client
// ============================================================================

pub struct NextBusClient {
    client: blocking::Client,
    base_url: String,
    agency: String,
}

impl NextBusClient {
    pub fn new(config: &TransitConfig) -> Result<Self> {
        let client = blocking::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| TransitError::UpstreamUnavailable(format!("Failed to create HTTP client: {}", e)))?;

        Ok(NextBusClient {
            client,
            base_url: config.feed_url.clone(),
            agency: config.agency.clone(),
        })
    }

    fn fetch(&self, command: &str, extra: &[(&str, &str)]) -> Result<String> {
        let mut query: Vec<(&str, &str)> = vec![("command", command), ("a", self.agency.as_str())];
        query.extend_from_slice(extra);

        debug!("🔄 Feed request {} {:?}", command, extra);

        let response = self
            .client
            .get(&self.base_url)
            .query(&query)
            .send()
            .map_err(|e| TransitError::UpstreamUnavailable(format!("{} request failed: {}", command, e)))?;

        if !response.status().is_success() {
            return Err(TransitError::UpstreamUnavailable(format!(
                "{} returned {}",
                command,
                response.status()
            )));
        }

        response
            .text()
            .map_err(|e| TransitError::UpstreamUnavailable(format!("Failed to read {} response: {}", command, e)))
    }
}

impl TransitFeed for NextBusClient {
    fn route_list(&self) -> Result<Vec<RouteSummary>> {
        parse_route_list(&self.fetch("routeList", &[])?)
    }

    fn route_config(&self, route_tag: &str) -> Result<RouteConfig> {
        parse_route_config(&self.fetch("routeConfig", &[("r", route_tag)])?)
    }

    fn predictions(&self, stop_id: &str) -> Result<Vec<StopPredictions>> {
        parse_predictions(&self.fetch("predictions", &[("stopId", stop_id)])?)
    }

    fn vehicle_locations(&self) -> Result<Vec<VehiclePosition>> {
        parse_vehicle_locations(&self.fetch("vehicleLocations", &[("t", "0")])?)
    }
}

// ============================================================================
// Wire shapes
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

/// A JSON scalar the feed may send as either a string or a number.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(i) => Some(*i as f64),
            Scalar::Float(f) => Some(*f),
            Scalar::Text(s) => s.trim().parse().ok(),
        }
    }

    fn into_text(self) -> Option<String> {
        let text = match self {
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Text(s) => s,
        };
        (!text.is_empty()).then_some(text)
    }
}

#[derive(Debug, Deserialize)]
struct RouteListBody {
    #[serde(default)]
    route: OneOrMany<WireRoute>,
    #[serde(rename = "Error")]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireRoute {
    tag: String,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct RouteConfigBody {
    route: Option<WireRouteConfig>,
    #[serde(rename = "Error")]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireRouteConfig {
    tag: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    stop: OneOrMany<WireStop>,
}

#[derive(Debug, Deserialize)]
struct WireStop {
    #[serde(default)]
    tag: String,
    #[serde(default)]
    title: String,
    lat: Option<Scalar>,
    lon: Option<Scalar>,
    #[serde(rename = "stopId")]
    stop_id: Option<Scalar>,
}

#[derive(Debug, Deserialize)]
struct PredictionsBody {
    #[serde(default)]
    predictions: OneOrMany<WireStopPredictions>,
    #[serde(rename = "Error")]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireStopPredictions {
    #[serde(rename = "routeTag", default)]
    route_tag: String,
    #[serde(rename = "routeTitle")]
    route_title: Option<String>,
    #[serde(rename = "stopTitle", default)]
    stop_title: String,
    #[serde(rename = "dirTitleBecauseNoPredictions")]
    no_prediction_title: Option<String>,
    #[serde(default)]
    direction: OneOrMany<WireDirection>,
}

#[derive(Debug, Deserialize)]
struct WireDirection {
    #[serde(default)]
    title: String,
    #[serde(default)]
    prediction: OneOrMany<WirePrediction>,
}

#[derive(Debug, Deserialize)]
struct WirePrediction {
    seconds: Option<Scalar>,
    minutes: Option<Scalar>,
    vehicle: Option<Scalar>,
}

#[derive(Debug, Deserialize)]
struct VehicleLocationsBody {
    #[serde(default)]
    vehicle: OneOrMany<WireVehicle>,
    #[serde(rename = "Error")]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireVehicle {
    id: Option<Scalar>,
    #[serde(rename = "routeTag", default)]
    route_tag: String,
    #[serde(rename = "dirTag")]
    dir_tag: Option<String>,
    lat: Option<Scalar>,
    lon: Option<Scalar>,
    heading: Option<Scalar>,
    #[serde(rename = "speedKmHr")]
    speed_kmh: Option<Scalar>,
}

fn check_feed_error(error: Option<serde_json::Value>) -> Result<()> {
    match error {
        Some(err) => {
            let content = err
                .get("content")
                .and_then(|c| c.as_str())
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|| err.to_string());
            Err(TransitError::UpstreamUnavailable(format!("Feed error: {}", content)))
        }
        None => Ok(()),
    }
}

// ============================================================================
// Parsing
// ============================================================================

pub fn parse_route_list(body: &str) -> Result<Vec<RouteSummary>> {
    let parsed: RouteListBody = serde_json::from_str(body)?;
    check_feed_error(parsed.error)?;

    Ok(parsed
        .route
        .into_vec()
        .into_iter()
        .filter(|r| !r.tag.is_empty())
        .map(|r| RouteSummary { tag: r.tag, title: r.title })
        .collect())
}

pub fn parse_route_config(body: &str) -> Result<RouteConfig> {
    let parsed: RouteConfigBody = serde_json::from_str(body)?;
    check_feed_error(parsed.error)?;

    let route = parsed
        .route
        .ok_or_else(|| TransitError::MalformedResponse("routeConfig without route".to_string()))?;

    let stops = route
        .stop
        .into_vec()
        .into_iter()
        .filter_map(|stop| {
            let lat = stop.lat.as_ref().and_then(Scalar::as_f64)?;
            let lon = stop.lon.as_ref().and_then(Scalar::as_f64)?;
            let Some(stop_id) = stop.stop_id.and_then(Scalar::into_text) else {
                debug!("Skipping stop '{}' on route {}: no stopId", stop.title, route.tag);
                return None;
            };

            Some(Stop {
                stop_id,
                stop_code: stop.tag,
                title: if stop.title.is_empty() { "Unknown".to_string() } else { stop.title },
                lat,
                lon,
                routes: Vec::new(),
                distance_meters: 0.0,
            })
        })
        .collect();

    Ok(RouteConfig {
        tag: route.tag,
        title: route.title,
        stops,
    })
}

pub fn parse_predictions(body: &str) -> Result<Vec<StopPredictions>> {
    let parsed: PredictionsBody = serde_json::from_str(body)?;
    check_feed_error(parsed.error)?;

    Ok(parsed
        .predictions
        .into_vec()
        .into_iter()
        .map(|group| {
            let fallback_label = group.no_prediction_title.unwrap_or_default();

            let directions = group
                .direction
                .into_vec()
                .into_iter()
                .map(|direction| DirectionPredictions {
                    label: if direction.title.is_empty() {
                        fallback_label.clone()
                    } else {
                        direction.title
                    },
                    predictions: direction
                        .prediction
                        .into_vec()
                        .into_iter()
                        .filter_map(|p| {
                            let minutes = p.minutes.as_ref().and_then(Scalar::as_f64);
                            let seconds = p.seconds.as_ref().and_then(Scalar::as_f64);
                            let (seconds, minutes) = match (seconds, minutes) {
                                (Some(s), Some(m)) => (s, m),
                                (None, Some(m)) => (m * 60.0, m),
                                (Some(s), None) => (s, (s / 60.0).floor()),
                                (None, None) => return None,
                            };
                            Some(FeedPrediction {
                                seconds,
                                minutes,
                                vehicle_id: p.vehicle.and_then(Scalar::into_text),
                            })
                        })
                        .collect(),
                })
                .collect();

            StopPredictions {
                route_tag: group.route_tag,
                route_title: group.route_title.unwrap_or_else(|| "Unknown Route".to_string()),
                stop_title: group.stop_title,
                directions,
            }
        })
        .collect())
}

pub fn parse_vehicle_locations(body: &str) -> Result<Vec<VehiclePosition>> {
    let parsed: VehicleLocationsBody = serde_json::from_str(body)?;
    check_feed_error(parsed.error)?;

    Ok(parsed
        .vehicle
        .into_vec()
        .into_iter()
        .filter_map(|v| {
            Some(VehiclePosition {
                vehicle_id: v.id.and_then(Scalar::into_text)?,
                lat: v.lat.as_ref().and_then(Scalar::as_f64)?,
                lon: v.lon.as_ref().and_then(Scalar::as_f64)?,
                heading: v.heading.as_ref().and_then(Scalar::as_f64).unwrap_or(0.0),
                speed_kmh: v.speed_kmh.as_ref().and_then(Scalar::as_f64).unwrap_or(0.0),
                route_tag: v.route_tag,
                direction_tag: v.dir_tag,
            })
        })
        .collect())
}
