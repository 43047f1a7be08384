// Third-party GTFS-Realtime trip updates.

use crate::error::{Result, TransitError};
use crate::models::{DataSource, StationArrival};
use gtfs_rt::{FeedMessage, TripUpdate};
use log::debug;
use prost::Message;
use reqwest::blocking;
use std::collections::HashMap;
use std::time::Duration;

const ARRIVALS_PER_ROUTE: usize = 3;

pub struct TripUpdateFeed {
    client: blocking::Client,
    url: String,
}

impl TripUpdateFeed {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransitError::UpstreamUnavailable(format!("Failed to create HTTP client: {}", e)))?;

        Ok(TripUpdateFeed {
            client,
            url: url.to_string(),
        })
    }

    pub fn fetch_trip_updates(&self) -> Result<Vec<TripUpdate>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .map_err(|e| TransitError::UpstreamUnavailable(format!("Failed to fetch trip updates: {}", e)))?;

        if !response.status().is_success() {
            return Err(TransitError::UpstreamUnavailable(format!(
                "Trip updates returned {}",
                response.status()
            )));
        }

        let body = response
            .bytes()
            .map_err(|e| TransitError::UpstreamUnavailable(format!("Failed to read trip updates response: {}", e)))?;

        let feed = FeedMessage::decode(&*body)
            .map_err(|e| TransitError::MalformedResponse(format!("Failed to decode trip updates feed: {}", e)))?;

        let updates: Vec<TripUpdate> = feed.entity.into_iter().filter_map(|entity| entity.trip_update).collect();
        debug!("Got {} trip updates", updates.len());
        Ok(updates)
    }

    pub fn arrivals(&self, stop_id: &str, station_name: &str, now: i64, max_routes: usize) -> Result<Vec<StationArrival>> {
        let updates = self.fetch_trip_updates()?;
        Ok(arrivals_from_trip_updates(&updates, stop_id, station_name, now, max_routes))
    }
}

/// Future arrivals at `stop_id`, one entry per route id in order of first
/// appearance. Departure time stands in when a stop has no arrival time.
pub fn arrivals_from_trip_updates(
    updates: &[TripUpdate],
    stop_id: &str,
    station_name: &str,
    now: i64,
    max_routes: usize,
) -> Vec<StationArrival> {
    let mut order: Vec<String> = Vec::new();
    let mut by_route: HashMap<String, Vec<f64>> = HashMap::new();

    for trip_update in updates {
        let route_id = trip_update.trip.route_id.clone().unwrap_or_else(|| "Unknown".to_string());

        for stu in &trip_update.stop_time_update {
            if stu.stop_id.as_deref() != Some(stop_id) {
                continue;
            }

            let time = stu
                .arrival
                .as_ref()
                .and_then(|a| a.time)
                .or_else(|| stu.departure.as_ref().and_then(|d| d.time));

            let Some(time) = time.filter(|t| *t > now) else {
                continue;
            };

            if !by_route.contains_key(&route_id) {
                order.push(route_id.clone());
            }
            let minutes = ((time - now) as f64 / 60.0 * 10.0).round() / 10.0;
            by_route.entry(route_id.clone()).or_default().push(minutes);
        }
    }

    order
        .into_iter()
        .filter_map(|route_id| {
            let minutes = by_route.remove(&route_id)?;
            StationArrival::from_minutes(
                route_id,
                "Transit",
                station_name,
                minutes,
                ARRIVALS_PER_ROUTE,
                DataSource::ThirdParty,
                now,
            )
        })
        .take(max_routes)
        .collect()
}
