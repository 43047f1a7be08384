// Runtime configuration, read from the environment (and an optional .env file).

use crate::geo::BoundingBox;
use log::warn;
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_FEED_URL: &str = "https://retro.umoiq.com/service/publicJSONFeed";
const DEFAULT_ETCD_KEY: &str = "maple_mover/routes_cache";

/// City of Toronto, roughly Etobicoke to Scarborough and the lake to Steeles.
pub const TORONTO_SERVICE_AREA: BoundingBox = BoundingBox {
    min_lat: 43.58,
    min_lon: -79.64,
    max_lat: 43.86,
    max_lon: -79.11,
};

#[derive(Debug, Clone, Serialize)]
pub struct TransitConfig {
    pub feed_url: String,
    pub agency: String,
    pub request_timeout_secs: u64,
    pub workers: usize,

    pub search_radius_m: f64,
    pub max_stops: usize,
    pub max_predictions_per_direction: usize,
    pub station_search_radius_m: f64,
    pub fallback_stations: usize,

    pub chain_cache_ttl_secs: u64,
    pub chain_cache_capacity: usize,

    pub cache_dir: PathBuf,
    pub topology_max_age_days: i64,
    pub etcd_endpoints: Vec<String>,
    pub etcd_username: Option<String>,
    #[serde(skip_serializing)]
    pub etcd_password: Option<String>,
    pub etcd_key: String,

    pub static_gtfs: Option<String>,
    pub schedule_max_age_days: i64,
    pub third_party_trip_updates_url: Option<String>,

    pub service_area: BoundingBox,
    pub bind: String,
}

impl Default for TransitConfig {
    fn default() -> Self {
        TransitConfig {
            feed_url: DEFAULT_FEED_URL.to_string(),
            agency: "ttc".to_string(),
            request_timeout_secs: 15,
            workers: 8,
            search_radius_m: 700.0,
            max_stops: 10,
            max_predictions_per_direction: 3,
            station_search_radius_m: 2_000.0,
            fallback_stations: 5,
            chain_cache_ttl_secs: 30,
            chain_cache_capacity: 256,
            cache_dir: default_cache_dir(),
            topology_max_age_days: 7,
            etcd_endpoints: Vec::new(),
            etcd_username: None,
            etcd_password: None,
            etcd_key: DEFAULT_ETCD_KEY.to_string(),
            static_gtfs: None,
            schedule_max_age_days: 7,
            third_party_trip_updates_url: None,
            service_area: TORONTO_SERVICE_AREA,
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

impl TransitConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup; unset keys keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = TransitConfig::default();

        let text = |key: &str, default: String| lookup(key).filter(|v| !v.is_empty()).unwrap_or(default);
        let optional = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let service_area = match optional("MAPLE_SERVICE_AREA") {
            Some(raw) => BoundingBox::parse(&raw).unwrap_or_else(|| {
                warn!("⚠️  Ignoring invalid MAPLE_SERVICE_AREA '{}', using Toronto", raw);
                TORONTO_SERVICE_AREA
            }),
            None => defaults.service_area,
        };

        TransitConfig {
            feed_url: text("MAPLE_FEED_URL", defaults.feed_url),
            agency: text("MAPLE_AGENCY", defaults.agency),
            request_timeout_secs: parsed(&lookup, "MAPLE_REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs),
            workers: parsed(&lookup, "MAPLE_WORKERS", defaults.workers).clamp(1, 32),
            search_radius_m: parsed(&lookup, "MAPLE_SEARCH_RADIUS_M", defaults.search_radius_m),
            max_stops: parsed(&lookup, "MAPLE_MAX_STOPS", defaults.max_stops),
            max_predictions_per_direction: parsed(
                &lookup,
                "MAPLE_MAX_PREDICTIONS_PER_DIRECTION",
                defaults.max_predictions_per_direction,
            ),
            station_search_radius_m: parsed(
                &lookup,
                "MAPLE_STATION_SEARCH_RADIUS_M",
                defaults.station_search_radius_m,
            ),
            fallback_stations: parsed(&lookup, "MAPLE_FALLBACK_STATIONS", defaults.fallback_stations),
            chain_cache_ttl_secs: parsed(&lookup, "MAPLE_CHAIN_CACHE_TTL_SECS", defaults.chain_cache_ttl_secs),
            chain_cache_capacity: parsed(&lookup, "MAPLE_CHAIN_CACHE_CAPACITY", defaults.chain_cache_capacity)
                .max(1),
            cache_dir: optional("MAPLE_CACHE_DIR").map(PathBuf::from).unwrap_or(defaults.cache_dir),
            topology_max_age_days: parsed(&lookup, "MAPLE_TOPOLOGY_MAX_AGE_DAYS", defaults.topology_max_age_days),
            etcd_endpoints: optional("MAPLE_ETCD_URLS")
                .map(|raw| {
                    raw.split(',')
                        .map(|url| url.trim().to_string())
                        .filter(|url| !url.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            etcd_username: optional("MAPLE_ETCD_USERNAME"),
            etcd_password: optional("MAPLE_ETCD_PASSWORD"),
            etcd_key: text("MAPLE_ETCD_KEY", defaults.etcd_key),
            static_gtfs: optional("MAPLE_STATIC_GTFS"),
            schedule_max_age_days: parsed(&lookup, "MAPLE_SCHEDULE_MAX_AGE_DAYS", defaults.schedule_max_age_days),
            third_party_trip_updates_url: optional("MAPLE_THIRD_PARTY_TRIP_UPDATES_URL"),
            service_area,
            bind: text("MAPLE_BIND", defaults.bind),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn chain_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.chain_cache_ttl_secs)
    }

    /// Username and password, only when both are set.
    pub fn etcd_credentials(&self) -> Option<(String, String)> {
        match (&self.etcd_username, &self.etcd_password) {
            (Some(username), Some(password)) => Some((username.clone(), password.clone())),
            _ => None,
        }
    }
}

fn parsed<T: FromStr + std::fmt::Display>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key).filter(|v| !v.is_empty()) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("⚠️  Ignoring invalid {}='{}', using {}", key, raw, default);
            default
        }),
        None => default,
    }
}

pub fn default_cache_dir() -> PathBuf {
    let mut path = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("maple_mover");
    path
}
