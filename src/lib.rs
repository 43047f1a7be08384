// Toronto transit topology and real-time arrivals.

pub mod config;
pub mod discovery;
pub mod error;
pub mod fallback;
pub mod feed;
pub mod geo;
pub mod models;
pub mod predictions;
pub mod proximity;
pub mod schedule;
pub mod service;
pub mod store;
pub mod third_party;

pub use config::TransitConfig;
pub use error::{Result, TransitError};
pub use service::TransitService;
