// Maple Mover API server
// Nearby stops, live arrivals and station fallbacks for the TTC network

use actix_cors::Cors;
use actix_web::{App, HttpResponse, HttpServer, middleware, web};
use log::{error, info, warn};
use maple_mover::models::{AggregatedOption, DataSource, current_timestamp};
use maple_mover::{TransitConfig, TransitError, TransitService};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone)]
struct AppState {
    service: Arc<TransitService>,
}

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
    timestamp: i64,
    sources: Vec<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T, sources: Vec<String>) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
            timestamp: current_timestamp(),
            sources,
        }
    }

    fn error(message: String) -> Self {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message),
            timestamp: current_timestamp(),
            sources: vec![],
        }
    }
}

fn error_response(e: TransitError) -> HttpResponse {
    match e {
        TransitError::OutsideServiceArea { .. } => HttpResponse::UnprocessableEntity()
            .json(ApiResponse::<()>::error("Now only available in Toronto".to_string())),
        TransitError::InvalidCoordinate { .. } => {
            HttpResponse::BadRequest().json(ApiResponse::<()>::error(e.to_string()))
        }
        TransitError::TransitDataUnavailable => HttpResponse::ServiceUnavailable()
            .json(ApiResponse::<()>::error("transit data temporarily unavailable".to_string())),
        other => {
            error!("❌ Request failed: {}", other);
            HttpResponse::InternalServerError().json(ApiResponse::<()>::error(other.to_string()))
        }
    }
}

fn task_failed(e: tokio::task::JoinError) -> HttpResponse {
    error!("❌ Blocking task panicked: {}", e);
    HttpResponse::InternalServerError().json(ApiResponse::<()>::error("Request task panicked".to_string()))
}

fn option_sources(options: &[AggregatedOption]) -> Vec<String> {
    let mut sources: Vec<DataSource> = Vec::new();
    for option in options {
        if !sources.contains(&option.data_source) {
            sources.push(option.data_source);
        }
    }
    sources.iter().map(|s| s.to_string()).collect()
}

// ============================================================================
// API Routes
// ============================================================================

#[derive(Deserialize)]
struct NearbyQuery {
    lat: f64,
    lon: f64,
    radius: Option<f64>,
}

#[derive(Deserialize)]
struct StationsQuery {
    lat: f64,
    lon: f64,
    max: Option<usize>,
}

async fn get_nearby(state: web::Data<AppState>, query: web::Query<NearbyQuery>) -> HttpResponse {
    let NearbyQuery { lat, lon, radius } = query.into_inner();
    let service = state.service.clone();

    match tokio::task::spawn_blocking(move || service.nearest_stops_with_predictions(lat, lon, radius)).await {
        Ok(Ok(options)) => {
            info!("🚏 Nearby ({}, {}): {} options", lat, lon, options.len());
            let sources = option_sources(&options);
            HttpResponse::Ok().json(ApiResponse::success(options, sources))
        }
        Ok(Err(e)) => error_response(e),
        Err(e) => task_failed(e),
    }
}

async fn get_stations(state: web::Data<AppState>, query: web::Query<StationsQuery>) -> HttpResponse {
    let StationsQuery { lat, lon, max } = query.into_inner();
    let service = state.service.clone();
    let max = max.unwrap_or(service.config().fallback_stations);

    match tokio::task::spawn_blocking(move || service.find_nearest_stations(lat, lon, max)).await {
        Ok(Ok(stations)) => HttpResponse::Ok().json(ApiResponse::success(stations, vec![])),
        Ok(Err(e)) => error_response(e),
        Err(e) => task_failed(e),
    }
}

async fn get_station(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let station_id = path.into_inner();
    let service = state.service.clone();

    match tokio::task::spawn_blocking(move || service.station_arrivals(&station_id)).await {
        Ok(result) => {
            let sources = vec![result.source.to_string()];
            HttpResponse::Ok().json(ApiResponse::success(result, sources))
        }
        Err(e) => task_failed(e),
    }
}

async fn get_topology(state: web::Data<AppState>) -> HttpResponse {
    let stats = state.service.topology_stats();
    HttpResponse::Ok().json(ApiResponse::success(stats, vec![DataSource::LiveFeed.to_string()]))
}

async fn force_rediscover(state: web::Data<AppState>) -> HttpResponse {
    info!("🔄 Manual rediscovery requested...");
    let service = state.service.clone();

    match tokio::task::spawn_blocking(move || service.rediscover()).await {
        Ok(Ok(stats)) => {
            info!("✓ Manual rediscovery completed: {} routes, {} stops", stats.routes, stats.stops);
            HttpResponse::Ok().json(ApiResponse::success(stats, vec![DataSource::LiveFeed.to_string()]))
        }
        Ok(Err(e)) => {
            warn!("⚠️  Manual rediscovery failed: {}", e);
            error_response(e)
        }
        Err(e) => task_failed(e),
    }
}

async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let stats = state.service.topology_stats();
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "Maple Mover Transit API",
        "version": env!("CARGO_PKG_VERSION"),
        "topology": stats,
        "timestamp": current_timestamp(),
    }))
}

// ============================================================================
// Server Setup
// ============================================================================

async fn run_server(service: TransitService) -> std::io::Result<()> {
    let bind = service.config().bind.clone();
    let app_state = AppState {
        service: Arc::new(service),
    };

    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║   🚀 Maple Mover Transit Server                            ║");
    println!("╚════════════════════════════════════════════════════════════╝\n");
    println!("🌐 Server running on: http://{}", bind);
    println!("📍 Available Routes:");
    println!("┌─────────────────────────────────────────────────────────────┐");
    println!("│   GET  /api/transit/nearby?lat&lon  - Options near a point  │");
    println!("│   GET  /api/transit/stations?lat&lon - Nearest stations     │");
    println!("│   GET  /api/transit/station/:id     - Station arrivals      │");
    println!("│   GET  /api/transit/topology        - Topology statistics   │");
    println!("│   POST /api/transit/rediscover      - Rediscover routes     │");
    println!("│   GET  /health                      - Health check          │");
    println!("└─────────────────────────────────────────────────────────────┘\n");

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .route("/health", web::get().to(health_check))
            .service(
                web::scope("/api/transit")
                    .route("/nearby", web::get().to(get_nearby))
                    .route("/stations", web::get().to(get_stations))
                    .route("/station/{id}", web::get().to(get_station))
                    .route("/topology", web::get().to(get_topology))
                    .route("/rediscover", web::post().to(force_rediscover)),
            )
    })
    .bind(bind.as_str())?
    .run()
    .await
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = TransitConfig::from_env();
    info!("📡 Feed: {} (agency {})", config.feed_url, config.agency);
    info!("📁 Cache directory: {:?}", config.cache_dir);

    let service = match TransitService::new(config) {
        Ok(service) => service,
        Err(e) => {
            error!("❌ Failed to initialize transit service: {}", e);
            std::process::exit(1);
        }
    };

    match service.warm_up() {
        Ok(stats) => info!(
            "✅ Topology ready: {} routes, {} stops ({} days old)",
            stats.routes, stats.stops, stats.age_days
        ),
        Err(e) => warn!("⚠️  Topology warm-up failed ({}), discovery will retry on first query", e),
    }

    actix_web::rt::System::new().block_on(run_server(service))
}
