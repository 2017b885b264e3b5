// Route survey backend
// Serves the cached route/stop catalog to field surveyors and stores their
// stop confirmations and location pings (ClickHouse, with a local JSON fallback).

use actix_cors::Cors;
use actix_files::{Files, NamedFile};
use actix_web::{App, HttpResponse, HttpServer, middleware, web};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

mod auth;
mod cache;
mod config;
mod error;
mod models;
mod records;
mod sink;
mod upstream;

use auth::{Authenticator, Principal};
use cache::RouteCache;
use config::{Config, ConfigError};
use error::AppError;
use records::{Payload, build_location_record, build_stop_record};
use sink::{ClickHouseStore, LocalStore, PrimaryWriteFailure, WriteOutcome, WriteSink};
use upstream::{UpstreamClient, UpstreamUnavailable};

pub struct AppState {
    pub config: Config,
    pub cache: RouteCache<UpstreamClient>,
    pub sink: WriteSink<ClickHouseStore>,
    pub auth: Authenticator,
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Upstream client error: {0}")]
    Upstream(#[from] UpstreamUnavailable),
    #[error("ClickHouse client error: {0}")]
    Primary(#[from] PrimaryWriteFailure),
}

impl AppState {
    pub fn new(config: Config) -> Result<Self, StartupError> {
        let cache = RouteCache::new(UpstreamClient::new(&config)?, config.route_cache_ttl);

        let primary = if config.use_clickhouse {
            Some(ClickHouseStore::new(config.clickhouse.clone())?)
        } else {
            None
        };
        let sink = WriteSink::new(
            primary,
            config.clickhouse.timeout,
            LocalStore::new(config.local_data_file.clone()),
        );

        let auth = Authenticator::new(
            config.session_api_token.clone(),
            config.users_file.clone(),
            config.secret_key.as_deref(),
        );

        Ok(Self {
            config,
            cache,
            sink,
            auth,
        })
    }
}

// ============================================================================
// Catalog Endpoints
// ============================================================================

#[derive(Deserialize)]
struct StopsQuery {
    route_id: Option<String>,
}

async fn get_routes(state: web::Data<AppState>, _principal: Principal) -> HttpResponse {
    let lookup = state.cache.get_routes().await;
    info!(count = lookup.value.len(), cache = %lookup.freshness, "Routes requested");

    HttpResponse::Ok()
        .insert_header(("X-Cache", lookup.freshness.as_str()))
        .json(&*lookup.value)
}

async fn get_stops(
    state: web::Data<AppState>,
    _principal: Principal,
    query: web::Query<StopsQuery>,
) -> Result<HttpResponse, AppError> {
    let route_id = query
        .into_inner()
        .route_id
        .filter(|id| !id.is_empty())
        .ok_or(AppError::MissingParameter("route_id"))?;

    let lookup = state.cache.get_stops(&route_id).await;
    info!(route_id = %route_id, count = lookup.value.len(), cache = %lookup.freshness, "Stops requested");

    Ok(HttpResponse::Ok()
        .insert_header(("X-Cache", lookup.freshness.as_str()))
        .json(&*lookup.value))
}

// ============================================================================
// Observation Endpoints
// ============================================================================

async fn record_stop(
    state: web::Data<AppState>,
    principal: Principal,
    body: web::Json<Payload>,
) -> Result<HttpResponse, AppError> {
    let record = build_stop_record(&body, &principal).inspect_err(|e| {
        warn!(error = %e, "Rejected stop record");
    })?;

    store(&state, &record).await?;
    Ok(HttpResponse::Ok().json(json!({ "success": true })))
}

async fn location_update(
    state: web::Data<AppState>,
    principal: Principal,
    body: web::Json<Payload>,
) -> Result<HttpResponse, AppError> {
    let record = build_location_record(&body, &principal);

    store(&state, &record).await?;
    Ok(HttpResponse::Ok().json(json!({ "success": true })))
}

async fn store(state: &AppState, record: &models::ObservationRecord) -> Result<(), AppError> {
    let outcome = state.sink.write(record).await?;

    let (destination, fallback_cause) = match &outcome {
        WriteOutcome::Primary => ("primary", None),
        WriteOutcome::Fallback { cause } => ("local-fallback", Some(cause.to_string())),
        WriteOutcome::Local => ("local", None),
    };
    info!(
        id = %record.id,
        kind = record.kind.as_str(),
        route_id = %record.route_id,
        destination,
        fallback_cause = ?fallback_cause,
        "Observation stored"
    );
    Ok(())
}

// ============================================================================
// Session Endpoints
// ============================================================================

#[derive(Deserialize)]
struct LoginRequest {
    #[serde(default)]
    password: String,
}

async fn login(
    state: web::Data<AppState>,
    body: web::Json<LoginRequest>,
) -> Result<HttpResponse, AppError> {
    let session = state
        .auth
        .login(&body.password)
        .await
        .ok_or(AppError::InvalidCredentials)?;

    info!(user_id = %session.user_id, city = ?session.city, "Surveyor logged in");
    let cookie = state.auth.session_cookie(&session)?;

    Ok(HttpResponse::Ok().cookie(cookie).json(json!({ "success": true })))
}

async fn logout() -> HttpResponse {
    HttpResponse::SeeOther()
        .insert_header(("Location", "/record-data/login"))
        .cookie(Authenticator::removal_cookie())
        .finish()
}

// ============================================================================
// Meta Endpoints
// ============================================================================

async fn get_configs(state: web::Data<AppState>, path: web::Path<(String, String)>) -> HttpResponse {
    let (city, vehicle_type) = path.into_inner();
    HttpResponse::Ok().json(state.config.get_configs(&city, &vehicle_type).await)
}

async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "Route Survey API",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().timestamp(),
        "cache_ttl_secs": state.cache.ttl().as_secs(),
        "cached_stop_routes": state.cache.stop_keys(),
        "primary_store": state.sink.primary_enabled(),
    }))
}

// ============================================================================
// Frontend Routes
// ============================================================================

async fn home() -> HttpResponse {
    HttpResponse::Found()
        .insert_header(("Location", "/record-data/login"))
        .finish()
}

async fn login_page(state: web::Data<AppState>) -> actix_web::Result<NamedFile> {
    Ok(NamedFile::open_async(state.config.static_dir.join("login.html")).await?)
}

async fn bus_data_page(state: web::Data<AppState>) -> actix_web::Result<NamedFile> {
    Ok(NamedFile::open_async(state.config.static_dir.join("index.html")).await?)
}

// ============================================================================
// Server Setup
// ============================================================================

fn api_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/routes", web::get().to(get_routes))
        .route("/stops", web::get().to(get_stops))
        .route("/record", web::post().to(record_stop))
        .route("/location-update", web::post().to(location_update))
        .route("/login", web::post().to(login))
        .route("/logout", web::get().to(logout))
        .route("/configs/{city}/{vehicle_type}", web::get().to(get_configs))
        .route("/health", web::get().to(health_check));
}

fn app_routes(static_dir: &std::path::Path) -> impl FnOnce(&mut web::ServiceConfig) + '_ {
    move |cfg| {
        let json_config = web::JsonConfig::default()
            .error_handler(|err, _req| AppError::MalformedPayload(err.to_string()).into());

        cfg.app_data(json_config)
            .route("/", web::get().to(home))
            .route("/record-data/login", web::get().to(login_page))
            .route("/record-data/login", web::post().to(login))
            .route("/record-data/bus-data", web::get().to(bus_data_page))
            .route("/health", web::get().to(health_check))
            // Web UI and mobile client use different prefixes for the same API.
            .service(web::scope("/api").configure(api_routes))
            .service(web::scope("/routeTrackerApi").configure(api_routes))
            .service(Files::new("/static", static_dir));
    }
}

async fn run_server(state: web::Data<AppState>) -> std::io::Result<()> {
    if let Some(primary) = state.sink.primary() {
        match primary.ensure_table().await {
            Ok(()) => info!(url = %state.config.clickhouse.url, "ClickHouse table ready"),
            Err(e) => warn!(error = %e, "ClickHouse unavailable at startup, records will fall back to local storage until it recovers"),
        }
    }

    let address = (state.config.bind_addr.clone(), state.config.port);
    info!(
        bind = %address.0,
        port = address.1,
        upstream = %state.config.api_base_url,
        cache_ttl_secs = state.cache.ttl().as_secs(),
        clickhouse = state.config.use_clickhouse,
        local_data = %state.config.local_data_file.display(),
        "Starting route survey server"
    );

    println!("📍 Available Routes (under /api and /routeTrackerApi):");
    println!("┌─────────────────────────────────────────────────────────────┐");
    println!("│   GET  /routes                     - Cached route list      │");
    println!("│   GET  /stops?route_id=..          - Cached stops for route │");
    println!("│   POST /record                     - Stop confirmation      │");
    println!("│   POST /location-update            - Location ping          │");
    println!("│   POST /login  GET /logout         - Sessions               │");
    println!("│   GET  /configs/:city/:vehicle     - Client settings        │");
    println!("└─────────────────────────────────────────────────────────────┘\n");

    HttpServer::new(move || {
        let cors = Cors::permissive();
        let static_dir = state.config.static_dir.clone();

        App::new()
            .app_data(state.clone())
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .configure(app_routes(&static_dir))
    })
    .bind(address)?
    .run()
    .await
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> std::io::Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let state = match Config::load()
        .map_err(StartupError::from)
        .and_then(AppState::new)
    {
        Ok(state) => web::Data::new(state),
        Err(e) => {
            error!(error = %e, "Server cannot start");
            std::process::exit(1);
        }
    };

    actix_web::rt::System::new().block_on(run_server(state))
}
