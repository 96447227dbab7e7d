use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub mod api;
pub mod delivery;
pub mod gallery;
pub mod startup_checks;
pub mod static_files;

use delivery::DeliveryConfig;
use gallery::{Breakpoint, ObserverOptions, PackerConfig, PrefetchConfig, default_breakpoints};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub gallery: GalleryConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub name: String,
    pub log_level: String,
    /// Probe every image's dimensions in the background at startup.
    #[serde(default)]
    pub prefetch_on_start: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "Folio".to_string(),
            log_level: "info".to_string(),
            prefetch_on_start: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GalleryConfig {
    pub source_directory: PathBuf,
    /// URL path local photos are served under.
    pub url_prefix: String,
    /// JSON list of image records. When unset the source directory is scanned.
    pub manifest: Option<PathBuf>,
    pub chunk_size: usize,
    pub default_columns: usize,
    pub max_columns: usize,
    pub breakpoints: Vec<Breakpoint>,
    pub reveal_delay_ms: u64,
    pub resize_debounce_ms: u64,
    pub cache_ttl_hours: u64,
    pub load_timeout_ms: Option<u64>,
    pub cell_observer: ObserverOptions,
    pub sentinel_observer: ObserverOptions,
    pub packer: PackerConfig,
    pub prefetch: PrefetchConfig,
}

impl Default for GalleryConfig {
    fn default() -> Self {
        Self {
            source_directory: PathBuf::from("photos"),
            url_prefix: "/photos".to_string(),
            manifest: None,
            chunk_size: 10,
            default_columns: 3,
            max_columns: 5,
            breakpoints: default_breakpoints(),
            reveal_delay_ms: 300,
            resize_debounce_ms: 150,
            cache_ttl_hours: 24,
            load_timeout_ms: None,
            cell_observer: ObserverOptions::new(300.0, 0.01),
            sentinel_observer: ObserverOptions::new(600.0, 0.0),
            packer: PackerConfig::default(),
            prefetch: PrefetchConfig::default(),
        }
    }
}

use axum::{
    Router,
    extract::{Path, State},
    response::IntoResponse,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub photo_handler: static_files::StaticFileHandler,
    pub gallery: gallery::SharedGallery,
    pub config: Config,
}

async fn photo_file_handler(
    State(app_state): State<AppState>,
    Path(path): Path<String>,
) -> impl IntoResponse {
    app_state.photo_handler.serve(&path).await
}

/// Loads the gallery named by `config` and builds the router around it.
pub async fn create_app(config: Config) -> Result<Router, gallery::GalleryError> {
    let gallery =
        gallery::Gallery::load(config.gallery.clone(), config.delivery.clone()).await?;
    Ok(create_router(config, Arc::new(gallery)))
}

pub fn create_router(config: Config, gallery: gallery::SharedGallery) -> Router {
    let photo_handler =
        static_files::StaticFileHandler::new(config.gallery.source_directory.clone());
    let photo_route = format!("/{}/{{*path}}", config.gallery.url_prefix.trim_matches('/'));

    let app_state = AppState {
        photo_handler,
        gallery,
        config,
    };

    Router::new()
        .route(
            "/api/gallery",
            axum::routing::get(api::gallery_layout_handler),
        )
        .route(
            "/api/transform",
            axum::routing::get(api::transform_handler),
        )
        .route(
            "/api/prefetch",
            axum::routing::post(api::prefetch_handler),
        )
        .route(
            "/api/dimensions",
            axum::routing::get(api::dimensions_handler),
        )
        .route(&photo_route, axum::routing::get(photo_file_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let method = request.method();
                    let uri = request.uri();
                    let matched_path = request
                        .extensions()
                        .get::<axum::extract::MatchedPath>()
                        .map(|matched_path| matched_path.as_str());

                    tracing::info_span!(
                        "http_request",
                        method = %method,
                        uri = %uri,
                        matched_path,
                    )
                })
                .on_request(|request: &axum::http::Request<_>, _span: &tracing::Span| {
                    let user_agent = request
                        .headers()
                        .get("user-agent")
                        .and_then(|h| h.to_str().ok())
                        .unwrap_or("-");

                    tracing::info!(
                        target: "access_log",
                        method = %request.method(),
                        path = %request.uri().path(),
                        query = ?request.uri().query(),
                        user_agent = %user_agent,
                        "request"
                    );
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        let size = response
                            .headers()
                            .get("content-length")
                            .and_then(|h| h.to_str().ok())
                            .unwrap_or("-");

                        tracing::info!(
                            target: "access_log",
                            status = %response.status(),
                            size = %size,
                            latency_ms = %latency.as_millis(),
                            "response"
                        );
                    },
                ),
        )
        .with_state(app_state)
}
