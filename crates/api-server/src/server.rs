//! API server: HTTP REST surface plus the Prometheus exporter.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use segments_core::config::AppConfig;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::rest::{self, AppState};

/// Build the REST router over `state`.
pub fn router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        // Users and memberships
        .route(
            "/v1/user/:user_id",
            post(rest::create_user).delete(rest::delete_user),
        )
        .route(
            "/v1/user/:user_id/segments",
            get(rest::get_user_segments).post(rest::mutate_user_segments),
        )
        .route("/v1/user/:user_id/operations", get(rest::get_user_operations))
        .route(
            "/v1/user/:user_id/operations/report-link",
            get(rest::get_report_link),
        )
        // Segments
        .route("/v1/segment/list", get(rest::list_segments))
        .route(
            "/v1/segment/:name",
            post(rest::create_segment).delete(rest::delete_segment),
        )
        // Operational endpoints
        .route("/v1/admin/sweep", post(rest::trigger_sweep))
        .route("/ping", get(rest::ping))
        .route("/health", get(rest::health_check))
        // Middleware
        .layer(TimeoutLayer::new(request_timeout))
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct ApiServer {
    config: AppConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: AppConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Serve HTTP until `shutdown` resolves, then drain in-flight requests.
    pub async fn start_http<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = router(
            self.state.clone(),
            Duration::from_secs(self.config.api.request_timeout_secs),
        );

        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }

    /// Install the Prometheus recorder and its scrape listener on a separate
    /// port. Must be called from within the tokio runtime.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        if !self.config.metrics.enabled {
            info!("Metrics exporter disabled");
            return Ok(());
        }

        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}
