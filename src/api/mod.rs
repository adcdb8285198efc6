use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::FromRef;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use sqlx::PgPool;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::GovernorLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::consolidator::Consolidator;
use crate::provisioner::Provisioner;

mod provisioning;
mod webhooks;

#[derive(Debug, Error)]
pub enum ApiServerError {
    #[error("failed to bind to address: {0}")]
    Bind(std::io::Error),
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

#[derive(Clone)]
pub struct ApiState {
    pool: PgPool,
    config: Arc<Config>,
    provisioner: Arc<Provisioner>,
    consolidator: Arc<Consolidator>,
}

impl FromRef<ApiState> for PgPool {
    fn from_ref(state: &ApiState) -> Self {
        state.pool.clone()
    }
}

impl FromRef<ApiState> for Arc<Config> {
    fn from_ref(state: &ApiState) -> Self {
        state.config.clone()
    }
}

impl FromRef<ApiState> for Arc<Provisioner> {
    fn from_ref(state: &ApiState) -> Self {
        state.provisioner.clone()
    }
}

impl FromRef<ApiState> for Arc<Consolidator> {
    fn from_ref(state: &ApiState) -> Self {
        state.consolidator.clone()
    }
}

pub struct ApiServer {
    router: Router,
    socket: SocketAddr,
    shutdown: CancellationToken,
}

impl ApiServer {
    /// Builds the router for the two endpoint families the core itself
    /// exposes: inbound webhooks and IP provisioning. General request
    /// validation, CORS and auth remain external collaborators' concern.
    pub fn new(
        socket: SocketAddr,
        pool: PgPool,
        config: Arc<Config>,
        provisioner: Provisioner,
        consolidator: Consolidator,
        shutdown: CancellationToken,
    ) -> ApiServer {
        // Burst equals the full per-minute allowance so a client that has been
        // quiet isn't throttled below the configured rate; refill is spread
        // evenly over the minute.
        let per_minute = config.webhook_rate_limit_per_minute.max(1);
        let governor_conf: &'static _ = Box::leak(Box::new(
            GovernorConfigBuilder::default()
                .period(Duration::from_secs(60) / per_minute)
                .burst_size(per_minute)
                .finish()
                .expect("valid webhook rate limit configuration"),
        ));

        let state = ApiState {
            pool,
            config,
            provisioner: Arc::new(provisioner),
            consolidator: Arc::new(consolidator),
        };

        let webhook_routes = Router::new()
            .route("/webhooks/bounce", post(webhooks::bounce))
            .route("/webhooks/delivery", post(webhooks::delivery))
            .route("/webhooks/mailwizz", post(webhooks::campaign_event))
            .route("/webhooks/powermta", post(webhooks::campaign_event))
            .layer(GovernorLayer { config: governor_conf });

        let router = Router::new()
            .route("/healthy", get(healthy))
            .merge(webhook_routes)
            .route("/ips", post(provisioning::create_ip))
            .route("/ips/{id}", axum::routing::delete(provisioning::delete_ip))
            .layer((TraceLayer::new_for_http(), TimeoutLayer::new(Duration::from_secs(10))))
            .with_state(state);

        ApiServer {
            socket,
            router: Router::new().nest("/api", router),
            shutdown,
        }
    }

    pub async fn serve(self) -> Result<(), ApiServerError> {
        let listener = TcpListener::bind(self.socket).await.map_err(ApiServerError::Bind)?;

        info!("API server listening on {}", self.socket);

        axum::serve(listener, self.router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(wait_for_shutdown(self.shutdown))
            .await
            .map_err(ApiServerError::Serve)
    }

    pub fn spawn(self) {
        tokio::spawn(async {
            let token = self.shutdown.clone();
            if let Err(e) = self.serve().await {
                error!("server error: {:?}", e);
                token.cancel();
                error!("shutting down API server")
            }
        });
    }
}

async fn wait_for_shutdown(token: CancellationToken) {
    token.cancelled().await;
}

#[derive(Debug, Serialize)]
struct HealthyResponse {
    healthy: bool,
    status: &'static str,
}

async fn healthy(axum::extract::State(pool): axum::extract::State<PgPool>) -> Json<HealthyResponse> {
    match sqlx::query("SELECT 1").execute(&pool).await {
        Ok(_) => Json(HealthyResponse { healthy: true, status: "OK" }),
        Err(e) => {
            error!("database error: {:?}", e);
            Json(HealthyResponse { healthy: false, status: "database error" })
        }
    }
}
