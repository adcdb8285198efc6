use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod alerting;
pub mod api;
pub mod blacklist;
pub mod campaign_manager;
pub mod config;
pub mod consolidator;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod node;
pub mod provisioner;
pub mod registry;
pub mod retry_queue;
pub mod scheduler;
pub mod warmup_engine;
pub mod webhooks;

pub use config::Config;
pub use error::Error;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "{}=trace,tower_http=debug,axum=trace,info",
                    env!("CARGO_CRATE_NAME")
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Process-wide collaborators shared between the API server and the scheduler.
///
/// Both binaries build one of these from the same `Config` and `PgPool` so
/// that the lifecycle manager, warmup engine and provisioner always observe
/// the same node registry and campaign-manager collaborator.
#[derive(Clone)]
pub struct AppContext {
    pub pool: sqlx::PgPool,
    pub config: Arc<Config>,
    pub node_registry: Arc<registry::NodeRegistry>,
    pub campaign_manager: Arc<dyn campaign_manager::CampaignManagerAdapter>,
    pub alerter: Arc<alerting::Alerter>,
}

impl AppContext {
    /// Builds every process-wide collaborator from `Config` and a connected
    /// pool: an `SshNodeClient` per configured node, a `PgCampaignManagerAdapter`
    /// connected to `CAMPAIGN_MANAGER_DATABASE_URL`, and a Telegram `Alerter`.
    pub async fn new(config: Arc<Config>, pool: sqlx::PgPool) -> anyhow::Result<Self> {
        let nodes = config
            .node_configs()?
            .into_iter()
            .map(|node_config| {
                let client: Arc<dyn node::NodeClient> = Arc::new(node::SshNodeClient::new(
                    node_config.clone(),
                    config.node_connect_timeout,
                    config.node_call_timeout,
                    config.graceful_reload_queue_depth_threshold,
                ));
                (node_config, client)
            })
            .collect();
        let node_registry = Arc::new(registry::NodeRegistry::new(nodes));

        let campaign_manager_url = std::env::var("CAMPAIGN_MANAGER_DATABASE_URL")
            .unwrap_or_else(|_| config.database_url.clone());
        let campaign_manager: Arc<dyn campaign_manager::CampaignManagerAdapter> =
            Arc::new(campaign_manager::PgCampaignManagerAdapter::connect(&campaign_manager_url).await);

        let alerter = Arc::new(alerting::Alerter::new(&config, pool.clone()));

        Ok(Self {
            pool,
            config,
            node_registry,
            campaign_manager,
            alerter,
        })
    }

    pub fn provisioner(&self) -> provisioner::Provisioner {
        provisioner::Provisioner::new(
            self.pool.clone(),
            self.node_registry.clone(),
            self.campaign_manager.clone(),
        )
    }

    pub fn lifecycle(&self) -> lifecycle::LifecycleManager {
        lifecycle::LifecycleManager::new(self.pool.clone(), self.config.clone(), self.alerter.clone())
    }

    pub fn warmup_engine(&self) -> warmup_engine::WarmupEngine {
        warmup_engine::WarmupEngine::new(
            self.pool.clone(),
            self.campaign_manager.clone(),
            self.alerter.clone(),
            self.lifecycle(),
        )
        .with_thresholds(
            self.config.emergency_bounce_pct,
            self.config.emergency_spam_pct,
            self.config.max_bounce_7d_pct,
            self.config.max_spam_7d_pct,
            self.config.bounce_pause_hours,
            self.config.spam_pause_hours,
            self.config.quarantine_days,
        )
    }

    pub fn blacklist_checker(&self) -> blacklist::BlacklistChecker {
        blacklist::BlacklistChecker::new(self.pool.clone(), self.alerter.clone(), self.config.dns_resolver_timeout)
    }

    pub fn consolidator(&self) -> consolidator::Consolidator {
        consolidator::Consolidator::new(self.pool.clone())
    }
}

pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = token.cancelled() => {},
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
