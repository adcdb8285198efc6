use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use sendguard::scheduler::Scheduler;
use sendguard::{init_tracing, shutdown_signal, AppContext, Config};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::ConnectOptions;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    // The "prometheus_gauges" job records into this process's recorder;
    // serve it on its own listener rather than through the api binary's
    // router, since the two are separate processes.
    let metrics_socket = SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), 9100);
    PrometheusBuilder::new()
        .with_http_listener(metrics_socket)
        .install()
        .context("failed to install prometheus exporter")?;

    let config = Arc::new(Config::from_env()?);

    let db_options = PgConnectOptions::from_url(
        &config
            .database_url
            .parse()
            .context("DATABASE_URL must be a valid URL")?,
    )?
    .application_name("sendguard-scheduler");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect_with(db_options)
        .await
        .context("failed to connect to database")?;

    let context = AppContext::new(config.clone(), pool.clone()).await?;

    let retry_queue = sendguard::retry_queue::RetryQueue::new(
        config.retry_queue_path.clone(),
        config.retry_max_retries,
        config.webhook_secret.clone(),
        config.downstream_http_timeout,
    );

    let scheduler = Scheduler::new(
        pool,
        context.node_registry.clone(),
        context.lifecycle(),
        context.warmup_engine(),
        context.blacklist_checker(),
        context.consolidator(),
        retry_queue,
    );

    let shutdown = CancellationToken::new();
    scheduler.spawn_all(shutdown.clone());

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping scheduler");
    shutdown.cancel();

    tokio::time::sleep(Duration::from_secs(2)).await;

    Ok(())
}
