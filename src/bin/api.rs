use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sendguard::api::ApiServer;
use sendguard::{init_tracing, shutdown_signal, AppContext, Config};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::ConnectOptions;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Arc::new(Config::from_env()?);

    let db_options = PgConnectOptions::from_url(
        &config
            .database_url
            .parse()
            .context("DATABASE_URL must be a valid URL")?,
    )?
    .application_name("sendguard-api");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect_with(db_options)
        .await
        .context("failed to connect to database")?;

    let context = AppContext::new(config.clone(), pool.clone()).await?;

    let http_socket = SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), 3000);
    let shutdown = CancellationToken::new();

    let server = ApiServer::new(
        http_socket.into(),
        pool,
        config,
        context.provisioner(),
        context.consolidator(),
        shutdown.clone(),
    );
    server.spawn();

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping api server");
    shutdown.cancel();

    tokio::time::sleep(Duration::from_secs(2)).await;

    Ok(())
}
