use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vigil_common::task::StopSignal;
use vigil_server::{Cli, Engine, ServerConfig, app_router};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::from_default_env().add_directive("vigil=info".parse()?);
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = ServerConfig::from_cli(Cli::parse());
    let engine = Arc::new(Engine::from_config(&config).await?);

    let stop = StopSignal::new();
    let tasks = engine.start(&stop);

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("vigil listening on {addr}");

    let shutdown = stop.clone();
    axum::serve(listener, app_router(engine))
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
            }
            info!("shutdown requested");
            shutdown.stop();
        })
        .await?;

    stop.stop();
    for task in tasks {
        task.join().await;
    }
    info!("vigil stopped");

    Ok(())
}
