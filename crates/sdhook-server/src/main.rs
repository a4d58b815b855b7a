//! sdhook server binary.

mod config;

use std::sync::Arc;

use clap::Parser;
use sdhook::{CancellationToken, Dispatcher};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;

/// Initialize tracing with SDHOOK_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("SDHOOK_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        EnvFilter::new(format!(
            "sdhook={level},sdhook_server={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

async fn build_dispatcher(config: &Config) -> anyhow::Result<Arc<Dispatcher>> {
    let dispatcher = Dispatcher::new(config.dispatcher_config());

    for endpoint in &config.workers {
        dispatcher.add_endpoint(endpoint).await?;
    }

    // Start with only the workers that answer; the rest are retried by the
    // rediscovery loop.
    for worker in dispatcher.list_available_workers().await {
        warn!(worker = %worker.endpoint, "Worker unreachable at startup, will retry");
    }

    let count = dispatcher.worker_count().await;
    if count == 0 {
        warn!("No workers available, submissions will fail until a worker answers");
    }
    info!(workers = count, "Worker pool ready");

    Ok(dispatcher)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing();

    if let Err(msg) = config.validate() {
        error!(error = %msg, "Invalid configuration");
        anyhow::bail!(msg);
    }

    info!(version = sdhook::SDHOOK_VERSION, "Starting sdhook");

    let dispatcher = build_dispatcher(&config).await?;
    let shutdown = CancellationToken::new();

    let maintenance = tokio::spawn(Arc::clone(&dispatcher).run(shutdown.clone()));

    let result = sdhook::transport::serve(config.server_config(), dispatcher, shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = maintenance.await {
        error!(error = %e, "Maintenance loop panicked");
    }

    result
}
