mod api;
mod bootstrap;
mod config;
mod error;
mod ledger;
mod reconciliation;
mod server;
mod settlement;
mod sources;

use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    config::Settings,
    settlement::PayoutScheduler,
    sources::SourcePoller,
};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,pool_manager=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting pool manager");

    let config = Settings::load()?.validate()?;
    info!(
        "Region {}, commission {}%, {} data sources",
        config.region,
        config.commission.percent(),
        config.data_sources.len()
    );

    let components = bootstrap::initialize_components(&config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    let poller = SourcePoller::new(
        components.connector.clone(),
        components.engine.clone(),
        components.ledger.clone(),
        config.fetch_interval,
    );
    tasks.push(poller.start(shutdown_rx.clone()));

    if let (Some(engine), Some(payout)) = (components.payout.clone(), config.payout.as_ref()) {
        let scheduler = PayoutScheduler::new(engine, payout.frequency);
        tasks.push(scheduler.start(shutdown_rx.clone()));
    }

    if let Some(bind_address) = config.bind_address {
        let app = server::create_app(components.state.clone());
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server::run_server(app, bind_address, shutdown).await {
                error!("❌ API server failed: {}", e);
            }
        }));
    } else {
        info!("No bind_address configured, read API disabled");
    }

    shutdown_signal().await;
    info!("Shutdown requested, finishing in-flight work");
    shutdown_tx.send(true).ok();

    for task in tasks {
        if let Err(e) = task.await {
            error!("Task ended abnormally: {}", e);
        }
    }

    info!("👋 Pool manager stopped");
    Ok(())
}
