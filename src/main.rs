//! Crossflow Router - crosschain liquidity routing node
//!
//! The router watches transaction-manager contracts across its configured
//! chains, matches both sides of each crosschain transfer through the
//! indexing layer, and drives every transfer to completion or cancellation
//! with its own liquidity.

use anyhow::{Context, Result};
use ethers::signers::{LocalWallet, Signer};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod adapters;
mod cache;
mod chain;
mod config;
mod contract;
mod error;
mod events;
mod metrics;
mod reconciler;
mod tracker;
mod types;

use adapters::{HttpMessaging, HttpRelayService, SubgraphClient};
use cache::AuctionCache;
use chain::ChainManager;
use config::Settings;
use contract::{ContractOperations, SubmissionPipeline};
use events::ContractEventBus;
use metrics::MetricsServer;
use reconciler::Reconciler;
use tracker::HandlingTracker;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting Crossflow Router v{}", env!("CARGO_PKG_VERSION"));

    let settings = Arc::new(Settings::load()?);
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    let wallet: LocalWallet = std::env::var("PRIVATE_KEY")
        .context("PRIVATE_KEY environment variable not set")?
        .parse()
        .context("PRIVATE_KEY is not a valid private key")?;
    let router_address = wallet.address();
    info!("Router signer address: {:?}", router_address);

    let event_bus = Arc::new(ContractEventBus::new());

    let chain_manager = Arc::new(ChainManager::new(
        &settings,
        wallet.clone(),
        event_bus.clone(),
    )?);
    info!("Chain connections initialized");

    let relay = Arc::new(HttpRelayService::new(
        settings.relay.endpoint.clone(),
        settings.relay.supported_chains.clone(),
    ));
    let messaging = Arc::new(HttpMessaging::new(settings.messaging.endpoint.clone()));
    let pipeline = SubmissionPipeline::new(relay, messaging, event_bus.clone());

    let operations = Arc::new(ContractOperations::new(
        &settings,
        chain_manager.clone(),
        pipeline,
        wallet,
    )?);

    let reader = Arc::new(SubgraphClient::new(&settings, router_address));
    let tracker = Arc::new(HandlingTracker::new());
    let cache = Arc::new(AuctionCache::new());

    let reconciler = Arc::new(Reconciler::new(
        reader,
        operations,
        chain_manager.clone(),
        tracker,
        cache,
        settings.clone(),
    ));
    info!("Reconciler initialized");

    // Metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Chain listeners feed the event bus
    let listener_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        async move {
            chain_manager.start_listeners().await;
        }
    });

    // Reconciliation loop
    let reconciler_handle = tokio::spawn({
        let reconciler = reconciler.clone();
        async move {
            reconciler.run().await;
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        let interval = settings.router.poll_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                let health = chain_manager.health_check().await;
                for (chain_id, healthy) in health {
                    if !healthy {
                        warn!("Chain {} health check failed", chain_id);
                    }
                }
            }
        }
    });

    info!("Crossflow Router is running");
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    chain_manager.stop().await;

    listener_handle.abort();
    reconciler_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Crossflow Router stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,crossflow_router=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
