//! asnd - atomic swap network node
//!
//! Boots the swap engine: configuration, signer, persistence, chain
//! adapters and monitors, the swap manager, and the status API.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use asnd::chain::{sim::SimChain, ChainManager};
use asnd::config::Settings;
use asnd::error::SwapResult;
use asnd::metrics::MetricsServer;
use asnd::protocol::PeerTransport;
use asnd::signer::{KeyHandle, LocalSigner, Signer};
use asnd::state::{StateManager, SwapStore};
use asnd::swap::SwapManager;

/// Placeholder transport used until a p2p daemon is wired in; outbound
/// envelopes are logged and dropped.
struct NullTransport;

#[async_trait]
impl PeerTransport for NullTransport {
    async fn send(&self, peer: &str, payload: Vec<u8>) -> SwapResult<()> {
        warn!(peer, bytes = payload.len(), "no transport configured; message dropped");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting asnd v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    // Signer: negotiation key from the environment, per-chain keys
    // generated on the fly in dev mode
    let mut signer = LocalSigner::new();
    match settings.node.negotiation_key_env.as_deref() {
        Some(env_var) => {
            signer = signer.load_env(KeyHandle::negotiation(), env_var)?;
        }
        None => {
            warn!("no negotiation key configured; generating an ephemeral one");
            signer.generate(KeyHandle::negotiation());
        }
    }
    for (_, chain) in settings.enabled_chains() {
        signer.generate(KeyHandle::for_chain(chain.chain_id));
    }
    let signer: Arc<dyn Signer> = Arc::new(signer);

    // Persistence
    let state_manager = Arc::new(StateManager::new(&settings.database).await?);
    state_manager.run_migrations().await?;
    info!("Database connection established");
    let store: Arc<dyn SwapStore> = state_manager.clone();

    // Chains
    let chain_manager = Arc::new(ChainManager::new(&settings.swap));
    let genesis_time = chrono::Utc::now().timestamp().max(0) as u64;
    for (name, chain) in settings.enabled_chains() {
        match chain.adapter.as_str() {
            "sim" => {
                let sim = SimChain::new(chain.chain_id, genesis_time, 600);
                sim.spawn_auto_miner(std::time::Duration::from_millis(
                    chain.poll_interval_ms.max(100),
                ));
                chain_manager.register(chain.clone(), sim);
            }
            other => {
                // real RPC adapters are registered by the embedding
                // application through ChainManager::register
                anyhow::bail!("chain {}: unknown adapter backend '{}'", name, other);
            }
        }
    }
    info!("Chain connections initialized");

    // Engine
    let transport: Arc<dyn PeerTransport> = Arc::new(NullTransport);
    let manager = SwapManager::new(
        settings.swap.clone(),
        chain_manager.clone(),
        transport,
        signer,
        Some(store.clone()),
    );
    let resumed = manager.resume().await?;
    if resumed > 0 {
        info!(resumed, "resumed swaps from storage");
    }

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

    // API server
    let api_handle = tokio::spawn({
        let api_config = settings.api.clone();
        let manager = manager.clone();
        let chain_manager = chain_manager.clone();
        let store = store.clone();
        async move {
            if let Err(e) =
                asnd::api::run_server(api_config, manager, chain_manager, Some(store)).await
            {
                error!("API server error: {}", e);
            }
        }
    });

    // Engine loop
    let engine_handle = tokio::spawn({
        let manager = manager.clone();
        async move {
            if let Err(e) = manager.run().await {
                error!("Swap manager error: {}", e);
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        let store = store.clone();
        let interval = settings.node.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                let health = chain_manager.health_check().await;
                for (chain_id, healthy) in health {
                    if !healthy {
                        warn!("Chain {} health check failed", chain_id);
                    }
                }

                if let Err(e) = store.health_check().await {
                    warn!("Storage health check failed: {}", e);
                }

                asnd::metrics::record_health_check();
            }
        }
    });

    info!("asnd is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    manager.stop();
    chain_manager.stop();

    api_handle.abort();
    engine_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("asnd stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,asnd=debug,sqlx=warn,hyper=warn"));

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
