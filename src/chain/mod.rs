//! Chain module - adapters, per-leg monitors and the shared event queue
//!
//! This module provides:
//! - The `ChainAdapter` collaborator trait and retry policy
//! - Per-leg monitor tasks feeding the engine's dispatch queue
//! - An in-memory simulated chain for dev mode and tests

pub mod adapter;
pub mod monitor;
pub mod sim;

pub use adapter::{ChainAdapter, RetryPolicy, TxView};
pub use monitor::{LegEvent, LegEventKind};

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::config::{ChainConfig, SwapConfig};
use crate::contract::{builder_for, ContractBuilder, ContractRef, LegSide};
use crate::error::{SwapError, SwapResult};
use crate::protocol::SwapId;
use crate::secret::SecretHash;

struct ChainHandle {
    config: ChainConfig,
    adapter: Arc<dyn ChainAdapter>,
    builder: Arc<dyn ContractBuilder>,
}

/// Owns the connection to every configured chain and the monitor tasks
/// watching funded legs across all sessions.
pub struct ChainManager {
    chains: DashMap<u64, ChainHandle>,
    event_tx: mpsc::Sender<LegEvent>,
    event_rx: std::sync::Mutex<Option<mpsc::Receiver<LegEvent>>>,
    retry: RetryPolicy,
    shutdown_tx: watch::Sender<bool>,
}

impl ChainManager {
    pub fn new(swap_config: &SwapConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            chains: DashMap::new(),
            event_tx,
            event_rx: std::sync::Mutex::new(Some(event_rx)),
            retry: RetryPolicy::from_config(swap_config),
            shutdown_tx,
        }
    }

    /// Register an adapter for a configured chain. Adapter construction
    /// is the embedding application's job; the engine only sees the trait.
    pub fn register(&self, config: ChainConfig, adapter: Arc<dyn ChainAdapter>) {
        let chain_id = config.chain_id;
        let builder = builder_for(config.family);
        info!(chain_id, name = %config.name, "chain registered");
        self.chains.insert(
            chain_id,
            ChainHandle {
                config,
                adapter,
                builder,
            },
        );
    }

    /// Take the engine-side receiver of the shared event queue. Valid once.
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<LegEvent>> {
        self.event_rx.lock().unwrap().take()
    }

    pub fn adapter(&self, chain_id: u64) -> SwapResult<Arc<dyn ChainAdapter>> {
        self.chains
            .get(&chain_id)
            .map(|h| h.adapter.clone())
            .ok_or(SwapError::ChainNotFound { chain_id })
    }

    pub fn builder(&self, chain_id: u64) -> SwapResult<Arc<dyn ContractBuilder>> {
        self.chains
            .get(&chain_id)
            .map(|h| h.builder.clone())
            .ok_or(SwapError::ChainNotFound { chain_id })
    }

    pub fn confirmation_threshold(&self, chain_id: u64) -> SwapResult<u64> {
        self.chains
            .get(&chain_id)
            .map(|h| h.config.confirmation_blocks)
            .ok_or(SwapError::ChainNotFound { chain_id })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone()
    }

    /// Spawn a monitor for a funded leg
    pub fn spawn_monitor(
        &self,
        swap_id: SwapId,
        leg: LegSide,
        contract: ContractRef,
        secret_hash: SecretHash,
    ) -> SwapResult<()> {
        let handle = self
            .chains
            .get(&contract.chain_id)
            .ok_or(SwapError::ChainNotFound {
                chain_id: contract.chain_id,
            })?;

        let monitor = monitor::LegMonitor::new(
            swap_id,
            leg,
            contract,
            secret_hash,
            handle.adapter.clone(),
            handle.builder.clone(),
            self.event_tx.clone(),
            Duration::from_millis(handle.config.poll_interval_ms),
            self.retry.clone(),
            self.shutdown_tx.subscribe(),
        );
        drop(handle);

        tokio::spawn(monitor.run());
        Ok(())
    }

    /// Health check for all chains, probed concurrently
    pub async fn health_check(&self) -> Vec<(u64, bool)> {
        let adapters: Vec<(u64, Arc<dyn ChainAdapter>)> = self
            .chains
            .iter()
            .map(|e| (*e.key(), e.value().adapter.clone()))
            .collect();

        let probes = adapters.into_iter().map(|(chain_id, adapter)| async move {
            (chain_id, adapter.get_block_height().await.is_ok())
        });
        let results = futures::future::join_all(probes).await;

        for (chain_id, healthy) in &results {
            if !healthy {
                warn!(chain_id, "chain health check failed");
            }
            crate::metrics::record_chain_health(*chain_id, *healthy);
        }

        results
    }

    /// Get all connected chain IDs
    pub fn connected_chains(&self) -> Vec<u64> {
        self.chains.iter().map(|e| *e.key()).collect()
    }

    /// Stop all monitor tasks
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        info!("chain manager stopped");
    }
}
