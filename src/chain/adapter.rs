//! Chain adapter collaborator and RPC retry policy
//!
//! The node talks to every ledger through this trait; concrete RPC
//! clients live outside the engine. Calls may block or fail transiently,
//! so everything crossing this boundary goes through the bounded
//! jittered-backoff helper below before a failure is escalated.

use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::SwapConfig;
use crate::error::{SwapError, SwapResult};

/// A transaction as seen by an adapter
#[derive(Clone, Debug)]
pub struct TxView {
    pub txid: String,
    pub payload: Vec<u8>,
    /// Height of the including block, None while in the mempool
    pub included_at: Option<u64>,
}

/// Chain adapter collaborator (per chain)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Submit a signed payload, returning its transaction id
    async fn broadcast(&self, payload: Vec<u8>) -> SwapResult<String>;

    async fn get_transaction(&self, txid: &str) -> SwapResult<Option<TxView>>;

    async fn get_block_height(&self) -> SwapResult<u64>;

    /// Timestamp of the chain tip, unix seconds
    async fn get_chain_time(&self) -> SwapResult<u64>;

    /// Most recent transaction spending the given lock address
    async fn find_spender(&self, lock_address: &str) -> SwapResult<Option<TxView>>;

    /// Optional push stream of transactions touching an address. Monitors
    /// poll when the adapter returns None.
    async fn subscribe(&self, lock_address: &str) -> Option<mpsc::Receiver<TxView>>;
}

/// Bounded exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SwapConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0..=self.base_delay.as_millis() as u64);
        exp + Duration::from_millis(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Run a fallible RPC action with bounded retries. Non-retryable errors
/// and exhausted budgets are returned to the caller for escalation; the
/// session stays in its current state either way.
pub async fn retry_rpc<T, F, Fut>(
    label: &'static str,
    policy: &RetryPolicy,
    mut action: F,
) -> SwapResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SwapResult<T>>,
{
    let attempts = policy.max_retries.saturating_add(1);
    let mut last_err = None;

    for attempt in 0..attempts {
        match action().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                warn!(attempt = attempt + 1, error = %err, "retrying {label}");
                tokio::time::sleep(policy.delay_for(attempt)).await;
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_err.unwrap_or(SwapError::Timeout {
        operation: label.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_rpc("test", &fast_policy(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(SwapError::ChainRpc {
                        chain_id: 1,
                        message: "flaky".into(),
                    })
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: SwapResult<()> = retry_rpc("test", &fast_policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(SwapError::ChainRpc {
                    chain_id: 1,
                    message: "down".into(),
                })
            }
        })
        .await;

        assert!(result.is_err());
        // initial attempt + max_retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let result: SwapResult<()> = retry_rpc("test", &fast_policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SwapError::SecretMismatch) }
        })
        .await;

        assert!(matches!(result, Err(SwapError::SecretMismatch)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
