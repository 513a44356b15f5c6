//! In-memory chain used by dev mode and the test suite
//!
//! A minimal ledger: broadcast puts a payload in the mempool, `mine_block`
//! includes everything pending and advances height and chain time. Reorgs
//! are simulated by rewinding the tip, which either returns transactions
//! to the mempool or drops them entirely.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use super::adapter::{ChainAdapter, TxView};
use crate::contract::payload_address;
use crate::error::{SwapError, SwapResult};

struct SimTx {
    payload: Vec<u8>,
    included_at: Option<u64>,
}

struct SimInner {
    height: u64,
    chain_time: u64,
    block_interval_secs: u64,
    mempool: Vec<String>,
    txs: HashMap<String, SimTx>,
    blocks: Vec<Vec<String>>,
    by_address: HashMap<String, Vec<String>>,
}

pub struct SimChain {
    chain_id: u64,
    inner: Mutex<SimInner>,
}

impl SimChain {
    pub fn new(chain_id: u64, genesis_time: u64, block_interval_secs: u64) -> Arc<Self> {
        Arc::new(Self {
            chain_id,
            inner: Mutex::new(SimInner {
                height: 0,
                chain_time: genesis_time,
                block_interval_secs,
                mempool: Vec::new(),
                txs: HashMap::new(),
                blocks: Vec::new(),
                by_address: HashMap::new(),
            }),
        })
    }

    /// Include all mempool transactions in a new block
    pub fn mine_block(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.height += 1;
        inner.chain_time += inner.block_interval_secs;
        let height = inner.height;

        let included: Vec<String> = inner.mempool.drain(..).collect();
        for txid in &included {
            if let Some(tx) = inner.txs.get_mut(txid) {
                tx.included_at = Some(height);
            }
        }
        inner.blocks.push(included);
        height
    }

    /// Mine empty blocks until the chain clock passes `target_time`
    pub fn mine_until_time(&self, target_time: u64) {
        loop {
            let done = {
                let inner = self.inner.lock().unwrap();
                inner.chain_time >= target_time
            };
            if done {
                break;
            }
            self.mine_block();
        }
    }

    /// Rewind `depth` blocks. Transactions in rewound blocks return to the
    /// mempool, or disappear when `drop_txs` is set (a competing branch
    /// that never included them).
    pub fn reorg(&self, depth: u64, drop_txs: bool) {
        let mut inner = self.inner.lock().unwrap();
        for _ in 0..depth {
            let Some(txids) = inner.blocks.pop() else {
                break;
            };
            inner.height = inner.height.saturating_sub(1);
            for txid in txids {
                if drop_txs {
                    if let Some(tx) = inner.txs.remove(&txid) {
                        if let Some(address) = payload_address(&tx.payload) {
                            if let Some(list) = inner.by_address.get_mut(&address) {
                                list.retain(|t| t != &txid);
                            }
                        }
                    }
                } else {
                    if let Some(tx) = inner.txs.get_mut(&txid) {
                        tx.included_at = None;
                    }
                    inner.mempool.push(txid);
                }
            }
        }
    }

    pub fn height(&self) -> u64 {
        self.inner.lock().unwrap().height
    }

    pub fn chain_time(&self) -> u64 {
        self.inner.lock().unwrap().chain_time
    }

    /// Background miner for dev mode
    pub fn spawn_auto_miner(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let chain = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                chain.mine_block();
            }
        })
    }

    fn txid_for(payload: &[u8]) -> String {
        hex::encode(Sha256::digest(payload))
    }
}

#[async_trait]
impl ChainAdapter for SimChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn broadcast(&self, payload: Vec<u8>) -> SwapResult<String> {
        let txid = Self::txid_for(&payload);
        let address = payload_address(&payload).ok_or_else(|| SwapError::ChainRpc {
            chain_id: self.chain_id,
            message: "unparseable transaction payload".into(),
        })?;

        let mut inner = self.inner.lock().unwrap();
        if inner.txs.contains_key(&txid) {
            // re-broadcast of a known transaction is a no-op
            return Ok(txid);
        }
        inner.txs.insert(
            txid.clone(),
            SimTx {
                payload,
                included_at: None,
            },
        );
        inner.mempool.push(txid.clone());
        inner
            .by_address
            .entry(address)
            .or_default()
            .push(txid.clone());
        Ok(txid)
    }

    async fn get_transaction(&self, txid: &str) -> SwapResult<Option<TxView>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.txs.get(txid).map(|tx| TxView {
            txid: txid.to_string(),
            payload: tx.payload.clone(),
            included_at: tx.included_at,
        }))
    }

    async fn get_block_height(&self) -> SwapResult<u64> {
        Ok(self.inner.lock().unwrap().height)
    }

    async fn get_chain_time(&self) -> SwapResult<u64> {
        Ok(self.inner.lock().unwrap().chain_time)
    }

    async fn find_spender(&self, lock_address: &str) -> SwapResult<Option<TxView>> {
        let inner = self.inner.lock().unwrap();
        let Some(txids) = inner.by_address.get(lock_address) else {
            return Ok(None);
        };
        // newest included transaction on the address; the caller
        // classifies it (a funding payload classifies as unrelated)
        let latest = txids
            .iter()
            .rev()
            .filter_map(|txid| inner.txs.get(txid).map(|tx| (txid, tx)))
            .find(|(_, tx)| tx.included_at.is_some());
        Ok(latest.map(|(txid, tx)| TxView {
            txid: txid.clone(),
            payload: tx.payload.clone(),
            included_at: tx.included_at,
        }))
    }

    async fn subscribe(&self, _lock_address: &str) -> Option<mpsc::Receiver<TxView>> {
        None
    }
}
