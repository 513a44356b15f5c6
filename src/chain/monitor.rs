//! Per-leg chain monitor
//!
//! One monitor task runs for every funded leg, across all sessions in
//! parallel. It polls the leg's chain adapter (an optional adapter
//! subscription only serves as a wake-up hint), validates the observed
//! funding against the negotiated terms, tracks confirmations against the
//! chain threshold, classifies spends of the lock script, and detects
//! reorganizations that unwind a previously included transaction. Every
//! observation is pushed into the engine's dispatch queue; the monitor
//! never mutates session state itself.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::adapter::{retry_rpc, ChainAdapter, RetryPolicy, TxView};
use crate::contract::{ContractBuilder, ContractRef, LegSide, SpendKind};
use crate::protocol::SwapId;
use crate::secret::{verify_preimage, SecretHash, SECRET_SIZE};

/// Observation on one leg, routed to the owning session
#[derive(Clone, Debug)]
pub struct LegEvent {
    pub swap_id: SwapId,
    pub leg: LegSide,
    pub chain_id: u64,
    pub kind: LegEventKind,
}

#[derive(Clone, Debug)]
pub enum LegEventKind {
    /// Funding transaction first seen in a block (terms already verified)
    FundingSeen { included_at: u64 },
    /// Confirmation count progressed (not yet at threshold)
    ConfirmationProgress { confirmations: u64 },
    /// Confirmation threshold crossed
    FundingConfirmed { confirmations: u64 },
    /// Observed funding does not match the negotiated leg
    FundingMismatch { reason: String },
    /// A redeem spend revealed a valid preimage
    RedeemSeen {
        txid: String,
        preimage: [u8; SECRET_SIZE],
    },
    /// A refund spend was observed
    RefundSeen { txid: String },
    /// A previously included funding transaction was unwound
    Reorged,
}

pub struct LegMonitor {
    swap_id: SwapId,
    leg: LegSide,
    contract: ContractRef,
    secret_hash: SecretHash,
    adapter: Arc<dyn ChainAdapter>,
    builder: Arc<dyn ContractBuilder>,
    event_tx: mpsc::Sender<LegEvent>,
    poll_interval: Duration,
    retry: RetryPolicy,
    shutdown: watch::Receiver<bool>,

    // local view of the leg
    included_at: Option<u64>,
    funding_checked: bool,
    confirmed_reported: bool,
    last_confirmations: u64,
    reported_spend: Option<String>,
}

impl LegMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        swap_id: SwapId,
        leg: LegSide,
        contract: ContractRef,
        secret_hash: SecretHash,
        adapter: Arc<dyn ChainAdapter>,
        builder: Arc<dyn ContractBuilder>,
        event_tx: mpsc::Sender<LegEvent>,
        poll_interval: Duration,
        retry: RetryPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            swap_id,
            leg,
            contract,
            secret_hash,
            adapter,
            builder,
            event_tx,
            poll_interval,
            retry,
            shutdown,
            included_at: None,
            funding_checked: false,
            confirmed_reported: false,
            last_confirmations: 0,
            reported_spend: None,
        }
    }

    /// Main watch loop; exits once the leg is terminally spent or the
    /// engine shuts down.
    pub async fn run(mut self) {
        let mut hint_rx = self.adapter.subscribe(&self.contract.lock_address).await;
        let mut poll = tokio::time::interval(self.poll_interval);

        info!(
            swap_id = %self.swap_id,
            leg = %self.leg,
            chain_id = self.contract.chain_id,
            address = %self.contract.lock_address,
            "leg monitor started"
        );

        loop {
            tokio::select! {
                _ = poll.tick() => {}
                Some(_) = recv_hint(&mut hint_rx) => {
                    debug!(swap_id = %self.swap_id, leg = %self.leg, "woken by adapter hint");
                }
                _ = self.shutdown.changed() => {}
            }
            if *self.shutdown.borrow() {
                break;
            }

            match self.scan().await {
                Ok(done) => {
                    if done {
                        break;
                    }
                }
                Err(e) => {
                    // transient budget exhausted; stay in place and alert
                    warn!(
                        swap_id = %self.swap_id,
                        leg = %self.leg,
                        error = %e,
                        "leg scan failed after retries"
                    );
                    crate::metrics::record_rpc_escalation(self.contract.chain_id);
                }
            }
        }

        info!(swap_id = %self.swap_id, leg = %self.leg, "leg monitor stopped");
    }

    /// One scan pass. Returns true when the leg is terminally observed.
    async fn scan(&mut self) -> crate::error::SwapResult<bool> {
        let chain_id = self.contract.chain_id;
        let adapter = self.adapter.clone();

        let height = retry_rpc("get_block_height", &self.retry, || {
            adapter.get_block_height()
        })
        .await?;

        let funding_txid = self.contract.funding_txid.clone();
        let funding = retry_rpc("get_transaction", &self.retry, || {
            adapter.get_transaction(&funding_txid)
        })
        .await?;

        match funding.as_ref().and_then(|tx| tx.included_at) {
            Some(block) => {
                if !self.funding_checked {
                    let payload = &funding.as_ref().unwrap().payload;
                    if let Err(e) = self.builder.check_funding(&self.contract, payload) {
                        self.emit(LegEventKind::FundingMismatch {
                            reason: e.to_string(),
                        })
                        .await;
                        return Ok(true);
                    }
                    self.funding_checked = true;
                }

                if self.included_at != Some(block) {
                    self.included_at = Some(block);
                    self.emit(LegEventKind::FundingSeen { included_at: block }).await;
                }

                let confirmations = height.saturating_sub(block) + 1;
                if confirmations >= self.contract.confirmation_threshold {
                    if !self.confirmed_reported {
                        self.confirmed_reported = true;
                        self.emit(LegEventKind::FundingConfirmed { confirmations }).await;
                    }
                } else if confirmations != self.last_confirmations {
                    self.emit(LegEventKind::ConfirmationProgress { confirmations })
                        .await;
                }
                self.last_confirmations = confirmations;
            }
            None => {
                if self.included_at.is_some() {
                    // previously included, now gone: reorg. Reset the
                    // local view and re-await inclusion; the secret and
                    // hash are untouched.
                    warn!(
                        swap_id = %self.swap_id,
                        leg = %self.leg,
                        chain_id,
                        "funding transaction unwound by reorg"
                    );
                    self.included_at = None;
                    self.confirmed_reported = false;
                    self.last_confirmations = 0;
                    self.emit(LegEventKind::Reorged).await;
                    crate::metrics::record_reorg(chain_id);
                }
                return Ok(false);
            }
        }

        // Look for spends of the lock once the funding is on-chain
        let lock_address = self.contract.lock_address.clone();
        let spender = retry_rpc("find_spender", &self.retry, || {
            adapter.find_spender(&lock_address)
        })
        .await?;

        if let Some(tx) = spender {
            if tx.txid != self.contract.funding_txid && self.reported_spend.as_ref() != Some(&tx.txid)
            {
                if let Some(done) = self.classify(&tx).await {
                    return Ok(done);
                }
            }
        }

        Ok(false)
    }

    /// Classify a spend; returns Some(true) when terminally observed
    async fn classify(&mut self, tx: &TxView) -> Option<bool> {
        match self
            .builder
            .classify_spend(&self.contract.lock_address, &tx.payload)
        {
            SpendKind::Redeem { preimage } => {
                // a malformed or mismatched extraction is an anomaly, not
                // a redeem
                if !verify_preimage(&preimage, &self.secret_hash) {
                    warn!(
                        swap_id = %self.swap_id,
                        leg = %self.leg,
                        txid = %tx.txid,
                        "spend revealed a preimage that does not match the swap hash"
                    );
                    crate::metrics::record_anomaly("secret_mismatch");
                    return None;
                }
                self.reported_spend = Some(tx.txid.clone());
                self.emit(LegEventKind::RedeemSeen {
                    txid: tx.txid.clone(),
                    preimage,
                })
                .await;
                Some(true)
            }
            SpendKind::Refund => {
                self.reported_spend = Some(tx.txid.clone());
                self.emit(LegEventKind::RefundSeen {
                    txid: tx.txid.clone(),
                })
                .await;
                Some(true)
            }
            SpendKind::Unrelated => None,
        }
    }

    async fn emit(&self, kind: LegEventKind) {
        let event = LegEvent {
            swap_id: self.swap_id,
            leg: self.leg,
            chain_id: self.contract.chain_id,
            kind,
        };
        debug!(swap_id = %self.swap_id, leg = %self.leg, event = ?event.kind, "leg event");
        if self.event_tx.send(event).await.is_err() {
            warn!(swap_id = %self.swap_id, "engine event queue closed");
        }
    }
}

async fn recv_hint(rx: &mut Option<mpsc::Receiver<TxView>>) -> Option<TxView> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
