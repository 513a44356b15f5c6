//! Swap manager: owns every active session and routes everything
//!
//! Single routing point of the node. Monitor events, inbound protocol
//! messages and timer ticks all funnel through `dispatch`, which locks the
//! owning session so exactly one transition is in flight per swap, then
//! executes the actions the state machine emitted: sealing and sending
//! messages, building/signing/broadcasting transactions with bounded
//! retries, spawning leg monitors, persisting snapshots.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

use super::session::{
    leg_terms, SessionEvent, SessionLimits, SwapAction, SwapSession, SwapState,
};
use crate::chain::adapter::retry_rpc;
use crate::chain::{ChainManager, LegEvent};
use crate::config::SwapConfig;
use crate::contract::{ContractRef, LegSide};
use crate::error::{SwapError, SwapResult};
use crate::protocol::{
    Envelope, PeerTransport, Role, Screen, SequenceTracker, SwapId, SwapMessage, SwapParameters,
};
use crate::secret::SecretHash;
use crate::signer::{KeyHandle, Signer};
use crate::state::SwapStore;

fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Read-only view of a session for operator/UI consumption
#[derive(Clone, Debug, serde::Serialize)]
pub struct SwapStatus {
    pub swap_id: SwapId,
    pub role: Role,
    pub state: String,
    pub reason: Option<String>,
    pub params: SwapParameters,
    pub secret_hash: String,
    pub secret_revealed: bool,
    pub leg_a: Option<ContractRef>,
    pub leg_b: Option<ContractRef>,
    pub created_at: u64,
    pub updated_at: u64,
}

pub struct SwapManager {
    sessions: DashMap<SwapId, Arc<Mutex<SwapSession>>>,
    /// Pinned counterparty negotiation key per swap
    peers: DashMap<SwapId, String>,
    chain_manager: Arc<ChainManager>,
    transport: Arc<dyn PeerTransport>,
    signer: Arc<dyn Signer>,
    store: Option<Arc<dyn SwapStore>>,
    config: SwapConfig,
    limits: SessionLimits,
    out_seq: AtomicU64,
    tracker: Mutex<SequenceTracker>,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    inbound_rx: std::sync::Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    shutdown: watch::Sender<bool>,
}

impl SwapManager {
    pub fn new(
        config: SwapConfig,
        chain_manager: Arc<ChainManager>,
        transport: Arc<dyn PeerTransport>,
        signer: Arc<dyn Signer>,
        store: Option<Arc<dyn SwapStore>>,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let (shutdown, _) = watch::channel(false);
        let limits = SessionLimits::from_config(&config);
        Arc::new(Self {
            sessions: DashMap::new(),
            peers: DashMap::new(),
            chain_manager,
            transport,
            signer,
            store,
            limits,
            tracker: Mutex::new(SequenceTracker::new(config.max_clock_skew_secs)),
            config,
            out_seq: AtomicU64::new(1),
            inbound_tx,
            inbound_rx: std::sync::Mutex::new(Some(inbound_rx)),
            shutdown,
        })
    }

    /// Queue handle the transport glue pushes raw envelopes into
    pub fn inbound_sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.inbound_tx.clone()
    }

    /// Resume persisted sessions after a restart: rebuild the state
    /// machines and restart monitors for funded legs.
    pub async fn resume(&self) -> SwapResult<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let records = store.load_active().await?;
        let mut resumed = 0;
        for record in records {
            let session = SwapSession::restore(record, self.limits.clone());
            let swap_id = session.id;
            let hash = session.secret.hash;
            let peer = match session.role {
                Role::Initiator => session.params.participant_pubkey.clone(),
                Role::Participant => session.params.initiator_pubkey.clone(),
            };

            for leg in [LegSide::A, LegSide::B] {
                if let Some(contract) = session.leg(leg).contract.clone() {
                    if let Err(e) = self
                        .chain_manager
                        .spawn_monitor(swap_id, leg, contract, hash)
                    {
                        warn!(swap_id = %swap_id, leg = %leg, error = %e, "monitor restart failed");
                    }
                }
            }

            if !peer.is_empty() {
                self.peers.insert(swap_id, peer);
            }
            self.sessions
                .insert(swap_id, Arc::new(Mutex::new(session)));
            resumed += 1;
        }

        info!(resumed, "sessions resumed from store");
        Ok(resumed)
    }

    /// User entry point: propose a swap to a counterparty
    pub async fn initiate_swap(&self, mut params: SwapParameters) -> SwapResult<SwapId> {
        if params.participant_pubkey.is_empty() {
            return Err(SwapError::Negotiation(
                "counterparty negotiation key required".into(),
            ));
        }
        self.chain_manager.adapter(params.chain_a)?;
        self.chain_manager.adapter(params.chain_b)?;

        // fill initiator-side keys from the signer where not provided
        if params.initiator_pubkey.is_empty() {
            params.initiator_pubkey =
                hex::encode(self.signer.public_key(&KeyHandle::negotiation()).await?);
        }
        if params.initiator_redeem_key.is_empty() {
            params.initiator_redeem_key = hex::encode(
                self.signer
                    .public_key(&KeyHandle::for_chain(params.chain_b))
                    .await?,
            );
        }
        if params.initiator_refund_key.is_empty() {
            params.initiator_refund_key = hex::encode(
                self.signer
                    .public_key(&KeyHandle::for_chain(params.chain_a))
                    .await?,
            );
        }

        let now = unix_now();
        let session = SwapSession::new_initiator(params, self.limits.clone(), now)?;
        let swap_id = session.id;
        let proposal = session.proposal();
        let peer = session.params.participant_pubkey.clone();

        self.peers.insert(swap_id, peer.clone());
        self.sessions
            .insert(swap_id, Arc::new(Mutex::new(session)));
        crate::metrics::record_swap_created("initiator");

        self.send_message(swap_id, &peer, proposal).await?;
        self.persist(swap_id).await;
        info!(swap_id = %swap_id, "swap proposed");
        Ok(swap_id)
    }

    /// User entry point: abort before funding
    pub async fn cancel_swap(&self, swap_id: SwapId) -> SwapResult<()> {
        self.dispatch(swap_id, SessionEvent::Cancel).await
    }

    /// Main engine loop
    pub async fn run(self: Arc<Self>) -> SwapResult<()> {
        let mut leg_rx = self
            .chain_manager
            .take_event_rx()
            .ok_or_else(|| SwapError::Internal("chain event queue already taken".into()))?;
        let mut inbound_rx = self
            .inbound_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| SwapError::Internal("inbound queue already taken".into()))?;

        let mut tick = interval(Duration::from_millis(self.config.tick_interval_ms));
        let mut sweep = interval(Duration::from_secs(300));
        let mut shutdown_rx = self.shutdown.subscribe();

        info!("swap manager started");

        loop {
            tokio::select! {
                Some(event) = leg_rx.recv() => {
                    let LegEvent { swap_id, leg, kind, .. } = event;
                    if let Err(e) = self.dispatch(swap_id, SessionEvent::Leg(leg, kind)).await {
                        warn!(swap_id = %swap_id, error = %e, "leg event dispatch failed");
                    }
                }

                Some(payload) = inbound_rx.recv() => {
                    if let Err(e) = self.handle_inbound(&payload).await {
                        warn!(error = %e, "inbound message rejected");
                        crate::metrics::record_anomaly("inbound_rejected");
                    }
                }

                _ = tick.tick() => {
                    self.tick_sessions().await;
                }

                _ = sweep.tick() => {
                    self.sweep_terminal().await;
                }

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("swap manager stopped");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    // ---- inbound protocol --------------------------------------------------

    /// Verify, screen and route one inbound envelope
    pub async fn handle_inbound(&self, payload: &[u8]) -> SwapResult<()> {
        let envelope = Envelope::from_bytes(payload)?;
        envelope.verify()?;

        let now = unix_now();
        match self.tracker.lock().await.screen(&envelope, now)? {
            Screen::Fresh => {}
            Screen::Replay => {
                // idempotent: already processed, not an error
                debug!(swap_id = %envelope.swap_id, seq = envelope.seq, "replayed message dropped");
                return Ok(());
            }
        }

        debug!(
            swap_id = %envelope.swap_id,
            message = envelope.body.name(),
            "inbound message"
        );
        crate::metrics::record_message(envelope.body.name());

        // a message for a known swap must come from the pinned peer
        if let Some(pinned) = self.peers.get(&envelope.swap_id) {
            if *pinned != envelope.sender {
                return Err(SwapError::Negotiation(
                    "message from a key other than the swap counterparty".into(),
                ));
            }
        }

        match envelope.body.clone() {
            SwapMessage::ProposeSwap {
                params,
                secret_hash,
            } => self.on_propose(&envelope, params, secret_hash).await,
            SwapMessage::FundNotify {
                chain_id, txid, ..
            } => self.on_fund_notify(envelope.swap_id, chain_id, txid).await,
            SwapMessage::Ping { nonce } => {
                if self.sessions.contains_key(&envelope.swap_id) {
                    self.send_message(envelope.swap_id, &envelope.sender, SwapMessage::Pong { nonce })
                        .await?;
                }
                Ok(())
            }
            SwapMessage::Pong { .. } => Ok(()),
            body => self.dispatch(envelope.swap_id, SessionEvent::Message(body)).await,
        }
    }

    /// Incoming proposal: validate, build our side, accept or reject.
    /// Violations (reversed timeouts, unknown chains) are rejected before
    /// any funds move.
    async fn on_propose(
        &self,
        envelope: &Envelope,
        params: SwapParameters,
        secret_hash: SecretHash,
    ) -> SwapResult<()> {
        if self.sessions.contains_key(&envelope.swap_id) {
            // duplicate proposal; the original answer stands
            return Ok(());
        }

        if params.initiator_pubkey != envelope.sender {
            return Err(SwapError::Negotiation(
                "proposal key does not match message sender".into(),
            ));
        }

        let reject = |reason: String| SwapMessage::RejectSwap { reason };

        if self.chain_manager.adapter(params.chain_a).is_err()
            || self.chain_manager.adapter(params.chain_b).is_err()
        {
            self.send_raw(envelope.swap_id, &envelope.sender, reject("unsupported chain".into()))
                .await;
            return Ok(());
        }

        // fill in our keys; everything committed stays untouched
        let mut accepted = params;
        accepted.participant_pubkey =
            hex::encode(self.signer.public_key(&KeyHandle::negotiation()).await?);
        accepted.participant_redeem_key = hex::encode(
            self.signer
                .public_key(&KeyHandle::for_chain(accepted.chain_a))
                .await?,
        );
        accepted.participant_refund_key = hex::encode(
            self.signer
                .public_key(&KeyHandle::for_chain(accepted.chain_b))
                .await?,
        );

        let now = unix_now();
        let mut session = match SwapSession::new_participant(
            accepted,
            secret_hash,
            self.limits.clone(),
            now,
        ) {
            Ok(session) => session,
            Err(e) => {
                info!(swap_id = %envelope.swap_id, error = %e, "proposal rejected");
                self.send_raw(envelope.swap_id, &envelope.sender, reject(e.to_string()))
                    .await;
                return Ok(());
            }
        };
        // adopt the initiator's swap id so both sides route consistently
        session.id = envelope.swap_id;

        let actions = session.accept(now);
        let swap_id = session.id;
        let session = Arc::new(Mutex::new(session));

        self.peers.insert(swap_id, envelope.sender.clone());
        self.sessions.insert(swap_id, session.clone());
        crate::metrics::record_swap_created("participant");

        let mut guard = session.lock().await;
        self.execute(&mut guard, actions).await;
        drop(guard);

        self.persist(swap_id).await;
        info!(swap_id = %swap_id, "proposal accepted");
        Ok(())
    }

    /// Counterparty announced its funding; derive the expected contract
    /// ourselves (never trusting the claimed address) and hand it to the
    /// session. Redelivery for an already-recorded leg is a no-op.
    async fn on_fund_notify(&self, swap_id: SwapId, chain_id: u64, txid: String) -> SwapResult<()> {
        let session = self.session(swap_id)?;
        let (leg, contract) = {
            let session = session.lock().await;

            let leg = if chain_id == session.params.chain_a {
                LegSide::A
            } else if chain_id == session.params.chain_b {
                LegSide::B
            } else {
                return Err(SwapError::Negotiation("fund notify for unknown chain".into()));
            };
            if leg != session.remote_leg() {
                return Err(SwapError::Negotiation(
                    "counterparty announced funding for our leg".into(),
                ));
            }

            let builder = self.chain_manager.builder(chain_id)?;
            let terms = leg_terms(&session.params, leg, session.secret.hash);
            let (script, address) = builder.lock_script(&terms)?;
            let contract = ContractRef {
                chain_id,
                funding_txid: txid,
                lock_script: script,
                lock_address: address,
                amount: terms.amount,
                expiry: terms.expiry,
                confirmations: 0,
                confirmation_threshold: self.chain_manager.confirmation_threshold(chain_id)?,
            };
            (leg, contract)
        };

        self.dispatch(swap_id, SessionEvent::RemoteFundingReported { leg, contract })
            .await
    }

    // ---- dispatch & action execution --------------------------------------

    fn session(&self, swap_id: SwapId) -> SwapResult<Arc<Mutex<SwapSession>>> {
        self.sessions
            .get(&swap_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| SwapError::SwapNotFound(swap_id.to_string()))
    }

    /// Serialize one event into the owning session and execute the
    /// resulting actions while still holding the session lock.
    pub async fn dispatch(&self, swap_id: SwapId, event: SessionEvent) -> SwapResult<()> {
        let session = self.session(swap_id)?;
        let mut guard = session.lock().await;
        let actions = guard.on_event(event, unix_now());
        self.execute(&mut guard, actions).await;
        let terminal_state = if guard.state.is_terminal() {
            Some(guard.state.name())
        } else {
            None
        };
        drop(guard);

        self.persist(swap_id).await;
        if let Some(state) = terminal_state {
            crate::metrics::record_swap_terminal(state);
            if let Some(store) = &self.store {
                let detail = serde_json::json!({ "state": state });
                if let Err(e) = store.append_event(swap_id, state, detail).await {
                    warn!(swap_id = %swap_id, error = %e, "audit append failed");
                }
            }
        }
        Ok(())
    }

    /// Execute actions; follow-up events produced by the engine feed
    /// straight back into the locked session.
    async fn execute(&self, session: &mut SwapSession, actions: Vec<SwapAction>) {
        let mut queue = actions;
        while !queue.is_empty() {
            let mut follow_ups = Vec::new();
            for action in queue {
                follow_ups.extend(self.execute_one(session, action).await);
            }
            queue = follow_ups;
        }
    }

    async fn execute_one(&self, session: &mut SwapSession, action: SwapAction) -> Vec<SwapAction> {
        let swap_id = session.id;
        match action {
            SwapAction::Send(message) => {
                let peer = self.peer_for(session);
                if peer.is_empty() {
                    warn!(swap_id = %swap_id, "no peer to send to");
                    return Vec::new();
                }
                if let Err(e) = self.send_message(swap_id, &peer, message).await {
                    warn!(swap_id = %swap_id, error = %e, "message send failed");
                }
                Vec::new()
            }

            SwapAction::BroadcastFunding { leg } => self.broadcast_funding(session, leg).await,

            SwapAction::BroadcastRedeem { leg, preimage } => {
                self.broadcast_redeem(session, leg, preimage).await
            }

            SwapAction::BroadcastRefund { leg } => self.broadcast_refund(session, leg).await,

            SwapAction::StartMonitor { leg, contract } => {
                if let Err(e) =
                    self.chain_manager
                        .spawn_monitor(swap_id, leg, contract, session.secret.hash)
                {
                    error!(swap_id = %swap_id, leg = %leg, error = %e, "monitor spawn failed");
                }
                Vec::new()
            }

            SwapAction::Alert { reason } => {
                error!(swap_id = %swap_id, alert = %reason, "operator alert");
                crate::metrics::record_alert();
                Vec::new()
            }
        }
    }

    async fn broadcast_funding(&self, session: &mut SwapSession, leg: LegSide) -> Vec<SwapAction> {
        let swap_id = session.id;
        let chain_id = match leg {
            LegSide::A => session.params.chain_a,
            LegSide::B => session.params.chain_b,
        };

        let result: SwapResult<(ContractRef, String)> = async {
            let builder = self.chain_manager.builder(chain_id)?;
            let adapter = self.chain_manager.adapter(chain_id)?;
            let terms = leg_terms(&session.params, leg, session.secret.hash);

            let unsigned = builder.funding_tx(chain_id, &terms)?;
            let signature = self
                .signer
                .sign(unsigned.digest, &KeyHandle::for_chain(chain_id))
                .await?;
            let payload = builder.finalize(&unsigned, &signature)?;

            let policy = self.chain_manager.retry_policy();
            let txid = retry_rpc("broadcast_funding", &policy, || {
                adapter.broadcast(payload.clone())
            })
            .await?;

            let (script, address) = builder.lock_script(&terms)?;
            let contract = ContractRef {
                chain_id,
                funding_txid: txid.clone(),
                lock_script: script,
                lock_address: address,
                amount: terms.amount,
                expiry: terms.expiry,
                confirmations: 0,
                confirmation_threshold: self.chain_manager.confirmation_threshold(chain_id)?,
            };
            Ok((contract, txid))
        }
        .await;

        match result {
            Ok((contract, txid)) => {
                info!(swap_id = %swap_id, leg = %leg, txid, "funding broadcast");
                crate::metrics::record_broadcast(chain_id, "funding");
                let lock_address = contract.lock_address.clone();
                let mut follow_ups = session.on_event(
                    SessionEvent::LocalFundingBroadcast { leg, contract },
                    unix_now(),
                );
                follow_ups.push(SwapAction::Send(SwapMessage::FundNotify {
                    chain_id,
                    txid,
                    lock_address,
                }));
                follow_ups
            }
            Err(e) => {
                error!(swap_id = %swap_id, leg = %leg, error = %e, "funding broadcast failed");
                crate::metrics::record_rpc_escalation(chain_id);
                Vec::new()
            }
        }
    }

    async fn broadcast_redeem(
        &self,
        session: &mut SwapSession,
        leg: LegSide,
        preimage: [u8; 32],
    ) -> Vec<SwapAction> {
        let swap_id = session.id;
        let Some(contract) = session.leg(leg).contract.clone() else {
            warn!(swap_id = %swap_id, leg = %leg, "redeem requested for unfunded leg");
            return Vec::new();
        };
        let chain_id = contract.chain_id;

        let result: SwapResult<String> = async {
            let builder = self.chain_manager.builder(chain_id)?;
            let adapter = self.chain_manager.adapter(chain_id)?;

            let unsigned = builder.redeem_tx(&contract, &preimage)?;
            let signature = self
                .signer
                .sign(unsigned.digest, &KeyHandle::for_chain(chain_id))
                .await?;
            let payload = builder.finalize(&unsigned, &signature)?;

            let policy = self.chain_manager.retry_policy();
            retry_rpc("broadcast_redeem", &policy, || {
                adapter.broadcast(payload.clone())
            })
            .await
        }
        .await;

        match result {
            Ok(txid) => {
                crate::metrics::record_broadcast(chain_id, "redeem");
                session.on_event(SessionEvent::RedeemBroadcast { leg, txid }, unix_now())
            }
            Err(e) => {
                error!(swap_id = %swap_id, leg = %leg, error = %e, "redeem broadcast failed");
                crate::metrics::record_rpc_escalation(chain_id);
                session.on_event(SessionEvent::RedeemBroadcastFailed { leg }, unix_now())
            }
        }
    }

    async fn broadcast_refund(&self, session: &mut SwapSession, leg: LegSide) -> Vec<SwapAction> {
        let swap_id = session.id;
        let Some(contract) = session.leg(leg).contract.clone() else {
            warn!(swap_id = %swap_id, leg = %leg, "refund requested for unfunded leg");
            return Vec::new();
        };
        let chain_id = contract.chain_id;

        let result: SwapResult<String> = async {
            let builder = self.chain_manager.builder(chain_id)?;
            let adapter = self.chain_manager.adapter(chain_id)?;

            let policy = self.chain_manager.retry_policy();
            let chain_time =
                retry_rpc("get_chain_time", &policy, || adapter.get_chain_time()).await?;

            let unsigned = builder.refund_tx(&contract, chain_time)?;
            let signature = self
                .signer
                .sign(unsigned.digest, &KeyHandle::for_chain(chain_id))
                .await?;
            let payload = builder.finalize(&unsigned, &signature)?;

            retry_rpc("broadcast_refund", &policy, || {
                adapter.broadcast(payload.clone())
            })
            .await
        }
        .await;

        match result {
            Ok(txid) => {
                crate::metrics::record_broadcast(chain_id, "refund");
                session.on_event(SessionEvent::RefundBroadcast { leg, txid }, unix_now())
            }
            Err(e) => {
                error!(swap_id = %swap_id, leg = %leg, error = %e, "refund broadcast failed");
                crate::metrics::record_rpc_escalation(chain_id);
                session.on_event(SessionEvent::RefundBroadcastFailed { leg }, unix_now())
            }
        }
    }

    // ---- timers & retention ------------------------------------------------

    /// Offer every live session a timer tick with fresh chain clocks
    async fn tick_sessions(&self) {
        let now = unix_now();

        let mut chain_times = std::collections::HashMap::new();
        for chain_id in self.chain_manager.connected_chains() {
            if let Ok(adapter) = self.chain_manager.adapter(chain_id) {
                if let Ok(time) = adapter.get_chain_time().await {
                    chain_times.insert(chain_id, time);
                }
            }
        }

        let ids: Vec<SwapId> = self.sessions.iter().map(|e| *e.key()).collect();
        for swap_id in ids {
            let Ok(session) = self.session(swap_id) else {
                continue;
            };
            let (skip, chain_a, chain_b) = {
                let guard = session.lock().await;
                (
                    guard.state.is_terminal(),
                    guard.params.chain_a,
                    guard.params.chain_b,
                )
            };
            if skip {
                continue;
            }

            let event = SessionEvent::Tick {
                now,
                chain_time_a: chain_times.get(&chain_a).copied(),
                chain_time_b: chain_times.get(&chain_b).copied(),
            };
            if let Err(e) = self.dispatch(swap_id, event).await {
                warn!(swap_id = %swap_id, error = %e, "tick dispatch failed");
            }
        }

        crate::metrics::record_active_swaps(self.sessions.len() as i64);
    }

    /// Retire terminal sessions once the retention window elapses
    async fn sweep_terminal(&self) {
        let now = unix_now();
        let retention = self.config.retention_secs;

        let sessions: Vec<_> = self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut retire = Vec::new();
        for session in sessions {
            let guard = session.lock().await;
            if let Some(terminal_at) = guard.terminal_at {
                if now.saturating_sub(terminal_at) >= retention {
                    retire.push(guard.id);
                }
            }
        }

        for swap_id in retire {
            self.sessions.remove(&swap_id);
            self.peers.remove(&swap_id);
            info!(swap_id = %swap_id, "terminal session retired");
        }
    }

    // ---- queries -----------------------------------------------------------

    pub async fn status(&self, swap_id: SwapId) -> Option<SwapStatus> {
        let session = self.session(swap_id).ok()?;
        let guard = session.lock().await;
        Some(self.status_of(&guard))
    }

    pub async fn list_swaps(&self) -> Vec<SwapStatus> {
        let mut result = Vec::new();
        let sessions: Vec<_> = self.sessions.iter().map(|e| e.value().clone()).collect();
        for session in sessions {
            let guard = session.lock().await;
            result.push(self.status_of(&guard));
        }
        result
    }

    fn status_of(&self, session: &SwapSession) -> SwapStatus {
        let reason = match &session.state {
            SwapState::Failed { reason } => Some(reason.clone()),
            _ => None,
        };
        SwapStatus {
            swap_id: session.id,
            role: session.role,
            state: session.state.name().to_string(),
            reason,
            params: session.params.clone(),
            secret_hash: session.secret.hash.to_hex(),
            secret_revealed: session.secret.is_revealed(),
            leg_a: session.leg_a.contract.clone(),
            leg_b: session.leg_b.contract.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }

    // ---- plumbing ----------------------------------------------------------

    fn peer_for(&self, session: &SwapSession) -> String {
        if let Some(peer) = self.peers.get(&session.id) {
            return peer.clone();
        }
        match session.role {
            Role::Initiator => session.params.participant_pubkey.clone(),
            Role::Participant => session.params.initiator_pubkey.clone(),
        }
    }

    async fn send_message(
        &self,
        swap_id: SwapId,
        peer: &str,
        message: SwapMessage,
    ) -> SwapResult<()> {
        let seq = self.out_seq.fetch_add(1, Ordering::SeqCst);
        let envelope =
            Envelope::seal(swap_id, seq, unix_now(), message, self.signer.as_ref()).await?;
        let bytes = envelope.to_bytes()?;
        self.transport.send(peer, bytes).await
    }

    /// Best-effort send where failure only warrants a log line
    async fn send_raw(&self, swap_id: SwapId, peer: &str, message: SwapMessage) {
        if let Err(e) = self.send_message(swap_id, peer, message).await {
            warn!(swap_id = %swap_id, error = %e, "send failed");
        }
    }

    async fn persist(&self, swap_id: SwapId) {
        let Some(store) = &self.store else {
            return;
        };
        let Ok(session) = self.session(swap_id) else {
            return;
        };
        let record = session.lock().await.snapshot();
        if let Err(e) = store.persist(&record).await {
            error!(swap_id = %swap_id, error = %e, "snapshot persist failed");
        }
    }
}
