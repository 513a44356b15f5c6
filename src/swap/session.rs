//! Per-swap state machine
//!
//! A session consumes verified protocol messages, leg monitor events and
//! timer ticks, and emits the actions the engine must perform (send a
//! message, broadcast a funding/redeem/refund, start a monitor, raise an
//! alert). Transitions are pure: no I/O happens here, and the manager
//! serializes dispatch so exactly one transition is in flight per session.
//!
//! Guard conditions run on every incoming event; an event with no valid
//! transition from the current state is discarded and logged as a
//! protocol anomaly, never a crash.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::chain::LegEventKind;
use crate::config::SwapConfig;
use crate::contract::{ContractRef, HtlcTerms, LegSide};
use crate::protocol::{Role, SwapId, SwapMessage, SwapParameters};
use crate::secret::{Secret, SecretHash, SECRET_SIZE};

/// State of a swap session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapState {
    Proposed,
    Negotiated,
    Funding,
    PartiallyFunded,
    BothFunded,
    SecretRevealed,
    Redeeming,
    Completed,
    Expired,
    Refunding,
    Refunded,
    Failed { reason: String },
}

impl SwapState {
    pub fn name(&self) -> &'static str {
        match self {
            SwapState::Proposed => "proposed",
            SwapState::Negotiated => "negotiated",
            SwapState::Funding => "funding",
            SwapState::PartiallyFunded => "partially_funded",
            SwapState::BothFunded => "both_funded",
            SwapState::SecretRevealed => "secret_revealed",
            SwapState::Redeeming => "redeeming",
            SwapState::Completed => "completed",
            SwapState::Expired => "expired",
            SwapState::Refunding => "refunding",
            SwapState::Refunded => "refunded",
            SwapState::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwapState::Completed
                | SwapState::Expired
                | SwapState::Refunded
                | SwapState::Failed { .. }
        )
    }
}

/// Bookkeeping for one leg
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Leg {
    pub contract: Option<ContractRef>,
    pub funding_seen: bool,
    pub confirmed: bool,
    pub funding_issued: bool,
    pub redeem_issued: bool,
    pub refund_issued: bool,
    pub refund_attempts: u32,
    pub redeemed: bool,
    pub refunded: bool,
    pub redeem_txid: Option<String>,
    pub refund_txid: Option<String>,
}

/// Inputs to the state machine
#[derive(Debug)]
pub enum SessionEvent {
    /// A verified, replay-screened protocol message
    Message(SwapMessage),
    /// An observation from a leg monitor
    Leg(LegSide, LegEventKind),
    /// Timer tick with wall clock and best-effort per-leg chain time
    Tick {
        now: u64,
        chain_time_a: Option<u64>,
        chain_time_b: Option<u64>,
    },
    /// User-initiated abort; only legal before funding
    Cancel,
    /// Engine feedback: our own funding was broadcast
    LocalFundingBroadcast { leg: LegSide, contract: ContractRef },
    /// Engine feedback: counterparty funding reported via FundNotify
    RemoteFundingReported { leg: LegSide, contract: ContractRef },
    /// Engine feedback: our redeem was broadcast
    RedeemBroadcast { leg: LegSide, txid: String },
    /// Engine feedback: redeem broadcast exhausted its retry budget
    RedeemBroadcastFailed { leg: LegSide },
    /// Engine feedback: our refund was broadcast
    RefundBroadcast { leg: LegSide, txid: String },
    /// Engine feedback: refund broadcast exhausted its retry budget
    RefundBroadcastFailed { leg: LegSide },
}

/// Outputs of the state machine, executed by the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapAction {
    Send(SwapMessage),
    BroadcastFunding { leg: LegSide },
    BroadcastRedeem {
        leg: LegSide,
        preimage: [u8; SECRET_SIZE],
    },
    BroadcastRefund { leg: LegSide },
    StartMonitor { leg: LegSide, contract: ContractRef },
    Alert { reason: String },
}

/// Engine limits a session evaluates its guards against
#[derive(Clone, Debug)]
pub struct SessionLimits {
    pub min_timeout_gap_secs: u64,
    pub negotiation_timeout_secs: u64,
    pub refund_grace_secs: u64,
}

impl SessionLimits {
    pub fn from_config(config: &SwapConfig) -> Self {
        Self {
            min_timeout_gap_secs: config.min_timeout_gap_secs,
            negotiation_timeout_secs: config.negotiation_timeout_secs,
            refund_grace_secs: config.refund_grace_secs,
        }
    }
}

/// The HTLC terms a given leg commits to. Leg A is redeemable by the
/// participant and refundable by the initiator; leg B the other way.
pub fn leg_terms(params: &SwapParameters, leg: LegSide, hash: SecretHash) -> HtlcTerms {
    match leg {
        LegSide::A => HtlcTerms {
            secret_hash: hash,
            redeem_key: params.participant_redeem_key.clone(),
            refund_key: params.initiator_refund_key.clone(),
            expiry: params.timeout_a,
            amount: params.amount_a,
        },
        LegSide::B => HtlcTerms {
            secret_hash: hash,
            redeem_key: params.initiator_redeem_key.clone(),
            refund_key: params.participant_refund_key.clone(),
            expiry: params.timeout_b,
            amount: params.amount_b,
        },
    }
}

pub struct SwapSession {
    pub id: SwapId,
    pub role: Role,
    pub state: SwapState,
    pub params: SwapParameters,
    pub secret: Secret,
    pub leg_a: Leg,
    pub leg_b: Leg,
    pub created_at: u64,
    pub updated_at: u64,
    pub terminal_at: Option<u64>,
    limits: SessionLimits,
    negotiation_deadline: u64,
}

impl SwapSession {
    /// Create a session on the initiating side; mints the secret
    pub fn new_initiator(
        params: SwapParameters,
        limits: SessionLimits,
        now: u64,
    ) -> crate::error::SwapResult<Self> {
        params.validate(limits.min_timeout_gap_secs)?;
        let secret = Secret::generate();
        Ok(Self::new(Role::Initiator, params, secret, limits, now))
    }

    /// Create a session on the participating side from a validated proposal
    pub fn new_participant(
        params: SwapParameters,
        secret_hash: SecretHash,
        limits: SessionLimits,
        now: u64,
    ) -> crate::error::SwapResult<Self> {
        params.validate(limits.min_timeout_gap_secs)?;
        let secret = Secret::from_hash(secret_hash);
        Ok(Self::new(Role::Participant, params, secret, limits, now))
    }

    fn new(
        role: Role,
        params: SwapParameters,
        secret: Secret,
        limits: SessionLimits,
        now: u64,
    ) -> Self {
        Self {
            id: SwapId::generate(),
            role,
            state: SwapState::Proposed,
            params,
            secret,
            leg_a: Leg::default(),
            leg_b: Leg::default(),
            created_at: now,
            updated_at: now,
            terminal_at: None,
            negotiation_deadline: now + limits.negotiation_timeout_secs,
            limits,
        }
    }

    /// The proposal message announcing this swap (initiator only)
    pub fn proposal(&self) -> SwapMessage {
        SwapMessage::ProposeSwap {
            params: self.params.clone(),
            secret_hash: self.secret.hash,
        }
    }

    /// Accept the proposal this session was created from (participant).
    /// The acceptance echoes the committed parameters with our keys filled.
    pub fn accept(&mut self, now: u64) -> Vec<SwapAction> {
        if self.role != Role::Participant || self.state != SwapState::Proposed {
            self.anomaly("accept");
            return Vec::new();
        }
        self.transition(SwapState::Negotiated, now);
        vec![SwapAction::Send(SwapMessage::AcceptSwap {
            params: self.params.clone(),
            secret_hash: self.secret.hash,
        })]
    }

    /// Which leg this node funds
    pub fn local_leg(&self) -> LegSide {
        match self.role {
            Role::Initiator => LegSide::A,
            Role::Participant => LegSide::B,
        }
    }

    pub fn remote_leg(&self) -> LegSide {
        match self.local_leg() {
            LegSide::A => LegSide::B,
            LegSide::B => LegSide::A,
        }
    }

    pub fn leg(&self, side: LegSide) -> &Leg {
        match side {
            LegSide::A => &self.leg_a,
            LegSide::B => &self.leg_b,
        }
    }

    fn leg_mut(&mut self, side: LegSide) -> &mut Leg {
        match side {
            LegSide::A => &mut self.leg_a,
            LegSide::B => &mut self.leg_b,
        }
    }

    fn leg_timeout(&self, side: LegSide) -> u64 {
        match side {
            LegSide::A => self.params.timeout_a,
            LegSide::B => self.params.timeout_b,
        }
    }

    /// Dispatch one event. Returns the actions the engine must execute.
    pub fn on_event(&mut self, event: SessionEvent, now: u64) -> Vec<SwapAction> {
        if self.state.is_terminal() {
            // late events against retired sessions are dropped quietly
            return Vec::new();
        }

        match event {
            SessionEvent::Message(message) => self.on_message(message, now),
            SessionEvent::Leg(side, kind) => self.on_leg_event(side, kind, now),
            SessionEvent::Tick {
                now,
                chain_time_a,
                chain_time_b,
            } => self.on_tick(now, chain_time_a, chain_time_b),
            SessionEvent::Cancel => self.on_cancel(now),
            SessionEvent::LocalFundingBroadcast { leg, contract } => {
                self.record_funding(leg, contract, now)
            }
            SessionEvent::RemoteFundingReported { leg, contract } => {
                self.record_funding(leg, contract, now)
            }
            SessionEvent::RedeemBroadcast { leg, txid } => self.on_redeem_broadcast(leg, txid, now),
            SessionEvent::RedeemBroadcastFailed { leg } => {
                // the next tick reissues; the preimage is not at risk, only
                // liveness
                warn!(swap_id = %self.id, leg = %leg, "redeem broadcast failed; will retry");
                self.leg_mut(leg).redeem_issued = false;
                Vec::new()
            }
            SessionEvent::RefundBroadcast { leg, txid } => self.on_refund_broadcast(leg, txid, now),
            SessionEvent::RefundBroadcastFailed { leg } => self.on_refund_failed(leg, now),
        }
    }

    // ---- protocol messages -------------------------------------------------

    fn on_message(&mut self, message: SwapMessage, now: u64) -> Vec<SwapAction> {
        match message {
            SwapMessage::AcceptSwap {
                params,
                secret_hash,
            } => self.on_accept(params, secret_hash, now),
            SwapMessage::RejectSwap { reason } => {
                if matches!(self.state, SwapState::Proposed | SwapState::Negotiated) {
                    self.fail(format!("proposal rejected: {}", reason), now)
                } else {
                    self.anomaly("reject_swap");
                    Vec::new()
                }
            }
            // funding/redeem/refund notifications are hints; the leg
            // monitors are authoritative, so redelivery is a no-op here
            SwapMessage::RedeemNotify { txid, .. } => {
                info!(swap_id = %self.id, txid, "counterparty announced redeem");
                Vec::new()
            }
            SwapMessage::RefundNotify { txid, .. } => {
                info!(swap_id = %self.id, txid, "counterparty announced refund");
                Vec::new()
            }
            other => {
                warn!(
                    swap_id = %self.id,
                    message = other.name(),
                    state = self.state.name(),
                    "unexpected message for session"
                );
                Vec::new()
            }
        }
    }

    /// Initiator receives the participant's acceptance. Any attempt to
    /// alter the hash or the committed parameters is a negotiation error;
    /// nothing has been funded yet, so the swap simply fails.
    fn on_accept(
        &mut self,
        params: SwapParameters,
        secret_hash: SecretHash,
        now: u64,
    ) -> Vec<SwapAction> {
        if self.role != Role::Initiator || self.state != SwapState::Proposed {
            self.anomaly("accept_swap");
            return Vec::new();
        }

        if secret_hash != self.secret.hash {
            let mut actions = self.fail("acceptance altered the secret hash".into(), now);
            actions.push(SwapAction::Send(SwapMessage::RejectSwap {
                reason: "hash mismatch".into(),
            }));
            return actions;
        }

        if let Err(e) = SwapParameters::check_acceptance(&self.params, &params) {
            let mut actions = self.fail(e.to_string(), now);
            actions.push(SwapAction::Send(SwapMessage::RejectSwap {
                reason: "parameters altered".into(),
            }));
            return actions;
        }
        if let Err(e) = params.validate(self.limits.min_timeout_gap_secs) {
            let mut actions = self.fail(e.to_string(), now);
            actions.push(SwapAction::Send(SwapMessage::RejectSwap {
                reason: "invalid parameters".into(),
            }));
            return actions;
        }

        // adopt the participant-side keys the acceptance filled in
        self.params = params;
        self.transition(SwapState::Negotiated, now);

        // the initiator funds first
        let leg = self.local_leg();
        self.leg_mut(leg).funding_issued = true;
        vec![SwapAction::BroadcastFunding { leg }]
    }

    // ---- leg monitor events ------------------------------------------------

    fn on_leg_event(&mut self, side: LegSide, kind: LegEventKind, now: u64) -> Vec<SwapAction> {
        match kind {
            LegEventKind::FundingSeen { .. } => {
                self.leg_mut(side).funding_seen = true;
                if self.state == SwapState::Negotiated {
                    self.transition(SwapState::Funding, now);
                }
                Vec::new()
            }
            LegEventKind::ConfirmationProgress { confirmations } => {
                if let Some(contract) = self.leg_mut(side).contract.as_mut() {
                    contract.confirmations = confirmations;
                }
                Vec::new()
            }
            LegEventKind::FundingConfirmed { confirmations } => {
                self.on_funding_confirmed(side, confirmations, now)
            }
            LegEventKind::FundingMismatch { reason } => {
                // fatal: funds may be at risk, surface instead of retrying
                let mut actions = self.fail(format!("funding mismatch: {}", reason), now);
                actions.push(SwapAction::Alert {
                    reason: format!(
                        "swap {}: leg {} funding mismatch ({}); refund manually if funded",
                        self.id, side, reason
                    ),
                });
                actions
            }
            LegEventKind::RedeemSeen { txid, preimage } => self.on_redeem_seen(side, txid, preimage, now),
            LegEventKind::RefundSeen { txid } => self.on_refund_seen(side, txid, now),
            LegEventKind::Reorged => self.on_reorg(side, now),
        }
    }

    fn on_funding_confirmed(
        &mut self,
        side: LegSide,
        confirmations: u64,
        now: u64,
    ) -> Vec<SwapAction> {
        {
            let leg = self.leg_mut(side);
            leg.funding_seen = true;
            leg.confirmed = true;
            if let Some(contract) = leg.contract.as_mut() {
                contract.confirmations = confirmations;
            }
        }

        let mut actions = Vec::new();

        if self.leg_a.confirmed && self.leg_b.confirmed {
            self.transition(SwapState::BothFunded, now);
            // only once both legs are final does the initiator redeem the
            // participant leg, publishing the preimage
            if self.role == Role::Initiator && !self.leg_b.redeem_issued && !self.leg_b.refunded {
                if let Some(preimage) = self.secret.preimage {
                    self.leg_b.redeem_issued = true;
                    actions.push(SwapAction::BroadcastRedeem {
                        leg: LegSide::B,
                        preimage,
                    });
                }
            }
        } else if matches!(self.state, SwapState::Negotiated | SwapState::Funding) {
            self.transition(SwapState::PartiallyFunded, now);
        }

        // the participant funds its leg once the initiator leg is final
        if self.role == Role::Participant && side == LegSide::A {
            let local = self.local_leg();
            let leg = self.leg_mut(local);
            if !leg.funding_issued && leg.contract.is_none() {
                leg.funding_issued = true;
                actions.push(SwapAction::BroadcastFunding { leg: local });
            }
        }

        actions
    }

    fn on_redeem_seen(
        &mut self,
        side: LegSide,
        txid: String,
        preimage: [u8; SECRET_SIZE],
        now: u64,
    ) -> Vec<SwapAction> {
        if self.leg(side).refunded {
            // a leg can never be both redeemed and refunded
            warn!(
                swap_id = %self.id,
                leg = %side,
                "redeem observed on an already refunded leg"
            );
            crate::metrics::record_anomaly("redeem_after_refund");
            return Vec::new();
        }

        // the preimage was validated against the hash by the monitor, but
        // the invariant is cheap to re-check at the state boundary
        if self.secret.learn(preimage).is_err() {
            crate::metrics::record_anomaly("secret_mismatch");
            return Vec::new();
        }

        {
            let leg = self.leg_mut(side);
            leg.redeemed = true;
            leg.redeem_txid = Some(txid);
        }

        let mut actions = Vec::new();
        match side {
            // participant leg redeemed: the preimage is now public
            LegSide::B => {
                if !self.state.is_terminal() {
                    self.transition(SwapState::SecretRevealed, now);
                }
                if self.role == Role::Participant
                    && !self.leg_a.redeem_issued
                    && !self.leg_a.refunded
                {
                    self.leg_a.redeem_issued = true;
                    actions.push(SwapAction::BroadcastRedeem {
                        leg: LegSide::A,
                        preimage,
                    });
                }
            }
            // initiator leg redeemed with the same preimage: both legs
            // have now settled to their counterparties
            LegSide::A => {
                self.transition(SwapState::Completed, now);
            }
        }
        actions
    }

    fn on_refund_seen(&mut self, side: LegSide, txid: String, now: u64) -> Vec<SwapAction> {
        if self.leg(side).redeemed {
            warn!(
                swap_id = %self.id,
                leg = %side,
                "refund observed on an already redeemed leg"
            );
            crate::metrics::record_anomaly("refund_after_redeem");
            return Vec::new();
        }

        {
            let leg = self.leg_mut(side);
            leg.refunded = true;
            leg.refund_txid = Some(txid);
        }

        if side == self.local_leg() {
            // our own funds came back
            self.transition(SwapState::Refunded, now);
        } else if self.leg(self.local_leg()).contract.is_none() {
            // counterparty withdrew before we ever funded
            self.fail("counterparty refunded its leg".into(), now);
        }
        // otherwise keep waiting: our own refund path is driven by ticks
        Vec::new()
    }

    fn on_reorg(&mut self, side: LegSide, now: u64) -> Vec<SwapAction> {
        self.leg_mut(side).confirmed = false;

        // revert to the pre-confirmation sub-state; secret and hash are
        // untouched and funding is re-awaited
        if matches!(
            self.state,
            SwapState::Funding | SwapState::PartiallyFunded | SwapState::BothFunded
        ) {
            let reverted = if self.leg_a.confirmed || self.leg_b.confirmed {
                SwapState::PartiallyFunded
            } else {
                SwapState::Funding
            };
            self.transition(reverted, now);
        }
        Vec::new()
    }

    // ---- engine feedback ---------------------------------------------------

    fn record_funding(&mut self, side: LegSide, contract: ContractRef, now: u64) -> Vec<SwapAction> {
        if !matches!(
            self.state,
            SwapState::Negotiated
                | SwapState::Funding
                | SwapState::PartiallyFunded
                | SwapState::BothFunded
        ) {
            self.anomaly("record_funding");
            return Vec::new();
        }

        let leg = self.leg_mut(side);
        if let Some(existing) = &leg.contract {
            if existing.funding_txid != contract.funding_txid {
                warn!(
                    swap_id = %self.id,
                    leg = %side,
                    "conflicting funding report ignored"
                );
            }
            // idempotent redelivery
            return Vec::new();
        }
        leg.contract = Some(contract.clone());
        self.touch(now);

        vec![SwapAction::StartMonitor {
            leg: side,
            contract,
        }]
    }

    fn on_redeem_broadcast(&mut self, leg: LegSide, txid: String, now: u64) -> Vec<SwapAction> {
        info!(swap_id = %self.id, leg = %leg, txid, "redeem broadcast");
        if self.role == Role::Participant && leg == LegSide::A
            && self.state == SwapState::SecretRevealed
        {
            self.transition(SwapState::Redeeming, now);
        }
        vec![SwapAction::Send(SwapMessage::RedeemNotify {
            chain_id: self.leg_chain(leg),
            txid,
        })]
    }

    fn on_refund_broadcast(&mut self, leg: LegSide, txid: String, now: u64) -> Vec<SwapAction> {
        info!(swap_id = %self.id, leg = %leg, txid, "refund broadcast");
        if leg == self.local_leg() && !self.state.is_terminal() {
            self.transition(SwapState::Refunding, now);
        }
        vec![SwapAction::Send(SwapMessage::RefundNotify {
            chain_id: self.leg_chain(leg),
            txid,
        })]
    }

    fn on_refund_failed(&mut self, leg: LegSide, now: u64) -> Vec<SwapAction> {
        let timeout = self.leg_timeout(leg);
        let grace = self.limits.refund_grace_secs;
        {
            let leg_state = self.leg_mut(leg);
            leg_state.refund_issued = false;
            leg_state.refund_attempts += 1;
        }

        if now > timeout + grace {
            let err = crate::error::SwapError::RefundWindowMissed {
                swap_id: self.id.to_string(),
                chain_id: self.leg_chain(leg),
            };
            let mut actions = self.fail("refund window missed".into(), now);
            actions.push(SwapAction::Alert {
                reason: format!("{}; funds at risk", err),
            });
            return actions;
        }
        // the next tick retries the broadcast
        Vec::new()
    }

    // ---- timers ------------------------------------------------------------

    fn on_tick(
        &mut self,
        now: u64,
        chain_time_a: Option<u64>,
        chain_time_b: Option<u64>,
    ) -> Vec<SwapAction> {
        // proposals that never negotiated expire without on-chain activity
        if matches!(self.state, SwapState::Proposed | SwapState::Negotiated)
            && self.leg_a.contract.is_none()
            && self.leg_b.contract.is_none()
            && now >= self.negotiation_deadline
        {
            self.transition(SwapState::Expired, now);
            return Vec::new();
        }

        let local = self.local_leg();
        let chain_time = match local {
            LegSide::A => chain_time_a,
            LegSide::B => chain_time_b,
        };
        let Some(chain_time) = chain_time else {
            return Vec::new();
        };

        let timeout = self.leg_timeout(local);
        let leg = self.leg(local);

        // refund our leg after its timeout if it is funded and neither
        // redeemed nor already being refunded
        let refundable = leg.contract.is_some()
            && !leg.redeemed
            && !leg.refunded
            && !leg.refund_issued
            && chain_time >= timeout
            && !matches!(self.state, SwapState::Completed);

        if refundable {
            self.leg_mut(local).refund_issued = true;
            return vec![SwapAction::BroadcastRefund { leg: local }];
        }

        // reissue a redeem whose broadcast previously failed
        if let Some(preimage) = self.secret.preimage {
            let target = self.remote_leg();
            let can_redeem = match self.role {
                Role::Initiator => self.state == SwapState::BothFunded,
                Role::Participant => {
                    matches!(self.state, SwapState::SecretRevealed | SwapState::Redeeming)
                }
            };
            let leg = self.leg(target);
            if can_redeem
                && leg.contract.is_some()
                && !leg.redeem_issued
                && !leg.redeemed
                && !leg.refunded
            {
                self.leg_mut(target).redeem_issued = true;
                return vec![SwapAction::BroadcastRedeem {
                    leg: target,
                    preimage,
                }];
            }
        }

        Vec::new()
    }

    fn on_cancel(&mut self, now: u64) -> Vec<SwapAction> {
        // once a leg is funded the only exits are completed, refunded or
        // failed
        if matches!(self.state, SwapState::Proposed | SwapState::Negotiated)
            && self.leg_a.contract.is_none()
            && self.leg_b.contract.is_none()
        {
            let mut actions = self.fail("cancelled before funding".into(), now);
            actions.push(SwapAction::Send(SwapMessage::RejectSwap {
                reason: "cancelled".into(),
            }));
            actions
        } else {
            self.anomaly("cancel");
            Vec::new()
        }
    }

    // ---- helpers -----------------------------------------------------------

    fn leg_chain(&self, side: LegSide) -> u64 {
        match side {
            LegSide::A => self.params.chain_a,
            LegSide::B => self.params.chain_b,
        }
    }

    fn transition(&mut self, next: SwapState, now: u64) {
        if self.state == next {
            return;
        }
        info!(
            swap_id = %self.id,
            from = self.state.name(),
            to = next.name(),
            "state transition"
        );
        crate::metrics::record_transition(next.name());
        if next.is_terminal() {
            self.terminal_at = Some(now);
        }
        self.state = next;
        self.touch(now);
    }

    fn fail(&mut self, reason: String, now: u64) -> Vec<SwapAction> {
        warn!(swap_id = %self.id, reason = %reason, "swap failed");
        self.transition(SwapState::Failed { reason }, now);
        Vec::new()
    }

    fn anomaly(&self, event: &'static str) {
        warn!(
            swap_id = %self.id,
            state = self.state.name(),
            event,
            "event discarded: no valid transition"
        );
        crate::metrics::record_anomaly(event);
    }

    fn touch(&mut self, now: u64) {
        self.updated_at = now;
    }

    /// Serializable snapshot: enough to resume after a restart without
    /// re-negotiation
    pub fn snapshot(&self) -> SwapRecord {
        SwapRecord {
            swap_id: self.id,
            role: self.role,
            state: self.state.clone(),
            params: self.params.clone(),
            secret: self.secret.clone(),
            leg_a: self.leg_a.clone(),
            leg_b: self.leg_b.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            terminal_at: self.terminal_at,
        }
    }

    /// Rebuild a session from a persisted snapshot
    pub fn restore(record: SwapRecord, limits: SessionLimits) -> Self {
        Self {
            id: record.swap_id,
            role: record.role,
            state: record.state,
            params: record.params,
            secret: record.secret,
            leg_a: record.leg_a,
            leg_b: record.leg_b,
            created_at: record.created_at,
            updated_at: record.updated_at,
            terminal_at: record.terminal_at,
            negotiation_deadline: record.created_at + limits.negotiation_timeout_secs,
            limits,
        }
    }
}

/// Persisted form of a session
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SwapRecord {
    pub swap_id: SwapId,
    pub role: Role,
    pub state: SwapState,
    pub params: SwapParameters,
    pub secret: Secret,
    pub leg_a: Leg,
    pub leg_b: Leg,
    pub created_at: u64,
    pub updated_at: u64,
    pub terminal_at: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::hash_preimage;

    const NOW: u64 = 1_700_000_000;

    fn limits() -> SessionLimits {
        SessionLimits {
            min_timeout_gap_secs: 3_600,
            negotiation_timeout_secs: 600,
            refund_grace_secs: 1_800,
        }
    }

    fn params() -> SwapParameters {
        SwapParameters {
            chain_a: 7,
            amount_a: 1,
            timeout_a: NOW + 48 * 3_600,
            chain_b: 9,
            amount_b: 100,
            timeout_b: NOW + 24 * 3_600,
            initiator_pubkey: "02aa".into(),
            participant_pubkey: String::new(),
            initiator_redeem_key: hex::encode([0x02; 33]),
            initiator_refund_key: hex::encode([0x03; 33]),
            participant_redeem_key: String::new(),
            participant_refund_key: String::new(),
        }
    }

    fn accepted_params() -> SwapParameters {
        let mut p = params();
        p.participant_pubkey = "03bb".into();
        p.participant_redeem_key = hex::encode([0x04; 33]);
        p.participant_refund_key = hex::encode([0x05; 33]);
        p
    }

    fn contract_for(chain_id: u64, expiry: u64, txid: &str) -> ContractRef {
        ContractRef {
            chain_id,
            funding_txid: txid.into(),
            lock_script: vec![0x63],
            lock_address: format!("addr-{}", chain_id),
            amount: 1,
            expiry,
            confirmations: 0,
            confirmation_threshold: 3,
        }
    }

    /// Drive an initiator session to BothFunded; returns the redeem action
    fn initiator_at_both_funded() -> (SwapSession, Vec<SwapAction>) {
        let mut session = SwapSession::new_initiator(params(), limits(), NOW).unwrap();

        let actions = session.on_event(
            SessionEvent::Message(SwapMessage::AcceptSwap {
                params: accepted_params(),
                secret_hash: session.secret.hash,
            }),
            NOW,
        );
        assert_eq!(session.state, SwapState::Negotiated);
        assert_eq!(
            actions,
            vec![SwapAction::BroadcastFunding { leg: LegSide::A }]
        );

        let c_a = contract_for(7, session.params.timeout_a, "tx-a");
        let actions = session.on_event(
            SessionEvent::LocalFundingBroadcast {
                leg: LegSide::A,
                contract: c_a.clone(),
            },
            NOW,
        );
        assert!(matches!(actions[0], SwapAction::StartMonitor { .. }));

        let c_b = contract_for(9, session.params.timeout_b, "tx-b");
        session.on_event(
            SessionEvent::RemoteFundingReported {
                leg: LegSide::B,
                contract: c_b,
            },
            NOW,
        );

        session.on_event(
            SessionEvent::Leg(LegSide::A, LegEventKind::FundingSeen { included_at: 1 }),
            NOW,
        );
        assert_eq!(session.state, SwapState::Funding);

        session.on_event(
            SessionEvent::Leg(LegSide::A, LegEventKind::FundingConfirmed { confirmations: 3 }),
            NOW,
        );
        assert_eq!(session.state, SwapState::PartiallyFunded);

        let actions = session.on_event(
            SessionEvent::Leg(LegSide::B, LegEventKind::FundingConfirmed { confirmations: 3 }),
            NOW,
        );
        assert_eq!(session.state, SwapState::BothFunded);
        (session, actions)
    }

    #[test]
    fn initiator_happy_path_reveals_then_completes() {
        let (mut session, actions) = initiator_at_both_funded();

        // the redeem of leg B is the only path publishing the preimage
        let preimage = session.secret.preimage.unwrap();
        assert_eq!(
            actions,
            vec![SwapAction::BroadcastRedeem {
                leg: LegSide::B,
                preimage,
            }]
        );

        // hash is unchanged after negotiation
        assert_eq!(hash_preimage(&preimage), session.secret.hash);

        session.on_event(
            SessionEvent::Leg(
                LegSide::B,
                LegEventKind::RedeemSeen {
                    txid: "redeem-b".into(),
                    preimage,
                },
            ),
            NOW,
        );
        assert_eq!(session.state, SwapState::SecretRevealed);

        // participant redeems our leg with the same preimage
        session.on_event(
            SessionEvent::Leg(
                LegSide::A,
                LegEventKind::RedeemSeen {
                    txid: "redeem-a".into(),
                    preimage,
                },
            ),
            NOW,
        );
        assert_eq!(session.state, SwapState::Completed);
        assert!(session.leg_a.redeemed && session.leg_b.redeemed);
    }

    #[test]
    fn participant_learns_secret_and_redeems() {
        let initiator_secret = Secret::generate();
        let mut session = SwapSession::new_participant(
            accepted_params(),
            initiator_secret.hash,
            limits(),
            NOW,
        )
        .unwrap();

        let actions = session.accept(NOW);
        assert_eq!(session.state, SwapState::Negotiated);
        assert!(matches!(
            actions[0],
            SwapAction::Send(SwapMessage::AcceptSwap { .. })
        ));

        // initiator funds leg A first
        session.on_event(
            SessionEvent::RemoteFundingReported {
                leg: LegSide::A,
                contract: contract_for(7, session.params.timeout_a, "tx-a"),
            },
            NOW,
        );
        let actions = session.on_event(
            SessionEvent::Leg(LegSide::A, LegEventKind::FundingConfirmed { confirmations: 3 }),
            NOW,
        );
        // participant funds its own leg only after leg A is final
        assert!(actions.contains(&SwapAction::BroadcastFunding { leg: LegSide::B }));

        session.on_event(
            SessionEvent::LocalFundingBroadcast {
                leg: LegSide::B,
                contract: contract_for(9, session.params.timeout_b, "tx-b"),
            },
            NOW,
        );
        let actions = session.on_event(
            SessionEvent::Leg(LegSide::B, LegEventKind::FundingConfirmed { confirmations: 3 }),
            NOW,
        );
        assert_eq!(session.state, SwapState::BothFunded);
        assert!(actions.is_empty(), "participant never redeems first");

        // initiator redeems leg B, revealing the preimage on-chain
        let preimage = initiator_secret.preimage.unwrap();
        let actions = session.on_event(
            SessionEvent::Leg(
                LegSide::B,
                LegEventKind::RedeemSeen {
                    txid: "redeem-b".into(),
                    preimage,
                },
            ),
            NOW,
        );
        assert_eq!(session.state, SwapState::SecretRevealed);
        assert!(session.secret.is_revealed());
        assert_eq!(
            actions,
            vec![SwapAction::BroadcastRedeem {
                leg: LegSide::A,
                preimage,
            }]
        );

        let actions = session.on_event(
            SessionEvent::RedeemBroadcast {
                leg: LegSide::A,
                txid: "redeem-a".into(),
            },
            NOW,
        );
        assert_eq!(session.state, SwapState::Redeeming);
        assert!(matches!(
            actions[0],
            SwapAction::Send(SwapMessage::RedeemNotify { .. })
        ));

        session.on_event(
            SessionEvent::Leg(
                LegSide::A,
                LegEventKind::RedeemSeen {
                    txid: "redeem-a".into(),
                    preimage,
                },
            ),
            NOW,
        );
        assert_eq!(session.state, SwapState::Completed);
    }

    #[test]
    fn tampered_acceptance_is_rejected_before_funding() {
        let mut session = SwapSession::new_initiator(params(), limits(), NOW).unwrap();

        let mut tampered = accepted_params();
        tampered.amount_b = 1; // tried to pay less
        let actions = session.on_event(
            SessionEvent::Message(SwapMessage::AcceptSwap {
                params: tampered,
                secret_hash: session.secret.hash,
            }),
            NOW,
        );

        assert!(matches!(session.state, SwapState::Failed { .. }));
        assert!(actions
            .iter()
            .any(|a| matches!(a, SwapAction::Send(SwapMessage::RejectSwap { .. }))));
        assert!(!session.leg_a.funding_issued, "nothing may fund");
    }

    #[test]
    fn altered_hash_fails_negotiation() {
        let mut session = SwapSession::new_initiator(params(), limits(), NOW).unwrap();
        let other = Secret::generate();

        session.on_event(
            SessionEvent::Message(SwapMessage::AcceptSwap {
                params: accepted_params(),
                secret_hash: other.hash,
            }),
            NOW,
        );
        assert!(matches!(session.state, SwapState::Failed { .. }));
    }

    #[test]
    fn reversed_timeouts_rejected_at_construction() {
        let mut p = params();
        p.timeout_b = p.timeout_a + 1;
        assert!(SwapSession::new_initiator(p.clone(), limits(), NOW).is_err());
        assert!(
            SwapSession::new_participant(p, SecretHash([0u8; 32]), limits(), NOW).is_err()
        );
    }

    #[test]
    fn funding_mismatch_is_fatal_with_alert() {
        let mut session = SwapSession::new_initiator(params(), limits(), NOW).unwrap();
        session.on_event(
            SessionEvent::Message(SwapMessage::AcceptSwap {
                params: accepted_params(),
                secret_hash: session.secret.hash,
            }),
            NOW,
        );
        session.on_event(
            SessionEvent::RemoteFundingReported {
                leg: LegSide::B,
                contract: contract_for(9, NOW + 24 * 3_600, "tx-b"),
            },
            NOW,
        );

        let actions = session.on_event(
            SessionEvent::Leg(
                LegSide::B,
                LegEventKind::FundingMismatch {
                    reason: "amount 90 != negotiated 100".into(),
                },
            ),
            NOW,
        );
        assert!(matches!(session.state, SwapState::Failed { .. }));
        assert!(actions.iter().any(|a| matches!(a, SwapAction::Alert { .. })));
    }

    #[test]
    fn reorg_reverts_confirmation_substate_keeping_secret() {
        let (mut session, _) = initiator_at_both_funded();
        let hash_before = session.secret.hash;

        session.on_event(SessionEvent::Leg(LegSide::B, LegEventKind::Reorged), NOW);
        assert_eq!(session.state, SwapState::PartiallyFunded);

        session.on_event(SessionEvent::Leg(LegSide::A, LegEventKind::Reorged), NOW);
        assert_eq!(session.state, SwapState::Funding);

        assert_eq!(session.secret.hash, hash_before);
        assert!(session.secret.preimage.is_some());

        // re-confirmation converges again without a duplicate redeem
        session.on_event(
            SessionEvent::Leg(LegSide::A, LegEventKind::FundingConfirmed { confirmations: 3 }),
            NOW,
        );
        let actions = session.on_event(
            SessionEvent::Leg(LegSide::B, LegEventKind::FundingConfirmed { confirmations: 3 }),
            NOW,
        );
        assert_eq!(session.state, SwapState::BothFunded);
        assert!(
            actions.is_empty(),
            "redeem must not be issued twice: {:?}",
            actions
        );
    }

    #[test]
    fn timeout_drives_refund_exactly_once() {
        let mut session = SwapSession::new_initiator(params(), limits(), NOW).unwrap();
        session.on_event(
            SessionEvent::Message(SwapMessage::AcceptSwap {
                params: accepted_params(),
                secret_hash: session.secret.hash,
            }),
            NOW,
        );
        session.on_event(
            SessionEvent::LocalFundingBroadcast {
                leg: LegSide::A,
                contract: contract_for(7, session.params.timeout_a, "tx-a"),
            },
            NOW,
        );
        session.on_event(
            SessionEvent::Leg(LegSide::A, LegEventKind::FundingConfirmed { confirmations: 3 }),
            NOW,
        );

        // participant never funds; before the timeout nothing happens
        let actions = session.on_event(
            SessionEvent::Tick {
                now: NOW + 60,
                chain_time_a: Some(session.params.timeout_a - 1),
                chain_time_b: None,
            },
            NOW + 60,
        );
        assert!(actions.is_empty());

        // after our leg's timeout the refund is offered once
        let expired = session.params.timeout_a + 1;
        let actions = session.on_event(
            SessionEvent::Tick {
                now: expired,
                chain_time_a: Some(expired),
                chain_time_b: None,
            },
            expired,
        );
        assert_eq!(actions, vec![SwapAction::BroadcastRefund { leg: LegSide::A }]);

        // redelivery of the tick is idempotent
        let actions = session.on_event(
            SessionEvent::Tick {
                now: expired + 1,
                chain_time_a: Some(expired + 1),
                chain_time_b: None,
            },
            expired + 1,
        );
        assert!(actions.is_empty());

        session.on_event(
            SessionEvent::RefundBroadcast {
                leg: LegSide::A,
                txid: "refund-a".into(),
            },
            expired + 2,
        );
        assert_eq!(session.state, SwapState::Refunding);

        session.on_event(
            SessionEvent::Leg(
                LegSide::A,
                LegEventKind::RefundSeen {
                    txid: "refund-a".into(),
                },
            ),
            expired + 3,
        );
        assert_eq!(session.state, SwapState::Refunded);
    }

    #[test]
    fn refund_window_missed_is_fatal() {
        let mut session = SwapSession::new_initiator(params(), limits(), NOW).unwrap();
        session.on_event(
            SessionEvent::Message(SwapMessage::AcceptSwap {
                params: accepted_params(),
                secret_hash: session.secret.hash,
            }),
            NOW,
        );
        session.on_event(
            SessionEvent::LocalFundingBroadcast {
                leg: LegSide::A,
                contract: contract_for(7, session.params.timeout_a, "tx-a"),
            },
            NOW,
        );

        let way_past = session.params.timeout_a + limits().refund_grace_secs + 1;
        session.on_event(
            SessionEvent::Tick {
                now: way_past,
                chain_time_a: Some(way_past),
                chain_time_b: None,
            },
            way_past,
        );

        let actions = session.on_event(
            SessionEvent::RefundBroadcastFailed { leg: LegSide::A },
            way_past,
        );
        assert!(matches!(session.state, SwapState::Failed { .. }));
        assert!(actions.iter().any(|a| matches!(a, SwapAction::Alert { .. })));
    }

    #[test]
    fn redeemed_and_refunded_are_mutually_exclusive() {
        let (mut session, _) = initiator_at_both_funded();
        let preimage = session.secret.preimage.unwrap();

        session.on_event(
            SessionEvent::Leg(
                LegSide::B,
                LegEventKind::RedeemSeen {
                    txid: "redeem-b".into(),
                    preimage,
                },
            ),
            NOW,
        );
        assert!(session.leg_b.redeemed);

        // a later refund observation on the same leg is discarded
        session.on_event(
            SessionEvent::Leg(
                LegSide::B,
                LegEventKind::RefundSeen {
                    txid: "refund-b".into(),
                },
            ),
            NOW,
        );
        assert!(!session.leg_b.refunded);
        assert!(session.leg_b.redeemed);
    }

    #[test]
    fn proposal_expires_without_on_chain_activity() {
        let mut session = SwapSession::new_initiator(params(), limits(), NOW).unwrap();

        let deadline = NOW + limits().negotiation_timeout_secs;
        session.on_event(
            SessionEvent::Tick {
                now: deadline,
                chain_time_a: None,
                chain_time_b: None,
            },
            deadline,
        );
        assert_eq!(session.state, SwapState::Expired);
        assert!(!session.leg_a.funding_issued);
    }

    #[test]
    fn cancel_only_before_funding() {
        let mut session = SwapSession::new_initiator(params(), limits(), NOW).unwrap();
        let actions = session.on_event(SessionEvent::Cancel, NOW);
        assert!(matches!(session.state, SwapState::Failed { .. }));
        assert!(actions
            .iter()
            .any(|a| matches!(a, SwapAction::Send(SwapMessage::RejectSwap { .. }))));

        // once funded, cancel is discarded
        let (mut session, _) = initiator_at_both_funded();
        session.on_event(SessionEvent::Cancel, NOW);
        assert_eq!(session.state, SwapState::BothFunded);
    }

    #[test]
    fn snapshot_round_trips_for_resume() {
        let (session, _) = initiator_at_both_funded();
        let record = session.snapshot();

        let json = serde_json::to_string(&record).unwrap();
        let parsed: SwapRecord = serde_json::from_str(&json).unwrap();
        let restored = SwapSession::restore(parsed, limits());

        assert_eq!(restored.id, session.id);
        assert_eq!(restored.state, SwapState::BothFunded);
        assert_eq!(restored.secret.hash, session.secret.hash);
        assert_eq!(restored.secret.preimage, session.secret.preimage);
        assert!(restored.leg_a.contract.is_some());
        assert!(restored.leg_b.redeem_issued, "at-most-once flags survive");
    }

    #[test]
    fn initiator_refunds_own_leg_if_never_redeemed() {
        let (mut session, _) = initiator_at_both_funded();
        let preimage = session.secret.preimage.unwrap();

        session.on_event(
            SessionEvent::Leg(
                LegSide::B,
                LegEventKind::RedeemSeen {
                    txid: "redeem-b".into(),
                    preimage,
                },
            ),
            NOW,
        );
        assert_eq!(session.state, SwapState::SecretRevealed);

        // the participant never redeems leg A; after timeout_a the
        // initiator takes its own funds back
        let expired = session.params.timeout_a + 1;
        let actions = session.on_event(
            SessionEvent::Tick {
                now: expired,
                chain_time_a: Some(expired),
                chain_time_b: None,
            },
            expired,
        );
        assert_eq!(actions, vec![SwapAction::BroadcastRefund { leg: LegSide::A }]);
    }
}
