//! Peer-to-peer negotiation protocol
//!
//! Defines the messages exchanged between initiator and participant and the
//! signed envelope they travel in. Transport is an external collaborator
//! and assumed reliable and ordered per peer; this layer still rejects
//! replays (per-peer sequence numbers, timestamp skew) and treats
//! re-delivery of already-recorded notifications as a no-op.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{SwapError, SwapResult};
use crate::secret::SecretHash;
use crate::signer::{verify_signature, KeyHandle, Signer};

/// Unique swap identifier, stable for the swap's lifetime
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SwapId(pub Uuid);

impl SwapId {
    pub fn generate() -> Self {
        SwapId(Uuid::new_v4())
    }
}

impl std::fmt::Display for SwapId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in the swap. The initiator mints the secret and carries the longer
/// timeout; the participant's leg must expire first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Initiator,
    Participant,
}

impl Role {
    pub fn counterparty(&self) -> Self {
        match self {
            Role::Initiator => Role::Participant,
            Role::Participant => Role::Initiator,
        }
    }
}

/// Negotiated swap parameters.
///
/// Leg A is funded by the initiator on `chain_a` and expires at
/// `timeout_a`; leg B is funded by the participant on `chain_b` and
/// expires at `timeout_b`. Timeouts are absolute unix seconds so the
/// ordering is comparable across chains.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapParameters {
    pub chain_a: u64,
    pub amount_a: u64,
    pub timeout_a: u64,

    pub chain_b: u64,
    pub amount_b: u64,
    pub timeout_b: u64,

    /// Negotiation public keys (hex, compressed secp256k1)
    pub initiator_pubkey: String,
    pub participant_pubkey: String,

    /// Per-leg contract keys. Leg A is redeemable by the participant and
    /// refundable by the initiator; leg B the other way around.
    pub initiator_redeem_key: String,
    pub initiator_refund_key: String,
    pub participant_redeem_key: String,
    pub participant_refund_key: String,
}

impl SwapParameters {
    /// Hard precondition checked before anything funds: both amounts are
    /// non-zero, the legs are on different chains, and the participant leg
    /// expires at least `min_gap_secs` before the initiator leg.
    pub fn validate(&self, min_gap_secs: u64) -> SwapResult<()> {
        if self.amount_a == 0 || self.amount_b == 0 {
            return Err(SwapError::Negotiation("zero swap amount".into()));
        }
        if self.chain_a == self.chain_b {
            return Err(SwapError::Negotiation(
                "both legs are on the same chain".into(),
            ));
        }
        if self.timeout_b >= self.timeout_a {
            return Err(SwapError::Negotiation(format!(
                "participant timeout {} must precede initiator timeout {}",
                self.timeout_b, self.timeout_a
            )));
        }
        if self.timeout_a - self.timeout_b < min_gap_secs {
            return Err(SwapError::Negotiation(format!(
                "timeout gap {}s below required {}s",
                self.timeout_a - self.timeout_b,
                min_gap_secs
            )));
        }
        Ok(())
    }

    /// An acceptance may fill in participant-side keys but must echo
    /// everything the proposal committed to, unmodified.
    pub fn check_acceptance(proposal: &SwapParameters, accepted: &SwapParameters) -> SwapResult<()> {
        let immutable_equal = proposal.chain_a == accepted.chain_a
            && proposal.amount_a == accepted.amount_a
            && proposal.timeout_a == accepted.timeout_a
            && proposal.chain_b == accepted.chain_b
            && proposal.amount_b == accepted.amount_b
            && proposal.timeout_b == accepted.timeout_b
            && proposal.initiator_pubkey == accepted.initiator_pubkey
            && proposal.initiator_redeem_key == accepted.initiator_redeem_key
            && proposal.initiator_refund_key == accepted.initiator_refund_key;

        if !immutable_equal {
            return Err(SwapError::Negotiation(
                "acceptance altered committed parameters".into(),
            ));
        }
        Ok(())
    }
}

/// Messages exchanged during a swap
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapMessage {
    /// Propose a new swap; carries the hash commitment
    ProposeSwap {
        params: SwapParameters,
        secret_hash: SecretHash,
    },

    /// Accept a proposal, echoing its parameters and hash
    AcceptSwap {
        params: SwapParameters,
        secret_hash: SecretHash,
    },

    /// Reject a proposal
    RejectSwap { reason: String },

    /// Sender has broadcast its funding transaction
    FundNotify {
        chain_id: u64,
        txid: String,
        lock_address: String,
    },

    /// Sender has broadcast a redeem transaction
    RedeemNotify { chain_id: u64, txid: String },

    /// Sender has broadcast a refund transaction
    RefundNotify { chain_id: u64, txid: String },

    /// Keepalive pair
    Ping { nonce: u64 },
    Pong { nonce: u64 },
}

impl SwapMessage {
    /// Message kind for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            SwapMessage::ProposeSwap { .. } => "propose_swap",
            SwapMessage::AcceptSwap { .. } => "accept_swap",
            SwapMessage::RejectSwap { .. } => "reject_swap",
            SwapMessage::FundNotify { .. } => "fund_notify",
            SwapMessage::RedeemNotify { .. } => "redeem_notify",
            SwapMessage::RefundNotify { .. } => "refund_notify",
            SwapMessage::Ping { .. } => "ping",
            SwapMessage::Pong { .. } => "pong",
        }
    }
}

/// Signed wire envelope. `sender` is the hex-encoded negotiation public
/// key; the signature covers swap id, sequence, timestamp and body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub swap_id: SwapId,
    pub sender: String,
    pub seq: u64,
    pub timestamp: u64,
    pub body: SwapMessage,
    pub signature: String,
}

impl Envelope {
    /// Canonical digest the signature commits to
    fn digest(swap_id: &SwapId, seq: u64, timestamp: u64, body: &SwapMessage) -> SwapResult<[u8; 32]> {
        let body_json =
            serde_json::to_vec(body).map_err(|e| SwapError::Internal(e.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(swap_id.0.as_bytes());
        hasher.update(seq.to_be_bytes());
        hasher.update(timestamp.to_be_bytes());
        hasher.update(&body_json);
        Ok(hasher.finalize().into())
    }

    /// Build and sign an envelope with the node's negotiation key
    pub async fn seal(
        swap_id: SwapId,
        seq: u64,
        timestamp: u64,
        body: SwapMessage,
        signer: &dyn Signer,
    ) -> SwapResult<Self> {
        let digest = Self::digest(&swap_id, seq, timestamp, &body)?;
        let signature = signer.sign(digest, &KeyHandle::negotiation()).await?;
        let sender = hex::encode(signer.public_key(&KeyHandle::negotiation()).await?);
        Ok(Envelope {
            swap_id,
            sender,
            seq,
            timestamp,
            body,
            signature: hex::encode(signature),
        })
    }

    /// Verify the envelope signature against the claimed sender key
    pub fn verify(&self) -> SwapResult<()> {
        let digest = Self::digest(&self.swap_id, self.seq, self.timestamp, &self.body)?;
        let public = hex::decode(&self.sender)
            .map_err(|_| SwapError::Negotiation("malformed sender key".into()))?;
        let signature = hex::decode(&self.signature)
            .map_err(|_| SwapError::Negotiation("malformed signature".into()))?;
        if !verify_signature(&public, digest, &signature) {
            return Err(SwapError::Negotiation("bad message signature".into()));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> SwapResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SwapError::Internal(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> SwapResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| SwapError::Negotiation(e.to_string()))
    }
}

/// Outcome of replay screening
#[derive(Debug, PartialEq, Eq)]
pub enum Screen {
    Fresh,
    Replay,
}

/// Per-peer sequence tracking. Sequence numbers must be strictly
/// increasing per sender; anything at or below the watermark is a replay
/// and handled idempotently by the caller.
#[derive(Default)]
pub struct SequenceTracker {
    watermarks: HashMap<String, u64>,
    max_clock_skew_secs: u64,
}

impl SequenceTracker {
    pub fn new(max_clock_skew_secs: u64) -> Self {
        Self {
            watermarks: HashMap::new(),
            max_clock_skew_secs,
        }
    }

    pub fn screen(&mut self, envelope: &Envelope, now: u64) -> SwapResult<Screen> {
        let skew = now.abs_diff(envelope.timestamp);
        if skew > self.max_clock_skew_secs {
            return Err(SwapError::Negotiation(format!(
                "message timestamp skewed by {}s",
                skew
            )));
        }

        let watermark = self.watermarks.entry(envelope.sender.clone()).or_insert(0);
        if envelope.seq <= *watermark {
            return Ok(Screen::Replay);
        }
        *watermark = envelope.seq;
        Ok(Screen::Fresh)
    }
}

/// Transport collaborator: reliable, ordered, authenticated channel per
/// peer relationship, carrying envelopes as opaque payloads.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send(&self, peer: &str, payload: Vec<u8>) -> SwapResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::LocalSigner;

    fn params(timeout_a: u64, timeout_b: u64) -> SwapParameters {
        SwapParameters {
            chain_a: 7,
            amount_a: 1,
            timeout_a,
            chain_b: 9,
            amount_b: 100,
            timeout_b,
            initiator_pubkey: "02aa".into(),
            participant_pubkey: String::new(),
            initiator_redeem_key: "02bb".into(),
            initiator_refund_key: "02cc".into(),
            participant_redeem_key: String::new(),
            participant_refund_key: String::new(),
        }
    }

    #[test]
    fn timeout_ordering_is_enforced() {
        // 48h / 24h is fine
        assert!(params(1_000_000 + 48 * 3600, 1_000_000 + 24 * 3600)
            .validate(3600)
            .is_ok());

        // reversed or equal ordering is a negotiation error
        assert!(matches!(
            params(1_000, 1_000).validate(1),
            Err(SwapError::Negotiation(_))
        ));
        assert!(matches!(
            params(1_000, 2_000).validate(1),
            Err(SwapError::Negotiation(_))
        ));

        // gap below the configured margin
        assert!(matches!(
            params(10_000, 9_500).validate(3600),
            Err(SwapError::Negotiation(_))
        ));
    }

    #[test]
    fn acceptance_must_echo_committed_fields() {
        let proposal = params(50_000, 10_000);

        let mut ok = proposal.clone();
        ok.participant_pubkey = "03dd".into();
        ok.participant_redeem_key = "03ee".into();
        ok.participant_refund_key = "03ff".into();
        assert!(SwapParameters::check_acceptance(&proposal, &ok).is_ok());

        let mut tampered = ok.clone();
        tampered.amount_b = 99;
        assert!(SwapParameters::check_acceptance(&proposal, &tampered).is_err());

        let mut reversed = ok;
        reversed.timeout_a = 5_000;
        assert!(SwapParameters::check_acceptance(&proposal, &reversed).is_err());
    }

    #[tokio::test]
    async fn envelope_signature_round_trip() {
        let mut signer = LocalSigner::new();
        signer.generate(KeyHandle::negotiation());

        let swap_id = SwapId::generate();
        let env = Envelope::seal(
            swap_id,
            1,
            1_700_000_000,
            SwapMessage::Ping { nonce: 42 },
            &signer,
        )
        .await
        .unwrap();

        env.verify().unwrap();

        let mut forged = env.clone();
        forged.seq = 2;
        assert!(forged.verify().is_err());
    }

    #[tokio::test]
    async fn sequence_tracker_flags_replays() {
        let mut signer = LocalSigner::new();
        signer.generate(KeyHandle::negotiation());
        let swap_id = SwapId::generate();
        let now = 1_700_000_000;

        let env1 = Envelope::seal(swap_id, 1, now, SwapMessage::Ping { nonce: 1 }, &signer)
            .await
            .unwrap();
        let env2 = Envelope::seal(swap_id, 2, now, SwapMessage::Ping { nonce: 2 }, &signer)
            .await
            .unwrap();

        let mut tracker = SequenceTracker::new(60);
        assert_eq!(tracker.screen(&env1, now).unwrap(), Screen::Fresh);
        assert_eq!(tracker.screen(&env2, now).unwrap(), Screen::Fresh);
        // redelivery of either is screened as a replay, not an error
        assert_eq!(tracker.screen(&env1, now).unwrap(), Screen::Replay);
        assert_eq!(tracker.screen(&env2, now).unwrap(), Screen::Replay);

        // far-future timestamp is rejected outright
        let skewed = Envelope::seal(swap_id, 3, now + 900, SwapMessage::Ping { nonce: 3 }, &signer)
            .await
            .unwrap();
        assert!(tracker.screen(&skewed, now).is_err());
    }
}
