//! Chain-agnostic contract construction
//!
//! `ContractBuilder` is the only seam the engine crosses to talk about
//! on-chain artifacts: lock scripts, funding, redeem and refund
//! transactions, and spend classification for the monitor. Each chain
//! family implements the capability set uniformly; nothing outside this
//! module branches on chain family.

pub mod account;
pub mod script;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::ChainFamily;
use crate::error::SwapResult;
use crate::secret::{SecretHash, SECRET_SIZE};

/// Per-leg on-chain record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractRef {
    pub chain_id: u64,
    pub funding_txid: String,
    pub lock_script: Vec<u8>,
    pub lock_address: String,
    pub amount: u64,
    /// Absolute expiry, unix seconds
    pub expiry: u64,
    pub confirmations: u64,
    pub confirmation_threshold: u64,
}

impl ContractRef {
    pub fn is_confirmed(&self) -> bool {
        self.confirmations >= self.confirmation_threshold
    }
}

/// Everything a lock script commits to
#[derive(Clone, Debug)]
pub struct HtlcTerms {
    pub secret_hash: SecretHash,
    /// Key allowed to redeem with the preimage (hex)
    pub redeem_key: String,
    /// Key allowed to refund after expiry (hex)
    pub refund_key: String,
    /// Absolute expiry, unix seconds
    pub expiry: u64,
    pub amount: u64,
}

/// A transaction built but not yet signed. `digest` is what the signer
/// signs; `finalize` splices the signature into the broadcastable payload.
#[derive(Clone, Debug)]
pub struct UnsignedTx {
    pub chain_id: u64,
    pub payload: Vec<u8>,
    pub digest: [u8; 32],
}

/// Classification of a transaction spending a lock script
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpendKind {
    Redeem { preimage: [u8; SECRET_SIZE] },
    Refund,
    Unrelated,
}

/// Capability interface implemented once per chain family
pub trait ContractBuilder: Send + Sync {
    fn family(&self) -> ChainFamily;

    /// Build the HTLC lock script and its address
    fn lock_script(&self, terms: &HtlcTerms) -> SwapResult<(Vec<u8>, String)>;

    /// Build the transaction funding the lock
    fn funding_tx(&self, chain_id: u64, terms: &HtlcTerms) -> SwapResult<UnsignedTx>;

    /// Build the transaction redeeming a funded leg with the preimage
    fn redeem_tx(
        &self,
        contract: &ContractRef,
        preimage: &[u8; SECRET_SIZE],
    ) -> SwapResult<UnsignedTx>;

    /// Build the refund transaction; only constructible once the chain's
    /// clock has passed the contract expiry
    fn refund_tx(&self, contract: &ContractRef, chain_time: u64) -> SwapResult<UnsignedTx>;

    /// Attach a signature, producing the broadcastable payload
    fn finalize(&self, tx: &UnsignedTx, signature: &[u8]) -> SwapResult<Vec<u8>>;

    /// Classify a transaction observed on the leg's lock address
    fn classify_spend(&self, lock_address: &str, payload: &[u8]) -> SpendKind;

    /// Check an observed funding transaction against the negotiated leg.
    /// The lock address commits to hash, keys and expiry, so a funding
    /// with the wrong commitment or amount is rejected here rather than
    /// silently accepted.
    fn check_funding(&self, expected: &ContractRef, payload: &[u8]) -> SwapResult<()>;
}

/// Which side of the swap a contract belongs to: leg A is funded by the
/// initiator, leg B by the participant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LegSide {
    A,
    B,
}

impl std::fmt::Display for LegSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LegSide::A => write!(f, "A"),
            LegSide::B => write!(f, "B"),
        }
    }
}

/// Select the builder for a configured chain family
pub fn builder_for(family: ChainFamily) -> Arc<dyn ContractBuilder> {
    match family {
        ChainFamily::Script => Arc::new(script::ScriptBuilder::new()),
        ChainFamily::Account => Arc::new(account::AccountBuilder::new()),
    }
}

// Both families frame transaction payloads the same way: the target lock
// address first, then a family-specific body. Adapters only need the
// address; everything else stays behind `classify_spend`.

pub(crate) fn frame(address: &str, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + address.len() + body.len());
    payload.push(address.len() as u8);
    payload.extend_from_slice(address.as_bytes());
    payload.extend_from_slice(body);
    payload
}

pub(crate) fn parse_frame(payload: &[u8]) -> Option<(&str, &[u8])> {
    let addr_len = *payload.first()? as usize;
    if payload.len() < 1 + addr_len {
        return None;
    }
    let address = std::str::from_utf8(&payload[1..1 + addr_len]).ok()?;
    Some((address, &payload[1 + addr_len..]))
}

/// Target address of a framed transaction payload
pub fn payload_address(payload: &[u8]) -> Option<String> {
    parse_frame(payload).map(|(address, _)| address.to_string())
}
