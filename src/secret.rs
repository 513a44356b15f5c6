//! Secret/preimage lifecycle
//!
//! A swap is anchored by a random 32-byte preimage and its SHA-256 hash.
//! The hash commits both legs at negotiation time; the preimage stays on
//! the initiator's side until a redeem transaction publishes it.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{SwapError, SwapResult};

/// Preimage size in bytes
pub const SECRET_SIZE: usize = 32;

/// Hash size in bytes
pub const HASH_SIZE: usize = 32;

/// The public half of a swap secret
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretHash(pub [u8; HASH_SIZE]);

impl SecretHash {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> SwapResult<Self> {
        let bytes = hex::decode(s).map_err(|e| SwapError::Internal(e.to_string()))?;
        let arr: [u8; HASH_SIZE] = bytes
            .try_into()
            .map_err(|_| SwapError::Internal("hash must be 32 bytes".into()))?;
        Ok(SecretHash(arr))
    }
}

impl std::fmt::Debug for SecretHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretHash({})", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for SecretHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// A preimage/hash pair. The preimage is only present on the initiator's
/// side (or on the participant's side after on-chain disclosure).
#[derive(Clone, Serialize, Deserialize)]
pub struct Secret {
    pub hash: SecretHash,
    pub preimage: Option<[u8; SECRET_SIZE]>,
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log the preimage itself
        f.debug_struct("Secret")
            .field("hash", &self.hash)
            .field("revealed", &self.preimage.is_some())
            .finish()
    }
}

impl Secret {
    /// Mint a fresh preimage/hash pair (initiator side)
    pub fn generate() -> Self {
        let mut preimage = [0u8; SECRET_SIZE];
        rand::thread_rng().fill_bytes(&mut preimage);
        let hash = hash_preimage(&preimage);
        Secret {
            hash,
            preimage: Some(preimage),
        }
    }

    /// Track a counterparty's commitment (participant side)
    pub fn from_hash(hash: SecretHash) -> Self {
        Secret {
            hash,
            preimage: None,
        }
    }

    /// Record a preimage observed on-chain, rejecting one that does not
    /// hash to the committed value.
    pub fn learn(&mut self, preimage: [u8; SECRET_SIZE]) -> SwapResult<()> {
        if !verify_preimage(&preimage, &self.hash) {
            return Err(SwapError::SecretMismatch);
        }
        self.preimage = Some(preimage);
        Ok(())
    }

    pub fn is_revealed(&self) -> bool {
        self.preimage.is_some()
    }
}

/// Hash a preimage with SHA-256
pub fn hash_preimage(preimage: &[u8; SECRET_SIZE]) -> SecretHash {
    let digest = Sha256::digest(preimage);
    let mut hash = [0u8; HASH_SIZE];
    hash.copy_from_slice(&digest);
    SecretHash(hash)
}

/// Verify a preimage against a committed hash
pub fn verify_preimage(preimage: &[u8; SECRET_SIZE], hash: &SecretHash) -> bool {
    hash_preimage(preimage) == *hash
}
