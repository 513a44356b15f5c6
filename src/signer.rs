//! Signing collaborator
//!
//! The engine hands out 32-byte digests and gets back signatures; raw
//! private keys never cross this boundary. Key material is addressed by
//! opaque handles so a remote or hardware signer can implement the same
//! trait.

use async_trait::async_trait;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use std::collections::HashMap;

use crate::error::{SwapError, SwapResult};

/// Opaque reference to a key held by the signer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyHandle(pub String);

impl KeyHandle {
    pub fn negotiation() -> Self {
        KeyHandle("negotiation".to_string())
    }

    pub fn for_chain(chain_id: u64) -> Self {
        KeyHandle(format!("chain:{}", chain_id))
    }
}

/// Wallet/signer collaborator. Signatures are compact-encoded secp256k1
/// ECDSA over a caller-supplied digest.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, digest: [u8; 32], key: &KeyHandle) -> SwapResult<Vec<u8>>;

    /// Compressed (33-byte) public key for a handle
    async fn public_key(&self, key: &KeyHandle) -> SwapResult<Vec<u8>>;
}

/// Verify a compact signature against a compressed public key
pub fn verify_signature(public_key: &[u8], digest: [u8; 32], signature: &[u8]) -> bool {
    let secp = Secp256k1::verification_only();
    let Ok(pk) = PublicKey::from_slice(public_key) else {
        return false;
    };
    let Ok(sig) = Signature::from_compact(signature) else {
        return false;
    };
    let msg = Message::from_digest(digest);
    secp.verify_ecdsa(&msg, &sig, &pk).is_ok()
}

/// In-process signer keyed from environment variables. Dev mode only; a
/// production deployment points the engine at an external signer.
pub struct LocalSigner {
    secp: Secp256k1<secp256k1::All>,
    keys: HashMap<KeyHandle, SecretKey>,
}

impl LocalSigner {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
            keys: HashMap::new(),
        }
    }

    /// Load a key from a hex-encoded environment variable
    pub fn load_env(mut self, handle: KeyHandle, env_var: &str) -> SwapResult<Self> {
        let hex_key = std::env::var(env_var)
            .map_err(|_| SwapError::Signer(format!("{} is not set", env_var)))?;
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| SwapError::Signer(format!("invalid key in {}: {}", env_var, e)))?;
        let secret = SecretKey::from_slice(&bytes)
            .map_err(|e| SwapError::Signer(format!("invalid key in {}: {}", env_var, e)))?;
        self.keys.insert(handle, secret);
        Ok(self)
    }

    /// Generate an ephemeral key, returning its public half
    pub fn generate(&mut self, handle: KeyHandle) -> Vec<u8> {
        let (secret, public) = self.secp.generate_keypair(&mut rand::thread_rng());
        self.keys.insert(handle, secret);
        public.serialize().to_vec()
    }

    fn key(&self, handle: &KeyHandle) -> SwapResult<&SecretKey> {
        self.keys
            .get(handle)
            .ok_or_else(|| SwapError::Signer(format!("no key for handle {:?}", handle)))
    }
}

impl Default for LocalSigner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Signer for LocalSigner {
    async fn sign(&self, digest: [u8; 32], key: &KeyHandle) -> SwapResult<Vec<u8>> {
        let secret = self.key(key)?;
        let msg = Message::from_digest(digest);
        let sig = self.secp.sign_ecdsa(&msg, secret);
        Ok(sig.serialize_compact().to_vec())
    }

    async fn public_key(&self, key: &KeyHandle) -> SwapResult<Vec<u8>> {
        let secret = self.key(key)?;
        Ok(PublicKey::from_secret_key(&self.secp, secret)
            .serialize()
            .to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sign_and_verify_round_trip() {
        let mut signer = LocalSigner::new();
        let handle = KeyHandle::negotiation();
        let public = signer.generate(handle.clone());

        let digest = [7u8; 32];
        let sig = signer.sign(digest, &handle).await.unwrap();

        assert!(verify_signature(&public, digest, &sig));
        assert!(!verify_signature(&public, [8u8; 32], &sig));
    }

    #[tokio::test]
    async fn unknown_handle_is_an_error() {
        let signer = LocalSigner::new();
        let err = signer
            .sign([0u8; 32], &KeyHandle::for_chain(9))
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::Signer(_)));
    }
}
