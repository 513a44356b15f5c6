//! HTLC construction for script-based (UTXO) ledgers
//!
//! Lock script template:
//!
//! ```text
//! OP_IF
//!     OP_SHA256 <hash> OP_EQUALVERIFY
//!     <redeem_pubkey> OP_CHECKSIG
//! OP_ELSE
//!     <expiry> OP_CHECKLOCKTIMEVERIFY OP_DROP
//!     <refund_pubkey> OP_CHECKSIG
//! OP_ENDIF
//! ```
//!
//! Expiry is encoded in CLTV timestamp mode (unix seconds). Transaction
//! payloads use a compact framing: a kind byte, the spent lock address,
//! kind-specific fields, and a witness appended by `finalize`.

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use super::{ContractBuilder, ContractRef, HtlcTerms, SpendKind, UnsignedTx};
use crate::config::ChainFamily;
use crate::error::{SwapError, SwapResult};
use crate::secret::SECRET_SIZE;

const KIND_FUND: u8 = 0x01;
const KIND_REDEEM: u8 = 0x02;
const KIND_REFUND: u8 = 0x03;

mod opcodes {
    pub const OP_FALSE: u8 = 0x00;
    pub const OP_TRUE: u8 = 0x51;
    pub const OP_IF: u8 = 0x63;
    pub const OP_ELSE: u8 = 0x67;
    pub const OP_ENDIF: u8 = 0x68;
    pub const OP_DROP: u8 = 0x75;
    pub const OP_EQUALVERIFY: u8 = 0x88;
    pub const OP_SHA256: u8 = 0xa8;
    pub const OP_CHECKSIG: u8 = 0xac;
    pub const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;
}

pub struct ScriptBuilder;

impl ScriptBuilder {
    pub fn new() -> Self {
        ScriptBuilder
    }
}

impl Default for ScriptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContractBuilder for ScriptBuilder {
    fn family(&self) -> ChainFamily {
        ChainFamily::Script
    }

    fn lock_script(&self, terms: &HtlcTerms) -> SwapResult<(Vec<u8>, String)> {
        use opcodes::*;

        let redeem_key = decode_pubkey(&terms.redeem_key)?;
        let refund_key = decode_pubkey(&terms.refund_key)?;

        let mut script = Vec::with_capacity(120);
        script.push(OP_IF);

        script.push(OP_SHA256);
        script.push(32);
        script.extend_from_slice(&terms.secret_hash.0);
        script.push(OP_EQUALVERIFY);

        script.push(33);
        script.extend_from_slice(&redeem_key);
        script.push(OP_CHECKSIG);

        script.push(OP_ELSE);

        let expiry_bytes = encode_locktime(terms.expiry);
        script.push(expiry_bytes.len() as u8);
        script.extend_from_slice(&expiry_bytes);
        script.push(OP_CHECKLOCKTIMEVERIFY);
        script.push(OP_DROP);

        script.push(33);
        script.extend_from_slice(&refund_key);
        script.push(OP_CHECKSIG);

        script.push(OP_ENDIF);

        let address = p2sh_address(&script);
        Ok((script, address))
    }

    fn funding_tx(&self, chain_id: u64, terms: &HtlcTerms) -> SwapResult<UnsignedTx> {
        let (script, address) = self.lock_script(terms)?;

        let mut body = vec![KIND_FUND];
        body.extend_from_slice(&terms.amount.to_be_bytes());
        body.extend_from_slice(&(script.len() as u16).to_be_bytes());
        body.extend_from_slice(&script);

        let payload = super::frame(&address, &body);
        Ok(UnsignedTx {
            chain_id,
            digest: sighash(&payload),
            payload,
        })
    }

    fn redeem_tx(
        &self,
        contract: &ContractRef,
        preimage: &[u8; SECRET_SIZE],
    ) -> SwapResult<UnsignedTx> {
        // Unlock: <preimage> OP_TRUE selects the hash branch. The
        // signature rides in the witness appended at finalize time.
        let mut body = vec![KIND_REDEEM];
        body.push(SECRET_SIZE as u8);
        body.extend_from_slice(preimage);
        body.push(opcodes::OP_TRUE);

        let payload = super::frame(&contract.lock_address, &body);
        Ok(UnsignedTx {
            chain_id: contract.chain_id,
            digest: sighash(&payload),
            payload,
        })
    }

    fn refund_tx(&self, contract: &ContractRef, chain_time: u64) -> SwapResult<UnsignedTx> {
        if chain_time < contract.expiry {
            return Err(SwapError::Contract(format!(
                "refund locked until {} (chain time {})",
                contract.expiry, chain_time
            )));
        }

        let mut body = vec![KIND_REFUND];
        body.extend_from_slice(&contract.expiry.to_be_bytes());
        body.push(opcodes::OP_FALSE);

        let payload = super::frame(&contract.lock_address, &body);
        Ok(UnsignedTx {
            chain_id: contract.chain_id,
            digest: sighash(&payload),
            payload,
        })
    }

    fn finalize(&self, tx: &UnsignedTx, signature: &[u8]) -> SwapResult<Vec<u8>> {
        if signature.is_empty() || signature.len() > u16::MAX as usize {
            return Err(SwapError::Contract("bad signature length".into()));
        }
        let mut payload = tx.payload.clone();
        payload.extend_from_slice(&(signature.len() as u16).to_be_bytes());
        payload.extend_from_slice(signature);
        Ok(payload)
    }

    fn classify_spend(&self, lock_address: &str, payload: &[u8]) -> SpendKind {
        let Some((address, body)) = super::parse_frame(payload) else {
            return SpendKind::Unrelated;
        };
        if address != lock_address || body.is_empty() {
            return SpendKind::Unrelated;
        }

        let rest = &body[1..];
        match body[0] {
            KIND_REDEEM => {
                // <32:preimage> OP_TRUE
                if rest.len() < 2 + SECRET_SIZE || rest[0] as usize != SECRET_SIZE {
                    return SpendKind::Unrelated;
                }
                if rest[1 + SECRET_SIZE] != opcodes::OP_TRUE {
                    return SpendKind::Unrelated;
                }
                let mut preimage = [0u8; SECRET_SIZE];
                preimage.copy_from_slice(&rest[1..1 + SECRET_SIZE]);
                SpendKind::Redeem { preimage }
            }
            KIND_REFUND => {
                if rest.len() < 9 || rest[8] != opcodes::OP_FALSE {
                    return SpendKind::Unrelated;
                }
                SpendKind::Refund
            }
            _ => SpendKind::Unrelated,
        }
    }

    fn check_funding(&self, expected: &ContractRef, payload: &[u8]) -> SwapResult<()> {
        let mismatch = |message: String| SwapError::FundingMismatch {
            chain_id: expected.chain_id,
            message,
        };

        let (address, body) =
            super::parse_frame(payload).ok_or_else(|| mismatch("unparseable funding".into()))?;
        if address != expected.lock_address {
            return Err(mismatch(format!(
                "funding pays {} instead of {}",
                address, expected.lock_address
            )));
        }
        if body.first() != Some(&KIND_FUND) {
            return Err(mismatch("not a funding transaction".into()));
        }
        if body.len() < 1 + 8 + 2 {
            return Err(mismatch("truncated funding".into()));
        }

        let amount = u64::from_be_bytes(body[1..9].try_into().unwrap());
        if amount != expected.amount {
            return Err(mismatch(format!(
                "amount {} != negotiated {}",
                amount, expected.amount
            )));
        }

        let script_len = u16::from_be_bytes(body[9..11].try_into().unwrap()) as usize;
        if body.len() < 11 + script_len || &body[11..11 + script_len] != expected.lock_script {
            return Err(mismatch("lock script differs from negotiated terms".into()));
        }

        Ok(())
    }
}

fn decode_pubkey(hex_key: &str) -> SwapResult<[u8; 33]> {
    let bytes = hex::decode(hex_key)
        .map_err(|e| SwapError::Contract(format!("invalid pubkey hex: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| SwapError::Contract("pubkey must be 33 bytes".into()))
}

fn sighash(payload: &[u8]) -> [u8; 32] {
    Sha256::digest(payload).into()
}

/// CLTV numeric encoding: minimal little-endian, sign-safe
fn encode_locktime(locktime: u64) -> Vec<u8> {
    if locktime == 0 {
        return vec![];
    }

    let mut bytes = locktime.to_le_bytes().to_vec();
    while bytes.len() > 1 && bytes.last() == Some(&0) {
        bytes.pop();
    }
    if bytes.last().map(|b| b & 0x80 != 0).unwrap_or(false) {
        bytes.push(0x00);
    }
    bytes
}

/// Base58check P2SH address of a lock script
fn p2sh_address(script: &[u8]) -> String {
    let sha = Sha256::digest(script);
    let hash160 = Ripemd160::digest(sha);

    let mut address_bytes = vec![0x05];
    address_bytes.extend_from_slice(&hash160);

    let checksum = &Sha256::digest(Sha256::digest(&address_bytes))[..4];
    address_bytes.extend_from_slice(checksum);

    bs58::encode(address_bytes).into_string()
}
