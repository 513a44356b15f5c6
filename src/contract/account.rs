//! HTLC construction for account-based (contract) ledgers
//!
//! The lock is an HTLC contract instance addressed by the keccak-256 of
//! its immutable arguments. Transactions are framed as the target address
//! followed by selector-prefixed calldata: a 4-byte keccak selector and
//! 32-byte argument words.

use sha3::{Digest, Keccak256};

use super::{ContractBuilder, ContractRef, HtlcTerms, SpendKind, UnsignedTx};
use crate::config::ChainFamily;
use crate::error::{SwapError, SwapResult};
use crate::secret::SECRET_SIZE;

pub struct AccountBuilder;

impl AccountBuilder {
    pub fn new() -> Self {
        AccountBuilder
    }
}

impl Default for AccountBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn selector(signature: &str) -> [u8; 4] {
    let digest = Keccak256::digest(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

lazy_static::lazy_static! {
    static ref SEL_NEW_CONTRACT: [u8; 4] =
        selector("newContract(bytes32,bytes32,bytes32,uint256,uint256)");
    static ref SEL_REDEEM: [u8; 4] = selector("redeem(bytes32,bytes32)");
    static ref SEL_REFUND: [u8; 4] = selector("refund(bytes32)");
}

/// Left-pad a value into a 32-byte argument word
fn word_from(bytes: &[u8]) -> SwapResult<[u8; 32]> {
    if bytes.len() > 32 {
        return Err(SwapError::Contract("argument exceeds one word".into()));
    }
    let mut word = [0u8; 32];
    word[32 - bytes.len()..].copy_from_slice(bytes);
    Ok(word)
}

fn word_u64(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

fn key_word(hex_key: &str) -> SwapResult<[u8; 32]> {
    let bytes =
        hex::decode(hex_key).map_err(|e| SwapError::Contract(format!("invalid key hex: {}", e)))?;
    // Account chains address parties by hash of the key when the raw key
    // does not fit a word
    if bytes.len() > 32 {
        Ok(Keccak256::digest(&bytes).into())
    } else {
        word_from(&bytes)
    }
}

/// Immutable contract arguments; the instance address derives from them
fn contract_args(terms: &HtlcTerms) -> SwapResult<Vec<u8>> {
    let mut args = Vec::with_capacity(5 * 32);
    args.extend_from_slice(&terms.secret_hash.0);
    args.extend_from_slice(&key_word(&terms.redeem_key)?);
    args.extend_from_slice(&key_word(&terms.refund_key)?);
    args.extend_from_slice(&word_u64(terms.expiry));
    args.extend_from_slice(&word_u64(terms.amount));
    Ok(args)
}

fn instance_address(args: &[u8]) -> String {
    let digest = Keccak256::digest(args);
    format!("0x{}", hex::encode(&digest[12..]))
}

use super::{frame, parse_frame};

fn tx_digest(payload: &[u8]) -> [u8; 32] {
    Keccak256::digest(payload).into()
}

impl ContractBuilder for AccountBuilder {
    fn family(&self) -> ChainFamily {
        ChainFamily::Account
    }

    fn lock_script(&self, terms: &HtlcTerms) -> SwapResult<(Vec<u8>, String)> {
        let args = contract_args(terms)?;
        let address = instance_address(&args);
        Ok((args, address))
    }

    fn funding_tx(&self, chain_id: u64, terms: &HtlcTerms) -> SwapResult<UnsignedTx> {
        let (args, address) = self.lock_script(terms)?;

        let mut calldata = SEL_NEW_CONTRACT.to_vec();
        calldata.extend_from_slice(&args);

        let payload = frame(&address, &calldata);
        Ok(UnsignedTx {
            chain_id,
            digest: tx_digest(&payload),
            payload,
        })
    }

    fn redeem_tx(
        &self,
        contract: &ContractRef,
        preimage: &[u8; SECRET_SIZE],
    ) -> SwapResult<UnsignedTx> {
        if contract.lock_script.len() < 32 {
            return Err(SwapError::Contract("malformed contract args".into()));
        }

        let mut calldata = SEL_REDEEM.to_vec();
        calldata.extend_from_slice(&contract.lock_script[..32]); // secret hash word
        calldata.extend_from_slice(preimage);

        let payload = frame(&contract.lock_address, &calldata);
        Ok(UnsignedTx {
            chain_id: contract.chain_id,
            digest: tx_digest(&payload),
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
        if contract.lock_script.len() < 32 {
            return Err(SwapError::Contract("malformed contract args".into()));
        }

        let mut calldata = SEL_REFUND.to_vec();
        calldata.extend_from_slice(&contract.lock_script[..32]);

        let payload = frame(&contract.lock_address, &calldata);
        Ok(UnsignedTx {
            chain_id: contract.chain_id,
            digest: tx_digest(&payload),
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
        let Some((address, calldata)) = parse_frame(payload) else {
            return SpendKind::Unrelated;
        };
        if address != lock_address || calldata.len() < 4 {
            return SpendKind::Unrelated;
        }

        let sel = &calldata[..4];
        if sel == &SEL_REDEEM[..] {
            // redeem(bytes32 hash, bytes32 preimage)
            if calldata.len() < 4 + 32 + SECRET_SIZE {
                return SpendKind::Unrelated;
            }
            let mut preimage = [0u8; SECRET_SIZE];
            preimage.copy_from_slice(&calldata[4 + 32..4 + 32 + SECRET_SIZE]);
            SpendKind::Redeem { preimage }
        } else if sel == &SEL_REFUND[..] {
            SpendKind::Refund
        } else {
            SpendKind::Unrelated
        }
    }

    fn check_funding(&self, expected: &ContractRef, payload: &[u8]) -> SwapResult<()> {
        let mismatch = |message: String| SwapError::FundingMismatch {
            chain_id: expected.chain_id,
            message,
        };

        let (address, calldata) =
            parse_frame(payload).ok_or_else(|| mismatch("unparseable funding".into()))?;
        if address != expected.lock_address {
            return Err(mismatch(format!(
                "funding targets {} instead of {}",
                address, expected.lock_address
            )));
        }
        if calldata.len() < 4 || calldata[..4] != SEL_NEW_CONTRACT[..] {
            return Err(mismatch("not a contract instantiation".into()));
        }
        // the argument blob carries hash, keys, expiry and amount
        if &calldata[4..] != expected.lock_script {
            return Err(mismatch("contract arguments differ from negotiated terms".into()));
        }
        Ok(())
    }
}
