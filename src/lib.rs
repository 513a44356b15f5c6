//! Atomic swap network node
//!
//! The swap protocol engine: per-swap state machines, the signed
//! peer-to-peer negotiation protocol, chain-agnostic HTLC construction,
//! and per-leg chain monitors that drive state transitions. Wallets,
//! chain RPC clients and the p2p transport are external collaborators
//! behind the `Signer`, `ChainAdapter` and `PeerTransport` traits.

pub mod api;
pub mod chain;
pub mod config;
pub mod contract;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod secret;
pub mod signer;
pub mod state;
pub mod swap;
