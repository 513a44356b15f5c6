//! Swap engine: per-swap state machines and their single dispatch point

pub mod manager;
pub mod session;

pub use manager::{SwapManager, SwapStatus};
pub use session::{
    leg_terms, SessionEvent, SessionLimits, SwapAction, SwapRecord, SwapSession, SwapState,
};
