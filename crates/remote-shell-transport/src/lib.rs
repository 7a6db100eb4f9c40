//! Transport adapters for remote-shell sessions.
//!
//! Provides:
//! - Loopback transport (feature: loopback), an in-process stand-in for a
//!   secure-shell channel whose remote end is driven by the caller

#[cfg(feature = "loopback")]
pub mod loopback;

#[cfg(feature = "loopback")]
pub use loopback::{LoopbackFactory, LoopbackRemote, LoopbackTransport, OpenPlan};
