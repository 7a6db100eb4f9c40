//! Session orchestration for brokered remote shells.
//!
//! Provides:
//! - `Broker` - One live session per target, activation and lifecycle fan-out
//! - `SessionHandle` - Connect, send, resize and observe a single session

pub mod broker;
mod session;

pub use broker::{Broker, DetachedSurface, SessionInfo};
pub use session::SessionHandle;
