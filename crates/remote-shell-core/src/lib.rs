//! Core abstractions for brokered remote-shell sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `TargetIdentity` - Key identifying the instance a session is bound to
//! - `TransportAdapter` - Seam to the secure-shell client library
//! - `Dispatcher` - Marshaling boundary onto the controlling context
//! - `EventHub` - Broadcast + history fan-out for session and lifecycle events
//! - Error taxonomy and transport fault classification

pub mod classify;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod event_hub;
pub mod identity;
pub mod traits;

pub use classify::{LOST_CONNECTION_FAULTS, classify};
pub use config::{ConfigError, SessionConfig};
pub use dispatch::{Controller, ControllerClosed, Dispatcher};
pub use error::{
    ConnectError, ErrorClass, FaultCode, Remediation, SessionError, TransportError,
};
pub use event::{AbortCause, LifecycleEvent, SessionEvent};
pub use event_hub::{EventHub, Observer, SubscriptionId};
pub use identity::{
    AuthorizationMethod, ConnectionTarget, CredentialMaterial, IdentityParseError, TargetIdentity,
    TerminalGeometry,
};
pub use traits::{
    ActivationSurface, OpenRequest, SessionId, Status, TransportAdapter, TransportCallbacks,
    TransportFactory,
};
