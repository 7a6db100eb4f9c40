//! Seams to external collaborators: the transport and the presentation surface.

use std::{fmt, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{CredentialMaterial, TerminalGeometry, TransportError};

/// Session identifier.
pub type SessionId = Uuid;

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Created, no connect attempted yet.
    Idle,
    /// A connect attempt is outstanding.
    Connecting,
    /// Shell channel is open.
    Connected,
    /// An established connection dropped. Reconnect with a new connect.
    ConnectionLost,
    /// Connect or connection failed. Terminal.
    ConnectionFailed,
    /// Closed by the caller. Terminal.
    Disconnected,
}

impl Status {
    /// Terminal statuses end the session instance.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::ConnectionFailed | Self::Disconnected)
    }

    #[must_use]
    pub const fn shows_spinner(self) -> bool {
        matches!(self, Self::Connecting)
    }

    #[must_use]
    pub const fn shows_terminal(self) -> bool {
        matches!(self, Self::Connected)
    }

    #[must_use]
    pub const fn shows_reconnect_panel(self) -> bool {
        matches!(self, Self::ConnectionLost)
    }
}

/// Parameters for opening a shell channel.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub endpoint: SocketAddr,
    pub credential: CredentialMaterial,
    /// Value for the remote `TERM`.
    pub terminal_kind: String,
    pub geometry: TerminalGeometry,
    pub locale: Option<String>,
    /// Client identification banner.
    pub banner: Option<String>,
}

type DataFn = dyn Fn(String) + Send + Sync;
type ErrorFn = dyn Fn(TransportError) + Send + Sync;

/// Callbacks installed into a transport adapter on open.
///
/// The adapter may invoke them from any thread, any number of times, until
/// `TransportAdapter::dispose` returns.
#[derive(Clone)]
pub struct TransportCallbacks {
    on_data: Arc<DataFn>,
    on_error: Arc<ErrorFn>,
}

impl TransportCallbacks {
    #[must_use]
    pub fn new(
        on_data: impl Fn(String) + Send + Sync + 'static,
        on_error: impl Fn(TransportError) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_data: Arc::new(on_data),
            on_error: Arc::new(on_error),
        }
    }

    /// Report data received from the remote shell.
    pub fn data(&self, data: String) {
        (self.on_data)(data);
    }

    /// Report an asynchronous fault.
    pub fn error(&self, error: TransportError) {
        (self.on_error)(error);
    }
}

impl fmt::Debug for TransportCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportCallbacks").finish_non_exhaustive()
    }
}

/// Secure-shell channel to one remote host.
///
/// Implemented by the transport library; one instance per connect attempt.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Connect, authenticate and open an interactive shell channel.
    async fn open(
        &self,
        request: OpenRequest,
        callbacks: TransportCallbacks,
    ) -> Result<(), TransportError>;

    /// Write to the shell's input.
    async fn send(&self, payload: &str) -> Result<(), TransportError>;

    /// Change the remote terminal size.
    async fn resize(&self, geometry: TerminalGeometry) -> Result<(), TransportError>;

    /// Tear the channel down. Called exactly once per instance; must return
    /// promptly and must not invoke callbacks after returning.
    fn dispose(&self);
}

/// Creates transport adapters.
pub trait TransportFactory: Send + Sync {
    /// Create a fresh, unopened adapter.
    fn create(&self) -> Arc<dyn TransportAdapter>;
}

/// Presentation surface that can bring a session to the foreground.
///
/// Invoked on the controlling context.
pub trait ActivationSurface<H>: Send + Sync {
    fn show(&self, session: &H);
}
