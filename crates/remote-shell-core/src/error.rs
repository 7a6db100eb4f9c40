//! Error taxonomy for transport faults, connect failures and session calls.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ControllerClosed;

/// Fault code reported by the secure-shell library.
///
/// Raw values follow the libssh2 error numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultCode {
    KexFailure,
    SocketSend,
    Timeout,
    SocketDisconnect,
    AuthenticationFailed,
    PublickeyUnverified,
    ChannelFailure,
    SocketTimeout,
    SocketRecv,
    Other(i32),
}

impl FaultCode {
    /// Map a raw library error number to a fault code.
    #[must_use]
    pub const fn from_raw(code: i32) -> Self {
        match code {
            -5 => Self::KexFailure,
            -7 => Self::SocketSend,
            -9 => Self::Timeout,
            -13 => Self::SocketDisconnect,
            -18 => Self::AuthenticationFailed,
            -19 => Self::PublickeyUnverified,
            -21 => Self::ChannelFailure,
            -30 => Self::SocketTimeout,
            -43 => Self::SocketRecv,
            other => Self::Other(other),
        }
    }

    /// Raw library error number.
    #[must_use]
    pub const fn raw(self) -> i32 {
        match self {
            Self::KexFailure => -5,
            Self::SocketSend => -7,
            Self::Timeout => -9,
            Self::SocketDisconnect => -13,
            Self::AuthenticationFailed => -18,
            Self::PublickeyUnverified => -19,
            Self::ChannelFailure => -21,
            Self::SocketTimeout => -30,
            Self::SocketRecv => -43,
            Self::Other(code) => code,
        }
    }
}

/// Error reported by a transport adapter, either from a call or through its
/// error callback.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message} ({code:?})")]
pub struct TransportError {
    pub code: FaultCode,
    pub message: String,
}

impl TransportError {
    #[must_use]
    pub fn new(code: FaultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Classification of a transport fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Established connection dropped; recoverable by reconnecting.
    LostConnection,
    /// Credential rejected by the target.
    AuthorizationDenied,
    /// Anything else.
    TransportFault,
}

/// Guidance shown to the user when access is denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remediation {
    pub summary: String,
    pub steps: Vec<String>,
    pub help_url: String,
}

impl fmt::Display for Remediation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary)
    }
}

/// Connect or connection-level failure.
#[derive(Debug, Clone, Error)]
pub enum ConnectError {
    #[error("Connection lost: {0}")]
    TransientConnectionLoss(#[source] TransportError),
    #[error("Authorization denied: {remediation}")]
    AuthorizationDenied {
        remediation: Remediation,
        #[source]
        source: TransportError,
    },
    #[error("Transport error: {0}")]
    TransportFault(#[source] TransportError),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Connection attempt was cancelled")]
    Cancelled,
}

impl ConnectError {
    /// Fault class, if this error came from the transport.
    #[must_use]
    pub const fn class(&self) -> Option<ErrorClass> {
        match self {
            Self::TransientConnectionLoss(_) => Some(ErrorClass::LostConnection),
            Self::AuthorizationDenied { .. } => Some(ErrorClass::AuthorizationDenied),
            Self::TransportFault(_) => Some(ErrorClass::TransportFault),
            Self::InvalidState(_) | Self::Cancelled => None,
        }
    }

    /// The underlying transport fault, if any.
    #[must_use]
    pub const fn transport_error(&self) -> Option<&TransportError> {
        match self {
            Self::TransientConnectionLoss(e)
            | Self::AuthorizationDenied { source: e, .. }
            | Self::TransportFault(e) => Some(e),
            Self::InvalidState(_) | Self::Cancelled => None,
        }
    }

    #[must_use]
    pub const fn remediation(&self) -> Option<&Remediation> {
        match self {
            Self::AuthorizationDenied { remediation, .. } => Some(remediation),
            _ => None,
        }
    }
}

impl From<ControllerClosed> for ConnectError {
    fn from(_: ControllerClosed) -> Self {
        Self::InvalidState("broker has shut down".to_string())
    }
}

/// Error from `send`/`resize` on a session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session is not connected")]
    NotConnected,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
