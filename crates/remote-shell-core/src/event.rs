//! Lifecycle and per-session events.

use serde::{Deserialize, Serialize};

use crate::{ConnectError, ErrorClass, Remediation, Status, TargetIdentity};

/// Why a session was aborted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortCause {
    pub class: ErrorClass,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<Remediation>,
}

impl AbortCause {
    /// Build the cause from a classified connect error.
    ///
    /// Errors without a transport class are reported as transport faults.
    #[must_use]
    pub fn from_error(error: &ConnectError) -> Self {
        Self {
            class: error.class().unwrap_or(ErrorClass::TransportFault),
            message: error.to_string(),
            remediation: error.remediation().cloned(),
        }
    }
}

/// Session lifecycle event, published to broker observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Shell channel opened.
    Started { identity: TargetIdentity },
    /// Transport released by the caller.
    Ended { identity: TargetIdentity },
    /// Connect failed or the connection broke.
    Aborted {
        identity: TargetIdentity,
        cause: AbortCause,
    },
}

impl LifecycleEvent {
    #[must_use]
    pub const fn identity(&self) -> &TargetIdentity {
        match self {
            Self::Started { identity } | Self::Ended { identity } | Self::Aborted { identity, .. } => {
                identity
            }
        }
    }

    #[must_use]
    pub const fn is_started(&self) -> bool {
        matches!(self, Self::Started { .. })
    }

    #[must_use]
    pub const fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    /// Abort class, if this is an `Aborted` event.
    #[must_use]
    pub const fn abort_class(&self) -> Option<ErrorClass> {
        match self {
            Self::Aborted { cause, .. } => Some(cause.class),
            _ => None,
        }
    }
}

/// Event observed on a single session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Status committed.
    StatusChanged(Status),
    /// Output from the remote shell.
    DataReceived(String),
    /// Connect failed, or an established connection failed fatally.
    ConnectionFailed(ConnectError),
    /// An established connection dropped.
    ConnectionLost(ConnectError),
}
