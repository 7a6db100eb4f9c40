//! Target identity and the parameters needed to reach it.

use std::{fmt, net::SocketAddr, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifies the VM instance a session is bound to.
///
/// Immutable once created. Two identities are equal iff project, zone and
/// instance name all match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetIdentity {
    project: String,
    zone: String,
    instance: String,
}

impl TargetIdentity {
    /// Create a new identity.
    #[must_use]
    pub fn new(
        project: impl Into<String>,
        zone: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            zone: zone.into(),
            instance: instance.into(),
        }
    }

    #[must_use]
    pub fn project(&self) -> &str {
        &self.project
    }

    #[must_use]
    pub fn zone(&self) -> &str {
        &self.zone
    }

    #[must_use]
    pub fn instance(&self) -> &str {
        &self.instance
    }
}

impl fmt::Display for TargetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/zones/{}/instances/{}",
            self.project, self.zone, self.instance
        )
    }
}

/// Identity parse error.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid target identity: {0}")]
pub struct IdentityParseError(String);

impl FromStr for TargetIdentity {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            ["projects", project, "zones", zone, "instances", instance]
                if !project.is_empty() && !zone.is_empty() && !instance.is_empty() =>
            {
                Ok(Self::new(*project, *zone, *instance))
            }
            _ => Err(IdentityParseError(s.to_string())),
        }
    }
}

/// Terminal size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalGeometry {
    pub columns: u16,
    pub rows: u16,
}

impl TerminalGeometry {
    #[must_use]
    pub const fn new(columns: u16, rows: u16) -> Self {
        Self { columns, rows }
    }
}

impl Default for TerminalGeometry {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

/// How the credential's public key was authorized on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationMethod {
    /// Key pushed into instance metadata.
    InstanceMetadata,
    /// Key pushed into project-wide metadata.
    ProjectMetadata,
    /// Key registered with OS Login.
    OsLogin,
}

/// Credential presented to the transport when opening a channel.
///
/// Issued by an external authorization service; the core only carries it.
#[derive(Clone)]
pub struct CredentialMaterial {
    pub username: String,
    pub private_key: Arc<str>,
    pub method: AuthorizationMethod,
}

impl CredentialMaterial {
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        private_key: impl Into<Arc<str>>,
        method: AuthorizationMethod,
    ) -> Self {
        Self {
            username: username.into(),
            private_key: private_key.into(),
            method,
        }
    }
}

impl fmt::Debug for CredentialMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialMaterial")
            .field("username", &self.username)
            .field("private_key", &"[REDACTED]")
            .field("method", &self.method)
            .finish()
    }
}

/// Everything needed to open a session to one target.
#[derive(Debug, Clone)]
pub struct ConnectionTarget {
    pub identity: TargetIdentity,
    pub endpoint: SocketAddr,
    pub credential: CredentialMaterial,
}

impl ConnectionTarget {
    #[must_use]
    pub const fn new(
        identity: TargetIdentity,
        endpoint: SocketAddr,
        credential: CredentialMaterial,
    ) -> Self {
        Self {
            identity,
            endpoint,
            credential,
        }
    }
}
