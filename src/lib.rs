//! ocserv Agent Authorization Core
//!
//! This is the decision path behind the ocserv connect-script.
//! For every connect attempt it answers "may this user connect?":
//! - Wire protocol (length-prefixed JSON over a Unix socket)
//! - Decision cache with TTL and stale windows
//! - Circuit breaker guarding portal calls
//! - Fail-mode policy for when the portal cannot be reached
//!
//! The answer must arrive well inside ocserv's own connect-script
//! timeout, whatever state the portal is in.

pub mod breaker;
pub mod cache;
pub mod config;
pub mod error;
pub mod failmode;
pub mod fingerprint;
pub mod handler;
pub mod ipc;
pub mod portal;
pub mod protocol;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use cache::{CacheConfig, DecisionCache};
pub use config::AgentConfig;
pub use error::AgentError;
pub use failmode::{FailMode, FailModePolicy};
pub use handler::AuthHandler;
pub use portal::{PortalClient, PortalVerdict};
pub use protocol::{AuthRequest, AuthResponse};

use std::collections::BTreeMap;

/// Agent version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default IPC socket path
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/ocserv-agent.sock";

/// Result type for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Why the connect-script was invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Reason {
    Connect,
    Disconnect,
    HostUpdate,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Connect => "connect",
            Reason::Disconnect => "disconnect",
            Reason::HostUpdate => "host-update",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Reason {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "connect" => Ok(Reason::Connect),
            "disconnect" => Ok(Reason::Disconnect),
            "host-update" => Ok(Reason::HostUpdate),
            other => Err(AgentError::Validation(format!("invalid reason: {}", other))),
        }
    }
}

/// Authorization decision, as cached and as synthesized by the fail-mode policy
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    #[serde(default)]
    pub deny_reason: String,
    /// Empty means "use ocserv's configured routes"
    #[serde(default)]
    pub routes: Vec<String>,
    /// Empty means "use ocserv's configured DNS"
    #[serde(default)]
    pub dns_servers: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            ..Default::default()
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            deny_reason: reason.into(),
            ..Default::default()
        }
    }

    /// Tag as a fallback answer produced under `mode` because of `error`
    pub fn with_fallback(mut self, mode: FailMode, error: &AgentError) -> Self {
        self.metadata.insert("fallback".into(), "true".into());
        self.metadata.insert("fail_mode".into(), mode.tag().into());
        self.metadata.insert("portal_error".into(), error.to_string());
        self
    }
}

impl From<PortalVerdict> for PolicyDecision {
    fn from(verdict: PortalVerdict) -> Self {
        Self {
            allowed: verdict.allowed,
            deny_reason: verdict.reason,
            routes: verdict.routes,
            dns_servers: verdict.dns_servers,
            metadata: BTreeMap::new(),
        }
    }
}
