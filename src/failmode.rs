//! Fail-Mode Policy
//!
//! Decides what the agent answers when a portal call cannot complete
//! (portal error, timeout, or breaker open).
//!
//! - fail-open: allow, let ocserv apply its own default routes/DNS
//! - fail-close: deny with a generic "temporarily unavailable" reason
//! - fail-stale: tell the caller to try the stale-cache path; the caller
//!   denies if that misses

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::protocol::AuthRequest;
use crate::{AgentError, PolicyDecision, Result};

/// Deny reason used by fail-close
pub const UNAVAILABLE_REASON: &str = "authorization service temporarily unavailable";

/// Behaviour when the portal is unavailable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailMode {
    /// Allow connections. Development only.
    #[serde(rename = "fail-open", alias = "open")]
    Open,
    /// Deny connections
    #[serde(rename = "fail-close", alias = "close")]
    Close,
    /// Serve the last known decision from the stale cache, deny otherwise
    #[serde(rename = "fail-stale", alias = "stale")]
    Stale,
}

impl FailMode {
    /// Short tag used in response metadata
    pub fn tag(&self) -> &'static str {
        match self {
            FailMode::Open => "open",
            FailMode::Close => "close",
            FailMode::Stale => "stale",
        }
    }
}

impl fmt::Display for FailMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailMode::Open => write!(f, "fail-open"),
            FailMode::Close => write!(f, "fail-close"),
            FailMode::Stale => write!(f, "fail-stale"),
        }
    }
}

impl FromStr for FailMode {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fail-open" | "open" => Ok(FailMode::Open),
            "fail-close" | "close" => Ok(FailMode::Close),
            "fail-stale" | "stale" => Ok(FailMode::Stale),
            other => Err(AgentError::Config(format!(
                "invalid fail mode: {} (valid: fail-open, fail-close, fail-stale)",
                other
            ))),
        }
    }
}

/// Result of consulting the policy
#[derive(Debug)]
pub enum FailModeOutcome {
    /// Answer with this decision
    Synthetic(PolicyDecision),
    /// No synthetic answer; the caller must try the stale cache, then deny
    ConsultStale(AgentError),
}

impl FailModeOutcome {
    pub fn use_synthetic(&self) -> bool {
        matches!(self, FailModeOutcome::Synthetic(_))
    }
}

/// Runtime-mutable fail mode holder
#[derive(Debug)]
pub struct FailModePolicy {
    mode: RwLock<FailMode>,
}

impl FailModePolicy {
    pub fn new(mode: FailMode) -> Self {
        Self {
            mode: RwLock::new(mode),
        }
    }

    pub fn mode(&self) -> FailMode {
        *self.mode.read()
    }

    /// Change the mode at runtime
    pub fn set_mode(&self, mode: FailMode) {
        let mut current = self.mode.write();
        if *current != mode {
            tracing::info!(from = %*current, to = %mode, "fail mode changed");
            *current = mode;
        }
    }

    /// Decide the externally visible answer for a failed portal call
    pub fn resolve(&self, req: &AuthRequest, error: AgentError) -> FailModeOutcome {
        let mode = self.mode();
        match mode {
            FailMode::Open => {
                tracing::warn!(
                    username = %req.username,
                    client_ip = %req.ip_real,
                    error = %error,
                    "portal unavailable, allowing connection (fail-open mode)"
                );
                FailModeOutcome::Synthetic(
                    PolicyDecision {
                        allowed: true,
                        ..Default::default()
                    }
                    .with_fallback(mode, &error),
                )
            }
            FailMode::Close => {
                tracing::warn!(
                    username = %req.username,
                    client_ip = %req.ip_real,
                    error = %error,
                    "portal unavailable, denying connection (fail-close mode)"
                );
                FailModeOutcome::Synthetic(
                    PolicyDecision::deny(UNAVAILABLE_REASON).with_fallback(mode, &error),
                )
            }
            FailMode::Stale => {
                tracing::info!(
                    username = %req.username,
                    client_ip = %req.ip_real,
                    error = %error,
                    "portal unavailable, signaling stale cache usage (fail-stale mode)"
                );
                FailModeOutcome::ConsultStale(AgentError::StaleFallback(Box::new(error)))
            }
        }
    }
}

impl Default for FailModePolicy {
    fn default() -> Self {
        Self::new(FailMode::Stale)
    }
}

/// Reject fail-open in production. Intended as a startup check.
pub fn validate_fail_mode(mode: FailMode, environment: &str) -> Result<()> {
    if mode == FailMode::Open && environment == "production" {
        return Err(AgentError::Config(
            "fail-open mode is not allowed in production (security risk)".into(),
        ));
    }
    Ok(())
}

/// Recommended fail mode for a deployment environment
pub fn recommended_fail_mode(environment: &str) -> FailMode {
    match environment {
        "production" | "staging" => FailMode::Stale,
        "development" => FailMode::Open,
        _ => FailMode::Close,
    }
}
