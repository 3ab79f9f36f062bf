//! Request Handler
//!
//! Validates connect-script requests and runs the decision pipeline:
//!
//! ```text
//! cache hit ─────────────────────────────────────────────▶ respond (cache)
//! cache miss ─▶ breaker ─▶ portal ─ ok ─▶ cache.set ─────▶ respond (portal)
//!                                  └ error / open / timeout
//!                                        ─▶ fail-mode ───▶ respond (fallback)
//!                                             └ stale ─▶ cache.get_stale
//!                                                   hit ─▶ respond (stale-cache)
//!                                                   miss ─▶ deny (fallback)
//! ```
//!
//! Upstream failures never reach the peer as raw errors: every path ends in
//! a well-formed [`AuthResponse`] written before the connection deadline.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{timeout, timeout_at, Instant};

use crate::breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};
use crate::cache::{CacheStats, DecisionCache};
use crate::failmode::{FailMode, FailModeOutcome, FailModePolicy};
use crate::fingerprint::CacheKey;
use crate::portal::PortalClient;
use crate::protocol::{AuthRequest, AuthResponse, FrameCodec, MAX_MESSAGE_SIZE};
use crate::{AgentError, PolicyDecision, Reason, Result};

/// Deny reason when the portal is down and no stale decision exists
pub const NO_CACHED_DECISION: &str = "portal unavailable and no cached decision";

/// Handler configuration
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Whole-connection budget. Must stay under ocserv's connect-script timeout.
    pub connection_timeout: Duration,
    /// Upper bound for a single portal call
    pub portal_timeout: Duration,
    /// Part of the connection budget kept back for writing the response
    pub response_reserve: Duration,
    pub max_frame_size: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(3),
            portal_timeout: Duration::from_secs(2),
            response_reserve: Duration::from_millis(250),
            max_frame_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl HandlerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.response_reserve >= self.connection_timeout {
            return Err(AgentError::Config(format!(
                "response_reserve ({:?}) must be shorter than connection_timeout ({:?})",
                self.response_reserve, self.connection_timeout
            )));
        }
        if self.portal_timeout.is_zero() {
            return Err(AgentError::Config("portal_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Where an answer came from (the `source` audit tag)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    Portal,
    Cache,
    StaleCache,
    Fallback,
    Local,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionSource::Portal => "portal",
            DecisionSource::Cache => "cache",
            DecisionSource::StaleCache => "stale-cache",
            DecisionSource::Fallback => "fallback",
            DecisionSource::Local => "local",
        }
    }
}

/// Diagnostics for the administrative surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStats {
    pub cache: CacheStats,
    pub breaker: BreakerSnapshot,
    pub fail_mode: FailMode,
}

/// Connect-script request handler
pub struct AuthHandler {
    portal: Arc<dyn PortalClient>,
    cache: Arc<DecisionCache<PolicyDecision>>,
    breaker: CircuitBreaker,
    fail_mode: FailModePolicy,
    codec: FrameCodec,
    config: HandlerConfig,
}

impl AuthHandler {
    pub fn new(
        config: HandlerConfig,
        portal: Arc<dyn PortalClient>,
        cache: Arc<DecisionCache<PolicyDecision>>,
        breaker: CircuitBreaker,
        fail_mode: FailMode,
    ) -> Self {
        Self {
            portal,
            cache,
            breaker,
            fail_mode: FailModePolicy::new(fail_mode),
            codec: FrameCodec::new(config.max_frame_size),
            config,
        }
    }

    /// Serve one connection: read a request, decide, write a response.
    ///
    /// The deadline is set once from `connection_timeout` and never extended.
    pub async fn handle_connection<S>(&self, mut stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let start = Instant::now();
        let deadline = start + self.config.connection_timeout;
        let respond_by = deadline - self.config.response_reserve;

        let req: AuthRequest =
            match timeout_at(respond_by, self.codec.read_message(&mut stream)).await {
                Ok(Ok(req)) => req,
                Ok(Err(AgentError::ConnectionClosed)) => {
                    tracing::debug!("peer closed connection before sending a request");
                    return;
                }
                Ok(Err(e)) => {
                    tracing::error!(error = %e, kind = e.kind(), "failed to read request");
                    self.write_response(&mut stream, &read_failure(), deadline).await;
                    return;
                }
                Err(_) => {
                    tracing::error!(error_kind = "deadline", "timed out reading request");
                    self.write_response(&mut stream, &read_failure(), deadline).await;
                    return;
                }
            };

        tracing::info!(
            reason = %req.reason,
            username = %req.username,
            group = %req.groupname,
            client_ip = %req.ip_real,
            vpn_ip = %req.ip_remote,
            session_id = %req.session_id,
            "processing auth request"
        );

        let resp = self.process(&req, respond_by).await;

        if !self.write_response(&mut stream, &resp, deadline).await {
            return;
        }

        tracing::info!(
            username = %req.username,
            allowed = resp.allowed,
            source = resp.source().unwrap_or("unknown"),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "request processed"
        );
    }

    /// Decide a request. Always returns a response by `respond_by`.
    pub async fn process(&self, req: &AuthRequest, respond_by: Instant) -> AuthResponse {
        let reason = match validate(req) {
            Ok(reason) => reason,
            Err(e) => {
                tracing::warn!(username = %req.username, error = %e, "rejecting invalid request");
                return AuthResponse::deny(e.to_string())
                    .with_meta("source", DecisionSource::Local.as_str());
            }
        };

        if reason != Reason::Connect {
            return AuthResponse::allow(format!("reason={} logged", reason))
                .with_meta("source", DecisionSource::Local.as_str());
        }

        let key = CacheKey::for_request(req);
        if let Some(decision) = self.cache.get(&key) {
            tracing::debug!(username = %req.username, from_cache = true, "using cached decision");
            return respond(decision, DecisionSource::Cache);
        }

        match self.check_portal(req, respond_by).await {
            Ok(decision) => {
                self.cache.set(&key, decision.clone());
                respond(decision, DecisionSource::Portal)
            }
            Err(e) => self.fallback(req, &key, e),
        }
    }

    /// Portal call through the breaker.
    ///
    /// Only portal-side outcomes (an error, or `portal_timeout` elapsing)
    /// count against the breaker. Running out of connection budget gives
    /// the admission back without an outcome.
    async fn check_portal(&self, req: &AuthRequest, respond_by: Instant) -> Result<PolicyDecision> {
        let admission = self.breaker.admit().ok_or(AgentError::CircuitOpen)?;
        let limit = self.config.portal_timeout;
        let call = timeout(
            limit,
            self.portal.check_policy(&req.username, &req.groupname, &req.ip_real),
        );

        match timeout_at(respond_by, call).await {
            Ok(Ok(Ok(verdict))) => {
                admission.success();
                Ok(verdict.into())
            }
            Ok(Ok(Err(e))) => {
                admission.failure();
                Err(e)
            }
            Ok(Err(_)) => {
                admission.failure();
                Err(AgentError::PortalTimeout(limit))
            }
            Err(_) => {
                admission.cancel();
                Err(AgentError::DeadlineExceeded)
            }
        }
    }

    fn fallback(&self, req: &AuthRequest, key: &CacheKey, error: AgentError) -> AuthResponse {
        tracing::warn!(
            username = %req.username,
            error = %error,
            error_kind = error.kind(),
            temporary = error.is_temporary(),
            breaker_state = %self.breaker.state(),
            "portal check failed, applying fail mode"
        );

        match self.fail_mode.resolve(req, error) {
            FailModeOutcome::Synthetic(decision) => respond(decision, DecisionSource::Fallback),
            FailModeOutcome::ConsultStale(err) => {
                let trigger = match err {
                    AgentError::StaleFallback(inner) => *inner,
                    other => other,
                };

                match self.cache.get_stale(key) {
                    Some(decision) => {
                        tracing::warn!(
                            username = %req.username,
                            allowed = decision.allowed,
                            "portal unavailable, using stale cache"
                        );
                        respond(
                            decision.with_fallback(FailMode::Stale, &trigger),
                            DecisionSource::StaleCache,
                        )
                    }
                    None => {
                        tracing::warn!(
                            username = %req.username,
                            "portal unavailable, no cached decision, denying"
                        );
                        respond(
                            PolicyDecision::deny(NO_CACHED_DECISION)
                                .with_fallback(FailMode::Stale, &trigger),
                            DecisionSource::Fallback,
                        )
                    }
                }
            }
        }
    }

    /// Returns false if the response could not be written
    async fn write_response<S>(&self, stream: &mut S, resp: &AuthResponse, deadline: Instant) -> bool
    where
        S: AsyncWrite + Unpin,
    {
        match timeout_at(deadline, self.codec.write_message(stream, resp)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!(error = %e, error_kind = "write", "failed to write response");
                false
            }
            Err(_) => {
                tracing::error!(error_kind = "deadline", "timed out writing response");
                false
            }
        }
    }

    // Administrative surface

    /// Drop every cached decision for `username` (e.g. on account disablement)
    pub fn invalidate_user(&self, username: &str) -> usize {
        self.cache.invalidate_user(username)
    }

    pub fn set_fail_mode(&self, mode: FailMode) {
        self.fail_mode.set_mode(mode);
    }

    pub fn fail_mode(&self) -> FailMode {
        self.fail_mode.mode()
    }

    pub fn reset_breaker(&self) {
        self.breaker.reset();
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            cache: self.cache.stats(),
            breaker: self.breaker.snapshot(),
            fail_mode: self.fail_mode.mode(),
        }
    }
}

/// Required fields and a recognised reason
fn validate(req: &AuthRequest) -> Result<Reason> {
    if req.username.is_empty() {
        return Err(AgentError::Validation("username is required".into()));
    }
    if req.reason.is_empty() {
        return Err(AgentError::Validation("reason is required".into()));
    }
    req.reason.parse()
}

fn read_failure() -> AuthResponse {
    AuthResponse::deny("failed to read request").with_meta("source", DecisionSource::Local.as_str())
}

fn respond(decision: PolicyDecision, source: DecisionSource) -> AuthResponse {
    let error = if decision.allowed {
        None
    } else if decision.deny_reason.is_empty() {
        Some("access denied".to_string())
    } else {
        Some(decision.deny_reason)
    };

    let message = match (source, decision.allowed) {
        (DecisionSource::Fallback, true) => {
            Some("portal unavailable, access granted (fail-open mode)".to_string())
        }
        (DecisionSource::StaleCache, _) => {
            Some("portal unavailable, served cached decision".to_string())
        }
        _ => None,
    };

    let mut metadata = decision.metadata;
    metadata.insert("source".into(), source.as_str().into());
    metadata.insert("decided_at".into(), chrono::Utc::now().to_rfc3339());

    AuthResponse {
        allowed: decision.allowed,
        error,
        message,
        metadata,
    }
}
