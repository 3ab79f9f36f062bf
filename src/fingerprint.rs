//! Request Fingerprinting
//!
//! This module derives the decision-cache key from a connect request.
//! The fingerprint covers the identifying fields only, in a fixed order:
//! - username
//! - groupname
//! - client (real) IP
//!
//! Session-specific fields (VPN IP, device, session id) are excluded so
//! that reconnects of the same user from the same address share a decision.
//!
//! This is a hot path component - runs on every connect request.

use sha2::{Digest, Sha256};
use std::fmt;

use crate::protocol::AuthRequest;

/// Field separator. Unit separator cannot appear in ocserv identifiers.
const SEPARATOR: u8 = 0x1f;

/// Pre-hashed cache key (first 8 bytes of SHA-256 over the identifying fields)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Fingerprint of a request's identifying fields
    pub fn of(req: &AuthRequest) -> Self {
        Self::from_parts(&req.username, &req.groupname, &req.ip_real)
    }

    /// Fingerprint from raw field values
    pub fn from_parts(username: &str, groupname: &str, client_ip: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(username.as_bytes());
        hasher.update([SEPARATOR]);
        hasher.update(groupname.as_bytes());
        hasher.update([SEPARATOR]);
        hasher.update(client_ip.as_bytes());
        let digest = hasher.finalize();

        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        Fingerprint(u64::from_be_bytes(prefix))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Cache key: the fingerprint plus the username it was built from.
///
/// The username travels with the key so per-user invalidation is an exact
/// match rather than a prefix test on a formatted string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub fingerprint: Fingerprint,
    pub username: String,
}

impl CacheKey {
    pub fn new(username: impl Into<String>, fingerprint: Fingerprint) -> Self {
        Self {
            fingerprint,
            username: username.into(),
        }
    }

    pub fn for_request(req: &AuthRequest) -> Self {
        Self::new(req.username.clone(), Fingerprint::of(req))
    }
}
