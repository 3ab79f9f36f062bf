//! Agent configuration
//!
//! One struct per component, gathered in [`AgentConfig`]. The agent binary
//! fills these from command-line arguments and `OCSERV_AGENT_*` variables.

use crate::failmode::{validate_fail_mode, FailMode};
use crate::Result;

pub use crate::breaker::BreakerConfig;
pub use crate::cache::CacheConfig;
pub use crate::handler::HandlerConfig;
pub use crate::ipc::IpcConfig;
pub use crate::portal::PortalConfig;

/// Complete agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub ipc: IpcConfig,
    pub handler: HandlerConfig,
    pub cache: CacheConfig,
    pub breaker: BreakerConfig,
    pub portal: PortalConfig,
    pub fail_mode: FailMode,
    /// Deployment environment, e.g. `production` or `development`
    pub environment: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            ipc: IpcConfig::default(),
            handler: HandlerConfig::default(),
            cache: CacheConfig::default(),
            breaker: BreakerConfig::default(),
            portal: PortalConfig::default(),
            fail_mode: FailMode::Stale,
            environment: "production".to_string(),
        }
    }
}

impl AgentConfig {
    /// Startup checks; fail-open is refused in production
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.handler.validate()?;
        validate_fail_mode(self.fail_mode, &self.environment)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AgentError;
    use std::time::Duration;

    #[test]
    fn test_default_is_valid() {
        assert!(AgentConfig::default().validate().is_ok());
    }

    #[test]
    fn test_fail_open_rejected_in_production() {
        let config = AgentConfig {
            fail_mode: FailMode::Open,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(AgentError::Config(_))));

        let config = AgentConfig {
            fail_mode: FailMode::Open,
            environment: "development".into(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cache_windows_checked() {
        let mut config = AgentConfig::default();
        config.cache.stale_ttl = config.cache.ttl;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reserve_must_fit_deadline() {
        let mut config = AgentConfig::default();
        config.handler.response_reserve = Duration::from_secs(5);
        assert!(config.validate().is_err());
    }
}
