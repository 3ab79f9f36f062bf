//! ocserv Agent Binary
//!
//! Runs the authorization daemon that the connect-script (`vpn-auth`)
//! talks to over the local socket.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ocserv_agent_core::config::{
    AgentConfig, BreakerConfig, CacheConfig, HandlerConfig, IpcConfig, PortalConfig,
};
use ocserv_agent_core::ipc::run_server;
use ocserv_agent_core::portal::HttpPortalClient;
use ocserv_agent_core::FailMode;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "ocserv-agent", version, about = "ocserv connect-script authorization agent")]
struct Args {
    /// Unix socket the connect-script dials
    #[arg(long, env = "OCSERV_AGENT_SOCKET", default_value = ocserv_agent_core::DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Portal base URL
    #[arg(long, env = "OCSERV_AGENT_PORTAL_URL")]
    portal_url: String,

    /// Bearer token presented to the portal
    #[arg(long, env = "OCSERV_AGENT_PORTAL_TOKEN", hide_env_values = true)]
    portal_token: Option<String>,

    /// PEM CA bundle for a portal on a private CA
    #[arg(long, env = "OCSERV_AGENT_PORTAL_CA_CERT")]
    portal_ca_cert: Option<PathBuf>,

    /// PEM client certificate for mutual TLS with the portal
    #[arg(long, env = "OCSERV_AGENT_PORTAL_CLIENT_CERT", requires = "portal_client_key")]
    portal_client_cert: Option<PathBuf>,

    /// PEM private key for the client certificate
    #[arg(long, env = "OCSERV_AGENT_PORTAL_CLIENT_KEY", requires = "portal_client_cert")]
    portal_client_key: Option<PathBuf>,

    /// Behaviour when the portal is unavailable: fail-open, fail-close, fail-stale
    #[arg(long, env = "OCSERV_AGENT_FAIL_MODE", default_value = "fail-stale")]
    fail_mode: FailMode,

    /// Deployment environment; fail-open is refused in production
    #[arg(long, env = "OCSERV_AGENT_ENVIRONMENT", default_value = "production")]
    environment: String,

    /// Per-connection budget in milliseconds
    #[arg(long, env = "OCSERV_AGENT_CONNECTION_TIMEOUT_MS", default_value_t = 3000)]
    connection_timeout_ms: u64,

    /// Per-portal-call timeout in milliseconds
    #[arg(long, env = "OCSERV_AGENT_PORTAL_TIMEOUT_MS", default_value_t = 2000)]
    portal_timeout_ms: u64,

    /// Decision cache TTL in seconds
    #[arg(long, env = "OCSERV_AGENT_CACHE_TTL_SECS", default_value_t = 300)]
    cache_ttl_secs: u64,

    /// Stale window in seconds (fail-stale fallback)
    #[arg(long, env = "OCSERV_AGENT_CACHE_STALE_TTL_SECS", default_value_t = 1800)]
    cache_stale_ttl_secs: u64,

    #[arg(long, env = "OCSERV_AGENT_CACHE_MAX_SIZE", default_value_t = 10_000)]
    cache_max_size: usize,

    /// Seconds between sweeps of fully expired cache entries
    #[arg(long, env = "OCSERV_AGENT_CACHE_CLEANUP_INTERVAL_SECS", default_value_t = 600)]
    cache_cleanup_interval_secs: u64,

    /// Consecutive portal failures before the breaker opens
    #[arg(long, env = "OCSERV_AGENT_BREAKER_THRESHOLD", default_value_t = 5)]
    breaker_threshold: u32,

    /// Seconds the breaker stays open before probing
    #[arg(long, env = "OCSERV_AGENT_BREAKER_TIMEOUT_SECS", default_value_t = 30)]
    breaker_timeout_secs: u64,

    /// Half-open probes admitted, and successes needed to close
    #[arg(long, env = "OCSERV_AGENT_BREAKER_MAX_REQUESTS", default_value_t = 1)]
    breaker_max_requests: u32,

    /// Seconds between closed-state counter resets; 0 disables
    #[arg(long, env = "OCSERV_AGENT_BREAKER_INTERVAL_SECS", default_value_t = 60)]
    breaker_interval_secs: u64,

    /// Seconds to wait for in-flight connections on shutdown
    #[arg(long, env = "OCSERV_AGENT_SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    shutdown_grace_secs: u64,
}

impl Args {
    fn into_config(self) -> AgentConfig {
        let portal_timeout = Duration::from_millis(self.portal_timeout_ms);
        AgentConfig {
            ipc: IpcConfig {
                socket_path: self.socket,
                shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
                ..Default::default()
            },
            handler: HandlerConfig {
                connection_timeout: Duration::from_millis(self.connection_timeout_ms),
                portal_timeout,
                ..Default::default()
            },
            cache: CacheConfig {
                ttl: Duration::from_secs(self.cache_ttl_secs),
                stale_ttl: Duration::from_secs(self.cache_stale_ttl_secs),
                max_size: self.cache_max_size,
                cleanup_interval: Duration::from_secs(self.cache_cleanup_interval_secs),
            },
            breaker: BreakerConfig {
                failure_threshold: self.breaker_threshold,
                timeout: Duration::from_secs(self.breaker_timeout_secs),
                max_requests: self.breaker_max_requests,
                interval: Duration::from_secs(self.breaker_interval_secs),
            },
            portal: PortalConfig {
                base_url: self.portal_url,
                token: self.portal_token,
                timeout: portal_timeout,
                ca_cert: self.portal_ca_cert,
                client_cert: self.portal_client_cert,
                client_key: self.portal_client_key,
            },
            fail_mode: self.fail_mode,
            environment: self.environment,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ocserv_agent_core=info,ocserv_agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Args::parse().into_config();
    config.validate()?;

    tracing::info!(
        version = ocserv_agent_core::VERSION,
        socket = %config.ipc.socket_path.display(),
        portal = %config.portal.base_url,
        fail_mode = %config.fail_mode,
        environment = %config.environment,
        "starting ocserv agent"
    );

    let portal = Arc::new(HttpPortalClient::new(&config.portal)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    run_server(config, portal, shutdown_rx).await?;
    tracing::info!("ocserv agent stopped");
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot install SIGTERM handler, waiting for ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
