//! IPC Server and Client
//!
//! The connect-script talks to the agent over a Unix socket. One request
//! and one response per connection, both length-prefixed JSON frames
//! (see [`crate::protocol`]).
//!
//! The accept loop never awaits connection handling: every connection runs
//! in its own task under its own deadline. Shutdown is signalled through a
//! `watch` channel shared with the cache sweep.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::breaker::CircuitBreaker;
use crate::cache::DecisionCache;
use crate::config::AgentConfig;
use crate::handler::AuthHandler;
use crate::portal::PortalClient;
use crate::protocol::{AuthRequest, AuthResponse, FrameCodec};
use crate::{AgentError, Result};

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// IPC server configuration
#[derive(Debug, Clone)]
pub struct IpcConfig {
    pub socket_path: PathBuf,
    /// Permission bits applied to the socket file after bind
    pub socket_mode: u32,
    /// How long shutdown waits for in-flight connections
    pub shutdown_grace: Duration,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(crate::DEFAULT_SOCKET_PATH),
            socket_mode: 0o666,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Unix socket server for connect-script requests
#[cfg(unix)]
pub struct IpcServer {
    listener: UnixListener,
    config: IpcConfig,
    handler: Arc<AuthHandler>,
}

#[cfg(unix)]
impl IpcServer {
    /// Bind the socket. Must be called inside a tokio runtime.
    pub fn bind(config: IpcConfig, handler: Arc<AuthHandler>) -> Result<Self> {
        use std::os::unix::fs::PermissionsExt;

        let socket_path = config.socket_path.as_path();

        // Remove old socket if exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }

        if let Some(parent) = socket_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let listener = UnixListener::bind(socket_path)?;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(config.socket_mode))?;

        tracing::info!(path = %socket_path.display(), "IPC server listening");

        Ok(Self {
            listener,
            config,
            handler,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Accept connections until `shutdown` flips to true or its sender is dropped
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let Self {
            listener,
            config,
            handler,
        } = self;
        let mut connections = tokio::task::JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let handler = Arc::clone(&handler);
                        connections.spawn(async move {
                            handler.handle_connection(stream).await;
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept error");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!(error = %e, "connection task panicked");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        drop(listener);
        tracing::info!(in_flight = connections.len(), "IPC server stopping");

        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(config.shutdown_grace, drain).await.is_err() {
            tracing::warn!(
                remaining = connections.len(),
                grace_ms = config.shutdown_grace.as_millis() as u64,
                "shutdown grace elapsed, aborting connections"
            );
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }

        if let Err(e) = std::fs::remove_file(&config.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %e, "failed to remove socket file");
            }
        }

        tracing::info!("IPC server stopped");
        Ok(())
    }
}

/// Send one request and wait for its response, all under `timeout`
#[cfg(unix)]
pub async fn send_request(
    socket_path: impl AsRef<Path>,
    request: &AuthRequest,
    timeout: Duration,
) -> Result<AuthResponse> {
    let socket_path = socket_path.as_ref();
    let exchange = async {
        let mut stream = UnixStream::connect(socket_path).await?;
        let codec = FrameCodec::default();
        codec.write_message(&mut stream, request).await?;
        codec.read_message::<_, AuthResponse>(&mut stream).await
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(AgentError::Io(format!(
            "no response from {} within {:?}",
            socket_path.display(),
            timeout
        ))),
    }
}

/// Build the handler from `config`, then serve until `shutdown`.
///
/// The cache sweep is started here and stopped by the same signal.
#[cfg(unix)]
pub async fn run_server(
    config: AgentConfig,
    portal: Arc<dyn PortalClient>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    config.validate()?;

    let cache = Arc::new(DecisionCache::new(config.cache.clone()));
    let sweeper = Arc::clone(&cache).spawn_cleanup(shutdown.clone());
    let breaker = CircuitBreaker::new("portal", config.breaker.clone());
    let handler = Arc::new(AuthHandler::new(
        config.handler.clone(),
        portal,
        cache,
        breaker,
        config.fail_mode,
    ));

    let server = IpcServer::bind(config.ipc.clone(), handler)?;
    let result = server.serve(shutdown).await;

    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "cache sweep task ended abnormally");
    }
    result
}
