//! vpn-auth: ocserv connect-script
//!
//! ocserv runs this for every connect, disconnect and host-update with the
//! session described in environment variables. Exit status 0 lets the
//! user in, anything else rejects them.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use ocserv_agent_core::ipc::send_request;
use ocserv_agent_core::{AuthRequest, Reason};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "vpn-auth", version, about = "ocserv connect-script client for the agent")]
struct Args {
    /// Agent socket
    #[arg(long, env = "VPN_AUTH_SOCKET", default_value = ocserv_agent_core::DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Deny when the agent cannot be reached
    #[arg(long, env = "VPN_AUTH_FAIL_CLOSED", value_parser = clap::builder::BoolishValueParser::new(), default_value_t = false)]
    fail_closed: bool,

    /// Request timeout in milliseconds
    #[arg(long, env = "VPN_AUTH_TIMEOUT_MS", default_value_t = 3000)]
    timeout_ms: u64,
}

fn request_from_env() -> AuthRequest {
    let var = |name: &str| std::env::var(name).unwrap_or_default();
    AuthRequest {
        reason: var("REASON"),
        username: var("USERNAME"),
        groupname: var("GROUPNAME"),
        ip_real: var("IP_REAL"),
        ip_remote: var("IP_REMOTE"),
        device: var("DEVICE"),
        session_id: var("ID"),
    }
}

/// What to do before dialing the agent
#[derive(Debug, PartialEq, Eq)]
enum Precheck {
    /// Malformed invocation, reject the session
    Reject,
    /// Nothing to authorize
    Skip,
    /// Ask the agent
    Authorize,
}

fn precheck(request: &AuthRequest) -> Precheck {
    if request.username.is_empty() {
        return Precheck::Reject;
    }
    match request.reason.parse::<Reason>() {
        Ok(Reason::Connect) => Precheck::Authorize,
        _ => Precheck::Skip,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // ocserv captures stderr into its own log
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vpn_auth=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let request = request_from_env();

    match precheck(&request) {
        Precheck::Reject => {
            tracing::error!(reason = %request.reason, "USERNAME not set, rejecting");
            return ExitCode::FAILURE;
        }
        Precheck::Skip => {
            tracing::debug!(reason = %request.reason, "not a connect, nothing to authorize");
            return ExitCode::SUCCESS;
        }
        Precheck::Authorize => {}
    }

    match send_request(&args.socket, &request, Duration::from_millis(args.timeout_ms)).await {
        Ok(resp) if resp.allowed => {
            tracing::info!(username = %request.username, "connection allowed");
            ExitCode::SUCCESS
        }
        Ok(resp) => {
            tracing::warn!(
                username = %request.username,
                error = resp.error.as_deref().unwrap_or("access denied"),
                "connection denied"
            );
            ExitCode::FAILURE
        }
        Err(e) if args.fail_closed => {
            tracing::error!(error = %e, "agent unreachable, denying (fail-closed)");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!(error = %e, "agent unreachable, allowing (fail-open)");
            ExitCode::SUCCESS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(reason: &str, username: &str) -> AuthRequest {
        AuthRequest {
            reason: reason.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_username_rejected_for_any_reason() {
        assert_eq!(precheck(&request("connect", "")), Precheck::Reject);
        assert_eq!(precheck(&request("disconnect", "")), Precheck::Reject);
        assert_eq!(precheck(&request("host-update", "")), Precheck::Reject);
    }

    #[test]
    fn test_only_connect_is_authorized() {
        assert_eq!(precheck(&request("connect", "alice")), Precheck::Authorize);
        assert_eq!(precheck(&request("disconnect", "alice")), Precheck::Skip);
        assert_eq!(precheck(&request("host-update", "alice")), Precheck::Skip);
    }

    #[test]
    fn test_fail_closed_flag() {
        let args = Args::try_parse_from(["vpn-auth", "--fail-closed"]).unwrap();
        assert!(args.fail_closed);
        let args = Args::try_parse_from(["vpn-auth"]).unwrap();
        assert_eq!(args.timeout_ms, 3000);
    }
}
