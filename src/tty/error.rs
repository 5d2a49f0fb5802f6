//! Error taxonomy for the terminal bridge.
//!
//! Errors fall into four groups, matching the phase in which they occur:
//!
//! 1. **Connect errors** ([`ConnectError`]): DNS/TCP failure, authentication
//!    rejection, host key mismatch, timeout. Fatal to the bridge attempt and
//!    returned to the caller. Never retried inside the connector.
//!
//! 2. **Allocation errors** ([`AllocError`]): PTY request, pipe acquisition or
//!    shell start failure. The connection is torn down before these are
//!    returned.
//!
//! 3. **Stream errors** ([`TerminalError`], [`SessionError`]): read/write
//!    failures while piping. They end the bridge; nobody is waiting for them
//!    synchronously, so they are logged with the session id.
//!
//! 4. **Protocol violations**: unexpected close codes. Logged as abnormal and
//!    routed through the same teardown path.
//!
//! # Transient vs permanent
//!
//! [`ConnectError::is_transient`] classifies failures using the message
//! keyword tables below so the HTTP layer can decide whether offering the
//! user a "reconnect" action makes sense. Authentication failures always win
//! over connection keywords.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Authentication error patterns that indicate permanent failures.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "password authentication failed",
    "key authentication failed",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
];

/// Connection error patterns that indicate transient failures.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timeout",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "handshake failed",
    "failed to connect",
    "broken pipe",
];

/// Determines if an error message describes a transient condition.
///
/// Authentication patterns are checked first and take precedence. Unknown
/// messages are treated as transient unless they look like an SSH protocol
/// error without a timeout/connect keyword.
pub(crate) fn is_retryable_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();

    if AUTH_ERRORS.iter().any(|p| error_lower.contains(p)) {
        return false;
    }

    if RETRYABLE_ERRORS.iter().any(|p| error_lower.contains(p)) {
        return true;
    }

    !error_lower.contains("ssh") || error_lower.contains("timeout") || error_lower.contains("connect")
}

/// Why a connection attempt failed.
#[derive(Debug, Error)]
pub enum ConnectFailure {
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to connect: {0}")]
    Transport(#[source] russh::Error),

    #[error("host key rejected for {host}: {fingerprint}")]
    HostKeyRejected { host: String, fingerprint: String },

    #[error("authentication failed: {0}")]
    AuthRejected(String),
}

/// Connection failure tagged with the session it was attempted for.
#[derive(Debug, Error)]
#[error("ssh connect [{session_id}] to {target}: {failure}")]
pub struct ConnectError {
    pub session_id: Uuid,
    pub target: String,
    #[source]
    pub failure: ConnectFailure,
}

impl ConnectError {
    pub fn new(session_id: Uuid, target: impl Into<String>, failure: ConnectFailure) -> Self {
        Self {
            session_id,
            target: target.into(),
            failure,
        }
    }

    /// Whether retrying the same attempt later could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match &self.failure {
            ConnectFailure::InvalidCredentials(_)
            | ConnectFailure::HostKeyRejected { .. }
            | ConnectFailure::AuthRejected(_) => false,
            ConnectFailure::Timeout(_) => true,
            ConnectFailure::Transport(e) => is_retryable_error(&e.to_string()),
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self.failure, ConnectFailure::AuthRejected(_))
    }
}

/// Failures while allocating the PTY and starting the shell.
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("connection {0} already has a terminal bound")]
    AlreadyBound(Uuid),

    #[error("failed to open session channel: {0}")]
    ChannelOpen(#[source] russh::Error),

    #[error("pty request failed: {0}")]
    PtyRequest(String),

    #[error("shell start failed: {0}")]
    ShellStart(String),

    #[error("no reply to {request} within {timeout:?}")]
    NoReply {
        request: &'static str,
        timeout: Duration,
    },
}

/// I/O failures on an allocated terminal.
#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("terminal session is closed")]
    Closed,

    #[error("failed to write to shell: {0}")]
    Write(String),

    #[error("failed to close shell channel: {0}")]
    Channel(String),

    #[error("failed to disconnect: {0}")]
    Disconnect(String),
}

/// Failures on the client-facing session envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session {0} is closed")]
    Closed(u64),

    #[error("session {0} already has a reader")]
    ReaderTaken(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to encode payload: {0}")]
    Encode(String),
}

/// Failure reported by a session transport (WebSocket or in-process).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Preconditions violated when starting a bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("terminal session {0} is already closed")]
    TerminalClosed(Uuid),

    #[error("client session {0} is already closed")]
    SessionClosed(u64),

    #[error("terminal session {0} has no {1} stream")]
    MissingStream(Uuid, &'static str),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Failures resolving a stored target into credentials.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("unknown host: {0}")]
    UnknownHost(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid hosts file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    mod auth_errors_not_retryable {
        use super::*;

        #[test]
        fn test_authentication_failed() {
            assert!(!is_retryable_error("Authentication failed"));
            assert!(!is_retryable_error("AUTHENTICATION FAILED"));
        }

        #[test]
        fn test_permission_denied() {
            assert!(!is_retryable_error("permission denied (publickey)"));
        }

        #[test]
        fn test_all_auth_methods_failed() {
            assert!(!is_retryable_error("All authentication methods failed"));
        }
    }

    mod connection_errors_retryable {
        use super::*;

        #[test]
        fn test_connection_refused() {
            assert!(is_retryable_error("Connection refused (os error 111)"));
        }

        #[test]
        fn test_no_route_to_host() {
            assert!(is_retryable_error("No route to host"));
        }

        #[test]
        fn test_handshake_failed() {
            assert!(is_retryable_error("SSH handshake failed"));
        }
    }

    mod edge_cases {
        use super::*;

        #[test]
        fn test_ssh_protocol_error_not_retryable() {
            assert!(!is_retryable_error("SSH protocol error"));
        }

        #[test]
        fn test_auth_error_takes_precedence_over_connection() {
            assert!(!is_retryable_error(
                "Connection timeout during authentication failed"
            ));
        }
    }

    mod connect_error {
        use super::*;

        #[test]
        fn test_auth_rejection_is_permanent() {
            let err = ConnectError::new(
                Uuid::new_v4(),
                "root@db:22",
                ConnectFailure::AuthRejected("password rejected".to_string()),
            );
            assert!(!err.is_transient());
            assert!(err.is_auth_failure());
        }

        #[test]
        fn test_timeout_is_transient() {
            let err = ConnectError::new(
                Uuid::new_v4(),
                "root@db:22",
                ConnectFailure::Timeout(Duration::from_secs(5)),
            );
            assert!(err.is_transient());
            assert!(!err.is_auth_failure());
        }

        #[test]
        fn test_host_key_rejection_is_permanent() {
            let err = ConnectError::new(
                Uuid::new_v4(),
                "root@db:22",
                ConnectFailure::HostKeyRejected {
                    host: "db".to_string(),
                    fingerprint: "SHA256:abc".to_string(),
                },
            );
            assert!(!err.is_transient());
        }

        #[test]
        fn test_display_carries_session_id() {
            let id = Uuid::new_v4();
            let err = ConnectError::new(
                id,
                "root@db:22",
                ConnectFailure::InvalidCredentials("no auth method".to_string()),
            );
            let text = err.to_string();
            assert!(text.contains(&id.to_string()));
            assert!(text.contains("root@db:22"));
        }
    }
}
