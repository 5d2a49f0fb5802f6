//! SSH connector and connection handles.
//!
//! ## Connection Lifecycle
//!
//! 1. **Validation**: Credentials are turned into an [`AuthChain`] before any
//!    socket is opened, so credentials without a usable method fail fast.
//!
//! 2. **Client Configuration**: keepalive and compression settings. Interactive
//!    sessions have no inactivity timeout; liveness is tracked by keepalives.
//!
//! 3. **Connection Establishment**: TCP dial, SSH transport negotiation and
//!    host key verification through the caller's [`HostKeyPolicy`].
//!
//! 4. **Authentication**: private key first, password fallback.
//!
//! Steps 3 and 4 share a single caller-supplied timeout. Nothing is retried
//! here; whether to offer a reconnect is the caller's decision (see
//! [`ConnectError::is_transient`]).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use russh::{ChannelMsg, Disconnect, client};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::tty::auth::{AuthChain, AuthStrategy};
use crate::tty::error::{ConnectError, ConnectFailure, TerminalError};
use crate::tty::handler::{HostKeyPolicy, SshClientHandler};
use crate::tty::types::{CommandOutput, Credentials};

/// Build russh client configuration.
///
/// Keepalive every 30 seconds, max 3 missed. Compression prefers ZLIB when
/// `compress` is set.
pub(crate) fn build_client_config(compress: bool) -> Arc<client::Config> {
    let compression = if compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        preferred,
        ..Default::default()
    })
}

/// Counts connection handles that have not been closed or dropped.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    live: Arc<AtomicUsize>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn acquire(&self) -> LiveGuard {
        self.live.fetch_add(1, Ordering::SeqCst);
        LiveGuard(self.live.clone())
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Connector settings.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Bound on dial + handshake + authentication
    pub timeout: Duration,
    pub compress: bool,
}

/// Dials and authenticates SSH connections.
#[derive(Debug, Clone)]
pub struct SshConnector {
    config: ConnectorConfig,
    host_keys: HostKeyPolicy,
    tracker: ConnectionTracker,
}

impl SshConnector {
    pub fn new(config: ConnectorConfig, host_keys: HostKeyPolicy) -> Self {
        Self {
            config,
            host_keys,
            tracker: ConnectionTracker::new(),
        }
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Establish an authenticated connection for `creds`.
    pub async fn connect(&self, creds: &Credentials) -> Result<ConnectionHandle, ConnectError> {
        self.connect_as(Uuid::new_v4(), creds).await
    }

    /// Like [`connect`](Self::connect) with a caller-chosen correlation id.
    pub async fn connect_as(
        &self,
        session_id: Uuid,
        creds: &Credentials,
    ) -> Result<ConnectionHandle, ConnectError> {
        let target = creds.target();
        let fail = |failure| ConnectError::new(session_id, target.clone(), failure);

        if creds.host.is_empty() {
            return Err(fail(ConnectFailure::InvalidCredentials(
                "host is empty".to_string(),
            )));
        }
        let chain = AuthChain::for_method(&creds.auth)
            .map_err(|e| fail(ConnectFailure::InvalidCredentials(e)))?;

        info!(
            "[{}] Connecting to {} ({} auth)",
            session_id,
            target,
            creds.auth.mode()
        );

        let timeout = self.config.timeout;
        let attempt = self.dial_and_authenticate(creds, &chain);
        let handle = tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| fail(ConnectFailure::Timeout(timeout)))?
            .map_err(|failure| {
                warn!("[{}] Connection to {} failed: {}", session_id, target, failure);
                fail(failure)
            })?;

        info!("[{}] Authenticated to {}", session_id, target);

        Ok(ConnectionHandle {
            id: session_id,
            target,
            handle,
            closed: AtomicBool::new(false),
            bound: AtomicBool::new(false),
            live: Mutex::new(Some(self.tracker.acquire())),
        })
    }

    async fn dial_and_authenticate(
        &self,
        creds: &Credentials,
        chain: &AuthChain,
    ) -> Result<client::Handle<SshClientHandler>, ConnectFailure> {
        let config = build_client_config(self.config.compress);
        let handler = SshClientHandler::new(creds.host.clone(), self.host_keys.clone());
        let rejected = handler.rejected_slot();

        let mut handle = client::connect(config, (creds.host.as_str(), creds.port), handler)
            .await
            .map_err(|e| {
                let fingerprint = rejected.lock().ok().and_then(|mut slot| slot.take());
                match fingerprint {
                    Some(fingerprint) => ConnectFailure::HostKeyRejected {
                        host: creds.host.clone(),
                        fingerprint,
                    },
                    None => ConnectFailure::Transport(e),
                }
            })?;

        match chain.authenticate(&mut handle, &creds.user).await {
            Ok(true) => Ok(handle),
            Ok(false) => Err(ConnectFailure::AuthRejected(
                "no authentication methods succeeded".to_string(),
            )),
            Err(e) => {
                let _ = handle
                    .disconnect(Disconnect::ByApplication, "Authentication failed", "en")
                    .await;
                Err(ConnectFailure::AuthRejected(e))
            }
        }
    }
}

/// A live, authenticated SSH connection.
///
/// Owns the underlying socket. At most one terminal binds to a handle at a
/// time; [`disconnect`](Self::disconnect) is idempotent.
pub struct ConnectionHandle {
    id: Uuid,
    target: String,
    handle: client::Handle<SshClientHandler>,
    closed: AtomicBool,
    bound: AtomicBool,
    live: Mutex<Option<LiveGuard>>,
}

impl ConnectionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.handle.is_closed()
    }

    /// Claim the handle for a terminal. Returns false if already claimed.
    pub(crate) fn try_bind(&self) -> bool {
        !self.bound.swap(true, Ordering::SeqCst)
    }

    pub(crate) async fn open_session_channel(
        &self,
    ) -> Result<russh::Channel<client::Msg>, russh::Error> {
        self.handle.channel_open_session().await
    }

    /// Close the connection. Later calls are no-ops.
    pub async fn disconnect(&self) -> Result<(), TerminalError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Ok(mut live) = self.live.lock() {
            live.take();
        }

        debug!("[{}] Disconnecting from {}", self.id, self.target);
        self.handle
            .disconnect(Disconnect::ByApplication, "Session closed", "en")
            .await
            .map_err(|e| TerminalError::Disconnect(e.to_string()))
    }

    /// Execute a command on its own channel with timeout support.
    ///
    /// On timeout the partial output is returned with `timed_out: true` and
    /// `exit_code: -1`; the channel is closed and the connection kept alive.
    pub async fn exec(&self, command: &str, timeout: Duration) -> Result<CommandOutput, String> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| format!("Failed to open channel: {}", e))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| format!("Failed to execute command: {}", e))?;

        let mut stdout = Vec::with_capacity(4096);
        let mut stderr = Vec::with_capacity(1024);
        let mut exit_code: Option<u32> = None;

        let result = tokio::time::timeout(timeout, async {
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        // ext == 1 is stderr in SSH protocol
                        if ext == 1 {
                            stderr.extend_from_slice(&data);
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit_code = Some(exit_status);
                    }
                    Some(ChannelMsg::Eof) => {
                        if exit_code.is_some() {
                            break;
                        }
                    }
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
        })
        .await;

        let timed_out = result.is_err();
        if timed_out {
            warn!(
                "Command timed out after {:?}, returning partial output ({} bytes stdout)",
                timeout,
                stdout.len()
            );
        }

        let _ = channel.close().await;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: exit_code.map(|c| c as i32).unwrap_or(-1),
            timed_out,
        })
    }
}
