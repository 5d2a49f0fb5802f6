//! Interactive PTY shell allocation.
//!
//! [`open_shell`] requests a pseudo-terminal on a connection, wires the
//! stdout/stderr pipes, then starts the shell. The resulting
//! [`TerminalSession`] exposes:
//!
//! - a [`Stdin`] handle writing to the remote shell,
//! - stdout and stderr as `AsyncRead` sources fed by a channel pump task,
//! - a cancellation token that is the sole authority over teardown.
//!
//! # Teardown
//!
//! Cancelling the token (directly, via [`TerminalSession::exit`], or by
//! dropping the session) closes stdin, then the SSH channel, then the SSH
//! connection, in that order and exactly once.
//!
//! # Lifecycle
//!
//! `Created → Active → Closing → Closed`. Closed is terminal.

use std::sync::Arc;

use async_trait::async_trait;
use russh::{ChannelMsg, ChannelReadHalf, ChannelWriteHalf, Pty, client};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::{OnceCell, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::tty::client::ConnectionHandle;
use crate::tty::config::{CHANNEL_REPLY_TIMEOUT, TerminalConfig};
use crate::tty::error::{AllocError, TerminalError};

/// Terminal modes sent with the pty-req: echo on plus fixed baud-rate hints.
pub const TERMINAL_MODES: &[(Pty, u32)] = &[
    (Pty::ECHO, 1),
    (Pty::TTY_OP_ISPEED, 14400),
    (Pty::TTY_OP_OSPEED, 14400),
];

/// Buffer size of each stdout/stderr pipe between the channel pump and readers.
const PIPE_CAPACITY: usize = 32 * 1024;

/// Byte source for terminal output.
pub type BoxReader = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// Lifecycle of a terminal session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Created,
    Active,
    Closing,
    Closed,
}

/// Operations a terminal needs from whatever carries the shell.
///
/// Implemented over an SSH channel by [`SshShell`]; tests substitute an
/// in-memory backend.
#[async_trait]
pub trait ShellBackend: Send + Sync {
    async fn write_stdin(&self, data: &[u8]) -> Result<(), TerminalError>;

    /// Signal end of input to the shell.
    async fn close_stdin(&self) -> Result<(), TerminalError>;

    async fn close_channel(&self) -> Result<(), TerminalError>;

    async fn disconnect(&self) -> Result<(), TerminalError>;

    fn is_connected(&self) -> bool;
}

/// Write handle for sending input to a shell channel.
///
/// Wraps `russh::ChannelWriteHalf` so input can be written without holding
/// the read half.
pub struct ChannelWriter {
    write_half: ChannelWriteHalf<client::Msg>,
}

impl ChannelWriter {
    pub fn new(write_half: ChannelWriteHalf<client::Msg>) -> Self {
        Self { write_half }
    }

    /// Send data (text, keystrokes, escape sequences) to the shell.
    pub async fn write(&self, data: &[u8]) -> Result<(), TerminalError> {
        self.write_half
            .data(data)
            .await
            .map_err(|e| TerminalError::Write(e.to_string()))
    }

    pub async fn eof(&self) -> Result<(), TerminalError> {
        self.write_half
            .eof()
            .await
            .map_err(|e| TerminalError::Channel(e.to_string()))
    }

    pub async fn close(&self) -> Result<(), TerminalError> {
        self.write_half
            .close()
            .await
            .map_err(|e| TerminalError::Channel(e.to_string()))
    }
}

/// Shell running on an SSH session channel.
pub struct SshShell {
    writer: ChannelWriter,
    connection: Arc<ConnectionHandle>,
}

#[async_trait]
impl ShellBackend for SshShell {
    async fn write_stdin(&self, data: &[u8]) -> Result<(), TerminalError> {
        self.writer.write(data).await
    }

    async fn close_stdin(&self) -> Result<(), TerminalError> {
        self.writer.eof().await
    }

    async fn close_channel(&self) -> Result<(), TerminalError> {
        self.writer.close().await
    }

    async fn disconnect(&self) -> Result<(), TerminalError> {
        self.connection.disconnect().await
    }

    fn is_connected(&self) -> bool {
        !self.connection.is_closed()
    }
}

/// Runs the ordered teardown exactly once.
pub(crate) struct Teardown {
    id: Uuid,
    backend: Arc<dyn ShellBackend>,
    cancel: CancellationToken,
    state: watch::Sender<TerminalState>,
    done: OnceCell<()>,
}

impl Teardown {
    pub(crate) async fn run(&self) {
        self.done
            .get_or_init(|| async {
                self.cancel.cancel();
                self.state.send_replace(TerminalState::Closing);

                if let Err(e) = self.backend.close_stdin().await {
                    debug!("[{}] close stdin: {}", self.id, e);
                }
                if let Err(e) = self.backend.close_channel().await {
                    debug!("[{}] close channel: {}", self.id, e);
                }
                if let Err(e) = self.backend.disconnect().await {
                    debug!("[{}] disconnect: {}", self.id, e);
                }

                self.state.send_replace(TerminalState::Closed);
                info!("[{}] Terminal session closed", self.id);
            })
            .await;
    }
}

/// Input side of a terminal session.
#[derive(Clone)]
pub struct Stdin {
    backend: Arc<dyn ShellBackend>,
    cancel: CancellationToken,
}

impl Stdin {
    pub async fn write(&self, data: &[u8]) -> Result<(), TerminalError> {
        if self.cancel.is_cancelled() {
            return Err(TerminalError::Closed);
        }
        self.backend.write_stdin(data).await
    }
}

/// An interactive shell with its streams and cancellation handle.
pub struct TerminalSession {
    id: Uuid,
    cancel: CancellationToken,
    stdin: Stdin,
    stdout: Option<BoxReader>,
    stderr: Option<BoxReader>,
    teardown: Arc<Teardown>,
    state: watch::Receiver<TerminalState>,
    tasks: Vec<JoinHandle<()>>,
}

impl TerminalSession {
    /// Assemble a session over `backend`. Starts in [`TerminalState::Created`].
    ///
    /// Spawns the watcher that turns cancellation into teardown, so this must
    /// be called inside a tokio runtime.
    pub fn new(
        id: Uuid,
        backend: Arc<dyn ShellBackend>,
        stdout: BoxReader,
        stderr: BoxReader,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(TerminalState::Created);
        let teardown = Arc::new(Teardown {
            id,
            backend: backend.clone(),
            cancel: cancel.clone(),
            state: state_tx,
            done: OnceCell::new(),
        });

        let watcher = tokio::spawn({
            let cancel = cancel.clone();
            let teardown = teardown.clone();
            async move {
                cancel.cancelled().await;
                teardown.run().await;
            }
        });

        Self {
            id,
            stdin: Stdin {
                backend,
                cancel: cancel.clone(),
            },
            cancel,
            stdout: Some(stdout),
            stderr: Some(stderr),
            teardown,
            state: state_rx,
            tasks: vec![watcher],
        }
    }

    pub(crate) fn mark_active(&self) {
        self.teardown.state.send_if_modified(|state| {
            if *state == TerminalState::Created {
                *state = TerminalState::Active;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn attach_task(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    pub(crate) fn teardown(&self) -> Arc<Teardown> {
        self.teardown.clone()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stdin(&self) -> Stdin {
        self.stdin.clone()
    }

    pub fn take_stdout(&mut self) -> Option<BoxReader> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<BoxReader> {
        self.stderr.take()
    }

    pub fn state(&self) -> TerminalState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<TerminalState> {
        self.state.clone()
    }

    /// True once teardown has started or the transport is gone.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || matches!(self.state(), TerminalState::Closing | TerminalState::Closed)
    }

    /// Tear the session down. Safe to call repeatedly and concurrently.
    pub async fn exit(&self) {
        self.teardown.run().await;
    }

    /// Wait for every task owned by the session to finish.
    pub async fn join(&mut self) {
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Allocate a PTY and start an interactive shell on `connection`.
///
/// Pipes are created before the shell request. Any failure after the
/// channel was opened closes the channel and the connection before the
/// error is returned. A connection that already has a terminal is refused
/// and left untouched.
pub async fn open_shell(
    connection: Arc<ConnectionHandle>,
    config: &TerminalConfig,
) -> Result<TerminalSession, AllocError> {
    let id = connection.id();
    if !connection.try_bind() {
        return Err(AllocError::AlreadyBound(id));
    }

    let mut channel = match connection.open_session_channel().await {
        Ok(channel) => channel,
        Err(e) => {
            let _ = connection.disconnect().await;
            return Err(AllocError::ChannelOpen(e));
        }
    };

    let mut early = EarlyOutput::default();

    let pty = async {
        channel
            .request_pty(
                true,
                &config.term,
                config.cols,
                config.rows,
                0,
                0,
                TERMINAL_MODES,
            )
            .await
            .map_err(|e| AllocError::PtyRequest(e.to_string()))?;
        wait_reply(&mut channel, "pty-req", &mut early).await
    };
    let pty_result = pty.await;
    if let Err(e) = pty_result {
        warn!("[{}] {}", id, e);
        let _ = channel.close().await;
        let _ = connection.disconnect().await;
        return Err(e);
    }

    let (stdout_tx, stdout_rx) = tokio::io::duplex(PIPE_CAPACITY);
    let (stderr_tx, stderr_rx) = tokio::io::duplex(PIPE_CAPACITY);

    let shell = async {
        channel
            .request_shell(true)
            .await
            .map_err(|e| AllocError::ShellStart(e.to_string()))?;
        wait_reply(&mut channel, "shell", &mut early).await
    };
    let shell_result = shell.await;
    if let Err(e) = shell_result {
        warn!("[{}] {}", id, e);
        let _ = channel.close().await;
        let _ = connection.disconnect().await;
        return Err(e);
    }

    let (read_half, write_half) = channel.split();
    let backend = Arc::new(SshShell {
        writer: ChannelWriter::new(write_half),
        connection: connection.clone(),
    });

    let mut session = TerminalSession::new(id, backend, Box::new(stdout_rx), Box::new(stderr_rx));
    let pump = tokio::spawn(
        pump_channel(read_half, early, stdout_tx, stderr_tx, session.cancel_token())
            .instrument(info_span!("shell_pump", session = %id)),
    );
    session.attach_task(pump);
    session.mark_active();

    info!(
        "[{}] Shell started on {} ({} {}x{})",
        id,
        connection.target(),
        config.term,
        config.cols,
        config.rows
    );
    Ok(session)
}

/// Output received while waiting for channel request replies.
///
/// Nothing reads the pipes until the session is handed out, so this is
/// buffered in memory and replayed by the pump.
#[derive(Default)]
struct EarlyOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// Wait for the Success/Failure reply to a channel request.
async fn wait_reply(
    channel: &mut russh::Channel<client::Msg>,
    request: &'static str,
    early: &mut EarlyOutput,
) -> Result<(), AllocError> {
    let rejected = |reason: &str| match request {
        "pty-req" => AllocError::PtyRequest(reason.to_string()),
        _ => AllocError::ShellStart(reason.to_string()),
    };

    let reply = async {
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Success) => return Ok(()),
                Some(ChannelMsg::Failure) => return Err(rejected("rejected by server")),
                Some(ChannelMsg::Data { data }) => early.stdout.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    early.stderr.extend_from_slice(&data)
                }
                Some(ChannelMsg::Close) | None => return Err(rejected("channel closed")),
                Some(_) => {}
            }
        }
    };

    tokio::time::timeout(CHANNEL_REPLY_TIMEOUT, reply)
        .await
        .map_err(|_| AllocError::NoReply {
            request,
            timeout: CHANNEL_REPLY_TIMEOUT,
        })?
}

/// Demultiplex channel messages into the stdout/stderr pipes, starting with
/// whatever arrived before the shell was running.
///
/// Returns on EOF, channel close, pipe failure or cancellation; dropping the
/// pipe writers delivers EOF to the readers.
async fn pump_channel(
    mut read_half: ChannelReadHalf,
    early: EarlyOutput,
    mut stdout: DuplexStream,
    mut stderr: DuplexStream,
    cancel: CancellationToken,
) {
    if !write_pipe(&mut stdout, &early.stdout, &cancel).await
        || !write_pipe(&mut stderr, &early.stderr, &cancel).await
    {
        return;
    }

    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = read_half.wait() => msg,
        };

        let written = match msg {
            Some(ChannelMsg::Data { data }) => write_pipe(&mut stdout, &data, &cancel).await,
            Some(ChannelMsg::ExtendedData { data, ext }) => {
                // ext == 1 is stderr in SSH protocol
                if ext != 1 {
                    continue;
                }
                write_pipe(&mut stderr, &data, &cancel).await
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                debug!("Shell exited with status {}", exit_status);
                continue;
            }
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
            Some(_) => continue,
        };

        if !written {
            break;
        }
    }
    debug!("Channel pump finished");
}

async fn write_pipe<W>(pipe: &mut W, data: &[u8], cancel: &CancellationToken) -> bool
where
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        result = pipe.write_all(data) => result.is_ok(),
    }
}
