//! Bidirectional relay between a terminal session and a client session.
//!
//! A [`Bridge`] pairs one [`TerminalSession`] with one [`Session`] and runs
//! three loops under a single cancellation token:
//!
//! - stdout → client: filtered lines as binary frames
//! - stderr → client: same, independent ordering
//! - client → stdin: data frames, forwarded unchanged
//!
//! Before relaying input the bridge installs a prompt hook in the shell so
//! the end-of-command marker is printed before every prompt. Client input is
//! never rewritten.
//!
//! The first loop to finish moves the bridge to `Draining`, which tears the
//! terminal down and exits the client session exactly once. The bridge is
//! `Closed` only after every task it started has been joined.
//!
//! ```text
//! Starting ──► Piping ──► Draining ──► Closed
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{OnceCell, mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, warn};
use uuid::Uuid;

use crate::tty::envelope::{CLEAN_CLOSE_CODES, CloseOutcome, Message, Session};
use crate::tty::error::BridgeError;
use crate::tty::filter::{FilterConfig, FilterEvent, FilteredLines, prompt_hook, read_filtered};
use crate::tty::shell::{Stdin, Teardown, TerminalSession};

/// How long the other output stream may keep flushing after one reached EOF.
const OUTPUT_GRACE: Duration = Duration::from_millis(250);

/// Bridge lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Starting,
    Piping,
    Draining,
    Closed,
}

/// Why the bridge stopped piping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The client closed or its transport went away.
    ClientClosed,
    /// The shell's output ended or the terminal was torn down.
    TerminalClosed,
    ClientWriteFailed(String),
    StdinFailed(String),
    /// Parent cancellation or [`BridgeHandle::close`].
    Shutdown,
    TaskFailed(String),
}

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Close codes treated as a clean client shutdown.
    pub accepted_close_codes: Vec<u16>,
    pub filter: FilterConfig,
    /// Install the prompt hook that reports finished commands.
    pub mark_commands: bool,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            accepted_close_codes: CLEAN_CLOSE_CODES.to_vec(),
            filter: FilterConfig::default(),
            mark_commands: true,
        }
    }
}

/// Summary returned by [`Bridge::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeReport {
    pub session_id: u64,
    pub terminal_id: Uuid,
    pub reason: EndReason,
    pub client_outcome: Option<CloseOutcome>,
    pub lines_out: u64,
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub commands_finished: u64,
}

#[derive(Default)]
struct Counters {
    lines_out: AtomicU64,
    bytes_out: AtomicU64,
    bytes_in: AtomicU64,
    commands_finished: AtomicU64,
}

struct HandleInner {
    token: CancellationToken,
    teardown: Arc<Teardown>,
    session: Arc<Session>,
    drained: OnceCell<()>,
    state: watch::Sender<BridgeState>,
}

impl HandleInner {
    async fn drain(&self) {
        self.drained
            .get_or_init(|| async {
                self.token.cancel();
                self.state.send_replace(BridgeState::Draining);
                tokio::join!(self.teardown.run(), self.session.exit());
            })
            .await;
    }
}

/// Cloneable control handle for a running bridge.
#[derive(Clone)]
pub struct BridgeHandle {
    inner: Arc<HandleInner>,
}

impl BridgeHandle {
    /// Shut the bridge down. Idempotent; concurrent callers all return once
    /// both sides are closed.
    pub async fn close(&self) {
        self.inner.drain().await;
    }

    pub fn state(&self) -> watch::Receiver<BridgeState> {
        self.inner.state.subscribe()
    }

    pub fn current_state(&self) -> BridgeState {
        *self.inner.state.borrow()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Output,
    Input,
}

/// A running relay. Consumed by [`Bridge::run`].
pub struct Bridge {
    terminal: TerminalSession,
    session: Arc<Session>,
    handle: BridgeHandle,
    tasks: JoinSet<(Direction, EndReason)>,
    counters: Arc<Counters>,
    span: Span,
}

impl Bridge {
    /// Wire `terminal` and `session` together and start piping.
    ///
    /// Fails if either side is already closed, if the terminal's output
    /// streams were taken, or if the session already has a reader. The
    /// bridge token is a child of `parent`.
    pub fn start(
        mut terminal: TerminalSession,
        session: Arc<Session>,
        options: BridgeOptions,
        parent: &CancellationToken,
        span: Span,
    ) -> Result<Self, BridgeError> {
        let terminal_id = terminal.id();
        if terminal.is_closed() {
            return Err(BridgeError::TerminalClosed(terminal_id));
        }
        if session.is_done() {
            return Err(BridgeError::SessionClosed(session.id()));
        }

        let stdout = terminal
            .take_stdout()
            .ok_or(BridgeError::MissingStream(terminal_id, "stdout"))?;
        let stderr = terminal
            .take_stderr()
            .ok_or(BridgeError::MissingStream(terminal_id, "stderr"))?;
        let inbound = session.await_message(&options.accepted_close_codes)?;

        let token = parent.child_token();
        let (state, _) = watch::channel(BridgeState::Starting);
        let handle = BridgeHandle {
            inner: Arc::new(HandleInner {
                token: token.clone(),
                teardown: terminal.teardown(),
                session: session.clone(),
                drained: OnceCell::new(),
                state,
            }),
        };

        let counters = Arc::new(Counters::default());
        let mut tasks = JoinSet::new();

        for (label, source) in [("stdout", stdout), ("stderr", stderr)] {
            let lines = read_filtered(label, source, options.filter, token.clone(), span.clone());
            tasks.spawn(
                pump_output(lines, session.clone(), token.clone(), counters.clone())
                    .instrument(span.clone()),
            );
        }
        tasks.spawn(
            pump_input(
                inbound,
                terminal.stdin(),
                token.clone(),
                options.mark_commands,
                counters.clone(),
            )
            .instrument(span.clone()),
        );

        handle.inner.state.send_replace(BridgeState::Piping);
        span.in_scope(|| {
            info!(
                "Bridge started: terminal {} <-> session {}",
                terminal_id,
                session.id()
            )
        });

        Ok(Self {
            terminal,
            session,
            handle,
            tasks,
            counters,
            span,
        })
    }

    pub fn handle(&self) -> BridgeHandle {
        self.handle.clone()
    }

    /// Pipe until the first side ends, then drain and join everything.
    pub async fn run(mut self) -> BridgeReport {
        let span = self.span.clone();
        let token = self.handle.inner.token.clone();
        let terminal_token = self.terminal.cancel_token();
        let session = self.session.clone();

        let reason = async {
            let (from_task, reason) = tokio::select! {
                biased;
                Some(joined) = self.tasks.join_next() => {
                    let (direction, reason) = task_result(joined);
                    (Some(direction), reason)
                }
                _ = token.cancelled() => (None, EndReason::Shutdown),
                _ = session.done() => (None, EndReason::ClientClosed),
                _ = terminal_token.cancelled() => (None, EndReason::TerminalClosed),
            };

            if from_task == Some(Direction::Output) && reason == EndReason::TerminalClosed {
                self.flush_outputs().await;
            }

            match &reason {
                EndReason::ClientClosed | EndReason::TerminalClosed | EndReason::Shutdown => {
                    debug!("Bridge ending: {:?}", reason)
                }
                other => warn!("Bridge ending: {:?}", other),
            }

            self.handle.inner.drain().await;
            while let Some(joined) = self.tasks.join_next().await {
                if let (_, EndReason::TaskFailed(e)) = task_result(joined) {
                    warn!("Bridge task failed: {}", e);
                }
            }
            self.session.join_reader().await;
            self.terminal.join().await;
            reason
        }
        .instrument(span.clone())
        .await;

        self.handle.inner.state.send_replace(BridgeState::Closed);
        let report = BridgeReport {
            session_id: self.session.id(),
            terminal_id: self.terminal.id(),
            reason,
            client_outcome: self.session.outcome(),
            lines_out: self.counters.lines_out.load(Ordering::Relaxed),
            bytes_out: self.counters.bytes_out.load(Ordering::Relaxed),
            bytes_in: self.counters.bytes_in.load(Ordering::Relaxed),
            commands_finished: self.counters.commands_finished.load(Ordering::Relaxed),
        };
        span.in_scope(|| info!("Bridge closed: {:?}", report));
        report
    }

    /// Give the remaining output loop a short window to reach EOF so the
    /// tail of the shell's output is not cut off.
    async fn flush_outputs(&mut self) {
        let deadline = tokio::time::Instant::now() + OUTPUT_GRACE;
        while let Ok(Some(joined)) = tokio::time::timeout_at(deadline, self.tasks.join_next()).await
        {
            if task_result(joined).0 == Direction::Output {
                break;
            }
        }
    }
}

fn task_result(
    joined: Result<(Direction, EndReason), tokio::task::JoinError>,
) -> (Direction, EndReason) {
    joined.unwrap_or_else(|e| (Direction::Input, EndReason::TaskFailed(e.to_string())))
}

async fn pump_output(
    mut lines: FilteredLines,
    session: Arc<Session>,
    token: CancellationToken,
    counters: Arc<Counters>,
) -> (Direction, EndReason) {
    let reason = loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => break EndReason::Shutdown,
            event = lines.recv() => event,
        };

        match event {
            Some(FilterEvent::Line(line)) => {
                if let Err(e) = session.write_bytes(&line).await {
                    break EndReason::ClientWriteFailed(e.to_string());
                }
                counters.lines_out.fetch_add(1, Ordering::Relaxed);
                counters
                    .bytes_out
                    .fetch_add(line.len() as u64, Ordering::Relaxed);
            }
            Some(FilterEvent::CommandFinished) => {
                counters.commands_finished.fetch_add(1, Ordering::Relaxed);
                debug!("Command finished");
            }
            Some(FilterEvent::Closed(diagnostic)) => {
                let _ = session.write_bytes(diagnostic.as_bytes()).await;
                break EndReason::TerminalClosed;
            }
            None => break EndReason::TerminalClosed,
        }
    };

    if reason != EndReason::TerminalClosed {
        token.cancel();
    }
    lines.join().await;
    (Direction::Output, reason)
}

async fn pump_input(
    mut inbound: mpsc::Receiver<Message>,
    stdin: Stdin,
    token: CancellationToken,
    mark_commands: bool,
    counters: Arc<Counters>,
) -> (Direction, EndReason) {
    let installed = if mark_commands {
        let hook = prompt_hook();
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(EndReason::Shutdown),
            written = stdin.write(hook.as_bytes()) => {
                written.map_err(|e| EndReason::StdinFailed(e.to_string()))
            }
        }
    } else {
        Ok(())
    };
    let reason = match installed {
        Ok(()) => relay_input(&mut inbound, &stdin, &token, &counters).await,
        Err(reason) => reason,
    };

    token.cancel();
    (Direction::Input, reason)
}

async fn relay_input(
    inbound: &mut mpsc::Receiver<Message>,
    stdin: &Stdin,
    token: &CancellationToken,
    counters: &Counters,
) -> EndReason {
    loop {
        let message = tokio::select! {
            biased;
            _ = token.cancelled() => break EndReason::Shutdown,
            message = inbound.recv() => message,
        };
        let Some(message) = message else {
            break EndReason::ClientClosed;
        };

        let payload = message.into_bytes();
        let written = tokio::select! {
            biased;
            _ = token.cancelled() => break EndReason::Shutdown,
            written = stdin.write(&payload) => written,
        };
        if let Err(e) = written {
            break EndReason::StdinFailed(e.to_string());
        }
        counters
            .bytes_in
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
    }
}
