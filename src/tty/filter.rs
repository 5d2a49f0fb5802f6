//! Line-oriented filtering of terminal output.
//!
//! [`read_filtered`] turns a raw byte source into a bounded sequence of
//! [`FilterEvent`]s: ANSI control sequences are stripped, lines carrying the
//! end-of-command marker are hidden, and the end of the source is reported
//! as a single diagnostic line. Everything else passes through byte for byte;
//! output is never decoded as text.
//!
//! The shell is made to print the marker before each prompt by the hook from
//! [`prompt_hook`]. Output that happens to contain the marker literal is
//! suppressed as well; that collision is accepted.

use std::io;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::bytes::Regex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug};

/// Literal the shell prints when a command has finished.
pub const COMMAND_MARKER: &str = "__BRIDGE_CMD_DONE_7f3a9c1e5b2d4806__";

/// Default number of events buffered between the reader task and consumer.
pub const DEFAULT_LINE_BUFFER: usize = 8;

/// Default quiet period after which a partial line is emitted.
pub const DEFAULT_IDLE_FLUSH: Duration = Duration::from_millis(40);

const READ_CHUNK: usize = 4096;

/// Longest unterminated escape sequence held back by an idle flush.
const MAX_PARTIAL_ESCAPE: usize = 256;

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;

// OSC (BEL or ST terminated), then CSI, then two-byte escapes.
static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?-u)\x1B\][^\x07\x1B]*(?:\x07|\x1B\\)|\x1B\[[0-?]*[ -/]*[@-~]|\x1B[@-Z\\-_]")
        .expect("ANSI escape pattern is valid")
});

/// Remove terminal control sequences from `line`, leaving every other byte.
pub fn strip_ansi(line: &[u8]) -> Vec<u8> {
    ANSI_ESCAPE.replace_all(line, &b""[..]).into_owned()
}

fn contains_marker(line: &[u8]) -> bool {
    let marker = COMMAND_MARKER.as_bytes();
    line.windows(marker.len()).any(|w| w == marker)
}

/// Shell input installing a prompt hook that prints the marker before every
/// prompt.
///
/// Any existing `PROMPT_COMMAND` still runs after the marker. The leading
/// space keeps the line out of history under `HISTCONTROL=ignorespace`.
/// Shells without `PROMPT_COMMAND` simply never print the marker.
pub fn prompt_hook() -> String {
    format!(" PROMPT_COMMAND=\"echo {COMMAND_MARKER}${{PROMPT_COMMAND:+;$PROMPT_COMMAND}}\"\n")
}

/// Start of a trailing escape sequence that has not received its final byte.
fn partial_escape_start(buf: &[u8]) -> Option<usize> {
    let start = match buf.windows(2).rposition(|w| w == [ESC, b']']) {
        // OSC ends with BEL or ESC \
        Some(osc)
            if !buf[osc + 2..].contains(&BEL)
                && !buf[osc + 2..].windows(2).any(|w| w == [ESC, b'\\']) =>
        {
            osc
        }
        _ => {
            let esc = buf.iter().rposition(|b| *b == ESC)?;
            match buf[esc + 1..].split_first() {
                None => esc,
                Some((b'[', rest)) if rest.iter().all(|b| (0x20..=0x3f).contains(b)) => esc,
                _ => return None,
            }
        }
    };
    (buf.len() - start <= MAX_PARTIAL_ESCAPE).then_some(start)
}

/// Start of a trailing UTF-8 sequence missing continuation bytes.
fn partial_utf8_start(buf: &[u8]) -> Option<usize> {
    let window = buf.len().saturating_sub(3);
    let lead = (window..buf.len()).rev().find(|&i| buf[i] & 0xc0 != 0x80)?;
    let width = match buf[lead] {
        0xc0..=0xdf => 2,
        0xe0..=0xef => 3,
        0xf0..=0xf7 => 4,
        _ => return None,
    };
    (buf.len() - lead < width).then_some(lead)
}

/// How much of `buf` an idle flush may emit without splitting an escape
/// sequence or a multi-byte character.
fn flush_boundary(buf: &[u8]) -> usize {
    let escape = partial_escape_start(buf).unwrap_or(buf.len());
    let utf8 = partial_utf8_start(buf).unwrap_or(buf.len());
    escape.min(utf8)
}

/// Buffered reader yielding delimiter-terminated lines.
///
/// Lines keep their delimiter. When an idle window is set, a pending partial
/// line is returned once the source has been quiet for that long, so prompts
/// without a trailing newline still come through. An unfinished escape
/// sequence or UTF-8 character at the end of the pending bytes is held back
/// until more input arrives. `read_line` is cancel-safe: dropping the future
/// never loses buffered bytes.
pub struct LineReader<R> {
    source: R,
    buf: Vec<u8>,
    idle_flush: Option<Duration>,
    // Everything pending is an unfinished tail; wait for input without a deadline.
    holding: bool,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            source,
            buf: Vec::new(),
            idle_flush: None,
            holding: false,
            eof: false,
        }
    }

    pub fn with_idle_flush(mut self, idle: Option<Duration>) -> Self {
        self.idle_flush = idle;
        self
    }

    /// Next line, or `None` once the source is exhausted.
    ///
    /// A trailing fragment without delimiter is returned before `None`.
    pub async fn read_line(&mut self, delimiter: u8) -> io::Result<Option<Vec<u8>>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == delimiter) {
                return Ok(Some(self.buf.drain(..=pos).collect()));
            }

            if self.eof {
                return Ok(self.take_pending());
            }

            let read = match self.idle_flush {
                Some(idle) if !self.buf.is_empty() && !self.holding => {
                    match tokio::time::timeout(idle, self.source.read(&mut chunk)).await {
                        Ok(result) => result?,
                        Err(_) => {
                            let cut = flush_boundary(&self.buf);
                            if cut > 0 {
                                return Ok(Some(self.buf.drain(..cut).collect()));
                            }
                            self.holding = true;
                            continue;
                        }
                    }
                }
                _ => self.source.read(&mut chunk).await?,
            };

            if read == 0 {
                self.eof = true;
            } else {
                self.buf.extend_from_slice(&chunk[..read]);
                self.holding = false;
            }
        }
    }

    /// Buffered bytes not yet returned as a line.
    pub fn take_pending(&mut self) -> Option<Vec<u8>> {
        self.holding = false;
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }
}

/// Tuning for [`read_filtered`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterConfig {
    /// Capacity of the event channel.
    pub buffer: usize,
    /// `None` emits complete lines only.
    pub idle_flush: Option<Duration>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            buffer: DEFAULT_LINE_BUFFER,
            idle_flush: Some(DEFAULT_IDLE_FLUSH),
        }
    }
}

/// One item of filtered output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterEvent {
    /// Raw bytes of a visible line with escapes removed.
    Line(Vec<u8>),
    /// The shell printed the end-of-command marker.
    CommandFinished,
    /// The source ended; the text describes why. Always the last event.
    Closed(String),
}

/// Consumer side of a running filter.
pub struct FilteredLines {
    rx: mpsc::Receiver<FilterEvent>,
    task: JoinHandle<()>,
}

impl FilteredLines {
    pub async fn recv(&mut self) -> Option<FilterEvent> {
        self.rx.recv().await
    }

    /// Stop receiving and wait for the producer task to exit.
    ///
    /// The producer must be able to finish: either its cancellation token
    /// fired or its source reached EOF.
    pub async fn join(self) {
        drop(self.rx);
        let _ = self.task.await;
    }
}

fn classify(raw: &[u8]) -> Option<FilterEvent> {
    let line = strip_ansi(raw);
    if contains_marker(&line) {
        if line.trim_ascii() == COMMAND_MARKER.as_bytes() {
            return Some(FilterEvent::CommandFinished);
        }
        return None;
    }
    if line.is_empty() {
        return None;
    }
    Some(FilterEvent::Line(line))
}

fn diagnostic(label: &str, cause: &str) -> String {
    format!("\r\n[{label} closed: {cause}]\r\n")
}

/// Spawn a task reading `source` line by line into a bounded channel.
///
/// The task stops on cancellation (without a diagnostic), when the consumer
/// goes away, or after emitting [`FilterEvent::Closed`] on EOF or read error.
pub fn read_filtered<R>(
    label: &'static str,
    source: R,
    config: FilterConfig,
    cancel: CancellationToken,
    span: Span,
) -> FilteredLines
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::channel(config.buffer.max(1));
    let mut reader = LineReader::new(source).with_idle_flush(config.idle_flush);

    let task = tokio::spawn(
        async move {
            let send = |event: FilterEvent| {
                let tx = tx.clone();
                let cancel = cancel.clone();
                async move {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => false,
                        sent = tx.send(event) => sent.is_ok(),
                    }
                }
            };

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = reader.read_line(b'\n') => next,
                };

                match next {
                    Ok(Some(raw)) => {
                        if let Some(event) = classify(&raw) {
                            if !send(event).await {
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("{} reached end of stream", label);
                        send(FilterEvent::Closed(diagnostic(label, "end of stream"))).await;
                        break;
                    }
                    Err(e) => {
                        debug!("{} read failed: {}", label, e);
                        if let Some(event) = reader.take_pending().as_deref().and_then(classify) {
                            if !send(event).await {
                                break;
                            }
                        }
                        send(FilterEvent::Closed(diagnostic(label, &e.to_string()))).await;
                        break;
                    }
                }
            }
        }
        .instrument(span),
    );

    FilteredLines { rx, task }
}
