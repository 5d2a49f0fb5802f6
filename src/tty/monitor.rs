//! Periodic host statistics pushed over a client session.
//!
//! [`StatsPusher::run`] samples `/proc` on the remote host at a fixed
//! interval and writes each sample as JSON until the client goes away,
//! a write fails, or the hub shuts down. The client never sends data on
//! this session; the reader only watches for the close frame.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::tty::client::ConnectionHandle;
use crate::tty::envelope::{CLEAN_CLOSE_CODES, Session};
use crate::tty::error::SessionError;
use crate::tty::types::HostStats;

/// Remote command producing the three sections parsed by [`parse_stats`].
pub const STATS_COMMAND: &str = "cat /proc/loadavg; echo ---; \
    grep -E '^(MemTotal|MemAvailable):' /proc/meminfo; echo ---; cat /proc/uptime";

/// Upper bound for one sample.
pub const DEFAULT_SAMPLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Where samples come from.
#[async_trait]
pub trait StatsSource: Send + Sync {
    /// Raw output of [`STATS_COMMAND`].
    async fn sample(&self, timeout: Duration) -> Result<String, String>;

    async fn close(&self);
}

#[async_trait]
impl StatsSource for ConnectionHandle {
    async fn sample(&self, timeout: Duration) -> Result<String, String> {
        let output = self.exec(STATS_COMMAND, timeout).await?;
        if output.timed_out {
            return Err(format!("stats command timed out after {:?}", timeout));
        }
        if output.exit_code != 0 {
            return Err(format!(
                "stats command exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            ));
        }
        Ok(output.stdout)
    }

    async fn close(&self) {
        if let Err(e) = self.disconnect().await {
            debug!("[{}] {}", self.id(), e);
        }
    }
}

/// Parse [`STATS_COMMAND`] output into a sample stamped with the current time.
pub fn parse_stats(host_id: &str, raw: &str) -> Result<HostStats, String> {
    let mut sections = raw.split("---");
    let loadavg = sections.next().unwrap_or_default();
    let meminfo = sections.next().ok_or("missing meminfo section")?;
    let uptime = sections.next().ok_or("missing uptime section")?;

    let loads: Vec<f64> = loadavg
        .split_whitespace()
        .take(3)
        .map(|v| v.parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("invalid loadavg: {}", e))?;
    let &[load_1, load_5, load_15] = loads.as_slice() else {
        return Err(format!("invalid loadavg: {:?}", loadavg.trim()));
    };

    let mut mem_total_kb = None;
    let mut mem_available_kb = None;
    for line in meminfo.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let value = value
            .parse::<u64>()
            .map_err(|e| format!("invalid {} value: {}", key, e))?;
        match key {
            "MemTotal:" => mem_total_kb = Some(value),
            "MemAvailable:" => mem_available_kb = Some(value),
            _ => {}
        }
    }

    let uptime_secs = uptime
        .split_whitespace()
        .next()
        .ok_or("empty uptime")?
        .parse::<f64>()
        .map_err(|e| format!("invalid uptime: {}", e))?;

    Ok(HostStats {
        host_id: host_id.to_string(),
        sampled_at: chrono::Utc::now().to_rfc3339(),
        load_1,
        load_5,
        load_15,
        mem_total_kb: mem_total_kb.ok_or("missing MemTotal")?,
        mem_available_kb: mem_available_kb.ok_or("missing MemAvailable")?,
        uptime_secs,
    })
}

/// Pushes [`HostStats`] for one host over one session.
#[derive(Debug, Clone)]
pub struct StatsPusher {
    host_id: String,
    interval: Duration,
    sample_timeout: Duration,
}

impl StatsPusher {
    pub fn new(host_id: impl Into<String>, interval: Duration) -> Self {
        Self {
            host_id: host_id.into(),
            interval,
            sample_timeout: DEFAULT_SAMPLE_TIMEOUT,
        }
    }

    pub fn with_sample_timeout(mut self, timeout: Duration) -> Self {
        self.sample_timeout = timeout;
        self
    }

    /// Push samples until the session is done; returns how many were sent.
    ///
    /// The first sample goes out immediately. A failed sample is logged and
    /// skipped. On return the source is closed, the session has exited and
    /// its reader has been joined.
    pub async fn run<S>(&self, source: Arc<S>, session: Arc<Session>) -> Result<u64, SessionError>
    where
        S: StatsSource + ?Sized,
    {
        session.await_close(CLEAN_CLOSE_CODES)?;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pushed = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = session.done() => break,
                _ = ticker.tick() => {}
            }

            let sample = tokio::select! {
                biased;
                _ = session.done() => break,
                sample = source.sample(self.sample_timeout) => sample,
            };

            let stats = match sample.and_then(|raw| parse_stats(&self.host_id, &raw)) {
                Ok(stats) => stats,
                Err(e) => {
                    warn!("Stats sample for {} failed: {}", self.host_id, e);
                    continue;
                }
            };

            if let Err(e) = session.write_json(&stats).await {
                debug!("Stats push for {} stopped: {}", self.host_id, e);
                break;
            }
            pushed += 1;
        }

        source.close().await;
        session.exit().await;
        session.join_reader().await;
        info!(
            "Stats push for {} ended after {} sample(s)",
            self.host_id, pushed
        );
        Ok(pushed)
    }
}
