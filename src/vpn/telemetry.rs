//! Live connection telemetry
//!
//! Two tasks run while a connection is up:
//! - the sampler polls cumulative counters every `poll_interval` and turns the
//!   deltas into throughput
//! - the clock reports elapsed connection time every `clock_interval`
//!
//! Both are owned by the connection manager, started on entering `Connected`
//! and stopped on any exit. The throughput baseline is handed to
//! [`TelemetryBaseline::advance`] and the successor stored back each tick.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::connection::{self, ConnectionEvent, ConnectionState};
use crate::backend::Backend;
use crate::error::SdkError;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_CLOCK_INTERVAL: Duration = Duration::from_secs(1);

/// Where the sampler reads cumulative counters from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TelemetrySource {
    /// `Backend::vpn_stats`
    #[default]
    Stats,
    /// `Backend::current_session`
    Session,
}

/// Instantaneous transfer rates in bytes per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Throughput {
    pub down_bytes_per_sec: f64,
    pub up_bytes_per_sec: f64,
}

impl Throughput {
    pub const ZERO: Throughput = Throughput {
        down_bytes_per_sec: 0.0,
        up_bytes_per_sec: 0.0,
    };
}

/// One published telemetry point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySample {
    pub throughput: Throughput,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub total_transferred: u64,
}

impl TelemetrySample {
    fn new(throughput: Throughput, bytes_received: u64, bytes_sent: u64) -> Self {
        Self {
            throughput,
            bytes_received,
            bytes_sent,
            total_transferred: bytes_received.saturating_add(bytes_sent),
        }
    }
}

/// Last-sampled cumulative counters.
///
/// An unprimed baseline takes the next observation as its starting point and
/// reports zero throughput, so lifetime totals never show up as a spike.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryBaseline {
    pub previous_bytes_received: u64,
    pub previous_bytes_sent: u64,
    pub previous_sample_time: Instant,
    primed: bool,
}

impl TelemetryBaseline {
    pub fn new(now: Instant) -> Self {
        Self {
            previous_bytes_received: 0,
            previous_bytes_sent: 0,
            previous_sample_time: now,
            primed: false,
        }
    }

    pub fn is_primed(&self) -> bool {
        self.primed
    }

    /// Fold one observation into the baseline.
    ///
    /// Returns the successor baseline and the derived throughput, or `None`
    /// when no time has passed since the previous sample (the baseline is then
    /// returned unchanged).
    pub fn advance(
        self,
        bytes_received: u64,
        bytes_sent: u64,
        now: Instant,
    ) -> (TelemetryBaseline, Option<Throughput>) {
        let next = TelemetryBaseline {
            previous_bytes_received: bytes_received,
            previous_bytes_sent: bytes_sent,
            previous_sample_time: now,
            primed: true,
        };

        if !self.primed {
            return (next, Some(Throughput::ZERO));
        }

        let elapsed = now
            .checked_duration_since(self.previous_sample_time)
            .unwrap_or_default()
            .as_secs_f64();
        if elapsed <= 0.0 {
            return (self, None);
        }

        let rate = |current: u64, previous: u64| {
            (current.saturating_sub(previous) as f64 / elapsed).max(0.0)
        };
        let throughput = Throughput {
            down_bytes_per_sec: rate(bytes_received, self.previous_bytes_received),
            up_bytes_per_sec: rate(bytes_sent, self.previous_bytes_sent),
        };
        (next, Some(throughput))
    }
}

/// Handles to the running sampler and clock.
pub(crate) struct SessionTasks {
    stop_tx: watch::Sender<bool>,
    sampler: JoinHandle<()>,
    clock: JoinHandle<()>,
}

impl SessionTasks {
    pub(crate) fn spawn(
        backend: Arc<dyn Backend>,
        state: Arc<Mutex<ConnectionState>>,
        events: broadcast::Sender<ConnectionEvent>,
        generation: u64,
        options: &connection::ConnectionOptions,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);

        let sampler = Sampler {
            backend,
            state: Arc::clone(&state),
            events: events.clone(),
            generation,
            interval: options.poll_interval,
            request_timeout: options.request_timeout,
            source: options.telemetry_source,
        };
        let sampler = tokio::spawn(sampler.run(stop_rx.clone()));
        let clock = tokio::spawn(run_clock(
            state,
            events,
            generation,
            options.clock_interval,
            stop_rx,
        ));

        Self {
            stop_tx,
            sampler,
            clock,
        }
    }

    pub(crate) fn is_sampling(&self) -> bool {
        !self.sampler.is_finished()
    }

    /// Signal both tasks and wait for them. An in-flight sample completes
    /// first; the tasks only look at the stop signal between ticks.
    pub(crate) async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.sampler.await {
            log::warn!("Telemetry sampler ended abnormally: {}", e);
        }
        if let Err(e) = self.clock.await {
            log::warn!("Connection clock ended abnormally: {}", e);
        }
    }
}

enum Tick {
    Continue,
    Stop,
}

struct Sampler {
    backend: Arc<dyn Backend>,
    state: Arc<Mutex<ConnectionState>>,
    events: broadcast::Sender<ConnectionEvent>,
    generation: u64,
    interval: Duration,
    request_timeout: Duration,
    source: TelemetrySource,
}

impl Sampler {
    async fn run(self, mut stop: watch::Receiver<bool>) {
        log::info!(
            "Telemetry sampler started ({}ms, source {:?})",
            self.interval.as_millis(),
            self.source
        );

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => break,
            }
            if *stop.borrow() {
                break;
            }
            if let Tick::Stop = self.tick().await {
                break;
            }
        }

        log::info!("Telemetry sampler stopped");
    }

    async fn tick(&self) -> Tick {
        match connection::with_timeout(self.request_timeout, "status check", self.backend.is_connected())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                connection::handle_connection_lost(&self.state, &self.events, self.generation).await;
                return Tick::Stop;
            }
            Err(e) => {
                log::warn!("Telemetry: status check failed, skipping tick: {}", e);
                return Tick::Continue;
            }
        }

        let polled = match self.read_counters().await {
            Ok(Some(polled)) => polled,
            Ok(None) => return Tick::Continue,
            Err(e) => {
                log::warn!("Telemetry: failed to read counters, skipping tick: {}", e);
                return Tick::Continue;
            }
        };
        let now = Instant::now();

        let mut state = self.state.lock().await;
        if state.generation() != self.generation || !state.phase().is_connected() {
            return Tick::Stop;
        }

        let (bytes_received, bytes_sent) = (polled.bytes_received, polled.bytes_sent);
        state.mirror_session(polled.session, bytes_received, bytes_sent);

        let (baseline, throughput) = state.baseline().advance(bytes_received, bytes_sent, now);
        state.set_baseline(baseline);
        let Some(throughput) = throughput else {
            log::debug!("Telemetry: no time elapsed since last sample");
            return Tick::Continue;
        };

        let sample = TelemetrySample::new(throughput, bytes_received, bytes_sent);
        state.set_last_sample(Some(sample.clone()));
        drop(state);

        log::debug!(
            "Telemetry: down {} up {} total {}",
            format_speed(throughput.down_bytes_per_sec),
            format_speed(throughput.up_bytes_per_sec),
            format_bytes(sample.total_transferred)
        );
        let _ = self.events.send(ConnectionEvent::Telemetry(sample));
        Tick::Continue
    }

    async fn read_counters(&self) -> Result<Option<PolledCounters>, SdkError> {
        match self.source {
            TelemetrySource::Stats => {
                let stats = connection::with_timeout(
                    self.request_timeout,
                    "stats query",
                    self.backend.vpn_stats(),
                )
                .await?;
                if !stats.connected {
                    return Ok(None);
                }
                Ok(Some(PolledCounters {
                    bytes_received: stats.bytes_received,
                    bytes_sent: stats.bytes_sent,
                    session: None,
                }))
            }
            TelemetrySource::Session => {
                let session = connection::with_timeout(
                    self.request_timeout,
                    "session query",
                    self.backend.current_session(),
                )
                .await?;
                Ok(Some(PolledCounters {
                    bytes_received: session.bytes_received,
                    bytes_sent: session.bytes_sent,
                    session: Some(session),
                }))
            }
        }
    }
}

struct PolledCounters {
    bytes_received: u64,
    bytes_sent: u64,
    session: Option<crate::vpn::session::Session>,
}

async fn run_clock(
    state: Arc<Mutex<ConnectionState>>,
    events: broadcast::Sender<ConnectionEvent>,
    generation: u64,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => break,
        }
        if *stop.borrow() {
            break;
        }

        let elapsed = {
            let state = state.lock().await;
            if state.generation() != generation {
                break;
            }
            match state.phase().connected_since() {
                Some(since) => since.elapsed(),
                None => break,
            }
        };
        let _ = events.send(ConnectionEvent::Elapsed(elapsed));
    }
}

/// `HH:MM:SS`, whole seconds.
pub fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn scale(value: f64, units: &[&str], decimals: usize) -> String {
    let mut value = value;
    let mut unit = 0;
    while value >= 1024.0 && unit < units.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.*} {}", decimals, value, units[unit])
}

pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }
    scale(bytes as f64, &["B", "KB", "MB", "GB", "TB"], 2)
}

pub fn format_speed(bytes_per_sec: f64) -> String {
    if bytes_per_sec.is_nan() || bytes_per_sec <= 0.0 {
        return "0 B/s".to_string();
    }
    scale(bytes_per_sec, &["B/s", "KB/s", "MB/s", "GB/s"], 1)
}
