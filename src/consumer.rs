/// Capture consumer
///
/// Polls the trigger at a coarse fixed interval and forwards detections to a
/// capture service. Bursts of detections are absorbed here by a cooldown after
/// each accepted capture; the detector itself has no notion of a capture in
/// flight.

use crate::trigger::TriggerSignal;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Default trigger polling interval (ms)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 200;

/// Default minimum time between accepted captures (ms)
pub const DEFAULT_CAPTURE_COOLDOWN_MS: u64 = 2000;

/// Something that can take a photograph
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CaptureSink: Send + Sync {
    /// Request a capture. `true` if accepted, `false` if the service is busy.
    async fn capture(&self) -> bool;
}

/// Sink that only logs requests; stands in for a camera service
#[derive(Debug, Default)]
pub struct LoggingCaptureSink;

#[async_trait]
impl CaptureSink for LoggingCaptureSink {
    async fn capture(&self) -> bool {
        info!("Capture requested");
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub poll_interval_ms: u64,
    pub cooldown_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            cooldown_ms: DEFAULT_CAPTURE_COOLDOWN_MS,
        }
    }
}

impl PollerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// What one poll did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Trigger was not raised
    Idle,
    /// Trigger cleared inside the cooldown window; no capture requested
    Suppressed,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollerStats {
    pub captures_requested: u64,
    pub captures_accepted: u64,
    pub captures_rejected: u64,
    pub suppressed: u64,
}

/// Reads and clears the trigger, requesting a capture when it was raised
pub struct CapturePoller<S: CaptureSink + ?Sized> {
    trigger: Arc<TriggerSignal>,
    sink: Arc<S>,
    config: PollerConfig,
    last_accepted: Option<Instant>,
    stats: PollerStats,
}

impl<S: CaptureSink + ?Sized> CapturePoller<S> {
    pub fn new(trigger: Arc<TriggerSignal>, sink: Arc<S>, config: PollerConfig) -> Self {
        debug!(
            "Capture poller: every {} ms, cooldown {} ms",
            config.poll_interval_ms, config.cooldown_ms
        );

        Self {
            trigger,
            sink,
            config,
            last_accepted: None,
            stats: PollerStats::default(),
        }
    }

    /// Test-and-clear the trigger once
    pub async fn poll_once(&mut self) -> PollOutcome {
        if !self.trigger.take() {
            return PollOutcome::Idle;
        }

        let now = Instant::now();
        if let Some(last) = self.last_accepted {
            if now.duration_since(last) < self.config.cooldown() {
                self.stats.suppressed += 1;
                debug!("Trigger within capture cooldown, ignored");
                return PollOutcome::Suppressed;
            }
        }

        self.stats.captures_requested += 1;

        if self.sink.capture().await {
            self.stats.captures_accepted += 1;
            self.last_accepted = Some(now);
            PollOutcome::Accepted
        } else {
            self.stats.captures_rejected += 1;
            info!("Capture service busy, request rejected");
            PollOutcome::Rejected
        }
    }

    /// Poll until `shutdown` turns true or its sender is dropped
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> PollerStats {
        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Capture poller started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            "Capture poller stopped: {} requested, {} accepted, {} rejected, {} suppressed",
            self.stats.captures_requested,
            self.stats.captures_accepted,
            self.stats.captures_rejected,
            self.stats.suppressed
        );

        self.stats
    }

    pub fn stats(&self) -> &PollerStats {
        &self.stats
    }
}
