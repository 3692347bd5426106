/// Tone detector pipeline
///
/// Per delivered block: decimate, and on every Nth block smooth, transform,
/// extract peaks and match them against the target band. Runs synchronously
/// on the capture worker; a pass always completes before the next block is read.

use crate::audio_buffer::AudioSample;
use crate::decimator::{Decimator, DEFAULT_PROCESSING_INTERVAL};
use crate::matcher::{
    FrequencyMatcher, ParamsError, ToneMatch, ToneParams, DEFAULT_PEAK_CANDIDATES,
    DEFAULT_TARGET_FREQUENCY, DEFAULT_TOLERANCE_BINS,
};
use crate::smoothing::{moving_average, DEFAULT_HALF_WINDOW};
use crate::source::{AudioSourceError, CaptureFormat};
use crate::spectrum::{find_peaks, rank_by_magnitude, SpectralAnalyzer};
use crate::trigger::TriggerSignal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Default capture sample rate (Hz)
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Default analysis block size (samples)
pub const DEFAULT_BLOCK_SIZE: usize = 2048;

pub const MIN_BLOCK_SIZE: usize = 64;
pub const MAX_BLOCK_SIZE: usize = 65536;
pub const MAX_PEAK_CANDIDATES: usize = 16;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Source(#[from] AudioSourceError),

    #[error(transparent)]
    Params(#[from] ParamsError),

    #[error("Capture worker failed to start: {0}")]
    Worker(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Invalid(#[from] DetectorError),
}

/// Configuration for the tone detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Capture sample rate (Hz)
    pub sample_rate: u32,

    /// Samples per block and FFT size (power of two)
    pub block_size: usize,

    /// Blocks between analysis passes
    pub processing_interval: usize,

    /// Tone to detect (Hz)
    pub target_frequency: f64,

    /// Band half-width in FFT bins
    pub tolerance_bins: f64,

    /// Strongest peaks tested per pass (K)
    pub peak_candidates: usize,

    /// Moving average half-window (samples)
    pub smoothing_half_window: usize,

    /// Input device name; the host default when absent
    pub device_name: Option<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            block_size: DEFAULT_BLOCK_SIZE,
            processing_interval: DEFAULT_PROCESSING_INTERVAL,
            target_frequency: DEFAULT_TARGET_FREQUENCY,
            tolerance_bins: DEFAULT_TOLERANCE_BINS,
            peak_candidates: DEFAULT_PEAK_CANDIDATES,
            smoothing_half_window: DEFAULT_HALF_WINDOW,
            device_name: None,
        }
    }
}

impl DetectorConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), DetectorError> {
        if self.sample_rate == 0 {
            return Err(DetectorError::InvalidConfig(
                "sample_rate must be greater than 0".to_string(),
            ));
        }

        if !self.block_size.is_power_of_two()
            || self.block_size < MIN_BLOCK_SIZE
            || self.block_size > MAX_BLOCK_SIZE
        {
            return Err(DetectorError::InvalidConfig(format!(
                "block_size must be a power of two between {} and {}, got {}",
                MIN_BLOCK_SIZE, MAX_BLOCK_SIZE, self.block_size
            )));
        }

        if self.processing_interval == 0 {
            return Err(DetectorError::InvalidConfig(
                "processing_interval must be at least 1".to_string(),
            ));
        }

        let nyquist = self.sample_rate as f64 / 2.0;
        if !self.target_frequency.is_finite()
            || self.target_frequency <= 0.0
            || self.target_frequency >= nyquist
        {
            return Err(DetectorError::InvalidConfig(format!(
                "target_frequency must be between 0 and {} Hz, got {}",
                nyquist, self.target_frequency
            )));
        }

        if !self.tolerance_bins.is_finite() || self.tolerance_bins < 0.0 {
            return Err(DetectorError::InvalidConfig(format!(
                "tolerance_bins must be a non-negative number, got {}",
                self.tolerance_bins
            )));
        }

        if self.peak_candidates == 0 || self.peak_candidates > MAX_PEAK_CANDIDATES {
            return Err(DetectorError::InvalidConfig(format!(
                "peak_candidates must be between 1 and {}",
                MAX_PEAK_CANDIDATES
            )));
        }

        if self.smoothing_half_window >= self.block_size {
            return Err(DetectorError::InvalidConfig(
                "smoothing_half_window must be smaller than block_size".to_string(),
            ));
        }

        Ok(())
    }

    /// Parse and validate a JSON configuration. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Hz per FFT bin
    pub fn resolution(&self) -> f64 {
        self.sample_rate as f64 / self.block_size as f64
    }

    /// Duration of one block
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.block_size as f64 / self.sample_rate as f64)
    }

    /// Time between analysis passes; each pass must finish well inside it
    pub fn decimation_window(&self) -> Duration {
        self.block_duration() * self.processing_interval as u32
    }

    pub fn capture_format(&self) -> CaptureFormat {
        CaptureFormat::new(self.sample_rate, self.block_size)
    }

    /// Live parameters seeded from this configuration
    pub fn tone_params(&self) -> Result<ToneParams, DetectorError> {
        Ok(ToneParams::for_sample_rate(
            self.target_frequency,
            self.tolerance_bins,
            self.sample_rate,
        )?)
    }
}

/// Counters shared between the capture worker and observers
#[derive(Debug, Default)]
pub struct SessionStats {
    blocks_received: AtomicU64,
    passes_run: AtomicU64,
    detections: AtomicU64,
    budget_overruns: AtomicU64,
    last_pass_micros: AtomicU64,
    dropped_samples: AtomicU64,
}

impl SessionStats {
    pub fn record_dropped_samples(&self, total: u64) {
        self.dropped_samples.store(total, Ordering::Relaxed);
    }

    pub fn snapshot(&self, is_running: bool) -> DetectorStats {
        DetectorStats {
            blocks_received: self.blocks_received.load(Ordering::Relaxed),
            passes_run: self.passes_run.load(Ordering::Relaxed),
            detections: self.detections.load(Ordering::Relaxed),
            budget_overruns: self.budget_overruns.load(Ordering::Relaxed),
            last_pass_micros: self.last_pass_micros.load(Ordering::Relaxed),
            dropped_samples: self.dropped_samples.load(Ordering::Relaxed),
            is_running,
        }
    }

    pub fn reset(&self) {
        self.blocks_received.store(0, Ordering::Relaxed);
        self.passes_run.store(0, Ordering::Relaxed);
        self.detections.store(0, Ordering::Relaxed);
        self.budget_overruns.store(0, Ordering::Relaxed);
        self.last_pass_micros.store(0, Ordering::Relaxed);
        self.dropped_samples.store(0, Ordering::Relaxed);
    }
}

/// Detector statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorStats {
    pub blocks_received: u64,
    pub passes_run: u64,
    pub detections: u64,
    /// Passes that took longer than the decimation window
    pub budget_overruns: u64,
    pub last_pass_micros: u64,
    pub dropped_samples: u64,
    pub is_running: bool,
}

/// Outcome of feeding one block
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BlockOutcome {
    /// Block counted, no analysis this time
    Skipped,
    /// Analysis ran; `Some` when the tone was found
    Analyzed(Option<ToneMatch>),
}

/// The analysis pipeline for one capture session
pub struct ToneDetector {
    decimator: Decimator,
    half_window: usize,
    smoothed: Vec<f64>,
    analyzer: SpectralAnalyzer,
    matcher: FrequencyMatcher,
    params: Arc<ToneParams>,
    trigger: Arc<TriggerSignal>,
    stats: Arc<SessionStats>,
    budget: Duration,
}

impl ToneDetector {
    /// Build the pipeline. The configuration must already be valid.
    pub fn new(
        config: &DetectorConfig,
        params: Arc<ToneParams>,
        trigger: Arc<TriggerSignal>,
        stats: Arc<SessionStats>,
    ) -> Self {
        let analyzer = SpectralAnalyzer::new(config.sample_rate, config.block_size);
        let matcher = FrequencyMatcher::new(config.peak_candidates, analyzer.resolution());

        debug!(
            "Detector pipeline: block {} @ {} Hz, every {} blocks, K={}, window ±{}",
            config.block_size,
            config.sample_rate,
            config.processing_interval,
            config.peak_candidates,
            config.smoothing_half_window
        );

        Self {
            decimator: Decimator::new(config.processing_interval),
            half_window: config.smoothing_half_window,
            smoothed: vec![0.0; config.block_size],
            analyzer,
            matcher,
            params,
            trigger,
            stats,
            budget: config.decimation_window(),
        }
    }

    /// Handle one delivered block
    pub fn process_block(&mut self, block: &[AudioSample]) -> BlockOutcome {
        let blocks = self.stats.blocks_received.fetch_add(1, Ordering::Relaxed) + 1;
        trace!("Block {} received ({} samples)", blocks, block.len());

        if !self.decimator.tick() {
            return BlockOutcome::Skipped;
        }

        let started = Instant::now();
        let hit = self.analyze(block);
        let elapsed = started.elapsed();

        self.stats.passes_run.fetch_add(1, Ordering::Relaxed);
        self.stats
            .last_pass_micros
            .store(elapsed.as_micros() as u64, Ordering::Relaxed);

        if hit.is_some() {
            self.stats.detections.fetch_add(1, Ordering::Relaxed);
        }

        if elapsed > self.budget {
            self.stats.budget_overruns.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Analysis pass took {:?}, longer than the {:?} decimation window",
                elapsed, self.budget
            );
        }

        BlockOutcome::Analyzed(hit)
    }

    /// One full analysis pass over `block`, bypassing decimation
    pub fn analyze(&mut self, block: &[AudioSample]) -> Option<ToneMatch> {
        moving_average(block, self.half_window, &mut self.smoothed);

        let spectrum = self.analyzer.magnitude_spectrum(&self.smoothed[..block.len()]);
        let mut peaks = find_peaks(&spectrum);
        rank_by_magnitude(&mut peaks);

        trace!("Analysis pass found {} peaks", peaks.len());

        self.matcher.evaluate(&peaks, &self.params, &self.trigger)
    }

    /// Restart the decimation count, e.g. at session start
    pub fn reset(&mut self) {
        self.decimator.reset();
        info!("Detector reset");
    }

    pub fn resolution(&self) -> f64 {
        self.analyzer.resolution()
    }
}
