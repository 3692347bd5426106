/// Tone trigger library
///
/// Detects a target tone in live audio and raises a shared trigger that a
/// capture service consumes to take a photograph. Provides block capture,
/// decimation, smoothing, FFT peak extraction and band matching.

pub mod audio_buffer;
pub mod consumer;
pub mod decimator;
pub mod detector;
pub mod matcher;
pub mod replay;
pub mod session;
pub mod smoothing;
pub mod source;
pub mod spectrum;
pub mod trigger;

// Re-export main types
pub use audio_buffer::{AudioSample, ReadOutcome};
pub use consumer::{CapturePoller, CaptureSink, LoggingCaptureSink, PollOutcome, PollerConfig, PollerStats};
pub use detector::{
    BlockOutcome, ConfigError, DetectorConfig, DetectorError, DetectorStats, SessionStats,
    ToneDetector,
};
pub use matcher::{FrequencyBand, FrequencyMatcher, ParamsError, ToneMatch, ToneParams};
pub use replay::ReplayBackend;
pub use session::ToneTriggerSession;
pub use source::{AudioBackend, AudioSourceError, CaptureDevice, CaptureFormat, CpalBackend};
pub use spectrum::{SpectralAnalyzer, SpectralPoint};
pub use trigger::TriggerSignal;
