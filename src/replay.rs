/// Replay of recorded audio through the capture device contract
///
/// Lets a session run against a WAV recording or an in-memory signal instead
/// of a microphone, either as fast as possible or paced at real time.

use crate::audio_buffer::{AudioSample, ReadOutcome};
use crate::source::{AudioBackend, AudioSourceError, CaptureDevice, CaptureFormat};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Backend that plays back a fixed mono signal
#[derive(Debug, Clone)]
pub struct ReplayBackend {
    samples: Arc<Vec<AudioSample>>,
    sample_rate: u32,
    realtime: bool,
    origin: Option<PathBuf>,
}

impl ReplayBackend {
    /// Replay `samples` recorded at `sample_rate`
    pub fn from_samples(samples: Vec<AudioSample>, sample_rate: u32) -> Self {
        Self {
            samples: Arc::new(samples),
            sample_rate,
            realtime: false,
            origin: None,
        }
    }

    /// Load a WAV file. Multi-channel recordings are downmixed to mono;
    /// integer and float encodings are converted to 16-bit.
    pub fn from_wav(path: impl AsRef<Path>) -> Result<Self, AudioSourceError> {
        let path = path.as_ref();
        let reader = hound::WavReader::open(path)?;
        let spec = reader.spec();

        if spec.channels == 0 {
            return Err(AudioSourceError::InvalidRecording(
                "recording has no channels".to_string(),
            ));
        }

        let normalized: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Int => {
                if spec.bits_per_sample == 0 || spec.bits_per_sample > 32 {
                    return Err(AudioSourceError::InvalidRecording(format!(
                        "unsupported bit depth {}",
                        spec.bits_per_sample
                    )));
                }
                let scale = (1u64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<_, _>>()?
            }
            hound::SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<_, _>>()?,
        };

        let channels = spec.channels as usize;
        let samples: Vec<AudioSample> = normalized
            .chunks_exact(channels)
            .map(|frame| {
                let mono = frame.iter().sum::<f32>() / channels as f32;
                (mono * i16::MAX as f32)
                    .round()
                    .clamp(i16::MIN as f32, i16::MAX as f32) as AudioSample
            })
            .collect();

        info!(
            "Loaded recording {}: {} samples at {} Hz ({} channels)",
            path.display(),
            samples.len(),
            spec.sample_rate,
            spec.channels
        );

        Ok(Self {
            samples: Arc::new(samples),
            sample_rate: spec.sample_rate,
            realtime: false,
            origin: Some(path.to_path_buf()),
        })
    }

    /// Deliver blocks no faster than they would arrive from a live device
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl AudioBackend for ReplayBackend {
    type Device = ReplayDevice;

    fn open(&self, format: &CaptureFormat) -> Result<ReplayDevice, AudioSourceError> {
        if format.sample_rate != self.sample_rate {
            return Err(AudioSourceError::FormatMismatch {
                expected: format.sample_rate,
                actual: self.sample_rate,
            });
        }

        let block_period = if self.realtime {
            Some(Duration::from_secs_f64(
                format.block_size as f64 / format.sample_rate as f64,
            ))
        } else {
            None
        };

        debug!(
            "Replaying {} samples in blocks of {} (realtime: {})",
            self.samples.len(),
            format.block_size,
            self.realtime
        );

        Ok(ReplayDevice {
            samples: Arc::clone(&self.samples),
            position: 0,
            block_period,
            next_due: None,
        })
    }

    fn describe(&self) -> String {
        match &self.origin {
            Some(path) => format!("replay of {}", path.display()),
            None => format!("replay of {} samples", self.samples.len()),
        }
    }
}

/// Cursor over a replayed signal
pub struct ReplayDevice {
    samples: Arc<Vec<AudioSample>>,
    position: usize,
    block_period: Option<Duration>,
    next_due: Option<Instant>,
}

impl ReplayDevice {
    /// Samples not yet delivered
    pub fn remaining(&self) -> usize {
        self.samples.len() - self.position
    }
}

impl CaptureDevice for ReplayDevice {
    fn read_block(&mut self, block: &mut [AudioSample], stop: &AtomicBool) -> ReadOutcome {
        if stop.load(Ordering::Acquire) {
            return ReadOutcome::Stopped;
        }

        // A trailing partial block is never delivered
        let end = self.position + block.len();
        if end > self.samples.len() {
            return ReadOutcome::Closed;
        }

        if let Some(period) = self.block_period {
            let due = *self.next_due.get_or_insert_with(|| Instant::now() + period);
            let now = Instant::now();
            if due > now {
                thread::sleep(due - now);
            }
            self.next_due = Some(due + period);

            if stop.load(Ordering::Acquire) {
                return ReadOutcome::Stopped;
            }
        }

        block.copy_from_slice(&self.samples[self.position..end]);
        self.position = end;
        ReadOutcome::Block
    }
}
