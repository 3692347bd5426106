/// Audio sources
///
/// An `AudioBackend` opens a `CaptureDevice` for one capture session. The
/// device delivers fixed-size blocks of mono 16-bit PCM through a blocking
/// read. Devices are opened on the thread that reads from them and dropped at
/// session end; a new session always opens a fresh device.

use crate::audio_buffer::{block_ring, AudioSample, BlockReader, BlockWriter, ReadOutcome};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use std::sync::atomic::AtomicBool;
use std::thread;
use thiserror::Error;
use tracing::{debug, error, info};

/// Ring capacity in blocks, relative to the analysis block size
pub const RING_BLOCKS: usize = 8;

#[derive(Error, Debug)]
pub enum AudioSourceError {
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Sample rate mismatch: expected {expected} Hz, recording is {actual} Hz")]
    FormatMismatch { expected: u32, actual: u32 },

    #[error("Failed to read recording: {0}")]
    Recording(#[from] hound::Error),

    #[error("Invalid recording: {0}")]
    InvalidRecording(String),
}

/// What a session asks the device for: mono, signed 16-bit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub sample_rate: u32,
    /// Samples per delivered block
    pub block_size: usize,
    /// Minimum samples the device side must be able to buffer
    pub min_buffer_samples: usize,
}

impl CaptureFormat {
    pub fn new(sample_rate: u32, block_size: usize) -> Self {
        Self {
            sample_rate,
            block_size,
            min_buffer_samples: block_size * RING_BLOCKS,
        }
    }
}

/// An open capture device
pub trait CaptureDevice {
    /// Block until `block.len()` new samples are available and copy them in.
    ///
    /// Returns `Stopped` once `stop` is observed and `Closed` when the device
    /// will not produce any more samples.
    fn read_block(&mut self, block: &mut [AudioSample], stop: &AtomicBool) -> ReadOutcome;

    /// Samples lost because the reader fell behind
    fn dropped_samples(&self) -> u64 {
        0
    }
}

/// Opens capture devices. Shared with the capture worker thread.
pub trait AudioBackend: Send + Sync + 'static {
    type Device: CaptureDevice;

    /// Acquire a device. Called on the thread that will read from it.
    fn open(&self, format: &CaptureFormat) -> Result<Self::Device, AudioSourceError>;

    /// Human readable backend description for logs
    fn describe(&self) -> String;
}

/// Live microphone capture through cpal
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    device_name: Option<String>,
}

impl CpalBackend {
    /// Use the host's default input device
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the input device with this exact name
    pub fn with_device(name: impl Into<String>) -> Self {
        Self {
            device_name: Some(name.into()),
        }
    }

    fn find_device(&self) -> Result<Device, AudioSourceError> {
        let host = cpal::default_host();

        match &self.device_name {
            Some(name) => host
                .input_devices()
                .map_err(|e| AudioSourceError::DeviceUnavailable(e.to_string()))?
                .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                .ok_or_else(|| {
                    AudioSourceError::DeviceUnavailable(format!("input device not found: {}", name))
                }),
            None => host.default_input_device().ok_or_else(|| {
                AudioSourceError::DeviceUnavailable("no default input device".to_string())
            }),
        }
    }
}

impl AudioBackend for CpalBackend {
    type Device = CpalDevice;

    fn open(&self, format: &CaptureFormat) -> Result<CpalDevice, AudioSourceError> {
        let device = self.find_device()?;
        let device_label = device.name().unwrap_or_else(|_| "<unnamed>".to_string());

        let supported = device
            .supported_input_configs()
            .map_err(|e| AudioSourceError::DeviceUnavailable(e.to_string()))?
            .filter(|c| {
                (c.min_sample_rate().0..=c.max_sample_rate().0).contains(&format.sample_rate)
            })
            .min_by_key(|c| (c.channels(), format_preference(c.sample_format())))
            .ok_or_else(|| {
                AudioSourceError::DeviceUnavailable(format!(
                    "{} does not support {} Hz capture",
                    device_label, format.sample_rate
                ))
            })?
            .with_sample_rate(cpal::SampleRate(format.sample_rate));

        let channels = supported.channels() as usize;
        let sample_format = supported.sample_format();
        let config = StreamConfig {
            channels: supported.channels(),
            sample_rate: supported.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        debug!(
            "Input config for {}: {} Hz, {} channels, {:?}",
            device_label, format.sample_rate, channels, sample_format
        );

        let (writer, reader) = block_ring(format.min_buffer_samples, thread::current());

        let stream = match sample_format {
            SampleFormat::I16 => build_stream::<i16>(&device, &config, channels, format, writer),
            SampleFormat::U16 => build_stream::<u16>(&device, &config, channels, format, writer),
            SampleFormat::F32 => build_stream::<f32>(&device, &config, channels, format, writer),
            other => {
                return Err(AudioSourceError::DeviceUnavailable(format!(
                    "unsupported sample format {:?}",
                    other
                )))
            }
        }
        .map_err(|e| AudioSourceError::DeviceUnavailable(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioSourceError::DeviceUnavailable(e.to_string()))?;

        info!("Capturing from {} at {} Hz", device_label, format.sample_rate);

        Ok(CpalDevice {
            _stream: stream,
            reader,
        })
    }

    fn describe(&self) -> String {
        match &self.device_name {
            Some(name) => format!("cpal input '{}'", name),
            None => "cpal default input".to_string(),
        }
    }
}

/// Open cpal input stream. Dropping it stops the stream and releases the device.
pub struct CpalDevice {
    _stream: cpal::Stream,
    reader: BlockReader,
}

impl CaptureDevice for CpalDevice {
    fn read_block(&mut self, block: &mut [AudioSample], stop: &AtomicBool) -> ReadOutcome {
        self.reader.read_block(block, stop)
    }

    fn dropped_samples(&self) -> u64 {
        self.reader.dropped_samples()
    }
}

/// Lower is better: native 16-bit first, then float, then unsigned
fn format_preference(format: SampleFormat) -> u8 {
    match format {
        SampleFormat::I16 => 0,
        SampleFormat::F32 => 1,
        SampleFormat::U16 => 2,
        _ => 3,
    }
}

/// Build an input stream that converts to i16, downmixes to mono and feeds the ring
fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    channels: usize,
    format: &CaptureFormat,
    mut writer: BlockWriter,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample,
    i16: cpal::FromSample<T>,
{
    let closer = writer.closer();
    let channels = channels.max(1);
    // Callbacks never deliver more than the ring holds
    let mut mono: Vec<AudioSample> = Vec::with_capacity(format.min_buffer_samples);

    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            downmix_to_mono(data, channels, &mut mono);
            writer.write(&mono);
        },
        move |err| {
            error!("Audio stream error: {}", err);
            if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                closer.close();
            }
        },
        None,
    )
}

/// Average interleaved frames into mono i16, reusing `mono`'s allocation
fn downmix_to_mono<T>(data: &[T], channels: usize, mono: &mut Vec<AudioSample>)
where
    T: cpal::Sample,
    i16: cpal::FromSample<T>,
{
    mono.clear();
    mono.extend(data.chunks(channels).map(|frame| {
        let sum: i32 = frame
            .iter()
            .map(|&s| {
                let sample: i16 = cpal::Sample::from_sample(s);
                sample as i32
            })
            .sum();
        (sum / frame.len() as i32) as i16
    }));
}
