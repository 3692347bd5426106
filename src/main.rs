/// Tone trigger service binary
///
/// Listens for the configured tone and requests a capture each time it is
/// heard. Replays a WAV recording instead of the microphone when
/// `TONE_REPLAY_WAV` is set.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tone_trigger::{
    AudioBackend, CapturePoller, CpalBackend, DetectorConfig, LoggingCaptureSink, PollerConfig,
    ReplayBackend, ToneTriggerSession, TriggerSignal,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How often the main task checks whether a replay has run out
const SESSION_CHECK_INTERVAL: Duration = Duration::from_millis(500);

struct ServiceConfig {
    detector: DetectorConfig,
    poller: PollerConfig,
    replay_wav: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    info!("Starting tone trigger service");

    let config = match load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    let result = match &config.replay_wav {
        Some(path) => match ReplayBackend::from_wav(path) {
            Ok(backend) => run(config.detector, config.poller, backend.realtime(true)).await,
            Err(e) => Err(e).with_context(|| format!("loading {}", path.display())),
        },
        None => {
            let backend = match &config.detector.device_name {
                Some(name) => CpalBackend::with_device(name.clone()),
                None => CpalBackend::new(),
            };
            run(config.detector, config.poller, backend).await
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }

    info!("Tone trigger service stopped");
}

fn init_tracing() {
    let filter = EnvFilter::from_default_env();
    let filter = match "tone_trigger=debug".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run<B: AudioBackend>(
    detector: DetectorConfig,
    poller_config: PollerConfig,
    backend: B,
) -> Result<()> {
    let trigger = Arc::new(TriggerSignal::new());

    let mut session = ToneTriggerSession::new(detector, backend, Arc::clone(&trigger))
        .context("creating capture session")?;
    session.start().context("starting capture")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = CapturePoller::new(trigger, Arc::new(LoggingCaptureSink), poller_config);
    let poller_task = tokio::spawn(poller.run(shutdown_rx));

    info!(
        "Listening for {:.1} Hz. Press Ctrl-C to stop.",
        session.params().target_frequency()
    );

    let mut check = tokio::time::interval(SESSION_CHECK_INTERVAL);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Shutdown requested");
                break;
            }
            _ = check.tick() => {
                if !session.is_running() {
                    info!("Capture source finished");
                    break;
                }
            }
        }
    }

    session.stop();
    let stats = session.stats();
    info!(
        "Session: {} blocks, {} passes, {} detections, {} budget overruns, {} dropped samples",
        stats.blocks_received,
        stats.passes_run,
        stats.detections,
        stats.budget_overruns,
        stats.dropped_samples
    );

    let _ = shutdown_tx.send(true);
    let poller_stats = poller_task.await.context("capture poller task failed")?;
    info!("Captures accepted: {}", poller_stats.captures_accepted);

    Ok(())
}

/// Load configuration from an optional JSON file plus environment overrides
fn load_config() -> Result<ServiceConfig> {
    let mut detector = match std::env::var("TONE_TRIGGER_CONFIG") {
        Ok(path) => DetectorConfig::from_json_file(&path)
            .with_context(|| format!("reading config file {}", path))?,
        Err(_) => DetectorConfig::default(),
    };

    if let Some(target) = env_parse::<f64>("TONE_TARGET_FREQUENCY")? {
        detector.target_frequency = target;
    }
    if let Some(tolerance) = env_parse::<f64>("TONE_TOLERANCE_BINS")? {
        detector.tolerance_bins = tolerance;
    }
    if let Some(interval) = env_parse::<usize>("TONE_PROCESSING_INTERVAL")? {
        detector.processing_interval = interval;
    }
    if let Ok(device) = std::env::var("TONE_INPUT_DEVICE") {
        detector.device_name = Some(device);
    }

    detector.validate().context("invalid detector configuration")?;

    let mut poller = PollerConfig::default();
    if let Some(ms) = env_parse::<u64>("TONE_POLL_INTERVAL_MS")? {
        poller.poll_interval_ms = ms;
    }
    if let Some(ms) = env_parse::<u64>("TONE_CAPTURE_COOLDOWN_MS")? {
        poller.cooldown_ms = ms;
    }

    let replay_wav = std::env::var("TONE_REPLAY_WAV").ok().map(PathBuf::from);

    Ok(ServiceConfig {
        detector,
        poller,
        replay_wav,
    })
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("{} has invalid value '{}'", name, value)),
        Err(_) => Ok(None),
    }
}
