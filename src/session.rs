/// Capture session lifecycle
///
/// `start()` spawns a dedicated capture worker that opens a fresh device,
/// reads blocks and runs the detector inline. `stop()` signals the worker,
/// joins it and lets it release the device. Devices are never reused across
/// sessions.

use crate::audio_buffer::ReadOutcome;
use crate::detector::{DetectorConfig, DetectorError, DetectorStats, SessionStats, ToneDetector};
use crate::matcher::ToneParams;
use crate::source::{AudioBackend, AudioSourceError, CaptureDevice, CaptureFormat};
use crate::trigger::TriggerSignal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

struct CaptureWorker {
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Marks the worker finished however it exits, including by panic
struct FinishedGuard(Arc<AtomicBool>);

impl Drop for FinishedGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// A tone-triggered capture session over one audio backend
pub struct ToneTriggerSession<B: AudioBackend> {
    config: DetectorConfig,
    backend: Arc<B>,
    params: Arc<ToneParams>,
    trigger: Arc<TriggerSignal>,
    stats: Arc<SessionStats>,
    worker: Option<CaptureWorker>,
}

impl<B: AudioBackend> ToneTriggerSession<B> {
    /// Wire a session. `trigger` is shared with whatever consumes detections.
    pub fn new(
        config: DetectorConfig,
        backend: B,
        trigger: Arc<TriggerSignal>,
    ) -> Result<Self, DetectorError> {
        config.validate()?;

        info!("Initializing tone trigger session");
        info!("Source: {}", backend.describe());
        info!(
            "Target: {:.1} Hz ± {} bins ({:.2} Hz/bin)",
            config.target_frequency,
            config.tolerance_bins,
            config.resolution()
        );
        info!(
            "Analysis every {} blocks ({:?})",
            config.processing_interval,
            config.decimation_window()
        );

        let params = Arc::new(config.tone_params()?);

        Ok(Self {
            config,
            backend: Arc::new(backend),
            params,
            trigger,
            stats: Arc::new(SessionStats::default()),
            worker: None,
        })
    }

    /// Open a fresh device and start the capture worker.
    ///
    /// Returns once the device is open. `DeviceUnavailable` is returned as-is
    /// and nothing is retried.
    pub fn start(&mut self) -> Result<(), DetectorError> {
        if self.is_running() {
            warn!("Capture session already running");
            return Ok(());
        }

        // A worker that ended on its own (stream closed) is joined first
        if self.worker.is_some() {
            self.stop();
        }

        self.stats.reset();

        let stop = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let detector = ToneDetector::new(
            &self.config,
            Arc::clone(&self.params),
            Arc::clone(&self.trigger),
            Arc::clone(&self.stats),
        );

        let handle = {
            let backend = Arc::clone(&self.backend);
            let stats = Arc::clone(&self.stats);
            let format = self.config.capture_format();
            let stop = Arc::clone(&stop);
            let finished = Arc::clone(&finished);

            thread::Builder::new()
                .name("tone-capture".to_string())
                .spawn(move || {
                    run_capture_worker(backend, format, detector, stats, stop, finished, ready_tx)
                })
                .map_err(|e| DetectorError::Worker(e.to_string()))?
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(CaptureWorker {
                    stop,
                    finished,
                    handle,
                });
                info!("Capture session started");
                Ok(())
            }
            Ok(Err(e)) => {
                join_worker(handle);
                Err(e.into())
            }
            Err(_) => {
                join_worker(handle);
                Err(DetectorError::Worker(
                    "capture worker exited before opening the device".to_string(),
                ))
            }
        }
    }

    /// Stop capture, join the worker and release the device.
    ///
    /// An analysis pass already running completes first.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            warn!("Capture session not running");
            return;
        };

        worker.stop.store(true, Ordering::Release);
        worker.handle.thread().unpark();
        join_worker(worker.handle);

        debug!("Worker finished: {}", worker.finished.load(Ordering::Acquire));
        info!("Capture session stopped");
    }

    /// Wait for the worker to end on its own, e.g. at the end of a replay
    pub fn wait(&mut self) {
        if let Some(worker) = self.worker.take() {
            join_worker(worker.handle);
            info!("Capture session ended");
        }
    }

    /// True while the worker is reading from a device
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map_or(false, |w| !w.finished.load(Ordering::Acquire))
    }

    /// Live target frequency and tolerance
    pub fn params(&self) -> &Arc<ToneParams> {
        &self.params
    }

    pub fn trigger(&self) -> &Arc<TriggerSignal> {
        &self.trigger
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Statistics for the current (or last) session
    pub fn stats(&self) -> DetectorStats {
        self.stats.snapshot(self.is_running())
    }
}

impl<B: AudioBackend> Drop for ToneTriggerSession<B> {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

/// Join the worker. A panicked worker already released its device while
/// unwinding, so the failure is only logged.
fn join_worker(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        error!("Capture worker panicked; device released during unwind");
    }
}

fn run_capture_worker<B: AudioBackend>(
    backend: Arc<B>,
    format: CaptureFormat,
    mut detector: ToneDetector,
    stats: Arc<SessionStats>,
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    ready: mpsc::SyncSender<Result<(), AudioSourceError>>,
) {
    let _finished = FinishedGuard(finished);

    let mut device = match backend.open(&format) {
        Ok(device) => device,
        Err(e) => {
            error!("Failed to open capture device: {}", e);
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    // Block storage lives for the whole session
    let mut block = vec![0; format.block_size];
    detector.reset();

    loop {
        match device.read_block(&mut block, &stop) {
            ReadOutcome::Block => {
                detector.process_block(&block);
                stats.record_dropped_samples(device.dropped_samples());
            }
            ReadOutcome::Stopped => {
                debug!("Capture worker stopping");
                break;
            }
            ReadOutcome::Closed => {
                info!("Capture device closed its stream");
                break;
            }
        }
    }

    drop(device);
    debug!("Capture device released");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::ReplayBackend;
    use std::f64::consts::PI;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Endless silence, counting how many devices were opened
    #[derive(Default)]
    struct SilenceBackend {
        opened: Arc<AtomicUsize>,
        open_devices: Arc<AtomicUsize>,
    }

    struct SilenceDevice {
        open_devices: Arc<AtomicUsize>,
    }

    impl AudioBackend for SilenceBackend {
        type Device = SilenceDevice;

        fn open(&self, _format: &CaptureFormat) -> Result<SilenceDevice, AudioSourceError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.open_devices.fetch_add(1, Ordering::SeqCst);
            Ok(SilenceDevice {
                open_devices: Arc::clone(&self.open_devices),
            })
        }

        fn describe(&self) -> String {
            "silence".to_string()
        }
    }

    impl CaptureDevice for SilenceDevice {
        fn read_block(&mut self, block: &mut [i16], stop: &AtomicBool) -> ReadOutcome {
            if stop.load(Ordering::Acquire) {
                return ReadOutcome::Stopped;
            }
            thread::sleep(Duration::from_millis(1));
            block.fill(0);
            ReadOutcome::Block
        }
    }

    impl Drop for SilenceDevice {
        fn drop(&mut self) {
            self.open_devices.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct UnavailableBackend;

    impl AudioBackend for UnavailableBackend {
        type Device = SilenceDevice;

        fn open(&self, _format: &CaptureFormat) -> Result<SilenceDevice, AudioSourceError> {
            Err(AudioSourceError::DeviceUnavailable(
                "permission denied".to_string(),
            ))
        }

        fn describe(&self) -> String {
            "unavailable".to_string()
        }
    }

    /// Devices that panic on their fourth read
    #[derive(Default)]
    struct FaultyBackend {
        opened: Arc<AtomicUsize>,
        open_devices: Arc<AtomicUsize>,
    }

    struct FaultyDevice {
        reads: usize,
        open_devices: Arc<AtomicUsize>,
    }

    impl AudioBackend for FaultyBackend {
        type Device = FaultyDevice;

        fn open(&self, _format: &CaptureFormat) -> Result<FaultyDevice, AudioSourceError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.open_devices.fetch_add(1, Ordering::SeqCst);
            Ok(FaultyDevice {
                reads: 0,
                open_devices: Arc::clone(&self.open_devices),
            })
        }

        fn describe(&self) -> String {
            "faulty".to_string()
        }
    }

    impl CaptureDevice for FaultyDevice {
        fn read_block(&mut self, block: &mut [i16], stop: &AtomicBool) -> ReadOutcome {
            if stop.load(Ordering::Acquire) {
                return ReadOutcome::Stopped;
            }
            self.reads += 1;
            if self.reads == 4 {
                panic!("capture device fault");
            }
            block.fill(0);
            ReadOutcome::Block
        }
    }

    impl Drop for FaultyDevice {
        fn drop(&mut self) {
            self.open_devices.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn wait_until_stopped<B: AudioBackend>(session: &ToneTriggerSession<B>) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while session.is_running() {
            assert!(std::time::Instant::now() < deadline, "worker never finished");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn tone(frequency: f64, sample_rate: u32, len: usize) -> Vec<i16> {
        (0..len)
            .map(|i| {
                let t = i as f64 / sample_rate as f64;
                (0.5 * i16::MAX as f64 * (2.0 * PI * frequency * t).sin()) as i16
            })
            .collect()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = DetectorConfig {
            block_size: 1000,
            ..Default::default()
        };

        let result = ToneTriggerSession::new(
            config,
            SilenceBackend::default(),
            Arc::new(TriggerSignal::new()),
        );
        assert!(matches!(result, Err(DetectorError::InvalidConfig(_))));
    }

    #[test]
    fn test_start_stop() {
        let backend = SilenceBackend::default();
        let open_devices = Arc::clone(&backend.open_devices);
        let mut session =
            ToneTriggerSession::new(DetectorConfig::default(), backend, Arc::new(TriggerSignal::new()))
                .unwrap();

        assert!(!session.is_running());

        session.start().unwrap();
        assert!(session.is_running());
        assert_eq!(open_devices.load(Ordering::SeqCst), 1);

        session.stop();
        assert!(!session.is_running());
        assert_eq!(open_devices.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_restart_opens_fresh_device() {
        let backend = SilenceBackend::default();
        let opened = Arc::clone(&backend.opened);
        let mut session =
            ToneTriggerSession::new(DetectorConfig::default(), backend, Arc::new(TriggerSignal::new()))
                .unwrap();

        session.start().unwrap();
        session.stop();
        session.start().unwrap();
        session.stop();

        assert_eq!(opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_double_start_is_noop() {
        let backend = SilenceBackend::default();
        let opened = Arc::clone(&backend.opened);
        let mut session =
            ToneTriggerSession::new(DetectorConfig::default(), backend, Arc::new(TriggerSignal::new()))
                .unwrap();

        session.start().unwrap();
        session.start().unwrap();

        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_device_unavailable_surfaces_from_start() {
        let mut session = ToneTriggerSession::new(
            DetectorConfig::default(),
            UnavailableBackend,
            Arc::new(TriggerSignal::new()),
        )
        .unwrap();

        match session.start() {
            Err(DetectorError::Source(AudioSourceError::DeviceUnavailable(msg))) => {
                assert_eq!(msg, "permission denied");
            }
            other => panic!("Expected DeviceUnavailable, got {:?}", other),
        }
        assert!(!session.is_running());
    }

    #[test]
    fn test_drop_stops_worker() {
        let backend = SilenceBackend::default();
        let open_devices = Arc::clone(&backend.open_devices);

        {
            let mut session = ToneTriggerSession::new(
                DetectorConfig::default(),
                backend,
                Arc::new(TriggerSignal::new()),
            )
            .unwrap();
            session.start().unwrap();
        }

        assert_eq!(open_devices.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicked_worker_releases_device_and_restarts() {
        let backend = FaultyBackend::default();
        let opened = Arc::clone(&backend.opened);
        let open_devices = Arc::clone(&backend.open_devices);
        let mut session =
            ToneTriggerSession::new(DetectorConfig::default(), backend, Arc::new(TriggerSignal::new()))
                .unwrap();

        session.start().unwrap();
        wait_until_stopped(&session);

        assert!(!session.is_running());
        assert_eq!(session.stats().blocks_received, 3);

        session.stop();
        assert_eq!(open_devices.load(Ordering::SeqCst), 0);

        session.start().unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 2);

        wait_until_stopped(&session);
        session.stop();
        assert_eq!(open_devices.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_replayed_tone_raises_trigger() {
        let config = DetectorConfig::default();
        let samples = tone(3500.0, config.sample_rate, config.block_size * 10);
        let trigger = Arc::new(TriggerSignal::new());
        let mut session = ToneTriggerSession::new(
            config.clone(),
            ReplayBackend::from_samples(samples, config.sample_rate),
            Arc::clone(&trigger),
        )
        .unwrap();

        session.start().unwrap();
        session.wait();

        let stats = session.stats();
        assert_eq!(stats.blocks_received, 10);
        assert_eq!(stats.passes_run, 1);
        assert_eq!(stats.detections, 1);
        assert!(!stats.is_running);
        assert!(trigger.take());
    }

    #[test]
    fn test_retarget_between_sessions() {
        let config = DetectorConfig {
            processing_interval: 1,
            ..Default::default()
        };
        let samples = tone(1500.0, config.sample_rate, config.block_size * 2);
        let trigger = Arc::new(TriggerSignal::new());
        let mut session = ToneTriggerSession::new(
            config.clone(),
            ReplayBackend::from_samples(samples, config.sample_rate),
            Arc::clone(&trigger),
        )
        .unwrap();

        session.start().unwrap();
        session.wait();
        assert!(!trigger.take());

        session.params().set_target_frequency(1500.0).unwrap();
        session.start().unwrap();
        session.wait();
        assert!(trigger.take());
        assert_eq!(session.stats().passes_run, 2);
    }
}
