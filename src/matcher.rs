/// Frequency band matching
///
/// Compares the strongest spectral peaks of an analysis pass against a band
/// centered on the target frequency and raises the trigger on the first hit.
/// The band half-width is a number of FFT bins, so detection width follows the
/// transform's actual resolution when the block size changes.

use crate::spectrum::SpectralPoint;
use crate::trigger::TriggerSignal;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info};

/// Default target frequency (Hz)
pub const DEFAULT_TARGET_FREQUENCY: f64 = 3500.0;

/// Default band half-width in bins
pub const DEFAULT_TOLERANCE_BINS: f64 = 3.0;

/// Default number of ranked peaks tested per pass
pub const DEFAULT_PEAK_CANDIDATES: usize = 5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParamsError {
    #[error("Target frequency must be a positive finite number, got {0}")]
    InvalidTarget(f64),

    #[error("Target frequency {target} Hz is at or above the {nyquist} Hz Nyquist limit")]
    AboveNyquist { target: f64, nyquist: f64 },

    #[error("Tolerance must be a non-negative finite number of bins, got {0}")]
    InvalidTolerance(f64),
}

/// Inclusive frequency interval centered on the target
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrequencyBand {
    pub lower_hz: f64,
    pub upper_hz: f64,
}

impl FrequencyBand {
    /// `target ± tolerance_bins × resolution`
    pub fn resolution_scaled(target_hz: f64, tolerance_bins: f64, resolution: f64) -> Self {
        let half_width = tolerance_bins * resolution;
        Self {
            lower_hz: target_hz - half_width,
            upper_hz: target_hz + half_width,
        }
    }

    pub fn contains(&self, frequency_hz: f64) -> bool {
        frequency_hz >= self.lower_hz && frequency_hz <= self.upper_hz
    }

    pub fn center(&self) -> f64 {
        (self.lower_hz + self.upper_hz) / 2.0
    }
}

/// Target frequency and tolerance, adjustable while a session runs.
///
/// Values are stored as `f64` bit patterns in relaxed atomics. A write from the
/// control side becomes visible to the capture worker on some later pass; no
/// lock is taken on the analysis path.
#[derive(Debug)]
pub struct ToneParams {
    target_hz: AtomicU64,
    tolerance_bins: AtomicU64,
    /// Targets must stay below this (Nyquist for the capture rate)
    target_limit_hz: f64,
}

impl ToneParams {
    /// Parameters with no upper bound on the target
    pub fn new(target_hz: f64, tolerance_bins: f64) -> Result<Self, ParamsError> {
        Self::with_limit(target_hz, tolerance_bins, f64::INFINITY)
    }

    /// Parameters for capture at `sample_rate`. Targets at or above Nyquist
    /// are rejected, at construction and on every later retarget.
    pub fn for_sample_rate(
        target_hz: f64,
        tolerance_bins: f64,
        sample_rate: u32,
    ) -> Result<Self, ParamsError> {
        Self::with_limit(target_hz, tolerance_bins, sample_rate as f64 / 2.0)
    }

    fn with_limit(
        target_hz: f64,
        tolerance_bins: f64,
        target_limit_hz: f64,
    ) -> Result<Self, ParamsError> {
        validate_target(target_hz, target_limit_hz)?;
        validate_tolerance(tolerance_bins)?;

        Ok(Self {
            target_hz: AtomicU64::new(target_hz.to_bits()),
            tolerance_bins: AtomicU64::new(tolerance_bins.to_bits()),
            target_limit_hz,
        })
    }

    pub fn target_frequency(&self) -> f64 {
        f64::from_bits(self.target_hz.load(Ordering::Relaxed))
    }

    pub fn tolerance_bins(&self) -> f64 {
        f64::from_bits(self.tolerance_bins.load(Ordering::Relaxed))
    }

    pub fn set_target_frequency(&self, target_hz: f64) -> Result<(), ParamsError> {
        validate_target(target_hz, self.target_limit_hz)?;
        self.target_hz.store(target_hz.to_bits(), Ordering::Relaxed);
        info!("Target frequency set to {:.1} Hz", target_hz);
        Ok(())
    }

    pub fn set_tolerance_bins(&self, tolerance_bins: f64) -> Result<(), ParamsError> {
        validate_tolerance(tolerance_bins)?;
        self.tolerance_bins
            .store(tolerance_bins.to_bits(), Ordering::Relaxed);
        info!("Tolerance set to {} bins", tolerance_bins);
        Ok(())
    }

    /// Band for the current parameters at the given resolution
    pub fn band(&self, resolution: f64) -> FrequencyBand {
        FrequencyBand::resolution_scaled(self.target_frequency(), self.tolerance_bins(), resolution)
    }
}

impl Default for ToneParams {
    fn default() -> Self {
        Self {
            target_hz: AtomicU64::new(DEFAULT_TARGET_FREQUENCY.to_bits()),
            tolerance_bins: AtomicU64::new(DEFAULT_TOLERANCE_BINS.to_bits()),
            target_limit_hz: f64::INFINITY,
        }
    }
}

fn validate_target(target_hz: f64, limit_hz: f64) -> Result<(), ParamsError> {
    if !target_hz.is_finite() || target_hz <= 0.0 {
        return Err(ParamsError::InvalidTarget(target_hz));
    }
    if target_hz >= limit_hz {
        return Err(ParamsError::AboveNyquist {
            target: target_hz,
            nyquist: limit_hz,
        });
    }
    Ok(())
}

fn validate_tolerance(tolerance_bins: f64) -> Result<(), ParamsError> {
    if tolerance_bins.is_finite() && tolerance_bins >= 0.0 {
        Ok(())
    } else {
        Err(ParamsError::InvalidTolerance(tolerance_bins))
    }
}

/// The peak that raised the trigger
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneMatch {
    pub peak: SpectralPoint,
    /// 0 for the strongest peak
    pub rank: usize,
    pub band: FrequencyBand,
}

/// Tests ranked peaks against the target band
#[derive(Debug, Clone)]
pub struct FrequencyMatcher {
    peak_candidates: usize,
    resolution: f64,
}

impl FrequencyMatcher {
    pub fn new(peak_candidates: usize, resolution: f64) -> Self {
        Self {
            peak_candidates: peak_candidates.max(1),
            resolution,
        }
    }

    pub fn peak_candidates(&self) -> usize {
        self.peak_candidates
    }

    /// Scan the strongest `K` of `ranked_peaks` (already sorted strongest
    /// first). The first in-band peak raises `trigger` and ends the scan.
    pub fn evaluate(
        &self,
        ranked_peaks: &[SpectralPoint],
        params: &ToneParams,
        trigger: &TriggerSignal,
    ) -> Option<ToneMatch> {
        let band = params.band(self.resolution);
        let k = self.peak_candidates.min(ranked_peaks.len());

        let hit = ranked_peaks[..k]
            .iter()
            .enumerate()
            .find(|(_, peak)| band.contains(peak.frequency_hz))
            .map(|(rank, peak)| ToneMatch {
                peak: *peak,
                rank,
                band,
            });

        match hit {
            Some(tone) => {
                trigger.raise();
                info!(
                    "Tone detected at {:.1} Hz (rank {}, magnitude {:.0}), band {:.1}-{:.1} Hz",
                    tone.peak.frequency_hz,
                    tone.rank,
                    tone.peak.magnitude,
                    band.lower_hz,
                    band.upper_hz
                );
            }
            None => {
                debug!(
                    "No in-band peak among top {} (band {:.1}-{:.1} Hz)",
                    k, band.lower_hz, band.upper_hz
                );
            }
        }

        hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const RESOLUTION: f64 = 44100.0 / 2048.0;

    fn peak(frequency_hz: f64, magnitude: f64) -> SpectralPoint {
        SpectralPoint {
            frequency_hz,
            magnitude,
        }
    }

    fn params() -> ToneParams {
        ToneParams::new(3500.0, 3.0).unwrap()
    }

    #[test]
    fn test_band_is_resolution_scaled_and_centered() {
        let band = FrequencyBand::resolution_scaled(3500.0, 3.0, RESOLUTION);

        assert_relative_eq!(band.lower_hz, 3500.0 - 3.0 * RESOLUTION);
        assert_relative_eq!(band.upper_hz, 3500.0 + 3.0 * RESOLUTION);
        assert_relative_eq!(band.center(), 3500.0);
        assert_relative_eq!(band.upper_hz - 3500.0, 64.599, epsilon = 0.001);
    }

    #[test]
    fn test_band_edges_inclusive() {
        let band = FrequencyBand {
            lower_hz: 100.0,
            upper_hz: 200.0,
        };

        assert!(band.contains(100.0));
        assert!(band.contains(200.0));
        assert!(!band.contains(99.999));
        assert!(!band.contains(200.001));
    }

    #[test]
    fn test_in_band_peak_raises_trigger() {
        let matcher = FrequencyMatcher::new(5, RESOLUTION);
        let trigger = TriggerSignal::new();

        let hit = matcher.evaluate(&[peak(3510.0, 100.0)], &params(), &trigger);

        assert!(trigger.is_raised());
        assert_relative_eq!(hit.unwrap().peak.frequency_hz, 3510.0);
    }

    #[test]
    fn test_out_of_band_peak_leaves_trigger_lowered() {
        let matcher = FrequencyMatcher::new(5, RESOLUTION);
        let trigger = TriggerSignal::new();

        let hit = matcher.evaluate(&[peak(3600.0, 100.0)], &params(), &trigger);

        assert!(hit.is_none());
        assert!(!trigger.is_raised());
    }

    #[test]
    fn test_only_top_k_are_considered() {
        let matcher = FrequencyMatcher::new(3, RESOLUTION);
        let trigger = TriggerSignal::new();
        let ranked = [
            peak(440.0, 90.0),
            peak(880.0, 80.0),
            peak(1320.0, 70.0),
            peak(3500.0, 60.0),
        ];

        assert!(matcher.evaluate(&ranked, &params(), &trigger).is_none());
        assert!(!trigger.is_raised());
    }

    #[test]
    fn test_first_in_band_peak_in_rank_order_wins() {
        let matcher = FrequencyMatcher::new(5, RESOLUTION);
        let trigger = TriggerSignal::new();
        let ranked = [
            peak(440.0, 90.0),
            peak(3490.0, 80.0),
            peak(3520.0, 70.0),
        ];

        let hit = matcher.evaluate(&ranked, &params(), &trigger).unwrap();

        assert_eq!(hit.rank, 1);
        assert_relative_eq!(hit.peak.frequency_hz, 3490.0);
    }

    #[test]
    fn test_k_larger_than_peak_set() {
        let matcher = FrequencyMatcher::new(8, RESOLUTION);
        let trigger = TriggerSignal::new();

        assert!(matcher.evaluate(&[], &params(), &trigger).is_none());
        assert!(matcher
            .evaluate(&[peak(3500.0, 1.0)], &params(), &trigger)
            .is_some());
    }

    #[test]
    fn test_no_match_over_many_passes_keeps_trigger_lowered() {
        let matcher = FrequencyMatcher::new(5, RESOLUTION);
        let trigger = TriggerSignal::new();
        let ranked = [peak(1000.0, 9.0), peak(2000.0, 8.0), peak(5000.0, 7.0)];

        for _ in 0..100 {
            matcher.evaluate(&ranked, &params(), &trigger);
        }

        assert!(!trigger.is_raised());
    }

    #[test]
    fn test_retargeting_moves_band() {
        let matcher = FrequencyMatcher::new(5, RESOLUTION);
        let trigger = TriggerSignal::new();
        let params = params();

        params.set_target_frequency(1000.0).unwrap();

        assert!(matcher
            .evaluate(&[peak(3500.0, 1.0)], &params, &trigger)
            .is_none());
        assert!(matcher
            .evaluate(&[peak(1010.0, 1.0)], &params, &trigger)
            .is_some());
    }

    #[test]
    fn test_params_validation() {
        assert!(ToneParams::new(0.0, 3.0).is_err());
        assert!(ToneParams::new(f64::NAN, 3.0).is_err());
        assert!(ToneParams::new(3500.0, -1.0).is_err());

        let params = params();
        assert_eq!(
            params.set_target_frequency(-5.0),
            Err(ParamsError::InvalidTarget(-5.0))
        );
        assert!(params.set_tolerance_bins(f64::INFINITY).is_err());

        // Rejected writes leave the previous values in place
        assert_relative_eq!(params.target_frequency(), 3500.0);
        assert_relative_eq!(params.tolerance_bins(), 3.0);
    }

    #[test]
    fn test_retarget_above_nyquist_rejected() {
        assert!(matches!(
            ToneParams::for_sample_rate(22050.0, 3.0, 44100),
            Err(ParamsError::AboveNyquist { .. })
        ));

        let params = ToneParams::for_sample_rate(3500.0, 3.0, 44100).unwrap();

        assert_eq!(
            params.set_target_frequency(30000.0),
            Err(ParamsError::AboveNyquist {
                target: 30000.0,
                nyquist: 22050.0
            })
        );
        assert_relative_eq!(params.target_frequency(), 3500.0);

        assert!(params.set_target_frequency(22000.0).is_ok());
    }

    #[test]
    fn test_zero_tolerance_matches_exact_frequency_only() {
        let params = ToneParams::new(3500.0, 0.0).unwrap();
        let band = params.band(RESOLUTION);

        assert!(band.contains(3500.0));
        assert!(!band.contains(3500.5));
    }
}
