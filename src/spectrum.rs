/// Spectral analysis of smoothed sample blocks
///
/// Runs a forward FFT over a real-valued block, keeps the non-redundant half
/// of the spectrum (bins `0..=N/2`) and extracts the local-maximum peaks.

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;
use tracing::debug;

/// One point of the magnitude spectrum
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectralPoint {
    pub frequency_hz: f64,
    pub magnitude: f64,
}

/// Frequency spacing between adjacent bins of an `fft_size`-point transform
pub fn bin_resolution(sample_rate: u32, fft_size: usize) -> f64 {
    sample_rate as f64 / fft_size as f64
}

/// Forward FFT with a pre-planned transform and reusable buffers
pub struct SpectralAnalyzer {
    fft: Arc<dyn Fft<f64>>,
    fft_size: usize,
    resolution: f64,
    buffer: Vec<Complex<f64>>,
    scratch: Vec<Complex<f64>>,
}

impl SpectralAnalyzer {
    /// Plan a transform of `fft_size` points for audio at `sample_rate`
    pub fn new(sample_rate: u32, fft_size: usize) -> Self {
        let mut planner = FftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(fft_size);
        let scratch_len = fft.get_inplace_scratch_len();
        let resolution = bin_resolution(sample_rate, fft_size);

        debug!(
            "Planned {}-point FFT, resolution {:.3} Hz/bin",
            fft_size, resolution
        );

        Self {
            fft,
            fft_size,
            resolution,
            buffer: vec![Complex::new(0.0, 0.0); fft_size],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Hz per bin
    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    /// Frequency of bin `k`
    pub fn bin_frequency(&self, bin: usize) -> f64 {
        bin as f64 * self.resolution
    }

    /// Magnitude spectrum of `samples`, in ascending frequency order.
    ///
    /// Returns `fft_size / 2 + 1` points. The transform is unnormalized; only
    /// relative magnitudes matter downstream.
    ///
    /// # Panics
    /// If `samples.len()` differs from the planned transform size. That can
    /// only happen through a configuration bug and is not recoverable.
    pub fn magnitude_spectrum(&mut self, samples: &[f64]) -> Vec<SpectralPoint> {
        assert_eq!(
            samples.len(),
            self.fft_size,
            "transform planned for {} points, block has {}",
            self.fft_size,
            samples.len()
        );

        for (slot, &sample) in self.buffer.iter_mut().zip(samples) {
            *slot = Complex::new(sample, 0.0);
        }

        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        self.buffer[..self.fft_size / 2 + 1]
            .iter()
            .enumerate()
            .map(|(bin, c)| SpectralPoint {
                frequency_hz: bin as f64 * self.resolution,
                magnitude: c.norm(),
            })
            .collect()
    }
}

/// Strict local maxima of a frequency-ordered spectrum.
///
/// A point is a peak when its magnitude exceeds both neighbours; a neighbour
/// outside the spectrum counts as zero. Peaks are returned in frequency order.
pub fn find_peaks(spectrum: &[SpectralPoint]) -> Vec<SpectralPoint> {
    let mut peaks = Vec::new();

    for (i, point) in spectrum.iter().enumerate() {
        let prev = if i > 0 { spectrum[i - 1].magnitude } else { 0.0 };
        let next = spectrum.get(i + 1).map_or(0.0, |p| p.magnitude);

        if point.magnitude > prev && point.magnitude > next {
            peaks.push(*point);
        }
    }

    peaks
}

/// Sort peaks by magnitude, strongest first
pub fn rank_by_magnitude(peaks: &mut [SpectralPoint]) {
    peaks.sort_by(|a, b| b.magnitude.total_cmp(&a.magnitude));
}
