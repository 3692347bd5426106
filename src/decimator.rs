/// Block decimation
///
/// Spectral analysis is far more expensive than reading a block, so only one
/// block out of every `interval` is forwarded to the analysis pipeline.

use tracing::trace;

/// Default number of blocks between analysis passes
pub const DEFAULT_PROCESSING_INTERVAL: usize = 10;

/// Counts delivered blocks and selects every Nth one for analysis
#[derive(Debug, Clone)]
pub struct Decimator {
    interval: usize,
    counter: usize,
}

impl Decimator {
    /// Create a decimator forwarding one block per `interval` blocks.
    /// An interval of zero is treated as one.
    pub fn new(interval: usize) -> Self {
        Self {
            interval: interval.max(1),
            counter: 0,
        }
    }

    /// Register one delivered block. Returns `true` on the interval-th block.
    pub fn tick(&mut self) -> bool {
        self.counter += 1;

        if self.counter >= self.interval {
            self.counter = 0;
            trace!("Decimator selected block for analysis");
            true
        } else {
            false
        }
    }

    /// Forget any partially counted interval
    pub fn reset(&mut self) {
        self.counter = 0;
    }

    pub fn interval(&self) -> usize {
        self.interval
    }
}

impl Default for Decimator {
    fn default() -> Self {
        Self::new(DEFAULT_PROCESSING_INTERVAL)
    }
}
