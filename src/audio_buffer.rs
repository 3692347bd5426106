/// Sample ring between the audio device callback and the capture worker
///
/// The device callback pushes samples of whatever size the platform delivers;
/// the capture worker blocks until a full analysis block has accumulated.
/// Built on a lock-free SPSC ring, so the device callback never takes a lock.

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::Duration;
use tracing::{trace, warn};

/// Audio sample format (16-bit PCM)
pub type AudioSample = i16;

/// Upper bound on how long the reader sleeps between checks of the stop flag
pub const READ_WAIT: Duration = Duration::from_millis(20);

type RingBuffer = HeapRb<AudioSample>;
type RingProducer = <RingBuffer as Split>::Prod;
type RingConsumer = <RingBuffer as Split>::Cons;

/// Result of a blocking block read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The caller's block was filled
    Block,
    /// The stop flag was set while waiting
    Stopped,
    /// The writer went away or reported a stream failure
    Closed,
}

struct Shared {
    closed: AtomicBool,
    dropped_samples: AtomicU64,
}

/// Create a ring of `capacity` samples. `reader` is unparked whenever new
/// samples arrive.
pub fn block_ring(capacity: usize, reader: Thread) -> (BlockWriter, BlockReader) {
    trace!("Creating sample ring with capacity: {} samples", capacity);

    let rb = RingBuffer::new(capacity);
    let (producer, consumer) = rb.split();
    let shared = Arc::new(Shared {
        closed: AtomicBool::new(false),
        dropped_samples: AtomicU64::new(0),
    });

    (
        BlockWriter {
            producer,
            reader,
            shared: Arc::clone(&shared),
            overflowing: false,
        },
        BlockReader {
            consumer,
            shared,
            wait: READ_WAIT,
        },
    )
}

/// Device-side half of the ring
pub struct BlockWriter {
    producer: RingProducer,
    reader: Thread,
    shared: Arc<Shared>,
    overflowing: bool,
}

impl BlockWriter {
    /// Push samples without blocking.
    ///
    /// Returns the number of samples stored. When the ring is full the
    /// samples that do not fit are dropped and counted.
    pub fn write(&mut self, samples: &[AudioSample]) -> usize {
        let written = self.producer.push_slice(samples);
        let dropped = samples.len() - written;

        if dropped > 0 {
            self.shared
                .dropped_samples
                .fetch_add(dropped as u64, Ordering::Relaxed);
            if !self.overflowing {
                warn!(
                    "Sample ring full, dropping {} samples (capture worker behind)",
                    dropped
                );
                self.overflowing = true;
            }
        } else {
            self.overflowing = false;
        }

        self.reader.unpark();
        written
    }

    /// Handle that can close the ring from another callback (stream errors)
    pub fn closer(&self) -> RingCloser {
        RingCloser {
            shared: Arc::clone(&self.shared),
            reader: self.reader.clone(),
        }
    }
}

impl Drop for BlockWriter {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.reader.unpark();
    }
}

/// Marks the ring closed so the reader stops waiting
#[derive(Clone)]
pub struct RingCloser {
    shared: Arc<Shared>,
    reader: Thread,
}

impl RingCloser {
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.reader.unpark();
    }
}

/// Worker-side half of the ring
pub struct BlockReader {
    consumer: RingConsumer,
    shared: Arc<Shared>,
    wait: Duration,
}

impl BlockReader {
    /// Block until `block.len()` samples are buffered and copy them out.
    ///
    /// Samples already buffered are still delivered after the ring closes,
    /// but not once `stop` is set.
    ///
    /// # Panics
    /// If the block is larger than the ring, which could never be filled.
    pub fn read_block(&mut self, block: &mut [AudioSample], stop: &AtomicBool) -> ReadOutcome {
        assert!(
            block.len() <= self.capacity(),
            "block of {} samples exceeds ring capacity {}",
            block.len(),
            self.capacity()
        );

        loop {
            // Checked first so a full ring cannot hold off a stop request
            if stop.load(Ordering::Acquire) {
                return ReadOutcome::Stopped;
            }

            if self.consumer.occupied_len() >= block.len() {
                let read = self.consumer.pop_slice(block);
                debug_assert_eq!(read, block.len());
                return ReadOutcome::Block;
            }

            if self.shared.closed.load(Ordering::Acquire) {
                // The writer may have pushed a final chunk before closing
                if self.consumer.occupied_len() >= block.len() {
                    continue;
                }
                return ReadOutcome::Closed;
            }

            thread::park_timeout(self.wait);
        }
    }

    /// Number of samples waiting in the ring
    pub fn len(&self) -> usize {
        self.consumer.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.consumer.capacity().get()
    }

    /// Samples lost to ring overflow since creation
    pub fn dropped_samples(&self) -> u64 {
        self.shared.dropped_samples.load(Ordering::Relaxed)
    }
}
