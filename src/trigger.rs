/// Trigger signal shared between the tone matcher and the capture consumer
///
/// One writer raises the flag (the frequency matcher on the capture worker),
/// one reader clears it (the capture consumer's test-and-clear). The flag is
/// constructed explicitly and handed to both sides behind an `Arc`.

use cache_padded::CachePadded;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;

/// "An in-band tone was detected; please capture now."
#[derive(Debug, Default)]
pub struct TriggerSignal {
    flag: CachePadded<AtomicBool>,
}

impl TriggerSignal {
    /// Create a lowered trigger
    pub fn new() -> Self {
        Self {
            flag: CachePadded::new(AtomicBool::new(false)),
        }
    }

    /// Raise the trigger. Called by the matcher only.
    pub fn raise(&self) {
        self.flag.store(true, Ordering::Release);
        trace!("Trigger raised");
    }

    /// Test-and-clear. Returns `true` if the trigger was raised.
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }

    /// Observe the trigger without clearing it
    pub fn is_raised(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
