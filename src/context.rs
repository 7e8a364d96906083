use std::sync::atomic::{AtomicU64, Ordering};

/// State shared between the buffer-delivery thread and the run loop.
///
/// The redaction engine is the only writer of the batch counter. The lifecycle
/// machine reads it after end-of-stream, once delivery has quiesced; the
/// release/acquire pair makes every increment visible to that read.
#[derive(Debug, Default)]
pub struct RunContext {
    batches: AtomicU64,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index the next batch will be recorded under.
    pub fn current_index(&self) -> u64 {
        self.batches.load(Ordering::Acquire)
    }

    /// Record one delivered batch. Returns the index it was recorded under.
    pub(crate) fn record_batch(&self) -> u64 {
        self.batches.fetch_add(1, Ordering::Release)
    }

    /// Batches delivered so far.
    pub fn frame_count(&self) -> u64 {
        self.batches.load(Ordering::Acquire)
    }
}
