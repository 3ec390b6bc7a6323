use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Bounded FIFO in arrival order (front = oldest, back = newest).
///
/// The buffer may grow past `capacity` up to the high-water mark
/// `capacity + overflow_threshold`; reaching it trims straight back to
/// `capacity`, dropping the oldest entries. Trimming in bulk keeps the common
/// push path free of per-item eviction.
#[derive(Debug, Clone)]
pub struct EventRingBuffer<T> {
    capacity: usize,
    overflow_threshold: usize,
    items: VecDeque<T>,
}

impl<T> EventRingBuffer<T> {
    pub fn new(capacity: usize, overflow_threshold: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            overflow_threshold,
            items: VecDeque::with_capacity(capacity + overflow_threshold),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn overflow_threshold(&self) -> usize {
        self.overflow_threshold
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns the number of entries trimmed.
    pub fn push(&mut self, item: T) -> usize {
        self.items.push_back(item);
        self.trim_if_needed()
    }

    /// Appends a whole batch in its arrival order, then trims once.
    pub fn merge<I>(&mut self, batch: I) -> usize
    where
        I: IntoIterator<Item = T>,
    {
        self.items.extend(batch);
        self.trim_if_needed()
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    /// Newest first, at most `limit` entries.
    pub fn latest(&self, limit: usize) -> impl Iterator<Item = &T> {
        self.items.iter().rev().take(limit)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    fn high_water_mark(&self) -> usize {
        self.capacity + self.overflow_threshold
    }

    fn trim_if_needed(&mut self) -> usize {
        if self.items.len() < self.high_water_mark() {
            return 0;
        }
        let overflow = self.items.len() - self.capacity;
        self.items.drain(..overflow);
        overflow
    }
}

/// Coalesces pushes into at most one flush per frame.
#[derive(Debug)]
pub struct FrameBatcher<T> {
    pending: Vec<T>,
    flush_scheduled: bool,
    flush_count: u64,
}

impl<T> Default for FrameBatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FrameBatcher<T> {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            flush_scheduled: false,
            flush_count: 0,
        }
    }

    /// Queues an item for the next frame. Returns `true` when this push is
    /// the one that scheduled the flush.
    pub fn push(&mut self, item: T) -> bool {
        self.pending.push(item);
        self.schedule_flush()
    }

    /// Idempotent: a second call before the frame fires is a no-op.
    pub fn schedule_flush(&mut self) -> bool {
        if self.flush_scheduled {
            return false;
        }
        self.flush_scheduled = true;
        true
    }

    pub fn is_flush_scheduled(&self) -> bool {
        self.flush_scheduled
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn flush_count(&self) -> u64 {
        self.flush_count
    }

    /// Called once per frame. Hands back the whole pending batch in arrival
    /// order if a flush was scheduled.
    pub fn take_flush(&mut self) -> Option<Vec<T>> {
        if !self.flush_scheduled {
            return None;
        }
        self.flush_scheduled = false;
        if self.pending.is_empty() {
            return None;
        }
        self.flush_count = self.flush_count.saturating_add(1);
        Some(std::mem::take(&mut self.pending))
    }
}

/// Frame clock: on every tick drains the batcher and hands the batch to
/// `on_flush`. The batcher lock is released before `on_flush` runs.
pub async fn run_frame_loop<T, F>(
    batcher: Arc<Mutex<FrameBatcher<T>>>,
    frame_interval: Duration,
    cancel_token: CancellationToken,
    mut on_flush: F,
) where
    F: FnMut(Vec<T>),
{
    let mut ticker = tokio::time::interval(frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                break;
            }
            _ = ticker.tick() => {
                let maybe_batch = batcher.lock().take_flush();
                if let Some(batch) = maybe_batch {
                    on_flush(batch);
                }
            }
        }
    }
}
