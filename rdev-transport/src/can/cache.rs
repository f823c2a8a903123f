use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;

use crate::{Error, Result};

use super::filter::MAX_FILTER_IDS;
use super::frame::Frame;

/// Widest id range a cache may cover. A buffer spans a filter, so this
/// matches the largest filter.
pub const MAX_BUFFERED_IDS: usize = MAX_FILTER_IDS;

/// How long a buffered read waits for a frame that has not arrived yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 5,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Latest frame per CAN id for a contiguous id range.
///
/// There is a single writer, the background reader, and any number of
/// readers. Each slot has its own lock so readers never wait on each other,
/// and a slot only counts as fresh once its bit in `fresh` is set, which
/// happens after the frame has been stored.
pub struct FrameCache {
    start: u32,
    slots: Box<[RwLock<Option<Frame>>]>,
    fresh: Box<[AtomicU32]>,
}

impl FrameCache {
    /// A cache for every id in `[start, end)`.
    pub fn new(start: u32, end: u32) -> Result<Self> {
        if end <= start {
            return Err(Error::parse(format!("empty buffer range {start:#x}-{end:#x}")));
        }
        let len = (end - start) as usize;
        if len > MAX_BUFFERED_IDS {
            return Err(Error::parse(format!(
                "buffer range {start:#x}-{end:#x} spans more than {MAX_BUFFERED_IDS} ids"
            )));
        }
        Ok(FrameCache {
            start,
            slots: (0..len).map(|_| RwLock::new(None)).collect(),
            fresh: (0..(len + 31) / 32).map(|_| AtomicU32::new(0)).collect(),
        })
    }

    pub fn range(&self) -> (u32, u32) {
        (self.start, self.start + self.slots.len() as u32)
    }

    fn slot(&self, id: u32) -> Option<usize> {
        let index = id.checked_sub(self.start)? as usize;
        (index < self.slots.len()).then_some(index)
    }

    fn is_fresh(&self, index: usize) -> bool {
        self.fresh[index / 32].load(Ordering::Acquire) & (1 << (index % 32)) != 0
    }

    /// Stores `frame` if its id is in range. Returns whether it was kept.
    pub fn store(&self, frame: Frame) -> bool {
        let Some(index) = self.slot(frame.id) else {
            return false;
        };
        *self.slots[index].write() = Some(frame);
        self.fresh[index / 32].fetch_or(1 << (index % 32), Ordering::Release);
        true
    }

    /// The cached frame for `id`, if one arrived since the last invalidation.
    pub fn get(&self, id: u32) -> Result<Option<Frame>> {
        let index = self.slot(id).ok_or(Error::NotBuffered(id))?;
        if !self.is_fresh(index) {
            return Ok(None);
        }
        Ok(*self.slots[index].read())
    }

    /// Waits for a fresh frame for `id` according to `policy`.
    ///
    /// Reading does not consume the frame, the next caller sees the same one
    /// until a newer frame replaces it.
    pub fn lookup(&self, id: u32, policy: &RetryPolicy) -> Result<Frame> {
        for attempt in 0..policy.attempts.max(1) {
            if let Some(frame) = self.get(id)? {
                return Ok(frame);
            }
            log::trace!("no frame for {id:#x} yet (attempt {})", attempt + 1);
            thread::sleep(policy.backoff);
        }
        Err(Error::Timeout(id))
    }

    /// Marks every slot stale. Frames stay in place but are not returned
    /// until they are replaced.
    pub fn invalidate(&self) {
        for word in self.fresh.iter() {
            word.store(0, Ordering::Release);
        }
    }
}
