use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::Result;

use super::cache::FrameCache;
use super::filter::FilterSet;
use super::frame::Frame;

/// Pause between polls while the underlying socket is closed.
const CLOSED_BACKOFF: Duration = Duration::from_secs(1);
/// Pause after a failed read before trying again.
const FAILURE_BACKOFF: Duration = Duration::from_millis(100);

/// Outcome of one blocking receive.
#[derive(Debug)]
pub enum Recv {
    Frame(Frame),
    /// Nothing arrived within the source's poll interval.
    Idle,
    /// The socket is not open right now.
    Closed,
    Failed(io::Error),
}

pub trait FrameSource: Send + 'static {
    /// Blocks for at most a short poll interval.
    fn next_frame(&mut self) -> Recv;
}

/// Background thread feeding a [`FrameCache`].
///
/// The thread checks the stop flag after every receive, so a source must
/// return within a bounded time.
pub struct BufferReader {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl BufferReader {
    pub fn spawn<S: FrameSource>(
        mut source: S,
        cache: Arc<FrameCache>,
        filter: Arc<Mutex<Option<FilterSet>>>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = stop.clone();
            thread::Builder::new()
                .name("can-buffer".into())
                .spawn(move || {
                    let (start, end) = cache.range();
                    log::debug!("buffering CAN ids {start:#x}-{end:#x}");
                    while !stop.load(Ordering::Acquire) {
                        match source.next_frame() {
                            Recv::Frame(frame) => {
                                let accepted = match &*filter.lock() {
                                    Some(set) => set.contains(frame.id),
                                    None => true,
                                };
                                if accepted {
                                    cache.store(frame);
                                }
                            }
                            Recv::Idle => {}
                            Recv::Closed => {
                                cache.invalidate();
                                thread::park_timeout(CLOSED_BACKOFF);
                            }
                            Recv::Failed(e) => {
                                log::warn!("CAN read failed, dropping cached frames: {e}");
                                cache.invalidate();
                                thread::park_timeout(FAILURE_BACKOFF);
                            }
                        }
                    }
                    log::debug!("stopped buffering CAN ids {start:#x}-{end:#x}");
                })?
        };

        Ok(BufferReader {
            stop,
            handle: Some(handle),
        })
    }

    /// Cuts a pause short, e.g. after the socket was reopened.
    pub fn wake(&self) {
        if let Some(handle) = &self.handle {
            handle.thread().unpark();
        }
    }

    /// Stops the thread and waits for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        handle.thread().unpark();
        if handle.join().is_err() {
            log::error!("CAN buffer thread panicked");
        }
    }
}

impl Drop for BufferReader {
    fn drop(&mut self) {
        self.shutdown();
    }
}
