use std::time::Duration;

/// Notable transitions of the block cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockEvent {
    /// A fetch of the block was dispatched to a worker
    Scheduled { index: u64, worker: usize },
    /// The block was fetched and can be read
    Ready { index: u64, size: usize },
    /// The block was removed from the cache
    Evicted { index: u64 },
    /// The fetch was aborted because the block had been evicted meanwhile
    Cancelled { index: u64 },
    /// The fetch failed, the block is retried after `retry_in`
    Failed {
        index: u64,
        error: String,
        retry_in: Duration,
    },
    /// A completion arrived for a block which is no longer scheduled
    Missed { index: u64 },
    /// A non sequential read dropped the whole cache
    Flushed { blocks: usize },
}

/// Receiver of [`BlockEvent`]s.
///
/// Called from the reader, scheduler and worker threads, never while the cache is locked.
pub trait BlockObserver: Send + Sync {
    fn on_event(&self, event: &BlockEvent);
}

/// Writes events into the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl BlockObserver for LogObserver {
    fn on_event(&self, event: &BlockEvent) {
        match event {
            BlockEvent::Scheduled { index, worker } => {
                log::debug!("Block: {index} --- scheduled on worker {worker}")
            }
            BlockEvent::Ready { index, size } => {
                log::debug!("Block: {index} --- ok ({size} bytes)")
            }
            BlockEvent::Evicted { index } => log::debug!("Block: {index} --- cleared"),
            BlockEvent::Cancelled { index } => log::debug!("Block: {index} --- cancelled"),
            BlockEvent::Failed {
                index,
                error,
                retry_in,
            } => log::warn!("Block: {index} --- failed, retry in {retry_in:?}: {error}"),
            BlockEvent::Missed { index } => log::debug!("Block: {index} --- missed"),
            BlockEvent::Flushed { blocks } => log::debug!("Cache cleared! ({blocks} blocks)"),
        }
    }
}

/// Ignores all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl BlockObserver for NoopObserver {
    fn on_event(&self, _event: &BlockEvent) {}
}
