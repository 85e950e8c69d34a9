use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::buffer::{Buffer, BufferPool};
use crate::config::VirtualFileConfig;
use crate::downloader::{Assignment, FetchOutcome, WorkerHandle, WorkerId};
use crate::errors::{VirtualFileError, VirtualFileResult};
use crate::events::{BlockEvent, BlockObserver};
use crate::worker_pool::WorkerPool;

/// Partition of the resource into blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGeometry {
    pub block_size: usize,
    pub total_size: u64,
}

impl BlockGeometry {
    pub fn new(block_size: usize, total_size: u64) -> Self {
        BlockGeometry {
            block_size,
            total_size,
        }
    }

    pub fn block_count(&self) -> u64 {
        self.total_size.div_ceil(self.block_size as u64)
    }

    pub fn block_index(&self, position: u64) -> u64 {
        position / self.block_size as u64
    }

    /// Byte range of the block, the last one is clipped to the resource size.
    pub fn block_range(&self, index: u64) -> Range<u64> {
        let start = index * self.block_size as u64;
        let end = (start + self.block_size as u64).min(self.total_size);
        start..end.max(start)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Pending,
    Ready,
}

enum BlockState {
    /// Fetch in flight, the buffer belongs to the worker
    Pending {
        ticket: u64,
        worker: WorkerId,
        cancel: CancellationToken,
    },
    Ready { buffer: Buffer },
}

impl BlockState {
    fn status(&self) -> BlockStatus {
        match self {
            BlockState::Pending { .. } => BlockStatus::Pending,
            BlockState::Ready { .. } => BlockStatus::Ready,
        }
    }
}

/// Delay before a failed block is fetched again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(config: &VirtualFileConfig) -> Self {
        RetryPolicy {
            backoff: config.retry_backoff(),
            max_backoff: config.max_retry_backoff(),
        }
    }

    /// Delay after `failures` consecutive failures, doubling from `backoff` up to `max_backoff`.
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.backoff
            .saturating_mul(1 << exponent)
            .min(self.max_backoff)
    }
}

struct Backoff {
    failures: u32,
    retry_at: Instant,
}

/// Result of the forward scan for a block to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gap {
    Free(u64),
    /// Only blocks which are backing off are missing, the earliest may be retried at this time
    RetryAt(Instant),
    None,
}

/// Index -> block mapping, the single source of truth of what is cached.
struct BlockMap {
    blocks: BTreeMap<u64, BlockState>,
    backoff: HashMap<u64, Backoff>,
    /// Block of the most recent read
    cursor: u64,
    next_ticket: u64,
}

impl BlockMap {
    fn new() -> Self {
        BlockMap {
            blocks: BTreeMap::new(),
            backoff: HashMap::new(),
            cursor: 0,
            next_ticket: 0,
        }
    }

    fn status(&self, index: u64) -> Option<BlockStatus> {
        self.blocks.get(&index).map(BlockState::status)
    }

    fn is_backing_off(&self, index: u64, now: Instant) -> bool {
        self.backoff
            .get(&index)
            .is_some_and(|backoff| backoff.retry_at > now)
    }

    /// First absent block at or after the cursor.
    fn next_gap(&self, block_count: u64, now: Instant) -> Gap {
        let mut earliest_retry: Option<Instant> = None;
        for index in self.cursor..block_count {
            if self.blocks.contains_key(&index) {
                continue;
            }
            match self.backoff.get(&index) {
                Some(backoff) if backoff.retry_at > now => {
                    earliest_retry = Some(match earliest_retry {
                        Some(earliest) => earliest.min(backoff.retry_at),
                        None => backoff.retry_at,
                    });
                }
                _ => return Gap::Free(index),
            }
        }
        earliest_retry.map_or(Gap::None, Gap::RetryAt)
    }

    fn insert_pending(&mut self, index: u64, worker: WorkerId) -> (u64, CancellationToken) {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let cancel = CancellationToken::new();
        self.blocks.insert(
            index,
            BlockState::Pending {
                ticket,
                worker,
                cancel: cancel.clone(),
            },
        );
        (ticket, cancel)
    }

    /// Whether `index` is pending under this exact dispatch.
    fn is_current(&self, index: u64, job_ticket: u64) -> bool {
        matches!(
            self.blocks.get(&index),
            Some(BlockState::Pending { ticket, .. }) if *ticket == job_ticket
        )
    }

    fn record_failure(&mut self, index: u64, policy: &RetryPolicy, now: Instant) -> Duration {
        let failures = self
            .backoff
            .get(&index)
            .map_or(1, |backoff| backoff.failures + 1);
        let delay = policy.delay(failures);
        self.backoff.insert(
            index,
            Backoff {
                failures,
                retry_at: now + delay,
            },
        );
        delay
    }

    fn pending_count(&self) -> usize {
        self.blocks
            .values()
            .filter(|block| matches!(block, BlockState::Pending { .. }))
            .count()
    }

    /// Ready block farthest from `index`, looking ahead of it first.
    ///
    /// Blocks behind `index` are only picked when nothing ahead is ready, lowest first.
    fn eviction_victim(&self, index: u64) -> Option<u64> {
        fn is_ready((_, block): &(&u64, &BlockState)) -> bool {
            matches!(block, BlockState::Ready { .. })
        }
        self.blocks
            .range(index + 1..)
            .rev()
            .find(is_ready)
            .or_else(|| self.blocks.range(..index).find(is_ready))
            .map(|(index, _)| *index)
    }
}

/// Pending dispatch of a block, created by the scheduler.
#[derive(Debug)]
pub(crate) struct Reservation {
    pub index: u64,
    pub ticket: u64,
    pub range: Range<u64>,
    pub cancel: CancellationToken,
}

/// Capacity to hand back once the cache lock is released.
#[derive(Default)]
struct Released {
    buffers: Vec<Buffer>,
    workers: Vec<WorkerHandle>,
    events: Vec<BlockEvent>,
}

/// Point in time view of the cache, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub cursor: u64,
    pub pending_blocks: usize,
    pub ready_blocks: usize,
    pub buffers_capacity: usize,
    pub allocated_buffers: usize,
    pub idle_buffers: usize,
    pub workers_capacity: usize,
    pub idle_workers: usize,
}

/// Block cache shared by the reader, the scheduler and the download workers.
///
/// All three mutate the block map under a single mutex. Buffers and worker handles
/// leave the map through [`Released`], and go back to their pools after the mutex is released.
pub struct BlockCache {
    geometry: BlockGeometry,
    blocks: Mutex<BlockMap>,
    /// Signalled whenever blocks become ready, are removed, or the cursor moves
    updated: Condvar,
    buffers: BufferPool,
    workers: WorkerPool,
    observer: Arc<dyn BlockObserver>,
    retry: RetryPolicy,
    closed: AtomicBool,
}

impl BlockCache {
    pub fn new(
        geometry: BlockGeometry,
        buffers: BufferPool,
        workers: WorkerPool,
        observer: Arc<dyn BlockObserver>,
        retry: RetryPolicy,
    ) -> Self {
        BlockCache {
            geometry,
            blocks: Mutex::new(BlockMap::new()),
            updated: Condvar::new(),
            buffers,
            workers,
            observer,
            retry,
            closed: AtomicBool::new(false),
        }
    }

    pub fn geometry(&self) -> BlockGeometry {
        self.geometry
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    pub fn observer(&self) -> &dyn BlockObserver {
        self.observer.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait until some block after the cursor may be fetched. Returns `false` once shut down.
    pub(crate) fn wait_for_gap(&self, idle_wait: Duration) -> bool {
        let mut blocks = self.blocks.lock();
        self.next_free(&mut blocks, idle_wait).is_some()
    }

    /// Pick the first absent block at or after the cursor and mark it pending for `worker`.
    ///
    /// Waits while there is nothing to schedule. Returns `None` once shut down.
    pub(crate) fn reserve_next(
        &self,
        worker: WorkerId,
        idle_wait: Duration,
    ) -> Option<Reservation> {
        let mut blocks = self.blocks.lock();
        let index = self.next_free(&mut blocks, idle_wait)?;
        let (ticket, cancel) = blocks.insert_pending(index, worker);
        Some(Reservation {
            index,
            ticket,
            range: self.geometry.block_range(index),
            cancel,
        })
    }

    /// Re-check at most every `idle_wait`, or sooner when a backoff expires.
    fn next_free(&self, blocks: &mut MutexGuard<'_, BlockMap>, idle_wait: Duration) -> Option<u64> {
        let block_count = self.geometry.block_count();
        loop {
            if self.is_closed() {
                return None;
            }
            let now = Instant::now();
            let wait = match blocks.next_gap(block_count, now) {
                Gap::Free(index) => return Some(index),
                Gap::RetryAt(retry_at) => retry_at.saturating_duration_since(now).min(idle_wait),
                Gap::None => idle_wait,
            };
            self.updated.wait_for(blocks, wait);
        }
    }

    /// Drop a reservation whose job never reached a worker.
    pub(crate) fn abandon(&self, assignment: Assignment) {
        let Assignment { job, worker } = assignment;
        {
            let mut blocks = self.blocks.lock();
            if blocks.is_current(job.index, job.ticket) {
                blocks.blocks.remove(&job.index);
            }
        }
        log::error!(
            "Download worker {} is gone, block {} is rescheduled",
            worker.id(),
            job.index
        );
        // The worker thread is dead, its handle is not returned to the pool
        drop(worker);
        self.buffers.release(job.buffer);
        self.updated.notify_all();
    }

    /// Completion callback of the download workers.
    pub fn complete(&self, outcome: FetchOutcome, assignment: Assignment) {
        let Assignment { job, worker } = assignment;
        let index = job.index;
        let mut released = Released::default();
        released.workers.push(worker);
        {
            let mut blocks = self.blocks.lock();
            if !blocks.is_current(index, job.ticket) {
                // Evicted while in flight, only the capacity is left to reclaim
                released.events.push(match outcome {
                    FetchOutcome::Cancelled => BlockEvent::Cancelled { index },
                    _ => BlockEvent::Missed { index },
                });
                released.buffers.push(job.buffer);
            } else {
                match outcome {
                    FetchOutcome::Completed => {
                        let size = job.buffer.actual_size();
                        blocks
                            .blocks
                            .insert(index, BlockState::Ready { buffer: job.buffer });
                        blocks.backoff.remove(&index);
                        released.events.push(BlockEvent::Ready { index, size });
                    }
                    FetchOutcome::Cancelled => {
                        blocks.blocks.remove(&index);
                        released.buffers.push(job.buffer);
                        released.events.push(BlockEvent::Cancelled { index });
                    }
                    FetchOutcome::Failed(error) => {
                        blocks.blocks.remove(&index);
                        let retry_in = blocks.record_failure(index, &self.retry, Instant::now());
                        released.buffers.push(job.buffer);
                        released.events.push(BlockEvent::Failed {
                            index,
                            error: error.to_string(),
                            retry_in,
                        });
                    }
                }
            }
        }
        self.updated.notify_all();
        self.finish(released);
    }

    /// Move the cursor to `index`, flushing the cache unless the move is sequential.
    ///
    /// Returns whether the cache was flushed.
    pub fn seek(&self, index: u64) -> bool {
        let mut released = Released::default();
        let flushed = {
            let mut blocks = self.blocks.lock();
            let previous = blocks.cursor;
            let sequential = index == previous || index == previous + 1;
            if !sequential {
                let count = blocks.blocks.len();
                self.evict_all(&mut blocks, &mut released);
                released.events.push(BlockEvent::Flushed { blocks: count });
            }
            blocks.cursor = index;
            !sequential
        };
        self.updated.notify_all();
        self.finish(released);
        flushed
    }

    /// Evict a single block. Returns whether it was cached.
    pub fn release_block(&self, index: u64) -> bool {
        let mut released = Released::default();
        let evicted = {
            let mut blocks = self.blocks.lock();
            self.evict(&mut blocks, index, &mut released)
        };
        if evicted {
            self.updated.notify_all();
        }
        self.finish(released);
        evicted
    }

    /// Evict every block. Returns how many were cached.
    pub fn release_blocks(&self) -> usize {
        let mut released = Released::default();
        let count = {
            let mut blocks = self.blocks.lock();
            let count = blocks.blocks.len();
            self.evict_all(&mut blocks, &mut released);
            count
        };
        released.events.push(BlockEvent::Flushed { blocks: count });
        self.updated.notify_all();
        self.finish(released);
        count
    }

    /// Wait until block `index` is ready and run `read` on its buffer.
    ///
    /// Checks at least every `poll_interval`. Fails with [`VirtualFileError::Timeout`] after
    /// `timeout`, and with [`VirtualFileError::NotOpen`] if the cache is shut down meanwhile.
    pub fn read_block<R>(
        &self,
        index: u64,
        timeout: Option<Duration>,
        poll_interval: Duration,
        read: impl FnOnce(&Buffer) -> R,
    ) -> VirtualFileResult<R> {
        let started = Instant::now();
        let mut blocks = self.blocks.lock();
        loop {
            if self.is_closed() {
                return Err(VirtualFileError::NotOpen);
            }
            match blocks.status(index) {
                Some(BlockStatus::Ready) => {
                    if let Some(BlockState::Ready { buffer }) = blocks.blocks.get(&index) {
                        return Ok(read(buffer));
                    }
                }
                Some(BlockStatus::Pending) => {}
                None => {
                    if let Some(released) = self.make_room(&mut blocks, index) {
                        MutexGuard::unlocked(&mut blocks, || self.finish(released));
                        continue;
                    }
                }
            }

            let wait = match timeout {
                Some(timeout) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(VirtualFileError::Timeout { index, waited });
                    }
                    poll_interval.min(timeout - waited)
                }
                None => poll_interval,
            };
            self.updated.wait_for(&mut blocks, wait);
        }
    }

    /// Free a buffer for the absent block `index` if the read-ahead holds all of them.
    ///
    /// Without it a reader could wait forever: a failed fetch leaves a gap at the cursor
    /// while the blocks after it keep every buffer, and with a single buffer the block
    /// read just before holds it until the read returns.
    fn make_room(&self, blocks: &mut BlockMap, index: u64) -> Option<Released> {
        if blocks.is_backing_off(index, Instant::now())
            || blocks.pending_count() > 0
            || self.buffers.available() > 0
        {
            return None;
        }
        let victim = blocks.eviction_victim(index)?;
        let mut released = Released::default();
        self.evict(blocks, victim, &mut released);
        Some(released)
    }

    fn evict(&self, blocks: &mut BlockMap, index: u64, released: &mut Released) -> bool {
        match blocks.blocks.remove(&index) {
            Some(block) => {
                Self::release_state(block, released);
                released.events.push(BlockEvent::Evicted { index });
                true
            }
            None => false,
        }
    }

    fn evict_all(&self, blocks: &mut BlockMap, released: &mut Released) {
        for (_index, block) in std::mem::take(&mut blocks.blocks) {
            Self::release_state(block, released);
        }
        blocks.backoff.clear();
    }

    fn release_state(block: BlockState, released: &mut Released) {
        match block {
            // The worker brings the buffer back through `complete`
            BlockState::Pending { cancel, .. } => cancel.cancel(),
            BlockState::Ready { buffer } => released.buffers.push(buffer),
        }
    }

    fn finish(&self, released: Released) {
        let Released {
            buffers,
            workers,
            events,
        } = released;
        for buffer in buffers {
            self.buffers.release(buffer);
        }
        for worker in workers {
            self.workers.release(worker);
        }
        for event in &events {
            self.observer.on_event(event);
        }
    }

    /// Stop scheduling, cancel all fetches and drop all blocks.
    ///
    /// Workers and buffers still in flight are dropped when their fetch completes.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.buffers.close();
        self.workers.close();
        let mut released = Released::default();
        {
            let mut blocks = self.blocks.lock();
            self.evict_all(&mut blocks, &mut released);
        }
        self.updated.notify_all();
        self.finish(released);
    }

    pub fn stats(&self) -> CacheStats {
        let blocks = self.blocks.lock();
        let pending_blocks = blocks.pending_count();
        CacheStats {
            cursor: blocks.cursor,
            pending_blocks,
            ready_blocks: blocks.blocks.len() - pending_blocks,
            buffers_capacity: self.buffers.capacity(),
            allocated_buffers: self.buffers.allocated(),
            idle_buffers: self.buffers.idle(),
            workers_capacity: self.workers.capacity(),
            idle_workers: self.workers.idle(),
        }
    }

    pub fn cached_blocks(&self) -> Vec<(u64, BlockStatus)> {
        self.blocks
            .lock()
            .blocks
            .iter()
            .map(|(index, block)| (*index, block.status()))
            .collect()
    }
}
