use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};

use crate::block_cache::{BlockCache, BlockGeometry, BlockStatus, CacheStats, RetryPolicy};
use crate::buffer::BufferPool;
use crate::config::VirtualFileConfig;
use crate::downloader::{Assignment, CompletionCallback, FetchOutcome};
use crate::errors::{VirtualFileError, VirtualFileResult};
use crate::events::{BlockObserver, LogObserver};
use crate::scheduler;
use crate::transport::{
    Connector, Endpoint, HttpConnector, RangeConnection, ResourceMetadata, StaticConnector,
};
use crate::worker_pool::WorkerPool;

enum FileState {
    Unopened,
    Opened(Arc<OpenedFile>),
    Closed,
}

/// Remote resource exposed as a randomly readable file.
///
/// Reads are served from a bounded cache of fixed size blocks. A background scheduler
/// keeps the cache filled ahead of the most recently read block, using a bounded set
/// of download workers, each with its own connection.
///
/// ```no_run
/// use virtual_file::{VirtualFile, VirtualFileConfig};
///
/// let file = VirtualFile::new();
/// file.open(VirtualFileConfig::new("http://localhost/video.mp4", 1 << 20, 300 << 20, 8))?;
/// let head = file.read(0, 4096)?;
/// # Ok::<(), virtual_file::VirtualFileError>(())
/// ```
pub struct VirtualFile {
    connector: Box<dyn Connector>,
    observer: Arc<dyn BlockObserver>,
    state: RwLock<FileState>,
}

impl Default for VirtualFile {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualFile {
    /// Unopened file fetching over HTTP and logging cache events.
    pub fn new() -> Self {
        Self::with_connector(HttpConnector)
    }

    pub fn with_connector(connector: impl Connector + 'static) -> Self {
        VirtualFile {
            connector: Box::new(connector),
            observer: Arc::new(LogObserver),
            state: RwLock::new(FileState::Unopened),
        }
    }

    /// Unopened file fetching from `endpoint` whatever the configured URL is.
    pub fn with_endpoint(endpoint: Arc<dyn Endpoint>) -> Self {
        Self::with_connector(StaticConnector::new(endpoint))
    }

    pub fn with_observer(mut self, observer: Arc<dyn BlockObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Probe the resource and start prefetching from its first block.
    ///
    /// Fails without side effects, the file stays unopened and `open` may be retried.
    pub fn open(&self, config: VirtualFileConfig) -> VirtualFileResult<()> {
        let mut state = self.state.write();
        if !matches!(*state, FileState::Unopened) {
            return Err(VirtualFileError::AlreadyOpen);
        }
        config.check()?;

        let endpoint = self.connector.endpoint(&config)?;
        let metadata = endpoint.probe()?;
        let connections = (0..config.max_workers)
            .map(|_| endpoint.connect())
            .collect::<VirtualFileResult<Vec<_>>>()?;

        let file = OpenedFile::start(config, metadata, connections, self.observer.clone())?;
        log::info!(
            "Opened {} ({} bytes, {}, {} blocks)",
            file.config.url,
            file.metadata.size,
            file.metadata.content_type,
            file.cache.geometry().block_count(),
        );
        *state = FileState::Opened(Arc::new(file));
        Ok(())
    }

    /// Read up to `size` bytes at `offset`, waiting until the containing block is fetched.
    ///
    /// Never crosses a block boundary, so the result is shorter than `size` when the span
    /// continues into the next block.
    pub fn read(&self, offset: u64, size: usize) -> VirtualFileResult<Vec<u8>> {
        self.opened()?.read(offset, size)
    }

    /// Stop all workers and drop the cache. Does nothing unless the file is open.
    ///
    /// Blocks until the scheduler and every worker have exited. Reads waiting meanwhile
    /// fail with [`VirtualFileError::NotOpen`].
    pub fn close(&self) {
        let file = {
            let mut state = self.state.write();
            let FileState::Opened(file) = &*state else {
                return;
            };
            let file = file.clone();
            *state = FileState::Closed;
            file
        };
        file.shutdown();
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.state.read(), FileState::Opened(_))
    }

    pub fn metadata(&self) -> Option<ResourceMetadata> {
        self.opened().ok().map(|file| file.metadata.clone())
    }

    pub fn size(&self) -> Option<u64> {
        self.opened().ok().map(|file| file.metadata.size)
    }

    pub fn content_type(&self) -> Option<String> {
        self.opened().ok().map(|file| file.metadata.content_type.clone())
    }

    pub fn config(&self) -> Option<VirtualFileConfig> {
        self.opened().ok().map(|file| file.config.clone())
    }

    pub fn block_size(&self) -> Option<usize> {
        self.opened().ok().map(|file| file.config.block_size)
    }

    pub fn block_count(&self) -> Option<u64> {
        self.opened()
            .ok()
            .map(|file| file.cache.geometry().block_count())
    }

    pub fn stats(&self) -> Option<CacheStats> {
        self.opened().ok().map(|file| file.cache.stats())
    }

    /// Indices of the blocks currently in the cache, in ascending order.
    pub fn cached_blocks(&self) -> Vec<(u64, BlockStatus)> {
        self.opened()
            .map(|file| file.cache.cached_blocks())
            .unwrap_or_default()
    }

    fn opened(&self) -> VirtualFileResult<Arc<OpenedFile>> {
        match &*self.state.read() {
            FileState::Opened(file) => Ok(file.clone()),
            FileState::Unopened | FileState::Closed => Err(VirtualFileError::NotOpen),
        }
    }
}

impl Drop for VirtualFile {
    fn drop(&mut self) {
        self.close();
    }
}

struct OpenedFile {
    config: VirtualFileConfig,
    metadata: ResourceMetadata,
    cache: Arc<BlockCache>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl OpenedFile {
    fn start(
        config: VirtualFileConfig,
        metadata: ResourceMetadata,
        connections: Vec<Box<dyn RangeConnection>>,
        observer: Arc<dyn BlockObserver>,
    ) -> VirtualFileResult<Self> {
        let cache = Arc::new(BlockCache::new(
            BlockGeometry::new(config.block_size, metadata.size),
            BufferPool::new(config.buffers_count(), config.block_size),
            WorkerPool::new(config.max_workers),
            observer,
            RetryPolicy::new(&config),
        ));

        let on_complete = completion_callback(Arc::downgrade(&cache));
        for connection in connections {
            if let Err(err) = cache.workers().launch(connection, on_complete.clone()) {
                Self::teardown(&cache, None);
                return Err(err);
            }
        }

        let scheduler = match scheduler::spawn(cache.clone()) {
            Ok(scheduler) => scheduler,
            Err(err) => {
                Self::teardown(&cache, None);
                return Err(err);
            }
        };

        Ok(OpenedFile {
            config,
            metadata,
            cache,
            scheduler: Mutex::new(Some(scheduler)),
        })
    }

    fn read(&self, offset: u64, size: usize) -> VirtualFileResult<Vec<u8>> {
        let total_size = self.metadata.size;
        if offset >= total_size {
            return Err(VirtualFileError::OutOfRange {
                offset,
                size: total_size,
            });
        }

        let geometry = self.cache.geometry();
        let index = geometry.block_index(offset);
        let in_block = (offset - geometry.block_range(index).start) as usize;
        self.cache.seek(index);

        let data = self.cache.read_block(
            index,
            self.config.read_timeout(),
            self.config.poll_interval(),
            |buffer| {
                let block = buffer.as_slice();
                let start = in_block.min(block.len());
                let end = start + size.min(block.len() - start);
                block[start..end].to_vec()
            },
        )?;

        if index > 0 {
            self.cache.release_block(index - 1);
        }
        Ok(data)
    }

    fn shutdown(&self) {
        let scheduler = self.scheduler.lock().take();
        Self::teardown(&self.cache, scheduler);
        log::info!("Closed {}", self.config.url);
    }

    fn teardown(cache: &BlockCache, scheduler: Option<JoinHandle<()>>) {
        cache.shutdown();
        if let Some(scheduler) = scheduler {
            if scheduler.join().is_err() {
                log::error!("Scheduler panicked");
            }
        }
        cache.workers().join();
    }
}

/// Routes worker completions into the cache, as long as it exists.
fn completion_callback(cache: Weak<BlockCache>) -> CompletionCallback {
    Arc::new(move |outcome: FetchOutcome, assignment: Assignment| {
        match cache.upgrade() {
            Some(cache) => cache.complete(outcome, assignment),
            None => drop(assignment),
        }
    })
}
