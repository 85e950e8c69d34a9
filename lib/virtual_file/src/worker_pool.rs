use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::downloader::{CompletionCallback, DownloadWorker, WorkerHandle, WorkerId};
use crate::errors::{VirtualFileError, VirtualFileResult};
use crate::resource_pool::ResourcePool;
use crate::transport::RangeConnection;

/// Bounded set of download workers, gating the number of concurrent fetches.
pub struct WorkerPool {
    workers: ResourcePool<WorkerHandle>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        WorkerPool {
            workers: ResourcePool::new(capacity),
            threads: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// Start a worker bound to `connection` and make it available for jobs.
    pub fn launch(
        &self,
        connection: Box<dyn RangeConnection>,
        on_complete: CompletionCallback,
    ) -> VirtualFileResult<WorkerId> {
        let mut threads = self.threads.lock();
        let id = threads.len();
        if id >= self.workers.capacity() {
            return Err(VirtualFileError::service_error(format!(
                "worker pool is full ({} workers)",
                self.workers.capacity()
            )));
        }

        let (handle, thread) = DownloadWorker::spawn(id, connection, on_complete)?;
        threads.push(thread);
        // A rejected handle is dropped here, which stops the thread again
        self.workers
            .insert(handle)
            .map_err(|_| VirtualFileError::PoolClosed)?;
        Ok(id)
    }

    /// Take an idle worker, blocking until one is available or the pool is closed.
    pub fn acquire(&self) -> VirtualFileResult<WorkerHandle> {
        self.workers.acquire()
    }

    pub fn release(&self, worker: WorkerHandle) {
        self.workers.release(worker);
    }

    /// Stop handing out workers. Idle workers exit right away, busy ones once their
    /// handle comes back.
    pub fn close(&self) {
        self.workers.close();
    }

    /// Wait until every worker thread has exited. The pool must be closed first.
    pub fn join(&self) {
        let threads = std::mem::take(&mut *self.threads.lock());
        for thread in threads {
            if thread.join().is_err() {
                log::error!("Download worker panicked");
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.workers.capacity()
    }

    pub fn idle(&self) -> usize {
        self.workers.idle()
    }

    pub fn launched(&self) -> usize {
        self.workers.created()
    }
}
