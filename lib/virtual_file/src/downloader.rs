use std::ops::{ControlFlow, Range};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use tokio_util::sync::CancellationToken;

use crate::buffer::Buffer;
use crate::errors::{VirtualFileError, VirtualFileResult};
use crate::transport::RangeConnection;

pub type WorkerId = usize;

/// Range fetch of a single block.
#[derive(Debug)]
pub struct FetchJob {
    pub index: u64,
    /// Identifies this particular dispatch of the block
    pub ticket: u64,
    pub range: Range<u64>,
    /// Destination, owned by the job while it is in flight
    pub buffer: Buffer,
    pub cancel: CancellationToken,
}

impl FetchJob {
    /// Bytes the block should hold once fetched
    pub fn expected_size(&self) -> usize {
        (self.range.end - self.range.start) as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Completed,
    Cancelled,
    Failed(VirtualFileError),
}

/// Job handed to a worker together with the worker's own handle.
///
/// Both come back through the completion callback, which decides where the buffer and the
/// handle go next.
pub struct Assignment {
    pub job: FetchJob,
    pub worker: WorkerHandle,
}

pub type CompletionCallback = Arc<dyn Fn(FetchOutcome, Assignment) + Send + Sync>;

/// Exclusive right to assign a job to an idle download worker.
///
/// There is exactly one handle per worker and it travels with the job, so a worker which is
/// fetching can not be handed a second job.
#[derive(Debug)]
pub struct WorkerHandle {
    id: WorkerId,
    jobs: Sender<Assignment>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Start fetching `job`.
    ///
    /// Gives the assignment back if the worker thread is gone.
    pub fn submit(self, job: FetchJob) -> Result<(), Assignment> {
        let jobs = self.jobs.clone();
        jobs.try_send(Assignment { job, worker: self })
            .map_err(|err| err.into_inner())
    }
}

impl std::fmt::Debug for Assignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assignment")
            .field("job", &self.job)
            .field("worker", &self.worker.id)
            .finish()
    }
}

/// Sequential fetcher bound to its own connection, running on a dedicated thread.
pub struct DownloadWorker {
    id: WorkerId,
    connection: Box<dyn RangeConnection>,
    jobs: Receiver<Assignment>,
    on_complete: CompletionCallback,
}

impl DownloadWorker {
    /// Start the worker thread.
    ///
    /// The thread exits once the returned handle is dropped while the worker is idle.
    pub fn spawn(
        id: WorkerId,
        connection: Box<dyn RangeConnection>,
        on_complete: CompletionCallback,
    ) -> VirtualFileResult<(WorkerHandle, JoinHandle<()>)> {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let worker = DownloadWorker {
            id,
            connection,
            jobs: receiver,
            on_complete,
        };
        let thread = thread::Builder::new()
            .name(format!("http-pump-download-{}", id + 1))
            .spawn(move || worker.run())
            .map_err(|err| {
                VirtualFileError::service_error(format!("failed to spawn download worker: {err}"))
            })?;
        Ok((WorkerHandle { id, jobs: sender }, thread))
    }

    fn run(mut self) {
        while let Ok(mut assignment) = self.jobs.recv() {
            let outcome = fetch_block(self.connection.as_mut(), &mut assignment.job);
            log::trace!(
                "Worker {} finished block {}: {:?}",
                self.id,
                assignment.job.index,
                outcome
            );
            (self.on_complete)(outcome, assignment);
        }
    }
}

/// Fetch the job's range into its buffer, checking for cancellation on every received chunk.
pub fn fetch_block(connection: &mut dyn RangeConnection, job: &mut FetchJob) -> FetchOutcome {
    job.buffer.clear();
    if job.cancel.is_cancelled() {
        return FetchOutcome::Cancelled;
    }

    let expected = job.expected_size();
    let range = job.range.clone();
    let cancel = &job.cancel;
    let buffer = &mut job.buffer;
    let mut aborted = false;

    let result = connection.fetch(range, &mut |chunk| {
        if cancel.is_cancelled() {
            aborted = true;
            return ControlFlow::Break(());
        }
        let room = expected - buffer.actual_size();
        buffer.append(&chunk[..chunk.len().min(room)]);
        if buffer.actual_size() >= expected {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    });

    if aborted || cancel.is_cancelled() {
        return FetchOutcome::Cancelled;
    }

    match result {
        Err(err) => FetchOutcome::Failed(err),
        Ok(()) if buffer.actual_size() == expected => FetchOutcome::Completed,
        Ok(()) => FetchOutcome::Failed(VirtualFileError::transport(format!(
            "response ended after {} of {expected} bytes",
            buffer.actual_size()
        ))),
    }
}
