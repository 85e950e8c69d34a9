use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::block_cache::BlockCache;
use crate::downloader::FetchJob;
use crate::errors::{VirtualFileError, VirtualFileResult};
use crate::events::BlockEvent;

/// Upper bound on how long the scheduler sleeps when there is nothing to fetch.
/// Cache updates wake it earlier.
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Start the read-ahead loop on its own thread.
pub(crate) fn spawn(cache: Arc<BlockCache>) -> VirtualFileResult<JoinHandle<()>> {
    thread::Builder::new()
        .name("http-pump-scheduler".to_string())
        .spawn(move || run(cache))
        .map_err(|err| VirtualFileError::service_error(format!("failed to spawn scheduler: {err}")))
}

/// Keep every idle worker busy with the next absent block after the cursor.
///
/// Each dispatch takes a buffer first and a worker second, so the number of blocks in the cache
/// never exceeds the buffer capacity and the number of fetches never exceeds the worker capacity.
/// Nothing is held while there is nothing to fetch.
fn run(cache: Arc<BlockCache>) {
    log::debug!("Scheduler started");
    loop {
        if !cache.wait_for_gap(IDLE_WAIT) {
            break;
        }
        let Ok(buffer) = cache.buffers().acquire() else {
            break;
        };
        let worker = match cache.workers().acquire() {
            Ok(worker) => worker,
            Err(_) => {
                cache.buffers().release(buffer);
                break;
            }
        };
        let Some(reservation) = cache.reserve_next(worker.id(), IDLE_WAIT) else {
            cache.buffers().release(buffer);
            cache.workers().release(worker);
            break;
        };

        cache.observer().on_event(&BlockEvent::Scheduled {
            index: reservation.index,
            worker: worker.id(),
        });
        let job = FetchJob {
            index: reservation.index,
            ticket: reservation.ticket,
            range: reservation.range,
            buffer,
            cancel: reservation.cancel,
        };
        if let Err(assignment) = worker.submit(job) {
            cache.abandon(assignment);
        }
    }
    log::debug!("Scheduler stopped");
}
