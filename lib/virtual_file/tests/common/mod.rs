#![allow(dead_code)]

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use virtual_file::{
    BlockEvent, BlockObserver, ChunkSink, Endpoint, RangeConnection, ResourceMetadata,
    VirtualFileError, VirtualFileResult,
};

pub const CONTENT_TYPE: &str = "video/mp4";

/// Deterministic resource content.
pub fn source(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

/// Counters shared by a [`FakeEndpoint`] and all of its connections.
#[derive(Default)]
pub struct FetchStats {
    pub probes: AtomicUsize,
    pub connections: AtomicUsize,
    pub fetches: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    /// Transfers stopped by the consumer before the range was served
    pub aborted: AtomicUsize,
    pub fetched_ranges: Mutex<Vec<Range<u64>>>,
}

impl FetchStats {
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn fetched_starts(&self) -> Vec<u64> {
        self.fetched_ranges
            .lock()
            .iter()
            .map(|range| range.start)
            .collect()
    }
}

/// In-memory endpoint with adjustable latency and failures.
#[derive(Clone)]
pub struct FakeEndpoint {
    data: Arc<Vec<u8>>,
    pub stats: Arc<FetchStats>,
    /// Size of the chunks handed to the sink
    chunk: usize,
    /// Sleep before every chunk
    latency: Duration,
    /// Fail this many fetches before serving anything
    failures: Arc<AtomicUsize>,
    /// Fail every fetch
    broken: Arc<AtomicBool>,
    content_type: Option<String>,
    probe_error: Option<VirtualFileError>,
}

impl FakeEndpoint {
    pub fn new(data: Vec<u8>) -> Self {
        FakeEndpoint {
            data: Arc::new(data),
            stats: Arc::new(FetchStats::default()),
            chunk: 512,
            latency: Duration::ZERO,
            failures: Arc::new(AtomicUsize::new(0)),
            broken: Arc::new(AtomicBool::new(false)),
            content_type: Some(CONTENT_TYPE.to_string()),
            probe_error: None,
        }
    }

    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = chunk;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_failures(self, failures: usize) -> Self {
        self.failures.store(failures, Ordering::SeqCst);
        self
    }

    pub fn without_content_type(mut self) -> Self {
        self.content_type = None;
        self
    }

    pub fn with_probe_error(mut self, error: VirtualFileError) -> Self {
        self.probe_error = Some(error);
        self
    }

    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_arc(self) -> Arc<dyn Endpoint> {
        Arc::new(self)
    }
}

impl Endpoint for FakeEndpoint {
    fn probe(&self) -> VirtualFileResult<ResourceMetadata> {
        self.stats.probes.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.probe_error {
            return Err(error.clone());
        }
        let content_type = self
            .content_type
            .clone()
            .ok_or_else(|| VirtualFileError::metadata_missing("Content-Type"))?;
        Ok(ResourceMetadata {
            size: self.data.len() as u64,
            content_type,
        })
    }

    fn connect(&self) -> VirtualFileResult<Box<dyn RangeConnection>> {
        self.stats.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.clone()))
    }
}

impl RangeConnection for FakeEndpoint {
    fn fetch(&mut self, range: Range<u64>, sink: &mut ChunkSink<'_>) -> VirtualFileResult<()> {
        let stats = &self.stats;
        stats.fetches.fetch_add(1, Ordering::SeqCst);
        stats.fetched_ranges.lock().push(range.clone());
        let in_flight = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let result = self.serve(range, sink);

        stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl FakeEndpoint {
    fn serve(&self, range: Range<u64>, sink: &mut ChunkSink<'_>) -> VirtualFileResult<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(VirtualFileError::transport("connection refused"));
        }
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if fail {
            return Err(VirtualFileError::transport("connection reset"));
        }

        let end = (range.end as usize).min(self.data.len());
        let body = &self.data[range.start as usize..end];
        let chunks = body.chunks(self.chunk).count();
        for (n, chunk) in body.chunks(self.chunk).enumerate() {
            if !self.latency.is_zero() {
                std::thread::sleep(self.latency);
            }
            if sink(chunk).is_break() {
                if n + 1 < chunks {
                    self.stats.aborted.fetch_add(1, Ordering::SeqCst);
                }
                break;
            }
        }
        Ok(())
    }
}

/// Keeps every event for later inspection.
#[derive(Default)]
pub struct EventRecorder {
    events: Mutex<Vec<BlockEvent>>,
}

impl EventRecorder {
    pub fn events(&self) -> Vec<BlockEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&BlockEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|event| predicate(event)).count()
    }
}

impl BlockObserver for EventRecorder {
    fn on_event(&self, event: &BlockEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Poll `condition` until it holds, failing the test after `timeout`.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let started = std::time::Instant::now();
    while !condition() {
        assert!(
            started.elapsed() < timeout,
            "condition not met within {timeout:?}"
        );
        std::thread::sleep(Duration::from_millis(2));
    }
}
