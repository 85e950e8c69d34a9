use std::sync::Arc;
use std::thread;
use std::time::Duration;

use virtual_file::{
    BlockEvent, BlockStatus, NoopObserver, VirtualFile, VirtualFileConfig, VirtualFileError,
};

use crate::common::{source, wait_until, EventRecorder, FakeEndpoint, CONTENT_TYPE};

mod common;

const URL: &str = "http://localhost/video.mp4";
const WAIT: Duration = Duration::from_secs(10);

fn config(block_size: usize, cache_size: usize, max_workers: usize) -> VirtualFileConfig {
    let mut config = VirtualFileConfig::new(URL, block_size, cache_size, max_workers);
    config.retry_backoff_ms = 10;
    config.max_retry_backoff_ms = 40;
    config
}

fn open(endpoint: &FakeEndpoint, config: VirtualFileConfig) -> (VirtualFile, Arc<EventRecorder>) {
    let recorder = Arc::new(EventRecorder::default());
    let file =
        VirtualFile::with_endpoint(endpoint.clone().into_arc()).with_observer(recorder.clone());
    file.open(config).unwrap();
    (file, recorder)
}

/// Read `[offset, end)` with as many calls as the block boundaries require.
fn read_span(file: &VirtualFile, mut offset: u64, end: u64, request: usize) -> Vec<u8> {
    let mut data = Vec::new();
    while offset < end {
        let chunk = file.read(offset, request.min((end - offset) as usize)).unwrap();
        assert!(!chunk.is_empty());
        offset += chunk.len() as u64;
        data.extend(chunk);
    }
    data
}

#[test]
fn test_reads_are_clipped_to_block_and_resource() {
    let endpoint = FakeEndpoint::new(source(10_000));
    let (file, _) = open(&endpoint, config(4000, 8000, 1));
    let data = endpoint.data();

    assert_eq!(file.size(), Some(10_000));
    assert_eq!(file.content_type().as_deref(), Some(CONTENT_TYPE));
    assert_eq!(file.block_count(), Some(3));

    assert_eq!(file.read(0, 4000).unwrap(), &data[0..4000]);
    assert_eq!(file.read(4000, 4000).unwrap(), &data[4000..8000]);
    assert_eq!(file.read(9000, 4000).unwrap(), &data[9000..10_000]);

    // Spans crossing a block boundary end at the boundary
    assert_eq!(file.read(7000, 2000).unwrap(), &data[7000..8000]);
}

#[test]
fn test_misuse_is_rejected() {
    let endpoint = FakeEndpoint::new(source(1000));
    let file = VirtualFile::with_endpoint(endpoint.clone().into_arc());

    assert_eq!(file.read(0, 10), Err(VirtualFileError::NotOpen));
    assert!(file.metadata().is_none());
    assert!(file.cached_blocks().is_empty());

    file.open(config(100, 200, 1)).unwrap();
    assert!(file.is_open());
    assert_eq!(
        file.open(config(100, 200, 1)),
        Err(VirtualFileError::AlreadyOpen)
    );
    assert_eq!(
        file.read(1000, 10),
        Err(VirtualFileError::OutOfRange {
            offset: 1000,
            size: 1000
        })
    );
    assert_eq!(file.read(999, 10).unwrap(), &endpoint.data()[999..1000]);

    file.close();
    assert!(!file.is_open());
    assert_eq!(file.read(0, 10), Err(VirtualFileError::NotOpen));
    assert_eq!(
        file.open(config(100, 200, 1)),
        Err(VirtualFileError::AlreadyOpen)
    );
    assert_eq!(endpoint.stats.probes.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[test]
fn test_invalid_config_fails_before_probe() {
    let endpoint = FakeEndpoint::new(source(1000));
    let file = VirtualFile::with_endpoint(endpoint.clone().into_arc());

    let result = file.open(config(300, 200, 1));
    assert!(matches!(result, Err(VirtualFileError::ConfigInvalid { .. })));
    assert_eq!(endpoint.stats.probes.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert!(!file.is_open());
}

#[test]
fn test_failed_open_leaves_file_unopened() {
    let endpoint = FakeEndpoint::new(source(1000)).without_content_type();
    let file = VirtualFile::with_endpoint(endpoint.clone().into_arc());
    assert_eq!(
        file.open(config(100, 200, 2)),
        Err(VirtualFileError::metadata_missing("Content-Type"))
    );
    assert!(!file.is_open());
    assert_eq!(file.read(0, 10), Err(VirtualFileError::NotOpen));
    assert_eq!(
        endpoint.stats.connections.load(std::sync::atomic::Ordering::SeqCst),
        0
    );

    let endpoint = FakeEndpoint::new(source(1000))
        .with_probe_error(VirtualFileError::transport("connection refused"));
    let file = VirtualFile::with_endpoint(endpoint.into_arc());
    assert_eq!(
        file.open(config(100, 200, 2)),
        Err(VirtualFileError::transport("connection refused"))
    );
    // Still unopened, so another attempt is not rejected as a double open
    assert_eq!(
        file.open(config(100, 200, 2)),
        Err(VirtualFileError::transport("connection refused"))
    );
}

#[test]
fn test_sequential_read_of_whole_resource() {
    let endpoint = FakeEndpoint::new(source(25_000)).with_chunk(333);
    let (file, recorder) = open(&endpoint, config(1000, 4000, 3));

    let data = read_span(&file, 0, 25_000, 1000);
    assert_eq!(data, endpoint.data());

    // Every block was fetched exactly once and nothing was flushed
    let mut starts = endpoint.stats.fetched_starts();
    starts.sort_unstable();
    assert_eq!(starts, (0..25).map(|i| i * 1000).collect::<Vec<_>>());
    assert_eq!(
        recorder.count(|event| matches!(event, BlockEvent::Flushed { .. })),
        0
    );
}

#[test]
fn test_sequential_read_with_single_buffer() {
    let endpoint = FakeEndpoint::new(source(300));
    let (file, recorder) = open(&endpoint, config(100, 100, 1));

    assert_eq!(file.read(0, 100).unwrap(), &endpoint.data()[0..100]);
    assert_eq!(file.read(100, 100).unwrap(), &endpoint.data()[100..200]);
    assert_eq!(read_span(&file, 200, 300, 100), &endpoint.data()[200..300]);
    assert!(recorder.count(|event| matches!(event, BlockEvent::Evicted { index: 0 })) >= 1);
    assert_eq!(file.stats().unwrap().allocated_buffers, 1);
}

#[test]
fn test_small_reads_within_block() {
    let endpoint = FakeEndpoint::new(source(3000));
    let (file, _) = open(&endpoint, config(1000, 2000, 2));

    let data = read_span(&file, 0, 3000, 188);
    assert_eq!(data, endpoint.data());
}

#[test]
fn test_read_ahead_stops_at_end_of_resource() {
    let endpoint = FakeEndpoint::new(source(250));
    let (file, _) = open(&endpoint, config(100, 1000, 2));

    file.read(0, 10).unwrap();
    wait_until(WAIT, || {
        file.cached_blocks()
            .iter()
            .filter(|(_, status)| *status == BlockStatus::Ready)
            .count()
            == 3
    });
    thread::sleep(Duration::from_millis(50));

    assert_eq!(endpoint.stats.fetches(), 3);
    assert_eq!(
        file.cached_blocks(),
        vec![
            (0, BlockStatus::Ready),
            (1, BlockStatus::Ready),
            (2, BlockStatus::Ready)
        ]
    );
}

#[test]
fn test_previous_block_is_released() {
    let endpoint = FakeEndpoint::new(source(1000));
    let (file, _) = open(&endpoint, config(100, 300, 1));

    file.read(0, 100).unwrap();
    file.read(100, 100).unwrap();
    let cached: Vec<u64> = file.cached_blocks().iter().map(|(index, _)| *index).collect();
    assert!(!cached.contains(&0), "block 0 still cached: {cached:?}");

    file.read(250, 10).unwrap();
    let cached: Vec<u64> = file.cached_blocks().iter().map(|(index, _)| *index).collect();
    assert!(!cached.contains(&1), "block 1 still cached: {cached:?}");
}

#[test]
fn test_seek_flushes_cache() {
    let endpoint = FakeEndpoint::new(source(2000));
    let (file, recorder) = open(&endpoint, config(100, 400, 2));

    file.read(0, 100).unwrap();
    wait_until(WAIT, || file.stats().unwrap().ready_blocks == 4);

    assert_eq!(file.read(1500, 100).unwrap(), &endpoint.data()[1500..1600]);
    assert!(recorder
        .events()
        .iter()
        .any(|event| matches!(event, BlockEvent::Flushed { blocks } if *blocks > 0)));

    // Read-ahead resumes from the new position only
    wait_until(WAIT, || file.stats().unwrap().ready_blocks == 4);
    assert!(file.cached_blocks().iter().all(|(index, _)| *index >= 15));

    // Seeking backwards is a jump as well
    assert_eq!(file.read(300, 100).unwrap(), &endpoint.data()[300..400]);
    assert_eq!(
        recorder.count(|event| matches!(event, BlockEvent::Flushed { .. })),
        2
    );
}

#[test]
fn test_seek_cancels_in_flight_fetches() {
    let endpoint = FakeEndpoint::new(source(10_000))
        .with_chunk(10)
        .with_latency(Duration::from_millis(2));
    let (file, recorder) = open(&endpoint, config(1000, 4000, 3));

    file.read(0, 10).unwrap();
    wait_until(WAIT, || file.stats().unwrap().pending_blocks > 0);

    assert_eq!(file.read(8500, 10).unwrap(), &endpoint.data()[8500..8510]);
    wait_until(WAIT, || endpoint.stats.aborted() > 0);
    assert!(recorder.count(|event| matches!(event, BlockEvent::Cancelled { .. })) > 0);

    // Capacity of the cancelled fetches is back in the pools
    wait_until(WAIT, || {
        let stats = file.stats().unwrap();
        stats.pending_blocks == 0 && stats.idle_workers == stats.workers_capacity
    });
    let stats = file.stats().unwrap();
    assert!(stats.ready_blocks <= 2);
    assert_eq!(stats.idle_buffers + stats.ready_blocks, stats.allocated_buffers);
}

#[test]
fn test_concurrency_stays_within_bounds() {
    let endpoint = FakeEndpoint::new(source(30_000))
        .with_chunk(100)
        .with_latency(Duration::from_micros(200));
    let (file, _) = open(&endpoint, config(1000, 5000, 3));

    let mut offset = 0;
    while offset < 30_000 {
        let data = file.read(offset, 1000).unwrap();
        assert_eq!(data, &endpoint.data()[offset as usize..offset as usize + data.len()]);
        offset += data.len() as u64;

        let stats = file.stats().unwrap();
        assert!(stats.pending_blocks <= 3, "{stats:?}");
        assert!(stats.pending_blocks + stats.ready_blocks <= 5, "{stats:?}");
        assert!(stats.allocated_buffers <= 5, "{stats:?}");
    }

    assert!(endpoint.stats.max_in_flight() <= 3);
    assert_eq!(endpoint.stats.connections.load(std::sync::atomic::Ordering::SeqCst), 3);
}

#[test]
fn test_failed_fetches_are_retried() {
    let endpoint = FakeEndpoint::new(source(3000)).with_failures(3);
    let (file, recorder) = open(&endpoint, config(1000, 2000, 1));

    let data = read_span(&file, 0, 3000, 1000);
    assert_eq!(data, endpoint.data());
    assert_eq!(
        recorder.count(|event| matches!(event, BlockEvent::Failed { .. })),
        3
    );
}

#[test]
fn test_failed_block_recovers_when_read_ahead_holds_all_buffers() {
    // The first fetch of block 0 fails, blocks 1 and 2 then take both buffers
    let endpoint = FakeEndpoint::new(source(1000)).with_failures(1);
    let (file, recorder) = open(&endpoint, config(100, 200, 1));

    wait_until(WAIT, || {
        recorder.count(|event| matches!(event, BlockEvent::Failed { index: 0, .. })) == 1
    });
    assert_eq!(file.read(0, 100).unwrap(), &endpoint.data()[0..100]);
}

#[test]
fn test_read_times_out_on_broken_endpoint() {
    let endpoint = FakeEndpoint::new(source(1000));
    endpoint.set_broken(true);
    let mut config = config(100, 200, 1);
    config.read_timeout_ms = Some(200);
    let (file, _) = open(&endpoint, config);

    assert!(matches!(
        file.read(0, 10),
        Err(VirtualFileError::Timeout { index: 0, .. })
    ));

    endpoint.set_broken(false);
    assert_eq!(file.read(0, 10).unwrap(), &endpoint.data()[0..10]);
}

#[test]
fn test_close_wakes_waiting_reader() {
    let endpoint = FakeEndpoint::new(source(1000));
    endpoint.set_broken(true);
    let file = Arc::new(
        VirtualFile::with_endpoint(endpoint.clone().into_arc())
            .with_observer(Arc::new(NoopObserver)),
    );
    file.open(config(100, 200, 2)).unwrap();

    let reader = {
        let file = file.clone();
        thread::spawn(move || file.read(0, 10))
    };
    thread::sleep(Duration::from_millis(30));
    file.close();

    assert_eq!(reader.join().unwrap(), Err(VirtualFileError::NotOpen));
    assert_eq!(endpoint.stats.in_flight.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[test]
fn test_drop_stops_slow_fetches() {
    let endpoint = FakeEndpoint::new(source(100_000))
        .with_chunk(10)
        .with_latency(Duration::from_millis(1));
    {
        let (file, _) = open(&endpoint, config(10_000, 40_000, 4));
        wait_until(WAIT, || file.stats().unwrap().pending_blocks == 4);
    }
    // Dropping joined every worker, so nothing is fetching anymore
    assert_eq!(endpoint.stats.in_flight.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert!(endpoint.stats.aborted() >= 4);
}

mod random_access {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn test_random_reads_match_source(
            size in 1usize..5000,
            block_size in 1usize..700,
            buffers in 1usize..5,
            workers in 1usize..4,
            reads in prop::collection::vec((0.0f64..1.0, 1usize..900), 1..20),
        ) {
            let endpoint = FakeEndpoint::new(source(size)).with_chunk(97);
            let (file, _) = open(&endpoint, config(block_size, block_size * buffers, workers));

            for (position, len) in reads {
                let offset = ((size as f64 * position) as usize).min(size - 1);
                let block_end = (offset / block_size + 1) * block_size;
                let expected_end = (offset + len).min(block_end).min(size);

                let data = file.read(offset as u64, len).unwrap();
                prop_assert_eq!(data.as_slice(), &endpoint.data()[offset..expected_end]);
            }
        }
    }
}
