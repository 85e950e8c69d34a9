use std::ops::Range;
use std::sync::Arc;

use actix_web::body::SizedStream;
use actix_web::http::header::{self, HeaderValue};
use actix_web::web::Bytes;
use actix_web::{web, HttpRequest, HttpResponse};
use futures::{stream, Stream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use virtual_file::{VirtualFile, VirtualFileError};

use crate::actix::helpers::virtual_file_into_actix_error;

/// Outcome of interpreting the `Range` header against a resource of known size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestedRange {
    /// No usable range, serve everything
    Full,
    Partial(Range<u64>),
    Unsatisfiable,
}

/// Interpret a single `bytes=` range. Malformed and multi-range headers are ignored.
pub fn parse_range(value: &str, size: u64) -> RequestedRange {
    let Some(ranges) = value.trim().strip_prefix("bytes=") else {
        return RequestedRange::Full;
    };
    if ranges.contains(',') {
        return RequestedRange::Full;
    }
    let Some((start, end)) = ranges.trim().split_once('-') else {
        return RequestedRange::Full;
    };

    let range = match (start.trim(), end.trim()) {
        ("", "") => return RequestedRange::Full,
        // Suffix range: the last `n` bytes
        ("", suffix) => match suffix.parse::<u64>() {
            Ok(0) => return RequestedRange::Unsatisfiable,
            Ok(suffix) => size.saturating_sub(suffix)..size,
            Err(_) => return RequestedRange::Full,
        },
        (start, "") => match start.parse::<u64>() {
            Ok(start) => start..size,
            Err(_) => return RequestedRange::Full,
        },
        (start, end) => match (start.parse::<u64>(), end.parse::<u64>()) {
            (Ok(start), Ok(end)) if start <= end => start..end.saturating_add(1).min(size),
            _ => return RequestedRange::Full,
        },
    };

    if range.start >= size {
        RequestedRange::Unsatisfiable
    } else {
        RequestedRange::Partial(range)
    }
}

/// Lets a single response body at a time move the read cursor of the file.
///
/// The file prefetches ahead of its latest read only, so two interleaved streams would keep
/// flushing each other's blocks, and a reader waiting behind the cursor could wait forever.
#[derive(Clone)]
pub struct StreamGate(Arc<Semaphore>);

impl Default for StreamGate {
    fn default() -> Self {
        StreamGate(Arc::new(Semaphore::new(1)))
    }
}

impl StreamGate {
    async fn enter(&self) -> Result<OwnedSemaphorePermit, VirtualFileError> {
        self.0
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| VirtualFileError::service_error(format!("stream gate: {err}")))
    }
}

struct BodyState {
    position: u64,
    /// Taken on the first poll, released when the body ends or is dropped
    permit: Option<OwnedSemaphorePermit>,
}

/// Body of `range`, read block by block on the blocking thread pool.
///
/// Ends early if a read returns nothing.
fn body_stream(
    file: web::Data<VirtualFile>,
    gate: StreamGate,
    range: Range<u64>,
    request_size: usize,
) -> impl Stream<Item = Result<Bytes, VirtualFileError>> {
    let end = range.end;
    let start = BodyState {
        position: range.start,
        permit: None,
    };
    stream::unfold(Some(start), move |state| {
        let file = file.clone();
        let gate = gate.clone();
        async move {
            let BodyState { position, permit } = state?;
            if position >= end {
                return None;
            }
            let permit = match permit {
                Some(permit) => permit,
                None => match gate.enter().await {
                    Ok(permit) => permit,
                    Err(err) => return Some((Err(err), None)),
                },
            };
            let len = request_size.min((end - position) as usize);
            match web::block(move || file.read(position, len)).await {
                Ok(Ok(data)) if data.is_empty() => None,
                Ok(Ok(data)) => {
                    let next = BodyState {
                        position: position + data.len() as u64,
                        permit: Some(permit),
                    };
                    Some((Ok(Bytes::from(data)), Some(next)))
                }
                Ok(Err(err)) => {
                    log::warn!("Stream interrupted at {position}: {err}");
                    Some((Err(err), None))
                }
                Err(err) => Some((
                    Err(VirtualFileError::service_error(format!(
                        "blocking read failed: {err}"
                    ))),
                    None,
                )),
            }
        }
    })
}

/// `GET`/`HEAD` of the virtual file, with single range support.
pub async fn stream_file(
    request: HttpRequest,
    file: web::Data<VirtualFile>,
    gate: web::Data<StreamGate>,
) -> Result<HttpResponse, actix_web::Error> {
    let (Some(metadata), Some(block_size)) = (file.metadata(), file.block_size()) else {
        return Err(virtual_file_into_actix_error(VirtualFileError::NotOpen));
    };
    let size = metadata.size;

    let requested = request
        .headers()
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .map_or(RequestedRange::Full, |value| parse_range(value, size));

    let mut response = match &requested {
        RequestedRange::Full => HttpResponse::Ok(),
        RequestedRange::Partial(range) => {
            let mut response = HttpResponse::PartialContent();
            response.insert_header((
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{size}", range.start, range.end - 1),
            ));
            response
        }
        RequestedRange::Unsatisfiable => {
            return Ok(HttpResponse::RangeNotSatisfiable()
                .insert_header((header::CONTENT_RANGE, format!("bytes */{size}")))
                .finish());
        }
    };

    response.insert_header((header::ACCEPT_RANGES, HeaderValue::from_static("bytes")));
    if let Ok(content_type) = HeaderValue::from_str(&metadata.content_type) {
        response.insert_header((header::CONTENT_TYPE, content_type));
    }

    let range = match requested {
        RequestedRange::Partial(range) => range,
        _ => 0..size,
    };
    let len = range.end - range.start;
    let body = body_stream(file, StreamGate::clone(&gate), range, block_size);
    Ok(response.body(SizedStream::new(len, body)))
}

/// Current cache occupancy.
pub async fn cache_stats(file: web::Data<VirtualFile>) -> Result<HttpResponse, actix_web::Error> {
    match file.stats() {
        Some(stats) => Ok(HttpResponse::Ok().json(stats)),
        None => Err(virtual_file_into_actix_error(VirtualFileError::NotOpen)),
    }
}

pub fn config_stream_api(cfg: &mut web::ServiceConfig, route: &str) {
    cfg.route(route, web::get().to(stream_file))
        .route(route, web::head().to(stream_file))
        .route("/stats", web::get().to(cache_stats));
}
