use std::io::{ErrorKind, Read};
use std::ops::{ControlFlow, Range};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use reqwest::StatusCode;
use url::Url;

use crate::config::VirtualFileConfig;
use crate::errors::{VirtualFileError, VirtualFileResult};
use crate::transport::{ChunkSink, Endpoint, RangeConnection, ResourceMetadata};

/// How much of a response body is handed to the sink at once
const CHUNK_SIZE: usize = 64 * 1024;

/// Remote resource served over HTTP.
///
/// The probe is a `HEAD` request, blocks are fetched with `Range` requests.
/// Must not be used from within an async runtime, the client is blocking.
pub struct HttpEndpoint {
    url: Url,
    client: Client,
    connect_timeout: Duration,
}

impl HttpEndpoint {
    pub fn new(config: &VirtualFileConfig) -> VirtualFileResult<Self> {
        let url = Url::parse(&config.url).map_err(|err| {
            VirtualFileError::config_invalid(format!("url '{}': {err}", config.url))
        })?;
        let connect_timeout = config.connect_timeout();
        Ok(HttpEndpoint {
            url,
            client: build_client(connect_timeout)?,
            connect_timeout,
        })
    }
}

fn build_client(connect_timeout: Duration) -> VirtualFileResult<Client> {
    // A block may take arbitrarily long to stream, only the connection setup is bounded
    let client = Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(None::<Duration>)
        .build()?;
    Ok(client)
}

impl Endpoint for HttpEndpoint {
    fn probe(&self) -> VirtualFileResult<ResourceMetadata> {
        log::debug!("Probing {}", self.url);
        let response = self.client.head(self.url.clone()).send()?;
        let response = response.error_for_status()?;
        metadata_from_headers(response.headers())
    }

    fn connect(&self) -> VirtualFileResult<Box<dyn RangeConnection>> {
        Ok(Box::new(HttpConnection {
            client: build_client(self.connect_timeout)?,
            url: self.url.clone(),
        }))
    }
}

/// Dedicated HTTP client of one download worker.
pub struct HttpConnection {
    client: Client,
    url: Url,
}

impl RangeConnection for HttpConnection {
    fn fetch(&mut self, range: Range<u64>, sink: &mut ChunkSink<'_>) -> VirtualFileResult<()> {
        if range.is_empty() {
            return Ok(());
        }

        let mut response = self
            .client
            .get(self.url.clone())
            .header(RANGE, range_header(&range))
            .send()?;

        let content_range = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|value| value.to_str().ok());
        check_range_response(response.status(), content_range, &range)?;

        let mut remaining = range.end - range.start;
        let mut chunk = vec![0; CHUNK_SIZE];
        while remaining > 0 {
            let received = match response.read(&mut chunk) {
                Ok(0) => break,
                Ok(received) => received,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };
            // Servers ignoring the range send the whole resource, never pass beyond the block
            let size = remaining.min(received as u64) as usize;
            remaining -= size as u64;
            if let ControlFlow::Break(()) = sink(&chunk[..size]) {
                break;
            }
        }

        Ok(())
    }
}

/// `Range` header value for a half open byte range.
pub fn range_header(range: &Range<u64>) -> String {
    format!("bytes={}-{}", range.start, range.end.saturating_sub(1))
}

pub fn metadata_from_headers(headers: &HeaderMap) -> VirtualFileResult<ResourceMetadata> {
    let size = headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .ok_or_else(|| VirtualFileError::metadata_missing("Content-Length"))?;

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .ok_or_else(|| VirtualFileError::metadata_missing("Content-Type"))?;

    Ok(ResourceMetadata { size, content_type })
}

fn check_range_response(
    status: StatusCode,
    content_range: Option<&str>,
    range: &Range<u64>,
) -> VirtualFileResult<()> {
    match status {
        StatusCode::PARTIAL_CONTENT => {
            let content_range = content_range.ok_or_else(|| {
                VirtualFileError::transport("missing Content-Range on partial response")
            })?;
            let (start, _end, _total) = parse_content_range(content_range).ok_or_else(|| {
                VirtualFileError::transport(format!(
                    "invalid Content-Range header '{content_range}'"
                ))
            })?;
            if start != range.start {
                return Err(VirtualFileError::transport(format!(
                    "content-range mismatch: got start {start}, expected {}",
                    range.start
                )));
            }
            Ok(())
        }
        // Whole resource, usable only when the block starts at the beginning
        StatusCode::OK if range.start == 0 => Ok(()),
        status => Err(VirtualFileError::transport(format!(
            "GET status {status} (expected 206 Partial Content)"
        ))),
    }
}

fn parse_content_range(header: &str) -> Option<(u64, u64, Option<u64>)> {
    // e.g. "bytes 0-1023/4096"
    let header = header.trim().strip_prefix("bytes ")?;
    let (span, total) = header.split_once('/')?;
    let (start, end) = span.split_once('-')?;
    let start = start.parse::<u64>().ok()?;
    let end = end.parse::<u64>().ok()?;
    let total = if total == "*" {
        None
    } else {
        Some(total.parse::<u64>().ok()?)
    };
    Some((start, end, total))
}
