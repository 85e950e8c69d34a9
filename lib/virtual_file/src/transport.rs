use std::ops::{ControlFlow, Range};
use std::sync::Arc;

use crate::config::VirtualFileConfig;
use crate::errors::VirtualFileResult;
use crate::http::HttpEndpoint;

/// What the metadata probe tells about the remote resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceMetadata {
    /// Total size in bytes
    pub size: u64,
    pub content_type: String,
}

/// Receives the chunks of a ranged response, `Break` aborts the transfer.
pub type ChunkSink<'a> = dyn FnMut(&[u8]) -> ControlFlow<()> + 'a;

/// Remote resource which can be probed and fetched in ranges.
pub trait Endpoint: Send + Sync {
    /// Retrieve size and content type of the resource.
    fn probe(&self) -> VirtualFileResult<ResourceMetadata>;

    /// Open a new independent connection, one per download worker.
    fn connect(&self) -> VirtualFileResult<Box<dyn RangeConnection>>;
}

/// Connection owned by a single download worker.
pub trait RangeConnection: Send {
    /// Stream the bytes of `range` into `sink`, chunk by chunk.
    ///
    /// Returns `Ok` when the response ended or the sink asked to stop.
    fn fetch(&mut self, range: Range<u64>, sink: &mut ChunkSink<'_>) -> VirtualFileResult<()>;
}

/// Resolves the configured locator into an [`Endpoint`].
pub trait Connector: Send + Sync {
    fn endpoint(&self, config: &VirtualFileConfig) -> VirtualFileResult<Arc<dyn Endpoint>>;
}

/// Connects to the configured URL over HTTP.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpConnector;

impl Connector for HttpConnector {
    fn endpoint(&self, config: &VirtualFileConfig) -> VirtualFileResult<Arc<dyn Endpoint>> {
        Ok(Arc::new(HttpEndpoint::new(config)?))
    }
}

/// Always hands out the same endpoint, ignoring the configured locator.
#[derive(Clone)]
pub struct StaticConnector {
    endpoint: Arc<dyn Endpoint>,
}

impl StaticConnector {
    pub fn new(endpoint: Arc<dyn Endpoint>) -> Self {
        StaticConnector { endpoint }
    }
}

impl Connector for StaticConnector {
    fn endpoint(&self, _config: &VirtualFileConfig) -> VirtualFileResult<Arc<dyn Endpoint>> {
        Ok(self.endpoint.clone())
    }
}
