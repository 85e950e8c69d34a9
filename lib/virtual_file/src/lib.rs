//! Lazily fetched, block cached view of a remote HTTP resource.
//!
//! [`VirtualFile`] splits the resource into fixed size blocks, keeps a bounded
//! set of them in memory and prefetches ahead of the reader with a bounded set
//! of download workers.

pub mod block_cache;
pub mod buffer;
pub mod config;
pub mod downloader;
pub mod errors;
pub mod events;
pub mod http;
pub mod resource_pool;
mod scheduler;
pub mod transport;
pub mod virtual_file;
pub mod worker_pool;

pub use crate::block_cache::{BlockStatus, CacheStats};
pub use crate::config::VirtualFileConfig;
pub use crate::errors::{VirtualFileError, VirtualFileResult};
pub use crate::events::{BlockEvent, BlockObserver, LogObserver, NoopObserver};
pub use crate::transport::{
    ChunkSink, Connector, Endpoint, HttpConnector, RangeConnection, ResourceMetadata,
    StaticConnector,
};
pub use crate::virtual_file::VirtualFile;
