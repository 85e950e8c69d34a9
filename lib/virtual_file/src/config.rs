use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::errors::VirtualFileResult;

const DEFAULT_POLL_INTERVAL_MS: u64 = 1;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 100;
const DEFAULT_MAX_RETRY_BACKOFF_MS: u64 = 5_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3_000;

/// Parameters of a [`crate::VirtualFile`], fixed once the file is opened.
#[derive(Debug, Deserialize, Serialize, Validate, Clone, PartialEq, Eq)]
#[validate(schema(function = "validate_block_fits_cache"))]
pub struct VirtualFileConfig {
    /// Address of the remote resource
    #[validate(length(min = 1))]
    pub url: String,
    /// Size of a single cached block in bytes
    #[validate(range(min = 1))]
    pub block_size: usize,
    /// Total memory budget of the block cache in bytes
    #[validate(range(min = 1))]
    pub cache_size: usize,
    /// Number of concurrent download workers
    #[validate(range(min = 1))]
    pub max_workers: usize,
    /// Upper bound between two readiness checks of a waiting reader
    #[serde(default = "default_poll_interval_ms")]
    #[validate(range(min = 1))]
    pub poll_interval_ms: u64,
    /// Fail a read which waits longer than this for its block. `None` waits forever.
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
    /// Delay before a failed block is fetched again, doubled on each consecutive failure
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_retry_backoff_ms")]
    pub max_retry_backoff_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl VirtualFileConfig {
    pub fn new(
        url: impl Into<String>,
        block_size: usize,
        cache_size: usize,
        max_workers: usize,
    ) -> Self {
        VirtualFileConfig {
            url: url.into(),
            block_size,
            cache_size,
            max_workers,
            poll_interval_ms: default_poll_interval_ms(),
            read_timeout_ms: None,
            retry_backoff_ms: default_retry_backoff_ms(),
            max_retry_backoff_ms: default_max_retry_backoff_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }

    /// Check the config invariants, converting violations into [`crate::VirtualFileError::ConfigInvalid`].
    pub fn check(&self) -> VirtualFileResult<()> {
        self.validate()?;
        Ok(())
    }

    /// Number of buffers the cache budget affords, rounded up.
    pub fn buffers_count(&self) -> usize {
        self.cache_size.div_ceil(self.block_size)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn max_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.max_retry_backoff_ms.max(self.retry_backoff_ms))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn validate_block_fits_cache(config: &VirtualFileConfig) -> Result<(), ValidationError> {
    if config.block_size > config.cache_size {
        let mut error = ValidationError::new("block_size");
        error.message = Some("block size cannot exceed cache size".into());
        return Err(error);
    }
    Ok(())
}

const fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

const fn default_retry_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_MS
}

const fn default_max_retry_backoff_ms() -> u64 {
    DEFAULT_MAX_RETRY_BACKOFF_MS
}

const fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}
