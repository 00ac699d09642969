//! Engine-wide configuration.

use crate::error::DEFAULT_ERROR_QUEUE_DEPTH;
use crate::logging::LoggingConfig;

/// Default byte size of a physical shared buffer.
pub const DEFAULT_SHARED_BUFFER_SIZE: u64 = 1 << 20;

/// Configuration for a Kiln engine instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of queued errors before the oldest is evicted.
    pub error_queue_depth: usize,
    /// Minimum byte size of newly created physical shared buffers.
    pub shared_buffer_size: u64,
    /// Significant key bits for draw batches; 0 sorts on the full key.
    pub bucket_bits: u32,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn with_error_queue_depth(mut self, depth: usize) -> Self {
        self.error_queue_depth = depth;
        self
    }

    pub fn with_shared_buffer_size(mut self, size: u64) -> Self {
        self.shared_buffer_size = size;
        self
    }

    pub fn with_bucket_bits(mut self, bits: u32) -> Self {
        self.bucket_bits = bits;
        self
    }

    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            error_queue_depth: DEFAULT_ERROR_QUEUE_DEPTH,
            shared_buffer_size: DEFAULT_SHARED_BUFFER_SIZE,
            bucket_bits: 0,
            logging: LoggingConfig::default(),
        }
    }
}
