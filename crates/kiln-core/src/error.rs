//! Error taxonomy and the bounded error queue.
//!
//! Every failure in the rendering core is local: the failing call returns a
//! [`RenderError`] and the owning engine records it into an [`ErrorQueue`] so
//! it can be inspected later without unwinding.

use std::collections::VecDeque;
use std::fmt;

/// Default maximum number of queued errors.
pub const DEFAULT_ERROR_QUEUE_DEPTH: usize = 32;

/// Broad category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// A control structure or GPU resource could not be allocated.
    OutOfMemory,
    /// The active context or driver lacks a requested capability.
    IncompatibleContext,
    /// A bounded counter would wrap.
    Overflow,
    /// The driver reported corrupted buffer contents on unmap.
    MemoryCorruption,
    /// The operation is not valid in the object's current state.
    InvalidOperation,
    /// No graphics context is current.
    NoCurrentContext,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::OutOfMemory => "out of memory",
            ErrorCode::IncompatibleContext => "incompatible context",
            ErrorCode::Overflow => "overflow",
            ErrorCode::MemoryCorruption => "memory corruption",
            ErrorCode::InvalidOperation => "invalid operation",
            ErrorCode::NoCurrentContext => "no current context",
        };
        f.write_str(name)
    }
}

/// Errors produced by the rendering core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// Allocation failed; the object was never created.
    OutOfMemory(String),
    /// A capability (buffer usage, shader stage, ...) is unsupported.
    IncompatibleContext(String),
    /// A counter would overflow; the operation was refused.
    Overflow(String),
    /// Buffer contents were corrupted while mapped.
    MemoryCorruption(String),
    /// The object is in a state that forbids the operation.
    InvalidOperation(String),
    /// An operation needed a current context and none was set.
    NoCurrentContext,
}

impl RenderError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RenderError::OutOfMemory(_) => ErrorCode::OutOfMemory,
            RenderError::IncompatibleContext(_) => ErrorCode::IncompatibleContext,
            RenderError::Overflow(_) => ErrorCode::Overflow,
            RenderError::MemoryCorruption(_) => ErrorCode::MemoryCorruption,
            RenderError::InvalidOperation(_) => ErrorCode::InvalidOperation,
            RenderError::NoCurrentContext => ErrorCode::NoCurrentContext,
        }
    }

    pub fn description(&self) -> &str {
        match self {
            RenderError::OutOfMemory(msg)
            | RenderError::IncompatibleContext(msg)
            | RenderError::Overflow(msg)
            | RenderError::MemoryCorruption(msg)
            | RenderError::InvalidOperation(msg) => msg,
            RenderError::NoCurrentContext => "no graphics context is current",
        }
    }
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.description())
    }
}

impl std::error::Error for RenderError {}

pub type Result<T, E = RenderError> = std::result::Result<T, E>;

/// A recorded error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEntry {
    pub code: ErrorCode,
    pub description: String,
}

impl From<&RenderError> for ErrorEntry {
    fn from(err: &RenderError) -> Self {
        Self {
            code: err.code(),
            description: err.description().to_string(),
        }
    }
}

/// Bounded FIFO of recorded errors.
///
/// When the queue is full the oldest entry is evicted to make room, so the
/// most recent failures are always available.
#[derive(Debug)]
pub struct ErrorQueue {
    entries: VecDeque<ErrorEntry>,
    max_depth: usize,
    dropped: u64,
}

impl ErrorQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_depth.min(DEFAULT_ERROR_QUEUE_DEPTH)),
            max_depth,
            dropped: 0,
        }
    }

    /// Queues an error. A depth of zero discards everything.
    pub fn push(&mut self, code: ErrorCode, description: impl Into<String>) {
        let description = description.into();
        tracing::warn!("{}: {}", code, description);

        if self.max_depth == 0 {
            self.dropped += 1;
            return;
        }
        if self.entries.len() >= self.max_depth {
            self.entries.pop_front();
            self.dropped += 1;
        }
        self.entries.push_back(ErrorEntry { code, description });
    }

    /// Queues `err` and passes it through, for use in `map_err`/`inspect_err` chains.
    pub fn record(&mut self, err: RenderError) -> RenderError {
        self.push(err.code(), err.description());
        err
    }

    /// Oldest queued error.
    pub fn peek(&self) -> Option<&ErrorEntry> {
        self.entries.front()
    }

    pub fn pop(&mut self) -> Option<ErrorEntry> {
        self.entries.pop_front()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Changes the depth, evicting the oldest entries that no longer fit.
    pub fn set_max_depth(&mut self, max_depth: usize) {
        self.max_depth = max_depth;
        while self.entries.len() > max_depth {
            self.entries.pop_front();
            self.dropped += 1;
        }
    }

    /// Number of entries evicted or discarded since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = &ErrorEntry> {
        self.entries.iter()
    }
}

impl Default for ErrorQueue {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_QUEUE_DEPTH)
    }
}
