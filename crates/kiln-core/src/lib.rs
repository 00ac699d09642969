//! Kiln Core
//!
//! Shared building blocks for the Kiln rendering core: generational storage,
//! the error taxonomy, geometry, configuration, logging and profiling.

pub mod alloc;
pub mod config;
pub mod error;
pub mod geometry;
pub mod logging;
pub mod profiling;

pub use error::{ErrorCode, ErrorEntry, ErrorQueue, RenderError, Result};
