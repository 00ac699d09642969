//! Collaborator traits and test utilities for Kiln.
//!
//! The rendering core never talks to a platform or a GPU API directly. It
//! consumes two traits defined here:
//!
//! - [`GraphicsDriver`] - the function table of one graphics context
//! - [`WindowSystem`] - window lifecycle, current-context switching and swaps
//!
//! With the `mock` feature enabled the crate also provides `MockDriver` and
//! `MockWindowSystem`, which record every call for verification.
//!
//! # Example
//!
//! ```rust
//! # #[cfg(feature = "mock")]
//! # {
//! use kiln_test_utils::{GraphicsDriver, MockWindowSystem, WindowDescriptor, WindowSystem};
//!
//! let mut windows = MockWindowSystem::new();
//! let (window, mut driver) = windows.create_window(&WindowDescriptor::default()).unwrap();
//!
//! driver.flush();
//!
//! let driver = windows.driver(window).unwrap();
//! assert_eq!(driver.count_flushes(), 1);
//! # }
//! ```
//!
//! # Object Safety
//!
//! Both traits are object-safe; the core stores `Box<dyn GraphicsDriver>` per
//! context and a single `Box<dyn WindowSystem>` per engine. Mock clones share
//! their recorded state through `Arc<Mutex<_>>`, so a test keeps a handle after
//! handing the boxed original to the engine.

pub mod driver;
pub mod gpu_types;
#[cfg(feature = "mock")]
pub mod mock_driver;
#[cfg(feature = "mock")]
pub mod mock_window;
pub mod window_system;

// Re-export main types at crate root
pub use driver::*;
pub use gpu_types::*;
#[cfg(feature = "mock")]
pub use mock_driver::*;
#[cfg(feature = "mock")]
pub use mock_window::*;
pub use window_system::*;
