//! Kiln render core.
//!
//! GPU-backed objects (buffers, programs, program maps, vertex layouts) live
//! in the registry of the context that created them, so a context can be torn
//! down and its objects rebuilt in another one. On top of that sit the
//! shared-buffer segment allocator, radix-sorted draw batches and pipe
//! processes for full-screen passes.
//!
//! Everything talks to the platform through the collaborator traits of
//! `kiln-test-utils`; an [`Engine`] ties one window system to its contexts.
//!
//! # Example
//!
//! ```rust
//! # #[cfg(feature = "mock")]
//! # {
//! use kiln_core::config::Config;
//! use kiln_render::Engine;
//! use kiln_test_utils::{BufferUsages, MockWindowSystem, WindowDescriptor};
//!
//! let windows = MockWindowSystem::new();
//! let mut engine = Engine::new(Box::new(windows.clone()), Config::default());
//! let first = engine.create_window(&WindowDescriptor::default()).unwrap();
//! let second = engine.create_window(&WindowDescriptor::default()).unwrap();
//!
//! let buffer = engine.create_buffer(4, BufferUsages::VERTEX, Some(&[1, 2, 3, 4])).unwrap();
//!
//! // The buffer follows its data into the surviving context.
//! engine.destroy_window(first).unwrap();
//! let handle = buffer.borrow().handle().unwrap();
//! assert_eq!(windows.driver(second).unwrap().buffer_contents(handle), Some(vec![1, 2, 3, 4]));
//! # }
//! ```

pub mod batch;
pub mod bucket;
pub mod buffer;
pub mod context;
pub mod device;
pub mod engine;
pub mod layout;
pub mod pipe;
pub mod program;
pub mod program_map;
pub mod property;
pub mod registry;
pub mod shared_buffer;

pub use batch::{DrawBatch, DrawUnit, SubmitStats};
pub use bucket::{Bucket, UnitId};
pub use buffer::Buffer;
pub use context::{ContextManager, GraphicsContext};
pub use device::{Device, GpuHandle, ReleaseQueue};
pub use engine::Engine;
pub use layout::{VertexBinding, VertexLayout};
pub use pipe::{PipeProcess, PipeProcesses, ProcessId};
pub use program::Program;
pub use program_map::{ProgramMap, StageSlot};
pub use property::PropertyMap;
pub use registry::{ContainerId, DetachedObject, ObjectId, Registry, RenderObject};
pub use shared_buffer::{SHARED_BUFFER_USAGE, SharedBufferHandle, SharedBufferPool};
