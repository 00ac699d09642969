//! The engine session.
//!
//! [`Engine`] owns everything that would otherwise be global: the window
//! system and its contexts, the shared-buffer pool, the pipe process list and
//! the error queue. Every fallible operation returns its error and also
//! records it into [`Engine::errors`].

use std::cell::RefCell;
use std::rc::Rc;

use kiln_core::config::Config;
use kiln_core::error::{ErrorQueue, RenderError, Result};
use kiln_core::geometry::{Size, Viewport};
use kiln_core::logging;
use kiln_test_utils::{BufferUsages, RenderState, WindowDescriptor, WindowId, WindowSystem};

use crate::batch::{DrawBatch, SubmitStats};
use crate::buffer::Buffer;
use crate::context::{ContextManager, GraphicsContext};
use crate::layout::VertexLayout;
use crate::pipe::{PipeProcesses, ProcessId};
use crate::program_map::ProgramMap;
use crate::property::PropertyMap;
use crate::shared_buffer::{SharedBufferHandle, SharedBufferPool};

pub struct Engine {
    contexts: ContextManager,
    shared: SharedBufferPool,
    processes: PipeProcesses,
    errors: ErrorQueue,
    config: Config,
}

impl Engine {
    /// Creates an engine, installing the configured logger if no logger was
    /// installed yet.
    pub fn new(windows: Box<dyn WindowSystem>, config: Config) -> Self {
        logging::init_with(config.logging.clone());
        let mut shared = SharedBufferPool::default();
        shared.set_default_size(config.shared_buffer_size);
        tracing::debug!("Engine created with {:?}", config);
        Self {
            contexts: ContextManager::new(windows),
            shared,
            processes: PipeProcesses::new(),
            errors: ErrorQueue::new(config.error_queue_depth),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn errors(&self) -> &ErrorQueue {
        &self.errors
    }

    pub fn errors_mut(&mut self) -> &mut ErrorQueue {
        &mut self.errors
    }

    pub fn contexts(&self) -> &ContextManager {
        &self.contexts
    }

    pub fn shared_buffers(&self) -> &SharedBufferPool {
        &self.shared
    }

    pub fn processes(&self) -> &PipeProcesses {
        &self.processes
    }

    pub fn current_context_mut(&mut self) -> Result<&mut GraphicsContext> {
        match self.contexts.current_mut() {
            Ok(context) => Ok(context),
            Err(err) => Err(self.errors.record(err)),
        }
    }

    // Windows and contexts

    pub fn create_window(&mut self, descriptor: &WindowDescriptor) -> Result<WindowId> {
        let created = self.contexts.create_window(descriptor);
        self.record(created)
    }

    pub fn make_current(&mut self, window: Option<WindowId>) -> Result<()> {
        let switched = self.contexts.make_current(window);
        self.record(switched)
    }

    pub fn resize_window(&mut self, window: WindowId, size: Size<u32>) -> Result<()> {
        let resized = self.contexts.resize_window(window, size);
        self.record(resized)
    }

    /// Destroys a window and its context.
    ///
    /// Objects still registered in the context are moved into the context of
    /// another window: all of them are saved, the other context is made
    /// current, then all of them are restored. With no other window left they
    /// are freed instead. Pipe processes drawing into the destroyed window
    /// become offscreen.
    pub fn destroy_window(&mut self, window: WindowId) -> Result<()> {
        let destroyed = self.destroy_window_inner(window);
        self.record(destroyed)
    }

    fn destroy_window_inner(&mut self, window: WindowId) -> Result<()> {
        let previous = self.contexts.current_window();
        let heir = self.contexts.windows().find(|&w| w != window);

        self.contexts.make_current(Some(window))?;
        let Some(heir) = heir else {
            let context = self.contexts.current_mut()?;
            let old = context.id();
            let freed = context.registry().len();
            if let Err(err) = context.free_all() {
                self.contexts.make_current(previous)?;
                return Err(err);
            }
            self.contexts.take_context(window);
            self.contexts.destroy_window(window);
            self.shared.forget(old);
            self.processes.orphan(old, window);
            tracing::info!(
                "Destroyed last window; freed {} objects of container {}",
                freed,
                old
            );
            return Ok(());
        };

        let saved = match self.contexts.current_mut()?.save_all() {
            Ok(saved) => saved,
            Err(err) => {
                self.contexts.make_current(previous)?;
                return Err(err);
            }
        };
        let Some(context) = self.contexts.take_context(window) else {
            return Err(RenderError::InvalidOperation(format!(
                "window {} has no context",
                window.raw()
            )));
        };
        let old = context.id();
        drop(context);
        self.contexts.destroy_window(window);

        self.contexts.make_current(Some(heir))?;
        let moved = saved.len();
        let context = self.contexts.current_mut()?;
        let new = context.id();
        let restored = context.restore_all(saved);

        self.shared.migrate(old, new);
        self.processes
            .migrate(&mut self.contexts, &mut self.shared, old, new, window);
        tracing::info!(
            "Migrated {} objects from container {} to {}",
            moved,
            old,
            new
        );

        if previous.is_some_and(|p| p != window) {
            self.contexts.make_current(previous)?;
        }
        restored
    }

    // Objects

    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: BufferUsages,
        data: Option<&[u8]>,
    ) -> Result<Rc<RefCell<Buffer>>> {
        let created = self
            .contexts
            .current_mut()
            .and_then(|context| Buffer::new(context, size, usage, data));
        self.record(created)
    }

    pub fn create_program_map(&mut self) -> Result<Rc<RefCell<ProgramMap>>> {
        let created = self.contexts.current_mut().and_then(ProgramMap::new);
        self.record(created)
    }

    pub fn create_vertex_layout(&mut self) -> Result<Rc<RefCell<VertexLayout>>> {
        let created = self.contexts.current_mut().and_then(VertexLayout::new);
        self.record(created)
    }

    /// A draw batch sorting on the configured key width.
    pub fn create_draw_batch(&self) -> DrawBatch {
        DrawBatch::new(self.config.bucket_bits)
    }

    /// Submits `batch` to the current context.
    pub fn submit(&mut self, batch: &mut DrawBatch) -> Result<SubmitStats> {
        let submitted = self
            .contexts
            .current_mut()
            .and_then(|context| batch.submit(context.device_mut()));
        self.record(submitted)
    }

    // Shared buffers

    pub fn shared_init(
        &mut self,
        size: u64,
        data: Option<&[u8]>,
        align: u64,
    ) -> Result<SharedBufferHandle> {
        let shared = &mut self.shared;
        let allocated = self
            .contexts
            .current_mut()
            .and_then(|context| shared.init(context, size, data, align));
        self.record(allocated)
    }

    pub fn shared_clear(&mut self, handle: SharedBufferHandle, keep: bool) -> Result<()> {
        let cleared = self.shared.clear(&mut self.contexts, handle, keep);
        self.record(cleared)
    }

    /// Destroys empty physical shared buffers kept by `shared_clear`.
    pub fn shared_cleanup(&mut self) -> usize {
        self.shared.cleanup(&mut self.contexts)
    }

    pub fn set_shared_default_size(&mut self, hint: u64) {
        self.shared.set_default_size(hint);
    }

    // Pipe processes

    pub fn create_process(&mut self, target: Option<WindowId>, swap: bool) -> Result<ProcessId> {
        let created = self
            .processes
            .create(&mut self.contexts, &mut self.shared, target, swap);
        self.record(created)
    }

    pub fn destroy_process(&mut self, id: ProcessId) -> Result<()> {
        let destroyed = self
            .processes
            .destroy(&mut self.contexts, &mut self.shared, id);
        self.record(destroyed)
    }

    pub fn set_process_properties(
        &mut self,
        id: ProcessId,
        properties: Rc<RefCell<PropertyMap>>,
        copy: usize,
    ) -> Result<()> {
        let set = self.processes.set_properties(id, properties, copy);
        self.record(set)
    }

    pub fn set_process_viewport(&mut self, id: ProcessId, viewport: Option<Viewport>) -> Result<()> {
        let set = self.processes.set_viewport(id, viewport);
        self.record(set)
    }

    /// Moves every process of the current context into `new_target`'s
    /// context, which becomes current.
    pub fn retarget(&mut self, new_target: WindowId) -> Result<usize> {
        let moved = self
            .processes
            .retarget(&mut self.contexts, &mut self.shared, new_target);
        self.record(moved)
    }

    pub fn execute(&mut self, id: ProcessId, state: RenderState) -> Result<()> {
        let executed = self.processes.execute(&mut self.contexts, id, state);
        self.record(executed)
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        result.map_err(|err| self.errors.record(err))
    }
}
