//! Per-context driver wrapper with deferred handle release.

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use kiln_test_utils::{BufferId, GraphicsDriver, PipelineId, ProgramId, VertexArrayId};

/// A driver object whose owner went away without destroying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuHandle {
    Buffer(BufferId),
    Program(ProgramId),
    Pipeline(PipelineId),
    VertexArray(VertexArrayId),
}

/// Handles queued for deletion by objects dropped outside a context call.
///
/// Render objects keep a clone of the queue belonging to the context their
/// handles live in; `Drop` can then hand the handle back without needing
/// the driver.
#[derive(Debug, Clone, Default)]
pub struct ReleaseQueue(Rc<RefCell<Vec<GpuHandle>>>);

impl ReleaseQueue {
    pub fn push(&self, handle: GpuHandle) {
        self.0.borrow_mut().push(handle);
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    fn take(&self) -> Vec<GpuHandle> {
        std::mem::take(&mut *self.0.borrow_mut())
    }
}

/// The driver of one graphics context.
///
/// Dereferences to [`GraphicsDriver`], so driver calls go straight through.
pub struct Device {
    driver: Box<dyn GraphicsDriver>,
    release: ReleaseQueue,
}

impl Device {
    pub fn new(driver: Box<dyn GraphicsDriver>) -> Self {
        Self {
            driver,
            release: ReleaseQueue::default(),
        }
    }

    /// Queue that dropped objects of this context push their handles to.
    pub fn release_queue(&self) -> ReleaseQueue {
        self.release.clone()
    }

    /// Deletes every handle released by dropped objects; returns how many.
    pub fn collect_garbage(&mut self) -> usize {
        let pending = self.release.take();
        for handle in &pending {
            match *handle {
                GpuHandle::Buffer(buffer) => self.driver.delete_buffer(buffer),
                GpuHandle::Program(program) => self.driver.delete_program(program),
                GpuHandle::Pipeline(pipeline) => self.driver.delete_pipeline(pipeline),
                GpuHandle::VertexArray(array) => self.driver.delete_vertex_array(array),
            }
        }
        if !pending.is_empty() {
            tracing::debug!("Released {} orphaned GPU handles", pending.len());
        }
        pending.len()
    }
}

impl Deref for Device {
    type Target = dyn GraphicsDriver;

    fn deref(&self) -> &Self::Target {
        &*self.driver
    }
}

impl DerefMut for Device {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.driver
    }
}
