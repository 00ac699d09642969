//! Vertex layouts: vertex-array objects sourcing attributes from buffers.

use std::cell::RefCell;
use std::rc::Rc;

use kiln_core::error::{RenderError, Result};
use kiln_test_utils::{VertexArrayId, VertexAttribute};

use crate::buffer::Buffer;
use crate::context::GraphicsContext;
use crate::device::{Device, GpuHandle, ReleaseQueue};
use crate::registry::{ObjectId, RenderObject};

/// An attribute together with the buffer it reads from.
#[derive(Clone)]
pub struct VertexBinding {
    pub attribute: VertexAttribute,
    pub buffer: Rc<RefCell<Buffer>>,
    /// Added to the attribute offset; used for sub-allocated buffers.
    pub base_offset: u64,
}

pub struct VertexLayout {
    id: Option<ObjectId>,
    handle: Option<VertexArrayId>,
    bindings: Vec<VertexBinding>,
    /// Attributes must be (re-)issued before the next bind.
    dirty: bool,
    release: ReleaseQueue,
}

impl VertexLayout {
    pub fn new(context: &mut GraphicsContext) -> Result<Rc<RefCell<VertexLayout>>> {
        let device = context.device_mut();
        let handle = device
            .create_vertex_array()
            .ok_or_else(|| RenderError::OutOfMemory("vertex array".to_string()))?;

        let layout = Rc::new(RefCell::new(VertexLayout {
            id: None,
            handle: Some(handle),
            bindings: Vec::new(),
            dirty: false,
            release: device.release_queue(),
        }));
        match context.register(&layout) {
            Ok(id) => layout.borrow_mut().id = Some(id),
            Err(err) => {
                layout.borrow_mut().free(context.device_mut());
                return Err(err);
            }
        }
        Ok(layout)
    }

    pub fn id(&self) -> Option<ObjectId> {
        self.id
    }

    pub fn handle(&self) -> Option<VertexArrayId> {
        self.handle
    }

    pub fn bindings(&self) -> &[VertexBinding] {
        &self.bindings
    }

    pub fn add_attribute(&mut self, attribute: VertexAttribute, buffer: Rc<RefCell<Buffer>>, base_offset: u64) {
        self.bindings.retain(|b| b.attribute.location != attribute.location);
        self.bindings.push(VertexBinding {
            attribute,
            buffer,
            base_offset,
        });
        self.dirty = true;
    }

    /// Binds the vertex array, issuing pending attribute changes first.
    pub fn bind(&mut self, device: &mut Device) -> Result<()> {
        let handle = self.handle.ok_or_else(|| {
            RenderError::InvalidOperation("vertex layout has no live driver handle".to_string())
        })?;

        if self.dirty {
            for binding in &self.bindings {
                let buffer = binding.buffer.borrow().handle().ok_or_else(|| {
                    RenderError::InvalidOperation(format!(
                        "attribute {} sources a buffer without a driver handle",
                        binding.attribute.location
                    ))
                })?;
                let attribute = VertexAttribute {
                    offset: binding.attribute.offset + binding.base_offset,
                    ..binding.attribute
                };
                device.set_vertex_attribute(handle, &attribute, buffer);
            }
            self.dirty = false;
        }
        device.bind_vertex_array(Some(handle));
        Ok(())
    }

    pub fn unbind(&self, device: &mut Device) {
        device.bind_vertex_array(None);
    }

    pub fn destroy(&mut self, context: &mut GraphicsContext) {
        context.unregister(self.id);
        self.free(context.device_mut());
    }
}

impl RenderObject for VertexLayout {
    fn label(&self) -> &'static str {
        "vertex layout"
    }

    fn free(&mut self, device: &mut Device) {
        self.id = None;
        if let Some(handle) = self.handle.take() {
            device.delete_vertex_array(handle);
        }
    }

    fn save(&mut self, device: &mut Device) {
        self.free(device);
        self.dirty = true;
    }

    fn restore(&mut self, id: ObjectId, device: &mut Device) -> Result<()> {
        let handle = device
            .create_vertex_array()
            .ok_or_else(|| RenderError::OutOfMemory("restoring vertex array".to_string()))?;
        self.handle = Some(handle);
        self.id = Some(id);
        self.dirty = true;
        self.release = device.release_queue();
        Ok(())
    }
}

impl Drop for VertexLayout {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.release.push(GpuHandle::VertexArray(handle));
        }
    }
}
