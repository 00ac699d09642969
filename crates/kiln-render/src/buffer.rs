//! Registered GPU buffers.
//!
//! A [`Buffer`] survives context loss: saving reads its contents back into
//! CPU memory, restoring recreates the driver buffer and uploads them again.

use std::cell::RefCell;
use std::rc::Rc;

use kiln_core::error::{RenderError, Result};
use kiln_test_utils::{BufferId, BufferUsages, MapMode};

use crate::context::GraphicsContext;
use crate::device::{Device, GpuHandle, ReleaseQueue};
use crate::registry::{ObjectId, RenderObject};

pub struct Buffer {
    id: Option<ObjectId>,
    handle: Option<BufferId>,
    size: u64,
    usage: BufferUsages,
    /// Contents kept across a save/restore cycle.
    shadow: Option<Vec<u8>>,
    mapped: bool,
    release: ReleaseQueue,
}

impl Buffer {
    /// Creates a buffer of `size` bytes in `context`, optionally initialized
    /// from `data`.
    pub fn new(
        context: &mut GraphicsContext,
        size: u64,
        usage: BufferUsages,
        data: Option<&[u8]>,
    ) -> Result<Rc<RefCell<Buffer>>> {
        if data.is_some_and(|data| data.len() as u64 > size) {
            return Err(RenderError::InvalidOperation(format!(
                "initial data does not fit a {size} byte buffer"
            )));
        }

        let device = context.device_mut();
        let handle = device
            .create_buffer(size, usage, data)
            .ok_or_else(|| RenderError::OutOfMemory(format!("buffer of {size} bytes")))?;

        let buffer = Rc::new(RefCell::new(Buffer {
            id: None,
            handle: Some(handle),
            size,
            usage,
            shadow: None,
            mapped: false,
            release: device.release_queue(),
        }));

        match context.register(&buffer) {
            Ok(id) => buffer.borrow_mut().id = Some(id),
            Err(err) => {
                buffer.borrow_mut().free(context.device_mut());
                return Err(err);
            }
        }
        tracing::debug!("Created buffer {:?} ({} bytes)", handle, size);
        Ok(buffer)
    }

    pub fn id(&self) -> Option<ObjectId> {
        self.id
    }

    /// Driver handle; `None` while saved or after destruction.
    pub fn handle(&self) -> Option<BufferId> {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsages {
        self.usage
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    pub fn write(&mut self, device: &mut Device, offset: u64, data: &[u8]) -> Result<()> {
        let handle = self.live_handle()?;
        self.check_range(offset, data.len() as u64)?;
        device.write_buffer(handle, offset, data);
        Ok(())
    }

    pub fn read(&mut self, device: &mut Device, offset: u64, out: &mut [u8]) -> Result<()> {
        let handle = self.live_handle()?;
        self.check_range(offset, out.len() as u64)?;
        if !device.read_buffer(handle, offset, out) {
            return Err(RenderError::InvalidOperation(format!(
                "reading {} bytes from buffer {:?} failed",
                out.len(),
                handle
            )));
        }
        Ok(())
    }

    /// Copies `size` bytes from `src` into this buffer.
    pub fn copy_from(
        &mut self,
        device: &mut Device,
        src: &Buffer,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        let dst = self.live_handle()?;
        let src_handle = src.live_handle()?;
        src.check_range(src_offset, size)?;
        self.check_range(dst_offset, size)?;
        device.copy_buffer(src_handle, src_offset, dst, dst_offset, size);
        Ok(())
    }

    /// Maps a byte range for CPU access. Must be paired with [`Buffer::unmap`].
    pub fn map<'d>(
        &mut self,
        device: &'d mut Device,
        offset: u64,
        size: u64,
        mode: MapMode,
    ) -> Result<&'d mut [u8]> {
        let handle = self.live_handle()?;
        if self.mapped {
            return Err(RenderError::InvalidOperation(format!(
                "buffer {handle:?} is already mapped"
            )));
        }
        self.check_range(offset, size)?;
        let bytes = device.map_buffer(handle, offset, size, mode).ok_or_else(|| {
            RenderError::OutOfMemory(format!("mapping {size} bytes of buffer {handle:?}"))
        })?;
        self.mapped = true;
        Ok(bytes)
    }

    /// Unmaps the buffer. Corruption reported by the driver is surfaced as
    /// `MemoryCorruption`; the buffer is unmapped either way.
    pub fn unmap(&mut self, device: &mut Device) -> Result<()> {
        let handle = self.live_handle()?;
        if !self.mapped {
            return Err(RenderError::InvalidOperation(format!(
                "buffer {handle:?} is not mapped"
            )));
        }
        self.mapped = false;
        if !device.unmap_buffer(handle) {
            return Err(RenderError::MemoryCorruption(format!(
                "contents of buffer {handle:?} were corrupted while mapped"
            )));
        }
        Ok(())
    }

    /// Unregisters the buffer and deletes its driver handle.
    pub fn destroy(&mut self, context: &mut GraphicsContext) {
        context.unregister(self.id);
        self.free(context.device_mut());
    }

    fn live_handle(&self) -> Result<BufferId> {
        self.handle.ok_or_else(|| {
            RenderError::InvalidOperation("buffer has no live driver handle".to_string())
        })
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(RenderError::InvalidOperation(format!(
                "range {offset}+{len} exceeds buffer size {}",
                self.size
            ))),
        }
    }
}

impl RenderObject for Buffer {
    fn label(&self) -> &'static str {
        "buffer"
    }

    fn free(&mut self, device: &mut Device) {
        self.id = None;
        self.shadow = None;
        if let Some(handle) = self.handle.take() {
            if self.mapped {
                device.unmap_buffer(handle);
                self.mapped = false;
            }
            device.delete_buffer(handle);
        }
    }

    fn save(&mut self, device: &mut Device) {
        self.id = None;
        let Some(handle) = self.handle.take() else {
            return;
        };
        if self.mapped {
            device.unmap_buffer(handle);
            self.mapped = false;
        }

        let mut contents = vec![0u8; self.size as usize];
        if device.read_buffer(handle, 0, &mut contents) {
            self.shadow = Some(contents);
        } else {
            tracing::warn!("Could not read back buffer {:?}; contents are lost", handle);
            self.shadow = None;
        }
        device.delete_buffer(handle);
    }

    fn restore(&mut self, id: ObjectId, device: &mut Device) -> Result<()> {
        let contents = self.shadow.take();
        let Some(handle) = device.create_buffer(self.size, self.usage, contents.as_deref()) else {
            self.shadow = contents;
            return Err(RenderError::OutOfMemory(format!(
                "restoring buffer of {} bytes",
                self.size
            )));
        };
        self.handle = Some(handle);
        self.id = Some(id);
        self.release = device.release_queue();
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.release.push(GpuHandle::Buffer(handle));
        }
    }
}
