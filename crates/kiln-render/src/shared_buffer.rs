//! Segment sub-allocation of large physical buffers.
//!
//! Many small logical buffers (quad vertices, small uniform blocks) are packed
//! into a few physical [`Buffer`]s. Each physical buffer keeps a list of
//! occupied segments sorted by offset; a new request takes the first aligned
//! gap found scanning back to front, since free space is most likely at the
//! end of the most recently created buffer.
//!
//! ```ignore
//! let handle = pool.init(context, 64, Some(&bytes), 16)?;
//! assert_eq!(handle.offset() % 16, 0);
//!
//! // Segment gone; the physical buffer goes too once it is empty.
//! pool.clear(&mut contexts, handle, false)?;
//! ```

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use kiln_core::config::DEFAULT_SHARED_BUFFER_SIZE;
use kiln_core::error::{RenderError, Result};
use kiln_core::profiling::profile_function;
use kiln_test_utils::BufferUsages;

use crate::buffer::Buffer;
use crate::context::{ContextManager, GraphicsContext};
use crate::registry::ContainerId;

/// Usage of every physical shared buffer.
pub const SHARED_BUFFER_USAGE: BufferUsages = BufferUsages::VERTEX
    .union(BufferUsages::INDEX)
    .union(BufferUsages::UNIFORM)
    .union(BufferUsages::COPY_SRC)
    .union(BufferUsages::COPY_DST);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    offset: u64,
    size: u64,
}

impl Segment {
    fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Rounds `offset` up to a multiple of `align` (at least 1).
fn align_up(offset: u64, align: u64) -> Option<u64> {
    offset.checked_add((align - offset % align) % align)
}

struct PhysicalBuffer {
    container: ContainerId,
    buffer: Rc<RefCell<Buffer>>,
    size: u64,
    segments: Vec<Segment>,
}

impl PhysicalBuffer {
    /// Returns `(insert index, offset)` of the first gap that fits, checking
    /// the space after the last segment, then between segments from the back,
    /// then before the first segment.
    fn find_gap(&self, size: u64, align: u64) -> Option<(usize, u64)> {
        let fits = |start: u64, end: u64| -> Option<u64> {
            let offset = align_up(start, align)?;
            (offset.checked_add(size)? <= end).then_some(offset)
        };

        let tail = self.segments.last().map_or(0, Segment::end);
        if let Some(offset) = fits(tail, self.size) {
            return Some((self.segments.len(), offset));
        }
        for i in (1..self.segments.len()).rev() {
            if let Some(offset) = fits(self.segments[i - 1].end(), self.segments[i].offset) {
                return Some((i, offset));
            }
        }
        let first = self.segments.first()?;
        fits(0, first.offset).map(|offset| (0, offset))
    }
}

/// A logical buffer: a segment of a physical shared buffer.
pub struct SharedBufferHandle {
    buffer: Rc<RefCell<Buffer>>,
    offset: u64,
    size: u64,
}

impl SharedBufferHandle {
    /// The physical buffer holding this segment.
    pub fn buffer(&self) -> &Rc<RefCell<Buffer>> {
        &self.buffer
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether both handles live in the same physical buffer.
    pub fn shares_buffer_with(&self, other: &SharedBufferHandle) -> bool {
        Rc::ptr_eq(&self.buffer, &other.buffer)
    }
}

impl fmt::Debug for SharedBufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBufferHandle")
            .field("buffer", &self.buffer.borrow().handle())
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

/// All physical shared buffers of an engine, across contexts.
pub struct SharedBufferPool {
    buffers: Vec<PhysicalBuffer>,
    default_size: u64,
}

impl SharedBufferPool {
    pub fn new(default_size: u64) -> Self {
        Self {
            buffers: Vec::new(),
            default_size: default_size.max(1),
        }
    }

    pub fn default_size(&self) -> u64 {
        self.default_size
    }

    /// Sets the minimum size of new physical buffers, rounded up to the next
    /// power of two. A zero hint is ignored.
    pub fn set_default_size(&mut self, hint: u64) {
        if hint == 0 {
            return;
        }
        self.default_size = hint.checked_next_power_of_two().unwrap_or(hint);
    }

    /// Allocates `size` bytes at a multiple of `align` (0 is treated as 1) in
    /// the physical buffers of `context`, creating a new physical buffer when
    /// none has room. `data` is uploaded into the segment if given.
    pub fn init(
        &mut self,
        context: &mut GraphicsContext,
        size: u64,
        data: Option<&[u8]>,
        align: u64,
    ) -> Result<SharedBufferHandle> {
        profile_function!();
        let align = align.max(1);
        if size == 0 {
            return Err(RenderError::InvalidOperation(
                "shared buffer segments must not be empty".to_string(),
            ));
        }
        if data.is_some_and(|data| data.len() as u64 > size) {
            return Err(RenderError::InvalidOperation(format!(
                "initial data does not fit a {size} byte segment"
            )));
        }

        let container = context.id();
        let found = self
            .buffers
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, physical)| physical.container == container)
            .find_map(|(index, physical)| {
                physical
                    .find_gap(size, align)
                    .map(|(slot, offset)| (index, slot, offset))
            });

        let (index, slot, offset, created) = match found {
            Some((index, slot, offset)) => (index, slot, offset, false),
            None => {
                self.buffers.try_reserve(1).map_err(|_| {
                    RenderError::OutOfMemory("shared buffer list cannot grow".to_string())
                })?;
                let physical_size = size.max(self.default_size);
                let buffer = Buffer::new(context, physical_size, SHARED_BUFFER_USAGE, None)?;
                tracing::debug!(
                    "New shared buffer of {} bytes in container {}",
                    physical_size,
                    container
                );
                self.buffers.push(PhysicalBuffer {
                    container,
                    buffer,
                    size: physical_size,
                    segments: Vec::new(),
                });
                (self.buffers.len() - 1, 0, 0, true)
            }
        };

        let physical = &mut self.buffers[index];
        if let Some(data) = data {
            let written = physical
                .buffer
                .borrow_mut()
                .write(context.device_mut(), offset, data);
            if let Err(err) = written {
                if created {
                    let discarded = self.buffers.swap_remove(index);
                    discarded.buffer.borrow_mut().destroy(context);
                }
                return Err(err);
            }
        }
        physical.segments.insert(slot, Segment { offset, size });

        Ok(SharedBufferHandle {
            buffer: physical.buffer.clone(),
            offset,
            size,
        })
    }

    /// Releases the segment behind `handle`. When its physical buffer becomes
    /// empty it is destroyed, unless `keep` asks to hold on to it.
    pub fn clear(
        &mut self,
        contexts: &mut ContextManager,
        handle: SharedBufferHandle,
        keep: bool,
    ) -> Result<()> {
        let index = self
            .buffers
            .iter()
            .position(|physical| Rc::ptr_eq(&physical.buffer, &handle.buffer))
            .ok_or_else(|| {
                RenderError::InvalidOperation("handle does not belong to this pool".to_string())
            })?;

        let physical = &mut self.buffers[index];
        let segment = physical
            .segments
            .binary_search_by_key(&handle.offset, |s| s.offset)
            .map_err(|_| {
                RenderError::InvalidOperation(format!(
                    "no segment at offset {} of the shared buffer",
                    handle.offset
                ))
            })?;
        physical.segments.remove(segment);

        if physical.segments.is_empty() && !keep {
            drop(handle);
            self.destroy_physical(contexts, index);
        }
        Ok(())
    }

    /// Destroys every empty physical buffer, newest first. Returns how many
    /// were destroyed.
    pub fn cleanup(&mut self, contexts: &mut ContextManager) -> usize {
        let mut destroyed = 0;
        let mut index = self.buffers.len();
        while index > 0 {
            index -= 1;
            if index >= self.buffers.len() {
                continue;
            }
            if self.buffers[index].segments.is_empty() {
                self.destroy_physical(contexts, index);
                destroyed += 1;
            }
        }
        destroyed
    }

    /// Moves the physical buffers of `from` under `to` after their objects
    /// were migrated between contexts.
    pub fn migrate(&mut self, from: ContainerId, to: ContainerId) {
        for physical in self.buffers.iter_mut().filter(|p| p.container == from) {
            physical.container = to;
        }
    }

    /// Drops the bookkeeping of a container whose objects were freed.
    pub fn forget(&mut self, container: ContainerId) {
        self.buffers.retain(|physical| physical.container != container);
    }

    /// Number of physical buffers across all contexts.
    pub fn physical_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn physical_count_in(&self, container: ContainerId) -> usize {
        self.buffers
            .iter()
            .filter(|physical| physical.container == container)
            .count()
    }

    pub fn segment_count(&self) -> usize {
        self.buffers.iter().map(|physical| physical.segments.len()).sum()
    }

    fn destroy_physical(&mut self, contexts: &mut ContextManager, index: usize) {
        let physical = self.buffers.remove(index);
        match contexts.by_container_mut(physical.container) {
            Some(context) => physical.buffer.borrow_mut().destroy(context),
            None => tracing::warn!(
                "Shared buffer outlived container {}; releasing lazily",
                physical.container
            ),
        }
    }
}

impl Default for SharedBufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_SHARED_BUFFER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn physical(size: u64, segments: &[(u64, u64)]) -> PhysicalBuffer {
        let mock = kiln_test_utils::MockDriver::new();
        let mut context = GraphicsContext::new(
            ContainerId::new(1).unwrap(),
            kiln_test_utils::WindowId::new(1),
            crate::device::Device::new(Box::new(mock)),
        );
        PhysicalBuffer {
            container: context.id(),
            buffer: Buffer::new(&mut context, size, SHARED_BUFFER_USAGE, None).unwrap(),
            size,
            segments: segments
                .iter()
                .map(|&(offset, size)| Segment { offset, size })
                .collect(),
        }
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), Some(0));
        assert_eq!(align_up(1, 16), Some(16));
        assert_eq!(align_up(32, 16), Some(32));
        assert_eq!(align_up(7, 1), Some(7));
    }

    #[test]
    fn test_gap_after_last_segment_first() {
        let buffer = physical(256, &[(64, 32)]);
        // Space before the first segment fits too, but the tail wins.
        assert_eq!(buffer.find_gap(16, 16), Some((1, 96)));
    }

    #[test]
    fn test_gap_between_segments() {
        let buffer = physical(128, &[(0, 16), (64, 64)]);
        assert_eq!(buffer.find_gap(32, 32), Some((1, 32)));
    }

    #[test]
    fn test_gap_before_first_segment() {
        let buffer = physical(128, &[(64, 64)]);
        assert_eq!(buffer.find_gap(64, 8), Some((0, 0)));
        assert_eq!(buffer.find_gap(65, 1), None);
    }

    #[test]
    fn test_set_default_size_rounds_up() {
        let mut pool = SharedBufferPool::new(16);
        pool.set_default_size(3000);
        assert_eq!(pool.default_size(), 4096);
        pool.set_default_size(0);
        assert_eq!(pool.default_size(), 4096);
    }
}
