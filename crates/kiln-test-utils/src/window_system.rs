//! Trait abstracting the platform windowing layer.

use kiln_core::error::Result;
use kiln_core::geometry::Size;

use crate::driver::GraphicsDriver;

/// Platform window identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowId(u64);

impl WindowId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct WindowDescriptor {
    pub title: String,
    pub size: Size<u32>,
    pub visible: bool,
}

impl Default for WindowDescriptor {
    fn default() -> Self {
        Self {
            title: "Kiln Window".to_string(),
            size: Size::new(800, 600),
            visible: true,
        }
    }
}

/// Window lifecycle plus the context primitives the core consumes.
///
/// Each window owns exactly one graphics context; creating a window hands
/// back the driver for that context.
pub trait WindowSystem {
    fn create_window(
        &mut self,
        descriptor: &WindowDescriptor,
    ) -> Result<(WindowId, Box<dyn GraphicsDriver>)>;

    fn destroy_window(&mut self, window: WindowId);

    fn resize_window(&mut self, window: WindowId, size: Size<u32>);

    /// Make the window's context current on this thread; `None` releases it.
    fn make_current(&mut self, window: Option<WindowId>);

    fn swap_buffers(&mut self, window: WindowId);

    fn framebuffer_size(&self, window: WindowId) -> Option<Size<u32>>;
}
