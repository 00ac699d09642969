//! Graphics contexts and the window-backed context manager.
//!
//! Each window owns exactly one [`GraphicsContext`]: its driver, the registry
//! of objects created in it and the container id that scopes those objects.

use std::cell::RefCell;
use std::rc::Rc;

use kiln_core::error::{RenderError, Result};
use kiln_core::geometry::Size;
use kiln_test_utils::{DriverFeatures, WindowDescriptor, WindowId, WindowSystem};

use crate::device::Device;
use crate::registry::{ContainerId, DetachedObject, ObjectId, RenderObject, Registry};

/// One graphics context and the objects living in it.
pub struct GraphicsContext {
    window: WindowId,
    device: Device,
    registry: Registry,
}

impl GraphicsContext {
    pub fn new(container: ContainerId, window: WindowId, device: Device) -> Self {
        Self {
            window,
            device,
            registry: Registry::new(container),
        }
    }

    pub fn id(&self) -> ContainerId {
        self.registry.container()
    }

    pub fn window(&self) -> WindowId {
        self.window
    }

    pub fn features(&self) -> DriverFeatures {
        self.device.features()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut Device {
        &mut self.device
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn register<T: RenderObject + 'static>(&mut self, object: &Rc<RefCell<T>>) -> Result<ObjectId> {
        self.registry.register(object)
    }

    pub fn unregister(&mut self, id: Option<ObjectId>) -> bool {
        self.registry.unregister(id)
    }

    pub fn save_all(&mut self) -> Result<Vec<DetachedObject>> {
        self.device.collect_garbage();
        self.registry.save_all(&mut self.device)
    }

    pub fn restore_all(&mut self, objects: Vec<DetachedObject>) -> Result<()> {
        self.registry.restore_all(objects, &mut self.device)
    }

    pub fn free_all(&mut self) -> Result<()> {
        let freed = self.registry.free_all(&mut self.device);
        self.device.collect_garbage();
        freed
    }

    pub fn detach(&mut self, id: ObjectId) -> Option<DetachedObject> {
        self.registry.detach(id, &mut self.device)
    }

    pub fn attach(&mut self, object: DetachedObject) -> Result<ObjectId> {
        self.registry.attach(object, &mut self.device)
    }
}

/// Owns the window system and one context per window, and tracks which
/// context is current.
pub struct ContextManager {
    windows: Box<dyn WindowSystem>,
    contexts: Vec<GraphicsContext>,
    current: Option<ContainerId>,
    next_container: u32,
}

impl ContextManager {
    pub fn new(windows: Box<dyn WindowSystem>) -> Self {
        Self {
            windows,
            contexts: Vec::new(),
            current: None,
            next_container: 1,
        }
    }

    /// Creates a window and its context. The first context becomes current.
    pub fn create_window(&mut self, descriptor: &WindowDescriptor) -> Result<WindowId> {
        let container = ContainerId::new(self.next_container)
            .ok_or_else(|| RenderError::Overflow("context ids exhausted".to_string()))?;
        let (window, driver) = self.windows.create_window(descriptor)?;
        self.next_container = self.next_container.wrapping_add(1);

        let context = GraphicsContext::new(container, window, Device::new(driver));
        tracing::info!(
            "Created context {} for window '{}' ({:?})",
            container,
            descriptor.title,
            context.features()
        );
        self.contexts.push(context);

        if self.current.is_none() {
            self.make_current(Some(window))?;
        }
        Ok(window)
    }

    /// Removes the context of `window` from the manager without touching the
    /// window itself. The caller decides what happens to its objects.
    pub fn take_context(&mut self, window: WindowId) -> Option<GraphicsContext> {
        let index = self.contexts.iter().position(|c| c.window == window)?;
        let context = self.contexts.remove(index);
        if self.current == Some(context.id()) {
            self.windows.make_current(None);
            self.current = None;
        }
        Some(context)
    }

    pub fn destroy_window(&mut self, window: WindowId) {
        self.windows.destroy_window(window);
    }

    pub fn resize_window(&mut self, window: WindowId, size: Size<u32>) -> Result<()> {
        if self.get(window).is_none() {
            return Err(unknown_window(window));
        }
        self.windows.resize_window(window, size);
        Ok(())
    }

    /// Makes the context of `window` current; `None` releases the current one.
    pub fn make_current(&mut self, window: Option<WindowId>) -> Result<()> {
        let container = match window {
            Some(window) => Some(self.get(window).ok_or_else(|| unknown_window(window))?.id()),
            None => None,
        };
        if container == self.current {
            return Ok(());
        }
        self.windows.make_current(window);
        self.current = container;
        if let Ok(context) = self.current_mut() {
            context.device.collect_garbage();
        }
        Ok(())
    }

    pub fn current(&self) -> Option<&GraphicsContext> {
        let current = self.current?;
        self.contexts.iter().find(|c| c.id() == current)
    }

    pub fn current_mut(&mut self) -> Result<&mut GraphicsContext> {
        let current = self.current.ok_or(RenderError::NoCurrentContext)?;
        self.contexts
            .iter_mut()
            .find(|c| c.id() == current)
            .ok_or(RenderError::NoCurrentContext)
    }

    pub fn current_window(&self) -> Option<WindowId> {
        self.current().map(|c| c.window)
    }

    pub fn get(&self, window: WindowId) -> Option<&GraphicsContext> {
        self.contexts.iter().find(|c| c.window == window)
    }

    pub fn get_mut(&mut self, window: WindowId) -> Option<&mut GraphicsContext> {
        self.contexts.iter_mut().find(|c| c.window == window)
    }

    pub fn by_container_mut(&mut self, container: ContainerId) -> Option<&mut GraphicsContext> {
        self.contexts.iter_mut().find(|c| c.id() == container)
    }

    pub fn framebuffer_size(&self, window: WindowId) -> Option<Size<u32>> {
        self.windows.framebuffer_size(window)
    }

    pub fn swap_buffers(&mut self, window: WindowId) {
        self.windows.swap_buffers(window);
    }

    pub fn windows(&self) -> impl Iterator<Item = WindowId> + '_ {
        self.contexts.iter().map(|c| c.window)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

fn unknown_window(window: WindowId) -> RenderError {
    RenderError::InvalidOperation(format!("window {} has no context", window.raw()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_test_utils::MockWindowSystem;

    #[test]
    fn test_first_window_becomes_current() {
        let windows = MockWindowSystem::new();
        let mut manager = ContextManager::new(Box::new(windows.clone()));
        let first = manager.create_window(&WindowDescriptor::default()).unwrap();
        let second = manager.create_window(&WindowDescriptor::default()).unwrap();

        assert_eq!(manager.current_window(), Some(first));
        assert_eq!(windows.current(), Some(first));

        manager.make_current(Some(second)).unwrap();
        assert_eq!(manager.current_window(), Some(second));
        assert_ne!(manager.get(first).unwrap().id(), manager.get(second).unwrap().id());
    }

    #[test]
    fn test_make_current_unknown_window() {
        let mut manager = ContextManager::new(Box::new(MockWindowSystem::new()));
        let err = manager.make_current(Some(WindowId::new(99))).unwrap_err();
        assert_eq!(err.code(), kiln_core::ErrorCode::InvalidOperation);
    }

    #[test]
    fn test_no_current_context() {
        let mut manager = ContextManager::new(Box::new(MockWindowSystem::new()));
        assert_eq!(manager.current_mut().err(), Some(RenderError::NoCurrentContext));
    }

    #[test]
    fn test_take_current_context_releases_it() {
        let windows = MockWindowSystem::new();
        let mut manager = ContextManager::new(Box::new(windows.clone()));
        let window = manager.create_window(&WindowDescriptor::default()).unwrap();

        let context = manager.take_context(window).unwrap();
        assert_eq!(context.window(), window);
        assert!(manager.current().is_none());
        assert_eq!(windows.current(), None);
    }
}
