//! Mock implementation of WindowSystem for testing.

use std::sync::Arc;

use ahash::AHashMap;
use kiln_core::error::{RenderError, Result};
use kiln_core::geometry::Size;
use parking_lot::Mutex;

use crate::{
    driver::GraphicsDriver,
    gpu_types::DriverFeatures,
    mock_driver::MockDriver,
    window_system::{WindowDescriptor, WindowId, WindowSystem},
};

/// Object names handed out by the n-th mock driver start at `1 + n * STRIDE`.
const NAME_STRIDE: u32 = 1000;

/// Records a window system call for verification in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowCall {
    CreateWindow { window: WindowId, title: String },
    DestroyWindow { window: WindowId },
    ResizeWindow { window: WindowId, size: Size<u32> },
    MakeCurrent { window: Option<WindowId> },
    SwapBuffers { window: WindowId },
}

#[derive(Debug)]
struct MockWindow {
    size: Size<u32>,
    swaps: u32,
}

struct MockWindowState {
    calls: Vec<WindowCall>,
    windows: AHashMap<WindowId, MockWindow>,
    drivers: AHashMap<WindowId, MockDriver>,
    current: Option<WindowId>,
    next_window: u64,
    created: u32,
    features: DriverFeatures,
    fail_next_window: bool,
}

/// Mock implementation of WindowSystem for testing.
///
/// Every created window gets its own [`MockDriver`]; tests retrieve a handle
/// for it with [`MockWindowSystem::driver`].
///
/// # Example
///
/// ```rust
/// use kiln_test_utils::{MockWindowSystem, WindowDescriptor, WindowSystem};
///
/// let mut windows = MockWindowSystem::new();
/// let (window, _driver) = windows.create_window(&WindowDescriptor::default()).unwrap();
///
/// windows.swap_buffers(window);
/// assert_eq!(windows.swap_count(window), 1);
/// ```
#[derive(Clone)]
pub struct MockWindowSystem {
    state: Arc<Mutex<MockWindowState>>,
}

impl MockWindowSystem {
    pub fn new() -> Self {
        Self::with_features(DriverFeatures::all())
    }

    /// Window system whose drivers report `features`.
    pub fn with_features(features: DriverFeatures) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockWindowState {
                calls: Vec::new(),
                windows: AHashMap::new(),
                drivers: AHashMap::new(),
                current: None,
                next_window: 1,
                created: 0,
                features,
                fail_next_window: false,
            })),
        }
    }

    /// Make the next `create_window` fail with `OutOfMemory`.
    pub fn fail_next_window(&self) {
        self.state.lock().fail_next_window = true;
    }

    /// Handle to the driver of `window`, sharing state with the engine's copy.
    pub fn driver(&self, window: WindowId) -> Option<MockDriver> {
        self.state.lock().drivers.get(&window).cloned()
    }

    pub fn current(&self) -> Option<WindowId> {
        self.state.lock().current
    }

    pub fn swap_count(&self, window: WindowId) -> u32 {
        self.state
            .lock()
            .windows
            .get(&window)
            .map_or(0, |w| w.swaps)
    }

    pub fn window_count(&self) -> usize {
        self.state.lock().windows.len()
    }

    pub fn calls(&self) -> Vec<WindowCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn count_make_current(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, WindowCall::MakeCurrent { .. }))
            .count()
    }
}

impl Default for MockWindowSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowSystem for MockWindowSystem {
    fn create_window(
        &mut self,
        descriptor: &WindowDescriptor,
    ) -> Result<(WindowId, Box<dyn GraphicsDriver>)> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_window) {
            return Err(RenderError::OutOfMemory(format!(
                "window '{}' could not be created",
                descriptor.title
            )));
        }

        let window = WindowId::new(state.next_window);
        state.next_window += 1;

        let driver =
            MockDriver::with_name_base(state.features, 1 + state.created * NAME_STRIDE);
        state.created += 1;

        state.windows.insert(
            window,
            MockWindow {
                size: descriptor.size,
                swaps: 0,
            },
        );
        state.drivers.insert(window, driver.clone());
        state.calls.push(WindowCall::CreateWindow {
            window,
            title: descriptor.title.clone(),
        });

        Ok((window, Box::new(driver)))
    }

    fn destroy_window(&mut self, window: WindowId) {
        let mut state = self.state.lock();
        state.windows.remove(&window);
        if state.current == Some(window) {
            state.current = None;
        }
        state.calls.push(WindowCall::DestroyWindow { window });
    }

    fn resize_window(&mut self, window: WindowId, size: Size<u32>) {
        let mut state = self.state.lock();
        if let Some(entry) = state.windows.get_mut(&window) {
            entry.size = size;
        }
        state.calls.push(WindowCall::ResizeWindow { window, size });
    }

    fn make_current(&mut self, window: Option<WindowId>) {
        let mut state = self.state.lock();
        let known = window.filter(|w| state.windows.contains_key(w));
        state.current = known;
        state.calls.push(WindowCall::MakeCurrent { window });
    }

    fn swap_buffers(&mut self, window: WindowId) {
        let mut state = self.state.lock();
        if let Some(entry) = state.windows.get_mut(&window) {
            entry.swaps += 1;
        }
        state.calls.push(WindowCall::SwapBuffers { window });
    }

    fn framebuffer_size(&self, window: WindowId) -> Option<Size<u32>> {
        self.state.lock().windows.get(&window).map(|w| w.size)
    }
}
