//! Pipe processes: nodes of a post-processing pipeline.
//!
//! Every process performs one full-screen draw with its own program map,
//! either into a window (made current for the draw) or into whatever the
//! current context has bound. All processes are tracked by [`PipeProcesses`]
//! so the ones living in a context can be moved when the context changes.
//!
//! The full-screen quad (a shared-buffer segment and a vertex layout) is
//! created per context when its first process is created there, and released
//! with the last one.

use std::cell::RefCell;
use std::rc::Rc;

use kiln_core::alloc::{HashMap, IndexSlot, SlotArena};
use kiln_core::error::{RenderError, Result};
use kiln_core::geometry::Viewport;
use kiln_core::profiling::profile_function;
use kiln_test_utils::{PrimitiveTopology, RenderState, VertexAttribute, VertexFormat, WindowId};

use crate::context::{ContextManager, GraphicsContext};
use crate::device::Device;
use crate::layout::VertexLayout;
use crate::program::Program;
use crate::program_map::ProgramMap;
use crate::property::PropertyMap;
use crate::registry::{ContainerId, DetachedObject};
use crate::shared_buffer::{SharedBufferHandle, SharedBufferPool};

/// Triangle strip covering clip space.
const QUAD_VERTICES: [[f32; 2]; 4] = [[-1.0, -1.0], [1.0, -1.0], [-1.0, 1.0], [1.0, 1.0]];
const QUAD_ALIGN: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(IndexSlot);

pub struct PipeProcess {
    map: Rc<RefCell<ProgramMap>>,
    properties: Option<(Rc<RefCell<PropertyMap>>, usize)>,
    target: Option<WindowId>,
    container: ContainerId,
    viewport: Option<Viewport>,
    swap: bool,
}

impl PipeProcess {
    pub fn map(&self) -> &Rc<RefCell<ProgramMap>> {
        &self.map
    }

    pub fn properties(&self) -> Option<&(Rc<RefCell<PropertyMap>>, usize)> {
        self.properties.as_ref()
    }

    /// Window drawn into; `None` draws offscreen.
    pub fn target(&self) -> Option<WindowId> {
        self.target
    }

    /// Context the process's program map lives in.
    pub fn container(&self) -> ContainerId {
        self.container
    }

    /// Explicit viewport; `None` covers the target's framebuffer.
    pub fn viewport(&self) -> Option<Viewport> {
        self.viewport
    }

    pub fn swaps(&self) -> bool {
        self.swap
    }
}

struct FullscreenQuad {
    refs: usize,
    vertices: SharedBufferHandle,
    layout: Rc<RefCell<VertexLayout>>,
}

impl FullscreenQuad {
    fn new(context: &mut GraphicsContext, pool: &mut SharedBufferPool) -> Result<Self> {
        let layout = VertexLayout::new(context)?;
        let bytes: &[u8] = bytemuck::cast_slice(&QUAD_VERTICES);
        let vertices = match pool.init(context, bytes.len() as u64, Some(bytes), QUAD_ALIGN) {
            Ok(vertices) => vertices,
            Err(err) => {
                layout.borrow_mut().destroy(context);
                return Err(err);
            }
        };
        layout.borrow_mut().add_attribute(
            VertexAttribute {
                location: 0,
                format: VertexFormat::Float32x2,
                offset: 0,
                stride: std::mem::size_of::<[f32; 2]>() as u64,
                divisor: 0,
            },
            vertices.buffer().clone(),
            vertices.offset(),
        );
        Ok(Self {
            refs: 1,
            vertices,
            layout,
        })
    }

    fn release(self, contexts: &mut ContextManager, pool: &mut SharedBufferPool) {
        let container = self.layout.borrow().id().map(|id| id.container());
        if let Some(context) = container.and_then(|c| contexts.by_container_mut(c)) {
            self.layout.borrow_mut().destroy(context);
        }
        if let Err(err) = pool.clear(contexts, self.vertices, false) {
            tracing::warn!("Releasing full-screen quad failed: {}", err);
        }
    }
}

/// Every pipe process of an engine.
#[derive(Default)]
pub struct PipeProcesses {
    processes: SlotArena<PipeProcess>,
    quads: HashMap<ContainerId, FullscreenQuad>,
}

impl PipeProcesses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn get(&self, id: ProcessId) -> Option<&PipeProcess> {
        self.processes.get(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProcessId, &PipeProcess)> {
        self.processes.iter().map(|(slot, p)| (ProcessId(slot), p))
    }

    /// Whether the full-screen quad of `container` exists.
    pub fn is_prepared(&self, container: ContainerId) -> bool {
        self.quads.contains_key(&container)
    }

    /// Number of processes holding the quad of `container`.
    pub fn quad_refs(&self, container: ContainerId) -> usize {
        self.quads.get(&container).map_or(0, |quad| quad.refs)
    }

    /// Creates a process. With a `target` its program map is created in that
    /// window's context, otherwise in the current one. The current context
    /// is left as it was.
    pub fn create(
        &mut self,
        contexts: &mut ContextManager,
        pool: &mut SharedBufferPool,
        target: Option<WindowId>,
        swap: bool,
    ) -> Result<ProcessId> {
        let previous = contexts.current_window();
        if let Some(window) = target {
            contexts.make_current(Some(window))?;
        }
        let created = self.create_in_current(contexts, pool, target, swap);
        if target.is_some() && previous.is_some() && contexts.current_window() != previous {
            contexts.make_current(previous)?;
        }
        created
    }

    fn create_in_current(
        &mut self,
        contexts: &mut ContextManager,
        pool: &mut SharedBufferPool,
        target: Option<WindowId>,
        swap: bool,
    ) -> Result<ProcessId> {
        let context = contexts.current_mut()?;
        let container = context.id();
        let map = ProgramMap::new(context)?;

        if let Err(err) = self.prepare(context, pool) {
            map.borrow_mut().destroy(context);
            return Err(err);
        }

        let process = PipeProcess {
            map: map.clone(),
            properties: None,
            target,
            container,
            viewport: None,
            swap,
        };
        match self.processes.try_insert(process) {
            Ok(slot) => {
                tracing::debug!("Created pipe process in container {}", container);
                Ok(ProcessId(slot))
            }
            Err(_) => {
                map.borrow_mut().destroy(context);
                self.unprepare(contexts, pool, container);
                Err(RenderError::OutOfMemory("pipe process list cannot grow".to_string()))
            }
        }
    }

    /// Destroys a process, its program map and, with the last process of its
    /// context, the full-screen quad.
    pub fn destroy(
        &mut self,
        contexts: &mut ContextManager,
        pool: &mut SharedBufferPool,
        id: ProcessId,
    ) -> Result<()> {
        let process = self
            .processes
            .remove(id.0)
            .ok_or_else(unknown_process)?;
        if let Some(context) = contexts.by_container_mut(process.container) {
            process.map.borrow_mut().destroy(context);
        }
        self.unprepare(contexts, pool, process.container);
        Ok(())
    }

    pub fn set_properties(
        &mut self,
        id: ProcessId,
        properties: Rc<RefCell<PropertyMap>>,
        copy: usize,
    ) -> Result<()> {
        if copy >= properties.borrow().copies() {
            return Err(RenderError::InvalidOperation(format!(
                "property copy {copy} out of range"
            )));
        }
        self.process_mut(id)?.properties = Some((properties, copy));
        Ok(())
    }

    pub fn clear_properties(&mut self, id: ProcessId) -> Result<()> {
        self.process_mut(id)?.properties = None;
        Ok(())
    }

    pub fn set_viewport(&mut self, id: ProcessId, viewport: Option<Viewport>) -> Result<()> {
        self.process_mut(id)?.viewport = viewport;
        Ok(())
    }

    pub fn set_swap(&mut self, id: ProcessId, swap: bool) -> Result<()> {
        self.process_mut(id)?.swap = swap;
        Ok(())
    }

    /// Moves every process of the current context to `new_target`'s context.
    ///
    /// All affected program maps are saved before the switch and restored
    /// after it. Processes that drew into a window now draw into
    /// `new_target`. Returns how many processes moved.
    pub fn retarget(
        &mut self,
        contexts: &mut ContextManager,
        pool: &mut SharedBufferPool,
        new_target: WindowId,
    ) -> Result<usize> {
        let old = contexts.current_mut()?.id();
        let new = contexts
            .get(new_target)
            .map(GraphicsContext::id)
            .ok_or_else(|| {
                RenderError::InvalidOperation(format!(
                    "window {} has no context",
                    new_target.raw()
                ))
            })?;
        if old == new {
            return Ok(0);
        }

        let affected: Vec<ProcessId> = self
            .iter()
            .filter(|(_, p)| p.container == old)
            .map(|(id, _)| id)
            .collect();

        let maps = self.maps_of(&affected);
        let (moved_programs, shared_programs) = split_programs(&maps, old);

        // Save everything first; the switch invalidates every old handle.
        // Programs also held by maps that stay behind remain in `old`.
        let mut detached: Vec<DetachedObject> = Vec::new();
        {
            let context = contexts.current_mut()?;
            let map_ids = maps.iter().map(|map| map.borrow().id());
            let program_ids = moved_programs.iter().map(|program| program.borrow().id());
            let ids: Vec<_> = map_ids.chain(program_ids).flatten().collect();
            detached.extend(ids.into_iter().filter_map(|id| context.detach(id)));
        }

        contexts.make_current(Some(new_target))?;

        let mut first_error = None;
        {
            let context = contexts.current_mut()?;
            for object in detached {
                if let Err(err) = context.attach(object) {
                    tracing::warn!("Restoring program map state failed: {}", err);
                    first_error.get_or_insert(err);
                }
            }
            for program in &shared_programs {
                let copied = program.borrow().duplicate(context);
                match copied {
                    Ok(copy) => {
                        for map in &maps {
                            map.borrow_mut().replace_program(program, &copy);
                        }
                    }
                    Err(err) => {
                        tracing::warn!("Copying a shared program failed: {}", err);
                        first_error.get_or_insert(err);
                    }
                }
            }
            for &id in &affected {
                if let Some(process) = self.processes.get_mut(id.0) {
                    process.container = new;
                    if process.target.is_some() {
                        process.target = Some(new_target);
                    }
                }
                if let Err(err) = self.prepare(context, pool) {
                    first_error.get_or_insert(err);
                }
            }
        }
        for _ in &affected {
            self.unprepare(contexts, pool, old);
        }

        tracing::info!(
            "Retargeted {} pipe processes from container {} to {}",
            affected.len(),
            old,
            new
        );
        first_error.map_or(Ok(affected.len()), Err)
    }

    /// Distinct program maps of `ids`.
    fn maps_of(&self, ids: &[ProcessId]) -> Vec<Rc<RefCell<ProgramMap>>> {
        let mut maps: Vec<Rc<RefCell<ProgramMap>>> = Vec::new();
        for process in ids.iter().filter_map(|&id| self.get(id)) {
            if !maps.iter().any(|m| Rc::ptr_eq(m, &process.map)) {
                maps.push(process.map.clone());
            }
        }
        maps
    }

    /// Re-homes processes after the objects of `from` were migrated into
    /// `to`. Processes drawing into `destroyed` become offscreen.
    pub fn migrate(
        &mut self,
        contexts: &mut ContextManager,
        pool: &mut SharedBufferPool,
        from: ContainerId,
        to: ContainerId,
        destroyed: WindowId,
    ) {
        for (_, process) in self.processes.iter_mut() {
            if process.container == from {
                process.container = to;
            }
            if process.target == Some(destroyed) {
                process.target = None;
            }
        }
        let Some(quad) = self.quads.remove(&from) else {
            return;
        };
        match self.quads.get_mut(&to) {
            Some(existing) => {
                existing.refs += quad.refs;
                quad.release(contexts, pool);
            }
            None => {
                self.quads.insert(to, quad);
            }
        }
    }

    /// Forgets the quad of a container whose objects were freed with it;
    /// its processes keep their (now dead) maps and become offscreen.
    pub fn orphan(&mut self, container: ContainerId, destroyed: WindowId) {
        self.quads.remove(&container);
        for (_, process) in self.processes.iter_mut() {
            if process.target == Some(destroyed) {
                process.target = None;
            }
        }
    }

    /// Runs one process. A process without a property map has nothing to
    /// draw and succeeds without touching the GPU.
    pub fn execute(
        &self,
        contexts: &mut ContextManager,
        id: ProcessId,
        state: RenderState,
    ) -> Result<()> {
        profile_function!();
        let process = self.get(id).ok_or_else(unknown_process)?;
        let Some((properties, copy)) = process.properties.clone() else {
            return Ok(());
        };
        let map = process.map.clone();
        let container = process.container;
        let viewport = process.viewport;
        let swap = process.swap;
        let target = process.target;
        let quad = self.quads.get(&container).ok_or_else(|| {
            RenderError::InvalidOperation("pipe process has no full-screen quad".to_string())
        })?;
        let draw = QuadDraw {
            map: &map,
            properties: &properties,
            copy,
            layout: &quad.layout,
            state,
        };

        let Some(window) = target else {
            let context = contexts.current_mut()?;
            check_container(context, container)?;
            return draw.run(context);
        };

        let previous = contexts.current_window();
        contexts.make_current(Some(window))?;
        let size = contexts.framebuffer_size(window).unwrap_or_default();

        let context = contexts.current_mut()?;
        if let Err(err) = check_container(context, container) {
            contexts.make_current(previous)?;
            return Err(err);
        }
        let device = context.device_mut();
        let saved_framebuffer = device.bound_framebuffer();
        let saved_viewport = device.viewport();
        device.bind_framebuffer(None);
        device.set_viewport(viewport.unwrap_or_else(|| Viewport::from_size(size)));

        let drawn = draw.run(context);

        if drawn.is_ok() {
            if swap {
                contexts.swap_buffers(window);
            } else {
                contexts.current_mut()?.device_mut().flush();
            }
        }

        if previous == Some(window) {
            let device = contexts.current_mut()?.device_mut();
            device.bind_framebuffer(saved_framebuffer);
            device.set_viewport(saved_viewport);
        } else {
            contexts.make_current(previous)?;
        }
        drawn
    }

    fn process_mut(&mut self, id: ProcessId) -> Result<&mut PipeProcess> {
        self.processes.get_mut(id.0).ok_or_else(unknown_process)
    }

    fn prepare(&mut self, context: &mut GraphicsContext, pool: &mut SharedBufferPool) -> Result<()> {
        if let Some(quad) = self.quads.get_mut(&context.id()) {
            quad.refs += 1;
            return Ok(());
        }
        let quad = FullscreenQuad::new(context, pool)?;
        tracing::debug!("Prepared full-screen quad in container {}", context.id());
        self.quads.insert(context.id(), quad);
        Ok(())
    }

    fn unprepare(&mut self, contexts: &mut ContextManager, pool: &mut SharedBufferPool, container: ContainerId) {
        let Some(quad) = self.quads.get_mut(&container) else {
            return;
        };
        quad.refs = quad.refs.saturating_sub(1);
        if quad.refs == 0 {
            if let Some(quad) = self.quads.remove(&container) {
                quad.release(contexts, pool);
            }
        }
    }
}

/// Everything one full-screen draw needs.
struct QuadDraw<'a> {
    map: &'a Rc<RefCell<ProgramMap>>,
    properties: &'a Rc<RefCell<PropertyMap>>,
    copy: usize,
    layout: &'a Rc<RefCell<VertexLayout>>,
    state: RenderState,
}

impl QuadDraw<'_> {
    fn run(&self, context: &mut GraphicsContext) -> Result<()> {
        let device = context.device_mut();
        device.apply_state(self.state);

        let mut map = self.map.borrow_mut();
        map.block(device)?;
        let drawn = self.draw_blocked(&map, device);
        map.unblock(device)?;
        drawn
    }

    fn draw_blocked(&self, map: &ProgramMap, device: &mut Device) -> Result<()> {
        self.properties.borrow().apply(self.copy, map, device)?;
        let mut layout = self.layout.borrow_mut();
        layout.bind(device)?;
        device.draw(
            PrimitiveTopology::TriangleStrip,
            0,
            QUAD_VERTICES.len() as u32,
            map.instances().max(1),
        );
        layout.unbind(device);
        Ok(())
    }
}

/// Splits the programs of `maps` registered in `container` into the ones
/// held only by `maps` and the ones some other map holds too.
fn split_programs(
    maps: &[Rc<RefCell<ProgramMap>>],
    container: ContainerId,
) -> (Vec<Rc<RefCell<Program>>>, Vec<Rc<RefCell<Program>>>) {
    let mut held: Vec<(Rc<RefCell<Program>>, usize)> = Vec::new();
    for map in maps {
        for program in map.borrow().programs() {
            if program.borrow().id().map(|id| id.container()) != Some(container) {
                continue;
            }
            match held.iter_mut().find(|(p, _)| Rc::ptr_eq(p, &program)) {
                Some((_, count)) => *count += 1,
                None => held.push((program, 1)),
            }
        }
    }

    let mut moved = Vec::new();
    let mut shared = Vec::new();
    for (program, count) in held {
        if count >= program.borrow().map_count() {
            moved.push(program);
        } else {
            shared.push(program);
        }
    }
    (moved, shared)
}

fn check_container(context: &GraphicsContext, container: ContainerId) -> Result<()> {
    if context.id() != container {
        return Err(RenderError::IncompatibleContext(format!(
            "pipe process lives in container {} but container {} is current",
            container,
            context.id()
        )));
    }
    Ok(())
}

fn unknown_process() -> RenderError {
    RenderError::InvalidOperation("unknown pipe process".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program_map::StageSlot;
    use kiln_core::geometry::Size;
    use kiln_test_utils::{DriverCall, MockWindowSystem, ShaderSource, ShaderStage, WindowDescriptor};

    struct Rig {
        windows: MockWindowSystem,
        contexts: ContextManager,
        pool: SharedBufferPool,
        processes: PipeProcesses,
    }

    impl Rig {
        fn new(count: usize) -> (Self, Vec<WindowId>) {
            let windows = MockWindowSystem::new();
            let mut contexts = ContextManager::new(Box::new(windows.clone()));
            let ids = (0..count)
                .map(|_| contexts.create_window(&WindowDescriptor::default()).unwrap())
                .collect();
            let rig = Self {
                windows,
                contexts,
                pool: SharedBufferPool::default(),
                processes: PipeProcesses::new(),
            };
            (rig, ids)
        }

        fn create(&mut self, target: Option<WindowId>, swap: bool) -> ProcessId {
            self.processes
                .create(&mut self.contexts, &mut self.pool, target, swap)
                .unwrap()
        }

        /// Links a vertex+fragment program into the process's map and binds a
        /// one-value property map.
        fn make_drawable(&mut self, id: ProcessId) {
            let process = self.processes.get(id).unwrap();
            let map = process.map().clone();
            let context = self.contexts.by_container_mut(process.container()).unwrap();
            let program = map.borrow_mut().add(context, StageSlot::All, 0).unwrap();
            {
                let mut program = program.borrow_mut();
                program.attach_source(ShaderSource::new(ShaderStage::Vertex, "quad"));
                program.attach_source(ShaderSource::new(ShaderStage::Fragment, "blit"));
                program.link(context.device_mut()).unwrap();
            }
            let properties = Rc::new(RefCell::new(PropertyMap::new(1)));
            properties
                .borrow_mut()
                .set(0, 0, kiln_test_utils::PropertyValue::Float(1.0))
                .unwrap();
            self.processes.set_properties(id, properties, 0).unwrap();
        }

        fn execute(&mut self, id: ProcessId) -> Result<()> {
            self.processes
                .execute(&mut self.contexts, id, RenderState::empty())
        }
    }

    #[test]
    fn test_quad_is_shared_per_container() {
        let (mut rig, windows) = Rig::new(1);
        let a = rig.create(Some(windows[0]), true);
        let b = rig.create(None, false);
        let container = rig.processes.get(a).unwrap().container();

        assert_eq!(rig.processes.quad_refs(container), 2);
        assert_eq!(rig.pool.physical_count(), 1);

        rig.processes.destroy(&mut rig.contexts, &mut rig.pool, a).unwrap();
        assert!(rig.processes.is_prepared(container));
        rig.processes.destroy(&mut rig.contexts, &mut rig.pool, b).unwrap();
        assert!(!rig.processes.is_prepared(container));
        assert_eq!(rig.pool.physical_count(), 0);
        assert!(rig.processes.is_empty());
    }

    #[test]
    fn test_create_in_target_context_keeps_current() {
        let (mut rig, windows) = Rig::new(2);
        let id = rig.create(Some(windows[1]), false);

        let target = rig.contexts.get(windows[1]).unwrap().id();
        assert_eq!(rig.processes.get(id).unwrap().container(), target);
        assert_eq!(rig.contexts.current_window(), Some(windows[0]));
    }

    #[test]
    fn test_create_without_context_fails() {
        let (mut rig, _) = Rig::new(0);
        let err = rig
            .processes
            .create(&mut rig.contexts, &mut rig.pool, None, false)
            .unwrap_err();
        assert_eq!(err, RenderError::NoCurrentContext);
        assert!(rig.processes.is_empty());
    }

    #[test]
    fn test_execute_without_properties_is_noop() {
        let (mut rig, windows) = Rig::new(1);
        let id = rig.create(Some(windows[0]), true);
        let driver = rig.windows.driver(windows[0]).unwrap();
        driver.clear_calls();

        rig.execute(id).unwrap();
        assert_eq!(driver.call_count(), 0);
        assert_eq!(rig.windows.swap_count(windows[0]), 0);
    }

    #[test]
    fn test_execute_into_window_then_swap() {
        let (mut rig, windows) = Rig::new(2);
        let id = rig.create(Some(windows[1]), true);
        rig.make_drawable(id);
        let driver = rig.windows.driver(windows[1]).unwrap();
        driver.clear_calls();

        rig.execute(id).unwrap();

        assert_eq!(driver.draws(), vec![(0, 4, 1)]);
        assert_eq!(
            driver.count_calls(|c| matches!(
                c,
                DriverCall::Draw {
                    topology: PrimitiveTopology::TriangleStrip,
                    ..
                }
            )),
            1
        );
        assert_eq!(
            driver.count_calls(|c| matches!(
                c,
                DriverCall::SetViewport { viewport } if *viewport == Viewport::from_size(Size::new(800, 600))
            )),
            1
        );
        assert_eq!(rig.windows.swap_count(windows[1]), 1);
        assert_eq!(driver.count_flushes(), 0);
        assert!(!rig.processes.get(id).unwrap().map().borrow().is_blocked());
        assert_eq!(rig.contexts.current_window(), Some(windows[0]));
    }

    #[test]
    fn test_execute_in_current_context_restores_viewport() {
        let (mut rig, windows) = Rig::new(1);
        let id = rig.create(Some(windows[0]), false);
        rig.make_drawable(id);
        rig.processes
            .set_viewport(id, Some(Viewport::new(0, 0, 64, 64)))
            .unwrap();

        let saved = Viewport::new(10, 10, 320, 200);
        rig.contexts.current_mut().unwrap().device_mut().set_viewport(saved);
        let driver = rig.windows.driver(windows[0]).unwrap();
        driver.clear_calls();

        rig.execute(id).unwrap();

        assert_eq!(driver.count_flushes(), 1);
        assert_eq!(rig.windows.swap_count(windows[0]), 0);
        assert_eq!(rig.contexts.current().unwrap().device().viewport(), saved);
    }

    #[test]
    fn test_offscreen_execute_checks_container() {
        let (mut rig, windows) = Rig::new(2);
        let id = rig.create(None, false);
        rig.make_drawable(id);

        rig.contexts.make_current(Some(windows[1])).unwrap();
        let err = rig.execute(id).unwrap_err();
        assert_eq!(err.code(), kiln_core::ErrorCode::IncompatibleContext);

        rig.contexts.make_current(Some(windows[0])).unwrap();
        rig.execute(id).unwrap();
        assert_eq!(rig.windows.driver(windows[0]).unwrap().count_draws(), 1);
    }

    #[test]
    fn test_retarget_moves_maps_and_quad() {
        let (mut rig, windows) = Rig::new(2);
        let id = rig.create(Some(windows[0]), true);
        rig.make_drawable(id);
        let old = rig.contexts.get(windows[0]).unwrap().id();
        let new = rig.contexts.get(windows[1]).unwrap().id();

        let moved = rig
            .processes
            .retarget(&mut rig.contexts, &mut rig.pool, windows[1])
            .unwrap();

        assert_eq!(moved, 1);
        let process = rig.processes.get(id).unwrap();
        assert_eq!(process.container(), new);
        assert_eq!(process.target(), Some(windows[1]));
        assert_eq!(process.map().borrow().id().map(|i| i.container()), Some(new));
        assert!(!rig.processes.is_prepared(old));
        assert_eq!(rig.processes.quad_refs(new), 1);
        assert_eq!(rig.contexts.current_window(), Some(windows[1]));

        rig.execute(id).unwrap();
        assert_eq!(rig.windows.driver(windows[1]).unwrap().count_draws(), 1);
        assert_eq!(rig.windows.driver(windows[0]).unwrap().count_draws(), 0);
    }

    #[test]
    fn test_retarget_copies_program_shared_with_map_left_behind() {
        let (mut rig, windows) = Rig::new(2);
        let id = rig.create(Some(windows[0]), true);
        rig.make_drawable(id);
        let old = rig.contexts.get(windows[0]).unwrap().id();
        let new = rig.contexts.get(windows[1]).unwrap().id();

        let process_map = rig.processes.get(id).unwrap().map().clone();
        let shared = process_map
            .borrow()
            .program(ShaderStage::Vertex)
            .unwrap()
            .clone();
        let context = rig.contexts.get_mut(windows[0]).unwrap();
        let other = ProgramMap::new(context).unwrap();
        other
            .borrow_mut()
            .add_share(context.features(), StageSlot::All, shared.clone())
            .unwrap();

        rig.processes
            .retarget(&mut rig.contexts, &mut rig.pool, windows[1])
            .unwrap();

        assert_eq!(other.borrow().id().map(|i| i.container()), Some(old));
        assert_eq!(shared.borrow().id().map(|i| i.container()), Some(old));
        assert!(shared.borrow().is_linked());
        assert_eq!(shared.borrow().map_count(), 1);

        let copy = process_map
            .borrow()
            .program(ShaderStage::Vertex)
            .unwrap()
            .clone();
        assert!(!Rc::ptr_eq(&copy, &shared));
        assert_eq!(copy.borrow().id().map(|i| i.container()), Some(new));
        assert!(copy.borrow().is_linked());
        assert_eq!(copy.borrow().map_count(), 1);

        rig.execute(id).unwrap();
        assert_eq!(rig.windows.driver(windows[1]).unwrap().count_draws(), 1);
    }

    #[test]
    fn test_retarget_moves_program_held_only_by_moved_map() {
        let (mut rig, windows) = Rig::new(2);
        let id = rig.create(Some(windows[0]), true);
        rig.make_drawable(id);
        let new = rig.contexts.get(windows[1]).unwrap().id();
        let program = rig
            .processes
            .get(id)
            .unwrap()
            .map()
            .borrow()
            .program(ShaderStage::Vertex)
            .unwrap()
            .clone();

        rig.processes
            .retarget(&mut rig.contexts, &mut rig.pool, windows[1])
            .unwrap();

        let map = rig.processes.get(id).unwrap().map().clone();
        let held = map.borrow().program(ShaderStage::Vertex).unwrap().clone();
        assert!(Rc::ptr_eq(&held, &program));
        assert_eq!(program.borrow().id().map(|i| i.container()), Some(new));
    }

    #[test]
    fn test_failed_draw_is_not_presented() {
        let (mut rig, windows) = Rig::new(2);
        let id = rig.create(Some(windows[1]), true);
        rig.make_drawable(id);
        let map = rig.processes.get(id).unwrap().map().clone();
        map.borrow()
            .program(ShaderStage::Vertex)
            .unwrap()
            .borrow_mut()
            .attach_source(ShaderSource::new(ShaderStage::Fragment, "edited"));
        let driver = rig.windows.driver(windows[1]).unwrap();
        driver.clear_calls();

        assert!(rig.execute(id).is_err());

        assert_eq!(driver.count_draws(), 0);
        assert_eq!(driver.count_flushes(), 0);
        assert_eq!(rig.windows.swap_count(windows[1]), 0);
        assert_eq!(rig.contexts.current_window(), Some(windows[0]));
    }

    #[test]
    fn test_migrate_makes_processes_offscreen() {
        let (mut rig, windows) = Rig::new(2);
        let id = rig.create(Some(windows[1]), true);
        let from = rig.contexts.get(windows[1]).unwrap().id();
        let to = rig.contexts.get(windows[0]).unwrap().id();
        rig.create(None, false);

        rig.processes
            .migrate(&mut rig.contexts, &mut rig.pool, from, to, windows[1]);

        let process = rig.processes.get(id).unwrap();
        assert_eq!(process.container(), to);
        assert_eq!(process.target(), None);
        assert!(!rig.processes.is_prepared(from));
        assert_eq!(rig.processes.quad_refs(to), 2);
    }

    #[test]
    fn test_property_copy_out_of_range() {
        let (mut rig, windows) = Rig::new(1);
        let id = rig.create(Some(windows[0]), false);
        let properties = Rc::new(RefCell::new(PropertyMap::new(2)));
        assert!(rig.processes.set_properties(id, properties, 2).is_err());
    }
}
