//! Mock implementation of GraphicsDriver for testing.
//!
//! The mock keeps just enough state (buffer bytes, program link status,
//! live object names) to behave like a driver, and records every call so
//! tests can assert on the exact GPU traffic.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use kiln_core::geometry::Viewport;
use parking_lot::Mutex;

use crate::{driver::GraphicsDriver, gpu_types::*};

/// Binary format tag produced by the mock.
pub const MOCK_BINARY_FORMAT: u32 = 0x4b4c_4e01;

/// Records a driver call for verification in tests.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    CreateBuffer {
        buffer: u32,
        size: u64,
        usage: BufferUsages,
        initialized: bool,
    },
    DeleteBuffer {
        buffer: u32,
    },
    WriteBuffer {
        buffer: u32,
        offset: u64,
        size: usize,
    },
    ReadBuffer {
        buffer: u32,
        offset: u64,
        size: usize,
    },
    CopyBuffer {
        src: u32,
        dst: u32,
        size: u64,
    },
    MapBuffer {
        buffer: u32,
        offset: u64,
        size: u64,
    },
    UnmapBuffer {
        buffer: u32,
    },
    CreateProgram {
        program: u32,
        separable: bool,
    },
    LinkProgram {
        program: u32,
        stages: ShaderStages,
        success: bool,
    },
    GetProgramBinary {
        program: u32,
    },
    LoadProgramBinary {
        program: u32,
        success: bool,
    },
    DeleteProgram {
        program: u32,
    },
    UseProgram {
        program: Option<u32>,
    },
    SetUniform {
        program: u32,
        location: u32,
        value: PropertyValue,
    },
    CreatePipeline {
        pipeline: u32,
    },
    UseProgramStages {
        pipeline: u32,
        stages: ShaderStages,
        program: Option<u32>,
    },
    BindPipeline {
        pipeline: Option<u32>,
    },
    DeletePipeline {
        pipeline: u32,
    },
    CreateVertexArray {
        array: u32,
    },
    SetVertexAttribute {
        array: u32,
        location: u32,
        buffer: u32,
    },
    BindVertexArray {
        array: Option<u32>,
    },
    DeleteVertexArray {
        array: u32,
    },
    BindFramebuffer {
        framebuffer: Option<u32>,
    },
    SetViewport {
        viewport: Viewport,
    },
    ApplyState {
        state: RenderState,
    },
    Draw {
        topology: PrimitiveTopology,
        first: u32,
        count: u32,
        instances: u32,
    },
    Flush,
}

#[derive(Debug, Clone)]
struct MockProgram {
    separable: bool,
    stages: ShaderStages,
    linked: bool,
}

#[derive(Debug)]
struct MockState {
    calls: Vec<DriverCall>,
    features: DriverFeatures,
    next_name: u32,

    buffers: AHashMap<u32, Vec<u8>>,
    programs: AHashMap<u32, MockProgram>,
    pipelines: AHashSet<u32>,
    arrays: AHashSet<u32>,

    framebuffer: Option<FramebufferId>,
    viewport: Viewport,
    mapped: Option<(u32, u64, MapMode)>,

    /// Number of upcoming allocations (any object kind) that should fail.
    fail_allocations: u32,
    /// Number of upcoming links that should fail.
    fail_links: u32,
    corrupt_next_unmap: bool,
}

impl MockState {
    fn allocate_name(&mut self) -> Option<u32> {
        if self.fail_allocations > 0 {
            self.fail_allocations -= 1;
            return None;
        }
        let name = self.next_name;
        self.next_name += 1;
        Some(name)
    }
}

/// Mock implementation of GraphicsDriver for testing.
///
/// Clones share state, so a test can keep a clone for inspection after the
/// original is boxed and handed to the engine.
///
/// # Example
///
/// ```rust
/// use kiln_test_utils::{BufferUsages, GraphicsDriver, MockDriver};
///
/// let mut mock = MockDriver::new();
/// let buffer = mock.create_buffer(64, BufferUsages::VERTEX, None);
///
/// assert!(buffer.is_some());
/// assert_eq!(mock.count_buffer_creates(), 1);
/// ```
#[derive(Clone)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
    map_scratch: Vec<u8>,
}

impl MockDriver {
    /// Driver with every optional feature enabled.
    pub fn new() -> Self {
        Self::with_features(DriverFeatures::all())
    }

    pub fn with_features(features: DriverFeatures) -> Self {
        Self::with_name_base(features, 1)
    }

    /// Driver whose object names start at `base`, so names from different
    /// mock contexts never collide.
    pub fn with_name_base(features: DriverFeatures, base: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                calls: Vec::new(),
                features,
                next_name: base.max(1),
                buffers: AHashMap::new(),
                programs: AHashMap::new(),
                pipelines: AHashSet::new(),
                arrays: AHashSet::new(),
                framebuffer: None,
                viewport: Viewport::default(),
                mapped: None,
                fail_allocations: 0,
                fail_links: 0,
                corrupt_next_unmap: false,
            })),
            map_scratch: Vec::new(),
        }
    }

    // Failure injection

    /// Make the next `count` object allocations return `None`.
    pub fn fail_next_allocations(&self, count: u32) {
        self.state.lock().fail_allocations = count;
    }

    /// Make the next `count` program links fail.
    pub fn fail_next_links(&self, count: u32) {
        self.state.lock().fail_links = count;
    }

    /// Report corruption on the next unmap.
    pub fn corrupt_next_unmap(&self) {
        self.state.lock().corrupt_next_unmap = true;
    }

    pub fn set_features(&self, features: DriverFeatures) {
        self.state.lock().features = features;
    }

    // Inspection

    /// Get a copy of all recorded calls.
    pub fn calls(&self) -> Vec<DriverCall> {
        self.state.lock().calls.clone()
    }

    /// Clear recorded calls (useful between test steps).
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Get total number of recorded calls.
    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Count recorded calls matching a predicate.
    pub fn count_calls(&self, predicate: impl Fn(&DriverCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    pub fn count_buffer_creates(&self) -> usize {
        self.count_calls(|call| matches!(call, DriverCall::CreateBuffer { .. }))
    }

    pub fn count_buffer_deletes(&self) -> usize {
        self.count_calls(|call| matches!(call, DriverCall::DeleteBuffer { .. }))
    }

    pub fn count_draws(&self) -> usize {
        self.count_calls(|call| matches!(call, DriverCall::Draw { .. }))
    }

    pub fn count_pipeline_binds(&self) -> usize {
        self.count_calls(|call| matches!(call, DriverCall::BindPipeline { pipeline: Some(_) }))
    }

    pub fn count_program_uses(&self) -> usize {
        self.count_calls(|call| matches!(call, DriverCall::UseProgram { program: Some(_) }))
    }

    pub fn count_flushes(&self) -> usize {
        self.count_calls(|call| matches!(call, DriverCall::Flush))
    }

    /// Recorded draw calls as `(first, count, instances)`.
    pub fn draws(&self) -> Vec<(u32, u32, u32)> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                DriverCall::Draw {
                    first,
                    count,
                    instances,
                    ..
                } => Some((*first, *count, *instances)),
                _ => None,
            })
            .collect()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_programs(&self) -> usize {
        self.state.lock().programs.len()
    }

    pub fn live_pipelines(&self) -> usize {
        self.state.lock().pipelines.len()
    }

    pub fn live_vertex_arrays(&self) -> usize {
        self.state.lock().arrays.len()
    }

    /// Current contents of a buffer.
    pub fn buffer_contents(&self, buffer: BufferId) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer.get()).cloned()
    }

    pub fn is_program_linked(&self, program: ProgramId) -> bool {
        self.state
            .lock()
            .programs
            .get(&program.get())
            .is_some_and(|p| p.linked)
    }

    fn record(&self, call: DriverCall) {
        self.state.lock().calls.push(call);
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphicsDriver for MockDriver {
    fn features(&self) -> DriverFeatures {
        self.state.lock().features
    }

    fn create_buffer(
        &mut self,
        size: u64,
        usage: BufferUsages,
        data: Option<&[u8]>,
    ) -> Option<BufferId> {
        let mut state = self.state.lock();
        let name = state.allocate_name()?;

        let mut bytes = vec![0u8; size as usize];
        if let Some(data) = data {
            let len = data.len().min(bytes.len());
            bytes[..len].copy_from_slice(&data[..len]);
        }
        state.buffers.insert(name, bytes);
        state.calls.push(DriverCall::CreateBuffer {
            buffer: name,
            size,
            usage,
            initialized: data.is_some(),
        });

        BufferId::new(name)
    }

    fn delete_buffer(&mut self, buffer: BufferId) {
        let mut state = self.state.lock();
        state.buffers.remove(&buffer.get());
        state.calls.push(DriverCall::DeleteBuffer {
            buffer: buffer.get(),
        });
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) {
        let mut state = self.state.lock();
        if let Some(bytes) = state.buffers.get_mut(&buffer.get()) {
            let start = (offset as usize).min(bytes.len());
            let end = (start + data.len()).min(bytes.len());
            bytes[start..end].copy_from_slice(&data[..end - start]);
        }
        state.calls.push(DriverCall::WriteBuffer {
            buffer: buffer.get(),
            offset,
            size: data.len(),
        });
    }

    fn read_buffer(&mut self, buffer: BufferId, offset: u64, out: &mut [u8]) -> bool {
        let mut state = self.state.lock();
        let ok = match state.buffers.get(&buffer.get()) {
            Some(bytes) if offset as usize + out.len() <= bytes.len() => {
                let start = offset as usize;
                out.copy_from_slice(&bytes[start..start + out.len()]);
                true
            }
            _ => false,
        };
        state.calls.push(DriverCall::ReadBuffer {
            buffer: buffer.get(),
            offset,
            size: out.len(),
        });
        ok
    }

    fn copy_buffer(
        &mut self,
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    ) {
        let mut state = self.state.lock();
        let chunk = state.buffers.get(&src.get()).and_then(|bytes| {
            let start = src_offset as usize;
            bytes.get(start..start + size as usize).map(<[u8]>::to_vec)
        });
        if let (Some(chunk), Some(bytes)) = (chunk, state.buffers.get_mut(&dst.get())) {
            let start = dst_offset as usize;
            if let Some(target) = bytes.get_mut(start..start + chunk.len()) {
                target.copy_from_slice(&chunk);
            }
        }
        state.calls.push(DriverCall::CopyBuffer {
            src: src.get(),
            dst: dst.get(),
            size,
        });
    }

    fn map_buffer(
        &mut self,
        buffer: BufferId,
        offset: u64,
        size: u64,
        mode: MapMode,
    ) -> Option<&mut [u8]> {
        {
            let mut state = self.state.lock();
            if state.mapped.is_some() {
                return None;
            }
            let bytes = state.buffers.get(&buffer.get())?;
            let start = offset as usize;
            let range = bytes.get(start..start + size as usize)?;
            self.map_scratch.clear();
            self.map_scratch.extend_from_slice(range);
            state.mapped = Some((buffer.get(), offset, mode));
            state.calls.push(DriverCall::MapBuffer {
                buffer: buffer.get(),
                offset,
                size,
            });
        }
        Some(self.map_scratch.as_mut_slice())
    }

    fn unmap_buffer(&mut self, buffer: BufferId) -> bool {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::UnmapBuffer {
            buffer: buffer.get(),
        });

        let Some((name, offset, mode)) = state.mapped.take() else {
            return true;
        };
        if name == buffer.get() && mode == MapMode::Write {
            if let Some(bytes) = state.buffers.get_mut(&name) {
                let start = offset as usize;
                bytes[start..start + self.map_scratch.len()].copy_from_slice(&self.map_scratch);
            }
        }
        !std::mem::take(&mut state.corrupt_next_unmap)
    }

    fn create_program(&mut self, separable: bool) -> Option<ProgramId> {
        let mut state = self.state.lock();
        let name = state.allocate_name()?;
        state.programs.insert(
            name,
            MockProgram {
                separable,
                stages: ShaderStages::empty(),
                linked: false,
            },
        );
        state.calls.push(DriverCall::CreateProgram {
            program: name,
            separable,
        });
        ProgramId::new(name)
    }

    fn link_program(&mut self, program: ProgramId, sources: &[ShaderSource]) -> bool {
        let mut state = self.state.lock();
        let stages = sources
            .iter()
            .fold(ShaderStages::empty(), |acc, s| acc | s.stage.flag());

        let forced_failure = if state.fail_links > 0 {
            state.fail_links -= 1;
            true
        } else {
            false
        };
        let supported = state.features.contains(stages.required_features());

        let success = match state.programs.get_mut(&program.get()) {
            Some(entry) if !forced_failure && supported && !stages.is_empty() => {
                entry.stages = stages;
                entry.linked = true;
                true
            }
            Some(entry) => {
                entry.linked = false;
                false
            }
            None => false,
        };
        state.calls.push(DriverCall::LinkProgram {
            program: program.get(),
            stages,
            success,
        });
        success
    }

    fn get_program_binary(&mut self, program: ProgramId) -> Option<ProgramBinary> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::GetProgramBinary {
            program: program.get(),
        });
        if !state.features.contains(DriverFeatures::PROGRAM_BINARY) {
            return None;
        }
        let entry = state.programs.get(&program.get()).filter(|p| p.linked)?;
        Some(ProgramBinary {
            format: MOCK_BINARY_FORMAT,
            data: vec![entry.stages.bits(), entry.separable as u8],
        })
    }

    fn load_program_binary(&mut self, program: ProgramId, binary: &ProgramBinary) -> bool {
        let mut state = self.state.lock();
        let decoded = match (binary.format, binary.data.as_slice()) {
            (MOCK_BINARY_FORMAT, [stages, _separable]) => ShaderStages::from_bits(*stages),
            _ => None,
        };
        let accepted = state.features.contains(DriverFeatures::PROGRAM_BINARY);
        let success = match (decoded, state.programs.get_mut(&program.get())) {
            (Some(stages), Some(entry)) if accepted => {
                entry.stages = stages;
                entry.linked = true;
                true
            }
            _ => false,
        };
        state.calls.push(DriverCall::LoadProgramBinary {
            program: program.get(),
            success,
        });
        success
    }

    fn delete_program(&mut self, program: ProgramId) {
        let mut state = self.state.lock();
        state.programs.remove(&program.get());
        state.calls.push(DriverCall::DeleteProgram {
            program: program.get(),
        });
    }

    fn use_program(&mut self, program: Option<ProgramId>) {
        self.record(DriverCall::UseProgram {
            program: program.map(ProgramId::get),
        });
    }

    fn set_uniform(&mut self, program: ProgramId, location: u32, value: &PropertyValue) {
        self.record(DriverCall::SetUniform {
            program: program.get(),
            location,
            value: *value,
        });
    }

    fn create_pipeline(&mut self) -> Option<PipelineId> {
        let mut state = self.state.lock();
        if !state.features.contains(DriverFeatures::SEPARATE_PROGRAMS) {
            return None;
        }
        let name = state.allocate_name()?;
        state.pipelines.insert(name);
        state.calls.push(DriverCall::CreatePipeline { pipeline: name });
        PipelineId::new(name)
    }

    fn use_program_stages(
        &mut self,
        pipeline: PipelineId,
        stages: ShaderStages,
        program: Option<ProgramId>,
    ) {
        self.record(DriverCall::UseProgramStages {
            pipeline: pipeline.get(),
            stages,
            program: program.map(ProgramId::get),
        });
    }

    fn bind_pipeline(&mut self, pipeline: Option<PipelineId>) {
        self.record(DriverCall::BindPipeline {
            pipeline: pipeline.map(PipelineId::get),
        });
    }

    fn delete_pipeline(&mut self, pipeline: PipelineId) {
        let mut state = self.state.lock();
        state.pipelines.remove(&pipeline.get());
        state.calls.push(DriverCall::DeletePipeline {
            pipeline: pipeline.get(),
        });
    }

    fn create_vertex_array(&mut self) -> Option<VertexArrayId> {
        let mut state = self.state.lock();
        let name = state.allocate_name()?;
        state.arrays.insert(name);
        state.calls.push(DriverCall::CreateVertexArray { array: name });
        VertexArrayId::new(name)
    }

    fn set_vertex_attribute(
        &mut self,
        array: VertexArrayId,
        attribute: &VertexAttribute,
        buffer: BufferId,
    ) {
        self.record(DriverCall::SetVertexAttribute {
            array: array.get(),
            location: attribute.location,
            buffer: buffer.get(),
        });
    }

    fn bind_vertex_array(&mut self, array: Option<VertexArrayId>) {
        self.record(DriverCall::BindVertexArray {
            array: array.map(VertexArrayId::get),
        });
    }

    fn delete_vertex_array(&mut self, array: VertexArrayId) {
        let mut state = self.state.lock();
        state.arrays.remove(&array.get());
        state.calls.push(DriverCall::DeleteVertexArray { array: array.get() });
    }

    fn bound_framebuffer(&self) -> Option<FramebufferId> {
        self.state.lock().framebuffer
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>) {
        let mut state = self.state.lock();
        state.framebuffer = framebuffer;
        state.calls.push(DriverCall::BindFramebuffer {
            framebuffer: framebuffer.map(FramebufferId::get),
        });
    }

    fn viewport(&self) -> Viewport {
        self.state.lock().viewport
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        let mut state = self.state.lock();
        state.viewport = viewport;
        state.calls.push(DriverCall::SetViewport { viewport });
    }

    fn apply_state(&mut self, state: RenderState) {
        self.record(DriverCall::ApplyState { state });
    }

    fn draw(&mut self, topology: PrimitiveTopology, first: u32, count: u32, instances: u32) {
        self.record(DriverCall::Draw {
            topology,
            first,
            count,
            instances,
        });
    }

    fn flush(&mut self) {
        self.record(DriverCall::Flush);
    }
}
