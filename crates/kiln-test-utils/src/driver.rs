//! Trait abstracting the native graphics function table.
//!
//! Every GPU call in the core goes through a [`GraphicsDriver`] owned by the
//! context it belongs to, so per-context function resolution stays outside
//! the core and tests can substitute a recording mock.

use kiln_core::geometry::Viewport;

use crate::gpu_types::*;

/// Function table of one graphics context.
///
/// # Handle Ownership
///
/// Creation methods return `None` when the driver could not allocate the
/// object. Returned handles are only meaningful to the driver that created
/// them; passing a handle to another context's driver is a caller bug.
///
/// # Example
///
/// ```rust,no_run
/// use kiln_test_utils::{BufferUsages, GraphicsDriver};
///
/// fn upload(driver: &mut dyn GraphicsDriver, bytes: &[u8]) {
///     if let Some(buffer) =
///         driver.create_buffer(bytes.len() as u64, BufferUsages::VERTEX, Some(bytes))
///     {
///         driver.write_buffer(buffer, 0, bytes);
///     }
/// }
/// ```
pub trait GraphicsDriver {
    /// Capabilities of the context this driver belongs to.
    fn features(&self) -> DriverFeatures;

    // Buffer operations

    /// Create a buffer of `size` bytes, optionally initialized from `data`.
    fn create_buffer(
        &mut self,
        size: u64,
        usage: BufferUsages,
        data: Option<&[u8]>,
    ) -> Option<BufferId>;

    fn delete_buffer(&mut self, buffer: BufferId);

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]);

    /// Read `out.len()` bytes starting at `offset`; `false` if the read failed.
    fn read_buffer(&mut self, buffer: BufferId, offset: u64, out: &mut [u8]) -> bool;

    fn copy_buffer(
        &mut self,
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    );

    /// Map a byte range for CPU access.
    fn map_buffer(
        &mut self,
        buffer: BufferId,
        offset: u64,
        size: u64,
        mode: MapMode,
    ) -> Option<&mut [u8]>;

    /// Unmap a mapped buffer; `false` means the driver detected corruption.
    fn unmap_buffer(&mut self, buffer: BufferId) -> bool;

    // Program operations

    fn create_program(&mut self, separable: bool) -> Option<ProgramId>;

    /// Compile and link the given stage sources into `program`.
    fn link_program(&mut self, program: ProgramId, sources: &[ShaderSource]) -> bool;

    fn get_program_binary(&mut self, program: ProgramId) -> Option<ProgramBinary>;

    fn load_program_binary(&mut self, program: ProgramId, binary: &ProgramBinary) -> bool;

    fn delete_program(&mut self, program: ProgramId);

    fn use_program(&mut self, program: Option<ProgramId>);

    fn set_uniform(&mut self, program: ProgramId, location: u32, value: &PropertyValue);

    // Pipeline operations

    fn create_pipeline(&mut self) -> Option<PipelineId>;

    fn use_program_stages(
        &mut self,
        pipeline: PipelineId,
        stages: ShaderStages,
        program: Option<ProgramId>,
    );

    fn bind_pipeline(&mut self, pipeline: Option<PipelineId>);

    fn delete_pipeline(&mut self, pipeline: PipelineId);

    // Vertex array operations

    fn create_vertex_array(&mut self) -> Option<VertexArrayId>;

    fn set_vertex_attribute(
        &mut self,
        array: VertexArrayId,
        attribute: &VertexAttribute,
        buffer: BufferId,
    );

    fn bind_vertex_array(&mut self, array: Option<VertexArrayId>);

    fn delete_vertex_array(&mut self, array: VertexArrayId);

    // Output and submission

    /// Currently bound draw framebuffer; `None` is the default framebuffer.
    fn bound_framebuffer(&self) -> Option<FramebufferId>;

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>);

    fn viewport(&self) -> Viewport;

    fn set_viewport(&mut self, viewport: Viewport);

    fn apply_state(&mut self, state: RenderState);

    fn draw(&mut self, topology: PrimitiveTopology, first: u32, count: u32, instances: u32);

    fn flush(&mut self);
}
