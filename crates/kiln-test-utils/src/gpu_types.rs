//! Handle and value types exchanged with a [`GraphicsDriver`](crate::GraphicsDriver).
//!
//! Handles are non-zero integers so `Option<Handle>` doubles as the
//! "no object" / "torn down" state without a sentinel value.

use std::num::NonZeroU32;

use bitflags::bitflags;

pub use wgpu::{BufferUsages, MapMode, PrimitiveTopology, VertexFormat};

macro_rules! gpu_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(NonZeroU32);

        impl $name {
            /// Wraps a raw driver name; zero is the null object and yields `None`.
            pub fn new(raw: u32) -> Option<Self> {
                NonZeroU32::new(raw).map(Self)
            }

            pub fn get(self) -> u32 {
                self.0.get()
            }
        }
    };
}

gpu_handle!(
    /// Driver name of a buffer object.
    BufferId
);
gpu_handle!(
    /// Driver name of a linked (or linkable) program.
    ProgramId
);
gpu_handle!(
    /// Driver name of a separable program pipeline.
    PipelineId
);
gpu_handle!(
    /// Driver name of a vertex array object.
    VertexArrayId
);
gpu_handle!(
    /// Driver name of a framebuffer; the default framebuffer is `None`.
    FramebufferId
);

bitflags! {
    /// Optional driver capabilities the core adapts to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DriverFeatures: u32 {
        /// Program pipeline objects with per-stage separable programs.
        const SEPARATE_PROGRAMS = 1 << 0;
        /// Retrieval and upload of linked program binaries.
        const PROGRAM_BINARY = 1 << 1;
        /// Tessellation control and evaluation stages.
        const TESSELLATION_SHADER = 1 << 2;
        /// Geometry stage.
        const GEOMETRY_SHADER = 1 << 3;
        /// Instanced draw calls.
        const INSTANCED_DRAW = 1 << 4;
    }
}

/// A single programmable stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    TessControl,
    TessEvaluation,
    Geometry,
    Fragment,
}

impl ShaderStage {
    pub const COUNT: usize = 5;

    pub const ALL: [ShaderStage; Self::COUNT] = [
        ShaderStage::Vertex,
        ShaderStage::TessControl,
        ShaderStage::TessEvaluation,
        ShaderStage::Geometry,
        ShaderStage::Fragment,
    ];

    /// Position of the stage in pipeline order.
    pub fn index(self) -> usize {
        match self {
            ShaderStage::Vertex => 0,
            ShaderStage::TessControl => 1,
            ShaderStage::TessEvaluation => 2,
            ShaderStage::Geometry => 3,
            ShaderStage::Fragment => 4,
        }
    }

    pub fn flag(self) -> ShaderStages {
        match self {
            ShaderStage::Vertex => ShaderStages::VERTEX,
            ShaderStage::TessControl => ShaderStages::TESS_CONTROL,
            ShaderStage::TessEvaluation => ShaderStages::TESS_EVALUATION,
            ShaderStage::Geometry => ShaderStages::GEOMETRY,
            ShaderStage::Fragment => ShaderStages::FRAGMENT,
        }
    }

    /// Driver feature needed before this stage can be used at all.
    pub fn required_feature(self) -> DriverFeatures {
        match self {
            ShaderStage::TessControl | ShaderStage::TessEvaluation => {
                DriverFeatures::TESSELLATION_SHADER
            }
            ShaderStage::Geometry => DriverFeatures::GEOMETRY_SHADER,
            ShaderStage::Vertex | ShaderStage::Fragment => DriverFeatures::empty(),
        }
    }
}

bitflags! {
    /// Set of programmable stages.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u8 {
        const VERTEX = 1 << 0;
        const TESS_CONTROL = 1 << 1;
        const TESS_EVALUATION = 1 << 2;
        const GEOMETRY = 1 << 3;
        const FRAGMENT = 1 << 4;
    }
}

impl ShaderStages {
    /// Iterates the individual stages in pipeline order.
    pub fn stages(self) -> impl Iterator<Item = ShaderStage> {
        ShaderStage::ALL
            .into_iter()
            .filter(move |stage| self.contains(stage.flag()))
    }

    /// Driver features needed for every stage in the set.
    pub fn required_features(self) -> DriverFeatures {
        self.stages()
            .fold(DriverFeatures::empty(), |acc, stage| acc | stage.required_feature())
    }
}

/// Source for one stage, handed to the driver untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSource {
    pub stage: ShaderStage,
    pub source: String,
}

impl ShaderSource {
    pub fn new(stage: ShaderStage, source: impl Into<String>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }
}

/// Opaque linked program; `format` is driver-defined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramBinary {
    pub format: u32,
    pub data: Vec<u8>,
}

/// One vertex attribute sourced from a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u64,
    pub stride: u64,
    /// Instances per attribute advance; 0 advances per vertex.
    pub divisor: u32,
}

/// A value that can be uploaded to a program uniform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropertyValue {
    Float(f32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    Mat4([f32; 16]),
    Int(i32),
    UInt(u32),
}

bitflags! {
    /// Fixed-function state toggled around a draw.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RenderState: u32 {
        const DEPTH_TEST = 1 << 0;
        const DEPTH_WRITE = 1 << 1;
        const BLEND = 1 << 2;
        const CULL_FACE = 1 << 3;
        const STENCIL_TEST = 1 << 4;
    }
}
