//! Linked shader programs.
//!
//! A [`Program`] keeps the stage sources it was linked from. When its context
//! goes away it is saved as a driver program binary if the driver supports
//! them, and relinked from the kept sources otherwise.

use std::cell::RefCell;
use std::rc::Rc;

use kiln_core::error::{RenderError, Result};
use kiln_test_utils::{DriverFeatures, ProgramBinary, ProgramId, ShaderSource, ShaderStages};

use crate::context::GraphicsContext;
use crate::device::{Device, GpuHandle, ReleaseQueue};
use crate::registry::{ObjectId, RenderObject};

#[derive(Debug)]
pub struct Program {
    id: Option<ObjectId>,
    handle: Option<ProgramId>,
    separable: bool,
    instances: u32,
    sources: Vec<ShaderSource>,
    stages: ShaderStages,
    linked: bool,
    binary: Option<ProgramBinary>,
    /// Number of program maps holding this program.
    maps: usize,
    release: ReleaseQueue,
}

impl Program {
    /// Creates an empty program. `instances` of zero means non-instanced.
    pub fn new(
        context: &mut GraphicsContext,
        separable: bool,
        instances: u32,
    ) -> Result<Rc<RefCell<Program>>> {
        let device = context.device_mut();
        let handle = device
            .create_program(separable)
            .ok_or_else(|| RenderError::OutOfMemory("program".to_string()))?;

        let program = Rc::new(RefCell::new(Program {
            id: None,
            handle: Some(handle),
            separable,
            instances,
            sources: Vec::new(),
            stages: ShaderStages::empty(),
            linked: false,
            binary: None,
            maps: 0,
            release: device.release_queue(),
        }));
        match context.register(&program) {
            Ok(id) => program.borrow_mut().id = Some(id),
            Err(err) => {
                program.borrow_mut().free(context.device_mut());
                return Err(err);
            }
        }
        Ok(program)
    }

    pub fn id(&self) -> Option<ObjectId> {
        self.id
    }

    pub fn handle(&self) -> Option<ProgramId> {
        self.handle
    }

    pub fn is_separable(&self) -> bool {
        self.separable
    }

    pub fn instances(&self) -> u32 {
        self.instances
    }

    pub fn set_instances(&mut self, instances: u32) {
        self.instances = instances;
    }

    /// Number of program maps holding this program.
    pub fn map_count(&self) -> usize {
        self.maps
    }

    pub(crate) fn held_by_map(&mut self) {
        self.maps += 1;
    }

    pub(crate) fn released_by_map(&mut self) {
        self.maps = self.maps.saturating_sub(1);
    }

    pub fn stages(&self) -> ShaderStages {
        self.stages
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }

    pub fn sources(&self) -> &[ShaderSource] {
        &self.sources
    }

    /// Replaces the source of a stage. The program must be relinked after.
    pub fn attach_source(&mut self, source: ShaderSource) {
        self.sources.retain(|s| s.stage != source.stage);
        self.sources.push(source);
        self.linked = false;
    }

    /// Links the attached sources.
    pub fn link(&mut self, device: &mut Device) -> Result<()> {
        let handle = self.handle.ok_or_else(|| {
            RenderError::InvalidOperation("program has no live driver handle".to_string())
        })?;
        let stages = self
            .sources
            .iter()
            .fold(ShaderStages::empty(), |acc, s| acc | s.stage.flag());
        let missing = stages.required_features() - device.features();
        if !missing.is_empty() {
            return Err(RenderError::IncompatibleContext(format!(
                "driver lacks {missing:?} for stages {stages:?}"
            )));
        }

        self.linked = device.link_program(handle, &self.sources);
        if !self.linked {
            return Err(RenderError::InvalidOperation(format!(
                "linking program {handle:?} failed"
            )));
        }
        self.stages = stages;
        Ok(())
    }

    /// A new program in `context` with the same sources and instance count,
    /// linked there if this one is linked.
    pub fn duplicate(&self, context: &mut GraphicsContext) -> Result<Rc<RefCell<Program>>> {
        let copy = Program::new(context, self.separable, self.instances)?;
        {
            let mut program = copy.borrow_mut();
            program.sources = self.sources.clone();
            if self.linked {
                program.link(context.device_mut())?;
            }
        }
        Ok(copy)
    }

    pub fn destroy(&mut self, context: &mut GraphicsContext) {
        context.unregister(self.id);
        self.free(context.device_mut());
    }
}

impl RenderObject for Program {
    fn label(&self) -> &'static str {
        "program"
    }

    fn free(&mut self, device: &mut Device) {
        self.id = None;
        self.linked = false;
        self.binary = None;
        if let Some(handle) = self.handle.take() {
            device.delete_program(handle);
        }
    }

    fn save(&mut self, device: &mut Device) {
        self.id = None;
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.binary = if self.linked && device.features().contains(DriverFeatures::PROGRAM_BINARY) {
            device.get_program_binary(handle)
        } else {
            None
        };
        device.delete_program(handle);
    }

    fn restore(&mut self, id: ObjectId, device: &mut Device) -> Result<()> {
        let handle = device
            .create_program(self.separable)
            .ok_or_else(|| RenderError::OutOfMemory("restoring program".to_string()))?;
        self.handle = Some(handle);
        self.id = Some(id);
        self.release = device.release_queue();

        let was_linked = std::mem::take(&mut self.linked);
        if let Some(binary) = self.binary.take() {
            if device.load_program_binary(handle, &binary) {
                self.linked = true;
                return Ok(());
            }
            tracing::debug!("Program binary rejected; relinking {:?} from source", handle);
        }
        if was_linked {
            if let Err(err) = self.link(device) {
                tracing::warn!("Relinking restored program failed: {}", err);
            }
        }
        Ok(())
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.release.push(GpuHandle::Program(handle));
        }
    }
}
