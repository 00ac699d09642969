//! Program maps: per-stage programs bound as one unit.
//!
//! On drivers with [`DriverFeatures::SEPARATE_PROGRAMS`] a map owns a native
//! pipeline object and each stage slot may hold a different separable
//! program. Without it the map falls back to a single program covering all
//! stages, so only [`StageSlot::All`] assignments are accepted.
//!
//! While a map is blocked (bound for drawing) its stages cannot be changed.

use std::cell::RefCell;
use std::rc::Rc;

use kiln_core::error::{RenderError, Result};
use kiln_test_utils::{DriverFeatures, PipelineId, ShaderStage};

use crate::context::GraphicsContext;
use crate::device::{Device, GpuHandle, ReleaseQueue};
use crate::program::Program;
use crate::registry::{ObjectId, RenderObject};

/// Target of a program assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageSlot {
    Stage(ShaderStage),
    /// Every stage at once.
    All,
}

impl From<ShaderStage> for StageSlot {
    fn from(stage: ShaderStage) -> Self {
        StageSlot::Stage(stage)
    }
}

pub struct ProgramMap {
    id: Option<ObjectId>,
    programs: [Option<Rc<RefCell<Program>>>; ShaderStage::COUNT],
    blocks: u32,
    /// Native pipeline mode; fixed at creation.
    separate: bool,
    pipeline: Option<PipelineId>,
    /// Stage programs must be re-attached to the pipeline before binding.
    dirty: bool,
    release: ReleaseQueue,
}

impl ProgramMap {
    pub fn new(context: &mut GraphicsContext) -> Result<Rc<RefCell<ProgramMap>>> {
        let separate = context.features().contains(DriverFeatures::SEPARATE_PROGRAMS);
        let device = context.device_mut();
        let pipeline = if separate {
            Some(
                device
                    .create_pipeline()
                    .ok_or_else(|| RenderError::OutOfMemory("program pipeline".to_string()))?,
            )
        } else {
            None
        };

        let map = Rc::new(RefCell::new(ProgramMap {
            id: None,
            programs: Default::default(),
            blocks: 0,
            separate,
            pipeline,
            dirty: true,
            release: device.release_queue(),
        }));
        match context.register(&map) {
            Ok(id) => map.borrow_mut().id = Some(id),
            Err(err) => {
                map.borrow_mut().free(context.device_mut());
                return Err(err);
            }
        }
        Ok(map)
    }

    pub fn id(&self) -> Option<ObjectId> {
        self.id
    }

    /// Whether the map drives a native pipeline rather than one program.
    pub fn is_separate(&self) -> bool {
        self.separate
    }

    /// Effective instance count: the smallest non-zero count among the held
    /// programs, or 0 (non-instanced) when none is constrained.
    pub fn instances(&self) -> u32 {
        self.programs
            .iter()
            .flatten()
            .map(|p| p.borrow().instances())
            .filter(|&instances| instances != 0)
            .min()
            .unwrap_or(0)
    }

    pub fn blocks(&self) -> u32 {
        self.blocks
    }

    pub fn is_blocked(&self) -> bool {
        self.blocks > 0
    }

    pub fn program(&self, stage: ShaderStage) -> Option<&Rc<RefCell<Program>>> {
        self.programs[stage.index()].as_ref()
    }

    /// Distinct programs held by the map, in stage order.
    pub fn programs(&self) -> Vec<Rc<RefCell<Program>>> {
        let mut distinct: Vec<Rc<RefCell<Program>>> = Vec::new();
        for program in self.programs.iter().flatten() {
            if !distinct.iter().any(|p| Rc::ptr_eq(p, program)) {
                distinct.push(program.clone());
            }
        }
        distinct
    }

    /// Creates a program and assigns it to `slot`.
    pub fn add(
        &mut self,
        context: &mut GraphicsContext,
        slot: impl Into<StageSlot>,
        instances: u32,
    ) -> Result<Rc<RefCell<Program>>> {
        let slot = slot.into();
        self.check_assignable(context.features(), slot)?;
        let program = Program::new(context, self.separate, instances)?;
        self.assign(slot, program.clone());
        Ok(program)
    }

    /// Assigns an existing program to `slot`, sharing it with its other users.
    pub fn add_share(
        &mut self,
        features: DriverFeatures,
        slot: impl Into<StageSlot>,
        program: Rc<RefCell<Program>>,
    ) -> Result<()> {
        let slot = slot.into();
        self.check_assignable(features, slot)?;
        if program.borrow().is_separable() != self.separate {
            return Err(RenderError::IncompatibleContext(
                "program separability does not match the map".to_string(),
            ));
        }
        self.assign(slot, program);
        Ok(())
    }

    fn check_assignable(&self, features: DriverFeatures, slot: StageSlot) -> Result<()> {
        if self.is_blocked() {
            return Err(RenderError::InvalidOperation(
                "program map is blocked for drawing".to_string(),
            ));
        }
        match slot {
            StageSlot::All => Ok(()),
            StageSlot::Stage(_) if !self.separate => Err(RenderError::IncompatibleContext(
                "driver has no separate programs; only whole-map assignment is possible"
                    .to_string(),
            )),
            StageSlot::Stage(stage) if !features.contains(stage.required_feature()) => {
                Err(RenderError::IncompatibleContext(format!(
                    "{stage:?} stage is not supported by the driver"
                )))
            }
            StageSlot::Stage(_) => Ok(()),
        }
    }

    fn assign(&mut self, slot: StageSlot, program: Rc<RefCell<Program>>) {
        let before = self.programs();
        match slot {
            StageSlot::All => {
                for entry in &mut self.programs {
                    *entry = Some(program.clone());
                }
            }
            StageSlot::Stage(stage) => self.programs[stage.index()] = Some(program),
        }
        self.recount(&before);
        self.dirty = true;
    }

    /// Puts `replacement` into every slot holding `program`.
    pub(crate) fn replace_program(
        &mut self,
        program: &Rc<RefCell<Program>>,
        replacement: &Rc<RefCell<Program>>,
    ) {
        let before = self.programs();
        for entry in self.programs.iter_mut().flatten() {
            if Rc::ptr_eq(entry, program) {
                *entry = replacement.clone();
            }
        }
        self.recount(&before);
        self.dirty = true;
    }

    /// Updates the map counts of programs gained or lost since `before`.
    fn recount(&self, before: &[Rc<RefCell<Program>>]) {
        let after = self.programs();
        for program in before {
            if !after.iter().any(|p| Rc::ptr_eq(p, program)) {
                program.borrow_mut().released_by_map();
            }
        }
        for program in &after {
            if !before.iter().any(|p| Rc::ptr_eq(p, program)) {
                program.borrow_mut().held_by_map();
            }
        }
    }

    /// Marks the map as in use, binding it on the first block.
    ///
    /// Fails when a held program is not linked, and with `Overflow` when the
    /// block counter is saturated.
    pub fn block(&mut self, device: &mut Device) -> Result<()> {
        if self.blocks == u32::MAX {
            return Err(RenderError::Overflow("program map block count".to_string()));
        }
        if self.blocks == 0 {
            self.bind(device)?;
        }
        self.blocks += 1;
        Ok(())
    }

    /// Releases one block; the map is unbound when the last one goes.
    pub fn unblock(&mut self, device: &mut Device) -> Result<()> {
        if self.blocks == 0 {
            return Err(RenderError::InvalidOperation(
                "program map is not blocked".to_string(),
            ));
        }
        self.blocks -= 1;
        if self.blocks == 0 {
            if self.separate {
                device.bind_pipeline(None);
            } else {
                device.use_program(None);
            }
        }
        Ok(())
    }

    fn bind(&mut self, device: &mut Device) -> Result<()> {
        let programs = self.programs();
        if programs.is_empty() {
            return Err(RenderError::InvalidOperation(
                "program map has no programs".to_string(),
            ));
        }
        let mut handles = Vec::with_capacity(programs.len());
        for program in &programs {
            let program = program.borrow();
            match program.handle() {
                Some(handle) if program.is_linked() => handles.push(handle),
                _ => {
                    return Err(RenderError::InvalidOperation(
                        "program map holds a program that is not linked".to_string(),
                    ));
                }
            }
        }

        if !self.separate {
            device.use_program(Some(handles[0]));
            return Ok(());
        }

        let pipeline = self.pipeline.ok_or_else(|| {
            RenderError::InvalidOperation("program map has no live pipeline".to_string())
        })?;
        if self.dirty {
            for stage in ShaderStage::ALL {
                let handle = self.programs[stage.index()]
                    .as_ref()
                    .and_then(|p| p.borrow().handle());
                device.use_program_stages(pipeline, stage.flag(), handle);
            }
            self.dirty = false;
        }
        device.bind_pipeline(Some(pipeline));
        Ok(())
    }

    pub fn destroy(&mut self, context: &mut GraphicsContext) {
        context.unregister(self.id);
        self.free(context.device_mut());
    }
}

impl RenderObject for ProgramMap {
    fn label(&self) -> &'static str {
        "program map"
    }

    fn free(&mut self, device: &mut Device) {
        self.id = None;
        self.blocks = 0;
        self.dirty = true;
        if let Some(pipeline) = self.pipeline.take() {
            device.delete_pipeline(pipeline);
        }
    }

    fn save(&mut self, device: &mut Device) {
        self.free(device);
    }

    fn restore(&mut self, id: ObjectId, device: &mut Device) -> Result<()> {
        if self.separate {
            if !device.features().contains(DriverFeatures::SEPARATE_PROGRAMS) {
                return Err(RenderError::IncompatibleContext(
                    "program map needs separate programs".to_string(),
                ));
            }
            let pipeline = device
                .create_pipeline()
                .ok_or_else(|| RenderError::OutOfMemory("restoring program pipeline".to_string()))?;
            self.pipeline = Some(pipeline);
        }
        self.id = Some(id);
        self.dirty = true;
        self.release = device.release_queue();
        Ok(())
    }
}

impl Drop for ProgramMap {
    fn drop(&mut self) {
        for program in self.programs() {
            if let Ok(mut program) = program.try_borrow_mut() {
                program.released_by_map();
            }
        }
        if let Some(pipeline) = self.pipeline.take() {
            self.release.push(GpuHandle::Pipeline(pipeline));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ContainerId;
    use kiln_core::ErrorCode;
    use kiln_test_utils::{MockDriver, ShaderSource, WindowId};

    fn context(mock: &MockDriver) -> GraphicsContext {
        GraphicsContext::new(
            ContainerId::new(1).unwrap(),
            WindowId::new(1),
            Device::new(Box::new(mock.clone())),
        )
    }

    fn link(program: &Rc<RefCell<Program>>, ctx: &mut GraphicsContext, stage: ShaderStage) {
        let mut program = program.borrow_mut();
        program.attach_source(ShaderSource::new(stage, "main"));
        program.link(ctx.device_mut()).unwrap();
    }

    #[test]
    fn test_instance_count_ignores_zero() {
        let mock = MockDriver::new();
        let mut ctx = context(&mock);
        let map = ProgramMap::new(&mut ctx).unwrap();
        let mut map = map.borrow_mut();

        map.add(&mut ctx, ShaderStage::Vertex, 4).unwrap();
        map.add(&mut ctx, ShaderStage::Fragment, 0).unwrap();
        assert_eq!(map.instances(), 4);

        map.add(&mut ctx, ShaderStage::Geometry, 2).unwrap();
        assert_eq!(map.instances(), 2);
    }

    #[test]
    fn test_instance_count_follows_program_changes() {
        let mock = MockDriver::new();
        let mut ctx = context(&mock);
        let map = ProgramMap::new(&mut ctx).unwrap();
        let mut map = map.borrow_mut();

        let vertex = map.add(&mut ctx, ShaderStage::Vertex, 4).unwrap();
        let fragment = map.add(&mut ctx, ShaderStage::Fragment, 0).unwrap();
        assert_eq!(map.instances(), 4);

        vertex.borrow_mut().set_instances(2);
        assert_eq!(map.instances(), 2);

        fragment.borrow_mut().set_instances(1);
        assert_eq!(map.instances(), 1);

        vertex.borrow_mut().set_instances(0);
        fragment.borrow_mut().set_instances(0);
        assert_eq!(map.instances(), 0);
    }

    #[test]
    fn test_program_map_counts() {
        let mock = MockDriver::new();
        let mut ctx = context(&mock);
        let first = ProgramMap::new(&mut ctx).unwrap();
        let second = ProgramMap::new(&mut ctx).unwrap();

        let program = first
            .borrow_mut()
            .add(&mut ctx, ShaderStage::Vertex, 0)
            .unwrap();
        first
            .borrow_mut()
            .add_share(ctx.features(), ShaderStage::Fragment, program.clone())
            .unwrap();
        assert_eq!(program.borrow().map_count(), 1);

        second
            .borrow_mut()
            .add_share(ctx.features(), StageSlot::All, program.clone())
            .unwrap();
        assert_eq!(program.borrow().map_count(), 2);

        first.borrow_mut().add(&mut ctx, StageSlot::All, 0).unwrap();
        assert_eq!(program.borrow().map_count(), 1);

        drop(second);
        assert_eq!(program.borrow().map_count(), 0);
    }

    #[test]
    fn test_all_takes_program_count() {
        let mock = MockDriver::new();
        let mut ctx = context(&mock);
        let map = ProgramMap::new(&mut ctx).unwrap();
        let mut map = map.borrow_mut();

        map.add(&mut ctx, ShaderStage::Vertex, 2).unwrap();
        map.add(&mut ctx, StageSlot::All, 0).unwrap();
        assert_eq!(map.instances(), 0);
        assert_eq!(map.programs().len(), 1);
    }

    #[test]
    fn test_block_binds_once() {
        let mock = MockDriver::new();
        let mut ctx = context(&mock);
        let map = ProgramMap::new(&mut ctx).unwrap();
        let mut map = map.borrow_mut();
        let program = map.add(&mut ctx, ShaderStage::Vertex, 0).unwrap();
        link(&program, &mut ctx, ShaderStage::Vertex);

        map.block(ctx.device_mut()).unwrap();
        map.block(ctx.device_mut()).unwrap();
        assert_eq!(map.blocks(), 2);
        assert_eq!(mock.count_pipeline_binds(), 1);

        let err = map.add(&mut ctx, ShaderStage::Fragment, 0).err().unwrap();
        assert_eq!(err.code(), ErrorCode::InvalidOperation);

        map.unblock(ctx.device_mut()).unwrap();
        map.unblock(ctx.device_mut()).unwrap();
        assert!(map.unblock(ctx.device_mut()).is_err());
    }

    #[test]
    fn test_block_requires_linked_programs() {
        let mock = MockDriver::new();
        let mut ctx = context(&mock);
        let map = ProgramMap::new(&mut ctx).unwrap();
        let mut map = map.borrow_mut();
        map.add(&mut ctx, ShaderStage::Vertex, 0).unwrap();

        assert!(map.block(ctx.device_mut()).is_err());
        assert_eq!(map.blocks(), 0);
    }

    #[test]
    fn test_block_overflow() {
        let mock = MockDriver::new();
        let mut ctx = context(&mock);
        let map = ProgramMap::new(&mut ctx).unwrap();
        let mut map = map.borrow_mut();
        map.blocks = u32::MAX;

        let err = map.block(ctx.device_mut()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Overflow);
    }

    #[test]
    fn test_fallback_accepts_only_all() {
        let mock = MockDriver::with_features(DriverFeatures::empty());
        let mut ctx = context(&mock);
        let map = ProgramMap::new(&mut ctx).unwrap();
        let mut map = map.borrow_mut();
        assert!(!map.is_separate());

        let err = map.add(&mut ctx, ShaderStage::Vertex, 0).err().unwrap();
        assert_eq!(err.code(), ErrorCode::IncompatibleContext);

        let program = map.add(&mut ctx, StageSlot::All, 3).unwrap();
        link(&program, &mut ctx, ShaderStage::Vertex);
        map.block(ctx.device_mut()).unwrap();
        assert_eq!(mock.count_program_uses(), 1);
        assert_eq!(mock.count_pipeline_binds(), 0);
    }

    #[test]
    fn test_unsupported_stage() {
        let mock = MockDriver::with_features(DriverFeatures::SEPARATE_PROGRAMS);
        let mut ctx = context(&mock);
        let map = ProgramMap::new(&mut ctx).unwrap();

        let err = map
            .borrow_mut()
            .add(&mut ctx, ShaderStage::TessControl, 0)
            .err()
            .unwrap();
        assert_eq!(err.code(), ErrorCode::IncompatibleContext);
    }

    #[test]
    fn test_share_program_between_maps() {
        let mock = MockDriver::new();
        let mut ctx = context(&mock);
        let first = ProgramMap::new(&mut ctx).unwrap();
        let second = ProgramMap::new(&mut ctx).unwrap();
        let program = first
            .borrow_mut()
            .add(&mut ctx, ShaderStage::Fragment, 0)
            .unwrap();

        second
            .borrow_mut()
            .add_share(ctx.features(), ShaderStage::Fragment, program.clone())
            .unwrap();
        assert_eq!(Rc::strong_count(&program), 3);
    }
}
