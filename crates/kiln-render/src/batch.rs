//! Draw batches: buckets of draw units submitted in key order.

use std::cell::RefCell;
use std::rc::Rc;

use kiln_core::error::Result;
use kiln_core::profiling::{profile_function, profile_scope};
use kiln_test_utils::PrimitiveTopology;

use crate::bucket::{Bucket, UnitId};
use crate::device::Device;
use crate::layout::VertexLayout;
use crate::program_map::ProgramMap;
use crate::property::PropertyMap;

/// One draw call.
#[derive(Clone)]
pub struct DrawUnit {
    pub layout: Rc<RefCell<VertexLayout>>,
    pub map: Rc<RefCell<ProgramMap>>,
    /// Property map and the copy to upload before drawing.
    pub properties: Option<(Rc<RefCell<PropertyMap>>, usize)>,
    pub topology: PrimitiveTopology,
    pub first: u32,
    pub count: u32,
    /// Instance override; 0 uses the program map's instance count.
    pub instances: u32,
    pub visible: bool,
}

impl DrawUnit {
    pub fn new(
        layout: Rc<RefCell<VertexLayout>>,
        map: Rc<RefCell<ProgramMap>>,
        topology: PrimitiveTopology,
        count: u32,
    ) -> Self {
        Self {
            layout,
            map,
            properties: None,
            topology,
            first: 0,
            count,
            instances: 0,
            visible: true,
        }
    }

    pub fn with_properties(mut self, properties: Rc<RefCell<PropertyMap>>, copy: usize) -> Self {
        self.properties = Some((properties, copy));
        self
    }

    pub fn with_instances(mut self, instances: u32) -> Self {
        self.instances = instances;
        self
    }
}

/// Counters of one [`DrawBatch::submit`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitStats {
    pub draw_calls: usize,
    pub map_binds: usize,
    pub skipped: usize,
}

/// A bucket of draw units.
///
/// ```ignore
/// let mut batch = DrawBatch::new(16);
/// batch.insert(DrawUnit::new(layout, map, PrimitiveTopology::TriangleList, 6), program_key)?;
/// let stats = batch.submit(context.device_mut())?;
/// ```
pub struct DrawBatch {
    bucket: Bucket<DrawUnit>,
}

impl DrawBatch {
    pub fn new(bits: u32) -> Self {
        Self {
            bucket: Bucket::new(bits),
        }
    }

    pub fn insert(&mut self, unit: DrawUnit, key: u64) -> Result<UnitId> {
        self.bucket.insert(unit, key)
    }

    pub fn erase(&mut self, unit: UnitId) -> Option<DrawUnit> {
        self.bucket.erase(unit)
    }

    pub fn set_visible(&mut self, unit: UnitId, visible: bool) -> bool {
        match self.bucket.get_mut(unit) {
            Some(unit) => {
                unit.visible = visible;
                true
            }
            None => false,
        }
    }

    pub fn bucket(&self) -> &Bucket<DrawUnit> {
        &self.bucket
    }

    pub fn len(&self) -> usize {
        self.bucket.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bucket.is_empty()
    }

    pub fn clear(&mut self) {
        self.bucket.clear();
    }

    /// Sorts the batch and draws every visible unit in key order. Consecutive
    /// units sharing a program map bind it once.
    pub fn submit(&mut self, device: &mut Device) -> Result<SubmitStats> {
        profile_function!();
        let mut stats = SubmitStats::default();
        let mut bound = None;

        self.bucket.process();
        let drawn = draw_units(&self.bucket, device, &mut bound, &mut stats);

        // The last map stays blocked until here, even when a draw failed.
        if let Some(map) = bound {
            let unblocked = map.borrow_mut().unblock(device);
            drawn.and(unblocked)?;
        } else {
            drawn?;
        }
        Ok(stats)
    }
}

fn draw_units(
    bucket: &Bucket<DrawUnit>,
    device: &mut Device,
    bound: &mut Option<Rc<RefCell<ProgramMap>>>,
    stats: &mut SubmitStats,
) -> Result<()> {
    for (_, unit) in bucket.iter() {
        if !unit.visible || unit.count == 0 {
            stats.skipped += 1;
            continue;
        }
        profile_scope!("draw_unit");

        if !bound.as_ref().is_some_and(|map| Rc::ptr_eq(map, &unit.map)) {
            if let Some(previous) = bound.take() {
                previous.borrow_mut().unblock(device)?;
            }
            unit.map.borrow_mut().block(device)?;
            *bound = Some(unit.map.clone());
            stats.map_binds += 1;
        }

        let map = unit.map.borrow();
        if let Some((properties, copy)) = &unit.properties {
            properties.borrow().apply(*copy, &map, device)?;
        }
        let instances = if unit.instances != 0 {
            unit.instances
        } else {
            map.instances()
        };

        let mut layout = unit.layout.borrow_mut();
        layout.bind(device)?;
        device.draw(unit.topology, unit.first, unit.count, instances.max(1));
        layout.unbind(device);
        stats.draw_calls += 1;
    }
    Ok(())
}
