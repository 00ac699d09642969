//! Property maps: uniform values uploaded to a program map before a draw.
//!
//! A map holds a fixed number of copies, so one map can parameterize several
//! draws (one pipe process per copy, for example) with different values.

use kiln_core::error::{RenderError, Result};
use kiln_test_utils::PropertyValue;

use crate::device::Device;
use crate::program_map::ProgramMap;

#[derive(Debug, Clone, Default, PartialEq)]
struct PropertyBlock {
    /// Sorted by location.
    values: Vec<(u32, PropertyValue)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyMap {
    copies: Vec<PropertyBlock>,
}

impl PropertyMap {
    /// Map with `copies` independent value sets (at least one).
    pub fn new(copies: usize) -> Self {
        Self {
            copies: vec![PropertyBlock::default(); copies.max(1)],
        }
    }

    pub fn copies(&self) -> usize {
        self.copies.len()
    }

    pub fn set(&mut self, copy: usize, location: u32, value: PropertyValue) -> Result<()> {
        let block = self.block_mut(copy)?;
        match block.values.binary_search_by_key(&location, |(l, _)| *l) {
            Ok(index) => block.values[index].1 = value,
            Err(index) => block.values.insert(index, (location, value)),
        }
        Ok(())
    }

    pub fn get(&self, copy: usize, location: u32) -> Option<PropertyValue> {
        let block = self.copies.get(copy)?;
        block
            .values
            .binary_search_by_key(&location, |(l, _)| *l)
            .ok()
            .map(|index| block.values[index].1)
    }

    pub fn remove(&mut self, copy: usize, location: u32) -> Result<Option<PropertyValue>> {
        let block = self.block_mut(copy)?;
        Ok(block
            .values
            .binary_search_by_key(&location, |(l, _)| *l)
            .ok()
            .map(|index| block.values.remove(index).1))
    }

    /// Number of values in one copy.
    pub fn len(&self, copy: usize) -> usize {
        self.copies.get(copy).map_or(0, |block| block.values.len())
    }

    /// Uploads one copy to every program of `map`.
    pub fn apply(&self, copy: usize, map: &ProgramMap, device: &mut Device) -> Result<()> {
        let block = self.copies.get(copy).ok_or_else(|| out_of_range(copy, self.copies.len()))?;
        for program in map.programs() {
            let Some(handle) = program.borrow().handle() else {
                continue;
            };
            for (location, value) in &block.values {
                device.set_uniform(handle, *location, value);
            }
        }
        Ok(())
    }

    fn block_mut(&mut self, copy: usize) -> Result<&mut PropertyBlock> {
        let copies = self.copies.len();
        self.copies.get_mut(copy).ok_or_else(|| out_of_range(copy, copies))
    }
}

fn out_of_range(copy: usize, copies: usize) -> RenderError {
    RenderError::InvalidOperation(format!(
        "property copy {copy} out of range ({copies} copies)"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::GraphicsContext;
    use crate::registry::ContainerId;
    use kiln_test_utils::{DriverCall, MockDriver, ShaderStage, WindowId};

    #[test]
    fn test_set_get_replace() {
        let mut properties = PropertyMap::new(2);
        properties.set(1, 3, PropertyValue::Float(1.0)).unwrap();
        properties.set(1, 0, PropertyValue::Int(7)).unwrap();
        properties.set(1, 3, PropertyValue::Float(2.0)).unwrap();

        assert_eq!(properties.get(1, 3), Some(PropertyValue::Float(2.0)));
        assert_eq!(properties.get(0, 3), None);
        assert_eq!(properties.len(1), 2);
        assert_eq!(properties.remove(1, 0).unwrap(), Some(PropertyValue::Int(7)));
    }

    #[test]
    fn test_copy_out_of_range() {
        let mut properties = PropertyMap::new(1);
        assert!(properties.set(1, 0, PropertyValue::UInt(1)).is_err());
        assert_eq!(PropertyMap::new(0).copies(), 1);
    }

    #[test]
    fn test_apply_uploads_to_each_program_once() {
        let mock = MockDriver::new();
        let mut ctx = GraphicsContext::new(
            ContainerId::new(1).unwrap(),
            WindowId::new(1),
            Device::new(Box::new(mock.clone())),
        );
        let map = ProgramMap::new(&mut ctx).unwrap();
        map.borrow_mut().add(&mut ctx, ShaderStage::Vertex, 0).unwrap();
        map.borrow_mut().add(&mut ctx, ShaderStage::Fragment, 0).unwrap();

        let mut properties = PropertyMap::new(1);
        properties.set(0, 2, PropertyValue::Vec2([0.5, 0.5])).unwrap();
        properties.apply(0, &map.borrow(), ctx.device_mut()).unwrap();

        let uploads = mock.count_calls(|c| matches!(c, DriverCall::SetUniform { location: 2, .. }));
        assert_eq!(uploads, 2);
    }
}
