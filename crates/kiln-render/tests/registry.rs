//! Registry save/restore tests across contexts.
//!
//! These tests verify that a save sweep releases every GPU handle, and that
//! restoring into another context rebuilds the objects under its container.

use kiln_render::{Buffer, ContextManager, ProgramMap, StageSlot, VertexLayout};
use kiln_test_utils::{
    BufferUsages, DriverFeatures, MockWindowSystem, ShaderSource, ShaderStage, VertexAttribute,
    VertexFormat, WindowDescriptor, WindowId,
};

fn two_windows(windows: &MockWindowSystem) -> (ContextManager, WindowId, WindowId) {
    let mut contexts = ContextManager::new(Box::new(windows.clone()));
    let a = contexts.create_window(&WindowDescriptor::default()).unwrap();
    let b = contexts.create_window(&WindowDescriptor::default()).unwrap();
    (contexts, a, b)
}

#[test]
fn test_round_trip_rescopes_ids() {
    let windows = MockWindowSystem::new();
    let (mut contexts, a, b) = two_windows(&windows);

    let context = contexts.get_mut(a).unwrap();
    let buffer = Buffer::new(context, 8, BufferUsages::VERTEX, Some(&[1, 2, 3, 4, 5, 6, 7, 8])).unwrap();
    let layout = VertexLayout::new(context).unwrap();
    layout.borrow_mut().add_attribute(
        VertexAttribute {
            location: 1,
            format: VertexFormat::Float32x2,
            offset: 0,
            stride: 8,
            divisor: 0,
        },
        buffer.clone(),
        0,
    );

    let saved = context.save_all().unwrap();
    assert_eq!(saved.len(), 2);
    assert!(buffer.borrow().handle().is_none());
    assert!(buffer.borrow().id().is_none());
    assert!(layout.borrow().handle().is_none());
    assert_eq!(windows.driver(a).unwrap().live_buffers(), 0);

    let target = contexts.get_mut(b).unwrap();
    target.restore_all(saved).unwrap();
    let container = target.id();

    let buffer = buffer.borrow();
    assert!(buffer.handle().is_some());
    assert_eq!(buffer.id().map(|id| id.container()), Some(container));
    assert_eq!(layout.borrow().id().map(|id| id.container()), Some(container));
    assert_eq!(target.registry().len(), 2);

    let driver = windows.driver(b).unwrap();
    assert_eq!(
        driver.buffer_contents(buffer.handle().unwrap()),
        Some(vec![1, 2, 3, 4, 5, 6, 7, 8])
    );
}

#[test]
fn test_restored_layout_reissues_attributes() {
    let windows = MockWindowSystem::new();
    let (mut contexts, a, b) = two_windows(&windows);

    let context = contexts.get_mut(a).unwrap();
    let buffer = Buffer::new(context, 64, BufferUsages::VERTEX, None).unwrap();
    let layout = VertexLayout::new(context).unwrap();
    layout.borrow_mut().add_attribute(
        VertexAttribute {
            location: 0,
            format: VertexFormat::Float32x4,
            offset: 0,
            stride: 16,
            divisor: 0,
        },
        buffer,
        16,
    );
    layout.borrow_mut().bind(context.device_mut()).unwrap();
    let saved = context.save_all().unwrap();

    // Restore order is irrelevant: the layout is restored before its buffer.
    let target = contexts.get_mut(b).unwrap();
    let mut saved = saved;
    saved.reverse();
    target.restore_all(saved).unwrap();

    let driver = windows.driver(b).unwrap();
    driver.clear_calls();
    layout.borrow_mut().bind(target.device_mut()).unwrap();
    assert_eq!(
        driver.count_calls(|c| matches!(c, kiln_test_utils::DriverCall::SetVertexAttribute { location: 0, .. })),
        1
    );
}

#[test]
fn test_program_relinks_without_binary_support() {
    let windows = MockWindowSystem::with_features(DriverFeatures::SEPARATE_PROGRAMS);
    let (mut contexts, a, b) = two_windows(&windows);

    let context = contexts.get_mut(a).unwrap();
    let map = ProgramMap::new(context).unwrap();
    let program = map
        .borrow_mut()
        .add(context, StageSlot::All, 3)
        .unwrap();
    {
        let mut program = program.borrow_mut();
        program.attach_source(ShaderSource::new(ShaderStage::Vertex, "v"));
        program.attach_source(ShaderSource::new(ShaderStage::Fragment, "f"));
        program.link(context.device_mut()).unwrap();
    }
    let saved = context.save_all().unwrap();
    assert!(program.borrow().handle().is_none());

    let target = contexts.get_mut(b).unwrap();
    target.restore_all(saved).unwrap();

    let program = program.borrow();
    assert!(program.is_linked());
    let driver = windows.driver(b).unwrap();
    assert!(driver.is_program_linked(program.handle().unwrap()));
    assert_eq!(map.borrow().instances(), 3);
    map.borrow_mut().block(target.device_mut()).unwrap();
    map.borrow_mut().unblock(target.device_mut()).unwrap();
}

#[test]
fn test_dropped_objects_are_skipped_by_the_sweep() {
    let windows = MockWindowSystem::new();
    let (mut contexts, a, _) = two_windows(&windows);

    let context = contexts.get_mut(a).unwrap();
    let kept = Buffer::new(context, 4, BufferUsages::INDEX, None).unwrap();
    let dropped = Buffer::new(context, 4, BufferUsages::INDEX, None).unwrap();
    drop(dropped);

    let saved = context.save_all().unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(windows.driver(a).unwrap().live_buffers(), 0);
    drop(kept);
}
