//! Render-object registry.
//!
//! Every GPU-backed object registers itself with the context it was created
//! in. The registry holds only weak references: owners keep objects alive,
//! the registry just knows how to reach them when the context is lost,
//! retargeted or torn down.
//!
//! # Sweeps
//!
//! Sweeps snapshot the live registrations (in registration order) before
//! calling into any object, so objects may register or unregister other
//! objects while a sweep is running.

use std::cell::RefCell;
use std::fmt;
use std::num::NonZeroU32;
use std::rc::{Rc, Weak};

use kiln_core::alloc::{IndexSlot, SlotArena};
use kiln_core::error::{RenderError, Result};

use crate::device::Device;

/// Identifies the container (graphics context) a registration lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContainerId(NonZeroU32);

impl ContainerId {
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Container-scoped id of a registered object.
///
/// An id is only meaningful to the registry of its container; a stale id
/// (its registration removed) is rejected even if the slot was reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId {
    container: ContainerId,
    slot: IndexSlot,
}

impl ObjectId {
    pub fn container(&self) -> ContainerId {
        self.container
    }

    pub fn slot(&self) -> IndexSlot {
        self.slot
    }
}

/// A GPU-backed resource that can follow its context through loss and
/// recreation.
pub trait RenderObject {
    /// Short name used in log output.
    fn label(&self) -> &'static str;

    /// Releases the driver handles for good. The object stays usable as a
    /// plain value but is no longer registered anywhere.
    fn free(&mut self, device: &mut Device);

    /// Releases the driver handles while keeping enough state to rebuild
    /// them in another context.
    fn save(&mut self, device: &mut Device);

    /// Rebuilds the driver handles on `device` after re-registration as `id`.
    fn restore(&mut self, id: ObjectId, device: &mut Device) -> Result<()>;
}

pub type SharedObject = Rc<RefCell<dyn RenderObject>>;

/// An object taken out of a registry by a save sweep, waiting for restore.
pub struct DetachedObject {
    object: SharedObject,
}

impl DetachedObject {
    pub fn object(&self) -> &SharedObject {
        &self.object
    }

    pub fn label(&self) -> &'static str {
        self.object
            .try_borrow()
            .map(|object| object.label())
            .unwrap_or("object")
    }
}

impl fmt::Debug for DetachedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetachedObject")
            .field("label", &self.label())
            .finish()
    }
}

struct Registration {
    object: Weak<RefCell<dyn RenderObject>>,
    seq: u64,
}

/// Weak index of the render objects living in one container.
pub struct Registry {
    container: ContainerId,
    slots: SlotArena<Registration>,
    next_seq: u64,
}

impl Registry {
    pub fn new(container: ContainerId) -> Self {
        Self {
            container,
            slots: SlotArena::new(),
            next_seq: 0,
        }
    }

    pub fn container(&self) -> ContainerId {
        self.container
    }

    /// Registers `object`. Fails only when registry storage cannot grow; the
    /// object is then left unregistered.
    pub fn register<T: RenderObject + 'static>(&mut self, object: &Rc<RefCell<T>>) -> Result<ObjectId> {
        let object: SharedObject = object.clone();
        self.register_shared(&object)
    }

    pub fn register_shared(&mut self, object: &SharedObject) -> Result<ObjectId> {
        let seq = self.next_seq;
        let registration = Registration {
            object: Rc::downgrade(object),
            seq,
        };
        let slot = self.slots.try_insert(registration).map_err(|_| {
            RenderError::OutOfMemory(format!(
                "registry of container {} cannot grow",
                self.container
            ))
        })?;
        self.next_seq += 1;
        Ok(ObjectId {
            container: self.container,
            slot,
        })
    }

    /// Removes a registration. `None`, stale and foreign ids are ignored.
    pub fn unregister(&mut self, id: Option<ObjectId>) -> bool {
        match id {
            Some(id) if id.container == self.container => self.slots.remove(id.slot).is_some(),
            _ => false,
        }
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        id.container == self.container && self.slots.contains(id.slot)
    }

    /// Object behind `id`, if it is registered here and still alive.
    pub fn get(&self, id: ObjectId) -> Option<SharedObject> {
        if id.container != self.container {
            return None;
        }
        self.slots.get(id.slot).and_then(|r| r.object.upgrade())
    }

    /// Number of registrations, including ones whose owner is gone.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Live registrations in registration order. Registrations whose owner
    /// was dropped are pruned.
    pub fn snapshot(&mut self) -> Vec<(ObjectId, SharedObject)> {
        let mut live = Vec::with_capacity(self.slots.len());
        let mut dead = Vec::new();
        for (slot, registration) in self.slots.iter() {
            match registration.object.upgrade() {
                Some(object) => live.push((registration.seq, slot, object)),
                None => dead.push(slot),
            }
        }
        for slot in dead {
            self.slots.remove(slot);
        }

        live.sort_by_key(|(seq, _, _)| *seq);
        live.into_iter()
            .map(|(_, slot, object)| {
                let id = ObjectId {
                    container: self.container,
                    slot,
                };
                (id, object)
            })
            .collect()
    }

    /// Saves every live object and removes its registration.
    ///
    /// Fails while any live object is borrowed; every object then stays
    /// registered here and nothing is saved.
    pub fn save_all(&mut self, device: &mut Device) -> Result<Vec<DetachedObject>> {
        let snapshot = self.snapshot();
        self.ensure_unborrowed(&snapshot, "save")?;

        let mut detached = Vec::with_capacity(snapshot.len());
        let mut blocked = false;
        for (id, object) in snapshot {
            match object.try_borrow_mut() {
                Ok(mut guard) => guard.save(device),
                Err(_) => {
                    blocked = true;
                    break;
                }
            }
            self.slots.remove(id.slot);
            detached.push(DetachedObject { object });
        }

        if blocked {
            // A save borrowed a later object; put the saved ones back.
            for object in detached {
                if let Err(err) = self.attach(object, device) {
                    tracing::warn!("Rollback into container {} failed: {}", self.container, err);
                }
            }
            return Err(borrowed_during(self.container, "save"));
        }

        tracing::debug!(
            "Saved {} objects from container {}",
            detached.len(),
            self.container
        );
        Ok(detached)
    }

    /// Re-registers and restores previously saved objects, in order.
    ///
    /// A failing object is left unregistered and the sweep continues; the
    /// first failure is returned.
    pub fn restore_all(&mut self, objects: Vec<DetachedObject>, device: &mut Device) -> Result<()> {
        let count = objects.len();
        let mut first_error = None;
        for detached in objects {
            if let Err(err) = self.attach(detached, device) {
                tracing::warn!("Restore into container {} failed: {}", self.container, err);
                first_error.get_or_insert(err);
            }
        }
        tracing::debug!("Restored {} objects into container {}", count, self.container);
        first_error.map_or(Ok(()), Err)
    }

    /// Frees every live object and removes its registration.
    ///
    /// Fails while any live object is borrowed; nothing is freed then. An
    /// object that becomes borrowed mid-sweep stays registered.
    pub fn free_all(&mut self, device: &mut Device) -> Result<()> {
        let snapshot = self.snapshot();
        self.ensure_unborrowed(&snapshot, "free")?;

        let mut kept = 0;
        for (id, object) in snapshot {
            match object.try_borrow_mut() {
                Ok(mut guard) => guard.free(device),
                Err(_) => {
                    kept += 1;
                    continue;
                }
            }
            self.slots.remove(id.slot);
        }
        if kept > 0 {
            return Err(borrowed_during(self.container, "free"));
        }
        Ok(())
    }

    fn ensure_unborrowed(&self, snapshot: &[(ObjectId, SharedObject)], sweep: &str) -> Result<()> {
        if snapshot
            .iter()
            .any(|(_, object)| object.try_borrow_mut().is_err())
        {
            return Err(borrowed_during(self.container, sweep));
        }
        Ok(())
    }

    /// Saves one object and removes its registration.
    pub fn detach(&mut self, id: ObjectId, device: &mut Device) -> Option<DetachedObject> {
        let object = self.get(id)?;
        object.try_borrow_mut().ok()?.save(device);
        self.slots.remove(id.slot);
        Some(DetachedObject { object })
    }

    /// Registers a detached object here and restores it.
    pub fn attach(&mut self, detached: DetachedObject, device: &mut Device) -> Result<ObjectId> {
        let id = self.register_shared(&detached.object)?;
        let restored = match detached.object.try_borrow_mut() {
            Ok(mut guard) => guard.restore(id, device),
            Err(_) => Err(RenderError::InvalidOperation(
                "object is borrowed during restore".to_string(),
            )),
        };
        if let Err(err) = restored {
            self.slots.remove(id.slot);
            return Err(err);
        }
        Ok(id)
    }
}

fn borrowed_during(container: ContainerId, sweep: &str) -> RenderError {
    RenderError::InvalidOperation(format!(
        "cannot {} container {}: an object is borrowed",
        sweep, container
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_test_utils::MockDriver;

    #[derive(Default)]
    struct Recorder {
        id: Option<ObjectId>,
        handle: Option<u32>,
        log: Vec<&'static str>,
        fail_restore: bool,
    }

    impl RenderObject for Recorder {
        fn label(&self) -> &'static str {
            "recorder"
        }

        fn free(&mut self, _device: &mut Device) {
            self.id = None;
            self.handle = None;
            self.log.push("free");
        }

        fn save(&mut self, _device: &mut Device) {
            self.id = None;
            self.handle = None;
            self.log.push("save");
        }

        fn restore(&mut self, id: ObjectId, _device: &mut Device) -> Result<()> {
            self.log.push("restore");
            if self.fail_restore {
                return Err(RenderError::OutOfMemory("recorder".into()));
            }
            self.id = Some(id);
            self.handle = Some(7);
            Ok(())
        }
    }

    fn container(raw: u32) -> ContainerId {
        ContainerId::new(raw).unwrap()
    }

    fn device() -> Device {
        Device::new(Box::new(MockDriver::new()))
    }

    #[test]
    fn test_register_and_unregister() {
        let mut registry = Registry::new(container(1));
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        let id = registry.register(&recorder).unwrap();

        assert!(registry.contains(id));
        assert!(registry.unregister(Some(id)));
        assert!(!registry.unregister(Some(id)));
        assert!(!registry.unregister(None));
    }

    #[test]
    fn test_foreign_id_is_ignored() {
        let mut first = Registry::new(container(1));
        let mut second = Registry::new(container(2));
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        let id = first.register(&recorder).unwrap();
        second.register(&recorder).unwrap();

        assert!(!second.contains(id));
        assert!(!second.unregister(Some(id)));
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn test_snapshot_prunes_dropped_owners() {
        let mut registry = Registry::new(container(1));
        let kept = Rc::new(RefCell::new(Recorder::default()));
        registry.register(&kept).unwrap();
        {
            let dropped = Rc::new(RefCell::new(Recorder::default()));
            registry.register(&dropped).unwrap();
        }
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.snapshot().len(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_follows_registration_order() {
        let mut registry = Registry::new(container(1));
        let a = Rc::new(RefCell::new(Recorder::default()));
        let b = Rc::new(RefCell::new(Recorder::default()));
        let c = Rc::new(RefCell::new(Recorder::default()));
        let a_id = registry.register(&a).unwrap();
        registry.register(&b).unwrap();
        registry.unregister(Some(a_id));
        // c reuses a's slot but must still come after b.
        registry.register(&c).unwrap();

        let order: Vec<_> = registry
            .snapshot()
            .into_iter()
            .map(|(_, object)| Rc::as_ptr(&object) as *const () as usize)
            .collect();
        assert_eq!(
            order,
            vec![Rc::as_ptr(&b) as *const () as usize, Rc::as_ptr(&c) as *const () as usize]
        );
    }

    #[test]
    fn test_save_restore_round_trip() {
        let mut device = device();
        let mut old = Registry::new(container(1));
        let mut new = Registry::new(container(2));
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        let id = old.register(&recorder).unwrap();
        recorder.borrow_mut().restore(id, &mut device).unwrap();

        let detached = old.save_all(&mut device).unwrap();
        assert!(old.is_empty());
        assert_eq!(recorder.borrow().handle, None);

        new.restore_all(detached, &mut device).unwrap();
        let recorder = recorder.borrow();
        assert_eq!(recorder.handle, Some(7));
        assert_eq!(recorder.id.map(|id| id.container()), Some(container(2)));
        assert_eq!(recorder.log, vec!["restore", "save", "restore"]);
    }

    #[test]
    fn test_failed_restore_leaves_object_unregistered() {
        let mut device = device();
        let mut registry = Registry::new(container(1));
        let recorder = Rc::new(RefCell::new(Recorder {
            fail_restore: true,
            ..Default::default()
        }));
        let shared: SharedObject = recorder.clone();
        let result = registry.attach(DetachedObject { object: shared }, &mut device);

        assert!(result.is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_free_all() {
        let mut device = device();
        let mut registry = Registry::new(container(1));
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        registry.register(&recorder).unwrap();

        registry.free_all(&mut device).unwrap();
        assert!(registry.is_empty());
        assert_eq!(recorder.borrow().log, vec!["free"]);
    }

    #[test]
    fn test_save_all_with_borrowed_object_keeps_everything_registered() {
        let mut device = device();
        let mut registry = Registry::new(container(1));
        let free = Rc::new(RefCell::new(Recorder::default()));
        let held = Rc::new(RefCell::new(Recorder::default()));
        let free_id = registry.register(&free).unwrap();
        let held_id = registry.register(&held).unwrap();

        let guard = held.borrow();
        assert!(registry.save_all(&mut device).is_err());
        drop(guard);

        assert!(registry.contains(free_id));
        assert!(registry.contains(held_id));
        assert!(free.borrow().log.is_empty());
        assert!(held.borrow().log.is_empty());
    }

    #[test]
    fn test_free_all_with_borrowed_object_frees_nothing() {
        let mut device = device();
        let mut registry = Registry::new(container(1));
        let free = Rc::new(RefCell::new(Recorder::default()));
        let held = Rc::new(RefCell::new(Recorder::default()));
        registry.register(&free).unwrap();
        registry.register(&held).unwrap();

        let guard = held.borrow_mut();
        assert!(registry.free_all(&mut device).is_err());
        drop(guard);

        assert_eq!(registry.len(), 2);
        assert!(free.borrow().log.is_empty());
    }
}
