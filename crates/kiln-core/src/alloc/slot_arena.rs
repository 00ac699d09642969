use crate::profiling::profile_function;
use std::num::NonZeroU64;

/// Generational index into a [`SlotArena`].
///
/// The low 32 bits hold `index + 1` so the whole value is never zero and
/// `Option<IndexSlot>` stays the size of a `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexSlot(NonZeroU64);

impl IndexSlot {
    pub fn new(generation: u32, idx: u32) -> Self {
        debug_assert!(idx < SlotArena::<()>::MAX_SLOTS);
        // SAFETY: `idx as u64 + 1` is at least one, so the packed value is never zero.
        Self(unsafe {
            NonZeroU64::new(((generation as u64) << 32) | (idx as u64 + 1)).unwrap_unchecked()
        })
    }

    pub fn generation(&self) -> u32 {
        (self.0.get() >> 32) as u32
    }

    pub fn index(&self) -> u32 {
        (self.0.get() & u32::MAX as u64) as u32 - 1
    }

    /// Packed representation, useful as a stable debug/log value.
    pub fn to_bits(&self) -> u64 {
        self.0.get()
    }
}

struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot storage with generation-checked handles.
///
/// Removing a value bumps the slot generation, so stale handles are rejected
/// instead of aliasing whatever reuses the slot later.
pub struct SlotArena<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> SlotArena<T> {
    /// Highest index a slot may take; keeps `index + 1` inside the low 32 bits.
    pub const MAX_SLOTS: u32 = u32::MAX - 1;

    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Inserts a value, handing it back if storage cannot grow.
    pub fn try_insert(&mut self, value: T) -> Result<IndexSlot, T> {
        profile_function!();
        if let Some(idx) = self.free.pop() {
            let entry = &mut self.entries[idx as usize];
            entry.value = Some(value);
            self.len += 1;
            return Ok(IndexSlot::new(entry.generation, idx));
        }

        let idx = self.entries.len();
        if idx >= Self::MAX_SLOTS as usize || self.entries.try_reserve(1).is_err() {
            return Err(value);
        }
        self.entries.push(Entry {
            generation: 0,
            value: Some(value),
        });
        self.len += 1;
        Ok(IndexSlot::new(0, idx as u32))
    }

    pub fn contains(&self, slot: IndexSlot) -> bool {
        self.get(slot).is_some()
    }

    pub fn get(&self, slot: IndexSlot) -> Option<&T> {
        self.entries
            .get(slot.index() as usize)
            .filter(|entry| entry.generation == slot.generation())
            .and_then(|entry| entry.value.as_ref())
    }

    pub fn get_mut(&mut self, slot: IndexSlot) -> Option<&mut T> {
        self.entries
            .get_mut(slot.index() as usize)
            .filter(|entry| entry.generation == slot.generation())
            .and_then(|entry| entry.value.as_mut())
    }

    /// Removes the value behind `slot`; stale or foreign slots return `None`.
    pub fn remove(&mut self, slot: IndexSlot) -> Option<T> {
        profile_function!();
        let index = slot.index();
        let entry = self.entries.get_mut(index as usize)?;
        if entry.generation != slot.generation() {
            return None;
        }
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(index);
        self.len -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Live slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = (IndexSlot, &T)> {
        self.entries.iter().enumerate().filter_map(|(idx, entry)| {
            entry
                .value
                .as_ref()
                .map(|value| (IndexSlot::new(entry.generation, idx as u32), value))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (IndexSlot, &mut T)> {
        self.entries.iter_mut().enumerate().filter_map(|(idx, entry)| {
            let generation = entry.generation;
            entry
                .value
                .as_mut()
                .map(|value| (IndexSlot::new(generation, idx as u32), value))
        })
    }

    /// Removes every value, invalidating all outstanding slots.
    pub fn drain(&mut self) -> Vec<T> {
        let mut values = Vec::with_capacity(self.len);
        for (idx, entry) in self.entries.iter_mut().enumerate() {
            if let Some(value) = entry.value.take() {
                entry.generation = entry.generation.wrapping_add(1);
                self.free.push(idx as u32);
                values.push(value);
            }
        }
        self.len = 0;
        values
    }
}

impl<T> Default for SlotArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

static_assertions::assert_eq_size!(IndexSlot, Option<IndexSlot>);
