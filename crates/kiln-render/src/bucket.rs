//! Radix-sorted buckets of batch units.
//!
//! A [`Bucket`] stores opaque units in an intrusive doubly linked list, in
//! insertion order until [`Bucket::process`] sorts them by key. Keys are
//! chosen by the caller; putting state-change-relevant attributes (a program
//! id, say) in the high bits groups draws that share that state.
//!
//! Sorting is a least-significant-digit radix sort over 8-bit digits, so
//! units with equal (masked) keys keep their insertion order. It only runs
//! when units were inserted since the last `process`.

use kiln_core::alloc::{IndexSlot, SlotArena};
use kiln_core::error::{RenderError, Result};
use kiln_core::profiling::profile_function;

/// Width of one radix digit.
pub const DIGIT_BITS: u32 = 8;
const RADIX: usize = 1 << DIGIT_BITS;

/// Handle of a unit inside its bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitId(IndexSlot);

struct Unit<S> {
    key: u64,
    source: S,
    prev: Option<UnitId>,
    next: Option<UnitId>,
}

pub struct Bucket<S> {
    units: SlotArena<Unit<S>>,
    head: Option<UnitId>,
    tail: Option<UnitId>,
    bits: u32,
    mask: u64,
    dirty: bool,

    // Reused between sorts.
    order: Vec<(u64, UnitId)>,
    scratch: Vec<(u64, UnitId)>,
}

impl<S> Bucket<S> {
    /// Creates a bucket sorting on the low `bits` bits of each key; 0 (or
    /// anything above 64) sorts on the whole key.
    pub fn new(bits: u32) -> Self {
        let bits = if bits == 0 || bits > u64::BITS { u64::BITS } else { bits };
        let mask = if bits == u64::BITS {
            u64::MAX
        } else {
            (1u64 << bits) - 1
        };
        Self {
            units: SlotArena::new(),
            head: None,
            tail: None,
            bits,
            mask,
            dirty: false,
            order: Vec::new(),
            scratch: Vec::new(),
        }
    }

    /// Significant key bits.
    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Whether units were inserted since the last sort.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Appends a unit. The key is truncated to the bucket's bit width.
    pub fn insert(&mut self, source: S, key: u64) -> Result<UnitId> {
        let unit = Unit {
            key: key & self.mask,
            source,
            prev: self.tail,
            next: None,
        };
        let id = UnitId(self.units.try_insert(unit).map_err(|_| {
            RenderError::OutOfMemory("bucket cannot hold more units".to_string())
        })?);

        match self.tail.and_then(|tail| self.units.get_mut(tail.0)) {
            Some(tail) => tail.next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.dirty = true;
        Ok(id)
    }

    /// Unlinks and returns a unit in O(1). Other unit ids stay valid.
    pub fn erase(&mut self, unit: UnitId) -> Option<S> {
        let removed = self.units.remove(unit.0)?;
        match removed.prev {
            Some(prev) => {
                if let Some(prev) = self.units.get_mut(prev.0) {
                    prev.next = removed.next;
                }
            }
            None => self.head = removed.next,
        }
        match removed.next {
            Some(next) => {
                if let Some(next) = self.units.get_mut(next.0) {
                    next.prev = removed.prev;
                }
            }
            None => self.tail = removed.prev,
        }
        Some(removed.source)
    }

    /// Sorts the units by key if needed and returns the head of the sorted
    /// list; `None` for an empty bucket.
    pub fn process(&mut self) -> Option<UnitId> {
        if self.dirty {
            self.radix_sort();
            self.dirty = false;
        }
        self.head
    }

    pub fn first(&self) -> Option<UnitId> {
        self.head
    }

    pub fn next(&self, unit: UnitId) -> Option<UnitId> {
        self.units.get(unit.0)?.next
    }

    pub fn prev(&self, unit: UnitId) -> Option<UnitId> {
        self.units.get(unit.0)?.prev
    }

    pub fn get(&self, unit: UnitId) -> Option<&S> {
        self.units.get(unit.0).map(|u| &u.source)
    }

    pub fn get_mut(&mut self, unit: UnitId) -> Option<&mut S> {
        self.units.get_mut(unit.0).map(|u| &mut u.source)
    }

    /// The stored (masked) key of a unit.
    pub fn key(&self, unit: UnitId) -> Option<u64> {
        self.units.get(unit.0).map(|u| u.key)
    }

    /// Units in list order: sorted if `process` ran since the last insert,
    /// insertion order otherwise.
    pub fn iter(&self) -> BucketIter<'_, S> {
        BucketIter {
            bucket: self,
            cursor: self.head,
        }
    }

    pub fn clear(&mut self) {
        self.units.drain();
        self.head = None;
        self.tail = None;
        self.dirty = false;
    }

    fn radix_sort(&mut self) {
        profile_function!();
        let mut order = std::mem::take(&mut self.order);
        let mut scratch = std::mem::take(&mut self.scratch);

        order.clear();
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let Some(unit) = self.units.get(id.0) else {
                break;
            };
            order.push((unit.key, id));
            cursor = unit.next;
        }
        scratch.clear();
        scratch.extend_from_slice(&order);

        let passes = self.bits.div_ceil(DIGIT_BITS);
        for pass in 0..passes {
            let shift = pass * DIGIT_BITS;
            let digit = |key: u64| ((key >> shift) as usize) & (RADIX - 1);

            let mut offsets = [0usize; RADIX];
            for &(key, _) in &order {
                offsets[digit(key)] += 1;
            }
            let mut total = 0;
            for slot in offsets.iter_mut() {
                let count = *slot;
                *slot = total;
                total += count;
            }
            for &entry in &order {
                let d = digit(entry.0);
                scratch[offsets[d]] = entry;
                offsets[d] += 1;
            }
            order.copy_from_slice(&scratch);
        }

        self.relink(&order);
        self.order = order;
        self.scratch = scratch;
    }

    fn relink(&mut self, order: &[(u64, UnitId)]) {
        for (i, &(_, id)) in order.iter().enumerate() {
            let prev = i.checked_sub(1).map(|p| order[p].1);
            let next = order.get(i + 1).map(|&(_, id)| id);
            if let Some(unit) = self.units.get_mut(id.0) {
                unit.prev = prev;
                unit.next = next;
            }
        }
        self.head = order.first().map(|&(_, id)| id);
        self.tail = order.last().map(|&(_, id)| id);
    }
}

impl<S> Default for Bucket<S> {
    fn default() -> Self {
        Self::new(0)
    }
}

pub struct BucketIter<'a, S> {
    bucket: &'a Bucket<S>,
    cursor: Option<UnitId>,
}

impl<'a, S> Iterator for BucketIter<'a, S> {
    type Item = (UnitId, &'a S);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        let unit = self.bucket.units.get(id.0)?;
        self.cursor = unit.next;
        Some((id, &unit.source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted<S: Copy>(bucket: &mut Bucket<S>) -> Vec<S> {
        bucket.process();
        bucket.iter().map(|(_, s)| *s).collect()
    }

    #[test]
    fn test_empty_bucket() {
        let mut bucket = Bucket::<u32>::new(0);
        assert_eq!(bucket.process(), None);
        assert_eq!(bucket.iter().count(), 0);
    }

    #[test]
    fn test_full_width_ascending() {
        let mut bucket = Bucket::new(0);
        for key in [u64::MAX, 3, 1 << 40, 0, 3] {
            bucket.insert(key, key).unwrap();
        }
        assert_eq!(sorted(&mut bucket), vec![0, 3, 3, 1 << 40, u64::MAX]);
    }

    #[test]
    fn test_truncated_keys_keep_insertion_order() {
        let mut bucket = Bucket::new(8);
        bucket.insert("a", 0x1000).unwrap();
        bucket.insert("b", 0x0000).unwrap();
        bucket.insert("c", 0x1001).unwrap();

        assert_eq!(sorted(&mut bucket), vec!["a", "b", "c"]);
        let head = bucket.first().unwrap();
        assert_eq!(bucket.key(head), Some(0));
    }

    #[test]
    fn test_odd_bit_width() {
        let mut bucket = Bucket::new(12);
        assert_eq!(bucket.bits(), 12);
        bucket.insert(1, 0xfff).unwrap();
        bucket.insert(2, 0x100).unwrap();
        bucket.insert(3, 0x1_0000).unwrap();
        assert_eq!(sorted(&mut bucket), vec![3, 2, 1]);
    }

    #[test]
    fn test_erase_head_middle_tail() {
        let mut bucket = Bucket::new(0);
        let ids: Vec<_> = (0..5u64).map(|k| bucket.insert(k, k).unwrap()).collect();
        bucket.process();

        assert_eq!(bucket.erase(ids[0]), Some(0));
        assert_eq!(bucket.erase(ids[2]), Some(2));
        assert_eq!(bucket.erase(ids[4]), Some(4));
        assert_eq!(bucket.erase(ids[2]), None);

        assert_eq!(sorted(&mut bucket), vec![1, 3]);
        assert_eq!(bucket.prev(ids[3]), Some(ids[1]));
        assert_eq!(bucket.next(ids[3]), None);
    }

    #[test]
    fn test_process_is_idempotent() {
        let mut bucket = Bucket::new(16);
        for key in [9u64, 2, 7, 2, 0] {
            bucket.insert(key, key).unwrap();
        }
        let first = sorted(&mut bucket);
        assert!(!bucket.is_dirty());
        assert_eq!(sorted(&mut bucket), first);
    }

    #[test]
    fn test_insert_after_process_resorts() {
        let mut bucket = Bucket::new(0);
        bucket.insert(5u64, 5).unwrap();
        bucket.insert(1, 1).unwrap();
        sorted(&mut bucket);

        bucket.insert(3, 3).unwrap();
        assert!(bucket.is_dirty());
        assert_eq!(sorted(&mut bucket), vec![1, 3, 5]);
    }
}
