//! Allocation and collection types for Kiln.
//!
//! This module provides:
//! - Re-exports of hash collections using AHash
//! - [`SlotArena`](slot_arena::SlotArena) for generation-checked handles

pub mod slot_arena;

pub use ahash::{AHashMap as HashMap, AHashSet as HashSet, RandomState};
pub use slot_arena::{IndexSlot, SlotArena};
