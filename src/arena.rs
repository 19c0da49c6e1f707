//! Generation-checked slot storage.
//!
//! [`Arena<T>`] stores values in slots addressed by a [`Handle<T>`]. Each slot
//! carries a generation that is bumped when its value is removed, so a handle
//! to a released value never resolves to whatever reuses the slot later.
//!
//! # Example
//!
//! ```
//! use lumen_engine::arena::Arena;
//!
//! let mut arena = Arena::with_capacity(4);
//! let a = arena.insert("first").unwrap();
//! assert_eq!(arena.get(a), Some(&"first"));
//!
//! arena.remove(a);
//! let b = arena.insert("second").unwrap();
//!
//! // Slot is reused but the stale handle no longer resolves.
//! assert_eq!(a.index(), b.index());
//! assert!(arena.get(a).is_none());
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Stable handle into an [`Arena`].
///
/// Two handles are equal if they have the same `(index, generation)`.
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Slot index of this handle.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot when this handle was issued.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Fixed-capacity slot storage with generation-checked handles.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
    capacity: usize,
    len: usize,
}

impl<T> Arena<T> {
    /// Creates an arena that holds at most `capacity` live values.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            capacity,
            len: 0,
        }
    }

    /// Maximum number of live values.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts a value, returning `None` when the arena is full.
    pub fn insert(&mut self, value: T) -> Option<Handle<T>> {
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            self.len += 1;
            return Some(Handle::new(index, slot.generation));
        }

        if self.slots.len() >= self.capacity {
            return None;
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        self.len += 1;
        Some(Handle::new(index, 0))
    }

    /// Removes and returns the value for `handle`. Stale handles return `None`.
    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        // Invalidate outstanding handles before the slot is reused.
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(handle.index);
        self.len -= 1;
        Some(value)
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut()
    }

    /// Iterates live values with their handles.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (Handle::new(index as u32, slot.generation), value))
        })
    }

    /// Handles of all live values.
    pub fn handles(&self) -> Vec<Handle<T>> {
        self.iter().map(|(handle, _)| handle).collect()
    }
}

impl<T> fmt::Debug for Arena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_sequential() {
        let mut arena = Arena::with_capacity(8);
        let a = arena.insert(1).unwrap();
        let b = arena.insert(2).unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut arena = Arena::with_capacity(2);
        arena.insert(1).unwrap();
        arena.insert(2).unwrap();
        assert!(arena.insert(3).is_none());
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn remove_invalidates_handle() {
        let mut arena = Arena::with_capacity(4);
        let a = arena.insert("a").unwrap();
        assert_eq!(arena.remove(a), Some("a"));
        assert!(arena.get(a).is_none());
        assert!(arena.remove(a).is_none());
        assert!(arena.is_empty());
    }

    #[test]
    fn recycled_slot_new_generation() {
        let mut arena = Arena::with_capacity(1);
        let a = arena.insert(10).unwrap();
        arena.remove(a);
        let b = arena.insert(20).unwrap();
        assert_eq!(a.index(), b.index());
        assert_ne!(a.generation(), b.generation());
        assert_eq!(arena.get(b), Some(&20));
        assert!(arena.get(a).is_none());
    }

    #[test]
    fn iter_skips_removed() {
        let mut arena = Arena::with_capacity(4);
        let a = arena.insert(1).unwrap();
        let _b = arena.insert(2).unwrap();
        let _c = arena.insert(3).unwrap();
        arena.remove(a);
        let values: Vec<i32> = arena.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![2, 3]);
    }
}
