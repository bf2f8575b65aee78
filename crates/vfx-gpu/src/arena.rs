//! Generational arena used by the device to own GPU memory allocations.
//!
//! Resources hold a copyable [`Index`] instead of the allocation itself or a
//! pointer back to the device. A stale index (its slot was freed or reused)
//! fails the generation check on lookup instead of dangling.

use std::num::NonZeroU32;

/// Key into an [`Arena`]. Indices from one arena must not be used with
/// another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Index {
    slot: u32,
    generation: NonZeroU32,
}

enum SlotState<T> {
    Occupied(T),
    Free { next_free: Option<u32> },
}

struct Slot<T> {
    generation: NonZeroU32,
    state: SlotState<T>,
}

/// Slot-reusing storage with generation-checked lookups.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Arena<T> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a value, reusing a free slot when one exists.
    pub fn insert(&mut self, value: T) -> Index {
        self.len += 1;

        if let Some(slot) = self.free_head {
            let entry = &mut self.slots[slot as usize];
            match entry.state {
                SlotState::Free { next_free } => self.free_head = next_free,
                SlotState::Occupied(_) => unreachable!("free list points at occupied slot"),
            }
            entry.state = SlotState::Occupied(value);
            return Index {
                slot,
                generation: entry.generation,
            };
        }

        let slot = self.slots.len() as u32;
        let generation = NonZeroU32::MIN;
        self.slots.push(Slot {
            generation,
            state: SlotState::Occupied(value),
        });
        Index { slot, generation }
    }

    pub fn get(&self, index: Index) -> Option<&T> {
        match self.slots.get(index.slot as usize) {
            Some(Slot {
                generation,
                state: SlotState::Occupied(value),
            }) if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, index: Index) -> Option<&mut T> {
        match self.slots.get_mut(index.slot as usize) {
            Some(Slot {
                generation,
                state: SlotState::Occupied(value),
            }) if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    /// Remove a value. The slot's generation is bumped so the removed index
    /// (and any copy of it) stops resolving.
    pub fn remove(&mut self, index: Index) -> Option<T> {
        let entry = self.slots.get_mut(index.slot as usize)?;
        if entry.generation != index.generation
            || !matches!(entry.state, SlotState::Occupied(_))
        {
            return None;
        }

        entry.generation = next_generation(entry.generation);
        let state = std::mem::replace(
            &mut entry.state,
            SlotState::Free {
                next_free: self.free_head,
            },
        );
        self.free_head = Some(index.slot);
        self.len -= 1;

        match state {
            SlotState::Occupied(value) => Some(value),
            SlotState::Free { .. } => unreachable!("occupancy checked above"),
        }
    }

    /// Drain every live value. Existing indices all become stale.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.len = 0;
        self.free_head = None;
        let slots = std::mem::take(&mut self.slots);
        slots.into_iter().filter_map(|slot| match slot.state {
            SlotState::Occupied(value) => Some(value),
            SlotState::Free { .. } => None,
        })
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn next_generation(generation: NonZeroU32) -> NonZeroU32 {
    // Wraps past u32::MAX, skipping zero.
    NonZeroU32::new(generation.get().wrapping_add(1)).unwrap_or(NonZeroU32::MIN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");

        assert_eq!(arena.len(), 2);
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.get(b), Some(&"b"));
    }

    #[test]
    fn remove_invalidates_index() {
        let mut arena = Arena::new();
        let index = arena.insert(7);

        assert_eq!(arena.remove(index), Some(7));
        assert_eq!(arena.get(index), None);
        assert_eq!(arena.remove(index), None);
        assert!(arena.is_empty());
    }

    #[test]
    fn reused_slot_gets_new_generation() {
        let mut arena = Arena::new();
        let first = arena.insert(1);
        arena.remove(first);

        let second = arena.insert(2);
        // Same slot, different generation: the old index must not alias the
        // new value.
        assert_ne!(first, second);
        assert_eq!(arena.get(first), None);
        assert_eq!(arena.get(second), Some(&2));
    }

    #[test]
    fn generation_wraps_without_zero() {
        let max = NonZeroU32::new(u32::MAX).unwrap();
        assert_eq!(next_generation(max), NonZeroU32::MIN);
    }

    #[test]
    fn drain_empties_and_invalidates() {
        let mut arena = Arena::new();
        let a = arena.insert(1);
        arena.insert(2);

        let mut drained: Vec<_> = arena.drain().collect();
        drained.sort_unstable();
        assert_eq!(drained, vec![1, 2]);
        assert!(arena.is_empty());
        assert_eq!(arena.get(a), None);
    }
}
