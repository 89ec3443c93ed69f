//! Blocks are the unit of bookkeeping for the reserved region: a
//! contiguous, page-aligned sub-range that is either `Free` or `InUse`.
//! Blocks live in an arena (a growing array indexed by small integers)
//! so that splitting and coalescing never has to ask the process's
//! global allocator for a fresh node. The arena's storage is a
//! [`HostVec`], not a `Vec`: it allocates directly through
//! `libc::malloc`/`realloc`, so growing it can never re-enter this
//! crate's own dispatcher even when [`crate::MmapAlloc`] is installed
//! as the `#[global_allocator]`.
use std::num::NonZeroUsize;

use crate::host_alloc::HostVec;

/// Opaque handle into the block arena.  Stable across splits/merges of
/// *other* blocks; invalidated only when the block it names is merged
/// away or split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(NonZeroUsize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Free,
    InUse,
}

#[derive(Debug, Clone, Copy)]
pub struct Block {
    pub addr: usize,
    pub size: usize,
    pub state: State,
}

/// Arena of block descriptors.  Slot 0 is never handed out, so a
/// `BlockId`'s inner `NonZeroUsize` can index directly into `slots`
/// after subtracting one.
pub struct Arena {
    slots: HostVec<Option<Block>>,
    free_slots: HostVec<usize>,
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena {
    pub fn new() -> Self {
        Self {
            slots: HostVec::new(),
            free_slots: HostVec::new(),
        }
    }

    pub fn insert(&mut self, block: Block) -> BlockId {
        let index = if let Some(index) = self.free_slots.pop() {
            self.slots[index] = Some(block);
            index
        } else {
            self.slots.push(Some(block));
            self.slots.len() - 1
        };

        BlockId(NonZeroUsize::new(index + 1).expect("index + 1 is never zero"))
    }

    pub fn get(&self, id: BlockId) -> &Block {
        self.slots[id.0.get() - 1]
            .as_ref()
            .expect("BlockId must name a live slot")
    }

    pub fn get_mut(&mut self, id: BlockId) -> &mut Block {
        self.slots[id.0.get() - 1]
            .as_mut()
            .expect("BlockId must name a live slot")
    }

    /// Removes `id` from the arena, recycling its slot for later reuse.
    pub fn remove(&mut self, id: BlockId) -> Block {
        let index = id.0.get() - 1;
        let block = self.slots[index].take().expect("BlockId must name a live slot");
        self.free_slots.push(index);
        block
    }

    #[cfg(test)]
    pub fn live_count(&self) -> usize {
        self.slots.as_slice().iter().filter(|s| s.is_some()).count()
    }
}

#[test]
fn test_arena_insert_remove_recycles() {
    let mut arena = Arena::new();

    let a = arena.insert(Block {
        addr: 0,
        size: 4096,
        state: State::Free,
    });
    let b = arena.insert(Block {
        addr: 4096,
        size: 4096,
        state: State::InUse,
    });

    assert_eq!(arena.live_count(), 2);
    assert_eq!(arena.get(a).addr, 0);
    assert_eq!(arena.get(b).state, State::InUse);

    let removed = arena.remove(a);
    assert_eq!(removed.addr, 0);
    assert_eq!(arena.live_count(), 1);

    let c = arena.insert(Block {
        addr: 8192,
        size: 4096,
        state: State::Free,
    });
    // The recycled slot should be reused rather than growing the arena.
    assert_eq!(arena.live_count(), 2);
    assert_eq!(arena.get(c).addr, 8192);
}
