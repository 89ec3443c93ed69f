//! The block registry (C2) is the address-ordered view over every
//! block, free or in-use, that tiles the reserved region.  It is a
//! `BTreeMap` keyed by `addr`, which gives `find_containing`,
//! `predecessor` and `successor` in O(log n), and lets `split`/`merge`
//! rewrite just the handful of entries they touch.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::collections::BTreeMap;

use crate::block::{Arena, Block, BlockId, State};

pub struct Registry {
    arena: Arena,
    by_addr: BTreeMap<usize, BlockId>,
}

impl Registry {
    /// Creates a registry holding a single `Free` block spanning
    /// `[base, base + capacity)`.
    pub fn new(base: usize, capacity: usize) -> Self {
        let mut arena = Arena::new();
        let mut by_addr = BTreeMap::new();

        let id = arena.insert(Block {
            addr: base,
            size: capacity,
            state: State::Free,
        });
        by_addr.insert(base, id);

        Self { arena, by_addr }
    }

    pub fn block(&self, id: BlockId) -> &Block {
        self.arena.get(id)
    }

    pub fn set_state(&mut self, id: BlockId, state: State) {
        self.arena.get_mut(id).state = state;
    }

    /// Returns the block whose range contains `addr`, if any.
    #[ensures(ret.is_none() || {
        let b = self.arena.get(ret.unwrap());
        addr >= b.addr && addr < b.addr + b.size
    })]
    pub fn find_containing(&self, addr: usize) -> Option<BlockId> {
        let (_, &id) = self.by_addr.range(..=addr).next_back()?;
        let block = self.arena.get(id);

        if addr < block.addr + block.size {
            Some(id)
        } else {
            None
        }
    }

    /// Returns the block that directly precedes `id` in address order.
    pub fn predecessor(&self, id: BlockId) -> Option<BlockId> {
        let addr = self.arena.get(id).addr;
        self.by_addr.range(..addr).next_back().map(|(_, &id)| id)
    }

    /// Returns the block that directly follows `id` in address order.
    pub fn successor(&self, id: BlockId) -> Option<BlockId> {
        let block = self.arena.get(id);
        self.by_addr
            .range((block.addr + block.size)..)
            .next()
            .map(|(_, &id)| id)
    }

    /// Replaces `id` with two adjacent blocks of size `prefix_size` and
    /// `size - prefix_size`, both inheriting the original state.
    #[requires(prefix_size > 0 && prefix_size < self.arena.get(id).size)]
    pub fn split(&mut self, id: BlockId, prefix_size: usize) -> (BlockId, BlockId) {
        let old = self.arena.remove(id);
        self.by_addr.remove(&old.addr);

        let left = self.arena.insert(Block {
            addr: old.addr,
            size: prefix_size,
            state: old.state,
        });
        let right = self.arena.insert(Block {
            addr: old.addr + prefix_size,
            size: old.size - prefix_size,
            state: old.state,
        });

        self.by_addr.insert(old.addr, left);
        self.by_addr.insert(old.addr + prefix_size, right);

        (left, right)
    }

    /// Merges two adjacent, `Free` blocks into one spanning both.
    /// `left` must be the immediate predecessor of `right`.
    #[requires(self.arena.get(left).state == State::Free && self.arena.get(right).state == State::Free)]
    #[requires(self.arena.get(left).addr + self.arena.get(left).size == self.arena.get(right).addr)]
    pub fn merge(&mut self, left: BlockId, right: BlockId) -> BlockId {
        let l = self.arena.remove(left);
        let r = self.arena.remove(right);
        self.by_addr.remove(&l.addr);
        self.by_addr.remove(&r.addr);

        let merged = self.arena.insert(Block {
            addr: l.addr,
            size: l.size + r.size,
            state: State::Free,
        });
        self.by_addr.insert(l.addr, merged);

        merged
    }

    /// Walks blocks in address order, lowest address first.
    pub fn iter_in_order(&self) -> impl Iterator<Item = &Block> + '_ {
        self.by_addr.values().map(move |&id| self.arena.get(id))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn split_then_merge_round_trips() {
        let mut reg = Registry::new(0, 16 * 4096);
        let whole = reg.find_containing(0).unwrap();

        let (head, tail) = reg.split(whole, 4096);
        assert_eq!(reg.block(head).addr, 0);
        assert_eq!(reg.block(head).size, 4096);
        assert_eq!(reg.block(tail).addr, 4096);
        assert_eq!(reg.block(tail).size, 15 * 4096);

        assert_eq!(reg.successor(head), Some(tail));
        assert_eq!(reg.predecessor(tail), Some(head));

        let merged = reg.merge(head, tail);
        assert_eq!(reg.block(merged).addr, 0);
        assert_eq!(reg.block(merged).size, 16 * 4096);
        assert_eq!(reg.predecessor(merged), None);
        assert_eq!(reg.successor(merged), None);
    }

    #[test]
    fn find_containing_locates_middle_block() {
        let mut reg = Registry::new(0, 16 * 4096);
        let whole = reg.find_containing(0).unwrap();
        let (a, rest) = reg.split(whole, 4096);
        let (b, c) = reg.split(rest, 4096);

        assert_eq!(reg.find_containing(0), Some(a));
        assert_eq!(reg.find_containing(4096), Some(b));
        assert_eq!(reg.find_containing(4096 + 2048), Some(b));
        assert_eq!(reg.find_containing(8192), Some(c));
        assert_eq!(reg.find_containing(16 * 4096), None);
    }
}
