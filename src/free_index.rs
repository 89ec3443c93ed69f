//! The free index (C3) tracks only `Free` blocks, segregated by exact
//! size so that `pick_fit` can restrict its search to size buckets at
//! least as large as the request.  Within a bucket, a `BTreeSet<usize>`
//! of addresses is already in address order, which is what lets
//! `pick_fit` implement the spec's required first-fit-by-address
//! policy: among every block large enough to satisfy the request,
//! return the one with the lowest address.
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

use std::collections::{BTreeMap, BTreeSet};

#[derive(Default)]
pub struct FreeIndex {
    by_size: BTreeMap<usize, BTreeSet<usize>>,
}

impl FreeIndex {
    pub fn new() -> Self {
        Self {
            by_size: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, addr: usize, size: usize) {
        self.by_size.entry(size).or_default().insert(addr);
    }

    /// Removes the free block of size `size` at `addr`.
    #[requires(self.by_size.get(&size).map_or(false, |s| s.contains(&addr)),
               "the block must currently be indexed as free")]
    pub fn remove(&mut self, addr: usize, size: usize) {
        if let Some(set) = self.by_size.get_mut(&size) {
            set.remove(&addr);
            if set.is_empty() {
                self.by_size.remove(&size);
            }
        }
    }

    /// Returns the address of the lowest-addressed free block whose
    /// size is at least `target`, along with its size, or `None` if no
    /// block is large enough.
    pub fn pick_fit(&self, target: usize) -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize)> = None;

        for (&size, addrs) in self.by_size.range(target..) {
            if let Some(&addr) = addrs.iter().next() {
                if best.map_or(true, |(best_addr, _)| addr < best_addr) {
                    best = Some((addr, size));
                }
            }
        }

        best
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.by_size.values().map(|s| s.len()).sum()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pick_fit_prefers_lowest_address_among_sufficient_sizes() {
        let mut index = FreeIndex::new();

        index.insert(100, 5 * 4096);
        index.insert(50, 10 * 4096);
        index.insert(200, 3 * 4096);

        // All three are >= a 3-page request; the lowest address wins,
        // even though its size (10 pages) isn't the smallest fit.
        assert_eq!(index.pick_fit(3 * 4096), Some((50, 10 * 4096)));

        // Only the 5- and 10-page blocks satisfy a 4-page request.
        assert_eq!(index.pick_fit(4 * 4096), Some((50, 10 * 4096)));

        // Nothing satisfies an 11-page request.
        assert_eq!(index.pick_fit(11 * 4096), None);
    }

    #[test]
    fn remove_drops_empty_buckets() {
        let mut index = FreeIndex::new();
        index.insert(0, 4096);
        assert_eq!(index.len(), 1);

        index.remove(0, 4096);
        assert_eq!(index.len(), 0);
        assert_eq!(index.pick_fit(4096), None);
    }
}
