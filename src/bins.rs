//! Utility bins: the LU/SU upper-bound accumulators.
//!
//! [`UtilityBins`] is a dense pair of vectors indexed by item, offset-biased
//! so only the candidate range `[lo, hi]` is stored. A search step resets it
//! over the still-feasible items, accumulates local-utility (LU) and
//! subtree-utility (SU) bounds from the projected database, and prunes by
//! comparing against the minimum utility.
//!
//! Bins are either thread-local (reused across calls on paths that never
//! run concurrently per slot) or freshly allocated for scatter-migrated
//! calls; they are never shared between threads.
//!
//! [`AtomicUtilityVec`] is the concurrent variant used by the TWU and
//! first-SU reductions: plain relaxed `fetch_add`s, since only the final
//! reduced values matter. Saturation is handled at read time; u64 totals
//! cannot overflow for inputs whose per-line utilities were already
//! validated.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::transaction::{Item, Utility};

/// Dense LU/SU bins over the item range `[offset, offset + len)`.
#[derive(Debug, Default)]
pub struct UtilityBins {
    offset: usize,
    data: Vec<(Utility, Utility)>,
}

impl UtilityBins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero both bins over `[lo, hi]`, reusing the allocation.
    pub fn reset(&mut self, lo: Item, hi: Item) {
        debug_assert!(lo <= hi);
        self.offset = lo as usize;
        let len = (hi - lo + 1) as usize;
        self.data.clear();
        self.data.resize(len, (0, 0));
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn lu(&self, item: Item) -> Utility {
        self.data[item as usize - self.offset].0
    }

    #[inline]
    pub fn su(&self, item: Item) -> Utility {
        self.data[item as usize - self.offset].1
    }

    #[inline]
    pub fn add_lu(&mut self, item: Item, x: Utility) {
        let slot = &mut self.data[item as usize - self.offset];
        slot.0 = slot.0.saturating_add(x);
    }

    #[inline]
    pub fn add_su(&mut self, item: Item, x: Utility) {
        let slot = &mut self.data[item as usize - self.offset];
        slot.1 = slot.1.saturating_add(x);
    }

    /// Element-wise add. Offsets and lengths must match.
    pub fn merge(&mut self, other: &UtilityBins) {
        debug_assert_eq!(self.offset, other.offset);
        debug_assert_eq!(self.data.len(), other.data.len());
        for (dst, src) in self.data.iter_mut().zip(&other.data) {
            dst.0 = dst.0.saturating_add(src.0);
            dst.1 = dst.1.saturating_add(src.1);
        }
    }
}

/// Shared accumulation vector for the TWU and first-SU passes.
#[derive(Debug)]
pub struct AtomicUtilityVec {
    data: Vec<AtomicU64>,
}

impl AtomicUtilityVec {
    pub fn new(len: usize) -> Self {
        Self {
            data: (0..len).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Relaxed add: only the fully-reduced value is ever read.
    #[inline]
    pub fn add(&self, idx: usize, x: Utility) {
        self.data[idx].fetch_add(x, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Utility {
        self.data[idx].load(Ordering::Relaxed)
    }

    pub fn into_vec(self) -> Vec<Utility> {
        self.data.into_iter().map(|a| a.into_inner()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn reset_rebases_the_offset() {
        let mut bins = UtilityBins::new();
        bins.reset(3, 7);
        assert_eq!(bins.len(), 5);
        bins.add_lu(3, 10);
        bins.add_su(7, 4);
        assert_eq!(bins.lu(3), 10);
        assert_eq!(bins.su(7), 4);
        assert_eq!(bins.lu(5), 0);

        bins.reset(5, 6);
        assert_eq!(bins.len(), 2);
        assert_eq!(bins.lu(5), 0);
    }

    #[test]
    fn merge_adds_elementwise() {
        let mut a = UtilityBins::new();
        let mut b = UtilityBins::new();
        a.reset(1, 3);
        b.reset(1, 3);
        a.add_lu(1, 5);
        a.add_su(2, 7);
        b.add_lu(1, 3);
        b.add_su(2, 2);
        b.add_su(3, 9);
        a.merge(&b);
        assert_eq!(a.lu(1), 8);
        assert_eq!(a.su(2), 9);
        assert_eq!(a.su(3), 9);
    }

    #[test]
    fn adds_saturate() {
        let mut bins = UtilityBins::new();
        bins.reset(1, 1);
        bins.add_lu(1, u64::MAX);
        bins.add_lu(1, 10);
        assert_eq!(bins.lu(1), u64::MAX);
    }

    #[test]
    fn atomic_vec_accumulates_across_threads() {
        let vec = Arc::new(AtomicUtilityVec::new(4));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let vec = Arc::clone(&vec);
            handles.push(std::thread::spawn(move || {
                for i in 0..4 {
                    for _ in 0..1000 {
                        vec.add(i, 1);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let totals = Arc::try_unwrap(vec).unwrap().into_vec();
        assert_eq!(totals, vec![4000; 4]);
    }
}
