//! Partitioned, weight-indexed sequences.
//!
//! The database and every projected sub-database are [`PartedVec`]s: `P`
//! partitions (normally one per NUMA node in use), each a [`PrefixSumVec`]
//! that maintains a running sum of a per-element weight (for transactions,
//! their payload bytes). Any contiguous sub-range's total weight is then
//! answerable in O(1), which is what the speculation thresholds and balanced
//! repartitioning are built on.
//!
//! Partition identity is the unit of NUMA placement: partition `p` is bound
//! to node `p mod nodes`, and work over partition `p` is posted with that
//! node as destination hint.

use crate::error::{MinerError, Result};

/// Elements carrying a scheduling weight (bytes, usually).
pub trait Weighted {
    fn weight(&self) -> usize;
}

// ============================================================================
// PrefixSumVec
// ============================================================================

/// A vector whose elements carry a running weight prefix.
///
/// `items[i].1` is the total weight of `items[..i]`. Mutating an element's
/// weight through [`PrefixSumVec::get_mut`] or [`PrefixSumVec::iter_mut`]
/// invalidates the prefixes; such callers must finish with
/// [`PrefixSumVec::recalc`].
#[derive(Clone, Debug)]
pub struct PrefixSumVec<T> {
    items: Vec<(T, usize)>,
    total: usize,
}

impl<T: Weighted> PrefixSumVec<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
        }
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            items: Vec::with_capacity(n),
            total: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn total_weight(&self) -> usize {
        self.total
    }

    pub fn push_back(&mut self, value: T) {
        let before = self.total;
        self.total += value.weight();
        self.items.push((value, before));
    }

    #[inline]
    pub fn get(&self, i: usize) -> &T {
        &self.items[i].0
    }

    #[inline]
    pub fn get_mut(&mut self, i: usize) -> &mut T {
        &mut self.items[i].0
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.items.iter().map(|(v, _)| v)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> + '_ {
        self.items.iter_mut().map(|(v, _)| v)
    }

    /// Weight of `items[i..]` prefix, i.e. total weight of the first `i`
    /// elements.
    #[inline]
    pub fn weight_before(&self, i: usize) -> usize {
        if i >= self.items.len() {
            self.total
        } else {
            self.items[i].1
        }
    }

    /// Total weight of `items[bg..ed]`, O(1).
    #[inline]
    pub fn range_weight(&self, bg: usize, ed: usize) -> usize {
        self.weight_before(ed) - self.weight_before(bg)
    }

    pub fn erase_if(&mut self, mut pred: impl FnMut(&T) -> bool) {
        self.items.retain(|(v, _)| !pred(v));
        self.recalc();
    }

    /// Rebuild the running weights after in-place mutation.
    pub fn recalc(&mut self) {
        let mut sum = 0;
        for (v, before) in &mut self.items {
            *before = sum;
            sum += v.weight();
        }
        self.total = sum;
    }

    pub fn sort_by(&mut self, mut cmp: impl FnMut(&T, &T) -> std::cmp::Ordering) {
        self.items.sort_by(|a, b| cmp(&a.0, &b.0));
        self.recalc();
    }

    /// Move `other`'s elements onto the end.
    pub fn append(&mut self, other: PrefixSumVec<T>) {
        self.items.reserve(other.items.len());
        for (v, _) in other.items {
            self.push_back(v);
        }
    }

    pub fn into_items(self) -> Vec<T> {
        self.items.into_iter().map(|(v, _)| v).collect()
    }
}

impl<T: Weighted> Default for PrefixSumVec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Weighted> FromIterator<T> for PrefixSumVec<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut v = Self::new();
        for item in iter {
            v.push_back(item);
        }
        v
    }
}

// ============================================================================
// PartedVec
// ============================================================================

/// `P ≥ 1` partitions of a [`PrefixSumVec`], flat-iterable in id order.
#[derive(Clone, Debug)]
pub struct PartedVec<T> {
    parts: Vec<PrefixSumVec<T>>,
}

impl<T: Weighted> PartedVec<T> {
    pub fn new(partitions: usize) -> Self {
        assert!(partitions >= 1, "a PartedVec needs at least one partition");
        Self {
            parts: (0..partitions).map(|_| PrefixSumVec::new()).collect(),
        }
    }

    #[inline]
    pub fn partition_count(&self) -> usize {
        self.parts.len()
    }

    #[inline]
    pub fn part(&self, pid: usize) -> &PrefixSumVec<T> {
        &self.parts[pid]
    }

    #[inline]
    pub fn part_mut(&mut self, pid: usize) -> &mut PrefixSumVec<T> {
        &mut self.parts[pid]
    }

    pub fn push_back(&mut self, value: T, pid: usize) {
        self.parts[pid].push_back(value);
    }

    pub fn len(&self) -> usize {
        self.parts.iter().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.iter().all(|p| p.is_empty())
    }

    pub fn total_weight(&self) -> usize {
        self.parts.iter().map(|p| p.total_weight()).sum()
    }

    /// Flat iterator: partitions in id order, empties skipped naturally.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.parts.iter().flat_map(|p| p.iter())
    }

    pub fn erase_if(&mut self, mut pred: impl FnMut(&T) -> bool) {
        for part in &mut self.parts {
            part.erase_if(&mut pred);
        }
    }

    /// Append `other` partition-wise. Partition counts must match.
    pub fn merge(&mut self, other: PartedVec<T>) -> Result<()> {
        if self.partition_count() != other.partition_count() {
            return Err(MinerError::InvariantViolation(format!(
                "merge of {}-way into {}-way partitioned sequence",
                other.partition_count(),
                self.partition_count()
            )));
        }
        for (dst, src) in self.parts.iter_mut().zip(other.parts) {
            if dst.is_empty() {
                *dst = src;
            } else {
                dst.append(src);
            }
        }
        Ok(())
    }

    /// Redistribute into `new_count` partitions, old partition `i` feeding
    /// `i mod new_count`. Growing is a no-op, matching the shrink contract.
    pub fn shrink(&mut self, new_count: usize) {
        if new_count == 0 || new_count >= self.parts.len() {
            return;
        }
        let old = std::mem::take(&mut self.parts);
        self.parts = (0..new_count).map(|_| PrefixSumVec::new()).collect();
        for (i, part) in old.into_iter().enumerate() {
            self.parts[i % new_count].append(part);
        }
    }

    /// Weight of the first `flat` elements of the flat sequence.
    fn weight_before_flat(&self, mut flat: usize) -> usize {
        let mut acc = 0;
        for part in &self.parts {
            if flat < part.len() {
                return acc + part.weight_before(flat);
            }
            flat -= part.len();
            acc += part.total_weight();
        }
        acc
    }

    /// Split the flat sequence into `partition_count` contiguous ranges of
    /// roughly equal weight: each of the first `P-1` ranges is the shortest
    /// prefix reaching `total/P`, the last absorbs the remainder. Returned as
    /// `[bg, ed)` flat indices.
    pub fn balanced_ranges(&self) -> Vec<(usize, usize)> {
        let p = self.partition_count();
        let n = self.len();
        let total = self.total_weight();
        let base = total / p;
        let mut ranges = Vec::with_capacity(p);
        let mut cur = 0usize;
        for _ in 0..p.saturating_sub(1) {
            // First flat index where weight(cur..idx) >= base.
            let (mut lo, mut hi) = (cur, n);
            let before = self.weight_before_flat(cur);
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                if self.weight_before_flat(mid) - before < base {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            ranges.push((cur, lo));
            cur = lo;
        }
        ranges.push((cur, n));
        ranges
    }

    /// Rebuild with one partition per range; `move_fn(dst, elem, src_pid,
    /// dst_pid)` re-homes each element's storage (a cross-node clone when the
    /// partitions live on different nodes).
    pub fn repartition(
        self,
        ranges: &[(usize, usize)],
        mut move_fn: impl FnMut(&mut PrefixSumVec<T>, T, usize, usize),
    ) -> Self {
        debug_assert!(!ranges.is_empty());
        debug_assert_eq!(ranges.last().map(|r| r.1), Some(self.len()));
        let mut new_parts: Vec<PrefixSumVec<T>> =
            (0..ranges.len()).map(|_| PrefixSumVec::new()).collect();
        let mut flat = self
            .parts
            .into_iter()
            .enumerate()
            .flat_map(|(pid, part)| part.into_items().into_iter().map(move |v| (v, pid)));
        for (dst_pid, &(bg, ed)) in ranges.iter().enumerate() {
            for _ in bg..ed {
                let (value, src_pid) = flat.next().expect("ranges cover the flat sequence");
                move_fn(&mut new_parts[dst_pid], value, src_pid, dst_pid);
            }
        }
        Self { parts: new_parts }
    }
}
