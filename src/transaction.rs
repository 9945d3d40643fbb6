//! Transactions: the compact item/utility record the search projects and
//! merges.
//!
//! # Ownership model
//!
//! The element buffer is reference-counted (`Arc`) and immutable by default.
//! A projection is a shallow copy: same buffer, advanced offset, adjusted
//! aggregates. Sibling projections of one transaction never deep-copy.
//! The one mutating operation, [`Transaction::merge`], requires exclusive
//! ownership; callers clone first when the buffer is aliased (the
//! copy-on-write discipline). Merging into an aliased transaction is an
//! invariant violation, not a silent deep copy.
//!
//! Buffers are reserved exactly once. They live on the heap or, via
//! [`Transaction::reserve_in`] / [`Transaction::clone_in`], in memory the
//! allocator facade placed (another node, the persistent region), carrying a
//! bound deleter so dropping the last owner frees through the right path.
//!
//! # Aggregates
//!
//! `transaction_utility` is the sum of utilities at or after the current
//! offset; `prefix_utility` accumulates the utility of the *chosen* pivot
//! items consumed by prior projections. Projecting by the pivot at position
//! `pos` moves the pivot's utility into `prefix_utility` and discards the
//! utilities of skipped items (positions before `pos`) entirely: skipped
//! items are not part of any itemset the branch will emit. All arithmetic
//! saturates rather than wrapping.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::alloc::{Deleter, Placement, Region};
use crate::error::{MinerError, Result};
use crate::parted::Weighted;

/// Item identifier, ≥ 1 in any valid database.
pub type Item = u32;
/// Non-negative utility.
pub type Utility = u64;

/// One `(item, utility)` pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Elem {
    pub item: Item,
    pub util: Utility,
}

pub const ELEM_BYTES: usize = std::mem::size_of::<Elem>();

// ============================================================================
// Buffers
// ============================================================================

enum Buf {
    Heap(Box<[Elem]>),
    Region(RegionBuf),
}

/// Facade-allocated element storage with its bound deleter.
struct RegionBuf {
    ptr: NonNull<Elem>,
    cap: usize,
    deleter: Deleter,
}

// SAFETY: the buffer is plain `Elem` data reached only through `Transaction`,
// whose `Arc` provides the sharing discipline; the deleter is `Send + Sync`
// by its type.
unsafe impl Send for RegionBuf {}
unsafe impl Sync for RegionBuf {}

impl Drop for RegionBuf {
    fn drop(&mut self) {
        (self.deleter)(self.ptr.cast());
    }
}

impl Buf {
    fn capacity(&self) -> usize {
        match self {
            Buf::Heap(b) => b.len(),
            Buf::Region(r) => r.cap,
        }
    }

    /// The initialized prefix `[0, len)`.
    fn slice(&self, len: usize) -> &[Elem] {
        match self {
            Buf::Heap(b) => &b[..len],
            // SAFETY: callers only pass `len` values previously written via
            // `write`, so the prefix is initialized.
            Buf::Region(r) => unsafe { std::slice::from_raw_parts(r.ptr.as_ptr(), len) },
        }
    }

    fn slice_mut(&mut self, len: usize) -> &mut [Elem] {
        match self {
            Buf::Heap(b) => &mut b[..len],
            // SAFETY: as above, plus exclusive access via `&mut self`.
            Buf::Region(r) => unsafe { std::slice::from_raw_parts_mut(r.ptr.as_ptr(), len) },
        }
    }

    fn write(&mut self, idx: usize, elem: Elem) {
        match self {
            Buf::Heap(b) => b[idx] = elem,
            // SAFETY: idx < cap, checked by the caller.
            Buf::Region(r) => unsafe { r.ptr.as_ptr().add(idx).write(elem) },
        }
    }
}

// ============================================================================
// Transaction
// ============================================================================

pub struct Transaction {
    buf: Option<Arc<Buf>>,
    /// Initialized element count in `buf`.
    len: usize,
    /// Logical start of the live suffix.
    offset: usize,
    pub transaction_utility: Utility,
    pub prefix_utility: Utility,
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            buf: None,
            len: 0,
            offset: 0,
            transaction_utility: 0,
            prefix_utility: 0,
        }
    }

    /// Reserve heap capacity for `n` elements. Exactly once per transaction.
    pub fn reserve(&mut self, n: usize) -> Result<()> {
        if self.buf.is_some() {
            return Err(MinerError::InvariantViolation(
                "transaction re-allocation".into(),
            ));
        }
        self.buf = Some(Arc::new(Buf::Heap(
            vec![Elem::default(); n].into_boxed_slice(),
        )));
        self.len = 0;
        Ok(())
    }

    /// Reserve through the allocator facade (node-bound or persistent).
    pub fn reserve_in(
        &mut self,
        n: usize,
        region: &Arc<Region>,
        placement: Placement,
    ) -> Result<()> {
        if self.buf.is_some() {
            return Err(MinerError::InvariantViolation(
                "transaction re-allocation".into(),
            ));
        }
        if n == 0 {
            return self.reserve(0);
        }
        let ptr = region.alloc(n * ELEM_BYTES, placement)?;
        self.buf = Some(Arc::new(Buf::Region(RegionBuf {
            ptr: ptr.cast(),
            cap: n,
            deleter: Region::bind_deleter(region, placement),
        })));
        self.len = 0;
        Ok(())
    }

    /// Append within the reservation.
    pub fn push(&mut self, elem: Elem) -> Result<()> {
        let len = self.len;
        let buf = self
            .buf
            .as_mut()
            .ok_or_else(|| MinerError::InvariantViolation("push without reservation".into()))?;
        let buf = Arc::get_mut(buf).ok_or_else(|| {
            MinerError::InvariantViolation("push into an aliased transaction".into())
        })?;
        if len >= buf.capacity() {
            return Err(MinerError::InvariantViolation(
                "push beyond reserved capacity".into(),
            ));
        }
        buf.write(len, elem);
        self.len = len + 1;
        Ok(())
    }

    /// Live suffix, `items[offset..len]`.
    #[inline]
    pub fn items(&self) -> &[Elem] {
        match &self.buf {
            None => &[],
            Some(buf) => &buf.slice(self.len)[self.offset..],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len - self.offset
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload weight of the live suffix, in bytes.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.len() * ELEM_BYTES
    }

    /// True when another transaction shares this buffer.
    pub fn is_aliased(&self) -> bool {
        self.buf
            .as_ref()
            .map(|b| Arc::strong_count(b) > 1)
            .unwrap_or(false)
    }

    fn exclusive_slice(&mut self, op: &'static str) -> Result<&mut [Elem]> {
        let len = self.len;
        let buf = self
            .buf
            .as_mut()
            .ok_or_else(|| MinerError::InvariantViolation(format!("{op} on an empty buffer")))?;
        let buf = Arc::get_mut(buf).ok_or_else(|| {
            MinerError::InvariantViolation(format!("{op} on an aliased transaction"))
        })?;
        Ok(buf.slice_mut(len))
    }

    /// Drop elements of the live suffix matching `pred`. Requires exclusive
    /// ownership.
    pub fn erase_if(&mut self, mut pred: impl FnMut(&Elem) -> bool) -> Result<()> {
        if self.buf.is_none() {
            return Ok(());
        }
        let offset = self.offset;
        let len = self.len;
        let slice = self.exclusive_slice("erase_if")?;
        let mut w = offset;
        for r in offset..len {
            if !pred(&slice[r]) {
                slice[w] = slice[r];
                w += 1;
            }
        }
        self.len = w;
        Ok(())
    }

    /// Rewrite each live element. Requires exclusive ownership.
    pub fn map_items(&mut self, mut f: impl FnMut(Elem) -> Elem) -> Result<()> {
        if self.buf.is_none() {
            return Ok(());
        }
        let offset = self.offset;
        let slice = self.exclusive_slice("map_items")?;
        for e in &mut slice[offset..] {
            *e = f(*e);
        }
        Ok(())
    }

    /// Sort the live suffix ascending by item id. Requires exclusive
    /// ownership.
    pub fn sort_items(&mut self) -> Result<()> {
        if self.buf.is_none() {
            return Ok(());
        }
        let offset = self.offset;
        let slice = self.exclusive_slice("sort_items")?;
        slice[offset..].sort_unstable_by_key(|e| e.item);
        Ok(())
    }

    /// Shallow view starting after the pivot at `pos` (an index into
    /// [`Transaction::items`]). The pivot's utility moves into
    /// `prefix_utility`; utilities of skipped items leave both aggregates.
    pub fn projection(&self, pos: usize) -> Transaction {
        let items = self.items();
        debug_assert!(pos < items.len());
        let pivot_util = items[pos].util;
        let mut tu = self.transaction_utility.saturating_sub(pivot_util);
        for e in &items[..pos] {
            tu = tu.saturating_sub(e.util);
        }
        Transaction {
            buf: self.buf.clone(),
            len: self.len,
            offset: self.offset + pos + 1,
            transaction_utility: tu,
            prefix_utility: self.prefix_utility.saturating_add(pivot_util),
        }
    }

    /// Same item sequence (utilities ignored).
    pub fn compare_extension(&self, other: &Transaction) -> bool {
        let a = self.items();
        let b = other.items();
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.item == y.item)
    }

    /// Element-wise utility add; both aggregates add. Requires exclusive
    /// ownership and `compare_extension(&other)`.
    pub fn merge(&mut self, other: Transaction) -> Result<()> {
        debug_assert!(self.compare_extension(&other), "merge of unequal extensions");
        let offset = self.offset;
        let slice = self.exclusive_slice("merge")?;
        for (dst, src) in slice[offset..].iter_mut().zip(other.items()) {
            dst.util = dst.util.saturating_add(src.util);
        }
        self.transaction_utility = self
            .transaction_utility
            .saturating_add(other.transaction_utility);
        self.prefix_utility = self.prefix_utility.saturating_add(other.prefix_utility);
        Ok(())
    }

    /// Owned deep copy of the live suffix on the heap (offset rebased to 0).
    pub fn clone_owned(&self) -> Transaction {
        let items: Box<[Elem]> = self.items().into();
        let n = items.len();
        Transaction {
            buf: Some(Arc::new(Buf::Heap(items))),
            len: n,
            offset: 0,
            transaction_utility: self.transaction_utility,
            prefix_utility: self.prefix_utility,
        }
    }

    /// Owned deep copy placed by the allocator facade.
    pub fn clone_in(&self, region: &Arc<Region>, placement: Placement) -> Result<Transaction> {
        let items = self.items();
        let n = items.len();
        if n == 0 {
            return Ok(self.clone_owned());
        }
        let ptr = region.alloc(n * ELEM_BYTES, placement)?;
        let elems = ptr.cast::<Elem>();
        // SAFETY: fresh allocation of n elements; source and destination are
        // disjoint.
        unsafe {
            std::ptr::copy_nonoverlapping(items.as_ptr(), elems.as_ptr(), n);
        }
        Ok(Transaction {
            buf: Some(Arc::new(Buf::Region(RegionBuf {
                ptr: elems,
                cap: n,
                deleter: Region::bind_deleter(region, placement),
            }))),
            len: n,
            offset: 0,
            transaction_utility: self.transaction_utility,
            prefix_utility: self.prefix_utility,
        })
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Weighted for Transaction {
    fn weight(&self) -> usize {
        self.bytes()
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transaction[")?;
        for (i, e) in self.items().iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}[{}]", e.item, e.util)?;
        }
        write!(
            f,
            "] tu={} pu={}",
            self.transaction_utility, self.prefix_utility
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tx(pairs: &[(Item, Utility)]) -> Transaction {
        let mut t = Transaction::new();
        t.reserve(pairs.len()).unwrap();
        for &(item, util) in pairs {
            t.push(Elem { item, util }).unwrap();
            t.transaction_utility += util;
        }
        t
    }

    #[test]
    fn reserve_twice_is_rejected() {
        let mut t = Transaction::new();
        t.reserve(4).unwrap();
        let err = t.reserve(4).unwrap_err();
        assert!(matches!(err, MinerError::InvariantViolation(_)));
    }

    #[test]
    fn push_beyond_capacity_is_rejected() {
        let mut t = Transaction::new();
        t.reserve(1).unwrap();
        t.push(Elem { item: 1, util: 1 }).unwrap();
        assert!(t.push(Elem { item: 2, util: 1 }).is_err());
    }

    #[test]
    fn projection_adjusts_both_aggregates() {
        let t = tx(&[(1, 3), (2, 5), (3, 2)]);
        assert_eq!(t.transaction_utility, 10);

        // Project by the first item: nothing skipped.
        let p0 = t.projection(0);
        assert_eq!(p0.prefix_utility, 3);
        assert_eq!(p0.transaction_utility, 7);
        assert_eq!(p0.items().len(), 2);
        assert_eq!(
            p0.transaction_utility + p0.prefix_utility,
            t.transaction_utility
        );

        // Project by the middle item: item 1 is skipped, its utility leaves
        // both aggregates.
        let p1 = t.projection(1);
        assert_eq!(p1.prefix_utility, 5);
        assert_eq!(p1.transaction_utility, 2);
        assert_eq!(p1.items(), &[Elem { item: 3, util: 2 }]);
    }

    #[test]
    fn projection_shares_the_buffer() {
        let t = tx(&[(1, 1), (2, 2), (3, 3)]);
        assert!(!t.is_aliased());
        let p = t.projection(0);
        assert!(t.is_aliased());
        assert!(p.is_aliased());
    }

    #[test]
    fn compare_extension_ignores_utilities() {
        let a = tx(&[(2, 1), (3, 9)]);
        let b = tx(&[(2, 7), (3, 1)]);
        let c = tx(&[(2, 1), (4, 9)]);
        assert!(a.compare_extension(&b));
        assert!(!a.compare_extension(&c));
    }

    #[test]
    fn merge_into_aliased_transaction_is_rejected() {
        let t = tx(&[(2, 1), (3, 2)]);
        let mut p = t.projection(0);
        let other = tx(&[(1, 9), (3, 5)]).projection(0);
        assert!(p.compare_extension(&other));
        // p shares t's buffer.
        let err = p.merge(other).unwrap_err();
        assert!(matches!(err, MinerError::InvariantViolation(_)));
    }

    #[test]
    fn clone_then_merge_adds_elementwise() {
        let t1 = tx(&[(1, 1), (2, 2), (3, 3)]);
        let t2 = tx(&[(1, 10), (2, 20), (3, 30)]);
        let p1 = t1.projection(0);
        let p2 = t2.projection(0);
        assert!(p1.compare_extension(&p2));

        let mut merged = p1.clone_owned();
        let (tu1, pu1) = (p1.transaction_utility, p1.prefix_utility);
        merged.merge(p2).unwrap();
        assert_eq!(merged.transaction_utility, tu1 + 50);
        assert_eq!(merged.prefix_utility, pu1 + 10);
        assert_eq!(
            merged.items(),
            &[Elem { item: 2, util: 22 }, Elem { item: 3, util: 33 }]
        );
    }

    #[test]
    fn erase_and_sort_rewrite_the_live_suffix() {
        let mut t = tx(&[(5, 1), (1, 2), (3, 3)]);
        t.erase_if(|e| e.item == 1).unwrap();
        t.sort_items().unwrap();
        let items: Vec<Item> = t.items().iter().map(|e| e.item).collect();
        assert_eq!(items, vec![3, 5]);
        assert_eq!(t.bytes(), 2 * ELEM_BYTES);
    }

    #[test]
    fn region_backed_clone_roundtrips() {
        let region = Arc::new(Region::heap_only());
        let t = tx(&[(1, 4), (2, 6)]);
        let c = t.clone_in(&region, Placement::HEAP).unwrap();
        assert_eq!(c.items(), t.items());
        assert_eq!(c.transaction_utility, t.transaction_utility);
        drop(t);
        assert_eq!(c.items().len(), 2);
    }

    proptest! {
        #[test]
        fn projection_at_zero_preserves_totals(
            utils in prop::collection::vec(0u64..1_000, 1..20)
        ) {
            let pairs: Vec<(Item, Utility)> = utils
                .iter()
                .enumerate()
                .map(|(i, &u)| ((i + 1) as Item, u))
                .collect();
            let mut t = tx(&pairs);
            let total = t.transaction_utility;
            while !t.is_empty() {
                let p = t.projection(0);
                prop_assert_eq!(p.transaction_utility + p.prefix_utility, total);
                t = p;
            }
        }

        #[test]
        fn merge_is_commutative_in_utilities(
            a in prop::collection::vec(0u64..1_000, 1..10),
            b in prop::collection::vec(0u64..1_000, 1..10),
        ) {
            let n = a.len().min(b.len());
            let mk = |utils: &[u64]| {
                let pairs: Vec<(Item, Utility)> = utils[..n]
                    .iter()
                    .enumerate()
                    .map(|(i, &u)| ((i + 1) as Item, u))
                    .collect();
                tx(&pairs)
            };
            let mut ab = mk(&a).clone_owned();
            ab.merge(mk(&b)).unwrap();
            let mut ba = mk(&b).clone_owned();
            ba.merge(mk(&a)).unwrap();
            prop_assert_eq!(ab.items(), ba.items());
            prop_assert_eq!(ab.transaction_utility, ba.transaction_utility);
        }
    }
}
