//! EFIM mining pipeline fused with the task runtime.
//!
//! # Pipeline
//!
//! ```text
//! parse ──► TWU ──► rename/prune/sort ──► first-SU ──► recursive search
//!            │            │                  │              │
//!            β1           β1                 β2          β3 + α3
//! ```
//!
//! Every phase fans out per partition through the scheduler; the β
//! thresholds decide, per unit of work, whether it is heavy enough to pin to
//! its partition's node (`Dest::Node`) or cheap enough to run anywhere. The
//! search additionally speculates on allocation: once a branch has cloned
//! more than α3 bytes of merged transactions, subsequent clones rotate
//! across partitions so their pages land on other nodes (scatter
//! allocation). Both speculations switch off below `stop_*_depth` so leaf
//! calls stay cheap.
//!
//! # Search invariants
//!
//! - `items_to_explore ⊆ items_to_keep`, both ascending in the renamed
//!   namespace where lexicographic order equals TWU order.
//! - For every item, `LU(i) ≥ SU(i)`; pruning by SU prunes subtrees, by LU
//!   prunes single extensions.
//! - Each itemset is enumerated at most once: extensions only move forward
//!   through `items_to_keep`.
//!
//! The upper-bound accumulator is reused thread-locally: neither
//! `calc_utility_and_next_db` nor `calc_upper_bounds` ever suspends, and a
//! steal can only move a task before it starts, so no two live calls share a
//! slot. Scatter-migrated calls run concurrently with their parent's next
//! use of its slot and therefore allocate fresh bins.

use std::cell::RefCell;
use std::cmp::Ordering as CmpOrdering;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::alloc::{Placement, Region};
use crate::bins::{AtomicUtilityVec, UtilityBins};
use crate::error::{MinerError, Result};
use crate::logger::ResultLog;
use crate::parse::{parse_database, Database, ParsedInput};
use crate::parted::PrefixSumVec;
use crate::sched::{Dest, Scheduler, WaitGuard, WaitScope};
use crate::transaction::{Item, Transaction, Utility};

use crossbeam_queue::SegQueue;

/// Projected tails longer than this skip the merge path: comparing and
/// merging long tails costs more than the duplicates save.
pub const MAX_MERGE_TAIL: usize = 1000;

/// Speculation knobs, all weights in bytes of (projected) transaction data.
/// These constants are part of the observable behavior contract.
#[derive(Clone, Copy, Debug)]
pub struct SpecThresholds {
    /// Parse: file chunk size (0 = one chunk).
    pub alpha1: usize,
    /// TWU / rename / sort: partition weight above which work pins to its
    /// partition's node.
    pub beta1: usize,
    /// First subtree-utility pass: same decision.
    pub beta2: usize,
    /// Search: cumulative cloned bytes per branch before clones scatter.
    pub alpha3: usize,
    /// Search: projected-database weight above which a branch migrates.
    pub beta3: usize,
    /// Depth beyond which scatter allocation switches off.
    pub stop_scatter_depth: usize,
    /// Depth beyond which task migration switches off.
    pub stop_migration_depth: usize,
}

impl Default for SpecThresholds {
    fn default() -> Self {
        Self {
            alpha1: 4 << 20,
            beta1: 1 << 20,
            beta2: 1 << 20,
            alpha3: 1 << 20,
            beta3: 64 << 10,
            stop_scatter_depth: 2,
            stop_migration_depth: 4,
        }
    }
}

/// The miner: owns the run-wide collaborators and drives the pipeline.
pub struct Efim {
    sched: Arc<Scheduler>,
    region: Arc<Region>,
    log: Arc<ResultLog>,
    min_util: Utility,
    th: SpecThresholds,
    use_pmem: bool,
    /// Run fan-outs inline on the calling thread (single-worker runs).
    no_await: bool,
    /// Database partition count = nodes with workers.
    partitions: usize,
}

impl Efim {
    pub fn new(
        sched: Arc<Scheduler>,
        region: Arc<Region>,
        log: Arc<ResultLog>,
        min_util: Utility,
        th: SpecThresholds,
        use_pmem: bool,
    ) -> Self {
        let partitions = sched.used_nodes().len().max(1);
        let no_await = sched.worker_count() <= 1;
        Self {
            sched,
            region,
            log,
            min_util,
            th,
            use_pmem,
            no_await,
            partitions,
        }
    }

    /// Mine `input`. Results land in the log; the caller flushes them.
    pub fn run(&self, input: &Path) -> Result<()> {
        let ParsedInput {
            database: mut db,
            max_item,
        } = parse_database(
            &self.sched,
            &self.region,
            input,
            self.sched.node_count(),
            self.th.alpha1,
            self.use_pmem,
            self.no_await,
        )?;
        self.log.time_point("parse");

        if db.is_empty() {
            self.log.time_point("build");
            self.log.time_point("search");
            return Ok(());
        }

        // Fold unused-node partitions away, then even out what the file
        // chunking produced.
        db.shrink(self.partitions);
        let ranges = db.balanced_ranges();
        let mut db = db.repartition(&ranges, |dst, tx, _src, _dst_pid| dst.push_back(tx));

        let twu = self.calc_twu(&mut db, max_item)?;
        let mut items_to_keep: Vec<Item> = (1..=max_item)
            .filter(|&i| twu.get(i as usize) >= self.min_util)
            .collect();
        items_to_keep.sort_by_key(|&i| (twu.get(i as usize), i));
        self.log.time_point("twu");

        if items_to_keep.is_empty() {
            self.log.time_point("build");
            self.log.time_point("search");
            return Ok(());
        }

        // Rename survivors to a dense 1-based namespace in TWU order, so
        // lexicographic order below equals utility order.
        let renamed_count = items_to_keep.len() as Item;
        let mut old_to_new = vec![0 as Item; max_item as usize + 1];
        let mut new_to_old = vec![0 as Item; renamed_count as usize + 1];
        for (idx, &old) in items_to_keep.iter().enumerate() {
            old_to_new[old as usize] = idx as Item + 1;
            new_to_old[idx + 1] = old;
        }
        let keep: Vec<Item> = (1..=renamed_count).collect();

        self.rename_and_sort(&mut db, old_to_new)?;

        let su = self.calc_first_su(&mut db, renamed_count)?;
        let explore: Vec<Item> = keep
            .iter()
            .copied()
            .filter(|&i| su[i as usize] >= self.min_util)
            .collect();
        self.log.time_point("build");

        let ctx = Arc::new(SearchCtx {
            sched: Arc::clone(&self.sched),
            region: Arc::clone(&self.region),
            log: Arc::clone(&self.log),
            new_to_old,
            min_util: self.min_util,
            th: self.th,
            use_pmem: self.use_pmem,
            no_await: self.no_await,
            used_nodes: self.sched.used_nodes(),
            bind_nodes: self.sched.topology().is_physical()
                && self.sched.topology().node_count() > 1,
            scatter_cursor: AtomicUsize::new(0),
        });

        let scope = WaitScope::new();
        search(
            &ctx,
            Vec::new(),
            Arc::new(db),
            Arc::new(keep),
            Arc::new(explore),
            0,
            scope.guard(),
        );
        scope.wait();
        self.sched.errors().check()?;
        self.log.time_point("search");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Partitioned phase driver
    // ------------------------------------------------------------------

    /// Run `f` once per partition. Partitions whose weight reaches `beta`
    /// are posted to their node; lighter ones go anywhere. Ownership of each
    /// partition moves into the task and back, so `f` gets `&mut` without
    /// the database being shared.
    fn for_each_partition<F>(&self, db: &mut Database, beta: usize, f: F) -> Result<()>
    where
        F: Fn(usize, &mut PrefixSumVec<Transaction>) -> Result<()> + Send + Sync + 'static,
    {
        if self.no_await {
            for pid in 0..db.partition_count() {
                f(pid, db.part_mut(pid))?;
            }
            return Ok(());
        }
        let f = Arc::new(f);
        let used = self.sched.used_nodes();
        let results: Arc<SegQueue<(usize, PrefixSumVec<Transaction>)>> = Arc::new(SegQueue::new());
        let scope = WaitScope::new();
        for pid in 0..db.partition_count() {
            let mut part = std::mem::take(db.part_mut(pid));
            let dest = if part.total_weight() >= beta {
                Dest::Node(used[pid % used.len()])
            } else {
                Dest::Any
            };
            let f = Arc::clone(&f);
            let results = Arc::clone(&results);
            let errors = Arc::clone(self.sched.errors());
            let guard = scope.guard();
            self.sched.post(
                Box::new(move || {
                    let _g = guard;
                    if let Err(e) = f(pid, &mut part) {
                        errors.record(e);
                    }
                    results.push((pid, part));
                }),
                dest,
            );
        }
        scope.wait();
        while let Some((pid, part)) = results.pop() {
            *db.part_mut(pid) = part;
        }
        self.sched.errors().check()
    }

    /// Transaction-weighted utility per item, reduced across partitions
    /// with relaxed atomic adds.
    fn calc_twu(&self, db: &mut Database, max_item: Item) -> Result<AtomicUtilityVec> {
        let twu = Arc::new(AtomicUtilityVec::new(max_item as usize + 1));
        let sink = Arc::clone(&twu);
        self.for_each_partition(db, self.th.beta1, move |_pid, part| {
            for tx in part.iter() {
                for e in tx.items() {
                    sink.add(e.item as usize, tx.transaction_utility);
                }
            }
            Ok(())
        })?;
        Arc::try_unwrap(twu)
            .map_err(|_| MinerError::Internal("TWU accumulator still shared after join".into()))
    }

    /// Rewrite items through the rename map, drop the unpromising, restore
    /// per-transaction ascending order, drop empty transactions, and sort
    /// each partition by reverse-lexicographic item order so extension-equal
    /// tails cluster for merging.
    fn rename_and_sort(&self, db: &mut Database, old_to_new: Vec<Item>) -> Result<()> {
        let map = Arc::new(old_to_new);
        self.for_each_partition(db, self.th.beta1, move |_pid, part| {
            for tx in part.iter_mut() {
                tx.map_items(|mut e| {
                    e.item = map[e.item as usize];
                    e
                })?;
                tx.erase_if(|e| e.item == 0)?;
                tx.sort_items()?;
            }
            part.erase_if(|tx| tx.is_empty());
            part.sort_by(cmp_reverse_lex);
            Ok(())
        })
    }

    /// First subtree-utility bound: reversed suffix sums per transaction,
    /// accumulated atomically across partitions.
    fn calc_first_su(&self, db: &mut Database, renamed_count: Item) -> Result<Vec<Utility>> {
        let su = Arc::new(AtomicUtilityVec::new(renamed_count as usize + 1));
        let sink = Arc::clone(&su);
        self.for_each_partition(db, self.th.beta2, move |_pid, part| {
            for tx in part.iter() {
                let mut sum: Utility = 0;
                for e in tx.items().iter().rev() {
                    sum = sum.saturating_add(e.util);
                    sink.add(e.item as usize, sum);
                }
            }
            Ok(())
        })?;
        Ok(Arc::try_unwrap(su)
            .map_err(|_| MinerError::Internal("SU accumulator still shared after join".into()))?
            .into_vec())
    }
}

/// Reverse-lexicographic transaction order (descending over reversed item
/// sequences): transactions ending in the same items become adjacent.
fn cmp_reverse_lex(a: &Transaction, b: &Transaction) -> CmpOrdering {
    let ar = a.items().iter().rev().map(|e| e.item);
    let br = b.items().iter().rev().map(|e| e.item);
    br.cmp(ar)
}

// ============================================================================
// Recursive search
// ============================================================================

struct SearchCtx {
    sched: Arc<Scheduler>,
    region: Arc<Region>,
    log: Arc<ResultLog>,
    new_to_old: Vec<Item>,
    min_util: Utility,
    th: SpecThresholds,
    use_pmem: bool,
    no_await: bool,
    used_nodes: Vec<usize>,
    /// Scatter clones may bind pages to their target node (real NUMA ids
    /// only; synthetic topologies route partitions but allocate normally).
    bind_nodes: bool,
    scatter_cursor: AtomicUsize,
}

thread_local! {
    /// Reused upper-bound bins; sound because bound computation never
    /// suspends (see module docs). Scatter-migrated calls use fresh bins.
    static SEARCH_BINS: RefCell<UtilityBins> = RefCell::new(UtilityBins::new());
}

/// Expand every item of `explore`. Single-extension branches run inline;
/// wider branches post one task per extension, each carrying the β3
/// migration decision.
fn search(
    ctx: &Arc<SearchCtx>,
    prefix: Vec<Item>,
    db: Arc<Database>,
    keep: Arc<Vec<Item>>,
    explore: Arc<Vec<Item>>,
    depth: usize,
    root: WaitGuard,
) {
    ctx.log.add_candidates(explore.len() as u64);
    if explore.len() == 1 {
        search_x(ctx, 0, prefix, &db, &keep, &explore, depth, &root, false);
        return;
    }
    let migrate = depth <= ctx.th.stop_migration_depth
        && ctx.used_nodes.len() > 1
        && db.total_weight() >= ctx.th.beta3;
    let dest = if migrate {
        Dest::Node(branch_home_node(ctx, &db))
    } else {
        Dest::Any
    };
    for j in 0..explore.len() {
        if ctx.no_await {
            search_x(ctx, j, prefix.clone(), &db, &keep, &explore, depth, &root, false);
            continue;
        }
        let ctx2 = Arc::clone(ctx);
        let prefix2 = prefix.clone();
        let db2 = Arc::clone(&db);
        let keep2 = Arc::clone(&keep);
        let explore2 = Arc::clone(&explore);
        let guard = root.clone();
        ctx.sched.post(
            Box::new(move || {
                search_x(
                    &ctx2, j, prefix2, &db2, &keep2, &explore2, depth, &guard, migrate,
                );
            }),
            dest,
        );
    }
}

/// Node owning the heaviest partition of `db`.
fn branch_home_node(ctx: &SearchCtx, db: &Database) -> usize {
    let mut best = 0;
    let mut best_weight = 0;
    for pid in 0..db.partition_count() {
        let w = db.part(pid).total_weight();
        if w > best_weight {
            best_weight = w;
            best = pid;
        }
    }
    ctx.used_nodes[best % ctx.used_nodes.len()]
}

#[allow(clippy::too_many_arguments)]
fn search_x(
    ctx: &Arc<SearchCtx>,
    j: usize,
    prefix: Vec<Item>,
    db: &Arc<Database>,
    keep: &Arc<Vec<Item>>,
    explore: &Arc<Vec<Item>>,
    depth: usize,
    root: &WaitGuard,
    migrated: bool,
) {
    if let Err(e) = search_x_inner(ctx, j, prefix, db, keep, explore, depth, root, migrated) {
        ctx.sched.errors().record(e);
    }
}

#[allow(clippy::too_many_arguments)]
fn search_x_inner(
    ctx: &Arc<SearchCtx>,
    j: usize,
    mut prefix: Vec<Item>,
    db: &Arc<Database>,
    keep: &Arc<Vec<Item>>,
    explore: &Arc<Vec<Item>>,
    depth: usize,
    root: &WaitGuard,
    migrated: bool,
) -> Result<()> {
    let x = explore[j];
    let partitions = db.partition_count();
    let mut projected = Database::new(partitions);
    let mut utility_px: Utility = 0;
    let mut scatter = ScatterState::new(ctx, depth, partitions);
    for pid in 0..partitions {
        project_partition(
            ctx,
            x,
            db.part(pid),
            pid,
            &mut projected,
            &mut utility_px,
            &mut scatter,
        )?;
    }

    let lo = keep[j];
    let hi = *keep.last().expect("keep is nonempty");
    let (new_keep, new_explore) = if migrated {
        let mut bins = UtilityBins::new();
        bins.reset(lo, hi);
        calc_upper_bounds(&mut bins, &projected, keep);
        select_candidates(&bins, keep, j, ctx.min_util)
    } else {
        SEARCH_BINS.with(|cell| {
            let mut bins = cell.borrow_mut();
            bins.reset(lo, hi);
            calc_upper_bounds(&mut bins, &projected, keep);
            select_candidates(&bins, keep, j, ctx.min_util)
        })
    };

    if utility_px >= ctx.min_util || !new_explore.is_empty() {
        prefix.push(ctx.new_to_old[x as usize]);
        if utility_px >= ctx.min_util {
            ctx.log.write_hui(&prefix, utility_px);
        }
        if new_explore.len() == 1 {
            ctx.log.add_candidates(1);
            search_x_inner(
                ctx,
                0,
                prefix,
                &Arc::new(projected),
                &Arc::new(new_keep),
                &Arc::new(new_explore),
                depth + 1,
                root,
                false,
            )?;
        } else if !new_explore.is_empty() {
            search(
                ctx,
                prefix,
                Arc::new(projected),
                Arc::new(new_keep),
                Arc::new(new_explore),
                depth + 1,
                root.clone(),
            );
        }
    }
    Ok(())
}

/// Where a first-merge clone lands: normally its source partition, but once
/// the branch's cumulative cloned bytes exceed α3, clones rotate across
/// partitions so their pages spread over the other nodes.
struct ScatterState<'a> {
    ctx: &'a SearchCtx,
    enabled: bool,
    cloned_bytes: usize,
    cursor: usize,
    partitions: usize,
}

impl<'a> ScatterState<'a> {
    fn new(ctx: &'a SearchCtx, depth: usize, partitions: usize) -> Self {
        Self {
            enabled: partitions > 1 && depth <= ctx.th.stop_scatter_depth,
            cloned_bytes: 0,
            cursor: ctx.scatter_cursor.fetch_add(1, Ordering::Relaxed) % partitions,
            ctx,
            partitions,
        }
    }

    fn default_placement(&self) -> Placement {
        if self.ctx.use_pmem {
            Placement {
                node: None,
                persistent: true,
            }
        } else {
            Placement::HEAP
        }
    }

    fn route(&mut self, src_pid: usize, bytes: usize) -> (usize, Placement) {
        self.cloned_bytes += bytes;
        if self.enabled && self.cloned_bytes > self.ctx.th.alpha3 {
            self.cursor = (self.cursor + 1) % self.partitions;
            let pid = self.cursor;
            if pid != src_pid && self.ctx.bind_nodes && !self.ctx.use_pmem {
                let node = self.ctx.used_nodes[pid % self.ctx.used_nodes.len()];
                return (pid, Placement::on_node(node));
            }
            return (pid, self.default_placement());
        }
        (src_pid, self.default_placement())
    }
}

/// Project one partition by `x`: per-transaction binary search, tail
/// projection, and consecutive-duplicate merging under the copy-on-write
/// discipline (clone on first merge, merge thereafter).
fn project_partition(
    ctx: &SearchCtx,
    x: Item,
    part: &PrefixSumVec<Transaction>,
    pid: usize,
    out: &mut Database,
    utility_px: &mut Utility,
    scatter: &mut ScatterState<'_>,
) -> Result<()> {
    let mut prev: Option<(Transaction, usize)> = None;
    let mut merges_into_prev: u32 = 0;
    for tx in part.iter() {
        let items = tx.items();
        let pos = match items.binary_search_by_key(&x, |e| e.item) {
            Ok(pos) => pos,
            Err(_) => continue,
        };
        if pos + 1 == items.len() {
            // x closes the transaction: utility realized, nothing projected.
            *utility_px =
                utility_px.saturating_add(items[pos].util.saturating_add(tx.prefix_utility));
            continue;
        }
        let tail = items.len() - pos;
        let proj = tx.projection(pos);
        *utility_px = utility_px.saturating_add(proj.prefix_utility);
        if tail > MAX_MERGE_TAIL {
            out.push_back(proj, pid);
            continue;
        }
        let extends_prev = matches!(&prev, Some((held, _)) if proj.compare_extension(held));
        if extends_prev {
            let (held, dst) = prev.as_mut().expect("prev is held");
            if merges_into_prev == 0 {
                let (dst_pid, placement) = scatter.route(pid, held.bytes());
                *held = if placement == Placement::HEAP {
                    held.clone_owned()
                } else {
                    held.clone_in(&ctx.region, placement)?
                };
                *dst = dst_pid;
            }
            held.merge(proj)?;
            merges_into_prev += 1;
        } else {
            if let Some((done, dst_pid)) = prev.take() {
                out.push_back(done, dst_pid);
            }
            prev = Some((proj, pid));
            merges_into_prev = 0;
        }
    }
    if let Some((done, dst_pid)) = prev.take() {
        out.push_back(done, dst_pid);
    }
    Ok(())
}

/// Accumulate LU/SU over the projected database: walk each transaction from
/// its highest item down, binary-searching inside the still-feasible tail of
/// `keep` (the tail shrinks with every probe, hit or miss).
fn calc_upper_bounds(bins: &mut UtilityBins, db: &Database, keep: &[Item]) {
    for pid in 0..db.partition_count() {
        for tx in db.part(pid).iter() {
            let mut remaining: Utility = 0;
            let mut feasible = keep.len();
            for e in tx.items().iter().rev() {
                match keep[..feasible].binary_search(&e.item) {
                    Ok(k) => {
                        remaining = remaining.saturating_add(e.util);
                        bins.add_su(e.item, remaining.saturating_add(tx.prefix_utility));
                        bins.add_lu(
                            e.item,
                            tx.transaction_utility.saturating_add(tx.prefix_utility),
                        );
                        feasible = k;
                    }
                    Err(k) => feasible = k,
                }
            }
        }
    }
}

/// LU keeps an item as extension candidate; SU additionally keeps its
/// subtree worth exploring.
fn select_candidates(
    bins: &UtilityBins,
    keep: &[Item],
    j: usize,
    min_util: Utility,
) -> (Vec<Item>, Vec<Item>) {
    let mut new_keep = Vec::with_capacity(keep.len() - j);
    let mut new_explore = Vec::with_capacity(keep.len() - j);
    for &item in &keep[j + 1..] {
        if bins.su(item) >= min_util {
            new_keep.push(item);
            new_explore.push(item);
        } else if bins.lu(item) >= min_util {
            new_keep.push(item);
        }
    }
    (new_keep, new_explore)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Elem;

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
    fn reverse_lex_order_clusters_equal_tails() {
        let a = tx(&[(1, 1), (3, 1)]);
        let b = tx(&[(2, 1), (3, 1)]);
        let c = tx(&[(1, 1), (2, 1)]);
        // Reversed sequences: a = [3,1], b = [3,2], c = [2,1]; descending
        // order puts b first, then a, then c.
        assert_eq!(cmp_reverse_lex(&b, &a), CmpOrdering::Less);
        assert_eq!(cmp_reverse_lex(&a, &c), CmpOrdering::Less);
        assert_eq!(cmp_reverse_lex(&a, &a), CmpOrdering::Equal);
    }

    #[test]
    fn upper_bounds_match_hand_computation() {
        // Projected DB with one transaction 2[4] 3[1], tu=5, pu=2.
        let mut db = Database::new(1);
        let mut t = tx(&[(1, 2), (2, 4), (3, 1)]).projection(0);
        assert_eq!(t.prefix_utility, 2);
        assert_eq!(t.transaction_utility, 5);
        // keep = [1, 2, 3]; only 2 and 3 appear.
        let keep = vec![1, 2, 3];
        db.push_back(std::mem::take(&mut t), 0);
        let mut bins = UtilityBins::new();
        bins.reset(1, 3);
        calc_upper_bounds(&mut bins, &db, &keep);
        // Walking 3 then 2: SU(3) = 1 + pu = 3; SU(2) = 1+4 + pu = 7.
        assert_eq!(bins.su(3), 3);
        assert_eq!(bins.su(2), 7);
        // LU = tu + pu = 7 for both.
        assert_eq!(bins.lu(3), 7);
        assert_eq!(bins.lu(2), 7);
        assert_eq!(bins.lu(1), 0);
    }

    #[test]
    fn candidate_selection_splits_keep_and_explore() {
        let mut bins = UtilityBins::new();
        bins.reset(1, 4);
        // item 2: SU passes; item 3: only LU passes; item 4: neither.
        bins.add_su(2, 10);
        bins.add_lu(2, 10);
        bins.add_lu(3, 10);
        let keep = vec![1, 2, 3, 4];
        let (new_keep, new_explore) = select_candidates(&bins, &keep, 0, 5);
        assert_eq!(new_keep, vec![2, 3]);
        assert_eq!(new_explore, vec![2]);
    }

    #[test]
    fn projection_merges_equal_extensions_with_cow() {
        // Two transactions with identical tails after projecting by 1.
        let region = Arc::new(Region::heap_only());
        let log = Arc::new(ResultLog::new(1));
        let errors = Arc::new(crate::error::FirstError::new());
        let topo = Arc::new(crate::topology::Topology::single_node());
        let sched = Scheduler::new(1, topo, errors);
        let ctx = SearchCtx {
            sched,
            region,
            log,
            new_to_old: vec![0, 1, 2, 3],
            min_util: 1,
            th: SpecThresholds::default(),
            use_pmem: false,
            no_await: true,
            used_nodes: vec![0],
            bind_nodes: false,
            scatter_cursor: AtomicUsize::new(0),
        };

        let mut db_part: PrefixSumVec<Transaction> = PrefixSumVec::new();
        db_part.push_back(tx(&[(1, 1), (2, 2), (3, 3)]));
        db_part.push_back(tx(&[(1, 10), (2, 20), (3, 30)]));

        let mut out = Database::new(1);
        let mut utility_px = 0;
        let mut scatter = ScatterState::new(&ctx, 0, 1);
        project_partition(&ctx, 1, &db_part, 0, &mut out, &mut utility_px, &mut scatter)
            .unwrap();

        // Both contained 1 with a nonempty tail: prefix utilities 1 and 10.
        assert_eq!(utility_px, 11);
        // Equal extensions merged into one transaction with summed utilities.
        assert_eq!(out.len(), 1);
        let merged = out.part(0).get(0);
        assert_eq!(
            merged.items(),
            &[Elem { item: 2, util: 22 }, Elem { item: 3, util: 33 }]
        );
        assert_eq!(merged.prefix_utility, 11);
        // Source transactions are untouched.
        assert_eq!(db_part.get(0).items().len(), 3);
    }

    #[test]
    fn closing_item_realizes_utility_without_projection() {
        let region = Arc::new(Region::heap_only());
        let log = Arc::new(ResultLog::new(1));
        let errors = Arc::new(crate::error::FirstError::new());
        let topo = Arc::new(crate::topology::Topology::single_node());
        let sched = Scheduler::new(1, topo, errors);
        let ctx = SearchCtx {
            sched,
            region,
            log,
            new_to_old: vec![0, 1, 2],
            min_util: 1,
            th: SpecThresholds::default(),
            use_pmem: false,
            no_await: true,
            used_nodes: vec![0],
            bind_nodes: false,
            scatter_cursor: AtomicUsize::new(0),
        };
        let mut part: PrefixSumVec<Transaction> = PrefixSumVec::new();
        part.push_back(tx(&[(1, 4), (2, 6)]));
        let mut out = Database::new(1);
        let mut utility_px = 0;
        let mut scatter = ScatterState::new(&ctx, 0, 1);
        // Projecting by the last item: nothing to project, utility realized.
        project_partition(&ctx, 2, &part, 0, &mut out, &mut utility_px, &mut scatter).unwrap();
        assert_eq!(utility_px, 6);
        assert!(out.is_empty());
    }
}
