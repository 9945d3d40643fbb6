//! End-to-end mining scenarios.
//!
//! The reference oracle is a brute-force miner over every subset of the item
//! universe; the property under test is the completeness contract:
//! emitted itemsets = { S : utility(S, DB) ≥ min_util }, with
//! utility(S, DB) = Σ over transactions containing S of the utilities of
//! S's items, and each itemset emitted exactly once.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use miner_rs::error::FirstError;
use miner_rs::{Efim, Region, ResultLog, Scheduler, SpecThresholds, Topology};

type ItemsetMap = BTreeMap<Vec<u32>, u64>;

fn write_input(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp input");
    file.write_all(content.as_bytes()).expect("write input");
    file.flush().expect("flush input");
    file
}

/// Mine `content` and return `{ sorted itemset -> utility }`, asserting the
/// no-duplicates contract along the way.
fn mine_with(
    content: &str,
    min_util: u64,
    threads: usize,
    topo: Topology,
    thresholds: SpecThresholds,
) -> ItemsetMap {
    let input = write_input(content);
    let errors = Arc::new(FirstError::new());
    let sched = Scheduler::new(threads, Arc::new(topo), errors);
    sched.start();
    let region = Arc::new(Region::heap_only());
    let log = Arc::new(ResultLog::new(sched.worker_count()));
    let miner = Efim::new(
        Arc::clone(&sched),
        region,
        Arc::clone(&log),
        min_util,
        thresholds,
        false,
    );
    let outcome = miner.run(input.path());
    sched.stop();
    outcome.expect("mining failed");

    let mut out = ItemsetMap::new();
    for hui in log.collected() {
        let mut items = hui.items.clone();
        items.sort_unstable();
        let prev = out.insert(items, hui.utility);
        assert!(prev.is_none(), "itemset emitted twice: {:?}", hui.items);
    }
    out
}

fn mine(content: &str, min_util: u64) -> ItemsetMap {
    mine_with(
        content,
        min_util,
        2,
        Topology::single_node(),
        SpecThresholds::default(),
    )
}

/// Two synthetic nodes regardless of the machine's real topology.
fn two_node_topology() -> Topology {
    Topology::synthetic(&[vec![0], vec![1]])
}

/// Exhaustive oracle over every subset of the item universe.
fn brute_force(content: &str, min_util: u64) -> ItemsetMap {
    let mut txs: Vec<Vec<(u32, u64)>> = Vec::new();
    let mut universe: Vec<u32> = Vec::new();
    for line in content.lines() {
        let line = match line.find(['%', '#', '@']) {
            Some(pos) => &line[..pos],
            None => line,
        };
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        let items: Vec<u32> = fields[0]
            .split_whitespace()
            .map(|t| t.parse().unwrap())
            .collect();
        let utils: Vec<u64> = fields[2]
            .split_whitespace()
            .map(|t| t.parse().unwrap())
            .collect();
        for &i in &items {
            if !universe.contains(&i) {
                universe.push(i);
            }
        }
        txs.push(items.into_iter().zip(utils).collect());
    }
    universe.sort_unstable();
    assert!(universe.len() <= 20, "oracle universe too large");

    let mut out = ItemsetMap::new();
    for mask in 1u32..(1 << universe.len()) {
        let subset: Vec<u32> = universe
            .iter()
            .enumerate()
            .filter(|(k, _)| mask & (1 << k) != 0)
            .map(|(_, &i)| i)
            .collect();
        let mut total: u64 = 0;
        for tx in &txs {
            let utility: Option<u64> = subset
                .iter()
                .map(|&want| tx.iter().find(|(i, _)| *i == want).map(|(_, u)| *u))
                .sum();
            if let Some(u) = utility {
                total += u;
            }
        }
        if total >= min_util {
            out.insert(subset, total);
        }
    }
    out
}

// ============================================================================
// Seed scenarios
// ============================================================================

#[test]
fn empty_input_yields_no_itemsets_and_no_errors() {
    let result = mine("", 5);
    assert!(result.is_empty());
}

#[test]
fn comment_only_input_is_treated_as_empty() {
    let result = mine("% header\n# another\n\n", 5);
    assert!(result.is_empty());
}

#[test]
fn single_transaction_enumerates_exactly_the_qualifying_subsets() {
    let result = mine("1 2 3 : 10 : 3 5 2\n", 5);
    let expected: ItemsetMap = [
        (vec![2], 5),
        (vec![1, 2], 8),
        (vec![2, 3], 7),
        (vec![1, 2, 3], 10),
        (vec![1, 3], 5),
    ]
    .into_iter()
    .collect();
    assert_eq!(result, expected);
    assert_eq!(result.len(), 5);
}

#[test]
fn identical_transactions_merge_without_changing_utilities() {
    let content = "1 2 3 : 10 : 3 5 2\n1 2 3 : 10 : 3 5 2\n";
    let result = mine(content, 10);
    // Merged projections must double every utility relative to one copy.
    assert_eq!(result.get(&vec![1, 2, 3]), Some(&20));
    assert_eq!(result.get(&vec![1, 2]), Some(&16));
    assert_eq!(result, brute_force(content, 10));
}

#[test]
fn matches_brute_force_on_a_mixed_database() {
    let content = "\
1 3 4 : 12 : 5 4 3
2 3 : 9 : 6 3
1 2 3 5 : 14 : 2 4 6 2
4 5 : 7 : 3 4
1 2 : 5 : 1 4
3 5 : 8 : 5 3
";
    for min_util in [1, 5, 9, 14, 25] {
        let mined = mine(content, min_util);
        let oracle = brute_force(content, min_util);
        assert_eq!(mined, oracle, "min_util = {min_util}");
    }
}

#[test]
fn two_partition_run_matches_single_partition_run() {
    let content = "\
1 2 : 6 : 2 4
2 3 : 7 : 3 4
1 3 : 5 : 1 4
1 2 3 : 9 : 2 4 3
";
    let single = mine(content, 6);
    let parted = mine_with(
        content,
        6,
        2,
        two_node_topology(),
        SpecThresholds::default(),
    );
    assert_eq!(single, parted);
    assert_eq!(single, brute_force(content, 6));
}

#[test]
fn tiny_scatter_threshold_changes_nothing_but_timing() {
    let content = "\
1 2 3 : 10 : 3 5 2
1 2 3 : 10 : 3 5 2
2 3 4 : 11 : 4 5 2
1 4 : 6 : 2 4
2 3 4 : 11 : 4 5 2
";
    let scattered = SpecThresholds {
        alpha3: 1,
        stop_scatter_depth: usize::MAX,
        ..SpecThresholds::default()
    };
    let baseline = mine_with(
        content,
        8,
        2,
        two_node_topology(),
        SpecThresholds::default(),
    );
    let with_scatter = mine_with(content, 8, 2, two_node_topology(), scattered);
    assert_eq!(baseline, with_scatter);
    assert_eq!(baseline, brute_force(content, 8));
}

#[test]
fn tiny_chunk_and_migration_thresholds_preserve_results() {
    let content = "\
1 2 3 : 10 : 3 5 2
2 3 4 : 11 : 4 5 2
3 4 5 : 9 : 2 5 2
1 5 : 7 : 3 4
";
    let aggressive = SpecThresholds {
        alpha1: 8,
        beta1: 0,
        beta2: 0,
        beta3: 0,
        ..SpecThresholds::default()
    };
    let mined = mine_with(content, 7, 2, two_node_topology(), aggressive);
    assert_eq!(mined, brute_force(content, 7));
}

#[test]
fn threshold_at_one_emits_every_nonempty_combination_present() {
    let content = "1 2 : 3 : 1 2\n";
    let result = mine(content, 1);
    assert_eq!(result, brute_force(content, 1));
    assert_eq!(result.len(), 3);
}

#[test]
fn high_threshold_prunes_everything() {
    let result = mine("1 2 3 : 10 : 3 5 2\n", 11);
    assert!(result.is_empty());
}

#[test]
fn malformed_line_aborts_before_mining() {
    let input = write_input("1 2 : 10\n");
    let errors = Arc::new(FirstError::new());
    let sched = Scheduler::new(2, Arc::new(Topology::single_node()), errors);
    sched.start();
    let region = Arc::new(Region::heap_only());
    let log = Arc::new(ResultLog::new(sched.worker_count()));
    let miner = Efim::new(
        Arc::clone(&sched),
        region,
        Arc::clone(&log),
        5,
        SpecThresholds::default(),
        false,
    );
    let outcome = miner.run(input.path());
    sched.stop();
    let err = outcome.expect_err("malformed input must fail");
    assert_eq!(err.kind(), "input");
    assert_eq!(log.hui_count(), 0);
}

#[test]
fn shutdown_completes_within_the_bound_after_mining() {
    let input = write_input("1 2 3 : 10 : 3 5 2\n2 3 : 7 : 3 4\n");
    let errors = Arc::new(FirstError::new());
    let sched = Scheduler::new(4, Arc::new(Topology::single_node()), errors);
    sched.start();
    let region = Arc::new(Region::heap_only());
    let log = Arc::new(ResultLog::new(sched.worker_count()));
    let miner = Efim::new(
        Arc::clone(&sched),
        region,
        log,
        5,
        SpecThresholds::default(),
        false,
    );
    miner.run(input.path()).expect("mining failed");
    let start = Instant::now();
    sched.stop();
    assert!(
        start.elapsed() < Duration::from_secs(3),
        "stop took {:?}",
        start.elapsed()
    );
}

#[test]
fn output_lines_use_the_original_namespace_and_format() {
    let input = write_input("7 9 : 9 : 4 5\n");
    let errors = Arc::new(FirstError::new());
    let sched = Scheduler::new(2, Arc::new(Topology::single_node()), errors);
    sched.start();
    let region = Arc::new(Region::heap_only());
    let log = Arc::new(ResultLog::new(sched.worker_count()));
    let miner = Efim::new(
        Arc::clone(&sched),
        region,
        Arc::clone(&log),
        9,
        SpecThresholds::default(),
        false,
    );
    miner.run(input.path()).expect("mining failed");
    sched.stop();

    let mut out = Vec::new();
    log.flush_output(&mut out).expect("flush");
    let text = String::from_utf8(out).expect("utf8 output");
    // {7,9} is the only qualifying itemset; both spellings are the same set.
    assert!(text == "7 9 #UTIL: 9\n" || text == "9 7 #UTIL: 9\n", "got {text:?}");
}
