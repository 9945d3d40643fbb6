//! Input parsing: text file → partitioned transaction database.
//!
//! # Line grammar
//!
//! ```text
//! <items> : <transaction_utility> : <item_utilities>
//! ```
//!
//! `items` is a whitespace-separated list of positive integers;
//! `item_utilities` has the same cardinality, element-wise. `%`, `#` and `@`
//! start a comment stripped to end of line; blank (or comment-only) lines
//! are skipped. Anything else is an `InputError` naming the offending line;
//! mining never starts on a malformed database.
//!
//! # Partitioned, affine parsing
//!
//! The file is mapped once and cut into chunks of roughly `alpha1` bytes
//! (always on newline boundaries). Chunk `i` parses into partition
//! `i mod P`, and the parse task is posted with that partition's node as
//! destination hint, so transaction buffers are first-touched on the node
//! that will mine them. Chunk results merge partition-wise into one
//! database.
//!
//! An empty (or comment-only) input parses to an empty database; the caller
//! short-circuits to an empty result rather than erroring.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use memmap2::Mmap;

use crate::alloc::{Placement, Region};
use crate::error::{MinerError, Result};
use crate::parted::PartedVec;
use crate::sched::{Dest, Scheduler, WaitScope};
use crate::transaction::{Elem, Item, Transaction, Utility};

/// The partitioned transaction database.
pub type Database = PartedVec<Transaction>;

#[derive(Debug)]
pub struct ParsedInput {
    pub database: Database,
    pub max_item: Item,
}

/// Parse `path` into a `partitions`-way database through the scheduler.
///
/// `alpha1` is the chunking weight in bytes (0 = one chunk). `persistent`
/// reserves transaction buffers in the persistent region instead of DRAM.
/// With `no_await`, chunks parse inline on the calling thread.
pub fn parse_database(
    sched: &Arc<Scheduler>,
    region: &Arc<Region>,
    path: &Path,
    partitions: usize,
    alpha1: usize,
    persistent: bool,
    no_await: bool,
) -> Result<ParsedInput> {
    let file = File::open(path)
        .map_err(|e| MinerError::Input(format!("open {}: {e}", path.display())))?;
    let len = file
        .metadata()
        .map_err(|e| MinerError::Input(format!("stat {}: {e}", path.display())))?
        .len();
    if len == 0 {
        return Ok(ParsedInput {
            database: Database::new(partitions),
            max_item: 0,
        });
    }
    // SAFETY: the input file is treated as immutable for the run; a
    // concurrent writer would corrupt the parse, which the line validator
    // surfaces as InputError.
    let map = unsafe { Mmap::map(&file) }
        .map_err(|e| MinerError::Input(format!("mmap {}: {e}", path.display())))?;
    let data = Arc::new(map);

    let chunks = chunk_ranges(&data, alpha1);
    let used_nodes = sched.used_nodes();
    let results: Arc<SegQueue<(Database, Item)>> = Arc::new(SegQueue::new());
    let max_item = Arc::new(AtomicU32::new(0));

    let scope = WaitScope::new();
    for (i, &(bg, ed)) in chunks.iter().enumerate() {
        let pid = i % partitions;
        let node = used_nodes[pid % used_nodes.len()];
        let data = Arc::clone(&data);
        let region = Arc::clone(region);
        let results = Arc::clone(&results);
        let max_item = Arc::clone(&max_item);
        let errors = Arc::clone(sched.errors());
        let work = move || match parse_chunk(&data[bg..ed], pid, partitions, &region, persistent)
        {
            Ok((db, chunk_max)) => {
                max_item.fetch_max(chunk_max, Ordering::Relaxed);
                results.push((db, chunk_max));
            }
            Err(e) => errors.record(e),
        };
        if no_await {
            work();
        } else {
            let guard = scope.guard();
            sched.post(
                Box::new(move || {
                    let _g = guard;
                    work();
                }),
                Dest::Node(node),
            );
        }
    }
    scope.wait();
    sched.errors().check()?;

    let mut database = Database::new(partitions);
    while let Some((chunk_db, _)) = results.pop() {
        database.merge(chunk_db)?;
    }
    Ok(ParsedInput {
        database,
        max_item: max_item.load(Ordering::Relaxed),
    })
}

/// Cut `data` into newline-aligned ranges of roughly `alpha1` bytes.
fn chunk_ranges(data: &[u8], alpha1: usize) -> Vec<(usize, usize)> {
    let len = data.len();
    if alpha1 == 0 || alpha1 >= len {
        return vec![(0, len)];
    }
    let mut ranges = Vec::new();
    let mut pos = 0;
    while pos < len {
        let target = pos + alpha1;
        if target >= len {
            ranges.push((pos, len));
            break;
        }
        let end = memchr::memchr(b'\n', &data[target..])
            .map(|i| target + i + 1)
            .unwrap_or(len);
        ranges.push((pos, end));
        pos = end;
    }
    ranges
}

fn parse_chunk(
    data: &[u8],
    pid: usize,
    partitions: usize,
    region: &Arc<Region>,
    persistent: bool,
) -> Result<(Database, Item)> {
    let mut db = Database::new(partitions);
    let mut max_item: Item = 0;
    let mut start = 0;
    while start <= data.len() {
        let nl = memchr::memchr(b'\n', &data[start..])
            .map(|i| start + i)
            .unwrap_or(data.len());
        let line = &data[start..nl];
        if let Some((elems, tu, line_max)) = parse_line(line)? {
            let mut tx = Transaction::new();
            if persistent {
                tx.reserve_in(
                    elems.len(),
                    region,
                    Placement {
                        node: None,
                        persistent: true,
                    },
                )?;
            } else {
                tx.reserve(elems.len())?;
            }
            for e in elems {
                tx.push(e)?;
            }
            tx.transaction_utility = tu;
            max_item = max_item.max(line_max);
            db.push_back(tx, pid);
        }
        if nl >= data.len() {
            break;
        }
        start = nl + 1;
    }
    Ok((db, max_item))
}

/// Parse one line. `Ok(None)` for blank/comment-only lines.
fn parse_line(line: &[u8]) -> Result<Option<(Vec<Elem>, Utility, Item)>> {
    // Strip comments before touching encoding: the payload left of the
    // comment must still be valid.
    let line = match memchr::memchr3(b'%', b'#', b'@', line) {
        Some(pos) => &line[..pos],
        None => line,
    };
    let text = std::str::from_utf8(line)
        .map_err(|_| MinerError::Input(format!("invalid encoding in line {}", preview(line))))?;
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }

    let fields: Vec<&str> = text.split(':').collect();
    if fields.len() != 3 {
        return Err(MinerError::Input(format!(
            "expected 3 ':'-separated fields in line {}",
            preview(line)
        )));
    }

    let mut elems = Vec::new();
    let mut max_item: Item = 0;
    for tok in fields[0].split_whitespace() {
        let item: Item = tok.parse().map_err(|_| {
            MinerError::Input(format!("bad item '{tok}' in line {}", preview(line)))
        })?;
        if item == 0 {
            return Err(MinerError::Input(format!(
                "item ids start at 1, got 0 in line {}",
                preview(line)
            )));
        }
        max_item = max_item.max(item);
        elems.push(Elem { item, util: 0 });
    }
    if elems.is_empty() {
        return Err(MinerError::Input(format!(
            "no items in line {}",
            preview(line)
        )));
    }

    let tu: Utility = fields[1].trim().parse().map_err(|_| {
        MinerError::Input(format!(
            "bad transaction utility '{}' in line {}",
            fields[1].trim(),
            preview(line)
        ))
    })?;

    let utils: Vec<Utility> = fields[2]
        .split_whitespace()
        .map(|tok| {
            tok.parse().map_err(|_| {
                MinerError::Input(format!("bad utility '{tok}' in line {}", preview(line)))
            })
        })
        .collect::<Result<_>>()?;
    if utils.len() != elems.len() {
        return Err(MinerError::Input(format!(
            "{} items but {} utilities in line {}",
            elems.len(),
            utils.len(),
            preview(line)
        )));
    }
    for (e, u) in elems.iter_mut().zip(utils) {
        e.util = u;
    }
    Ok(Some((elems, tu, max_item)))
}

fn preview(line: &[u8]) -> String {
    let shown = &line[..line.len().min(60)];
    format!("'{}'", String::from_utf8_lossy(shown))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_three_field_grammar() {
        let (elems, tu, max) = parse_line(b"1 2 3 : 10 : 3 5 2").unwrap().unwrap();
        assert_eq!(tu, 10);
        assert_eq!(max, 3);
        assert_eq!(
            elems,
            vec![
                Elem { item: 1, util: 3 },
                Elem { item: 2, util: 5 },
                Elem { item: 3, util: 2 },
            ]
        );
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        assert!(parse_line(b"").unwrap().is_none());
        assert!(parse_line(b"   ").unwrap().is_none());
        assert!(parse_line(b"% full line comment").unwrap().is_none());
        assert!(parse_line(b"@ meta").unwrap().is_none());
        let (elems, tu, _) = parse_line(b"1 : 4 : 4 # trailing").unwrap().unwrap();
        assert_eq!(tu, 4);
        assert_eq!(elems.len(), 1);
    }

    #[test]
    fn malformed_lines_are_input_errors() {
        assert!(parse_line(b"1 2 3 : 10").is_err());
        assert!(parse_line(b"1 2 : 10 : 3").is_err());
        assert!(parse_line(b"a b : 10 : 1 2").is_err());
        assert!(parse_line(b"0 1 : 10 : 1 2").is_err());
        assert!(parse_line(b" : 10 : ").is_err());
    }

    #[test]
    fn chunks_cut_on_newlines() {
        let data = b"aaaa\nbbbb\ncccc\n";
        let ranges = chunk_ranges(data, 6);
        assert_eq!(ranges.first().map(|r| r.0), Some(0));
        assert_eq!(ranges.last().map(|r| r.1), Some(data.len()));
        for w in ranges.windows(2) {
            assert_eq!(w[0].1, w[1].0);
            assert_eq!(data[w[0].1 - 1], b'\n');
        }
    }

    #[test]
    fn chunk_parse_builds_partitioned_transactions() {
        let region = Arc::new(Region::heap_only());
        let data = b"1 2 : 7 : 3 4\n2 3 : 5 : 1 4\n";
        let (db, max) = parse_chunk(data, 1, 2, &region, false).unwrap();
        assert_eq!(max, 3);
        assert_eq!(db.part(0).len(), 0);
        assert_eq!(db.part(1).len(), 2);
        let tx = db.part(1).get(0);
        assert_eq!(tx.transaction_utility, 7);
        assert_eq!(tx.items().len(), 2);
    }
}
