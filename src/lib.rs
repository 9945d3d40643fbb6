//! miner-rs: NUMA-aware high-utility itemset mining.
//!
//! # Overview
//!
//! Mines every itemset whose total utility across a transaction database
//! reaches a user-given threshold, using an EFIM-style depth-first search
//! fused with a NUMA-aware cooperative task runtime: per-CPU workers with
//! work-stealing, node-targeted task posting, and speculation thresholds
//! that decide when projected data is worth scattering across nodes and
//! when a search branch is worth migrating to another node.
//!
//! ```text
//!  input file ──► parse (partitioned, node-affine)
//!                    │
//!                    ▼
//!          TWU ──► rename ──► sort ──► first-SU        (build phases)
//!                    │
//!                    ▼
//!        search(prefix, projected DB, keep, explore)   (task tree)
//!                    │
//!                    ▼
//!        per-worker result buffers ──► flush + report
//! ```
//!
//! # Module map
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`topology`] | NUMA nodes, CPU↔node mapping, near-first orderings |
//! | [`alloc`] | Heap / node-bound / persistent-region allocation facade |
//! | [`sched`] | Tasks, wait-groups, workers, the scheduler |
//! | [`parted`] | Prefix-sum-indexed partitioned sequences |
//! | [`transaction`] | Shared-payload transactions: projection, merge |
//! | [`bins`] | LU/SU upper-bound accumulators |
//! | [`parse`] | Input file → partitioned database |
//! | [`efim`] | The mining pipeline and recursive search |
//! | [`logger`] | Per-worker result buffers, phase timing |
//! | [`report`] | Text / JSON run report |
//! | [`error`] | Error kinds and first-error capture |

pub mod alloc;
pub mod bins;
pub mod efim;
pub mod error;
pub mod logger;
pub mod parse;
pub mod parted;
pub mod report;
pub mod sched;
pub mod topology;
pub mod transaction;

pub use alloc::{Placement, Region};
pub use efim::{Efim, SpecThresholds};
pub use error::{FirstError, MinerError, Result};
pub use logger::ResultLog;
pub use parse::{parse_database, Database, ParsedInput};
pub use parted::{PartedVec, PrefixSumVec, Weighted};
pub use report::RunReport;
pub use sched::{Dest, Scheduler, WaitGroup, WaitGuard, WaitScope};
pub use topology::Topology;
pub use transaction::{Elem, Item, Transaction, Utility};
