//! Result collection and phase timing.
//!
//! # Design
//!
//! Per-worker (cache-padded) buffers collect emitted itemsets with zero
//! cross-thread traffic on the hot path; the final flush runs single-
//! threaded after the root task completes, writing one itemset per line in
//! registration order:
//!
//! ```text
//! <item_1> <item_2> ... <item_k> #UTIL: <utility>
//! ```
//!
//! Items are in the original (pre-rename) namespace. The search tree
//! enumerates each itemset at most once by construction; the flush still
//! carries an at-most-once guard so a duplicate can never reach the output
//! file.
//!
//! Phase time points pair a monotonic clock with `getrusage` snapshots, so
//! the report can show wall time next to user/sys CPU time and the RSS
//! high-water mark per phase.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ahash::AHashSet;
use crossbeam_utils::CachePadded;

use crate::error::Result;
use crate::sched::current_slot;
use crate::transaction::{Item, Utility};

/// One emitted high-utility itemset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hui {
    pub items: Vec<Item>,
    pub utility: Utility,
}

struct SlotBuf {
    huis: Mutex<Vec<Hui>>,
    candidates: AtomicU64,
}

impl SlotBuf {
    fn new() -> Self {
        Self {
            huis: Mutex::new(Vec::new()),
            candidates: AtomicU64::new(0),
        }
    }
}

/// Process resource snapshot (user/sys CPU time, peak RSS).
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcUsage {
    pub user_time: Duration,
    pub sys_time: Duration,
    pub max_rss_bytes: u64,
}

impl ProcUsage {
    #[cfg(unix)]
    pub fn now() -> Self {
        // SAFETY: zeroed rusage is valid; error return handled.
        unsafe {
            let mut ru: libc::rusage = std::mem::zeroed();
            if libc::getrusage(libc::RUSAGE_SELF, &mut ru) != 0 {
                return Self::default();
            }
            Self {
                user_time: timeval_to_duration(ru.ru_utime),
                sys_time: timeval_to_duration(ru.ru_stime),
                max_rss_bytes: if ru.ru_maxrss <= 0 {
                    0
                } else {
                    // Linux reports KiB.
                    (ru.ru_maxrss as u64).saturating_mul(1024)
                },
            }
        }
    }

    #[cfg(not(unix))]
    pub fn now() -> Self {
        Self::default()
    }
}

#[cfg(unix)]
fn timeval_to_duration(tv: libc::timeval) -> Duration {
    let secs = if tv.tv_sec < 0 { 0 } else { tv.tv_sec as u64 };
    let usec = tv.tv_usec.clamp(0, 999_999) as u64;
    Duration::from_secs(secs) + Duration::from_micros(usec)
}

/// One named time point.
#[derive(Clone, Debug)]
pub struct PhasePoint {
    pub name: &'static str,
    pub at: Instant,
    pub usage: ProcUsage,
}

/// Per-phase deltas derived from consecutive time points.
#[derive(Clone, Debug)]
pub struct PhaseDelta {
    pub name: &'static str,
    pub wall: Duration,
    pub user: Duration,
    pub sys: Duration,
    pub max_rss_bytes: u64,
}

/// Concurrent result log: per-worker buffers plus the phase timeline.
pub struct ResultLog {
    slots: Vec<CachePadded<SlotBuf>>,
    points: Mutex<Vec<PhasePoint>>,
}

impl ResultLog {
    /// `worker_slots` buffers for the pool plus one for external threads.
    /// Records the starting time point immediately.
    pub fn new(worker_slots: usize) -> Self {
        let log = Self {
            slots: (0..=worker_slots)
                .map(|_| CachePadded::new(SlotBuf::new()))
                .collect(),
            points: Mutex::new(Vec::new()),
        };
        log.time_point("start");
        log
    }

    #[inline]
    fn slot(&self) -> &SlotBuf {
        let idx = current_slot().unwrap_or(self.slots.len() - 1);
        &self.slots[idx.min(self.slots.len() - 1)]
    }

    /// Record one itemset. `items` must already be in the original
    /// namespace.
    pub fn write_hui(&self, items: &[Item], utility: Utility) {
        let buf = self.slot();
        buf.huis
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Hui {
                items: items.to_vec(),
                utility,
            });
    }

    pub fn add_candidates(&self, n: u64) {
        self.slot().candidates.fetch_add(n, Ordering::Relaxed);
    }

    pub fn hui_count(&self) -> u64 {
        self.slots
            .iter()
            .map(|s| s.huis.lock().unwrap_or_else(|p| p.into_inner()).len() as u64)
            .sum()
    }

    pub fn candidate_count(&self) -> u64 {
        self.slots
            .iter()
            .map(|s| s.candidates.load(Ordering::Relaxed))
            .sum()
    }

    pub fn time_point(&self, name: &'static str) {
        self.points
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(PhasePoint {
                name,
                at: Instant::now(),
                usage: ProcUsage::now(),
            });
    }

    /// Wall time from the first to the last recorded point.
    pub fn total_time(&self) -> Duration {
        let points = self.points.lock().unwrap_or_else(|p| p.into_inner());
        match (points.first(), points.last()) {
            (Some(a), Some(b)) => b.at.duration_since(a.at),
            _ => Duration::ZERO,
        }
    }

    /// Per-phase deltas between consecutive time points.
    pub fn phase_deltas(&self) -> Vec<PhaseDelta> {
        let points = self.points.lock().unwrap_or_else(|p| p.into_inner());
        points
            .windows(2)
            .map(|w| PhaseDelta {
                name: w[1].name,
                wall: w[1].at.duration_since(w[0].at),
                user: w[1].usage.user_time.saturating_sub(w[0].usage.user_time),
                sys: w[1].usage.sys_time.saturating_sub(w[0].usage.sys_time),
                max_rss_bytes: w[1].usage.max_rss_bytes,
            })
            .collect()
    }

    /// Snapshot of every recorded itemset, in flush order.
    pub fn collected(&self) -> Vec<Hui> {
        let mut out = Vec::new();
        for slot in &self.slots {
            out.extend(
                slot.huis
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .iter()
                    .cloned(),
            );
        }
        out
    }

    /// Single-threaded final flush: one itemset per line, registration
    /// order, at most once each. Returns the number of lines written.
    pub fn flush_output<W: Write>(&self, out: &mut W) -> Result<u64> {
        let mut seen: AHashSet<Vec<Item>> = AHashSet::new();
        let mut written = 0;
        for slot in &self.slots {
            let huis = slot.huis.lock().unwrap_or_else(|p| p.into_inner());
            for hui in huis.iter() {
                let mut key = hui.items.clone();
                key.sort_unstable();
                if !seen.insert(key) {
                    continue;
                }
                for (i, item) in hui.items.iter().enumerate() {
                    if i > 0 {
                        write!(out, " ")?;
                    }
                    write!(out, "{item}")?;
                }
                writeln!(out, " #UTIL: {}", hui.utility)?;
                written += 1;
            }
        }
        out.flush()?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_flushes_in_registration_order() {
        let log = ResultLog::new(2);
        log.write_hui(&[2], 5);
        log.write_hui(&[1, 2], 8);
        log.add_candidates(3);

        let mut out = Vec::new();
        let written = log.flush_output(&mut out).unwrap();
        assert_eq!(written, 2);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "2 #UTIL: 5\n1 2 #UTIL: 8\n");
        assert_eq!(log.hui_count(), 2);
        assert_eq!(log.candidate_count(), 3);
    }

    #[test]
    fn flush_guards_against_duplicates() {
        let log = ResultLog::new(1);
        log.write_hui(&[1, 3], 7);
        log.write_hui(&[3, 1], 7);
        let mut out = Vec::new();
        assert_eq!(log.flush_output(&mut out).unwrap(), 1);
    }

    #[test]
    fn phase_deltas_follow_time_points() {
        let log = ResultLog::new(1);
        log.time_point("parse");
        log.time_point("search");
        let deltas = log.phase_deltas();
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].name, "parse");
        assert_eq!(deltas[1].name, "search");
        assert!(log.total_time() >= deltas[0].wall);
    }

    #[test]
    #[cfg(unix)]
    fn rusage_snapshot_is_sane() {
        let usage = ProcUsage::now();
        assert!(usage.max_rss_bytes > 0);
    }
}
