//! Tasks, wait-groups, and the blocking scope for non-worker threads.
//!
//! # Task model
//!
//! A task is a one-shot resumable unit: a boxed closure entered exactly once
//! by the worker that dequeues it. Tasks never outlive the scheduler; a task
//! is alive iff some worker queue references it, and it is freed when its
//! closure returns.
//!
//! # WaitGroup
//!
//! The only cross-task ordering primitive. A group starts with count 1 (the
//! "self" guard held by whoever will attach the continuation):
//!
//! ```text
//! new()            count = 1, no continuation
//! add(n)           count += n                      (release)
//! done()           count -= 1                      (acq-rel)
//!                  on zero with a continuation attached: run it inline
//!                  on the last caller, exactly once
//! try_await(k)     attach k, then done()           (pairs with the +1)
//! ```
//!
//! `done()` reaching zero happens-after every `add`/work that preceded it, so
//! a continuation observes all child writes. After a `done()` that returns
//! `true`, the caller must not touch the group again: the continuation may
//! have dropped it.
//!
//! [`WaitGuard`] is the RAII form of `add`/`done`: the decrement rides on
//! `Drop`, so a panicking task still signals completion and the run fails
//! with a captured error instead of hanging.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::sync::Parker;

/// A one-shot resumable unit of work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Counter with an attached continuation, resumed exactly once on zero.
pub struct WaitGroup {
    count: AtomicUsize,
    armed: AtomicBool,
    continuation: UnsafeCell<Option<Job>>,
}

// SAFETY: `continuation` is written by exactly one thread (the attacher)
// before its paired `done()`, and read by exactly one thread (whichever
// `done()` observes zero). The acq-rel decrement orders the write before
// the read.
unsafe impl Send for WaitGroup {}
unsafe impl Sync for WaitGroup {}

impl WaitGroup {
    /// A fresh group holding its own +1 self guard.
    pub fn new() -> Self {
        Self {
            count: AtomicUsize::new(1),
            armed: AtomicBool::new(false),
            continuation: UnsafeCell::new(None),
        }
    }

    /// Register `n` more completions.
    #[inline]
    pub fn add(&self, n: usize) {
        self.count.fetch_add(n, Ordering::Release);
    }

    /// Signal one completion. Returns true if this call resumed the
    /// continuation; the group must not be touched afterwards in that case.
    pub fn done(&self) -> bool {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            if self.armed.swap(false, Ordering::AcqRel) {
                // SAFETY: zero is observed by exactly one caller, and the
                // attach happened-before via the acq-rel decrement chain.
                let k = unsafe { (*self.continuation.get()).take() };
                if let Some(k) = k {
                    k();
                    return true;
                }
            }
        }
        false
    }

    /// Attach the continuation and release the self guard. Returns true if
    /// the continuation ran inline (all registered work had finished).
    pub fn try_await(&self, k: Job) -> bool {
        unsafe {
            *self.continuation.get() = Some(k);
        }
        self.armed.store(true, Ordering::Release);
        self.done()
    }

    /// True while a continuation is attached and not yet resumed.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WaitGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitGroup")
            .field("count", &self.count.load(Ordering::Relaxed))
            .field("armed", &self.armed.load(Ordering::Relaxed))
            .finish()
    }
}

/// RAII completion handle: `add(1)` on creation, `done()` on drop.
pub struct WaitGuard {
    wg: Arc<WaitGroup>,
}

impl WaitGuard {
    pub fn new(wg: &Arc<WaitGroup>) -> Self {
        wg.add(1);
        Self {
            wg: Arc::clone(wg),
        }
    }
}

impl Clone for WaitGuard {
    fn clone(&self) -> Self {
        WaitGuard::new(&self.wg)
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.wg.done();
    }
}

/// Blocks a non-worker thread until a wait-group drains.
///
/// The continuation is an unpark of the waiting thread, so the worker that
/// completes last pays one futex wake and nothing else.
pub struct WaitScope {
    wg: Arc<WaitGroup>,
}

impl WaitScope {
    pub fn new() -> Self {
        Self {
            wg: Arc::new(WaitGroup::new()),
        }
    }

    /// A guard to hand to each spawned task.
    pub fn guard(&self) -> WaitGuard {
        WaitGuard::new(&self.wg)
    }

    /// Release the self guard and park until every guard has dropped.
    pub fn wait(self) {
        let parker = Parker::new();
        let unparker = parker.unparker().clone();
        let resumed_inline = self.wg.try_await(Box::new(move || {
            unparker.unpark();
        }));
        if !resumed_inline {
            parker.park();
        }
    }
}

impl Default for WaitScope {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::thread;

    #[test]
    fn continuation_runs_inline_when_no_children() {
        let wg = WaitGroup::new();
        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        let inline = wg.try_await(Box::new(move || f.store(true, Ordering::SeqCst)));
        assert!(inline);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn continuation_waits_for_children() {
        let wg = Arc::new(WaitGroup::new());
        wg.add(2);
        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        assert!(!wg.try_await(Box::new(move || f.store(true, Ordering::SeqCst))));
        assert!(wg.is_ready());
        assert!(!fired.load(Ordering::SeqCst));
        assert!(!wg.done());
        assert!(!fired.load(Ordering::SeqCst));
        assert!(wg.done());
        assert!(fired.load(Ordering::SeqCst));
        assert!(!wg.is_ready());
    }

    #[test]
    fn guards_decrement_on_drop_even_under_panic() {
        let wg = Arc::new(WaitGroup::new());
        let guard = WaitGuard::new(&wg);
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _held = guard;
            panic!("boom");
        }));
        assert!(res.is_err());
        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        assert!(wg.try_await(Box::new(move || f.store(true, Ordering::SeqCst))));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn scope_blocks_until_threaded_children_finish() {
        let scope = WaitScope::new();
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let guard = scope.guard();
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(guard);
            }));
        }
        scope.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn last_done_sees_child_writes() {
        // The continuation must observe values written by every child.
        for _ in 0..100 {
            let scope = WaitScope::new();
            let cell = Arc::new(AtomicU32::new(0));
            for i in 1..=4u32 {
                let guard = scope.guard();
                let cell = Arc::clone(&cell);
                thread::spawn(move || {
                    cell.fetch_add(i, Ordering::Relaxed);
                    drop(guard);
                });
            }
            scope.wait();
            assert_eq!(cell.load(Ordering::Relaxed), 10);
        }
    }
}
