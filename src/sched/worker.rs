//! Per-CPU worker state.
//!
//! A worker owns a lock-free task queue that any thread may push into
//! (targeted posting, wake-with-hand-in) and any worker may steal from. The
//! sleep protocol is a three-state word:
//!
//! ```text
//!            try_sleep (owner CAS)            try_wake_up (CAS) / force_wake_up
//! Running ───────────────────────► Sleeping ─────────────────────► Notified
//!    ▲                                                                │
//!    └────────────────────────────────────────────────────────────────┘
//!                     owner consumes the notification
//! ```
//!
//! Only the owning thread moves the state back to `Running`; wakers only ever
//! CAS `Sleeping → Notified`, apply their hand-in, and unpark. A waker whose
//! CAS loses knows the worker is already awake (or already claimed) and moves
//! on to the next candidate.
//!
//! The OS block/unblock edge is `crossbeam_utils::sync::Parker`, a futex on
//! Linux; the state word stays the coordination primitive and the parker only
//! provides the kernel wait.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crossbeam_deque::Injector;
use crossbeam_utils::sync::Unparker;

use super::task::Job;

pub const RUNNING: u32 = 0;
pub const SLEEPING: u32 = 1;
pub const NOTIFIED: u32 = 2;

/// One worker, pinned to one CPU.
pub struct Worker {
    /// CPU this worker is pinned to.
    pub cpu: usize,
    /// Node owning `cpu`.
    pub node: usize,
    /// Position of `cpu` within its node's CPU list.
    pub id_in_node: usize,
    /// Dense index (0..worker_count) for per-worker buffers.
    pub slot: usize,

    /// Private task queue. LIFO-ish drain by the owner, stealable by anyone.
    pub queue: Injector<Job>,

    pub(super) state: AtomicU32,
    pub(super) stop: AtomicBool,
    pub(super) unparker: Unparker,

    /// Steal victims: other chosen CPUs of this node, then CPUs of other
    /// nodes. Shuffled once at construction so repeated passes diverge.
    pub(super) near_cpus: Vec<usize>,
    pub(super) far_cpus: Vec<usize>,
    pub(super) near_cursor: AtomicUsize,
    pub(super) far_cursor: AtomicUsize,
}

impl Worker {
    pub(super) fn new(
        cpu: usize,
        node: usize,
        id_in_node: usize,
        slot: usize,
        unparker: Unparker,
        near_cpus: Vec<usize>,
        far_cpus: Vec<usize>,
    ) -> Self {
        Self {
            cpu,
            node,
            id_in_node,
            slot,
            queue: Injector::new(),
            state: AtomicU32::new(RUNNING),
            stop: AtomicBool::new(false),
            unparker,
            near_cpus,
            far_cpus,
            near_cursor: AtomicUsize::new(0),
            far_cursor: AtomicUsize::new(0),
        }
    }

    /// Claim a sleeping worker: CAS `Sleeping → Notified`, apply the hand-in,
    /// then unpark. Returns whether the claim won.
    pub fn try_wake_up_with(&self, before_notify: impl FnOnce(&Worker)) -> bool {
        if self
            .state
            .compare_exchange(SLEEPING, NOTIFIED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            before_notify(self);
            self.unparker.unpark();
            true
        } else {
            false
        }
    }

    /// Claim a sleeping worker without a hand-in.
    #[inline]
    pub fn try_wake_up(&self) -> bool {
        self.try_wake_up_with(|_| {})
    }

    /// Unconditional notification: used for task hand-ins to a worker that
    /// may be running, and by shutdown.
    pub fn force_wake_up(&self) {
        self.state.store(NOTIFIED, Ordering::Release);
        self.unparker.unpark();
    }

    /// Request exit. The worker drains its queue and returns from its loop.
    pub fn stop_request(&self) {
        self.stop.store(true, Ordering::Release);
        self.force_wake_up();
    }

    #[inline]
    pub(super) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Owner-only: leave `Sleeping`/`Notified` for `Running`.
    pub(super) fn resume_running(&self) {
        let _ = self.state.compare_exchange(
            SLEEPING,
            RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let _ = self.state.compare_exchange(
            NOTIFIED,
            RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    #[inline]
    pub(super) fn state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }
}

// ============================================================================
// Thread-local worker identity
// ============================================================================

const NO_WORKER: usize = usize::MAX;

thread_local! {
    static CURRENT_CPU: Cell<usize> = const { Cell::new(NO_WORKER) };
    static CURRENT_SLOT: Cell<usize> = const { Cell::new(NO_WORKER) };
}

/// Mark the current thread as worker (`cpu`, `slot`), or clear with `None`.
pub fn set_current_worker(ids: Option<(usize, usize)>) {
    let (cpu, slot) = ids.unwrap_or((NO_WORKER, NO_WORKER));
    CURRENT_CPU.with(|c| c.set(cpu));
    CURRENT_SLOT.with(|c| c.set(slot));
}

/// CPU of the calling worker thread, `None` off the worker pool.
#[inline]
pub fn current_cpu() -> Option<usize> {
    CURRENT_CPU.with(|c| {
        let v = c.get();
        if v == NO_WORKER {
            None
        } else {
            Some(v)
        }
    })
}

/// Dense worker index of the calling thread, `None` off the worker pool.
#[inline]
pub fn current_slot() -> Option<usize> {
    CURRENT_SLOT.with(|c| {
        let v = c.get();
        if v == NO_WORKER {
            None
        } else {
            Some(v)
        }
    })
}
