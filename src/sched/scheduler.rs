//! NUMA-aware work-stealing scheduler.
//!
//! # Architecture
//!
//! ```text
//!                  ┌────────────────────────────────────────────────────┐
//!                  │                    Scheduler                       │
//!  post(Any) ──────┼──► wake-with-hand-in (near nodes first)            │
//!  post(Node n) ───┼──► wake on n / corresponding worker / n's spill    │
//!                  │                                                    │
//!                  │  global queue     node 0 spill      node 1 spill   │
//!                  │       │                │                 │         │
//!                  │  ┌────▼────┐      ┌────▼────┐       ┌────▼────┐    │
//!                  │  │worker c0│ ◄──► │worker c1│ ◄───► │worker c8│    │
//!                  │  │ (queue) │steal │ (queue) │ steal │ (queue) │    │
//!                  │  └─────────┘      └─────────┘       └─────────┘    │
//!                  └────────────────────────────────────────────────────┘
//! ```
//!
//! One worker per chosen CPU, pinned, filled node 0 first so low thread
//! counts stay on one socket. Each worker drains its own queue, then steals:
//! own node's spill queue → global queue → one pass over the (shuffled)
//! other CPUs of its node → one pass over the (shuffled) CPUs of other
//! nodes.
//!
//! # Posting rules
//!
//! `post(job, Any)`:
//! 1. If any worker anywhere sleeps, walk this node's near-first node order
//!    and round-robin each node's CPUs, claiming the first sleeper with a
//!    task hand-in (the job lands directly in the woken worker's queue).
//! 2. Else, a worker caller pushes onto its own queue (no cross-thread
//!    traffic; it is running and will drain it).
//! 3. Else (external caller), push to the global queue and wake anyone.
//!
//! `post(job, Node(n))`:
//! 1. Claim a sleeper on `n` with hand-in.
//! 2. A worker caller pushes to the *corresponding* worker on `n` (same
//!    `id_in_node`) and force-wakes it. If `n` has fewer workers than the
//!    caller's node, the index misses and we fall through.
//! 3. Push onto `n`'s spill queue and wake any worker of `n`.
//!
//! A node destination is a placement hint, not a guarantee: a node with no
//! workers degrades to `Any`.
//!
//! # Ordering
//!
//! The only cross-task edge is the wait-group (children before the parent's
//! continuation). Sibling tasks are unordered. There is no task-level
//! cancellation; [`Scheduler::stop`] force-wakes every worker, lets them
//! observe the stop flag, and joins. Panics inside tasks are caught and
//! recorded as the run's first error; the panicking task still counts as
//! completed via its dropped wait-guard.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicIsize, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_deque::{Injector, Steal};
use crossbeam_utils::sync::Parker;
use crossbeam_utils::CachePadded;

use crate::error::{FirstError, MinerError};
use crate::topology::Topology;

use super::affinity::try_pin_to_core;
use super::rng::XorShift64;
use super::task::Job;
use super::worker::{current_cpu, set_current_worker, Worker};

/// Spin rounds (with steal attempts) before a worker parks.
const SLEEP_SPIN_ROUNDS: u32 = 100;

/// Posting destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dest {
    /// Anywhere; prefer waking a near sleeper.
    Any,
    /// Best-effort placement on this node.
    Node(usize),
}

/// Aggregate counters, read after the run.
#[derive(Clone, Copy, Debug, Default)]
pub struct SchedStats {
    pub tasks_executed: u64,
    pub steals: u64,
}

pub struct Scheduler {
    /// Back-reference handed to worker threads at start.
    self_ref: Weak<Scheduler>,
    topo: Arc<Topology>,
    errors: Arc<FirstError>,

    /// Workers indexed by CPU id; `None` for CPUs without a worker.
    workers: Vec<Option<Arc<Worker>>>,
    /// Chosen CPUs in slot order (node-major).
    slots: Vec<usize>,
    /// Chosen CPUs grouped per node.
    node_cpus: Vec<Vec<usize>>,

    sleeping: Vec<CachePadded<AtomicIsize>>,
    wake_cursor: Vec<CachePadded<AtomicUsize>>,

    global: Injector<Job>,
    node_queues: Vec<Injector<Job>>,

    executed: Vec<CachePadded<AtomicU64>>,
    steals: Vec<CachePadded<AtomicU64>>,

    parkers: Mutex<Vec<Option<Parker>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Build a scheduler with `thread_num` workers over `topo`.
    ///
    /// Thread counts above the CPU count are clamped with a warning, not an
    /// error.
    pub fn new(thread_num: usize, topo: Arc<Topology>, errors: Arc<FirstError>) -> Arc<Self> {
        let cpus = topo.cpus_node_major();
        let mut thread_num = thread_num.max(1);
        if thread_num > cpus.len() {
            eprintln!(
                "WARN: {} threads requested but only {} CPUs available; clamping",
                thread_num,
                cpus.len()
            );
            thread_num = cpus.len();
        }
        let chosen: Vec<usize> = cpus[..thread_num].to_vec();
        let node_count = topo.node_count();

        let mut node_cpus = vec![Vec::new(); node_count];
        for &cpu in &chosen {
            node_cpus[topo.cpu_to_node(cpu)].push(cpu);
        }

        let max_cpu = chosen.iter().copied().max().unwrap_or(0);
        let mut workers: Vec<Option<Arc<Worker>>> = (0..=max_cpu).map(|_| None).collect();
        let mut parkers: Vec<Option<Parker>> = Vec::with_capacity(thread_num);

        let mut seed_rng = XorShift64::new(0x853c_49e6_748f_ea9b);
        for (slot, &cpu) in chosen.iter().enumerate() {
            let node = topo.cpu_to_node(cpu);
            let id_in_node = node_cpus[node]
                .iter()
                .position(|&c| c == cpu)
                .expect("cpu grouped under its node");

            let mut near: Vec<usize> = node_cpus[node]
                .iter()
                .copied()
                .filter(|&c| c != cpu)
                .collect();
            let mut far: Vec<usize> = chosen
                .iter()
                .copied()
                .filter(|&c| topo.cpu_to_node(c) != node)
                .collect();
            let mut rng = XorShift64::new(seed_rng.next_u64() ^ (cpu as u64));
            rng.shuffle(&mut near);
            rng.shuffle(&mut far);

            let parker = Parker::new();
            let unparker = parker.unparker().clone();
            parkers.push(Some(parker));
            workers[cpu] = Some(Arc::new(Worker::new(
                cpu, node, id_in_node, slot, unparker, near, far,
            )));
        }

        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            topo,
            errors,
            workers,
            slots: chosen,
            node_cpus,
            sleeping: (0..node_count)
                .map(|_| CachePadded::new(AtomicIsize::new(0)))
                .collect(),
            wake_cursor: (0..node_count)
                .map(|_| CachePadded::new(AtomicUsize::new(0)))
                .collect(),
            global: Injector::new(),
            node_queues: (0..node_count).map(|_| Injector::new()).collect(),
            executed: (0..thread_num)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
            steals: (0..thread_num)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
            parkers: Mutex::new(parkers),
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.slots.len()
    }

    pub fn node_count(&self) -> usize {
        self.node_cpus.len()
    }

    /// Nodes that actually have workers, in id order.
    pub fn used_nodes(&self) -> Vec<usize> {
        (0..self.node_count())
            .filter(|&n| !self.node_cpus[n].is_empty())
            .collect()
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topo
    }

    pub fn errors(&self) -> &Arc<FirstError> {
        &self.errors
    }

    /// Spawn and pin the worker threads. Idempotence is not supported; call
    /// once.
    pub fn start(&self) {
        let this = self.self_ref.upgrade().expect("scheduler dropped");
        let mut parkers = self.parkers.lock().unwrap_or_else(|p| p.into_inner());
        let mut threads = self.threads.lock().unwrap_or_else(|p| p.into_inner());
        for (slot, &cpu) in self.slots.iter().enumerate() {
            let parker = parkers[slot].take().expect("scheduler started twice");
            let sched = Arc::clone(&this);
            let worker = Arc::clone(self.workers[cpu].as_ref().expect("worker exists"));
            let handle = thread::Builder::new()
                .name(format!("miner-worker-{cpu}"))
                .spawn(move || {
                    try_pin_to_core(cpu);
                    set_current_worker(Some((cpu, worker.slot)));
                    sched.worker_loop(&worker, &parker);
                    set_current_worker(None);
                })
                .expect("failed to spawn worker thread");
            threads.push(handle);
        }
    }

    /// Post a task. See the module docs for the destination rules.
    pub fn post(&self, job: Job, dest: Dest) {
        match dest {
            Dest::Node(n) if n < self.node_count() && !self.node_cpus[n].is_empty() => {
                self.post_to_node(job, n)
            }
            _ => self.post_any(job),
        }
    }

    fn post_any(&self, job: Job) {
        let mut job = Some(job);
        if self.total_sleeping() > 0 {
            let this_node = current_cpu()
                .map(|c| self.topo.cpu_to_node(c))
                .unwrap_or(0);
            for &node in self.topo.near_node_ids(this_node) {
                if self.try_wake_on_node(node, &mut job) {
                    return;
                }
            }
        }
        let job = job.take().expect("job not consumed");
        if let Some(cpu) = current_cpu() {
            if let Some(me) = self.workers.get(cpu).and_then(|w| w.as_ref()) {
                me.queue.push(job);
                return;
            }
        }
        self.global.push(job);
        for &cpu in &self.slots {
            if let Some(w) = &self.workers[cpu] {
                if w.try_wake_up() {
                    return;
                }
            }
        }
    }

    fn post_to_node(&self, job: Job, n: usize) {
        let mut job = Some(job);
        if self.sleeping[n].load(Ordering::Acquire) > 0 && self.try_wake_on_node(n, &mut job) {
            return;
        }
        let job = job.take().expect("job not consumed");
        if let Some(cpu) = current_cpu() {
            if let Some(me) = self.workers.get(cpu).and_then(|w| w.as_ref()) {
                if let Some(&target) = self.node_cpus[n].get(me.id_in_node) {
                    if let Some(w) = &self.workers[target] {
                        w.queue.push(job);
                        w.force_wake_up();
                        return;
                    }
                }
                // Smaller destination node: no corresponding worker, fall
                // through to the spill queue.
            }
        }
        self.node_queues[n].push(job);
        for &cpu in &self.node_cpus[n] {
            if let Some(w) = &self.workers[cpu] {
                if w.try_wake_up() {
                    return;
                }
            }
        }
    }

    /// Round-robin the node's CPUs and claim the first sleeper with a
    /// hand-in. `job` is consumed exactly when this returns true.
    fn try_wake_on_node(&self, node: usize, job: &mut Option<Job>) -> bool {
        let cpus = &self.node_cpus[node];
        if cpus.is_empty() {
            return false;
        }
        for _ in 0..cpus.len() {
            let idx = self.wake_cursor[node].fetch_add(1, Ordering::Relaxed) % cpus.len();
            if let Some(w) = &self.workers[cpus[idx]] {
                if w.try_wake_up_with(|w| w.queue.push(job.take().expect("job available"))) {
                    return true;
                }
            }
        }
        false
    }

    fn total_sleeping(&self) -> isize {
        self.sleeping
            .iter()
            .map(|c| c.load(Ordering::Acquire))
            .sum()
    }

    /// Force-wake everyone, let them observe the stop flag, and join.
    ///
    /// Callers are expected to have drained the run (root wait-group
    /// completed) before stopping; tasks still queued at stop are dropped.
    pub fn stop(&self) {
        for &cpu in &self.slots {
            if let Some(w) = &self.workers[cpu] {
                w.stop_request();
            }
        }
        let mut threads = self.threads.lock().unwrap_or_else(|p| p.into_inner());
        for handle in threads.drain(..) {
            if handle.join().is_err() {
                self.errors
                    .record(MinerError::Internal("worker thread panicked".into()));
            }
        }
    }

    pub fn stats(&self) -> SchedStats {
        SchedStats {
            tasks_executed: self.executed.iter().map(|c| c.load(Ordering::Relaxed)).sum(),
            steals: self.steals.iter().map(|c| c.load(Ordering::Relaxed)).sum(),
        }
    }

    // ------------------------------------------------------------------
    // Worker side
    // ------------------------------------------------------------------

    fn worker_loop(&self, worker: &Arc<Worker>, parker: &Parker) {
        loop {
            while self.execute_one(worker) {}
            self.try_sleep(worker, parker);
            if worker.stop_requested() {
                return;
            }
        }
    }

    /// Run one task: own queue first, then the steal ladder.
    fn execute_one(&self, worker: &Worker) -> bool {
        if let Some(job) = steal_one(&worker.queue) {
            self.run_job(worker, job);
            return true;
        }
        if let Some(job) = self.try_steal(worker) {
            self.steals[worker.slot].fetch_add(1, Ordering::Relaxed);
            self.run_job(worker, job);
            return true;
        }
        false
    }

    /// Steal ladder: own node spill → global → near pass → far pass.
    fn try_steal(&self, worker: &Worker) -> Option<Job> {
        if let Some(job) = steal_one(&self.node_queues[worker.node]) {
            return Some(job);
        }
        if let Some(job) = steal_one(&self.global) {
            return Some(job);
        }
        if let Some(job) = self.steal_pass(&worker.near_cpus, &worker.near_cursor) {
            return Some(job);
        }
        if let Some(job) = self.steal_pass(&worker.far_cpus, &worker.far_cursor) {
            return Some(job);
        }
        None
    }

    /// One full pass over `victims`, resuming from the persistent cursor.
    fn steal_pass(&self, victims: &[usize], cursor: &AtomicUsize) -> Option<Job> {
        let n = victims.len();
        if n == 0 {
            return None;
        }
        let start = cursor.load(Ordering::Relaxed);
        for i in 0..n {
            let idx = (start + i) % n;
            if let Some(victim) = self.workers.get(victims[idx]).and_then(|w| w.as_ref()) {
                if let Some(job) = steal_one(&victim.queue) {
                    cursor.store(idx + 1, Ordering::Relaxed);
                    return Some(job);
                }
            }
        }
        None
    }

    fn run_job(&self, worker: &Worker, job: Job) {
        self.executed[worker.slot].fetch_add(1, Ordering::Relaxed);
        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
            let msg = panic_message(&payload);
            self.errors
                .record(MinerError::Internal(format!("task panicked: {msg}")));
        }
    }

    /// CAS Running→Sleeping, spin-recheck the execute path, then park on the
    /// state word. Only the owning thread leaves Sleeping for Running.
    fn try_sleep(&self, worker: &Arc<Worker>, parker: &Parker) {
        use super::worker::{RUNNING, SLEEPING};

        if worker
            .state
            .compare_exchange(RUNNING, SLEEPING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Notified while running: consume and go around.
            worker.resume_running();
            return;
        }
        self.sleeping[worker.node].fetch_add(1, Ordering::Release);

        for _ in 0..SLEEP_SPIN_ROUNDS {
            if worker.state() != SLEEPING || worker.stop_requested() {
                break;
            }
            if self.execute_one(worker) {
                self.sleeping[worker.node].fetch_sub(1, Ordering::Release);
                worker.resume_running();
                return;
            }
            thread::yield_now();
        }

        while worker.state() == SLEEPING && !worker.stop_requested() {
            parker.park();
        }
        self.sleeping[worker.node].fetch_sub(1, Ordering::Release);
        worker.resume_running();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.slots.len())
            .field("nodes", &self.node_count())
            .finish()
    }
}

fn steal_one(injector: &Injector<Job>) -> Option<Job> {
    loop {
        match injector.steal() {
            Steal::Success(job) => return Some(job),
            Steal::Empty => return None,
            Steal::Retry => continue,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
