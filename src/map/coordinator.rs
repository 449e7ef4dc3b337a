//! Shared state of the workers of one build.
//!
//! A [`BuildCoordinator`] owns the priority queue of pending nodes, the
//! address reservation table and the counters behind progress reports. It
//! lives for exactly one build and is handed to every worker by reference.

use crate::error::{MapError, Result};
use crate::map::node::NodeId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Lock a mutex, taking over the data of a worker that panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

/// Snapshot handed to build progress callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildProgress {
    pub processed: usize,
    pub queued: usize,
    pub nodes: usize,
    pub last_probability: f32,
    pub elapsed: Duration,
}

/// Callback for build progress.
pub type BuildProgressFn<'a> = &'a (dyn Fn(&BuildProgress) + Send + Sync);

#[derive(Debug, Clone, Copy)]
struct QueueEntry {
    probability: f32,
    seq: u64,
    node: NodeId,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // Highest probability first, then insertion order.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.probability
            .total_cmp(&other.probability)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Max-probability-first queue of nodes waiting for expansion.
#[derive(Debug, Default)]
pub struct WorkQueue {
    heap: Mutex<BinaryHeap<QueueEntry>>,
    seq: AtomicU64,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, node: NodeId, probability: f32) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        lock(&self.heap).push(QueueEntry {
            probability,
            seq,
            node,
        });
    }

    /// Pop the most promising node. `on_pop` runs under the queue lock and
    /// also sees an empty queue.
    fn pop_with<F: FnOnce(Option<NodeId>) -> R, R>(&self, on_pop: F) -> R {
        let mut heap = lock(&self.heap);
        let node = heap.pop().map(|e| e.node);
        on_pop(node)
    }

    pub fn pop(&self) -> Option<NodeId> {
        self.pop_with(|n| n)
    }

    pub fn len(&self) -> usize {
        lock(&self.heap).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.heap).clear();
    }
}

/// Table of the addresses workers are currently expanding.
///
/// At most one worker holds a given address. A worker that finds its target
/// taken waits on the holder's lock and then scans again, since the table
/// may have changed while it waited.
#[derive(Debug)]
pub struct AddressReservations {
    slots: Mutex<Vec<Option<u64>>>,
    holders: Vec<Mutex<()>>,
}

/// Held reservation. Dropping it frees the address and wakes waiters.
#[derive(Debug)]
pub struct ReservationGuard<'a> {
    table: &'a AddressReservations,
    worker: usize,
    address: u64,
    _held: MutexGuard<'a, ()>,
}

impl ReservationGuard<'_> {
    pub fn address(&self) -> u64 {
        self.address
    }
}

impl Drop for ReservationGuard<'_> {
    fn drop(&mut self) {
        let mut slots = lock(&self.table.slots);
        slots[self.worker] = None;
    }
}

impl AddressReservations {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            slots: Mutex::new(vec![None; workers]),
            holders: (0..workers).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn workers(&self) -> usize {
        self.holders.len()
    }

    /// Reserve `address` for `worker`, blocking while another worker holds it.
    ///
    /// # Panics
    ///
    /// Panics if `worker` is not a slot of this table.
    pub fn reserve(&self, worker: usize, address: u64) -> ReservationGuard<'_> {
        assert!(worker < self.holders.len(), "worker slot {worker} out of range");
        let mut slots = lock(&self.slots);
        loop {
            slots[worker] = None;
            let holder = slots
                .iter()
                .enumerate()
                .find_map(|(i, s)| (i != worker && *s == Some(address)).then_some(i));
            match holder {
                Some(other) => {
                    drop(slots);
                    trace!(worker, other, address = format_args!("{address:#x}"), "Waiting for reservation");
                    drop(lock(&self.holders[other]));
                    slots = lock(&self.slots);
                }
                None => {
                    slots[worker] = Some(address);
                    // Taken while the table is locked, so waiters that see
                    // the slot always find the lock held.
                    let held = lock(&self.holders[worker]);
                    return ReservationGuard {
                        table: self,
                        worker,
                        address,
                        _held: held,
                    };
                }
            }
        }
    }

    /// Addresses reserved right now.
    pub fn reserved(&self) -> Vec<u64> {
        lock(&self.slots).iter().flatten().copied().collect()
    }
}

/// What a worker made of a popped node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Visit {
    Expanded(f32),
    /// The node's probability is below the minimum; it was not expanded.
    BelowThreshold(f32),
}

/// Queue, reservations and counters of one build.
#[derive(Debug)]
pub struct BuildCoordinator {
    queue: WorkQueue,
    reservations: AddressReservations,
    cancel: CancellationToken,
    workers: usize,
    min_probability: f32,
    processed: AtomicUsize,
    active: AtomicUsize,
    running: AtomicUsize,
    nodes: AtomicUsize,
    below_threshold: AtomicBool,
    last_probability: AtomicU32,
    started: Instant,
}

impl BuildCoordinator {
    pub fn new(workers: usize, min_probability: f32, cancel: CancellationToken) -> Self {
        let workers = workers.max(1);
        Self {
            queue: WorkQueue::new(),
            reservations: AddressReservations::new(workers),
            cancel,
            workers,
            min_probability,
            processed: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            nodes: AtomicUsize::new(0),
            below_threshold: AtomicBool::new(false),
            last_probability: AtomicU32::new(1.0f32.to_bits()),
            started: Instant::now(),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn min_probability(&self) -> f32 {
        self.min_probability
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn reserve(&self, worker: usize, address: u64) -> ReservationGuard<'_> {
        self.reservations.reserve(worker, address)
    }

    pub fn enqueue(&self, node: NodeId, probability: f32) {
        self.queue.push(node, probability);
    }

    pub fn node_created(&self) {
        self.nodes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn last_probability(&self) -> f32 {
        f32::from_bits(self.last_probability.load(Ordering::Relaxed))
    }

    /// Whether a popped node fell below the minimum probability.
    pub fn reached_threshold(&self) -> bool {
        self.below_threshold.load(Ordering::Acquire)
    }

    pub fn progress(&self) -> BuildProgress {
        BuildProgress {
            processed: self.processed(),
            queued: self.queue.len(),
            nodes: self.nodes.load(Ordering::Relaxed),
            last_probability: self.last_probability(),
            elapsed: self.started.elapsed(),
        }
    }

    fn should_stop(&self) -> bool {
        self.is_cancelled() || self.reached_threshold()
    }

    /// Pop the next node and count it as active, or report whether the
    /// build has run dry.
    fn next_node(&self) -> std::result::Result<NodeId, bool> {
        self.queue.pop_with(|node| match node {
            Some(n) => {
                self.active.fetch_add(1, Ordering::AcqRel);
                Ok(n)
            }
            // Workers push children before they go idle, so an empty queue
            // with nobody active stays empty.
            None => Err(self.active.load(Ordering::Acquire) == 0),
        })
    }

    fn worker_loop<V>(&self, worker: usize, poll: Duration, visit: &V)
    where
        V: Fn(usize, NodeId) -> Visit + Sync,
    {
        while !self.should_stop() {
            match self.next_node() {
                Ok(node) => {
                    let outcome = visit(worker, node);
                    let p = match outcome {
                        Visit::Expanded(p) => p,
                        Visit::BelowThreshold(p) => {
                            self.below_threshold.store(true, Ordering::Release);
                            p
                        }
                    };
                    self.last_probability.store(p.to_bits(), Ordering::Relaxed);
                    self.processed.fetch_add(1, Ordering::Relaxed);
                    self.active.fetch_sub(1, Ordering::AcqRel);
                }
                Err(true) => break,
                Err(false) => thread::sleep(poll),
            }
        }
        debug!(worker, "Worker finished");
        self.running.fetch_sub(1, Ordering::AcqRel);
    }

    /// Drive `visit` over the queue with the configured number of workers.
    ///
    /// Blocks until every worker has stopped. The calling side polls the
    /// workers and calls `progress` at most once per `progress_interval`,
    /// plus once at the end.
    pub fn run<V>(
        &self,
        poll_interval: Duration,
        progress_interval: Duration,
        progress: Option<BuildProgressFn<'_>>,
        visit: V,
    ) -> Result<()>
    where
        V: Fn(usize, NodeId) -> Visit + Sync,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers + 1)
            .thread_name(|i| format!("kernelmap-worker-{i}"))
            .build()
            .map_err(|e| MapError::WorkerPool(e.to_string()))?;

        let visit = &visit;
        pool.scope(|s| {
            for worker in 0..self.workers {
                self.running.fetch_add(1, Ordering::AcqRel);
                s.spawn(move |_| self.worker_loop(worker, poll_interval, visit));
            }

            let mut last_report = Instant::now();
            while self.running.load(Ordering::Acquire) > 0 {
                if let Some(report) = progress {
                    if last_report.elapsed() >= progress_interval {
                        report(&self.progress());
                        last_report = Instant::now();
                    }
                }
                thread::sleep(poll_interval);
            }
        });

        if let Some(report) = progress {
            report(&self.progress());
        }
        Ok(())
    }
}
