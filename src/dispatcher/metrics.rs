use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Counters shared by both dispatch models
///
/// Totals only grow. The gauges (`live_workers`, `busy_children`,
/// `idle_children`) are snapshots: the threaded model updates them as
/// workers come and go, the process model publishes them from its control
/// loop once per iteration.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    /// Connections accepted from the listener
    pub accepted_count: AtomicU64,
    /// Connections handed to a worker or child
    pub dispatched_count: AtomicU64,
    /// Connections closed unserved (worker or child cap reached)
    pub rejected_count: AtomicU64,
    /// Connections whose worker or child finished them
    pub completed_count: AtomicU64,
    /// Workers or children cancelled for exceeding their time
    pub reaped_count: AtomicU64,
    /// Children forked
    pub spawned_count: AtomicU64,
    /// Children terminated by the pool
    pub evicted_count: AtomicU64,
    /// Threaded model: workers currently registered
    pub live_workers: AtomicUsize,
    /// Process model: children in the pool, including ones still starting
    pub children: AtomicUsize,
    /// Process model: children holding a client
    pub busy_children: AtomicUsize,
    /// Process model: children waiting for work
    pub idle_children: AtomicUsize,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accept(&self) {
        self.accepted_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self) {
        self.dispatched_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.rejected_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completion(&self) {
        self.completed_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reaped(&self, count: usize) {
        self.reaped_count.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_spawn(&self) {
        self.spawned_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evicted_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_live_workers(&self, n: usize) {
        self.live_workers.store(n, Ordering::Relaxed);
    }

    pub(crate) fn publish_pool(&self, children: usize, busy: usize, idle: usize) {
        self.children.store(children, Ordering::Relaxed);
        self.busy_children.store(busy, Ordering::Relaxed);
        self.idle_children.store(idle, Ordering::Relaxed);
    }

    pub fn get_accepted_count(&self) -> u64 {
        self.accepted_count.load(Ordering::Relaxed)
    }

    pub fn get_dispatched_count(&self) -> u64 {
        self.dispatched_count.load(Ordering::Relaxed)
    }

    pub fn get_rejected_count(&self) -> u64 {
        self.rejected_count.load(Ordering::Relaxed)
    }

    pub fn get_completed_count(&self) -> u64 {
        self.completed_count.load(Ordering::Relaxed)
    }

    pub fn get_reaped_count(&self) -> u64 {
        self.reaped_count.load(Ordering::Relaxed)
    }

    pub fn get_spawned_count(&self) -> u64 {
        self.spawned_count.load(Ordering::Relaxed)
    }

    pub fn get_evicted_count(&self) -> u64 {
        self.evicted_count.load(Ordering::Relaxed)
    }

    pub fn get_live_workers(&self) -> usize {
        self.live_workers.load(Ordering::Relaxed)
    }

    pub fn get_busy_children(&self) -> usize {
        self.busy_children.load(Ordering::Relaxed)
    }

    pub fn get_idle_children(&self) -> usize {
        self.idle_children.load(Ordering::Relaxed)
    }

    pub fn get_children(&self) -> usize {
        self.children.load(Ordering::Relaxed)
    }
}
