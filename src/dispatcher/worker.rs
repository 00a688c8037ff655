use super::metrics::DispatchMetrics;
use crate::cancel::{CancelReason, CancelToken};
use crate::ids::ConnectionId;
use dashmap::DashMap;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// One in-process worker serving one connection
pub struct Worker {
    pub connection_id: ConnectionId,
    pub peer: SocketAddr,
    started_on: Instant,
    token: CancelToken,
    /// Second handle on the client socket, used to force a blocked worker out
    abort: Option<may::net::TcpStream>,
}

impl Worker {
    pub fn new(
        connection_id: ConnectionId,
        peer: SocketAddr,
        token: CancelToken,
        abort: Option<may::net::TcpStream>,
    ) -> Self {
        Self {
            connection_id,
            peer,
            started_on: Instant::now(),
            token,
            abort,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_on.elapsed()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Record `reason` on the worker's token and shut its socket down
    ///
    /// The shutdown wakes the worker out of any blocking read or write.
    pub fn cancel(&self, reason: CancelReason) {
        self.token.cancel(reason);
        if let Some(stream) = &self.abort {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Live-worker registry of the threaded dispatcher
///
/// The accept loop inserts a worker before it starts; the worker removes
/// itself when it finishes (see [`WorkerGuard`]). Its size is the only
/// admission-control signal.
pub struct WorkerRegistry {
    workers: DashMap<u64, Worker>,
    next_id: AtomicU64,
    metrics: Arc<DispatchMetrics>,
}

impl WorkerRegistry {
    pub fn new(metrics: Arc<DispatchMetrics>) -> Self {
        Self {
            workers: DashMap::new(),
            next_id: AtomicU64::new(1),
            metrics,
        }
    }

    pub fn insert(&self, worker: Worker) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.workers.insert(id, worker);
        self.metrics.set_live_workers(self.workers.len());
        id
    }

    pub fn remove(&self, id: u64) {
        self.workers.remove(&id);
        self.metrics.set_live_workers(self.workers.len());
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Cancel every worker running longer than `limit`; returns the live count
    ///
    /// Cancelled workers stay registered until they actually finish, so the
    /// returned count only drops once they have unwound.
    pub fn reap(&self, limit: Duration, reason: &str) -> usize {
        let mut reaped = 0;
        for entry in self.workers.iter() {
            let worker = entry.value();
            if worker.is_cancelled() || worker.elapsed() <= limit {
                continue;
            }
            let elapsed_ms = worker.elapsed().as_millis() as u64;
            warn!(
                connection_id = %worker.connection_id,
                peer = %worker.peer,
                elapsed_ms,
                limit_ms = limit.as_millis() as u64,
                reason,
                "Reaping worker over its time limit"
            );
            worker.cancel(CancelReason::Timeout(format!(
                "{reason}: worker ran {elapsed_ms}ms, limit {}ms",
                limit.as_millis()
            )));
            reaped += 1;
        }
        if reaped > 0 {
            self.metrics.record_reaped(reaped);
        }
        self.workers.len()
    }
}

/// Removes a worker from the registry when dropped, including on unwind
pub struct WorkerGuard {
    registry: Arc<WorkerRegistry>,
    id: u64,
}

impl WorkerGuard {
    pub fn new(registry: Arc<WorkerRegistry>, id: u64) -> Self {
        Self { registry, id }
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
