use super::base::{bind_with_retry, connectable, AcceptorHandle, Dispatcher, DispatcherCore};
use super::socket;
use super::worker::{Worker, WorkerGuard, WorkerRegistry};
use crate::cancel::CancelToken;
use crate::config::{DispatcherConfig, Domain};
use crate::error::{classify_io, DispatchError, IoFault};
use crate::ids::ConnectionId;
use crate::server::{ClientOutcome, ParserFactory, Pipeline};
use std::io::Write;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Pause after descriptor exhaustion before accepting again
const EXHAUSTED_BACKOFF: Duration = Duration::from_millis(500);

const WAKE_REQUEST: &[u8] = b"GET / HTTP/1.0\r\n\r\n";

/// One coroutine per connection, capped at `max_processors`
///
/// The accept loop and the workers run as `may` coroutines. Admission
/// control happens before a single byte is read: once the live-worker
/// count reaches `max_processors`, new connections are closed on accept.
pub struct ThreadedDispatcher {
    core: Arc<DispatcherCore>,
    workers: Arc<WorkerRegistry>,
}

impl ThreadedDispatcher {
    /// # Errors
    ///
    /// `InvalidConfig` when `config` fails validation.
    pub fn new(config: DispatcherConfig) -> Result<Self, DispatchError> {
        Ok(Self::from_core(DispatcherCore::new(config, Domain::Tcp)?))
    }

    /// Same as [`new`](Self::new) with a custom request parser
    ///
    /// # Errors
    ///
    /// `InvalidConfig` when `config` fails validation.
    pub fn with_parser(config: DispatcherConfig, parser: ParserFactory) -> Result<Self, DispatchError> {
        Ok(Self::from_core(
            DispatcherCore::new(config, Domain::Tcp)?.with_parser(parser),
        ))
    }

    fn from_core(core: DispatcherCore) -> Self {
        let workers = Arc::new(WorkerRegistry::new(core.metrics()));
        Self {
            core: Arc::new(core),
            workers,
        }
    }

    /// Workers currently serving a connection
    pub fn live_workers(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ThreadedDispatcher {
    fn drop(&mut self) {
        if self.core.is_running() {
            self.stop(true);
        }
    }
}

impl Dispatcher for ThreadedDispatcher {
    fn core(&self) -> &DispatcherCore {
        &self.core
    }

    fn run(&self) -> Result<(), DispatchError> {
        self.core.check_can_run()?;
        let config = self.core.config();
        let listener = bind_with_retry(&config.bind_addr(), |addr| may::net::TcpListener::bind(addr))?;
        if config.socket_tuning {
            socket::tune_listener(listener.as_raw_fd());
        }
        let addr = listener.local_addr()?;
        self.core.set_local_addr(addr);

        let acceptor = Acceptor {
            core: Arc::clone(&self.core),
            workers: Arc::clone(&self.workers),
            pipeline: self.core.pipeline(),
        };

        // SAFETY: may::coroutine::Builder::spawn is unsafe because coroutines
        // must not block OS threads on thread-local state; the accept loop only
        // uses may's own socket and sleep primitives.
        #[allow(unsafe_code)]
        let handle = unsafe {
            may::coroutine::Builder::new()
                .name("forkserve-acceptor".to_string())
                .stack_size(config.stack_size)
                .spawn(move || acceptor.run(listener))
        }?;
        self.core.install_acceptor(AcceptorHandle::Coroutine(handle));

        info!(
            addr = %addr,
            max_processors = config.max_processors,
            timeout_ms = config.timeout_ms,
            throttle_ms = config.throttle_ms,
            "Threaded dispatcher listening"
        );
        Ok(())
    }

    fn reap_dead_workers(&self, reason: &str) -> usize {
        let config = self.core.config();
        self.workers
            .reap(config.timeout() + config.throttle(), reason)
    }

    /// Unblock the accept call with a throwaway connection
    ///
    /// The connection carries a request head so deferred accept and accept
    /// filters release it.
    fn wake(&self) {
        if let Some(addr) = self.core.local_addr() {
            let target = connectable(addr);
            match std::net::TcpStream::connect_timeout(&target, Duration::from_secs(1)) {
                Ok(mut stream) => {
                    let _ = stream.write_all(WAKE_REQUEST);
                }
                Err(e) => debug!(addr = %target, error = %e, "Wake-up connect failed"),
            }
        }
    }
}

struct Acceptor {
    core: Arc<DispatcherCore>,
    workers: Arc<WorkerRegistry>,
    pipeline: Pipeline,
}

impl Acceptor {
    fn reap(&self, reason: &str) -> usize {
        let config = self.core.config();
        self.workers
            .reap(config.timeout() + config.throttle(), reason)
    }

    fn run(self, listener: may::net::TcpListener) {
        let config = self.core.config().clone();
        let metrics = self.core.metrics();

        loop {
            if self.core.is_stopping() {
                break;
            }
            let (stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) => {
                    match classify_io(&e) {
                        IoFault::Exhausted => {
                            warn!(error = %e, workers = self.workers.len(), "Out of file descriptors, reaping workers");
                            self.reap("too many open files");
                            may::coroutine::sleep(EXHAUSTED_BACKOFF);
                        }
                        IoFault::Aborted | IoFault::Interrupted => {}
                        IoFault::Transient => trace!(error = %e, "Accept failed"),
                        IoFault::Other => error!(error = %e, "Unexpected accept error"),
                    }
                    continue;
                }
            };
            if self.core.is_stopping() {
                break;
            }
            metrics.record_accept();

            if config.socket_tuning {
                socket::tune_client(stream.as_raw_fd());
            }

            let live = self.workers.len();
            if live >= config.max_processors {
                warn!(
                    peer = %peer,
                    workers = live,
                    max_processors = config.max_processors,
                    "Server overloaded, closing client"
                );
                metrics.record_rejection();
                drop(stream);
                self.reap("max processors");
                continue;
            }

            self.spawn_worker(stream, peer, &config);

            if !config.throttle().is_zero() {
                may::coroutine::sleep(config.throttle());
            }
        }

        drop(listener);
        info!(workers = self.workers.len(), "Listener closed, draining workers");
        while self.reap("shutdown") > 0 {
            may::coroutine::sleep(config.drain_interval());
        }
        info!("Threaded dispatcher stopped");
    }

    fn spawn_worker(&self, stream: may::net::TcpStream, peer: SocketAddr, config: &DispatcherConfig) {
        let metrics = self.core.metrics();
        let connection_id = ConnectionId::new();
        let token = CancelToken::new();
        let abort = stream.try_clone().ok();
        let id = self
            .workers
            .insert(Worker::new(connection_id, peer, token.clone(), abort));
        let guard = WorkerGuard::new(Arc::clone(&self.workers), id);
        let pipeline = self.pipeline.clone();
        let workers = Arc::clone(&self.workers);
        let timeout = config.timeout();
        let limit = config.timeout() + config.throttle();

        // SAFETY: see the accept coroutine above; workers only block on may
        // sockets and on handler code.
        #[allow(unsafe_code)]
        let spawned = unsafe {
            may::coroutine::Builder::new()
                .stack_size(config.stack_size)
                .spawn(move || {
                    let _guard = guard;
                    if let Err(e) = stream.set_read_timeout(Some(timeout)) {
                        trace!(error = %e, "Could not set client read timeout");
                    }
                    debug!(connection_id = %connection_id, peer = %peer, "Worker started");
                    let outcome = pipeline.process_client(stream, &token);
                    metrics.record_completion();
                    debug!(connection_id = %connection_id, outcome = ?outcome, "Worker finished");
                    react_to_outcome(&outcome, &workers, limit);
                })
        };

        match spawned {
            Ok(_) => self.core.metrics().record_dispatch(),
            Err(e) => {
                // the closure, and with it the guard, was dropped
                error!(connection_id = %connection_id, peer = %peer, error = %e, "Failed to spawn worker coroutine");
            }
        }
    }
}

/// Reap at once when a worker ran out of descriptors; returns the live count
/// if a reap happened
fn react_to_outcome(outcome: &ClientOutcome, workers: &WorkerRegistry, limit: Duration) -> Option<usize> {
    if *outcome != ClientOutcome::Exhausted {
        return None;
    }
    let live = workers.reap(limit, "too many open files");
    warn!(workers = live, "Worker ran out of file descriptors, reaped overdue workers");
    Some(live)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::metrics::DispatchMetrics;
    use std::net::{IpAddr, Ipv4Addr};

    fn registry_with_worker() -> (WorkerRegistry, CancelToken) {
        let registry = WorkerRegistry::new(Arc::new(DispatchMetrics::new()));
        let token = CancelToken::new();
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4000);
        registry.insert(Worker::new(ConnectionId::new(), peer, token.clone(), None));
        std::thread::sleep(Duration::from_millis(5));
        (registry, token)
    }

    #[test]
    fn test_exhausted_outcome_reaps_overdue_workers() {
        let (registry, token) = registry_with_worker();
        assert_eq!(
            react_to_outcome(&ClientOutcome::Exhausted, &registry, Duration::from_millis(1)),
            Some(1)
        );
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_other_outcomes_leave_workers_alone() {
        let (registry, token) = registry_with_worker();
        for outcome in [ClientOutcome::Served, ClientOutcome::Aborted, ClientOutcome::Failed] {
            assert_eq!(react_to_outcome(&outcome, &registry, Duration::from_millis(1)), None);
        }
        assert!(!token.is_cancelled());
    }
}
