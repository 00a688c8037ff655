use super::metrics::DispatchMetrics;
use crate::cancel::{CancelReason, CancelToken};
use crate::classifier::{Classifier, HandlerChain};
use crate::config::{DispatcherConfig, Domain};
use crate::error::{DispatchError, RegistrationError};
use crate::handlers::HttpHandler;
use crate::server::{ParserFactory, Pipeline};
use arc_swap::ArcSwap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{error, info, warn};

/// Bind attempts after the first one fails with `EADDRINUSE`
pub const BIND_RETRIES: usize = 10;

/// Pause between bind attempts
pub const BIND_RETRY_DELAY: Duration = Duration::from_millis(100);

/// The running accept loop of a dispatcher
pub(crate) enum AcceptorHandle {
    /// Threaded model: the accept coroutine
    Coroutine(may::coroutine::JoinHandle<()>),
    /// Process model: the control thread
    Thread(std::thread::JoinHandle<()>),
}

impl AcceptorHandle {
    fn join(self) {
        let result = match self {
            AcceptorHandle::Coroutine(handle) => handle.join(),
            AcceptorHandle::Thread(handle) => handle.join(),
        };
        if let Err(panic) = result {
            error!(panic_message = ?panic, "Acceptor exited with a panic");
        }
    }

    fn is_done(&self) -> bool {
        match self {
            AcceptorHandle::Coroutine(handle) => handle.is_done(),
            AcceptorHandle::Thread(handle) => handle.is_finished(),
        }
    }
}

/// State shared by both dispatch models
///
/// Owns the configuration, the route table and the stop signal. The route
/// table lives behind an `ArcSwap`: request pipelines read it without
/// locking while `register`/`unregister` publish a modified copy.
pub struct DispatcherCore {
    config: DispatcherConfig,
    domain: Domain,
    classifier: Arc<ArcSwap<Classifier>>,
    route_generation: Arc<AtomicU64>,
    shutdown: CancelToken,
    parser: Option<ParserFactory>,
    metrics: Arc<DispatchMetrics>,
    acceptor: Mutex<Option<AcceptorHandle>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl std::fmt::Debug for DispatcherCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherCore")
            .field("domain", &self.domain)
            .field("config", &self.config)
            .field("uris", &self.classifier.load().uris())
            .field("stopping", &self.is_stopping())
            .finish()
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DispatcherCore {
    /// Validate `config` and build the shared state
    ///
    /// # Errors
    ///
    /// `InvalidConfig` when validation fails.
    pub fn new(config: DispatcherConfig, domain: Domain) -> Result<Self, DispatchError> {
        config.validate()?;
        Ok(Self {
            config,
            domain,
            classifier: Arc::new(ArcSwap::from_pointee(Classifier::new())),
            route_generation: Arc::new(AtomicU64::new(0)),
            shutdown: CancelToken::new(),
            parser: None,
            metrics: Arc::new(DispatchMetrics::new()),
            acceptor: Mutex::new(None),
            local_addr: Mutex::new(None),
        })
    }

    /// Use a custom parser for every connection
    #[must_use]
    pub fn with_parser(mut self, parser: ParserFactory) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Snapshot of the current route table
    pub fn classifier(&self) -> Arc<Classifier> {
        self.classifier.load_full()
    }

    /// Bumped on every successful `register`/`unregister`
    pub fn route_generation(&self) -> u64 {
        self.route_generation.load(Ordering::Acquire)
    }

    /// A request pipeline reading this dispatcher's route table
    pub fn pipeline(&self) -> Pipeline {
        match &self.parser {
            Some(parser) => Pipeline::with_parser(Arc::clone(&self.classifier), Arc::clone(parser)),
            None => Pipeline::new(Arc::clone(&self.classifier)),
        }
    }

    pub fn shutdown_token(&self) -> &CancelToken {
        &self.shutdown
    }

    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn metrics(&self) -> Arc<DispatchMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Address the listener is bound to, once `run` has bound it
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    pub(crate) fn set_local_addr(&self, addr: SocketAddr) {
        *lock(&self.local_addr) = Some(addr);
    }

    /// True while an accept loop is installed and has not exited
    pub fn is_running(&self) -> bool {
        lock(&self.acceptor)
            .as_ref()
            .is_some_and(|handle| !handle.is_done())
    }

    /// Fail fast before binding when `run` cannot proceed
    pub(crate) fn check_can_run(&self) -> Result<(), DispatchError> {
        if self.is_stopping() {
            return Err(DispatchError::Stopped);
        }
        if lock(&self.acceptor).is_some() {
            return Err(DispatchError::AlreadyRunning);
        }
        Ok(())
    }

    pub(crate) fn install_acceptor(&self, handle: AcceptorHandle) {
        *lock(&self.acceptor) = Some(handle);
    }

    /// Mount `handler` at `prefix`
    ///
    /// The first registration claims the prefix; later ones join its chain,
    /// at the front when `in_front` is set.
    ///
    /// # Errors
    ///
    /// `InvalidPrefix` when the prefix does not start with `/`.
    pub fn register(
        &self,
        prefix: &str,
        handler: Arc<dyn HttpHandler>,
        in_front: bool,
    ) -> Result<(), RegistrationError> {
        self.update_routes(|classifier| {
            match classifier.register(prefix, vec![Arc::clone(&handler)]) {
                Err(RegistrationError::Conflict { .. }) => {
                    classifier.append(prefix, Arc::clone(&handler), in_front)
                }
                other => other,
            }
        })
    }

    /// Remove the entire chain at `prefix`
    ///
    /// # Errors
    ///
    /// `NotRegistered` when nothing is mounted there.
    pub fn unregister(&self, prefix: &str) -> Result<HandlerChain, RegistrationError> {
        self.update_routes(|classifier| classifier.unregister(prefix))
    }

    fn update_routes<R>(
        &self,
        mut change: impl FnMut(&mut Classifier) -> Result<R, RegistrationError>,
    ) -> Result<R, RegistrationError> {
        let mut outcome = None;
        self.classifier.rcu(|current| {
            let mut next = Classifier::clone(current);
            match change(&mut next) {
                Ok(value) => {
                    outcome = Some(Ok(value));
                    Arc::new(next)
                }
                Err(e) => {
                    outcome = Some(Err(e));
                    Arc::clone(current)
                }
            }
        });
        let result = outcome.unwrap_or_else(|| {
            Err(RegistrationError::NotRegistered {
                prefix: String::new(),
            })
        });
        if result.is_ok() {
            self.route_generation.fetch_add(1, Ordering::AcqRel);
        }
        result
    }

    /// Signal the accept loop to stop; never resets
    pub(crate) fn signal_stop(&self) {
        if !self.is_stopping() {
            info!(domain = %self.domain, "Stopping dispatcher");
        }
        self.shutdown.cancel(CancelReason::Stop);
    }

    /// Wait for the accept loop, if one is installed, to finish draining
    pub(crate) fn join_acceptor(&self) {
        let handle = lock(&self.acceptor).take();
        if let Some(handle) = handle {
            handle.join();
        }
    }
}

/// Bind with a bounded retry on `EADDRINUSE`
///
/// A previous dispatcher on the same port may still be releasing it.
pub(crate) fn bind_with_retry<L>(
    addr: &str,
    mut bind: impl FnMut(&str) -> io::Result<L>,
) -> Result<L, DispatchError> {
    let mut attempts = 0;
    loop {
        match bind(addr) {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempts < BIND_RETRIES => {
                attempts += 1;
                warn!(addr, attempt = attempts, "Address in use, retrying bind");
                std::thread::sleep(BIND_RETRY_DELAY);
            }
            Err(source) => {
                return Err(DispatchError::CouldNotBind {
                    addr: addr.to_string(),
                    source,
                })
            }
        }
    }
}

/// Where to connect to reach a listener bound to `addr`
pub(crate) fn connectable(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

/// A connection dispatcher
///
/// Implementors supply the accept loop (`run`) and the reaping policy
/// (`reap_dead_workers`); registration and stop semantics are shared.
pub trait Dispatcher: Send + Sync {
    /// Shared configuration, route table and stop signal
    fn core(&self) -> &DispatcherCore;

    /// Bind the listener and start the accept loop in the background
    ///
    /// # Errors
    ///
    /// `CouldNotBind` when the address stays busy, `AlreadyRunning` or
    /// `Stopped` when the dispatcher cannot start again.
    fn run(&self) -> Result<(), DispatchError>;

    /// Cancel work that has run longer than allowed
    ///
    /// Returns how many workers (threaded) or busy children (process) are
    /// still live, so callers can loop until it reaches zero.
    fn reap_dead_workers(&self, reason: &str) -> usize;

    /// Interrupt a blocked accept or wait so the loop notices a stop
    fn wake(&self) {}

    /// Called after the route table changed
    fn on_routes_changed(&self) {}

    fn domain(&self) -> Domain {
        self.core().domain()
    }

    fn config(&self) -> &DispatcherConfig {
        self.core().config()
    }

    /// Mount `handler` at `prefix`, joining an existing chain if present
    ///
    /// # Errors
    ///
    /// `Registration` when the prefix is invalid.
    fn register(
        &self,
        prefix: &str,
        handler: Arc<dyn HttpHandler>,
        in_front: bool,
    ) -> Result<(), DispatchError> {
        self.core().register(prefix, handler, in_front)?;
        self.on_routes_changed();
        Ok(())
    }

    /// Remove the whole chain at `prefix`
    ///
    /// # Errors
    ///
    /// `Registration` when nothing is mounted there.
    fn unregister(&self, prefix: &str) -> Result<HandlerChain, DispatchError> {
        let chain = self.core().unregister(prefix)?;
        self.on_routes_changed();
        Ok(chain)
    }

    /// Stop accepting; with `synchronous`, block until draining finishes
    fn stop(&self, synchronous: bool) {
        self.core().signal_stop();
        self.wake();
        if synchronous {
            self.core().join_acceptor();
        }
    }

    fn metrics(&self) -> Arc<DispatchMetrics> {
        self.core().metrics()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.core().local_addr()
    }

    fn is_running(&self) -> bool {
        self.core().is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::FnHandler;

    fn handler(name: &'static str) -> Arc<dyn HttpHandler> {
        Arc::new(FnHandler::named(name, |_req, _res| {}))
    }

    fn core() -> DispatcherCore {
        DispatcherCore::new(DispatcherConfig::new("127.0.0.1", 0), Domain::Tcp).unwrap()
    }

    #[test]
    fn test_second_register_joins_chain() {
        let core = core();
        core.register("/x", handler("b"), false).unwrap();
        core.register("/x", handler("c"), false).unwrap();
        core.register("/x", handler("a"), true).unwrap();
        let chain = core.classifier().chain("/x").unwrap();
        let names: Vec<&str> = chain.iter().map(|h| h.name()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(core.route_generation(), 3);
    }

    #[test]
    fn test_failed_update_keeps_generation() {
        let core = core();
        assert!(core.unregister("/nothing").is_err());
        assert!(core.register("bad", handler("x"), false).is_err());
        assert_eq!(core.route_generation(), 0);
    }

    #[test]
    fn test_pipeline_sees_later_registrations() {
        let core = core();
        let pipeline = core.pipeline();
        assert!(pipeline.classifier().is_empty());
        core.register("/late", handler("late"), false).unwrap();
        assert_eq!(pipeline.classifier().uris(), vec!["/late"]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = DispatcherConfig {
            min_children: 3,
            max_children: 1,
            ..DispatcherConfig::default()
        };
        assert!(DispatcherCore::new(config, Domain::Unix).is_err());
    }

    #[test]
    fn test_connectable_maps_unspecified_to_loopback() {
        let addr: SocketAddr = "0.0.0.0:8080".parse().unwrap();
        assert_eq!(connectable(addr), "127.0.0.1:8080".parse().unwrap());
        let addr: SocketAddr = "[::]:8080".parse().unwrap();
        assert_eq!(connectable(addr), "[::1]:8080".parse().unwrap());
    }

    #[test]
    fn test_bind_gives_up_after_retries() {
        let mut calls = 0;
        let result: Result<(), _> = bind_with_retry("127.0.0.1:1", |_| {
            calls += 1;
            Err(io::Error::from(io::ErrorKind::AddrInUse))
        });
        assert!(matches!(result, Err(DispatchError::CouldNotBind { .. })));
        assert_eq!(calls, BIND_RETRIES + 1);
    }

    #[test]
    fn test_stop_is_sticky() {
        let core = core();
        assert!(core.check_can_run().is_ok());
        core.signal_stop();
        assert!(matches!(core.check_can_run(), Err(DispatchError::Stopped)));
    }
}
