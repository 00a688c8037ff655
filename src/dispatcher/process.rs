use super::base::{bind_with_retry, lock, AcceptorHandle, Dispatcher, DispatcherCore};
use super::child::{self, child_main, Child};
use super::control::{self, StatusMessage};
use super::metrics::DispatchMetrics;
use super::socket;
use crate::config::{DispatcherConfig, Domain};
use crate::error::{classify_io, DispatchError, IoFault};
use crate::server::{ParserFactory, Pipeline};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::panic::AssertUnwindSafe;
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Pause after descriptor exhaustion before accepting again
const EXHAUSTED_BACKOFF: Duration = Duration::from_millis(500);

/// Longest single wait while a new child is starting
const SPAWN_POLL: Duration = Duration::from_millis(100);

/// Which side of the fork an after-spawn hook is running on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnSide {
    /// In the dispatcher, with the new child's pid
    Parent { pid: i32 },
    /// In the new child, before it announces readiness
    Child,
}

/// Runs in the dispatcher right before `fork`
pub type BeforeSpawnHook = Arc<dyn Fn() + Send + Sync>;

/// Runs on both sides right after `fork`
pub type AfterSpawnHook = Arc<dyn Fn(SpawnSide) + Send + Sync>;

#[derive(Default)]
struct SpawnHooks {
    before: Vec<BeforeSpawnHook>,
    after: Vec<AfterSpawnHook>,
}

struct ReapRequest {
    reason: String,
    reply: mpsc::SyncSender<usize>,
}

/// Handles the control thread shares with the public API
#[derive(Default)]
struct ProcessShared {
    wake_tx: Mutex<Option<UnixStream>>,
    reap_tx: Mutex<Option<mpsc::Sender<ReapRequest>>>,
    hooks: Mutex<SpawnHooks>,
}

impl ProcessShared {
    fn hooks_snapshot(&self) -> (Vec<BeforeSpawnHook>, Vec<AfterSpawnHook>) {
        let hooks = lock(&self.hooks);
        (hooks.before.clone(), hooks.after.clone())
    }
}

/// Forked children fed client sockets over control channels
///
/// One control thread multiplexes the listening socket and every child's
/// control socket. Accepted connections are passed to an idle child as a
/// descriptor; the dispatcher never reads client bytes. Children report
/// `READY`/`CLOSED` back over the same channel.
///
/// # Forking from a threaded process
///
/// Children are forked from the control thread while the rest of the
/// process keeps running. Only the forking thread exists in the child, so
/// any lock another thread held at that instant stays held forever. The
/// child still allocates, installs `signal_hook` flags and emits `tracing`
/// events before it exits, so a lock held in the allocator, a subscriber or
/// handler state can deadlock it. Such a child never reports `READY` and is
/// evicted after `spawn_timeout`, or once busy, after `timeout`.
///
/// To keep the window small:
/// - start the dispatcher before spawning other threads where possible
/// - keep handlers free of locks shared with parent threads
/// - use synchronous logging (see [`crate::logging`])
/// - take process-wide locks an embedding application owns in an
///   [`on_before_spawn`](Self::on_before_spawn) hook and release them in
///   [`on_after_spawn`](Self::on_after_spawn), so none is mid-update at fork
pub struct ProcessDispatcher {
    core: Arc<DispatcherCore>,
    shared: Arc<ProcessShared>,
}

impl ProcessDispatcher {
    /// # Errors
    ///
    /// `InvalidConfig` when `config` fails validation.
    pub fn new(config: DispatcherConfig) -> Result<Self, DispatchError> {
        Ok(Self::from_core(DispatcherCore::new(config, Domain::Unix)?))
    }

    /// Same as [`new`](Self::new) with a custom request parser
    ///
    /// # Errors
    ///
    /// `InvalidConfig` when `config` fails validation.
    pub fn with_parser(config: DispatcherConfig, parser: ParserFactory) -> Result<Self, DispatchError> {
        Ok(Self::from_core(
            DispatcherCore::new(config, Domain::Unix)?.with_parser(parser),
        ))
    }

    fn from_core(core: DispatcherCore) -> Self {
        Self {
            core: Arc::new(core),
            shared: Arc::new(ProcessShared::default()),
        }
    }

    /// Add a hook that runs in the dispatcher before every fork
    pub fn on_before_spawn(&self, hook: impl Fn() + Send + Sync + 'static) {
        lock(&self.shared.hooks).before.push(Arc::new(hook));
    }

    /// Add a hook that runs on both sides after every fork
    pub fn on_after_spawn(&self, hook: impl Fn(SpawnSide) + Send + Sync + 'static) {
        lock(&self.shared.hooks).after.push(Arc::new(hook));
    }

    /// Children alive as of the last control-loop pass
    pub fn children(&self) -> usize {
        self.core.metrics().get_children()
    }

    /// Children holding a client as of the last control-loop pass
    pub fn busy_children(&self) -> usize {
        self.core.metrics().get_busy_children()
    }
}

impl Drop for ProcessDispatcher {
    fn drop(&mut self) {
        if self.core.is_running() {
            self.stop(true);
        }
    }
}

impl Dispatcher for ProcessDispatcher {
    fn core(&self) -> &DispatcherCore {
        &self.core
    }

    fn run(&self) -> Result<(), DispatchError> {
        self.core.check_can_run()?;
        let config = self.core.config();
        let listener = bind_with_retry(&config.bind_addr(), |addr| TcpListener::bind(addr))?;
        listener.set_nonblocking(true)?;
        if config.socket_tuning {
            socket::tune_listener(listener.as_raw_fd());
        }
        let addr = listener.local_addr()?;
        self.core.set_local_addr(addr);

        let (wake_tx, wake_rx) = UnixStream::pair()?;
        wake_tx.set_nonblocking(true)?;
        wake_rx.set_nonblocking(true)?;
        let (reap_tx, reap_rx) = mpsc::channel();
        *lock(&self.shared.wake_tx) = Some(wake_tx);
        *lock(&self.shared.reap_tx) = Some(reap_tx);

        let control = ControlLoop {
            core: Arc::clone(&self.core),
            shared: Arc::clone(&self.shared),
            config: config.clone(),
            metrics: self.core.metrics(),
            pipeline: self.core.pipeline(),
            listener: Some(listener),
            wake: wake_rx,
            reap_requests: reap_rx,
            children: Vec::new(),
        };
        let handle = std::thread::Builder::new()
            .name("forkserve-control".to_string())
            .spawn(move || control.run())?;
        self.core.install_acceptor(AcceptorHandle::Thread(handle));

        info!(
            addr = %addr,
            min_children = config.min_children,
            max_children = config.max_children,
            timeout_ms = config.timeout_ms,
            "Process dispatcher listening"
        );
        Ok(())
    }

    /// Ask the control thread to evict children over their time limit
    ///
    /// Returns the busy count after the sweep, or the last published count
    /// if the control thread does not answer in time.
    fn reap_dead_workers(&self, reason: &str) -> usize {
        let fallback = || self.core.metrics().get_busy_children();
        let Some(sender) = lock(&self.shared.reap_tx).clone() else {
            return fallback();
        };
        let (reply, answer) = mpsc::sync_channel(1);
        let request = ReapRequest {
            reason: reason.to_string(),
            reply,
        };
        if sender.send(request).is_err() {
            return fallback();
        }
        self.wake();
        let config = self.core.config();
        answer
            .recv_timeout(config.spawn_timeout() + config.kill_grace())
            .unwrap_or_else(|_| fallback())
    }

    /// Interrupt the control thread's multiplexed wait
    fn wake(&self) {
        if let Some(tx) = lock(&self.shared.wake_tx).as_ref() {
            match (&*tx).write(&[1]) {
                Ok(_) => {}
                // a full pipe already guarantees a wake-up
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => debug!(error = %e, "Wake-up write failed"),
            }
        }
    }

    /// New routes reach children by recycling the ones forked before the change
    fn on_routes_changed(&self) {
        self.wake();
    }
}

/// What one multiplexed wait reported
#[derive(Debug, Default)]
struct Readiness {
    wake: bool,
    listener: bool,
    /// Pids whose control socket is readable or hung up
    controls: Vec<i32>,
    timed_out: bool,
}

/// The control thread: sole owner of the listener and the child pool
struct ControlLoop {
    core: Arc<DispatcherCore>,
    shared: Arc<ProcessShared>,
    config: DispatcherConfig,
    metrics: Arc<DispatchMetrics>,
    pipeline: Pipeline,
    listener: Option<TcpListener>,
    wake: UnixStream,
    reap_requests: mpsc::Receiver<ReapRequest>,
    children: Vec<Child>,
}

fn pollfd(fd: RawFd) -> libc::pollfd {
    libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }
}

fn readable(pfd: &libc::pollfd) -> bool {
    pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
}

impl ControlLoop {
    fn run(mut self) {
        while !self.core.is_stopping() {
            self.cycle();
        }
        self.shutdown();
    }

    fn cycle(&mut self) {
        self.collect_exited();
        self.serve_reap_requests();
        self.reap_overdue("timeout");
        self.evict_stalled_starts();
        self.recycle_stale();
        self.top_up();
        self.publish();

        let timeout = if self.busy_count() > 0 {
            self.config.poll_interval().min(self.config.drain_interval())
        } else {
            self.config.poll_interval()
        };
        let ready = match self.wait(timeout) {
            Ok(ready) => ready,
            Err(e) => {
                error!(error = %e, children = self.children.len(), "Multiplexed wait failed");
                std::thread::sleep(self.config.drain_interval());
                return;
            }
        };
        if ready.wake {
            self.drain_wake();
        }
        if self.core.is_stopping() {
            return;
        }
        if ready.wake {
            self.serve_reap_requests();
            self.recycle_stale();
        }

        // status first: every READY here is one less fork for the accept below
        for pid in &ready.controls {
            self.handle_status(*pid);
        }
        if ready.listener {
            self.accept();
        }

        if ready.timed_out && self.children.len() > self.config.min_children {
            if let Some(idx) = self.children.iter().rposition(Child::is_idle) {
                self.evict(idx, "pool above minimum");
            }
        }
    }

    fn position(&self, pid: i32) -> Option<usize> {
        self.children.iter().position(|c| c.pid() == pid)
    }

    fn busy_count(&self) -> usize {
        self.children.iter().filter(|c| c.is_busy()).count()
    }

    fn publish(&self) {
        let busy = self.busy_count();
        let idle = self.children.iter().filter(|c| c.is_idle()).count();
        self.metrics.publish_pool(self.children.len(), busy, idle);
    }

    fn evict(&mut self, idx: usize, reason: &str) {
        let child = self.children.remove(idx);
        debug!(pid = child.pid(), busy = child.is_busy(), reason, "Evicting child");
        child.terminate(self.config.kill_grace());
        self.metrics.record_eviction();
    }

    /// Drop children that exited without a status line
    fn collect_exited(&mut self) {
        let mut idx = 0;
        while idx < self.children.len() {
            let pid = self.children[idx].pid();
            match child::try_wait(pid) {
                Ok(true) => {
                    let child = self.children.remove(idx);
                    warn!(pid, busy = child.is_busy(), "Child exited unexpectedly");
                    child.discard();
                    self.metrics.record_eviction();
                }
                Ok(false) => idx += 1,
                Err(e) => {
                    debug!(pid, error = %e, "waitpid failed");
                    idx += 1;
                }
            }
        }
    }

    /// Evict children busy longer than `timeout + throttle`; returns the busy count
    fn reap_overdue(&mut self, reason: &str) -> usize {
        let limit = self.config.timeout() + self.config.throttle();
        let overdue: Vec<i32> = self
            .children
            .iter()
            .filter(|c| c.busy_for().is_some_and(|held| held > limit))
            .map(Child::pid)
            .collect();
        for pid in &overdue {
            warn!(pid, limit_ms = limit.as_millis() as u64, reason, "Evicting child over its time limit");
            if let Some(idx) = self.position(*pid) {
                self.evict(idx, reason);
            }
        }
        if !overdue.is_empty() {
            self.metrics.record_reaped(overdue.len());
        }
        self.busy_count()
    }

    /// Evict children that never announced readiness within `spawn_timeout`
    fn evict_stalled_starts(&mut self) -> usize {
        let limit = self.config.spawn_timeout();
        let mut evicted = 0;
        while let Some(idx) = self
            .children
            .iter()
            .position(|c| c.starting_for().is_some_and(|waited| waited > limit))
        {
            warn!(
                pid = self.children[idx].pid(),
                spawn_timeout_ms = limit.as_millis() as u64,
                "Child never reported READY"
            );
            self.evict(idx, "no READY before spawn timeout");
            evicted += 1;
        }
        evicted
    }

    fn serve_reap_requests(&mut self) {
        while let Ok(request) = self.reap_requests.try_recv() {
            let live = self.reap_overdue(&request.reason);
            self.publish();
            let _ = request.reply.send(live);
        }
    }

    /// Evict idle children forked before the last route change
    fn recycle_stale(&mut self) {
        let generation = self.core.route_generation();
        while let Some(idx) = self
            .children
            .iter()
            .position(|c| c.is_idle() && c.generation() != generation)
        {
            self.evict(idx, "route table changed");
        }
    }

    fn top_up(&mut self) {
        while self.children.len() < self.config.min_children && !self.core.is_stopping() {
            if let Err(e) = self.spawn_child() {
                warn!(error = %e, children = self.children.len(), "Could not top up child pool");
                break;
            }
        }
    }

    fn wait(&self, timeout: Duration) -> io::Result<Readiness> {
        let mut fds = Vec::with_capacity(2 + self.children.len());
        fds.push(pollfd(self.wake.as_raw_fd()));
        let listener_slot = self.listener.as_ref().map(|l| {
            fds.push(pollfd(l.as_raw_fd()));
            fds.len() - 1
        });
        let first_child = fds.len();
        fds.extend(self.children.iter().map(|c| pollfd(c.control_fd())));

        let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        // SAFETY: `fds` is a live, correctly sized array of pollfd.
        #[allow(unsafe_code)]
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, millis) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Readiness::default());
            }
            return Err(err);
        }

        Ok(Readiness {
            wake: readable(&fds[0]),
            listener: listener_slot.is_some_and(|slot| readable(&fds[slot])),
            controls: fds[first_child..]
                .iter()
                .zip(&self.children)
                .filter(|(pfd, _)| readable(pfd))
                .map(|(_, c)| c.pid())
                .collect(),
            timed_out: rc == 0,
        })
    }

    fn drain_wake(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.wake).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }

    /// Apply the status lines a child has sent
    fn handle_status(&mut self, pid: i32) {
        let Some(idx) = self.position(pid) else {
            return;
        };
        let drained = match self.children[idx].drain() {
            Ok(drained) => drained,
            Err(e) => {
                debug!(pid, error = %e, "Control channel read failed");
                self.evict(idx, "control channel error");
                return;
            }
        };
        for line in &drained.garbage {
            warn!(pid, line = %line, "Unexpected status line from child");
        }

        let mut closing = drained.eof;
        for message in &drained.messages {
            if message.pid() != pid {
                warn!(pid, reported = message.pid(), "Status line names another process");
            }
            match message {
                StatusMessage::Ready(_) => {
                    if self.children[idx].mark_ready() {
                        self.metrics.record_completion();
                    }
                    trace!(pid, "Child ready");
                }
                StatusMessage::Closed(_) => closing = true,
            }
        }

        if closing {
            let reason = if drained.eof { "control channel closed" } else { "child closed" };
            self.evict(idx, reason);
        } else if self.children[idx].is_idle()
            && self.children[idx].generation() != self.core.route_generation()
        {
            self.evict(idx, "route table changed");
        }
    }

    fn accept(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                match classify_io(&e) {
                    IoFault::Exhausted => {
                        warn!(error = %e, children = self.children.len(), "Out of file descriptors, reaping children");
                        self.reap_overdue("too many open files");
                        std::thread::sleep(EXHAUSTED_BACKOFF);
                    }
                    IoFault::Aborted | IoFault::Interrupted => {}
                    IoFault::Transient => trace!(error = %e, "Accept failed"),
                    IoFault::Other => error!(error = %e, "Unexpected accept error"),
                }
                return;
            }
        };
        self.metrics.record_accept();

        // BSD hands out accepted sockets with the listener's O_NONBLOCK
        if let Err(e) = stream.set_nonblocking(false) {
            debug!(peer = %peer, error = %e, "Could not reset client to blocking");
            return;
        }
        self.forward(stream, peer);

        if !self.config.throttle().is_zero() {
            std::thread::sleep(self.config.throttle());
        }
    }

    /// Hand `stream` to an idle child, forking one if none is free
    fn forward(&mut self, stream: TcpStream, peer: SocketAddr) {
        let generation = self.core.route_generation();
        let found = self
            .children
            .iter()
            .position(|c| c.is_idle() && c.generation() == generation);
        let idx = match found {
            Some(idx) => idx,
            None => match self.spawn_ready() {
                Ok(idx) => idx,
                Err(DispatchError::MaxChildrenReached { max }) => {
                    warn!(peer = %peer, max_children = max, "Maximum number of children reached, closing client");
                    self.metrics.record_rejection();
                    return;
                }
                Err(DispatchError::Stopped) => return,
                Err(e) => {
                    error!(peer = %peer, error = %e, "No child available, closing client");
                    self.metrics.record_rejection();
                    return;
                }
            },
        };

        let pid = self.children[idx].pid();
        match self.children[idx].hand_off(stream) {
            Ok(()) => {
                self.metrics.record_dispatch();
                debug!(pid, peer = %peer, "Forwarded client");
            }
            Err((e, stream)) => {
                warn!(pid, peer = %peer, error = %e, "Descriptor hand-off failed, closing client");
                drop(stream);
                self.metrics.record_rejection();
                self.evict(idx, "hand-off failed");
            }
        }
    }

    /// Fork a child and wait for its first `READY`; returns its index
    fn spawn_ready(&mut self) -> Result<usize, DispatchError> {
        let pid = self.spawn_child()?;
        let deadline = Instant::now() + self.config.spawn_timeout();
        loop {
            let idx = self.position(pid).ok_or_else(|| DispatchError::ChildUnavailable {
                pid,
                reason: "exited during start-up".to_string(),
            })?;
            if self.children[idx].is_idle() {
                return Ok(idx);
            }
            if self.core.is_stopping() {
                return Err(DispatchError::Stopped);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.evict(idx, "no READY before spawn timeout");
                return Err(DispatchError::ChildUnavailable {
                    pid,
                    reason: format!(
                        "no READY within {}ms",
                        self.config.spawn_timeout().as_millis()
                    ),
                });
            }
            let fd = self.children[idx].control_fd();
            if control::wait_readable(fd, remaining.min(SPAWN_POLL))? {
                self.handle_status(pid);
            }
        }
    }

    /// Fork one child without waiting for it; returns its pid
    #[allow(unsafe_code)]
    fn spawn_child(&mut self) -> Result<i32, DispatchError> {
        if let Some(max) = self.config.max_children() {
            if self.children.len() >= max {
                return Err(DispatchError::MaxChildrenReached { max });
            }
        }
        let (parent_end, child_end) = UnixStream::pair()?;
        parent_end.set_nonblocking(true)?;
        let generation = self.core.route_generation();
        let (before, after) = self.shared.hooks_snapshot();

        for hook in &before {
            hook();
        }
        // SAFETY: the child only touches memory it owns after the fork and
        // leaves through _exit, never returning into the parent's frames.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if pid == 0 {
            drop(parent_end);
            let pipeline = &self.pipeline;
            let config = &self.config;
            let _ = std::panic::catch_unwind(AssertUnwindSafe(move || {
                for hook in &after {
                    hook(SpawnSide::Child);
                }
                child_main(child_end, pipeline, config);
            }));
            // SAFETY: only reached when a hook or the child body panicked.
            unsafe { libc::_exit(1) }
        }

        drop(child_end);
        for hook in &after {
            hook(SpawnSide::Parent { pid });
        }
        self.children.push(Child::new(pid, parent_end, generation));
        self.metrics.record_spawn();
        debug!(pid, generation, children = self.children.len(), "Spawned child");
        Ok(pid)
    }

    /// Close the listener, wait out busy children, then evict everyone
    fn shutdown(mut self) {
        self.listener = None;
        info!(
            children = self.children.len(),
            busy = self.busy_count(),
            "Listener closed, draining children"
        );

        loop {
            self.collect_exited();
            self.serve_reap_requests();
            let busy = self.reap_overdue("shutdown");
            self.publish();
            if busy == 0 {
                break;
            }
            match self.wait(self.config.drain_interval()) {
                Ok(ready) => {
                    if ready.wake {
                        self.drain_wake();
                    }
                    for pid in &ready.controls {
                        self.handle_status(*pid);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Multiplexed wait failed while draining");
                    std::thread::sleep(self.config.drain_interval());
                }
            }
        }

        while let Some(child) = self.children.pop() {
            child.terminate(self.config.kill_grace());
            self.metrics.record_eviction();
        }
        self.publish();
        *lock(&self.shared.reap_tx) = None;
        info!("Process dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hooks_are_kept_in_order() {
        let dispatcher = ProcessDispatcher::new(DispatcherConfig::new("127.0.0.1", 0)).unwrap();
        dispatcher.on_before_spawn(|| {});
        dispatcher.on_after_spawn(|_| {});
        dispatcher.on_after_spawn(|_| {});
        let (before, after) = dispatcher.shared.hooks_snapshot();
        assert_eq!(before.len(), 1);
        assert_eq!(after.len(), 2);
    }

    #[test]
    fn test_reap_before_run_reports_published_count() {
        let dispatcher = ProcessDispatcher::new(DispatcherConfig::new("127.0.0.1", 0)).unwrap();
        assert_eq!(dispatcher.reap_dead_workers("test"), 0);
        assert_eq!(dispatcher.children(), 0);
        assert_eq!(dispatcher.domain(), Domain::Unix);
    }

    #[test]
    fn test_wake_before_run_is_harmless() {
        let dispatcher = ProcessDispatcher::new(DispatcherConfig::new("127.0.0.1", 0)).unwrap();
        dispatcher.wake();
        assert!(!dispatcher.is_running());
    }
}
