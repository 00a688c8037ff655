//! Forked workers of the process dispatcher
//!
//! [`Child`] is the parent's record of one forked worker. [`child_main`] is
//! what runs on the other side of the fork.

use super::control::{self, Drained, StatusDecoder, StatusMessage};
use super::socket;
use crate::cancel::CancelToken;
use crate::config::DispatcherConfig;
use crate::server::{ClientOutcome, Pipeline};
use std::io;
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// How long a child waits for a descriptor before rechecking its terminate flag
const CHILD_POLL: Duration = Duration::from_millis(250);

/// Pause before announcing readiness again after descriptor exhaustion
const EXHAUSTED_BACKOFF: Duration = Duration::from_millis(500);

/// Step of the wait loop between SIGTERM and SIGKILL
const EXIT_POLL: Duration = Duration::from_millis(10);

/// Where a child is in its lifecycle
#[derive(Debug)]
pub enum ChildState {
    /// Forked, no `READY` yet
    Starting { since: Instant },
    /// Waiting for a client
    Idle,
    /// Serving `client`; the parent keeps its copy until the next `READY`
    Busy { client: TcpStream, since: Instant },
}

/// The parent's record of one forked worker
#[derive(Debug)]
pub struct Child {
    pid: libc::pid_t,
    control: UnixStream,
    state: ChildState,
    /// Route generation the child was forked with
    generation: u64,
    decoder: StatusDecoder,
}

impl Child {
    pub(crate) fn new(pid: libc::pid_t, control: UnixStream, generation: u64) -> Self {
        Self {
            pid,
            control,
            state: ChildState::Starting {
                since: Instant::now(),
            },
            generation,
            decoder: StatusDecoder::new(),
        }
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> &ChildState {
        &self.state
    }

    pub(crate) fn control_fd(&self) -> RawFd {
        self.control.as_raw_fd()
    }

    /// Holding a client
    pub fn is_busy(&self) -> bool {
        matches!(self.state, ChildState::Busy { .. })
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, ChildState::Idle)
    }

    /// How long the current client has been held
    pub fn busy_for(&self) -> Option<Duration> {
        match &self.state {
            ChildState::Busy { since, .. } => Some(since.elapsed()),
            _ => None,
        }
    }

    /// How long the child has gone without its first `READY`
    pub fn starting_for(&self) -> Option<Duration> {
        match &self.state {
            ChildState::Starting { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    /// Read pending status lines
    pub(crate) fn drain(&mut self) -> io::Result<Drained> {
        control::drain(&self.control, &mut self.decoder)
    }

    /// Become idle; drops the parent's copy of the previous client
    ///
    /// Returns true if a client was released.
    pub(crate) fn mark_ready(&mut self) -> bool {
        let was_busy = self.is_busy();
        self.state = ChildState::Idle;
        was_busy
    }

    /// Pass `client` to the child and mark it busy
    ///
    /// On failure the client is handed back so the caller can decide what to
    /// do with it.
    pub(crate) fn hand_off(&mut self, client: TcpStream) -> Result<(), (io::Error, TcpStream)> {
        match control::send_fd(&self.control, client.as_raw_fd()) {
            Ok(()) => {
                self.state = ChildState::Busy {
                    client,
                    since: Instant::now(),
                };
                Ok(())
            }
            Err(e) => Err((e, client)),
        }
    }

    fn close_channels(&mut self) {
        if let ChildState::Busy { client, .. } = &self.state {
            let _ = client.shutdown(Shutdown::Both);
        }
        self.state = ChildState::Idle;
        let _ = self.control.shutdown(Shutdown::Both);
    }

    /// Release the channel of a child that has already been waited for
    ///
    /// Never signals: the pid may already belong to another process.
    pub(crate) fn discard(mut self) {
        self.close_channels();
    }

    /// Terminate the process and release both channel ends
    ///
    /// SIGTERM first, SIGKILL once `grace` has passed. A child that is
    /// already gone (ESRCH, ECHILD) counts as terminated.
    pub(crate) fn terminate(mut self, grace: Duration) {
        self.close_channels();

        if !send_signal(self.pid, libc::SIGTERM) {
            // nothing left to signal, but there may be a zombie to collect
            let _ = try_wait(self.pid);
            return;
        }

        let deadline = Instant::now() + grace;
        loop {
            match try_wait(self.pid) {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => {
                    warn!(pid = self.pid, error = %e, "waitpid failed during eviction");
                    return;
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(EXIT_POLL);
        }

        debug!(pid = self.pid, grace_ms = grace.as_millis() as u64, "Child ignored SIGTERM, killing");
        send_signal(self.pid, libc::SIGKILL);
        if let Err(e) = wait_blocking(self.pid) {
            warn!(pid = self.pid, error = %e, "waitpid failed after SIGKILL");
        }
    }
}

/// Returns false when the process no longer exists
#[allow(unsafe_code)]
fn send_signal(pid: libc::pid_t, signal: libc::c_int) -> bool {
    // SAFETY: kill has no memory-safety preconditions.
    if unsafe { libc::kill(pid, signal) } == 0 {
        return true;
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ESRCH) {
        warn!(pid, signal, error = %err, "kill failed");
    }
    false
}

/// Collect the child if it has exited; Ok(true) once it is gone
#[allow(unsafe_code)]
pub(crate) fn try_wait(pid: libc::pid_t) -> io::Result<bool> {
    let mut status = 0;
    loop {
        // SAFETY: `status` is a valid out-pointer for the call.
        let rc = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
        if rc == pid {
            return Ok(true);
        }
        if rc == 0 {
            return Ok(false);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::ECHILD) => return Ok(true),
            _ => return Err(err),
        }
    }
}

#[allow(unsafe_code)]
fn wait_blocking(pid: libc::pid_t) -> io::Result<()> {
    let mut status = 0;
    loop {
        // SAFETY: as in try_wait.
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc == pid {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::ECHILD) => return Ok(()),
            _ => return Err(err),
        }
    }
}

/// Close every inherited socket except `keep`
///
/// Drops the listener, the other children's control channels and any
/// client sockets the parent was holding.
#[allow(unsafe_code)]
fn close_inherited_sockets(keep: RawFd) {
    let candidates: Vec<RawFd> = match std::fs::read_dir("/proc/self/fd") {
        Ok(entries) => entries
            .filter_map(|e| e.ok()?.file_name().to_str()?.parse().ok())
            .collect(),
        Err(_) => {
            // SAFETY: sysconf has no preconditions.
            let limit = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
            let limit = if limit <= 0 { 1024 } else { limit.min(65_536) };
            (0..limit as RawFd).collect()
        }
    };
    for fd in candidates {
        if fd <= 2 || fd == keep {
            continue;
        }
        // SAFETY: fstat writes into a zeroed stat struct; a stale fd only
        // yields EBADF.
        let is_socket = unsafe {
            let mut st: libc::stat = std::mem::zeroed();
            libc::fstat(fd, &mut st) == 0 && (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK
        };
        if is_socket {
            // SAFETY: the fd belongs to the parent's objects, which this
            // process never touches again.
            unsafe {
                libc::close(fd);
            }
        }
    }
}

/// Body of a forked child; never returns
///
/// Announces `READY`, waits for a client descriptor, serves it through
/// `pipeline`, and repeats until a termination signal arrives or the
/// parent goes away. Exits with `CLOSED` on the way out.
#[allow(unsafe_code)]
pub(crate) fn child_main(control: UnixStream, pipeline: &Pipeline, config: &DispatcherConfig) -> ! {
    close_inherited_sockets(control.as_raw_fd());

    let terminate = Arc::new(AtomicBool::new(false));
    for signal in [
        signal_hook::consts::SIGTERM,
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGHUP,
    ] {
        if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&terminate)) {
            warn!(signal, error = %e, "Could not install child signal handler");
        }
    }
    let token = CancelToken::from_flag(Arc::clone(&terminate));
    let pid = std::process::id() as i32;

    let code = match serve(&control, pipeline, config, &token, &terminate, pid) {
        Ok(()) => 0,
        Err(e) => {
            debug!(pid, error = %e, "Child control channel failed");
            1
        }
    };
    let _ = StatusMessage::Closed(pid).write_to(&control);
    // SAFETY: _exit skips the parent's atexit handlers and destructors,
    // which must not run twice.
    unsafe { libc::_exit(code) }
}

fn serve(
    control: &UnixStream,
    pipeline: &Pipeline,
    config: &DispatcherConfig,
    token: &CancelToken,
    terminate: &AtomicBool,
    pid: i32,
) -> io::Result<()> {
    loop {
        if terminate.load(Ordering::SeqCst) {
            return Ok(());
        }
        StatusMessage::Ready(pid).write_to(control)?;

        let fd = loop {
            if terminate.load(Ordering::SeqCst) {
                return Ok(());
            }
            if !control::wait_readable(control.as_raw_fd(), CHILD_POLL)? {
                continue;
            }
            match control::recv_fd(control)? {
                Some(fd) => break fd,
                None => {
                    trace!(pid, "Parent closed the control channel");
                    return Ok(());
                }
            }
        };

        let client = TcpStream::from(fd);
        if config.socket_tuning {
            socket::tune_client(client.as_raw_fd());
        }
        let _ = client.set_read_timeout(Some(config.timeout()));
        let outcome = pipeline.process_client(client, token);
        trace!(pid, outcome = ?outcome, "Child finished client");
        if outcome == ClientOutcome::Exhausted {
            // overdue siblings are the parent's to reap; stay off the READY list meanwhile
            warn!(pid, "Child ran out of file descriptors");
            std::thread::sleep(EXHAUSTED_BACKOFF);
        }
    }
}
