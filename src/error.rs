//! # Error Module
//!
//! Typed errors for the dispatcher, the classifier and the parser adapter,
//! plus the classification of raw I/O faults into the handling taxonomy used
//! by every accept, control and request loop in the crate.
//!
//! | Fault class | Examples | Handling |
//! |---|---|---|
//! | [`IoFault::Transient`] | reset, broken pipe, EOF, bad descriptor | close silently |
//! | [`IoFault::Exhausted`] | EMFILE / ENFILE | reap workers, retry |
//! | [`IoFault::Interrupted`] | EINTR | retry the call |
//! | [`IoFault::Other`] | anything else | log and keep the loop alive |

use std::fmt;
use std::io;

/// Maximum children or processors exceeded, bad configuration, bind failures
/// and other dispatcher-level failures.
#[derive(Debug)]
pub enum DispatchError {
    /// Underlying socket or process call failed
    Io(io::Error),
    /// Route table update was rejected
    Registration(RegistrationError),
    /// The child pool is already at `max_children`
    MaxChildrenReached {
        /// The configured cap
        max: usize,
    },
    /// A freshly spawned child never announced readiness
    ChildUnavailable {
        /// Process id of the child
        pid: i32,
        /// What went wrong while waiting for it
        reason: String,
    },
    /// The listening socket could not be bound after retrying
    CouldNotBind {
        /// The `host:port` that was attempted
        addr: String,
        /// The last bind error
        source: io::Error,
    },
    /// `run` was called on a dispatcher that already has an acceptor
    AlreadyRunning,
    /// `run` was called after `stop`; dispatchers are single-use
    Stopped,
    /// Configuration failed validation
    InvalidConfig(String),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Io(e) => write!(f, "dispatcher I/O error: {e}"),
            DispatchError::Registration(e) => write!(f, "{e}"),
            DispatchError::MaxChildrenReached { max } => {
                write!(f, "maximum number of child processes ({max}) exceeded")
            }
            DispatchError::ChildUnavailable { pid, reason } => {
                write!(f, "child {pid} did not become ready: {reason}")
            }
            DispatchError::CouldNotBind { addr, source } => {
                write!(f, "could not bind listening socket on {addr}: {source}")
            }
            DispatchError::AlreadyRunning => write!(f, "dispatcher is already running"),
            DispatchError::Stopped => write!(f, "dispatcher has been stopped"),
            DispatchError::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DispatchError::Io(e) => Some(e),
            DispatchError::CouldNotBind { source, .. } => Some(source),
            DispatchError::Registration(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DispatchError {
    fn from(e: io::Error) -> Self {
        DispatchError::Io(e)
    }
}

impl From<RegistrationError> for DispatchError {
    fn from(e: RegistrationError) -> Self {
        DispatchError::Registration(e)
    }
}

/// Classifier registration failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// The prefix already owns a handler chain
    ///
    /// Callers append or prepend to the existing chain instead.
    Conflict {
        /// The prefix that was registered twice
        prefix: String,
    },
    /// `unregister` was called for a prefix that has no chain
    NotRegistered {
        /// The unknown prefix
        prefix: String,
    },
    /// Prefixes must be non-empty and start with `/`
    InvalidPrefix {
        /// The rejected prefix
        prefix: String,
    },
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationError::Conflict { prefix } => {
                write!(f, "{prefix:?} is already registered")
            }
            RegistrationError::NotRegistered { prefix } => {
                write!(f, "{prefix:?} was not registered")
            }
            RegistrationError::InvalidPrefix { prefix } => {
                write!(f, "{prefix:?} is not a valid URI prefix (must start with '/')")
            }
        }
    }
}

impl std::error::Error for RegistrationError {}

/// Malformed or oversized request head
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The request head violates HTTP/1.x syntax
    Malformed(String),
    /// The head grew past the header-size ceiling before completing
    HeaderTooLarge {
        /// Bytes buffered when the ceiling was hit
        size: usize,
        /// The ceiling
        limit: usize,
    },
    /// Parsing finished but no request path could be determined
    MissingPath,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Malformed(msg) => write!(f, "malformed request: {msg}"),
            ParseError::HeaderTooLarge { size, limit } => write!(
                f,
                "header is longer than allowed ({size} >= {limit} bytes), aborting client early"
            ),
            ParseError::MissingPath => write!(f, "no request path"),
        }
    }
}

impl std::error::Error for ParseError {}

/// How a loop should react to an I/O error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoFault {
    /// Peer went away; close quietly
    Transient,
    /// Out of descriptors; reap and retry
    Exhausted,
    /// Signal interrupted the call; retry
    Interrupted,
    /// Client aborted before accept completed
    Aborted,
    /// Log with context and continue
    Other,
}

/// Map an I/O error onto the fault taxonomy
#[must_use]
pub fn classify_io(err: &io::Error) -> IoFault {
    if let Some(code) = err.raw_os_error() {
        match code {
            libc::EMFILE | libc::ENFILE => return IoFault::Exhausted,
            libc::EINTR => return IoFault::Interrupted,
            libc::EBADF | libc::EINVAL => return IoFault::Transient,
            libc::ECONNABORTED => return IoFault::Aborted,
            _ => {}
        }
    }
    match err.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::NotConnected
        | io::ErrorKind::InvalidInput
        | io::ErrorKind::TimedOut
        | io::ErrorKind::WouldBlock => IoFault::Transient,
        io::ErrorKind::ConnectionAborted => IoFault::Aborted,
        io::ErrorKind::Interrupted => IoFault::Interrupted,
        _ => IoFault::Other,
    }
}
