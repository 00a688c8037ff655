//! # Cancellation Module
//!
//! Stop, timeout and termination events are delivered as values through a
//! shared [`CancelToken`] instead of being raised into another thread. Every
//! blocking boundary in the request pipeline and the dispatcher loops checks
//! the token; a reaper that cannot wait for the next check forces the issue
//! by shutting down the connection underneath the worker.
//!
//! A token never resets. Once cancelled, it stays cancelled with the first
//! reason recorded, so a stop can never be swallowed by a later timeout.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Why a unit of work (or a whole dispatcher) was told to stop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// `Dispatcher::stop` was called
    Stop,
    /// The worker ran longer than its allotted time
    Timeout(String),
    /// A termination signal arrived (forked children)
    Terminated,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Stop => write!(f, "stop requested"),
            CancelReason::Timeout(msg) => write!(f, "timed out: {msg}"),
            CancelReason::Terminated => write!(f, "terminated by signal"),
        }
    }
}

#[derive(Debug, Default)]
struct CancelInner {
    flag: Arc<AtomicBool>,
    reason: Mutex<Option<CancelReason>>,
}

/// Cloneable, thread-safe cancellation handle
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    /// Create a fresh, uncancelled token
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing flag, typically one registered with `signal_hook::flag`
    ///
    /// If the flag is raised externally, [`reason`](Self::reason) reports
    /// [`CancelReason::Terminated`].
    #[must_use]
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self {
            inner: Arc::new(CancelInner {
                flag,
                reason: Mutex::new(None),
            }),
        }
    }

    /// Cancel with `reason`; the first reason wins
    pub fn cancel(&self, reason: CancelReason) {
        {
            let mut slot = self
                .inner
                .reason
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.inner.flag.store(true, Ordering::SeqCst);
    }

    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// The recorded reason, if cancelled
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        if !self.is_cancelled() {
            return None;
        }
        let slot = self
            .inner
            .reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Some(slot.clone().unwrap_or(CancelReason::Terminated))
    }

    /// `Err(reason)` once cancelled; used at blocking boundaries with `?`
    pub fn check(&self) -> Result<(), CancelReason> {
        match self.reason() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert_eq!(token.check(), Ok(()));

        token.cancel(CancelReason::Stop);
        token.cancel(CancelReason::Timeout("slow".into()));
        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some(CancelReason::Stop));
    }

    #[test]
    fn test_clones_share_state() {
        let token = CancelToken::new();
        let other = token.clone();
        other.cancel(CancelReason::Terminated);
        assert_eq!(token.check(), Err(CancelReason::Terminated));
    }

    #[test]
    fn test_external_flag_reports_terminated() {
        let flag = Arc::new(AtomicBool::new(false));
        let token = CancelToken::from_flag(Arc::clone(&flag));
        assert!(!token.is_cancelled());
        flag.store(true, Ordering::SeqCst);
        assert_eq!(token.reason(), Some(CancelReason::Terminated));
    }
}
