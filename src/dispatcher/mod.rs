//! # Dispatcher Module
//!
//! Accept loops and worker lifecycles. Both models share [`DispatcherCore`]
//! (configuration, route table, stop signal) and the [`Dispatcher`] trait.
//!
//! ## Threaded model
//!
//! [`ThreadedDispatcher`] runs one `may` coroutine per connection. The live
//! worker registry is the admission-control signal: at `max_processors`
//! new connections are closed on accept. Overdue workers are cancelled
//! through their token and their socket is shut down underneath them.
//!
//! ## Process model
//!
//! [`ProcessDispatcher`] keeps a pool of forked children between
//! `min_children` and `max_children`. A single control thread polls the
//! listener and every child's control socket, drains status lines before
//! accepting, and passes each client to an idle child with `SCM_RIGHTS`.
//! A child holding a client longer than `timeout + throttle` is evicted
//! (SIGTERM, then SIGKILL after `kill_grace_ms`).
//!
//! Route changes bump a generation counter. Idle children forked under an
//! older generation are recycled right away, busy ones when they report
//! `READY`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use forkserve::config::DispatcherConfig;
//! use forkserve::dispatcher::{Dispatcher, ThreadedDispatcher};
//! use forkserve::handlers::EchoHandler;
//! use std::sync::Arc;
//!
//! let dispatcher = ThreadedDispatcher::new(DispatcherConfig::new("127.0.0.1", 8080))?;
//! dispatcher.register("/", Arc::new(EchoHandler), false)?;
//! dispatcher.run()?;
//! // ...
//! dispatcher.stop(true);
//! ```

mod base;
mod child;
mod control;
mod metrics;
mod process;
mod socket;
mod threaded;
mod worker;

pub use base::{Dispatcher, DispatcherCore, BIND_RETRIES, BIND_RETRY_DELAY};
pub use child::{Child, ChildState};
pub use control::{recv_fd, send_fd, StatusDecoder, StatusMessage};
pub use metrics::DispatchMetrics;
pub use process::{AfterSpawnHook, BeforeSpawnHook, ProcessDispatcher, SpawnSide};
pub use socket::{tune_client, tune_listener};
pub use threaded::ThreadedDispatcher;
pub use worker::{Worker, WorkerGuard, WorkerRegistry};
