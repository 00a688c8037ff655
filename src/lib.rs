//! # forkserve
//!
//! **forkserve** is an HTTP connection dispatcher. It accepts TCP
//! connections, parses one request per connection, routes it through a
//! longest-prefix classifier to a chain of handlers, and protects itself
//! from overload on the way.
//!
//! ## Dispatch models
//!
//! - **Threaded** ([`dispatcher::ThreadedDispatcher`]): one `may` coroutine
//!   per connection, capped at `max_processors`. Excess connections are
//!   closed before a byte is read. Overdue workers are cancelled and their
//!   socket is shut down underneath them.
//! - **Process** ([`dispatcher::ProcessDispatcher`]): a pool of forked
//!   children. A single control thread polls the listener and every
//!   child's control socket, and hands each accepted client to an idle
//!   child as a file descriptor. Children that hang or die are evicted.
//!
//! Both drain gracefully on [`Dispatcher::stop`]: the listener closes at
//! once and in-flight work runs to completion or to its time limit.
//!
//! ## Architecture
//!
//! - **[`config`]** - dispatcher settings from defaults, YAML and `FORKSERVE_*`
//! - **[`classifier`]** - longest-prefix URI routing to handler chains
//! - **[`parser`]** - incremental request-head parsing
//! - **[`server`]** - the request pipeline, request and response types
//! - **[`handlers`]** - the handler capability and the echo handler
//! - **[`dispatcher`]** - both dispatch models and their shared base
//! - **[`cancel`]** - cancellation tokens for stop and timeout signals
//! - **[`error`]** - error types and I/O fault classification
//! - **[`logging`]** - `tracing` subscriber setup
//! - **[`cli`]** - the `forkserve` binary
//!
//! ## Example
//!
//! ```rust,no_run
//! use forkserve::config::DispatcherConfig;
//! use forkserve::dispatcher::{Dispatcher, ProcessDispatcher};
//! use forkserve::handlers::FnHandler;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DispatcherConfig {
//!     min_children: 2,
//!     max_children: 8,
//!     ..DispatcherConfig::new("127.0.0.1", 8080)
//! };
//! let dispatcher = ProcessDispatcher::new(config)?;
//! dispatcher.register(
//!     "/hello",
//!     Arc::new(FnHandler::new(|_req, res| {
//!         res.start(200).write_body(b"hello\n");
//!     })),
//!     false,
//! )?;
//! dispatcher.run()?;
//! // ... until shutdown
//! dispatcher.stop(true);
//! # Ok(())
//! # }
//! ```
//!
//! Only Unix platforms are supported.

pub mod cancel;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod ids;
pub mod logging;
pub mod parser;
pub mod server;

pub use cancel::{CancelReason, CancelToken};
pub use config::{DispatcherConfig, Domain};
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, ParseError, RegistrationError};
