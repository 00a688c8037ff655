//! # CLI Module
//!
//! Command-line front end for running a dispatcher with diagnostic echo
//! handlers, and for checking configuration files.
//!
//! ## Commands
//!
//! ### `serve`
//!
//! ```bash
//! forkserve serve --model process --config forkserve.yaml --echo / --echo /api
//! ```
//!
//! Options:
//! - `--config <FILE>` - YAML configuration; `FORKSERVE_*` variables override it
//! - `--addr <HOST:PORT>` - overrides host and port from file and environment
//! - `--model <threaded|process>` - dispatch model (default: threaded)
//! - `--echo <PREFIX>` - mount an [`EchoHandler`](crate::handlers::EchoHandler), repeatable (default: `/`)
//!
//! SIGINT or SIGTERM stops the dispatcher and waits for in-flight work to
//! drain before exiting.
//!
//! ### `check-config`
//!
//! ```bash
//! forkserve check-config --config forkserve.yaml
//! ```
//!
//! Loads the file, applies the environment and validates the result.

mod commands;

#[cfg(test)]
mod tests;

pub use commands::{load_config, run, run_cli, Cli, Commands, Model};
