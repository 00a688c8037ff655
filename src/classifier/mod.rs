//! # Classifier Module
//!
//! The classifier maps a request path to the ordered chain of handlers
//! registered under the longest matching URI prefix.
//!
//! ## Overview
//!
//! - Prefixes are plain strings starting with `/` and match character by
//!   character, so `/test` also claims `/testing` unless `/testing` is
//!   registered too.
//! - The longest registered prefix wins.
//! - A resolved match splits the path into `script_name` (the prefix) and
//!   `path_info` (the rest). The root prefix `/` is special: its
//!   `path_info` is the whole path.
//!
//! ## Registration semantics
//!
//! Only the first registration of a prefix is exclusive. A second
//! [`Classifier::register`] for the same prefix fails with
//! [`RegistrationError::Conflict`](crate::error::RegistrationError::Conflict);
//! the dispatcher reacts by pushing the new handler onto the existing chain
//! (or in front of it) through [`Classifier::append`].
//! [`Classifier::unregister`] always removes the whole chain.
//!
//! ## Example
//!
//! ```rust
//! use forkserve::classifier::Classifier;
//! use forkserve::handlers::FnHandler;
//! use std::sync::Arc;
//!
//! let mut classifier = Classifier::new();
//! classifier
//!     .register("/files", vec![Arc::new(FnHandler::new(|_req, res| {
//!         res.start(200).write_body(b"ok");
//!     }))])
//!     .unwrap();
//!
//! let resolved = classifier.resolve("/files/readme.txt").unwrap();
//! assert_eq!(resolved.script_name, "/files");
//! assert_eq!(resolved.path_info, "/readme.txt");
//! assert_eq!(resolved.handlers.len(), 1);
//! ```

mod core;

pub use core::{Classifier, HandlerChain, Resolved};
