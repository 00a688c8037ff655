//! Classifier core - resolved once per request on the hot path.

#![deny(clippy::inefficient_to_string)]
#![deny(clippy::format_push_string)]

use crate::error::RegistrationError;
use crate::handlers::HttpHandler;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Ordered handler chain for one prefix
///
/// Shared behind an `Arc` so resolving a request never copies the chain.
pub type HandlerChain = Arc<Vec<Arc<dyn HttpHandler>>>;

/// Result of a successful [`Classifier::resolve`]
#[derive(Clone)]
pub struct Resolved {
    /// The matched prefix
    pub script_name: String,
    /// The remainder of the path after the prefix
    pub path_info: String,
    /// Handlers in registered order
    pub handlers: HandlerChain,
}

impl fmt::Debug for Resolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolved")
            .field("script_name", &self.script_name)
            .field("path_info", &self.path_info)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Longest-prefix URI classifier
#[derive(Clone, Default)]
pub struct Classifier {
    routes: HashMap<String, HandlerChain>,
    /// Length of the longest registered prefix, bounds the resolve scan
    longest: usize,
}

impl fmt::Debug for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classifier")
            .field("uris", &self.uris())
            .finish()
    }
}

fn check_prefix(prefix: &str) -> Result<(), RegistrationError> {
    if prefix.starts_with('/') {
        Ok(())
    } else {
        Err(RegistrationError::InvalidPrefix {
            prefix: prefix.to_string(),
        })
    }
}

impl Classifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `prefix` for `handlers`
    ///
    /// # Errors
    ///
    /// `Conflict` if the prefix already has a chain, `InvalidPrefix` if it
    /// does not start with `/`.
    pub fn register(
        &mut self,
        prefix: &str,
        handlers: Vec<Arc<dyn HttpHandler>>,
    ) -> Result<(), RegistrationError> {
        check_prefix(prefix)?;
        if self.routes.contains_key(prefix) {
            return Err(RegistrationError::Conflict {
                prefix: prefix.to_string(),
            });
        }
        debug!(prefix, handlers = handlers.len(), "Registered URI prefix");
        self.longest = self.longest.max(prefix.len());
        self.routes.insert(prefix.to_string(), Arc::new(handlers));
        Ok(())
    }

    /// Add one handler to an existing chain, at the back or the front
    ///
    /// # Errors
    ///
    /// `NotRegistered` if the prefix has no chain yet.
    pub fn append(
        &mut self,
        prefix: &str,
        handler: Arc<dyn HttpHandler>,
        in_front: bool,
    ) -> Result<(), RegistrationError> {
        let chain = self
            .routes
            .get_mut(prefix)
            .ok_or_else(|| RegistrationError::NotRegistered {
                prefix: prefix.to_string(),
            })?;
        let mut handlers = Vec::with_capacity(chain.len() + 1);
        if in_front {
            handlers.push(handler);
            handlers.extend(chain.iter().cloned());
        } else {
            handlers.extend(chain.iter().cloned());
            handlers.push(handler);
        }
        *chain = Arc::new(handlers);
        Ok(())
    }

    /// Drop the whole chain at `prefix`
    ///
    /// # Errors
    ///
    /// `NotRegistered` if nothing is registered there.
    pub fn unregister(&mut self, prefix: &str) -> Result<HandlerChain, RegistrationError> {
        let chain = self
            .routes
            .remove(prefix)
            .ok_or_else(|| RegistrationError::NotRegistered {
                prefix: prefix.to_string(),
            })?;
        self.longest = self.routes.keys().map(String::len).max().unwrap_or(0);
        debug!(prefix, "Unregistered URI prefix");
        Ok(chain)
    }

    /// Find the chain for the longest registered prefix of `path`
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<Resolved> {
        let upper = path.len().min(self.longest);
        for end in (1..=upper).rev() {
            if !path.is_char_boundary(end) {
                continue;
            }
            let prefix = &path[..end];
            if let Some(handlers) = self.routes.get(prefix) {
                let path_info = if prefix == "/" {
                    path.to_string()
                } else {
                    path[end..].to_string()
                };
                return Some(Resolved {
                    script_name: prefix.to_string(),
                    path_info,
                    handlers: Arc::clone(handlers),
                });
            }
        }
        None
    }

    /// The chain registered exactly at `prefix`
    #[must_use]
    pub fn chain(&self, prefix: &str) -> Option<HandlerChain> {
        self.routes.get(prefix).map(Arc::clone)
    }

    /// Registered prefixes, sorted
    #[must_use]
    pub fn uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self.routes.keys().cloned().collect();
        uris.sort();
        uris
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
