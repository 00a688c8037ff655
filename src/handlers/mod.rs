//! # Handlers Module
//!
//! The handler capability consumed by the request pipeline. Concrete
//! handlers (static files, CGI bridges, application code) live outside this
//! crate; the only ones shipped here are the closure adapter [`FnHandler`]
//! and the diagnostic [`EchoHandler`] used by `forkserve serve`.
//!
//! ## Chain semantics
//!
//! Handlers registered under one prefix run in registered order. The first
//! one that completes the response (see [`HttpResponse::done`]) or loses
//! the socket ends the chain; later handlers never run. Handlers that only
//! decorate the response (add headers, log) simply return without
//! finishing it.
//!
//! ## Lifecycle notifications
//!
//! Handlers that return `true` from [`HttpHandler::request_notify`] hear
//! about a request before its body is read, and after every body chunk.
//! Upload progress trackers use this.

mod echo;

pub use echo::EchoHandler;

use crate::server::{HttpRequest, HttpResponse, RequestContext};

/// A unit of request processing mounted on a URI prefix
pub trait HttpHandler: Send + Sync {
    /// Inspect the request and write to the response
    fn process(&self, request: &mut HttpRequest, response: &mut HttpResponse<'_>);

    /// Opt into [`request_begins`](Self::request_begins) and
    /// [`request_progress`](Self::request_progress)
    fn request_notify(&self) -> bool {
        false
    }

    /// Called once the head is parsed, before the body is read
    fn request_begins(&self, _context: &RequestContext) {}

    /// Called after each body chunk with the bytes still expected
    fn request_progress(&self, _context: &RequestContext, _remaining: usize, _total: usize) {}

    /// Name used in log lines
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

type HandlerFn = dyn Fn(&mut HttpRequest, &mut HttpResponse<'_>) + Send + Sync;

/// Adapts a closure into an [`HttpHandler`]
pub struct FnHandler {
    name: String,
    f: Box<HandlerFn>,
}

impl FnHandler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut HttpRequest, &mut HttpResponse<'_>) + Send + Sync + 'static,
    {
        Self {
            name: "fn_handler".to_string(),
            f: Box::new(f),
        }
    }

    /// Same as [`new`](Self::new) with a name for log lines
    pub fn named<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut HttpRequest, &mut HttpResponse<'_>) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

impl HttpHandler for FnHandler {
    fn process(&self, request: &mut HttpRequest, response: &mut HttpResponse<'_>) {
        (self.f)(request, response)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
