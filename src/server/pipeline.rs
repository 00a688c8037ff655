use super::connection::Connection;
use super::request::{BodyAbort, HttpRequest, RequestContext};
use super::response::HttpResponse;
use crate::cancel::{CancelReason, CancelToken};
use crate::classifier::Classifier;
use crate::error::{classify_io, IoFault, ParseError};
use crate::handlers::HttpHandler;
use crate::parser::{HttpParser, HttparseParser};
use arc_swap::ArcSwap;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, trace, warn};

/// Read size for the request head
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Ceiling on the buffered request head
pub const MAX_HEADER: usize = 112 * 1024;

/// Canned reply for paths no prefix claims
pub const ERROR_404_RESPONSE: &[u8] =
    b"HTTP/1.1 404 Not Found\r\nConnection: close\r\nServer: forkserve\r\n\r\nNOT FOUND";

/// Builds a fresh parser per connection
pub type ParserFactory = Arc<dyn Fn() -> Box<dyn HttpParser> + Send + Sync>;

/// How one client connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOutcome {
    /// A handler chain ran and the response went out
    Served,
    /// No prefix matched; the canned 404 was sent
    NotFound,
    /// The client went away before the exchange finished
    Aborted,
    /// The head was malformed or too large
    ProtocolError,
    /// The process ran out of descriptors mid-request
    Exhausted,
    /// The worker was cancelled
    Cancelled(CancelReason),
    /// Unexpected I/O failure or handler panic
    Failed,
}

/// Map a socket error to an outcome, logging only the unexpected ones
fn io_outcome(err: &io::Error, stage: &'static str) -> ClientOutcome {
    match classify_io(err) {
        IoFault::Transient | IoFault::Aborted | IoFault::Interrupted => {
            trace!(error = %err, stage, "Client connection dropped");
            ClientOutcome::Aborted
        }
        IoFault::Exhausted => {
            warn!(error = %err, stage, "Out of file descriptors while serving client");
            ClientOutcome::Exhausted
        }
        IoFault::Other => {
            error!(error = %err, stage, "Unexpected client socket error");
            ClientOutcome::Failed
        }
    }
}

/// The per-connection request pipeline
///
/// Reads and parses the head, resolves the path against the current route
/// table, reads the body, and runs the resolved handler chain. Each
/// connection serves exactly one request.
#[derive(Clone)]
pub struct Pipeline {
    classifier: Arc<ArcSwap<Classifier>>,
    parser: ParserFactory,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("uris", &self.classifier.load().uris())
            .finish()
    }
}

impl Pipeline {
    /// Pipeline using [`HttparseParser`]
    #[must_use]
    pub fn new(classifier: Arc<ArcSwap<Classifier>>) -> Self {
        Self::with_parser(
            classifier,
            Arc::new(|| Box::new(HttparseParser::new()) as Box<dyn HttpParser>),
        )
    }

    /// Pipeline using a custom parser
    #[must_use]
    pub fn with_parser(classifier: Arc<ArcSwap<Classifier>>, parser: ParserFactory) -> Self {
        Self { classifier, parser }
    }

    /// The route table as of now
    #[must_use]
    pub fn classifier(&self) -> Arc<Classifier> {
        self.classifier.load_full()
    }

    /// Serve one request on `client`, then close its write side
    ///
    /// Never panics on client or handler failure; the outcome says what
    /// happened.
    pub fn process_client<C: Connection>(&self, mut client: C, token: &CancelToken) -> ClientOutcome {
        let started = Instant::now();
        let outcome = self.serve(&mut client, token);
        let _ = client.flush();
        let _ = client.shutdown(Shutdown::Write);
        debug!(
            outcome = ?outcome,
            duration_ms = started.elapsed().as_millis() as u64,
            "Client finished"
        );
        outcome
    }

    fn serve<C: Connection>(&self, client: &mut C, token: &CancelToken) -> ClientOutcome {
        let mut parser = (self.parser)();
        let mut ctx = RequestContext::default();
        let mut data: Vec<u8> = Vec::with_capacity(CHUNK_SIZE);
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let mut nparsed = 0;

        loop {
            if let Err(reason) = token.check() {
                return ClientOutcome::Cancelled(reason);
            }
            match client.read(&mut chunk) {
                Ok(0) => {
                    trace!(buffered = data.len(), "Client closed before sending a full head");
                    return ClientOutcome::Aborted;
                }
                Ok(n) => data.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return io_outcome(&e, "read_head"),
            }

            match parser.execute(&mut ctx, &data, nparsed) {
                Ok(n) => nparsed = n,
                Err(e) => {
                    warn!(error = %e, "Bad client request");
                    return ClientOutcome::ProtocolError;
                }
            }
            if parser.finished() {
                break;
            }
            if data.len() >= MAX_HEADER {
                let err = ParseError::HeaderTooLarge {
                    size: data.len(),
                    limit: MAX_HEADER,
                };
                let preview = String::from_utf8_lossy(&data[..data.len().min(256)]).into_owned();
                warn!(error = %err, preview = %preview, "Rejecting oversized request head");
                return ClientOutcome::ProtocolError;
            }
        }

        if ctx.path.is_none() {
            derive_path(&mut ctx);
        }
        let Some(path) = ctx.path.clone() else {
            warn!(
                error = %ParseError::MissingPath,
                request_uri = ?ctx.request_uri,
                "Bad client request"
            );
            return ClientOutcome::ProtocolError;
        };

        let Some(resolved) = self.classifier.load().resolve(&path) else {
            trace!(path = %path, "No handler chain for path");
            return match client.write_all(ERROR_404_RESPONSE) {
                Ok(()) => ClientOutcome::NotFound,
                Err(e) => io_outcome(&e, "write_404"),
            };
        };

        ctx.script_name = Some(resolved.script_name.clone());
        ctx.path_info = Some(resolved.path_info.clone());
        ctx.remote_addr = client.peer_addr().ok().map(|a| a.ip());

        let notifiers: Vec<Arc<dyn HttpHandler>> = resolved
            .handlers
            .iter()
            .filter(|h| h.request_notify())
            .cloned()
            .collect();

        let mut request =
            match HttpRequest::read_from(ctx, &data[nparsed..], client, &notifiers, token) {
                Ok(request) => request,
                Err(BodyAbort::ClientClosed) => return ClientOutcome::Aborted,
                Err(BodyAbort::Cancelled(reason)) => return ClientOutcome::Cancelled(reason),
                Err(BodyAbort::Io(e)) => return io_outcome(&e, "read_body"),
            };

        let outcome = run_chain(&resolved.handlers, &mut request, client, token);
        if let Err(e) = request.release_body() {
            debug!(error = %e, "Could not remove request body spool file");
        }
        outcome
    }
}

/// Fill `path`, `query` and `fragment` from an absolute-form target
fn derive_path(ctx: &mut RequestContext) {
    let Some(uri) = ctx.request_uri.as_deref() else {
        return;
    };
    if let Ok(url) = url::Url::parse(uri) {
        if url.cannot_be_a_base() {
            return;
        }
        ctx.path = Some(url.path().to_string());
        ctx.query = url.query().map(str::to_string);
        ctx.fragment = url.fragment().map(str::to_string);
    }
}

fn run_chain<W: Write>(
    handlers: &[Arc<dyn HttpHandler>],
    request: &mut HttpRequest,
    client: &mut W,
    token: &CancelToken,
) -> ClientOutcome {
    let mut response = HttpResponse::new(client);

    for handler in handlers {
        if let Err(reason) = token.check() {
            return ClientOutcome::Cancelled(reason);
        }
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            handler.process(request, &mut response);
        }));
        if result.is_err() {
            error!(handler = handler.name(), "Handler panicked");
            if response.reset().is_ok() {
                response.start(500).write_body(b"Internal Server Error");
                let _ = response.finished();
            }
            return ClientOutcome::Failed;
        }
        if response.done() || response.is_closed() {
            break;
        }
    }

    if !response.done() && !response.is_closed() {
        if let Err(e) = response.finished() {
            return io_outcome(&e, "write_response");
        }
    }

    if response.is_closed() {
        ClientOutcome::Aborted
    } else {
        ClientOutcome::Served
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_exhaustion_maps_to_exhausted() {
        for errno in [libc::EMFILE, libc::ENFILE] {
            let err = io::Error::from_raw_os_error(errno);
            assert_eq!(io_outcome(&err, "read_body"), ClientOutcome::Exhausted);
        }
    }

    #[test]
    fn test_dropped_client_maps_to_aborted() {
        let err = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(io_outcome(&err, "read_head"), ClientOutcome::Aborted);
    }
}
