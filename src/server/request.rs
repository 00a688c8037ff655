use crate::cancel::{CancelReason, CancelToken};
use crate::handlers::HttpHandler;
use http::Method;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::trace;

/// Maximum inline headers before heap allocation
pub const MAX_INLINE_HEADERS: usize = 16;

/// Bodies larger than this are spooled to a temporary file
pub const MAX_BODY: usize = 112 * 1024;

/// Read size for body chunks
pub const BODY_CHUNK_SIZE: usize = 16 * 1024;

/// Header storage for the request hot path
///
/// Header names use `Arc<str>`; the common names repeat across requests and
/// clone in O(1).
pub type HeaderVec = SmallVec<[(Arc<str>, String); MAX_INLINE_HEADERS]>;

/// Parsed request fields
///
/// The parser fills the head fields; the pipeline adds the routing fields
/// (`script_name`, `path_info`) and the peer address. Anything else a parser
/// or handler wants to pass along goes into `extensions`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Request method
    pub method: Option<Method>,
    /// Raw request target as sent on the request line
    pub request_uri: Option<String>,
    /// Path component of the target; absent for absolute-form targets until
    /// the pipeline derives it
    pub path: Option<String>,
    /// Query string without the `?`
    pub query: Option<String>,
    /// Fragment without the `#`
    pub fragment: Option<String>,
    /// `HTTP/1.0` or `HTTP/1.1`
    pub version: Option<String>,
    /// Request headers in arrival order
    pub headers: HeaderVec,
    /// Address of the immediate peer (may be a proxy)
    pub remote_addr: Option<IpAddr>,
    /// Matched classifier prefix
    pub script_name: Option<String>,
    /// Path remainder after `script_name`
    pub path_info: Option<String>,
    /// Parser- or handler-specific additions
    pub extensions: HashMap<String, String>,
}

impl RequestContext {
    /// Get a header by name (case-insensitive per RFC 7230)
    #[inline]
    #[must_use]
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Declared body length; unparsable values count as none
    #[must_use]
    pub fn content_length(&self) -> Option<usize> {
        self.get_header("content-length")
            .and_then(|v| v.trim().parse().ok())
    }

    /// Best-effort client address for log lines: `X-Forwarded-For` first
    #[must_use]
    pub fn client_ip(&self) -> String {
        if let Some(forwarded) = self.get_header("x-forwarded-for") {
            return forwarded.to_string();
        }
        self.remote_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string())
    }
}

/// Request body storage
///
/// Small bodies live in memory, large ones in a temporary file that is
/// removed when the source is dropped or [`release`](Self::release)d.
#[derive(Debug)]
pub enum BodySource {
    Memory(Cursor<Vec<u8>>),
    Spooled(tempfile::NamedTempFile),
}

impl BodySource {
    fn for_length(length: usize) -> io::Result<Self> {
        if length > MAX_BODY {
            let file = tempfile::Builder::new()
                .prefix("forkserve-body-")
                .tempfile()?;
            Ok(BodySource::Spooled(file))
        } else {
            Ok(BodySource::Memory(Cursor::new(Vec::with_capacity(length))))
        }
    }

    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            BodySource::Memory(cursor) => {
                cursor.get_mut().extend_from_slice(data);
                Ok(())
            }
            BodySource::Spooled(file) => file.write_all(data),
        }
    }

    fn rewind(&mut self) -> io::Result<()> {
        match self {
            BodySource::Memory(cursor) => {
                cursor.set_position(0);
                Ok(())
            }
            BodySource::Spooled(file) => file.as_file_mut().seek(SeekFrom::Start(0)).map(|_| ()),
        }
    }

    #[must_use]
    pub fn is_spooled(&self) -> bool {
        matches!(self, BodySource::Spooled(_))
    }

    /// Path of the spool file, if spooled
    #[must_use]
    pub fn spool_path(&self) -> Option<&std::path::Path> {
        match self {
            BodySource::Memory(_) => None,
            BodySource::Spooled(file) => Some(file.path()),
        }
    }

    /// Delete any backing storage now
    ///
    /// # Errors
    ///
    /// Returns the error from removing the spool file.
    pub fn release(self) -> io::Result<()> {
        match self {
            BodySource::Memory(_) => Ok(()),
            BodySource::Spooled(file) => file.close(),
        }
    }
}

impl Read for BodySource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BodySource::Memory(cursor) => cursor.read(buf),
            BodySource::Spooled(file) => file.read(buf),
        }
    }
}

/// Why a request body could not be read to the end
#[derive(Debug)]
pub enum BodyAbort {
    /// The client closed the socket mid-upload
    ClientClosed,
    /// The worker was cancelled while reading
    Cancelled(CancelReason),
    /// Reading the socket or writing the spool failed
    Io(io::Error),
}

/// A parsed request with its body, handed to each handler in the chain
#[derive(Debug)]
pub struct HttpRequest {
    /// Head fields and routing data
    pub context: RequestContext,
    body: Option<BodySource>,
    token: CancelToken,
}

impl HttpRequest {
    /// Build a request directly, for handler unit tests and custom pipelines
    #[must_use]
    pub fn new(context: RequestContext, body: Vec<u8>) -> Self {
        Self {
            context,
            body: Some(BodySource::Memory(Cursor::new(body))),
            token: CancelToken::new(),
        }
    }

    /// Read the body announced by `Content-Length`
    ///
    /// `buffered` holds bytes that arrived together with the head. Notifier
    /// handlers hear `request_begins` first and `request_progress` after
    /// every chunk. On any abort the partially written body is dropped,
    /// which removes its spool file.
    pub(crate) fn read_from<R: Read + ?Sized>(
        context: RequestContext,
        buffered: &[u8],
        socket: &mut R,
        notifiers: &[Arc<dyn HttpHandler>],
        token: &CancelToken,
    ) -> Result<Self, BodyAbort> {
        for n in notifiers {
            n.request_begins(&context);
        }

        let total = context.content_length().unwrap_or(0);
        let mut body = BodySource::for_length(total).map_err(BodyAbort::Io)?;

        let initial = &buffered[..buffered.len().min(total)];
        body.append(initial).map_err(BodyAbort::Io)?;
        let mut remaining = total - initial.len();
        for n in notifiers {
            n.request_progress(&context, remaining, total);
        }

        if remaining > 0 {
            let mut chunk = vec![0u8; BODY_CHUNK_SIZE.min(remaining)];
            while remaining > 0 {
                token.check().map_err(BodyAbort::Cancelled)?;
                let want = chunk.len().min(remaining);
                let read = match socket.read(&mut chunk[..want]) {
                    Ok(0) => {
                        trace!(remaining, total, "Client closed during upload");
                        return Err(BodyAbort::ClientClosed);
                    }
                    Ok(read) => read,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(BodyAbort::Io(e)),
                };
                body.append(&chunk[..read]).map_err(BodyAbort::Io)?;
                remaining -= read;
                for n in notifiers {
                    n.request_progress(&context, remaining, total);
                }
            }
        }

        body.rewind().map_err(BodyAbort::Io)?;
        Ok(Self {
            context,
            body: Some(body),
            token: token.clone(),
        })
    }

    /// The body, positioned at its start until a handler reads it
    pub fn body_mut(&mut self) -> Option<&mut BodySource> {
        self.body.as_mut()
    }

    /// Take ownership of the body (a handler that streams it elsewhere)
    pub fn take_body(&mut self) -> Option<BodySource> {
        self.body.take()
    }

    /// Read the remaining body into memory
    ///
    /// # Errors
    ///
    /// Propagates read errors from the spool file.
    pub fn read_body_to_end(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        if let Some(body) = self.body.as_mut() {
            body.read_to_end(&mut out)?;
        }
        Ok(out)
    }

    /// Release body storage now instead of at drop
    ///
    /// # Errors
    ///
    /// Returns the error from removing the spool file.
    pub fn release_body(&mut self) -> io::Result<()> {
        match self.body.take() {
            Some(body) => body.release(),
            None => Ok(()),
        }
    }

    /// True once the worker serving this request has been cancelled
    ///
    /// Long-running handlers should poll this between units of work.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx_with_length(len: usize) -> RequestContext {
        let mut ctx = RequestContext::default();
        ctx.headers
            .push((Arc::from("Content-Length"), len.to_string()));
        ctx
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let ctx = ctx_with_length(12);
        assert_eq!(ctx.get_header("content-length"), Some("12"));
        assert_eq!(ctx.content_length(), Some(12));
        assert_eq!(ctx.get_header("host"), None);
    }

    #[test]
    fn test_small_body_stays_in_memory() {
        let ctx = ctx_with_length(11);
        let mut socket = Cursor::new(b" world".to_vec());
        let mut req =
            HttpRequest::read_from(ctx, b"hello", &mut socket, &[], &CancelToken::new()).unwrap();
        assert!(!req.body_mut().unwrap().is_spooled());
        assert_eq!(req.read_body_to_end().unwrap(), b"hello world");
    }

    #[test]
    fn test_large_body_is_spooled_and_released() {
        let len = MAX_BODY + 10;
        let ctx = ctx_with_length(len);
        let mut socket = Cursor::new(vec![b'x'; len]);
        let mut req =
            HttpRequest::read_from(ctx, b"", &mut socket, &[], &CancelToken::new()).unwrap();
        let path = req.body_mut().unwrap().spool_path().unwrap().to_path_buf();
        assert!(path.exists());
        assert_eq!(req.read_body_to_end().unwrap().len(), len);
        req.release_body().unwrap();
        assert!(!path.exists());
        // second release is a no-op
        req.release_body().unwrap();
    }

    #[test]
    fn test_client_close_mid_upload_aborts() {
        let ctx = ctx_with_length(100);
        let mut socket = Cursor::new(b"short".to_vec());
        let result = HttpRequest::read_from(ctx, b"", &mut socket, &[], &CancelToken::new());
        assert!(matches!(result, Err(BodyAbort::ClientClosed)));
    }

    #[test]
    fn test_cancelled_token_stops_body_read() {
        let ctx = ctx_with_length(100);
        let token = CancelToken::new();
        token.cancel(CancelReason::Stop);
        let mut socket = Cursor::new(vec![0u8; 100]);
        let result = HttpRequest::read_from(ctx, b"", &mut socket, &[], &token);
        assert!(matches!(result, Err(BodyAbort::Cancelled(CancelReason::Stop))));
    }

    struct Progress {
        begins: AtomicUsize,
        last_remaining: AtomicUsize,
    }

    impl HttpHandler for Progress {
        fn process(&self, _req: &mut HttpRequest, _res: &mut crate::server::HttpResponse<'_>) {}
        fn request_notify(&self) -> bool {
            true
        }
        fn request_begins(&self, _context: &RequestContext) {
            self.begins.fetch_add(1, Ordering::SeqCst);
        }
        fn request_progress(&self, _context: &RequestContext, remaining: usize, _total: usize) {
            self.last_remaining.store(remaining, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_notifiers_hear_progress() {
        let progress = Arc::new(Progress {
            begins: AtomicUsize::new(0),
            last_remaining: AtomicUsize::new(usize::MAX),
        });
        let notifiers: Vec<Arc<dyn HttpHandler>> = vec![Arc::clone(&progress) as Arc<dyn HttpHandler>];
        let ctx = ctx_with_length(4);
        let mut socket = Cursor::new(b"cd".to_vec());
        HttpRequest::read_from(ctx, b"ab", &mut socket, &notifiers, &CancelToken::new()).unwrap();
        assert_eq!(progress.begins.load(Ordering::SeqCst), 1);
        assert_eq!(progress.last_remaining.load(Ordering::SeqCst), 0);
    }
}
