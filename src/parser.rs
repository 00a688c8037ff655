//! # Parser Module
//!
//! The request pipeline drives an incremental HTTP/1.x head parser through
//! the [`HttpParser`] trait. The parser is handed the whole buffered head on
//! every call along with the number of bytes already consumed, and reports
//! how far it got.
//!
//! [`HttparseParser`] is the stock implementation on top of `httparse`.
//! `httparse` is stateless, so it re-scans the buffer on each call; heads
//! are capped at [`MAX_HEADER`](crate::server::MAX_HEADER) so the rescan
//! stays cheap.

use crate::error::ParseError;
use crate::server::{HeaderVec, RequestContext};
use http::Method;
use std::sync::Arc;

/// Maximum headers accepted in one request head
pub const MAX_HEADERS: usize = 64;

/// Incremental request-head parser
pub trait HttpParser: Send {
    /// Feed the buffered head
    ///
    /// `data` is everything read so far and `offset` the count returned by
    /// the previous call. Returns the new parsed count; once
    /// [`finished`](Self::finished) is true, that count is the length of the
    /// head and anything after it is body.
    ///
    /// # Errors
    ///
    /// `Malformed` on syntax errors.
    fn execute(
        &mut self,
        ctx: &mut RequestContext,
        data: &[u8],
        offset: usize,
    ) -> Result<usize, ParseError>;

    /// True once a complete head has been seen
    fn finished(&self) -> bool;

    /// Forget all state so the parser can be reused
    fn reset(&mut self);
}

/// [`HttpParser`] backed by `httparse`
#[derive(Debug, Default)]
pub struct HttparseParser {
    finished: bool,
}

impl HttparseParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Split an origin-form target into path, query and fragment
fn split_target(target: &str) -> (String, Option<String>, Option<String>) {
    let (rest, fragment) = match target.split_once('#') {
        Some((rest, frag)) => (rest, Some(frag.to_string())),
        None => (target, None),
    };
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query.to_string())),
        None => (rest, None),
    };
    (path.to_string(), query, fragment)
}

impl HttpParser for HttparseParser {
    fn execute(
        &mut self,
        ctx: &mut RequestContext,
        data: &[u8],
        offset: usize,
    ) -> Result<usize, ParseError> {
        if self.finished {
            return Ok(offset);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let status = req
            .parse(data)
            .map_err(|e| ParseError::Malformed(e.to_string()))?;

        let head_len = match status {
            httparse::Status::Partial => return Ok(data.len()),
            httparse::Status::Complete(n) => n,
        };

        let method = req.method.unwrap_or("GET");
        ctx.method = Some(
            Method::from_bytes(method.as_bytes())
                .map_err(|_| ParseError::Malformed(format!("invalid method {method:?}")))?,
        );

        let target = req.path.unwrap_or_default();
        ctx.request_uri = Some(target.to_string());
        if target.starts_with('/') {
            let (path, query, fragment) = split_target(target);
            ctx.path = Some(path);
            ctx.query = query;
            ctx.fragment = fragment;
        }
        ctx.version = Some(format!("HTTP/1.{}", req.version.unwrap_or(1)));

        let mut header_vec = HeaderVec::new();
        for h in req.headers.iter() {
            header_vec.push((
                Arc::from(h.name),
                String::from_utf8_lossy(h.value).into_owned(),
            ));
        }
        ctx.headers = header_vec;

        self.finished = true;
        Ok(head_len)
    }

    fn finished(&self) -> bool {
        self.finished
    }

    fn reset(&mut self) {
        self.finished = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_head() {
        let mut parser = HttparseParser::new();
        let mut ctx = RequestContext::default();
        let data = b"GET /files/a.txt?x=1#top HTTP/1.1\r\nHost: localhost\r\n\r\nBODY";
        let n = parser.execute(&mut ctx, data, 0).unwrap();
        assert!(parser.finished());
        assert_eq!(&data[n..], b"BODY");
        assert_eq!(ctx.method, Some(Method::GET));
        assert_eq!(ctx.path.as_deref(), Some("/files/a.txt"));
        assert_eq!(ctx.query.as_deref(), Some("x=1"));
        assert_eq!(ctx.fragment.as_deref(), Some("top"));
        assert_eq!(ctx.version.as_deref(), Some("HTTP/1.1"));
        assert_eq!(ctx.get_header("host"), Some("localhost"));
    }

    #[test]
    fn test_partial_then_complete() {
        let mut parser = HttparseParser::new();
        let mut ctx = RequestContext::default();
        let first = b"POST /up HTTP/1.0\r\nContent-Le";
        let n = parser.execute(&mut ctx, first, 0).unwrap();
        assert_eq!(n, first.len());
        assert!(!parser.finished());

        let mut data = first.to_vec();
        data.extend_from_slice(b"ngth: 3\r\n\r\nabc");
        let n = parser.execute(&mut ctx, &data, n).unwrap();
        assert!(parser.finished());
        assert_eq!(&data[n..], b"abc");
        assert_eq!(ctx.content_length(), Some(3));
        assert_eq!(ctx.version.as_deref(), Some("HTTP/1.0"));
    }

    #[test]
    fn test_absolute_target_leaves_path_unset() {
        let mut parser = HttparseParser::new();
        let mut ctx = RequestContext::default();
        parser
            .execute(&mut ctx, b"GET http://example.com/a HTTP/1.1\r\n\r\n", 0)
            .unwrap();
        assert!(parser.finished());
        assert_eq!(ctx.request_uri.as_deref(), Some("http://example.com/a"));
        assert_eq!(ctx.path, None);
    }

    #[test]
    fn test_malformed_head() {
        let mut parser = HttparseParser::new();
        let mut ctx = RequestContext::default();
        let err = parser
            .execute(&mut ctx, b"GET / HTTP/1.1\r\nBad Header\r\n\r\n", 0)
            .unwrap_err();
        assert!(matches!(err, ParseError::Malformed(_)));
    }

    #[test]
    fn test_reset_allows_reuse() {
        let mut parser = HttparseParser::new();
        let mut ctx = RequestContext::default();
        parser.execute(&mut ctx, b"GET / HTTP/1.1\r\n\r\n", 0).unwrap();
        parser.reset();
        assert!(!parser.finished());
    }
}
