//! Response writer handed to every handler in a chain.
//!
//! Handlers set a status, headers and a body; nothing reaches the socket
//! until [`HttpResponse::finished`] (or the individual `send_*` calls) run.
//! The head always carries `Connection: close`: every connection serves
//! exactly one request.

use super::request::HeaderVec;
use http::StatusCode;
use std::io::{self, Write};
use std::sync::Arc;
use tracing::trace;

/// Buffered HTTP/1.1 response bound to one client socket
pub struct HttpResponse<'c> {
    socket: &'c mut dyn Write,
    status: u16,
    reason: Option<String>,
    headers: HeaderVec,
    body: Vec<u8>,
    status_sent: bool,
    header_sent: bool,
    body_sent: bool,
    closed: bool,
}

impl std::fmt::Debug for HttpResponse<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("done", &self.done())
            .field("closed", &self.closed)
            .finish()
    }
}

fn reason_phrase(status: u16) -> &'static str {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown")
}

impl<'c> HttpResponse<'c> {
    /// A fresh response; status defaults to 404 until a handler starts it
    pub fn new(socket: &'c mut dyn Write) -> Self {
        Self {
            socket,
            status: 404,
            reason: None,
            headers: HeaderVec::new(),
            body: Vec::new(),
            status_sent: false,
            header_sent: false,
            body_sent: false,
            closed: false,
        }
    }

    /// Set the status code
    pub fn start(&mut self, status: u16) -> &mut Self {
        self.status = status;
        self
    }

    /// Override the reason phrase for the status line
    pub fn reason(&mut self, reason: impl Into<String>) -> &mut Self {
        self.reason = Some(reason.into());
        self
    }

    /// Append a header (repeats allowed)
    pub fn header(&mut self, name: &str, value: &str) -> &mut Self {
        self.headers.push((Arc::from(name), value.to_string()));
        self
    }

    /// Replace every header named `name` with a single value
    pub fn set_header(&mut self, name: &str, value: &str) -> &mut Self {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.header(name, value)
    }

    #[must_use]
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Append to the buffered body
    pub fn write_body(&mut self, data: &[u8]) -> &mut Self {
        self.body.extend_from_slice(data);
        self
    }

    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Discard buffered headers and body
    ///
    /// # Errors
    ///
    /// Fails once any part of the head has reached the socket.
    pub fn reset(&mut self) -> io::Result<()> {
        if self.status_sent || self.header_sent {
            return Err(io::Error::other("response head already sent"));
        }
        self.headers.clear();
        self.body.clear();
        self.reason = None;
        Ok(())
    }

    fn write_socket(&mut self, data: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        match self.socket.write_all(data) {
            Ok(()) => Ok(()),
            Err(e) => {
                trace!(error = %e, "Client socket closed while writing response");
                self.closed = true;
                Err(e)
            }
        }
    }

    /// Write the status line
    ///
    /// # Errors
    ///
    /// Socket write failure; the response is then marked closed.
    pub fn send_status(&mut self) -> io::Result<()> {
        if self.status_sent {
            return Ok(());
        }
        let reason = self
            .reason
            .clone()
            .unwrap_or_else(|| reason_phrase(self.status).to_string());
        let line = format!(
            "HTTP/1.1 {} {}\r\nConnection: close\r\n",
            self.status, reason
        );
        self.write_socket(line.as_bytes())?;
        self.status_sent = true;
        Ok(())
    }

    /// Write the headers and the blank line ending the head
    ///
    /// `Content-Length` is added from the buffered body unless a handler
    /// set one, or the status is 304.
    ///
    /// # Errors
    ///
    /// Socket write failure; the response is then marked closed.
    pub fn send_header(&mut self) -> io::Result<()> {
        if self.header_sent {
            return Ok(());
        }
        self.send_status()?;
        let mut head = String::with_capacity(64 + self.headers.len() * 32);
        for (name, value) in &self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        if self.status != 304 && self.get_header("content-length").is_none() {
            head.push_str("Content-Length: ");
            head.push_str(&self.body.len().to_string());
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        self.write_socket(head.as_bytes())?;
        self.header_sent = true;
        Ok(())
    }

    /// Write the buffered body
    ///
    /// # Errors
    ///
    /// Socket write failure; the response is then marked closed.
    pub fn send_body(&mut self) -> io::Result<()> {
        if self.body_sent {
            return Ok(());
        }
        self.send_header()?;
        let body = std::mem::take(&mut self.body);
        let result = self.write_socket(&body);
        self.body = body;
        result?;
        self.body_sent = true;
        Ok(())
    }

    /// Write bytes straight to the socket, bypassing the buffers
    ///
    /// For handlers that stream their own output after sending the head.
    ///
    /// # Errors
    ///
    /// Socket write failure; the response is then marked closed.
    pub fn write_raw(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_socket(data)
    }

    /// Send whatever part of the response has not gone out yet
    ///
    /// # Errors
    ///
    /// Socket write failure; the response is then marked closed.
    pub fn finished(&mut self) -> io::Result<()> {
        self.send_status()?;
        self.send_header()?;
        self.send_body()?;
        if let Err(e) = self.socket.flush() {
            self.closed = true;
            return Err(e);
        }
        Ok(())
    }

    /// True once status, headers and body have all been sent
    #[must_use]
    pub fn done(&self) -> bool {
        self.status_sent && self.header_sent && self.body_sent
    }

    /// True after a write to the client failed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
