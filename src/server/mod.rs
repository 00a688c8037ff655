//! # Server Module
//!
//! The request pipeline shared by both dispatch models, and the request
//! and response types handlers work with.
//!
//! ## Request flow
//!
//! 1. Read the head in [`CHUNK_SIZE`] chunks and feed the parser until it
//!    reports a complete head; heads reaching [`MAX_HEADER`] are rejected.
//! 2. Derive the path from absolute-form targets.
//! 3. Resolve the path against the classifier; unmatched paths get
//!    [`ERROR_404_RESPONSE`].
//! 4. Read the body: in memory up to [`MAX_BODY`], spooled to a temporary
//!    file beyond that.
//! 5. Run the handler chain until one finishes the response or the client
//!    goes away, then finish the response if nobody did.
//!
//! Every connection carries exactly one request and is closed afterwards.

mod connection;
mod pipeline;
mod request;
mod response;

pub use connection::Connection;
pub use pipeline::{
    ClientOutcome, ParserFactory, Pipeline, CHUNK_SIZE, ERROR_404_RESPONSE, MAX_HEADER,
};
pub use request::{
    BodyAbort, BodySource, HeaderVec, HttpRequest, RequestContext, MAX_BODY, MAX_INLINE_HEADERS,
};
pub use response::HttpResponse;
