#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Request pipeline tests over real sockets, without a dispatcher
//!
//! Each test accepts one connection on a std listener and serves it on a
//! plain thread, so the outcome of `process_client` can be asserted
//! directly.

mod common;

use arc_swap::ArcSwap;
use common::http::{parse_response_parts, read_to_close};
use forkserve::cancel::{CancelReason, CancelToken};
use forkserve::classifier::Classifier;
use forkserve::handlers::{FnHandler, HttpHandler};
use forkserve::server::{ClientOutcome, Pipeline, ERROR_404_RESPONSE, MAX_BODY, MAX_HEADER};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

fn pipeline(routes: Vec<(&str, Arc<dyn HttpHandler>)>) -> Pipeline {
    let mut classifier = Classifier::new();
    for (prefix, handler) in routes {
        classifier.register(prefix, vec![handler]).unwrap();
    }
    Pipeline::new(Arc::new(ArcSwap::from_pointee(classifier)))
}

/// Serve exactly one connection; returns the client end and the outcome
fn serve_one(pipeline: Pipeline, token: CancelToken) -> (TcpStream, JoinHandle<ClientOutcome>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        pipeline.process_client(stream, &token)
    });
    (TcpStream::connect(addr).unwrap(), server)
}

fn exchange(pipeline: Pipeline, request: &[u8]) -> (String, ClientOutcome) {
    let (mut client, server) = serve_one(pipeline, CancelToken::new());
    client.write_all(request).unwrap();
    let resp = read_to_close(&mut client);
    (resp, server.join().unwrap())
}

fn reply(body: &'static str) -> Arc<dyn HttpHandler> {
    Arc::new(FnHandler::new(move |_req, res| {
        res.start(200).write_body(body.as_bytes());
    }))
}

#[test]
fn test_served_request() {
    let p = pipeline(vec![("/", reply("root"))]);
    let (resp, outcome) = exchange(p, b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert_eq!(outcome, ClientOutcome::Served);
    let (status, _, body) = parse_response_parts(&resp);
    assert_eq!(status, 200);
    assert_eq!(body, "root");
}

#[test]
fn test_unmatched_path_is_not_found() {
    let p = pipeline(vec![("/api", reply("api"))]);
    let (resp, outcome) = exchange(p, b"GET /other HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert_eq!(outcome, ClientOutcome::NotFound);
    assert_eq!(resp.as_bytes(), ERROR_404_RESPONSE);
}

#[test]
fn test_garbage_head_is_protocol_error() {
    let p = pipeline(vec![("/", reply("never"))]);
    let (resp, outcome) = exchange(p, b"\x01\x02 not a request\r\n\r\n");
    assert_eq!(outcome, ClientOutcome::ProtocolError);
    assert!(resp.is_empty());
}

#[test]
fn test_oversized_head_is_rejected() {
    let p = pipeline(vec![("/", reply("never"))]);
    let (mut client, server) = serve_one(p, CancelToken::new());

    let mut head = b"GET / HTTP/1.1\r\nX-Fill: ".to_vec();
    head.resize(MAX_HEADER + 8 * 1024, b'a');
    // the server stops reading at the limit, so the tail may hit a reset
    let _ = client.write_all(&head);

    assert_eq!(server.join().unwrap(), ClientOutcome::ProtocolError);
}

#[test]
fn test_large_body_is_spooled_for_handler() {
    let seen = Arc::new(Mutex::new(None::<(bool, usize)>));
    let recorder = Arc::clone(&seen);
    let handler: Arc<dyn HttpHandler> = Arc::new(FnHandler::new(move |req, res| {
        let spooled = req.body_mut().is_some_and(|b| b.is_spooled());
        let len = req.read_body_to_end().unwrap().len();
        *recorder.lock().unwrap() = Some((spooled, len));
        res.start(201);
    }));
    let p = pipeline(vec![("/upload", handler)]);

    let len = MAX_BODY + 1000;
    let mut request =
        format!("POST /upload HTTP/1.1\r\nHost: localhost\r\nContent-Length: {len}\r\n\r\n")
            .into_bytes();
    request.resize(request.len() + len, b'z');
    let (resp, outcome) = exchange(p, &request);

    assert_eq!(outcome, ClientOutcome::Served);
    assert_eq!(parse_response_parts(&resp).0, 201);
    assert_eq!(*seen.lock().unwrap(), Some((true, len)));
}

#[test]
fn test_client_abort_mid_body_skips_handlers() {
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let handler: Arc<dyn HttpHandler> = Arc::new(FnHandler::new(move |_req, _res| {
        flag.store(true, Ordering::SeqCst);
    }));
    let (mut client, server) = serve_one(pipeline(vec![("/", handler)]), CancelToken::new());

    client
        .write_all(b"POST /form HTTP/1.1\r\nContent-Length: 100\r\n\r\nonly ten..")
        .unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    assert_eq!(server.join().unwrap(), ClientOutcome::Aborted);
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn test_handler_panic_becomes_500() {
    let handler: Arc<dyn HttpHandler> =
        Arc::new(FnHandler::named("exploding", |_req, _res| panic!("boom")));
    let p = pipeline(vec![("/", handler)]);
    let (resp, outcome) = exchange(p, b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert_eq!(outcome, ClientOutcome::Failed);
    assert_eq!(parse_response_parts(&resp).0, 500);
}

#[test]
fn test_cancelled_token_serves_nothing() {
    let token = CancelToken::new();
    token.cancel(CancelReason::Stop);
    let (mut client, server) = serve_one(pipeline(vec![("/", reply("never"))]), token);
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    assert_eq!(
        server.join().unwrap(),
        ClientOutcome::Cancelled(CancelReason::Stop)
    );
    let mut rest = Vec::new();
    let _ = client.read_to_end(&mut rest);
    assert!(rest.is_empty());
}
