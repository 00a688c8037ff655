#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Integration tests for the process (pre-forked children) dispatcher
//!
//! # Test Strategy
//!
//! Each test starts a real `ProcessDispatcher` on `127.0.0.1:0`, which forks
//! children out of the test binary. Handlers run inside those children, so
//! they report back only through the HTTP response; pool state is read
//! from the gauges the control thread publishes.
//!
//! Tests are serialized with [`FORK_LOCK`]: forking while another test is
//! mid-fork makes pool counts unpredictable.

mod common;

use common::http::{get, read_to_close, send_request};
use common::test_server::{test_config, wait_until};
use forkserve::config::DispatcherConfig;
use forkserve::dispatcher::{Dispatcher, ProcessDispatcher, SpawnSide};
use forkserve::handlers::{FnHandler, HttpHandler};
use forkserve::server::ERROR_404_RESPONSE;
use forkserve::DispatchError;
use parking_lot::Mutex;
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

static FORK_LOCK: Mutex<()> = parking_lot::const_mutex(());

fn pool_config() -> DispatcherConfig {
    DispatcherConfig {
        poll_interval_ms: 50,
        kill_grace_ms: 200,
        ..test_config()
    }
}

fn start(dispatcher: &ProcessDispatcher) -> SocketAddr {
    dispatcher.run().unwrap();
    let addr = dispatcher.local_addr().unwrap();
    let min = dispatcher.config().min_children;
    assert!(
        wait_until(Duration::from_secs(5), || dispatcher
            .metrics()
            .get_idle_children()
            >= min),
        "pool never reached {min} idle children"
    );
    addr
}

fn reply(body: &'static str) -> Arc<dyn HttpHandler> {
    Arc::new(FnHandler::new(move |_req, res| {
        res.start(200).write_body(body.as_bytes());
    }))
}

fn slow_reply(delay: Duration) -> Arc<dyn HttpHandler> {
    Arc::new(FnHandler::new(move |_req, res| {
        std::thread::sleep(delay);
        res.start(200).write_body(b"slow");
    }))
}

#[test]
fn test_client_is_served_by_a_child_process() {
    let _serial = FORK_LOCK.lock();
    let dispatcher = ProcessDispatcher::new(pool_config()).unwrap();
    dispatcher
        .register(
            "/pid",
            Arc::new(FnHandler::new(|_req, res| {
                res.start(200)
                    .write_body(std::process::id().to_string().as_bytes());
            })),
            false,
        )
        .unwrap();
    let addr = start(&dispatcher);

    let (status, body) = get(&addr, "/pid");
    assert_eq!(status, 200);
    let child_pid: u32 = body.parse().unwrap();
    assert_ne!(child_pid, std::process::id());

    let resp = send_request(&addr, "GET /nowhere HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert_eq!(resp.as_bytes(), ERROR_404_RESPONSE);

    dispatcher.stop(true);
    assert!(!dispatcher.is_running());
    assert_eq!(dispatcher.children(), 0);
    assert_eq!(dispatcher.metrics().get_dispatched_count(), 2);
}

#[test]
fn test_pool_is_topped_up_to_min_children() {
    let _serial = FORK_LOCK.lock();
    let config = DispatcherConfig {
        min_children: 3,
        max_children: 5,
        ..pool_config()
    };
    let dispatcher = ProcessDispatcher::new(config).unwrap();
    dispatcher.register("/", reply("ok"), false).unwrap();
    start(&dispatcher);

    assert_eq!(dispatcher.children(), 3);
    assert_eq!(dispatcher.metrics().get_spawned_count(), 3);

    dispatcher.stop(true);
    assert_eq!(dispatcher.children(), 0);
    assert!(dispatcher.metrics().get_evicted_count() >= 3);
}

#[test]
fn test_max_children_rejects_instead_of_queueing() {
    let _serial = FORK_LOCK.lock();
    let config = DispatcherConfig {
        min_children: 1,
        max_children: 1,
        ..pool_config()
    };
    let dispatcher = ProcessDispatcher::new(config).unwrap();
    dispatcher
        .register("/", slow_reply(Duration::from_millis(600)), false)
        .unwrap();
    let addr = start(&dispatcher);

    let first = std::thread::spawn(move || {
        send_request(&addr, "GET /a HTTP/1.1\r\nHost: localhost\r\n\r\n")
    });
    assert!(wait_until(Duration::from_secs(3), || dispatcher.busy_children() == 1));

    let rejected = send_request(&addr, "GET /b HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(rejected.is_empty(), "excess connection got {rejected:?}");
    assert_eq!(dispatcher.metrics().get_rejected_count(), 1);
    assert_eq!(dispatcher.children(), 1);

    let resp = first.join().unwrap();
    assert!(resp.starts_with("HTTP/1.1 200"), "in-flight client got {resp:?}");
    dispatcher.stop(true);
}

#[test]
fn test_pool_grows_on_demand_and_shrinks_back() {
    let _serial = FORK_LOCK.lock();
    let config = DispatcherConfig {
        min_children: 1,
        max_children: 4,
        ..pool_config()
    };
    let dispatcher = ProcessDispatcher::new(config).unwrap();
    dispatcher
        .register("/", slow_reply(Duration::from_millis(400)), false)
        .unwrap();
    let addr = start(&dispatcher);

    let clients: Vec<_> = (0..3)
        .map(|_| {
            std::thread::spawn(move || {
                send_request(&addr, "GET /x HTTP/1.1\r\nHost: localhost\r\n\r\n")
            })
        })
        .collect();
    for client in clients {
        assert!(client.join().unwrap().starts_with("HTTP/1.1 200"));
    }
    assert!(dispatcher.metrics().get_spawned_count() >= 3);

    // one idle child is evicted per quiet poll until the minimum is left
    assert!(wait_until(Duration::from_secs(5), || dispatcher.children() == 1));
    assert!(dispatcher.metrics().get_evicted_count() >= 2);
    dispatcher.stop(true);
}

#[test]
fn test_route_change_reaches_new_connections() {
    let _serial = FORK_LOCK.lock();
    let dispatcher = ProcessDispatcher::new(pool_config()).unwrap();
    dispatcher.register("/a", reply("first"), false).unwrap();
    let addr = start(&dispatcher);
    assert_eq!(get(&addr, "/a"), (200, "first".to_string()));

    dispatcher.unregister("/a").unwrap();
    let resp = send_request(&addr, "GET /a HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert_eq!(resp.as_bytes(), ERROR_404_RESPONSE);

    dispatcher.register("/a", reply("second"), false).unwrap();
    assert_eq!(get(&addr, "/a"), (200, "second".to_string()));
    dispatcher.stop(true);
}

#[test]
fn test_overdue_child_is_evicted() {
    let _serial = FORK_LOCK.lock();
    let config = DispatcherConfig {
        timeout_ms: 200,
        kill_grace_ms: 100,
        ..pool_config()
    };
    let dispatcher = ProcessDispatcher::new(config).unwrap();
    dispatcher
        .register("/", slow_reply(Duration::from_secs(5)), false)
        .unwrap();
    let addr = start(&dispatcher);

    let started = Instant::now();
    let mut client = TcpStream::connect(addr).unwrap();
    client
        .write_all(b"GET /hang HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let resp = read_to_close(&mut client);
    assert!(resp.is_empty(), "hung child answered {resp:?}");
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(wait_until(Duration::from_secs(2), || dispatcher
        .metrics()
        .get_reaped_count()
        == 1));

    // the pool recovers with a fresh child
    assert!(wait_until(Duration::from_secs(3), || dispatcher
        .metrics()
        .get_idle_children()
        >= 1));
    dispatcher.stop(true);
}

#[test]
fn test_reap_dead_workers_reports_busy_children() {
    let _serial = FORK_LOCK.lock();
    let dispatcher = ProcessDispatcher::new(pool_config()).unwrap();
    dispatcher
        .register("/", slow_reply(Duration::from_millis(500)), false)
        .unwrap();
    let addr = start(&dispatcher);

    let client = std::thread::spawn(move || {
        send_request(&addr, "GET /x HTTP/1.1\r\nHost: localhost\r\n\r\n")
    });
    assert!(wait_until(Duration::from_secs(2), || dispatcher.busy_children() == 1));
    assert_eq!(dispatcher.reap_dead_workers("test"), 1);
    assert_eq!(dispatcher.metrics().get_reaped_count(), 0);

    assert!(client.join().unwrap().starts_with("HTTP/1.1 200"));
    assert!(wait_until(Duration::from_secs(2), || dispatcher
        .reap_dead_workers("test")
        == 0));
    assert!(dispatcher.metrics().get_completed_count() >= 1);
    dispatcher.stop(true);
}

#[test]
fn test_handler_panic_is_contained_in_child() {
    let _serial = FORK_LOCK.lock();
    let dispatcher = ProcessDispatcher::new(pool_config()).unwrap();
    dispatcher
        .register(
            "/boom",
            Arc::new(FnHandler::new(|_req, _res| panic!("handler failure"))),
            false,
        )
        .unwrap();
    dispatcher.register("/ok", reply("fine"), false).unwrap();
    let addr = start(&dispatcher);

    assert_eq!(get(&addr, "/boom").0, 500);
    assert_eq!(get(&addr, "/ok"), (200, "fine".to_string()));
    dispatcher.stop(true);
}

#[test]
fn test_spawn_hooks_run_around_fork() {
    let _serial = FORK_LOCK.lock();
    let config = DispatcherConfig {
        min_children: 2,
        max_children: 2,
        ..pool_config()
    };
    let dispatcher = ProcessDispatcher::new(config).unwrap();
    let before = Arc::new(AtomicUsize::new(0));
    let parent_side = Arc::new(AtomicUsize::new(0));
    {
        let before = Arc::clone(&before);
        dispatcher.on_before_spawn(move || {
            before.fetch_add(1, Ordering::SeqCst);
        });
        let parent_side = Arc::clone(&parent_side);
        dispatcher.on_after_spawn(move |side| {
            // the child side runs in the child's copy of this counter
            if matches!(side, SpawnSide::Parent { .. }) {
                parent_side.fetch_add(1, Ordering::SeqCst);
            }
        });
    }
    dispatcher.register("/", reply("ok"), false).unwrap();
    start(&dispatcher);

    assert_eq!(before.load(Ordering::SeqCst), 2);
    assert_eq!(parent_side.load(Ordering::SeqCst), 2);
    dispatcher.stop(true);
}

#[test]
fn test_child_stuck_before_ready_is_replaced() {
    let _serial = FORK_LOCK.lock();
    let config = DispatcherConfig {
        min_children: 1,
        max_children: 2,
        spawn_timeout_ms: 300,
        ..pool_config()
    };
    let dispatcher = ProcessDispatcher::new(config).unwrap();
    let forks = Arc::new(AtomicUsize::new(0));
    {
        let counter = Arc::clone(&forks);
        dispatcher.on_before_spawn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let seen = Arc::clone(&forks);
        dispatcher.on_after_spawn(move |side| {
            // the first child hangs the way a fork-inherited lock would
            if side == SpawnSide::Child && seen.load(Ordering::SeqCst) == 1 {
                std::thread::sleep(Duration::from_secs(60));
            }
        });
    }
    dispatcher.register("/", reply("ok"), false).unwrap();
    let addr = start(&dispatcher);

    assert!(dispatcher.metrics().get_evicted_count() >= 1);
    assert!(forks.load(Ordering::SeqCst) >= 2);
    assert_eq!(get(&addr, "/").0, 200);
    dispatcher.stop(true);
}

#[test]
fn test_stop_closes_listener_and_drains_busy_child() {
    let _serial = FORK_LOCK.lock();
    let dispatcher = ProcessDispatcher::new(pool_config()).unwrap();
    dispatcher
        .register("/", slow_reply(Duration::from_millis(500)), false)
        .unwrap();
    let addr = start(&dispatcher);

    let in_flight = std::thread::spawn(move || {
        send_request(&addr, "GET /work HTTP/1.1\r\nHost: localhost\r\n\r\n")
    });
    assert!(wait_until(Duration::from_secs(2), || dispatcher.busy_children() == 1));

    dispatcher.stop(false);
    assert!(wait_until(Duration::from_secs(1), || TcpStream::connect(addr).is_err()));
    assert!(dispatcher.is_running(), "drain should still be waiting on the child");

    let resp = in_flight.join().unwrap();
    assert!(resp.starts_with("HTTP/1.1 200"), "drained client got {resp:?}");

    dispatcher.stop(true);
    assert!(!dispatcher.is_running());
    assert_eq!(dispatcher.children(), 0);
}

#[test]
fn test_run_after_stop_is_rejected() {
    let _serial = FORK_LOCK.lock();
    let dispatcher = ProcessDispatcher::new(pool_config()).unwrap();
    start(&dispatcher);
    assert!(matches!(dispatcher.run(), Err(DispatchError::AlreadyRunning)));
    dispatcher.stop(true);
    assert!(matches!(dispatcher.run(), Err(DispatchError::Stopped)));
}
