#![allow(dead_code)]

pub mod test_server {
    use forkserve::config::DispatcherConfig;
    use std::sync::Once;
    use std::time::{Duration, Instant};

    /// Ensures May coroutines are configured only once
    static MAY_INIT: Once = Once::new();

    pub fn setup_may_runtime() {
        MAY_INIT.call_once(|| {
            may::config().set_stack_size(0x8000).set_workers(4);
        });
    }

    /// Loopback on an ephemeral port, no kernel accept tuning
    ///
    /// A 5s timeout keeps drain sweeps at 500ms.
    pub fn test_config() -> DispatcherConfig {
        DispatcherConfig {
            socket_tuning: false,
            timeout_ms: 5_000,
            ..DispatcherConfig::new("127.0.0.1", 0)
        }
    }

    /// Poll `check` every 10ms until it holds or `timeout` passes
    pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        check()
    }
}

pub mod http {
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpStream};
    use std::time::Duration;

    /// Write `req`, then read until the server closes the connection
    ///
    /// Resets and timeouts end the read with whatever arrived so far.
    pub fn send_request(addr: &SocketAddr, req: &str) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        let _ = stream.write_all(req.as_bytes());
        read_to_close(&mut stream)
    }

    pub fn read_to_close(stream: &mut TcpStream) -> String {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = Vec::new();
        let mut tmp = [0u8; 4096];
        loop {
            match stream.read(&mut tmp) {
                Ok(0) => break,
                Ok(n) => buf.extend_from_slice(&tmp[..n]),
                Err(_) => break,
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    pub fn get(addr: &SocketAddr, path: &str) -> (u16, String) {
        let resp = send_request(
            addr,
            &format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n"),
        );
        let (status, _headers, body) = parse_response_parts(&resp);
        (status, body)
    }

    pub fn parse_response_parts(resp: &str) -> (u16, String, String) {
        let (head, body) = resp.split_once("\r\n\r\n").unwrap_or((resp, ""));
        let status = head
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|code| code.parse().ok())
            .unwrap_or(0);
        (status, head.to_string(), body.to_string())
    }
}
