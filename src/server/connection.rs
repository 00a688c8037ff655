use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;

/// A client socket the request pipeline can serve
///
/// Implemented for the blocking std stream used by forked children and the
/// coroutine stream used by the threaded dispatcher.
pub trait Connection: Read + Write + Send {
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    fn shutdown(&self, how: Shutdown) -> io::Result<()>;

    /// Bound each blocking read; `None` clears the bound
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl Connection for std::net::TcpStream {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        std::net::TcpStream::peer_addr(self)
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        std::net::TcpStream::shutdown(self, how)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::net::TcpStream::set_read_timeout(self, timeout)
    }
}

impl Connection for may::net::TcpStream {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        may::net::TcpStream::peer_addr(self)
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        may::net::TcpStream::shutdown(self, how)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        may::net::TcpStream::set_read_timeout(self, timeout)
    }
}
