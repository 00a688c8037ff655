//! Control channel between the process dispatcher and its children
//!
//! Children report their state with one text line at a time:
//!
//! ```text
//! READY <pid>\n    idle, send the next client
//! CLOSED <pid>\n   exiting on its own
//! ```
//!
//! The parent answers a `READY` by passing a client socket descriptor as
//! `SCM_RIGHTS` ancillary data on a one-byte message. No client bytes ever
//! cross the channel.

use std::fmt;
use std::io::{self, Read, Write};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

/// Longest status line accepted before the buffer is discarded
const MAX_LINE: usize = 128;

/// One status line from a child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusMessage {
    Ready(i32),
    Closed(i32),
}

impl StatusMessage {
    /// Parse a line without its trailing newline
    pub fn parse(line: &str) -> Option<Self> {
        let (verb, pid) = line.trim().split_once(' ')?;
        let pid = pid.trim().parse().ok()?;
        match verb {
            "READY" => Some(StatusMessage::Ready(pid)),
            "CLOSED" => Some(StatusMessage::Closed(pid)),
            _ => None,
        }
    }

    pub fn pid(&self) -> i32 {
        match self {
            StatusMessage::Ready(pid) | StatusMessage::Closed(pid) => *pid,
        }
    }

    /// Write the message as one line
    pub fn write_to(&self, mut out: impl Write) -> io::Result<()> {
        out.write_all(format!("{self}\n").as_bytes())
    }
}

impl fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusMessage::Ready(pid) => write!(f, "READY {pid}"),
            StatusMessage::Closed(pid) => write!(f, "CLOSED {pid}"),
        }
    }
}

/// Splits a byte stream into status messages
///
/// Partial lines are kept until the rest arrives; unparsable lines are
/// returned as errors so the caller can log them.
#[derive(Debug, Default)]
pub struct StatusDecoder {
    buf: Vec<u8>,
}

impl StatusDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) -> Vec<Result<StatusMessage, String>> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            if text.trim().is_empty() {
                continue;
            }
            out.push(StatusMessage::parse(&text).ok_or(text));
        }
        if self.buf.len() > MAX_LINE {
            out.push(Err(String::from_utf8_lossy(&self.buf).into_owned()));
            self.buf.clear();
        }
        out
    }
}

/// What a non-blocking drain of a control socket produced
#[derive(Debug, Default)]
pub struct Drained {
    pub messages: Vec<StatusMessage>,
    /// Lines that were not valid status messages
    pub garbage: Vec<String>,
    /// The peer closed its end
    pub eof: bool,
}

/// Read everything currently buffered on a non-blocking control socket
pub fn drain(mut sock: &UnixStream, decoder: &mut StatusDecoder) -> io::Result<Drained> {
    let mut drained = Drained::default();
    let mut buf = [0u8; 256];
    loop {
        match sock.read(&mut buf) {
            Ok(0) => {
                drained.eof = true;
                break;
            }
            Ok(n) => {
                for item in decoder.feed(&buf[..n]) {
                    match item {
                        Ok(msg) => drained.messages.push(msg),
                        Err(line) => drained.garbage.push(line),
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(drained)
}

/// Cmsg buffer aligned for `cmsghdr`
fn cmsg_buffer() -> (Vec<u64>, usize) {
    #[allow(unsafe_code)]
    // SAFETY: CMSG_SPACE is a pure size computation.
    let space = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize;
    (vec![0u64; space.div_ceil(mem::size_of::<u64>())], space)
}

/// Pass `fd` to the peer of `sock`
///
/// The descriptor stays open on this side; the receiver gets its own copy.
#[allow(unsafe_code)]
pub fn send_fd(sock: &UnixStream, fd: RawFd) -> io::Result<()> {
    let payload = [b'F'];
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    let (mut control, space) = cmsg_buffer();

    // SAFETY: msghdr is plain data; every pointer stored in it refers to a
    // local that outlives the sendmsg call, and the control buffer is sized
    // with CMSG_SPACE for exactly one descriptor.
    unsafe {
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = space as _;

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(io::Error::other("control buffer too small"));
        }
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), fd);

        loop {
            if libc::sendmsg(sock.as_raw_fd(), &msg, 0) >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

/// Receive one descriptor sent with [`send_fd`]
///
/// Returns `Ok(None)` when the peer closed the channel.
#[allow(unsafe_code)]
pub fn recv_fd(sock: &UnixStream) -> io::Result<Option<OwnedFd>> {
    let mut payload = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast(),
        iov_len: payload.len(),
    };
    let (mut control, space) = cmsg_buffer();

    // SAFETY: as in send_fd; the kernel writes at most `space` bytes of
    // ancillary data and we only read a descriptor out of a SCM_RIGHTS
    // header it produced.
    unsafe {
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = space as _;

        let received = loop {
            let n = libc::recvmsg(sock.as_raw_fd(), &mut msg, 0);
            if n >= 0 {
                break n;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };
        if received == 0 {
            return Ok(None);
        }

        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let fd = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>());
                return Ok(Some(OwnedFd::from_raw_fd(fd)));
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "control message carried no descriptor",
    ))
}

/// Wait until `fd` is readable or `timeout` passes
///
/// Returns `Ok(true)` when readable (or hung up), `Ok(false)` on timeout.
#[allow(unsafe_code)]
pub fn wait_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    // SAFETY: one valid pollfd, count 1.
    let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(rc > 0)
}
