//! Platform socket tuning
//!
//! Best effort: a platform without the option, or a kernel that refuses it,
//! leaves the socket untouched. Failures are logged at trace level only.

use std::os::fd::RawFd;
use tracing::trace;

#[allow(unsafe_code)]
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn set_int_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> bool {
    // SAFETY: `value` outlives the call and the length matches its type.
    // An invalid fd makes setsockopt fail with EBADF, nothing worse.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            (&value as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        trace!(
            fd,
            level,
            name,
            error = %std::io::Error::last_os_error(),
            "Socket option not applied"
        );
    }
    rc == 0
}

/// Hold connections in the kernel until the client has sent data
#[cfg(target_os = "linux")]
pub fn tune_listener(fd: RawFd) {
    set_int_opt(fd, libc::IPPROTO_TCP, libc::TCP_DEFER_ACCEPT, 1);
}

/// Hand connections to accept only once a full request head has arrived
#[cfg(target_os = "freebsd")]
pub fn tune_listener(fd: RawFd) {
    const SO_ACCEPTFILTER: libc::c_int = 0x1000;

    #[repr(C)]
    struct AcceptFilterArg {
        af_name: [libc::c_char; 16],
        af_arg: [libc::c_char; 256 - 16],
    }

    let mut arg = AcceptFilterArg {
        af_name: [0; 16],
        af_arg: [0; 256 - 16],
    };
    for (dst, src) in arg.af_name.iter_mut().zip(b"httpready".iter()) {
        *dst = *src as libc::c_char;
    }

    #[allow(unsafe_code)]
    // SAFETY: `arg` is a plain repr(C) struct that outlives the call.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            SO_ACCEPTFILTER,
            (&arg as *const AcceptFilterArg).cast(),
            std::mem::size_of::<AcceptFilterArg>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        trace!(fd, error = %std::io::Error::last_os_error(), "Accept filter not installed");
    }
}

#[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
pub fn tune_listener(_fd: RawFd) {}

/// Coalesce response writes until the socket is shut down
#[cfg(target_os = "linux")]
pub fn tune_client(fd: RawFd) {
    set_int_opt(fd, libc::IPPROTO_TCP, libc::TCP_CORK, 1);
}

#[cfg(not(target_os = "linux"))]
pub fn tune_client(_fd: RawFd) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_tuning_is_harmless_on_real_sockets() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        tune_listener(listener.as_raw_fd());
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        tune_client(client.as_raw_fd());
    }

    #[test]
    fn test_bad_fd_is_ignored() {
        tune_listener(-1);
        tune_client(-1);
    }
}
