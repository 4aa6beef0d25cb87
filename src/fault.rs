//! Fault classification for socket operations.
//!
//! Every socket call site turns an `io::Error` into a [`Fault`] and decides
//! what to do from the category alone. The errno mapping lives here so the
//! stages never look at raw error codes.

use std::fmt;
use std::io;

/// Category of a socket fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Expected to succeed on immediate retry (EINTR, EAGAIN, ECONNABORTED).
    Transient,
    /// System-wide limits hit: descriptors, memory, kernel buffers.
    Resource,
    /// Permission or address configuration problem.
    Config,
    /// Peer went away: reset, broken pipe, not connected.
    ConnectionBroken,
    /// Bad descriptor or invalid arguments. Internal state is corrupt.
    Programming,
    /// Anything not recognised above.
    Unknown,
}

impl Fault {
    /// Classify an I/O error.
    ///
    /// OS errors are classified by errno. Errors without an errno (for
    /// example ones built from an `ErrorKind`) fall back to their kind.
    pub fn classify(err: &io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => Self::from_errno(code),
            None => Self::from_kind(err.kind()),
        }
    }

    fn from_errno(code: i32) -> Self {
        match code {
            libc::EINTR | libc::EAGAIN | libc::ECONNABORTED => Fault::Transient,
            libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM => Fault::Resource,
            libc::EACCES
            | libc::EPERM
            | libc::EAFNOSUPPORT
            | libc::EPROTONOSUPPORT
            | libc::EADDRINUSE
            | libc::EADDRNOTAVAIL => Fault::Config,
            libc::ECONNRESET | libc::EPIPE | libc::ENOTCONN => Fault::ConnectionBroken,
            libc::EBADF | libc::ENOTSOCK | libc::EINVAL | libc::EFAULT | libc::EOPNOTSUPP => {
                Fault::Programming
            }
            // EWOULDBLOCK aliases EAGAIN on Linux but not everywhere
            _ if io::Error::from_raw_os_error(code).kind() == io::ErrorKind::WouldBlock => {
                Fault::Transient
            }
            _ => Fault::Unknown,
        }
    }

    fn from_kind(kind: io::ErrorKind) -> Self {
        use io::ErrorKind::*;

        match kind {
            Interrupted | WouldBlock | ConnectionAborted => Fault::Transient,
            OutOfMemory => Fault::Resource,
            PermissionDenied | AddrInUse | AddrNotAvailable | Unsupported => Fault::Config,
            ConnectionReset | BrokenPipe | NotConnected | WriteZero => Fault::ConnectionBroken,
            InvalidInput => Fault::Programming,
            _ => Fault::Unknown,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Fault::Transient => "transient",
            Fault::Resource => "resource exhaustion",
            Fault::Config => "configuration",
            Fault::ConnectionBroken => "connection broken",
            Fault::Programming => "programming error",
            Fault::Unknown => "unknown",
        };
        f.write_str(name)
    }
}
