//! Fatal server errors.
//!
//! Each variant ends the process. Recoverable faults never become a
//! `ServerError`; they are logged and handled where they occur.

use crate::fault::Fault;
use std::fmt;
use std::io;
use std::net::SocketAddr;

/// A condition that terminates the server.
#[derive(Debug)]
pub enum ServerError {
    /// Socket creation failed with a non-retryable fault, or every attempt
    /// failed with resource exhaustion.
    SocketCreate {
        attempts: u32,
        source: io::Error,
    },
    /// Binding the listening socket failed.
    Bind {
        addr: SocketAddr,
        source: io::Error,
    },
    /// Putting the socket into listening state failed.
    Listen {
        addr: SocketAddr,
        source: io::Error,
    },
    /// `accept` reported a programming fault on the listening socket.
    Accept(io::Error),
    /// `send` reported a programming fault on a client connection.
    Send {
        peer: SocketAddr,
        source: io::Error,
    },
}

impl ServerError {
    /// The underlying I/O error.
    pub fn io_error(&self) -> &io::Error {
        match self {
            ServerError::SocketCreate { source, .. }
            | ServerError::Bind { source, .. }
            | ServerError::Listen { source, .. }
            | ServerError::Send { source, .. } => source,
            ServerError::Accept(source) => source,
        }
    }

    /// Fault category of the underlying error.
    pub fn fault(&self) -> Fault {
        Fault::classify(self.io_error())
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::SocketCreate { attempts, source } => {
                write!(f, "Failed to create socket after {attempts} attempt(s): {source}")
            }
            ServerError::Bind { addr, source } => {
                write!(f, "Failed to bind {addr}: {source}")
            }
            ServerError::Listen { addr, source } => {
                write!(f, "Failed to listen on {addr}: {source}")
            }
            ServerError::Accept(source) => {
                write!(f, "Listening socket is unusable: {source}")
            }
            ServerError::Send { peer, source } => {
                write!(f, "Send to {peer} hit a programming fault: {source}")
            }
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.io_error())
    }
}
