//! Listening socket setup.
//!
//! Creates the socket (retrying resource exhaustion with exponential
//! backoff), enables address reuse, then binds and listens. Every failure
//! past creation is fatal: the server has one configured endpoint and no
//! fallback.

use crate::config::Config;
use crate::error::ServerError;
use crate::fault::Fault;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Retry policy for socket creation.
#[derive(Debug, Clone, Copy)]
pub struct CreateRetry {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay after the first failure; doubled after each further failure.
    pub base_delay: Duration,
}

impl CreateRetry {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

/// Build a bound, listening socket from the server configuration.
pub fn open(config: &Config) -> Result<TcpListener, ServerError> {
    let retry = CreateRetry {
        attempts: config.socket_attempts,
        base_delay: config.socket_backoff,
    };

    let socket = create_socket(config.listen, retry)?;
    configure(&socket);
    bind_and_listen(socket, config.listen, config.backlog)
}

/// Create a TCP socket for `addr`, retrying resource exhaustion.
pub fn create_socket(addr: SocketAddr, retry: CreateRetry) -> Result<Socket, ServerError> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    create_with(retry, || {
        Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
    })
}

/// Run `make` until it succeeds, a non-resource fault occurs, or the attempts
/// run out.
pub fn create_with<T, F>(retry: CreateRetry, mut make: F) -> Result<T, ServerError>
where
    F: FnMut() -> io::Result<T>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match make() {
            Ok(socket) => {
                debug!(attempt, "Socket created");
                return Ok(socket);
            }
            Err(e) => e,
        };

        match Fault::classify(&err) {
            Fault::Resource if attempt < retry.attempts => {
                let delay = retry.delay(attempt);
                warn!(
                    attempt,
                    max_attempts = retry.attempts,
                    ?delay,
                    error = %err,
                    "Socket creation hit resource limits, backing off"
                );
                thread::sleep(delay);
            }
            Fault::Resource => {
                error!(attempts = attempt, error = %err, "Socket creation failed, out of retries");
                return Err(ServerError::SocketCreate {
                    attempts: attempt,
                    source: err,
                });
            }
            Fault::Config => {
                error!(error = %err, "Socket creation not permitted or unsupported");
                return Err(ServerError::SocketCreate {
                    attempts: attempt,
                    source: err,
                });
            }
            fault => {
                error!(%fault, error = %err, "Socket creation failed");
                return Err(ServerError::SocketCreate {
                    attempts: attempt,
                    source: err,
                });
            }
        }
    }
}

/// Enable address reuse. Failure is logged and ignored.
pub fn configure(socket: &Socket) {
    if let Err(e) = socket.set_reuse_address(true) {
        warn!(error = %e, "Failed to enable SO_REUSEADDR, continuing without it");
    }
}

/// Bind and listen. On failure the socket is closed before returning.
pub fn bind_and_listen(
    socket: Socket,
    addr: SocketAddr,
    backlog: i32,
) -> Result<TcpListener, ServerError> {
    if let Err(source) = socket.bind(&addr.into()) {
        error!(%addr, error = %source, "bind: {}", setup_cause(&source));
        close(socket);
        return Err(ServerError::Bind { addr, source });
    }

    if let Err(source) = socket.listen(backlog) {
        error!(%addr, error = %source, "listen: {}", setup_cause(&source));
        close(socket);
        return Err(ServerError::Listen { addr, source });
    }

    info!(address = %addr, backlog, "Server listening");
    Ok(socket.into())
}

fn close(socket: Socket) {
    drop(socket);
    debug!("Listening socket closed");
}

/// Human-readable cause of a bind or listen failure.
pub fn setup_cause(err: &io::Error) -> &'static str {
    match err.raw_os_error() {
        Some(libc::EADDRINUSE) => "address already in use",
        Some(libc::EADDRNOTAVAIL) => "address not available on this host",
        Some(libc::EACCES) | Some(libc::EPERM) => "permission denied",
        Some(libc::EBADF) | Some(libc::ENOTSOCK) | Some(libc::EINVAL) => "invalid socket",
        Some(libc::ENOMEM) | Some(libc::ENOBUFS) => "out of memory",
        _ => "unexpected error",
    }
}
