//! Per-connection read/transform/send loop.
//!
//! A [`Connection`] owns one accepted client stream. [`handle`] reads a
//! chunk, turns it into a reply, writes the reply back, and repeats until
//! the peer closes or a fault ends the connection. Only a programming fault
//! on send escapes as a [`ServerError`]; everything else is local to the
//! connection.

use crate::config::{Config, SendMode};
use crate::error::ServerError;
use crate::fault::Fault;
use crate::transform::Transform;
use bytes::BytesMut;
use std::io::{Read, Write};
use std::net::SocketAddr;
use tracing::{debug, error, info, warn};

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the next chunk.
    Reading,
    /// Writing a reply.
    Writing {
        /// Bytes already written.
        written: usize,
        /// Total bytes to write.
        total: usize,
    },
    /// Connection is being closed.
    Closing,
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed its side cleanly.
    PeerClosed,
    /// `recv` failed.
    RecvFailed(Fault),
    /// `send` reported a broken, resource-starved, or unrecognised fault.
    SendFailed(Fault),
    /// `send` kept failing transiently past the retry limit.
    SendStalled,
}

/// Settings shared by every connection.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub transform: Transform,
    pub chunk_size: usize,
    pub send_mode: SendMode,
    pub send_retry_limit: u32,
}

impl HandlerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            transform: Transform::new(&config.suffix),
            chunk_size: config.chunk_size,
            send_mode: config.send_mode,
            send_retry_limit: config.send_retry_limit,
        }
    }
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    peer: SocketAddr,
    state: ConnState,
}

impl<S> Connection<S> {
    /// Wrap a freshly accepted stream in reading state.
    pub fn new(stream: S, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Reading,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Transition to writing state.
    fn start_writing(&mut self, total: usize) {
        self.state = ConnState::Writing { written: 0, total };
    }

    fn record_written(&mut self, n: usize) {
        if let ConnState::Writing { written, total } = self.state {
            self.state = ConnState::Writing {
                written: written + n,
                total,
            };
        }
    }

    /// Transition back to reading state.
    fn start_reading(&mut self) {
        self.state = ConnState::Reading;
    }

    /// Mark connection for closing.
    fn close(&mut self) {
        self.state = ConnState::Closing;
    }

    /// Release the underlying stream.
    #[cfg(test)]
    pub fn into_inner(self) -> S {
        self.stream
    }
}

/// Outcome of writing one reply.
enum SendOutcome {
    /// Reply handled; keep reading. In single-shot mode part of it may have
    /// been dropped.
    Continue,
    /// Connection must be closed.
    Close(CloseReason),
}

/// Serve `conn` until it closes.
///
/// Returns the close reason, or a [`ServerError`] when a send reports a
/// programming fault. The stream stays open until the caller drops `conn`.
pub fn handle<S: Read + Write>(
    conn: &mut Connection<S>,
    config: &HandlerConfig,
) -> Result<CloseReason, ServerError> {
    let mut chunk = BytesMut::zeroed(config.chunk_size);

    let reason = loop {
        let n = match conn.stream.read(&mut chunk[..]) {
            Ok(0) => {
                info!(peer = %conn.peer, "client disconnected");
                break CloseReason::PeerClosed;
            }
            Ok(n) => n,
            Err(e) => {
                let fault = Fault::classify(&e);
                warn!(peer = %conn.peer, %fault, error = %e, "recv failed, closing connection");
                break CloseReason::RecvFailed(fault);
            }
        };

        let reply = config.transform.apply(&chunk[..n]);
        info!("String: {}", display_text(&reply));

        match send_reply(conn, &reply, config)? {
            SendOutcome::Continue => conn.start_reading(),
            SendOutcome::Close(reason) => break reason,
        }
    };

    conn.close();
    debug!(peer = %conn.peer, ?reason, "Connection closed");
    Ok(reason)
}

fn send_reply<S: Write>(
    conn: &mut Connection<S>,
    reply: &[u8],
    config: &HandlerConfig,
) -> Result<SendOutcome, ServerError> {
    let total = reply.len();
    conn.start_writing(total);

    let mut written = 0;
    let mut transient_failures = 0;

    while written < total {
        match conn.stream.write(&reply[written..]) {
            Ok(0) => {
                warn!(peer = %conn.peer, "send wrote nothing, closing connection");
                return Ok(SendOutcome::Close(CloseReason::SendFailed(
                    Fault::ConnectionBroken,
                )));
            }
            Ok(n) => {
                written += n;
                conn.record_written(n);
                transient_failures = 0;

                if written < total {
                    warn!(peer = %conn.peer, sent = written, total, "Partial send");
                    if config.send_mode == SendMode::SingleShot {
                        return Ok(SendOutcome::Continue);
                    }
                }
            }
            Err(e) => match Fault::classify(&e) {
                Fault::Transient => {
                    if config.send_mode == SendMode::SingleShot {
                        warn!(peer = %conn.peer, error = %e, "send interrupted, reply dropped");
                        return Ok(SendOutcome::Continue);
                    }

                    transient_failures += 1;
                    if transient_failures > config.send_retry_limit {
                        warn!(
                            peer = %conn.peer,
                            retries = config.send_retry_limit,
                            error = %e,
                            "send keeps failing, closing connection"
                        );
                        return Ok(SendOutcome::Close(CloseReason::SendStalled));
                    }
                    warn!(peer = %conn.peer, error = %e, "send interrupted, retrying");
                }
                Fault::Programming => {
                    error!(
                        peer = %conn.peer,
                        error = %e,
                        "send hit a bad descriptor, shutting down"
                    );
                    conn.close();
                    return Err(ServerError::Send {
                        peer: conn.peer,
                        source: e,
                    });
                }
                Fault::ConnectionBroken => {
                    warn!(peer = %conn.peer, error = %e, "Connection broken by peer");
                    return Ok(SendOutcome::Close(CloseReason::SendFailed(
                        Fault::ConnectionBroken,
                    )));
                }
                Fault::Resource => {
                    warn!(peer = %conn.peer, error = %e, "send out of resources, closing connection");
                    return Ok(SendOutcome::Close(CloseReason::SendFailed(Fault::Resource)));
                }
                fault => {
                    warn!(peer = %conn.peer, %fault, error = %e, "send failed, closing connection");
                    return Ok(SendOutcome::Close(CloseReason::SendFailed(fault)));
                }
            },
        }
    }

    Ok(SendOutcome::Continue)
}

/// Reply text for the traffic log, without the trailing newline.
fn display_text(reply: &[u8]) -> std::borrow::Cow<'_, str> {
    let text = reply.strip_suffix(b"\n").unwrap_or(reply);
    String::from_utf8_lossy(text)
}
