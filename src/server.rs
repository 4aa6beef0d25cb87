//! Accept loop.
//!
//! Accepts one connection at a time and serves it to completion before
//! accepting the next. Accept faults are retried; only a programming fault
//! on the listening socket, or one promoted from a connection, ends the loop.

use crate::config::Config;
use crate::connection::{self, ConnState, Connection, HandlerConfig};
use crate::error::ServerError;
use crate::fault::Fault;
use crate::listener;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Source of client connections.
pub trait Acceptor {
    type Stream: Read + Write;

    fn accept(&mut self) -> io::Result<(Self::Stream, SocketAddr)>;
}

/// Blocking TCP acceptor that applies the idle timeout to each client.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
    idle_timeout: Option<Duration>,
}

impl TcpAcceptor {
    pub fn new(listener: TcpListener, idle_timeout: Option<Duration>) -> Self {
        Self {
            listener,
            idle_timeout,
        }
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Acceptor for TcpAcceptor {
    type Stream = TcpStream;

    fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept()?;
        if self.idle_timeout.is_some() {
            if let Err(e) = stream.set_read_timeout(self.idle_timeout) {
                warn!(%peer, error = %e, "Failed to set idle timeout");
            }
        }
        Ok((stream, peer))
    }
}

/// Server instance
pub struct Server {
    acceptor: TcpAcceptor,
    handler: HandlerConfig,
    accept_backoff: Duration,
}

impl Server {
    /// Create the listening socket. Any failure here is fatal.
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        let listener = listener::open(config)?;

        Ok(Server {
            acceptor: TcpAcceptor::new(listener, config.idle_timeout),
            handler: HandlerConfig::from_config(config),
            accept_backoff: config.accept_backoff,
        })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Serve connections until a fatal fault.
    ///
    /// The listening socket is closed when this returns.
    pub fn run(mut self) -> Result<(), ServerError> {
        let result = serve(&mut self.acceptor, &self.handler, self.accept_backoff);
        drop(self);
        info!("Listening socket closed");
        result
    }
}

/// Accept and serve connections one at a time, forever.
pub fn serve<A: Acceptor>(
    acceptor: &mut A,
    handler: &HandlerConfig,
    accept_backoff: Duration,
) -> Result<(), ServerError> {
    loop {
        let Some((stream, peer)) = accept_next(acceptor, accept_backoff)? else {
            continue;
        };

        info!(%peer, "Accepted connection");
        let mut conn = Connection::new(stream, peer);
        let reason = connection::handle(&mut conn, handler)?;
        debug_assert_eq!(conn.state(), ConnState::Closing);
        debug!(peer = %conn.peer(), ?reason, "Ready for next connection");
        drop(conn);
    }
}

/// Make one accept attempt.
///
/// Returns `Ok(None)` when the fault was recovered and the caller should
/// try again.
pub fn accept_next<A: Acceptor>(
    acceptor: &mut A,
    backoff: Duration,
) -> Result<Option<(A::Stream, SocketAddr)>, ServerError> {
    let err = match acceptor.accept() {
        Ok(accepted) => return Ok(Some(accepted)),
        Err(e) => e,
    };

    match Fault::classify(&err) {
        Fault::Transient => {
            trace!(error = %err, "accept interrupted, retrying");
        }
        Fault::Resource => {
            warn!(
                error = %err,
                ?backoff,
                "accept out of resources, backing off"
            );
            thread::sleep(backoff);
        }
        Fault::Programming => {
            error!(error = %err, "accept failed on an unusable listening socket");
            return Err(ServerError::Accept(err));
        }
        fault => {
            warn!(%fault, error = %err, "accept failed, retrying");
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::net::Shutdown;
    use std::time::Instant;

    /// Acceptor replaying scripted results; streams are empty so every
    /// connection hits EOF immediately.
    struct ScriptedAcceptor {
        results: VecDeque<io::Result<()>>,
        calls: usize,
    }

    impl ScriptedAcceptor {
        fn new(results: Vec<io::Result<()>>) -> Self {
            Self {
                results: results.into(),
                calls: 0,
            }
        }
    }

    impl Acceptor for ScriptedAcceptor {
        type Stream = Cursor<Vec<u8>>;

        fn accept(&mut self) -> io::Result<(Self::Stream, SocketAddr)> {
            self.calls += 1;
            match self.results.pop_front() {
                Some(Ok(())) => {
                    let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();
                    Ok((Cursor::new(Vec::new()), peer))
                }
                Some(Err(e)) => Err(e),
                None => Err(io::Error::from_raw_os_error(libc::EBADF)),
            }
        }
    }

    fn os(code: i32) -> io::Result<()> {
        Err(io::Error::from_raw_os_error(code))
    }

    fn loopback_server() -> (Server, SocketAddr) {
        let config = Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            accept_backoff: Duration::from_millis(10),
            ..Config::default()
        };
        let server = Server::bind(&config).unwrap();
        let addr = server.local_addr().unwrap();
        (server, addr)
    }

    fn spawn_server() -> SocketAddr {
        let (server, addr) = loopback_server();
        thread::spawn(move || server.run());
        addr
    }

    fn read_reply(stream: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_transient_faults_retry_immediately() {
        let mut acceptor =
            ScriptedAcceptor::new(vec![os(libc::EINTR), os(libc::ECONNABORTED), Ok(())]);

        assert!(accept_next(&mut acceptor, Duration::from_secs(60)).unwrap().is_none());
        assert!(accept_next(&mut acceptor, Duration::from_secs(60)).unwrap().is_none());
        assert!(accept_next(&mut acceptor, Duration::from_secs(60)).unwrap().is_some());
    }

    #[test]
    fn test_resource_exhaustion_backs_off_and_keeps_going() {
        let mut results: Vec<io::Result<()>> = (0..5).map(|_| os(libc::EMFILE)).collect();
        results.push(os(libc::ENOBUFS));
        results.push(Ok(()));
        let mut acceptor = ScriptedAcceptor::new(results);
        let handler = HandlerConfig::default();

        let start = Instant::now();
        // runs until the script is exhausted and the acceptor reports EBADF
        let err = serve(&mut acceptor, &handler, Duration::from_millis(10)).unwrap_err();

        assert!(matches!(err, ServerError::Accept(_)));
        assert_eq!(acceptor.calls, 8);
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_unknown_fault_is_retried() {
        let mut acceptor = ScriptedAcceptor::new(vec![os(libc::EIO), os(libc::EPERM)]);

        assert!(accept_next(&mut acceptor, Duration::ZERO).unwrap().is_none());
        assert!(accept_next(&mut acceptor, Duration::ZERO).unwrap().is_none());
    }

    #[test]
    fn test_programming_fault_is_fatal() {
        for code in [libc::EBADF, libc::ENOTSOCK, libc::EINVAL] {
            let mut acceptor = ScriptedAcceptor::new(vec![os(code)]);
            match accept_next(&mut acceptor, Duration::ZERO) {
                Err(ServerError::Accept(e)) => assert_eq!(e.raw_os_error(), Some(code)),
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[test]
    fn test_echo_and_disconnect() {
        let addr = spawn_server();

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"ping\n").unwrap();
        assert_eq!(read_reply(&mut client, 14), b"ping Received\n");

        client.shutdown(Shutdown::Write).unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());

        // server is still accepting
        let mut next = TcpStream::connect(addr).unwrap();
        next.write_all(b"again").unwrap();
        assert_eq!(read_reply(&mut next, 15), b"again Received\n");
    }

    #[test]
    fn test_connections_are_served_sequentially() {
        let addr = spawn_server();

        let mut first = TcpStream::connect(addr).unwrap();
        first.write_all(b"a\n").unwrap();
        assert_eq!(read_reply(&mut first, 11), b"a Received\n");

        let mut second = TcpStream::connect(addr).unwrap();
        second.write_all(b"b\n").unwrap();
        second
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();

        let mut buf = [0u8; 32];
        let err = second.read(&mut buf).unwrap_err();
        assert!(matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ));

        drop(first);
        second.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(read_reply(&mut second, 11), b"b Received\n");
    }

    #[test]
    fn test_idle_timeout_closes_connection() {
        let config = Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            idle_timeout: Some(Duration::from_millis(100)),
            ..Config::default()
        };
        let server = Server::bind(&config).unwrap();
        let addr = server.local_addr().unwrap();
        thread::spawn(move || server.run());

        let mut idle = TcpStream::connect(addr).unwrap();
        idle.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut rest = Vec::new();
        idle.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }
}
