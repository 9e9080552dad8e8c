//! Non-blocking socket layer.
//!
//! Thin wrappers over mio sockets that turn `WouldBlock` into a value
//! instead of an error, so callers can match on readiness outcomes.
//! Nothing in here ever blocks the calling thread.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use mio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::engine::EngineError;

/// Address used to discover the outward-facing interface. No packet is sent.
const ROUTE_TARGET: (Ipv4Addr, u16) = (Ipv4Addr::new(8, 8, 8, 8), 80);

/// Result of a single non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were placed at the start of the buffer.
    Data(usize),
    /// Nothing available right now.
    WouldBlock,
    /// The peer closed its sending side.
    Closed,
}

/// Result of a single non-blocking write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// This many bytes were accepted by the OS; the caller keeps the rest.
    Written(usize),
    /// The send buffer is full.
    WouldBlock,
}

/// Binds a non-blocking listener on `addr`.
///
/// # Errors
///
/// `EngineError::Bind` when the address is in use or not local. Callers
/// treat this as "client-only mode", not as a fatal error.
pub fn listen(addr: SocketAddr) -> Result<TcpListener, EngineError> {
    TcpListener::bind(addr).map_err(|e| EngineError::Bind {
        addr,
        reason: e.to_string(),
    })
}

/// Accepts one pending connection.
///
/// Returns `Ok(None)` when the accept queue is empty.
pub fn accept_pending(listener: &TcpListener) -> io::Result<Option<(TcpStream, SocketAddr)>> {
    loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %addr, error = %e, "Failed to set TCP_NODELAY");
                }
                return Ok(Some((stream, addr)));
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Starts a non-blocking connect to `addr`.
///
/// The attempt completes later; the socket becomes writable once the
/// handshake finished or failed. Only immediate failures (for example no
/// route to host) surface here.
pub fn connect_async(addr: SocketAddr) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addr)?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %addr, error = %e, "Failed to set TCP_NODELAY");
    }
    Ok(stream)
}

/// Outcome of checking an in-flight connect.
#[derive(Debug)]
pub enum ConnectStatus {
    Connected,
    InProgress,
    Failed(io::Error),
}

/// Checks whether a non-blocking connect has completed.
///
/// A writable event alone does not mean success: the pending socket error
/// and the peer address are both checked.
pub fn connect_status(stream: &TcpStream) -> ConnectStatus {
    match stream.take_error() {
        Ok(Some(e)) | Err(e) => return ConnectStatus::Failed(e),
        Ok(None) => {}
    }
    match stream.peer_addr() {
        Ok(_) => ConnectStatus::Connected,
        Err(e) if e.kind() == ErrorKind::NotConnected => ConnectStatus::InProgress,
        Err(e) if e.kind() == ErrorKind::WouldBlock => ConnectStatus::InProgress,
        Err(e) => ConnectStatus::Failed(e),
    }
}

/// Reads whatever is available into `buf` without blocking.
pub fn read_nonblocking<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    loop {
        match source.read(buf) {
            Ok(0) => return Ok(ReadOutcome::Closed),
            Ok(n) => return Ok(ReadOutcome::Data(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(ReadOutcome::WouldBlock),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Writes as much of `bytes` as the OS accepts without blocking.
///
/// # Errors
///
/// A zero-length write of a non-empty buffer is reported as `WriteZero`.
pub fn write_nonblocking<W: Write>(sink: &mut W, bytes: &[u8]) -> io::Result<WriteOutcome> {
    loop {
        match sink.write(bytes) {
            Ok(0) if !bytes.is_empty() => {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "socket accepted zero bytes",
                ))
            }
            Ok(n) => return Ok(WriteOutcome::Written(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(WriteOutcome::WouldBlock),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Selects the non-loopback local address used for listening.
///
/// # Errors
///
/// `EngineError::NoRoutableAddress` when the host has no route off the
/// loopback interface.
pub fn local_ip() -> Result<IpAddr, EngineError> {
    let detect = || -> io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect(ROUTE_TARGET)?;
        Ok(socket.local_addr()?.ip())
    };

    match detect() {
        Ok(ip) if !ip.is_loopback() && !ip.is_unspecified() => Ok(ip),
        Ok(ip) => {
            warn!(%ip, "Only a loopback address is available");
            Err(EngineError::NoRoutableAddress)
        }
        Err(e) => {
            warn!(error = %e, "Failed to determine a local address");
            Err(EngineError::NoRoutableAddress)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Writer that accepts at most `limit` bytes per call, then blocks.
    struct Throttled {
        limit: usize,
        calls_before_block: usize,
        written: Vec<u8>,
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.calls_before_block == 0 {
                return Err(ErrorKind::WouldBlock.into());
            }
            self.calls_before_block -= 1;
            let n = buf.len().min(self.limit);
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Blocking;

    impl Read for Blocking {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(ErrorKind::WouldBlock.into())
        }
    }

    #[test]
    fn test_read_outcomes() {
        let mut buf = [0u8; 8];
        let mut source = Cursor::new(b"abc".to_vec());
        assert_eq!(read_nonblocking(&mut source, &mut buf).unwrap(), ReadOutcome::Data(3));
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(read_nonblocking(&mut source, &mut buf).unwrap(), ReadOutcome::Closed);
        assert_eq!(
            read_nonblocking(&mut Blocking, &mut buf).unwrap(),
            ReadOutcome::WouldBlock
        );
    }

    #[test]
    fn test_partial_write_reports_accepted_bytes() {
        let mut sink = Throttled {
            limit: 2,
            calls_before_block: 1,
            written: Vec::new(),
        };
        assert_eq!(
            write_nonblocking(&mut sink, b"hello").unwrap(),
            WriteOutcome::Written(2)
        );
        assert_eq!(
            write_nonblocking(&mut sink, b"llo").unwrap(),
            WriteOutcome::WouldBlock
        );
        assert_eq!(sink.written, b"he");
    }

    #[test]
    fn test_listen_on_used_port_is_bind_error() {
        let first = listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();
        let err = listen(addr).unwrap_err();
        assert!(matches!(err, EngineError::Bind { .. }));
        assert!(err.to_string().contains(&addr.to_string()));
    }

    #[test]
    fn test_accept_pending_empty_queue() {
        let listener = listen("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(accept_pending(&listener).unwrap().is_none());
    }
}
