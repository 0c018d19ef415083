//! Traits abstracting over the sockets a client reads and writes.
//!
//! The engine never touches `TcpStream` directly: it connects through a
//! [`NetworkConnector`] and exchanges bytes with a [`NetworkStream`]. TLS
//! lives behind the [`TlsClient`] seam; this crate ships no TLS
//! implementation of its own.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use log::trace;

use crate::client::route::Route;
use crate::client::proxy::Proxy;

/// An abstraction over the streams the client exchanges bytes with.
pub trait NetworkStream: Read + Write + Send {
    /// The remote address of the underlying connection.
    fn peer_addr(&mut self) -> io::Result<SocketAddr>;

    /// Sets the read deadline applied to each blocking read.
    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()>;

    /// Sets the write deadline applied to each blocking write.
    fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()>;

    /// Shuts the stream down. Takes `&self` so a handle obtained with
    /// [`duplicate`](NetworkStream::duplicate) can interrupt IO blocked on
    /// the primary handle from another thread.
    fn close(&self, how: Shutdown) -> io::Result<()>;

    /// A second handle to the same underlying socket.
    fn duplicate(&self) -> io::Result<Box<dyn NetworkStream + Send>>;

    /// Probes whether an idle stream is still usable: no buffered bytes,
    /// no pending EOF. Used by the pool before handing the stream out.
    fn is_fresh(&mut self) -> bool {
        true
    }
}

/// Opens sockets for routes.
///
/// Implementations perform the socket-level connect only; CONNECT
/// tunnelling and TLS happen above this seam.
pub trait NetworkConnector: Send + Sync {
    /// Opens a stream to the route's resolved socket address.
    fn connect(
        &self,
        route: &Route,
        connect_timeout: Option<Duration>,
    ) -> crate::Result<Box<dyn NetworkStream + Send>>;
}

/// Wraps an established stream in TLS.
pub trait TlsClient: Send + Sync {
    /// Performs the client handshake for `host`, verifying any pins, and
    /// returns the wrapped stream with a description of the session.
    fn wrap_client(
        &self,
        stream: Box<dyn NetworkStream + Send>,
        host: &str,
        pins: &[String],
    ) -> crate::Result<(Box<dyn NetworkStream + Send>, Handshake)>;
}

/// A record of the TLS session a response was received over.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    /// The negotiated cipher suite, e.g. `TLS_AES_128_GCM_SHA256`.
    pub cipher_suite: String,
    /// ALPN-negotiated protocol, if any (`http/1.1`, `h2`).
    pub alpn_protocol: Option<String>,
}

/// A `NetworkStream` over a plain TCP socket.
#[derive(Debug)]
pub struct HttpStream(pub TcpStream);

impl Read for HttpStream {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for HttpStream {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl NetworkStream for HttpStream {
    fn peer_addr(&mut self) -> io::Result<SocketAddr> {
        self.0.peer_addr()
    }

    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.0.set_read_timeout(dur)
    }

    fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.0.set_write_timeout(dur)
    }

    fn close(&self, how: Shutdown) -> io::Result<()> {
        self.0.shutdown(how)
    }

    fn duplicate(&self) -> io::Result<Box<dyn NetworkStream + Send>> {
        Ok(Box::new(HttpStream(self.0.try_clone()?)))
    }

    fn is_fresh(&mut self) -> bool {
        // A healthy idle socket has nothing to read: a nonblocking peek
        // must report WouldBlock. Data or EOF means the server already
        // spoke or hung up.
        if self.0.set_nonblocking(true).is_err() {
            return false;
        }
        let mut byte = [0u8; 1];
        let fresh = match self.0.peek(&mut byte) {
            Ok(_) => false,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        };
        if self.0.set_nonblocking(false).is_err() {
            return false;
        }
        fresh
    }
}

/// The default connector: plain TCP with an optional connect deadline.
#[derive(Debug, Default)]
pub struct HttpConnector;

impl NetworkConnector for HttpConnector {
    fn connect(
        &self,
        route: &Route,
        connect_timeout: Option<Duration>,
    ) -> crate::Result<Box<dyn NetworkStream + Send>> {
        let addr = route.socket_address();
        trace!("connecting to {} via {:?}", addr, route.proxy());
        if let Proxy::Socks(..) = route.proxy() {
            // SOCKS handshakes are not implemented; surface as a route
            // failure so the selector can move on.
            return Err(crate::Error::new_route(io::Error::new(
                io::ErrorKind::Unsupported,
                "SOCKS proxies are not supported by the default connector",
            )));
        }
        let stream = match connect_timeout {
            Some(dur) => TcpStream::connect_timeout(&addr, dur),
            None => TcpStream::connect(addr),
        }
        .map_err(crate::Error::new_route)?;
        Ok(Box::new(HttpStream(stream)))
    }
}
