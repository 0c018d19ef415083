//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Result type often returned from methods that can have carrier `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur executing an HTTP call.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    /// The request itself is unusable: malformed URL, unknown host on the
    /// initial resolve, invalid header. Surfaced to the caller immediately.
    Request,
    /// Failure opening or handshaking a specific route. Recoverable by
    /// trying the next route, if any remain.
    Route,
    /// The peer produced malformed or disallowed bytes. Not retried.
    Protocol,
    /// A socket deadline elapsed. Not retried.
    Timeout,
    /// The call was canceled. Not retried.
    Canceled,
    /// TLS handshake or certificate pinning failure. Not retried.
    Security,
    /// Transient network failure. Retried on a fresh connection when the
    /// request body is replayable.
    Io,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_request<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Request).with(cause)
    }

    pub(crate) fn new_route<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Route).with(cause)
    }

    pub(crate) fn new_protocol<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Protocol).with(cause)
    }

    pub(crate) fn new_canceled() -> Error {
        Error::new(Kind::Canceled)
    }

    /// Creates a security error. For [`TlsClient`](crate::net::TlsClient)
    /// implementations reporting handshake or pinning failures; these are
    /// never retried.
    pub fn security<C>(cause: C) -> Error
    where
        C: Into<Box<dyn StdError + Send + Sync>>,
    {
        Error::new(Kind::Security).with(cause)
    }

    pub(crate) fn new_io(cause: io::Error) -> Error {
        match cause.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                Error::new(Kind::Timeout).with(cause)
            }
            io::ErrorKind::Interrupted => Error::new(Kind::Canceled).with(cause),
            _ => Error::new(Kind::Io).with(cause),
        }
    }

    pub(crate) fn kind(&self) -> Kind {
        self.inner.kind
    }

    /// Returns true if the request was unusable as given.
    pub fn is_request(&self) -> bool {
        self.inner.kind == Kind::Request
    }

    /// Returns true if a specific route failed to connect or handshake.
    pub fn is_route(&self) -> bool {
        self.inner.kind == Kind::Route
    }

    /// Returns true if the peer violated the protocol.
    pub fn is_protocol(&self) -> bool {
        self.inner.kind == Kind::Protocol
    }

    /// Returns true if a socket deadline elapsed.
    pub fn is_timeout(&self) -> bool {
        self.inner.kind == Kind::Timeout
    }

    /// Returns true if the call was canceled.
    pub fn is_canceled(&self) -> bool {
        self.inner.kind == Kind::Canceled
    }

    /// Returns true for TLS handshake and certificate pinning failures.
    pub fn is_security(&self) -> bool {
        self.inner.kind == Kind::Security
    }

    /// Returns true for transient network failures.
    pub fn is_io(&self) -> bool {
        self.inner.kind == Kind::Io
    }

    /// Whether the failure is tied to one connection attempt rather than
    /// the request, so a fresh route may succeed.
    pub(crate) fn is_recoverable(&self) -> bool {
        matches!(self.inner.kind, Kind::Route | Kind::Io)
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Request => "invalid request",
            Kind::Route => "error connecting to route",
            Kind::Protocol => "protocol error",
            Kind::Timeout => "operation timed out",
            Kind::Canceled => "call canceled",
            Kind::Security => "TLS error",
            Kind::Io => "connection error",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut b = f.debug_tuple("carrier::Error");
        b.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            b.field(cause);
        }
        b.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::new_io(err)
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Error {
        Error::new_request(err)
    }
}

impl From<httparse::Error> for Error {
    fn from(err: httparse::Error) -> Error {
        Error::new_protocol(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_timeouts_map_to_timeout_kind() {
        let err = Error::new_io(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
        assert!(err.is_timeout());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn plain_io_is_recoverable() {
        let err = Error::new_io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(err.is_io());
        assert!(err.is_recoverable());
    }

    #[test]
    fn cause_is_preserved() {
        let err = Error::new_route(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert!(err.source().is_some());
        assert!(err.to_string().contains("refused"));
    }
}
