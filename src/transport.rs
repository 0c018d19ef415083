//! The wire-driver seam between the engine and a protocol implementation.

use std::fmt;
use std::io::{self, Write};

use crate::body::ResponseBody;
use crate::client::pool::Connection;
use crate::headers::Headers;
use crate::request::Request;
use crate::Protocol;

/// When draining a residual response stream so a connection can be
/// pooled would take longer than this, the connection is closed instead.
pub const DISCARD_STREAM_TIMEOUT_MILLIS: u64 = 100;

/// The parsed status line and headers of a response.
#[derive(Debug)]
pub struct ResponseHead {
    /// Protocol the response was spoken in.
    pub protocol: Protocol,
    /// Numeric status code.
    pub code: u16,
    /// Status message, possibly empty.
    pub message: String,
    /// The response headers, exactly as received.
    pub headers: Headers,
}

/// One request/response exchange over an established connection.
///
/// Implemented by the HTTP/1.x driver in this crate and by external
/// HTTP/2 drivers. A transport owns its [`Connection`] for the duration
/// of the exchange and returns it to the pool through
/// [`open_response_body`](Transport::open_response_body) (the body drives
/// the release when fully read) or
/// [`release_connection_on_idle`](Transport::release_connection_on_idle).
pub trait Transport: Send {
    /// Emits the request line and headers, without flushing.
    fn write_request_headers(&mut self, request: &Request) -> crate::Result<()>;

    /// Prepares the body sink with the right framing: chunked when the
    /// request says `Transfer-Encoding: chunked`, fixed-length otherwise.
    fn create_request_body(
        &mut self,
        request: &Request,
        content_length: Option<u64>,
    ) -> crate::Result<()>;

    /// The sink created by
    /// [`create_request_body`](Transport::create_request_body), if any.
    fn request_sink(&mut self) -> Option<&mut (dyn Write + Send)>;

    /// Writes an already buffered, replayable body in one shot.
    fn write_request_body(&mut self, body: &[u8]) -> crate::Result<()>;

    /// Completes the request framing (for example the zero-length final
    /// chunk) and flushes everything to the wire.
    fn finish_request(&mut self) -> crate::Result<()>;

    /// Blocks until the status line and headers are available.
    fn read_response_headers(&mut self) -> crate::Result<ResponseHead>;

    /// Opens the framed response body. The returned body owns the
    /// connection and recycles it once the bytes are exhausted, or closed
    /// early within [`DISCARD_STREAM_TIMEOUT_MILLIS`].
    fn open_response_body(
        self: Box<Self>,
        request: &Request,
        head: &ResponseHead,
    ) -> crate::Result<ResponseBody>;

    /// Returns the connection to the pool now; used when the response has
    /// no body.
    fn release_connection_on_idle(self: Box<Self>);

    /// False once the exchange saw `Connection: close` or a protocol
    /// error, meaning the connection must not serve another request.
    fn can_reuse_connection(&self) -> bool;

    /// Takes the connection back out of the transport, abandoning any
    /// in-flight exchange.
    fn into_connection(self: Box<Self>) -> Option<Connection>;

    /// Forcibly drops the socket, interrupting blocked IO.
    fn disconnect(&mut self) -> io::Result<()>;
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Transport")
    }
}
