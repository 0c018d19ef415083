//! The blocking HTTP/1.x wire driver.

use std::fmt;
use std::io::{self, BufWriter, Read, Write};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::body::ResponseBody;
use crate::buffer::Buffered;
use crate::client::pool::Connection;
use crate::headers::Headers;
use crate::net::NetworkStream;
use crate::request::Request;
use crate::transport::{ResponseHead, Transport, DISCARD_STREAM_TIMEOUT_MILLIS};
use crate::Protocol;

use self::HttpReader::{ChunkedReader, EmptyReader, EofReader, SizedReader};
use self::HttpWriter::{ChunkedWriter, EmptyWriter, SizedWriter, ThroughWriter};

const MAX_HEADERS: usize = 100;

type Stream = Box<dyn NetworkStream + Send>;

/// Drives one HTTP/1.x exchange over a pooled connection.
///
/// The stream moves between states: inside the [`Connection`] while idle,
/// wrapped in an [`HttpWriter`] while the request goes out, wrapped in an
/// [`HttpReader`] once the response comes back.
pub(crate) struct Http1Transport {
    conn: Option<Connection>,
    writer: Option<HttpWriter<BufWriter<Stream>>>,
    reader: Option<Buffered<Stream>>,
    read_timeout: Option<Duration>,
    body_created: bool,
    reuse: bool,
}

impl Http1Transport {
    pub(crate) fn new(conn: Connection, read_timeout: Option<Duration>) -> Http1Transport {
        Http1Transport {
            conn: Some(conn),
            writer: None,
            reader: None,
            read_timeout,
            body_created: false,
            reuse: true,
        }
    }

    fn conn_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("transport lost its connection")
    }

    /// The request-target: absolute form through a cleartext HTTP proxy,
    /// origin form otherwise.
    fn request_target(&mut self, request: &Request) -> String {
        let route = self.conn_mut().route();
        if route.proxy().is_http() && route.address().tls_client().is_none() {
            request.url().as_str().to_owned()
        } else {
            request.request_path()
        }
    }
}

impl Transport for Http1Transport {
    fn write_request_headers(&mut self, request: &Request) -> crate::Result<()> {
        let target = self.request_target(request);
        let stream = self.conn_mut().take_stream();
        let mut stream = BufWriter::new(stream);

        debug!("request line: {:?} {:?}", request.method(), target);
        write!(&mut stream, "{} {} HTTP/1.1\r\n", request.method(), target)?;
        write!(&mut stream, "{}\r\n", request.headers())?;

        if let Some(connection) = request.header("Connection") {
            if connection.eq_ignore_ascii_case("close") {
                self.reuse = false;
            }
        }

        self.writer = Some(ThroughWriter(stream));
        Ok(())
    }

    fn create_request_body(
        &mut self,
        request: &Request,
        content_length: Option<u64>,
    ) -> crate::Result<()> {
        let writer = match self.writer.take() {
            Some(ThroughWriter(w)) => w,
            _ => {
                return Err(crate::Error::new_protocol(state_error(
                    "request headers must be written before the body",
                )));
            }
        };
        let chunked = request
            .headers()
            .values("Transfer-Encoding")
            .iter()
            .any(|v| v.eq_ignore_ascii_case("chunked"));
        self.writer = Some(match (chunked, content_length) {
            (true, _) | (false, None) => ChunkedWriter(writer),
            (false, Some(len)) => SizedWriter(writer, len),
        });
        self.body_created = true;
        Ok(())
    }

    fn request_sink(&mut self) -> Option<&mut (dyn Write + Send)> {
        if !self.body_created {
            return None;
        }
        self.writer
            .as_mut()
            .map(|w| w as &mut (dyn Write + Send))
    }

    fn write_request_body(&mut self, body: &[u8]) -> crate::Result<()> {
        match self.request_sink() {
            Some(sink) => {
                sink.write_all(body)?;
                Ok(())
            }
            None => Err(crate::Error::new_protocol(state_error(
                "no request body sink",
            ))),
        }
    }

    fn finish_request(&mut self) -> crate::Result<()> {
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => return Ok(()),
        };
        let buffered = writer.end()?;
        let stream = buffered
            .into_inner()
            .map_err(|e| crate::Error::new_io(e.into_error()))?;
        self.reader = Some(Buffered::new(stream));
        Ok(())
    }

    fn read_response_headers(&mut self) -> crate::Result<ResponseHead> {
        if self.reader.is_none() {
            self.finish_request()?;
        }
        let reader = self
            .reader
            .as_mut()
            .expect("finish_request populates the reader");

        let head = parse_response(reader)?;
        trace!("response head: {} {}", head.code, head.message);

        if head.protocol == Protocol::Http10 {
            let keep_alive = head
                .headers
                .get("Connection")
                .map(|v| v.eq_ignore_ascii_case("keep-alive"))
                .unwrap_or(false);
            if !keep_alive {
                self.reuse = false;
            }
        } else if let Some(connection) = head.headers.get("Connection") {
            if connection.eq_ignore_ascii_case("close") {
                self.reuse = false;
            }
        }

        Ok(head)
    }

    fn open_response_body(
        mut self: Box<Self>,
        request: &Request,
        head: &ResponseHead,
    ) -> crate::Result<ResponseBody> {
        let reader = self.reader.take().expect("headers must be read first");
        let mut conn = self.conn.take().expect("transport lost its connection");
        if !self.reuse {
            conn.mark_not_reusable();
        }

        let chunked = head
            .headers
            .values("Transfer-Encoding")
            .iter()
            .any(|v| v.eq_ignore_ascii_case("chunked"));
        let content_length = head
            .headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse::<u64>().ok());

        let (http_reader, reported_length) = if request.method() == "HEAD" {
            (EmptyReader(reader), Some(0))
        } else if chunked {
            (ChunkedReader(reader, None), None)
        } else if let Some(len) = content_length {
            (SizedReader(reader, len), Some(len))
        } else {
            // Terminated by connection close; nothing afterwards is
            // reusable.
            conn.mark_not_reusable();
            (EofReader(reader), None)
        };

        let complete = matches!(http_reader, EmptyReader(_) | SizedReader(_, 0));
        let content_type = head.headers.get("Content-Type").map(str::to_owned);
        Ok(ResponseBody::new(
            content_type,
            reported_length,
            Box::new(ConnectionSource {
                reader: Some(http_reader),
                conn: Some(conn),
                read_timeout: self.read_timeout,
                complete,
            }),
        ))
    }

    fn release_connection_on_idle(self: Box<Self>) {
        drop(self.into_connection());
    }

    fn can_reuse_connection(&self) -> bool {
        self.reuse
    }

    fn into_connection(mut self: Box<Self>) -> Option<Connection> {
        let mut conn = self.conn.take()?;
        if !self.reuse {
            conn.mark_not_reusable();
        }
        if let Some(reader) = self.reader.take() {
            if reader.pending_len() > 0 {
                // The server sent bytes we never asked for.
                conn.mark_not_reusable();
            }
            conn.restore_stream(reader.into_stream());
        } else if let Some(writer) = self.writer.take() {
            // The request never completed; the stream state is undefined.
            conn.mark_not_reusable();
            if let Ok(stream) = writer.into_inner().into_inner() {
                conn.restore_stream(stream);
            }
        }
        Some(conn)
    }

    fn disconnect(&mut self) -> io::Result<()> {
        self.reuse = false;
        if let Some(ref writer) = self.writer {
            return writer.get_ref().get_ref().close(std::net::Shutdown::Both);
        }
        if let Some(ref reader) = self.reader {
            return reader.stream().close(std::net::Shutdown::Both);
        }
        match self.conn {
            Some(ref conn) => conn.shutdown(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Http1Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http1Transport")
            .field("reuse", &self.reuse)
            .field("writing", &self.writer.is_some())
            .field("reading", &self.reader.is_some())
            .finish()
    }
}

/// The byte source handed to the application: reads the framed body and
/// releases the connection when done with it.
struct ConnectionSource {
    reader: Option<HttpReader<Buffered<Stream>>>,
    conn: Option<Connection>,
    read_timeout: Option<Duration>,
    complete: bool,
}

impl ConnectionSource {
    /// Drains whatever the application left unread, giving up after
    /// [`DISCARD_STREAM_TIMEOUT_MILLIS`].
    fn discard_remainder(&mut self) -> bool {
        let reader = match self.reader {
            Some(ref mut reader) => reader,
            None => return true,
        };
        let timeout = Duration::from_millis(DISCARD_STREAM_TIMEOUT_MILLIS);
        if reader
            .get_ref()
            .stream()
            .set_read_timeout(Some(timeout))
            .is_err()
        {
            return false;
        }
        let deadline = Instant::now() + timeout;
        let mut scratch = [0u8; 2048];
        let drained = loop {
            if Instant::now() >= deadline {
                break false;
            }
            match reader.read(&mut scratch) {
                Ok(0) => break true,
                Ok(_) => {}
                Err(_) => break false,
            }
        };
        let restored = reader
            .get_ref()
            .stream()
            .set_read_timeout(self.read_timeout)
            .is_ok();
        drained && restored
    }
}

impl Read for ConnectionSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let reader = match self.reader {
            Some(ref mut reader) => reader,
            None => return Ok(0),
        };
        match reader.read(buf) {
            Ok(0) => {
                self.complete = true;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(err) => {
                if let Some(ref mut conn) = self.conn {
                    conn.mark_not_reusable();
                }
                Err(err)
            }
        }
    }
}

impl Drop for ConnectionSource {
    fn drop(&mut self) {
        let drained = self.complete || self.discard_remainder();
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        if !drained {
            trace!("could not drain response body, closing connection");
            conn.mark_not_reusable();
        }
        if let Some(reader) = self.reader.take() {
            let buffered = reader.into_inner();
            if buffered.pending_len() > 0 {
                conn.mark_not_reusable();
            }
            conn.restore_stream(buffered.into_stream());
        }
    }
}

fn state_error(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, message.to_owned())
}

/// Parses a response head, pulling more bytes into the window until
/// httparse sees the terminating empty line.
fn parse_response(reader: &mut Buffered<Stream>) -> crate::Result<ResponseHead> {
    loop {
        if let Some((head, len)) = try_parse_response(reader)? {
            reader.advance(len);
            return Ok(head);
        }
        if reader.is_full() {
            return Err(crate::Error::new_protocol(state_error(
                "response head too large",
            )));
        }
        if reader.fill()? == 0 {
            return Err(if reader.pending().is_empty() {
                crate::Error::new_io(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "connection closed before the response arrived",
                ))
            } else {
                crate::Error::new_protocol(state_error("response head ended mid-parse"))
            });
        }
    }
}

fn try_parse_response(
    reader: &mut Buffered<Stream>,
) -> crate::Result<Option<(ResponseHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(reader.pending())? {
        httparse::Status::Complete(len) => {
            let protocol = match response.version {
                Some(0) => Protocol::Http10,
                _ => Protocol::Http11,
            };
            let code = response.code.expect("complete response has a code");
            let message = response.reason.unwrap_or("").to_owned();
            let mut builder = Headers::builder();
            for header in response.headers.iter() {
                builder.add_lenient_pair(
                    header.name,
                    String::from_utf8_lossy(header.value).trim(),
                );
            }
            Ok(Some((
                ResponseHead {
                    protocol,
                    code,
                    message,
                    headers: builder.build(),
                },
                len,
            )))
        }
        httparse::Status::Partial => Ok(None),
    }
}

/// Readers for each way HTTP/1.x frames a body.
pub(crate) enum HttpReader<R> {
    /// Content-Length with a positive remaining count.
    SizedReader(R, u64),
    /// `Transfer-Encoding: chunked`; the option holds the bytes left in
    /// the current chunk, `None` before a chunk size has been read.
    ChunkedReader(R, Option<u64>),
    /// No framing: the body runs to connection close.
    EofReader(R),
    /// No body at all.
    EmptyReader(R),
}

impl<R: Read> HttpReader<R> {
    pub fn into_inner(self) -> R {
        match self {
            SizedReader(r, _) => r,
            ChunkedReader(r, _) => r,
            EofReader(r) => r,
            EmptyReader(r) => r,
        }
    }

    pub fn get_ref(&self) -> &R {
        match *self {
            SizedReader(ref r, _) => r,
            ChunkedReader(ref r, _) => r,
            EofReader(ref r) => r,
            EmptyReader(ref r) => r,
        }
    }
}

impl<R: Read> Read for HttpReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match *self {
            SizedReader(ref mut body, ref mut remaining) => {
                trace!("sized read, remaining={}", remaining);
                if *remaining == 0 {
                    return Ok(0);
                }
                let to_read = (*remaining).min(buf.len() as u64) as usize;
                let num = body.read(&mut buf[..to_read])? as u64;
                if num == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "body ended before Content-Length",
                    ));
                }
                *remaining -= num;
                Ok(num as usize)
            }
            ChunkedReader(ref mut body, ref mut opt_remaining) => {
                let mut rem = match *opt_remaining {
                    Some(rem) => rem,
                    None => read_chunk_header(body)?,
                };
                trace!("chunked read, remaining={}", rem);

                if rem == 0 {
                    if opt_remaining.is_none() {
                        // First sight of the final chunk: its empty data
                        // still ends with a CRLF of its own.
                        expect_crlf(body)?;
                    }
                    *opt_remaining = Some(0);
                    return Ok(0);
                }

                let to_read = (rem as usize).min(buf.len());
                let count = body.read(&mut buf[..to_read])? as u64;
                if count == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "body ended mid-chunk",
                    ));
                }

                rem -= count;
                *opt_remaining = if rem > 0 {
                    Some(rem)
                } else {
                    expect_crlf(body)?;
                    None
                };
                Ok(count as usize)
            }
            EofReader(ref mut body) => body.read(buf),
            EmptyReader(_) => Ok(0),
        }
    }
}

impl<R> fmt::Debug for HttpReader<R> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            SizedReader(_, rem) => write!(fmt, "SizedReader(remaining={:?})", rem),
            ChunkedReader(_, None) => write!(fmt, "ChunkedReader(chunk_remaining=unknown)"),
            ChunkedReader(_, Some(rem)) => write!(fmt, "ChunkedReader(chunk_remaining={:?})", rem),
            EofReader(_) => write!(fmt, "EofReader"),
            EmptyReader(_) => write!(fmt, "EmptyReader"),
        }
    }
}

/// A chunk-size line has no business being longer than this.
const MAX_CHUNK_HEADER: usize = 1024;

/// Reads the CRLF-terminated line that opens a chunk and parses the
/// leading hex size. Everything past a `;` is a chunk extension, which
/// this client ignores wholesale.
fn read_chunk_header<R: Read>(body: &mut R) -> io::Result<u64> {
    let line = read_crlf_line(body, MAX_CHUNK_HEADER)?;
    let size = parse_chunk_header(&line)?;
    trace!("chunk size={}", size);
    Ok(size)
}

/// Collects bytes up to a CRLF, excluding the terminator. A bare CR or
/// an oversized line is malformed framing.
fn read_crlf_line<R: Read>(body: &mut R, limit: usize) -> io::Result<Vec<u8>> {
    let mut line = Vec::new();
    loop {
        match read_one(body)? {
            b'\r' => {
                if read_one(body)? != b'\n' {
                    return Err(framing_error("bare CR in chunk header"));
                }
                return Ok(line);
            }
            _ if line.len() >= limit => {
                return Err(framing_error("chunk header too long"));
            }
            byte => line.push(byte),
        }
    }
}

/// `chunk-size [ WS ] [ ";" chunk-ext ]`, the size in hex, with the
/// arithmetic overflow-checked rather than trusted.
fn parse_chunk_header(line: &[u8]) -> io::Result<u64> {
    let size_part = match line.iter().position(|&b| b == b';') {
        Some(split) => &line[..split],
        None => line,
    };
    let digits = trim_trailing_ws(size_part);
    if digits.is_empty() {
        return Err(framing_error("missing chunk size"));
    }

    let mut size: u64 = 0;
    for &byte in digits {
        let digit = match (byte as char).to_digit(16) {
            Some(digit) => u64::from(digit),
            None => return Err(framing_error("invalid chunk size")),
        };
        size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(digit))
            .ok_or_else(|| framing_error("chunk size overflow"))?;
    }
    Ok(size)
}

fn trim_trailing_ws(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|&b| b != b' ' && b != b'\t')
        .map(|i| i + 1)
        .unwrap_or(0);
    &bytes[..end]
}

/// Consumes the CRLF that closes a chunk's data.
fn expect_crlf<R: Read>(body: &mut R) -> io::Result<()> {
    if read_one(body)? != b'\r' || read_one(body)? != b'\n' {
        return Err(framing_error("chunk data not closed by CRLF"));
    }
    Ok(())
}

fn read_one<R: Read>(body: &mut R) -> io::Result<u8> {
    let mut byte = [0u8; 1];
    if body.read(&mut byte)? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream ended inside chunked framing",
        ));
    }
    Ok(byte[0])
}

fn framing_error(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_owned())
}

/// Writers for each way HTTP/1.x frames a body.
pub(crate) enum HttpWriter<W: Write> {
    /// Headers written, body framing not yet decided.
    ThroughWriter(W),
    /// `Transfer-Encoding: chunked`.
    ChunkedWriter(W),
    /// Content-Length is set; writes beyond it are truncated.
    SizedWriter(W, u64),
    /// A body-less message.
    #[allow(dead_code)]
    EmptyWriter(W),
}

impl<W: Write> HttpWriter<W> {
    #[inline]
    pub fn into_inner(self) -> W {
        match self {
            ThroughWriter(w) => w,
            ChunkedWriter(w) => w,
            SizedWriter(w, _) => w,
            EmptyWriter(w) => w,
        }
    }

    #[inline]
    pub fn get_ref(&self) -> &W {
        match *self {
            ThroughWriter(ref w) => w,
            ChunkedWriter(ref w) => w,
            SizedWriter(ref w, _) => w,
            EmptyWriter(ref w) => w,
        }
    }

    /// Ends the message: the chunked variant writes its zero-length final
    /// chunk, everything is flushed.
    #[inline]
    pub fn end(mut self) -> io::Result<W> {
        self.write_all(&[])?;
        self.flush()?;
        Ok(self.into_inner())
    }
}

impl<W: Write> Write for HttpWriter<W> {
    #[inline]
    fn write(&mut self, msg: &[u8]) -> io::Result<usize> {
        match *self {
            ThroughWriter(ref mut w) => {
                if msg.is_empty() {
                    return Ok(0);
                }
                w.write(msg)
            }
            ChunkedWriter(ref mut w) => {
                let chunk_size = msg.len();
                trace!("chunked write, size = {}", chunk_size);
                write!(w, "{:X}\r\n", chunk_size)?;
                w.write_all(msg)?;
                w.write_all(b"\r\n")?;
                Ok(msg.len())
            }
            SizedWriter(ref mut w, ref mut remaining) => {
                let len = msg.len() as u64;
                if len > *remaining {
                    let len = *remaining;
                    *remaining = 0;
                    w.write_all(&msg[..len as usize])?;
                    Ok(len as usize)
                } else {
                    *remaining -= len;
                    w.write_all(msg)?;
                    Ok(len as usize)
                }
            }
            EmptyWriter(..) => Ok(0),
        }
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        match *self {
            ThroughWriter(ref mut w) => w.flush(),
            ChunkedWriter(ref mut w) => w.flush(),
            SizedWriter(ref mut w, _) => w.flush(),
            EmptyWriter(ref mut w) => w.flush(),
        }
    }
}

impl<W: Write> fmt::Debug for HttpWriter<W> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ThroughWriter(_) => write!(fmt, "ThroughWriter"),
            ChunkedWriter(_) => write!(fmt, "ChunkedWriter"),
            SizedWriter(_, rem) => write!(fmt, "SizedWriter(remaining={:?})", rem),
            EmptyWriter(_) => write!(fmt, "EmptyWriter"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::sync::Arc;

    use super::{parse_chunk_header, read_chunk_header, Http1Transport, HttpReader, HttpWriter};
    use crate::client::auth::NoAuthenticator;
    use crate::client::pool::{Connection, ConnectionPool};
    use crate::client::proxy::{DirectSelector, Proxy};
    use crate::client::route::{Address, ConnectionSpec, Route};
    use crate::mock::MockStream;
    use crate::request::Request;
    use crate::transport::Transport;
    use crate::Protocol;

    fn connection(pool: &ConnectionPool, stream: MockStream) -> Connection {
        let address = Address::new(
            "h",
            80,
            None,
            Vec::new(),
            Arc::new(NoAuthenticator),
            vec![Protocol::Http11],
            vec![ConnectionSpec::Cleartext],
            None,
            Arc::new(DirectSelector),
        );
        let route = Route::new(address, Proxy::Direct, "10.0.0.1:80".parse().unwrap());
        let mut conn = Connection::new(route, Box::new(stream), Protocol::Http11, None);
        pool.adopt(&mut conn);
        conn
    }

    #[test]
    fn chunked_writer_frames_each_write_and_closes() {
        let mut w = HttpWriter::ChunkedWriter(Vec::new());
        w.write_all(b"carrier").unwrap();
        w.write_all(b"streams bodies").unwrap();
        let wire = w.end().unwrap();
        assert_eq!(
            std::str::from_utf8(&wire).unwrap(),
            "7\r\ncarrier\r\nE\r\nstreams bodies\r\n0\r\n\r\n"
        );
    }

    #[test]
    fn sized_writer_truncates_at_the_declared_length() {
        let mut w = HttpWriter::SizedWriter(Vec::new(), 5);
        assert_eq!(w.write(b"hel").unwrap(), 3);
        assert_eq!(w.write(b"lo!").unwrap(), 2);
        assert_eq!(w.write(b"x").unwrap(), 0);
        assert_eq!(w.end().unwrap(), b"hello");
    }

    #[test]
    fn chunk_header_parses_sizes_and_skips_extensions() {
        assert_eq!(parse_chunk_header(b"0").unwrap(), 0);
        assert_eq!(parse_chunk_header(b"2a").unwrap(), 42);
        assert_eq!(parse_chunk_header(b"2A").unwrap(), 42);
        assert_eq!(parse_chunk_header(b"007").unwrap(), 7);
        assert_eq!(parse_chunk_header(b"400;name=value").unwrap(), 0x400);
        assert_eq!(parse_chunk_header(b"8 ; anything at ; all").unwrap(), 8);
        assert_eq!(parse_chunk_header(b"8\t;").unwrap(), 8);
    }

    #[test]
    fn chunk_header_rejects_garbage() {
        assert!(parse_chunk_header(b"").is_err());
        assert!(parse_chunk_header(b";ext-only").is_err());
        assert!(parse_chunk_header(b"   ").is_err());
        assert!(parse_chunk_header(b"-5").is_err());
        assert!(parse_chunk_header(b"0x1f").is_err());
        assert!(parse_chunk_header(b"5 5").is_err());
        assert!(parse_chunk_header(b"cafe babe").is_err());
    }

    #[test]
    fn chunk_header_checks_for_overflow() {
        assert_eq!(parse_chunk_header(b"ffffffffffffffff").unwrap(), u64::MAX);
        assert!(parse_chunk_header(b"10000000000000000").is_err());
    }

    #[test]
    fn chunk_header_line_requires_crlf() {
        assert_eq!(read_chunk_header(&mut &b"5\r\nhello"[..]).unwrap(), 5);
        assert_eq!(
            read_chunk_header(&mut &b"5\rX"[..]).unwrap_err().kind(),
            std::io::ErrorKind::InvalidData
        );
        assert_eq!(
            read_chunk_header(&mut &b"5"[..]).unwrap_err().kind(),
            std::io::ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn chunked_reader_requires_crlf_after_chunk_data() {
        let wire = b"3\r\nfooXX";
        let mut reader = HttpReader::ChunkedReader(&wire[..], None);
        let mut out = String::new();
        assert!(reader.read_to_string(&mut out).is_err());
    }

    #[test]
    fn chunked_reader_handles_chunks_and_extensions() {
        let wire = b"3\r\nfoo\r\n3;ext=1\r\nbar\r\n0\r\n\r\n";
        let mut reader = HttpReader::ChunkedReader(&wire[..], None);
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "foobar");
    }

    #[test]
    fn sized_reader_stops_at_length() {
        let wire = b"hi!leftover";
        let mut reader = HttpReader::SizedReader(&wire[..], 3);
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hi!");
    }

    #[test]
    fn sized_reader_rejects_early_eof() {
        let wire = b"hi";
        let mut reader = HttpReader::SizedReader(&wire[..], 3);
        let mut out = String::new();
        let err = reader.read_to_string(&mut out).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn exchange_writes_exact_bytes_and_recycles() {
        let pool = ConnectionPool::new();
        let stream = MockStream::with_input(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nhi!");
        let handle = stream.clone();
        let conn = connection(&pool, stream);

        let request = Request::get("http://h/p").unwrap().header_set("Host", "h").unwrap();
        let mut transport: Box<dyn Transport> = Box::new(Http1Transport::new(conn, None));
        transport.write_request_headers(&request).unwrap();
        transport.finish_request().unwrap();
        assert_eq!(
            String::from_utf8(handle.written()).unwrap(),
            "GET /p HTTP/1.1\r\nHost: h\r\n\r\n"
        );

        let head = transport.read_response_headers().unwrap();
        assert_eq!(head.code, 200);
        assert_eq!(head.message, "OK");
        assert_eq!(head.headers.get("Content-Length"), Some("3"));

        let body = transport.open_response_body(&request, &head).unwrap();
        assert_eq!(body.string().unwrap(), "hi!");
        // Fully consumed: the connection is back in the pool.
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn connection_close_prevents_reuse() {
        let pool = ConnectionPool::new();
        let stream =
            MockStream::with_input(b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n");
        let conn = connection(&pool, stream);

        let request = Request::get("http://h/").unwrap().header_set("Host", "h").unwrap();
        let mut transport: Box<dyn Transport> = Box::new(Http1Transport::new(conn, None));
        transport.write_request_headers(&request).unwrap();
        transport.finish_request().unwrap();
        let head = transport.read_response_headers().unwrap();
        assert!(!transport.can_reuse_connection());
        let body = transport.open_response_body(&request, &head).unwrap();
        drop(body);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn http10_without_keep_alive_prevents_reuse() {
        let pool = ConnectionPool::new();
        let stream = MockStream::with_input(b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n");
        let conn = connection(&pool, stream);

        let request = Request::get("http://h/").unwrap().header_set("Host", "h").unwrap();
        let mut transport: Box<dyn Transport> = Box::new(Http1Transport::new(conn, None));
        transport.write_request_headers(&request).unwrap();
        transport.finish_request().unwrap();
        let head = transport.read_response_headers().unwrap();
        assert_eq!(head.protocol, Protocol::Http10);
        assert!(!transport.can_reuse_connection());
    }

    #[test]
    fn absolute_form_through_cleartext_proxy() {
        let pool = ConnectionPool::new();
        let stream = MockStream::with_input(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        let handle = stream.clone();

        let address = Address::new(
            "h",
            80,
            None,
            Vec::new(),
            Arc::new(NoAuthenticator),
            vec![Protocol::Http11],
            vec![ConnectionSpec::Cleartext],
            Some(Proxy::Http("proxy".into(), 8080)),
            Arc::new(DirectSelector),
        );
        let route = Route::new(
            address,
            Proxy::Http("proxy".into(), 8080),
            "10.1.1.1:8080".parse().unwrap(),
        );
        let mut conn = Connection::new(route, Box::new(stream), Protocol::Http11, None);
        pool.adopt(&mut conn);

        let request = Request::get("http://h/p?q=1").unwrap().header_set("Host", "h").unwrap();
        let mut transport = Http1Transport::new(conn, None);
        transport.write_request_headers(&request).unwrap();
        transport.finish_request().unwrap();
        let written = String::from_utf8(handle.written()).unwrap();
        assert!(written.starts_with("GET http://h/p?q=1 HTTP/1.1\r\n"));
    }

    #[test]
    fn unread_body_is_discarded_before_recycling() {
        let pool = ConnectionPool::new();
        let stream = MockStream::with_input(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
        let conn = connection(&pool, stream);

        let request = Request::get("http://h/").unwrap().header_set("Host", "h").unwrap();
        let mut transport: Box<dyn Transport> = Box::new(Http1Transport::new(conn, None));
        transport.write_request_headers(&request).unwrap();
        transport.finish_request().unwrap();
        let head = transport.read_response_headers().unwrap();
        let body = transport.open_response_body(&request, &head).unwrap();
        // Dropped unread: the residue is small enough to drain, so the
        // connection is still recycled.
        drop(body);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn chunked_request_body_is_framed() {
        let pool = ConnectionPool::new();
        let stream = MockStream::with_input(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        let handle = stream.clone();
        let conn = connection(&pool, stream);

        let request = Request::new("POST", "http://h/upload")
            .unwrap()
            .header_set("Host", "h")
            .unwrap()
            .header_set("Transfer-Encoding", "chunked")
            .unwrap();
        let mut transport: Box<dyn Transport> = Box::new(Http1Transport::new(conn, None));
        transport.write_request_headers(&request).unwrap();
        transport.create_request_body(&request, None).unwrap();
        transport.write_request_body(b"hello").unwrap();
        transport.finish_request().unwrap();

        let written = String::from_utf8(handle.written()).unwrap();
        assert!(written.ends_with("\r\n\r\n5\r\nhello\r\n0\r\n\r\n"));
    }
}
