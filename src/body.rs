//! Request and response bodies.

use std::fmt;
use std::io::{self, Read};
use std::sync::Mutex;

use bytes::Bytes;
use flate2::read::GzDecoder;

/// The bytes a request carries to the server.
///
/// A byte-backed body is *replayable*: after a connection failure the
/// engine may retransmit it on a fresh route. A streamed body can only be
/// read once, which disables that recovery.
pub struct RequestBody {
    content_type: Option<String>,
    content_length: Option<u64>,
    kind: RequestKind,
}

enum RequestKind {
    Bytes(Bytes),
    Stream(Mutex<Option<Box<dyn Read + Send>>>),
}

impl RequestBody {
    /// A fully buffered, replayable body.
    pub fn bytes<B: Into<Bytes>>(content_type: Option<&str>, data: B) -> RequestBody {
        let data = data.into();
        RequestBody {
            content_type: content_type.map(str::to_owned),
            content_length: Some(data.len() as u64),
            kind: RequestKind::Bytes(data),
        }
    }

    /// A one-shot streamed body with known or unknown length.
    pub fn stream(
        content_type: Option<&str>,
        content_length: Option<u64>,
        source: Box<dyn Read + Send>,
    ) -> RequestBody {
        RequestBody {
            content_type: content_type.map(str::to_owned),
            content_length,
            kind: RequestKind::Stream(Mutex::new(Some(source))),
        }
    }

    /// The declared media type, if any.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// The byte count, when known up front.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Whether the body can be written again after a failed attempt.
    pub fn is_replayable(&self) -> bool {
        matches!(self.kind, RequestKind::Bytes(_))
    }

    pub(crate) fn as_bytes(&self) -> Option<&Bytes> {
        match self.kind {
            RequestKind::Bytes(ref data) => Some(data),
            RequestKind::Stream(_) => None,
        }
    }

    /// Takes the stream out of a one-shot body. Returns `None` for byte
    /// bodies and for streams already consumed.
    pub(crate) fn take_stream(&self) -> Option<Box<dyn Read + Send>> {
        match self.kind {
            RequestKind::Bytes(_) => None,
            RequestKind::Stream(ref slot) => slot.lock().unwrap().take(),
        }
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBody")
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .field("replayable", &self.is_replayable())
            .finish()
    }
}

/// A one-shot response body.
///
/// The bytes can be consumed exactly once, through [`Read`],
/// [`bytes`](ResponseBody::bytes) or [`string`](ResponseBody::string).
pub struct ResponseBody {
    content_type: Option<String>,
    content_length: Option<u64>,
    source: Box<dyn Read + Send>,
}

impl ResponseBody {
    /// A body streaming from `source` with the declared metadata.
    pub fn new(
        content_type: Option<String>,
        content_length: Option<u64>,
        source: Box<dyn Read + Send>,
    ) -> ResponseBody {
        ResponseBody {
            content_type,
            content_length,
            source,
        }
    }

    /// A zero-length body.
    pub fn empty() -> ResponseBody {
        ResponseBody::new(None, Some(0), Box::new(io::empty()))
    }

    /// Wraps a concrete byte buffer.
    pub fn from_bytes<B: Into<Bytes>>(content_type: Option<String>, data: B) -> ResponseBody {
        let data = data.into();
        ResponseBody {
            content_type,
            content_length: Some(data.len() as u64),
            source: Box::new(io::Cursor::new(data)),
        }
    }

    /// The declared media type, if any.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// The length declared by the response, if known.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Reads the remaining bytes.
    pub fn bytes(mut self) -> crate::Result<Bytes> {
        let mut buf = match self.content_length {
            Some(len) => Vec::with_capacity(len.min(64 * 1024) as usize),
            None => Vec::new(),
        };
        self.source.read_to_end(&mut buf)?;
        if let Some(len) = self.content_length {
            if len != buf.len() as u64 {
                return Err(crate::Error::new_protocol(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("expected {} bytes but received {}", len, buf.len()),
                )));
            }
        }
        Ok(Bytes::from(buf))
    }

    /// Reads the remaining bytes as text, replacing invalid UTF-8.
    pub fn string(self) -> crate::Result<String> {
        let bytes = self.bytes()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Replaces the byte source, keeping the declared metadata.
    pub(crate) fn map_source<F>(self, f: F) -> ResponseBody
    where
        F: FnOnce(Box<dyn Read + Send>) -> Box<dyn Read + Send>,
    {
        ResponseBody {
            content_type: self.content_type,
            content_length: self.content_length,
            source: f(self.source),
        }
    }
}

impl Read for ResponseBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.source.read(buf)
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody")
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish()
    }
}

/// Wraps a body in a streaming gzip decoder. The decoded length is
/// unknown, so the declared length is cleared.
pub(crate) fn gunzipped(body: ResponseBody) -> ResponseBody {
    let content_type = body.content_type.clone();
    ResponseBody {
        content_type,
        content_length: None,
        source: Box::new(GzDecoder::new(body.source)),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn bytes_honors_declared_length() {
        let body = ResponseBody::new(
            None,
            Some(5),
            Box::new(io::Cursor::new(b"hi".to_vec())),
        );
        let err = body.bytes().unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn string_replaces_invalid_utf8() {
        let body = ResponseBody::from_bytes(None, vec![0x68, 0xff, 0x69]);
        assert_eq!(body.string().unwrap(), "h\u{fffd}i");
    }

    #[test]
    fn gunzip_round_trip() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"hello").unwrap();
        let compressed = encoder.finish().unwrap();

        let body = ResponseBody::from_bytes(None, compressed);
        let plain = gunzipped(body);
        assert_eq!(plain.content_length(), None);
        assert_eq!(plain.string().unwrap(), "hello");
    }

    #[test]
    fn streamed_request_body_is_single_shot() {
        let body = RequestBody::stream(None, None, Box::new(io::Cursor::new(b"x".to_vec())));
        assert!(!body.is_replayable());
        assert!(body.take_stream().is_some());
        assert!(body.take_stream().is_none());
    }
}
