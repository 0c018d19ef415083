//! Proxy servers and proxy selection.

use std::fmt;
use std::io::{Read, Write};

use log::trace;
use url::Url;

use crate::net::NetworkStream;
use crate::Protocol;

/// How a connection reaches the origin.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Proxy {
    /// No proxy: connect straight to the origin.
    Direct,
    /// An HTTP proxy. Requests are sent in absolute form, or tunnelled
    /// with CONNECT for HTTPS.
    Http(String, u16),
    /// A SOCKS proxy.
    Socks(String, u16),
}

impl Proxy {
    /// Whether this proxy relays at the HTTP layer.
    pub fn is_http(&self) -> bool {
        matches!(*self, Proxy::Http(..))
    }

    /// Whether traffic goes straight to the origin.
    pub fn is_direct(&self) -> bool {
        matches!(*self, Proxy::Direct)
    }
}

/// Chooses proxies for a URL.
///
/// The selector's output is tried in order, followed by a direct
/// connection. Implementations may consult host environment conventions
/// such as `http_proxy`; the library itself never does.
pub trait ProxySelector: Send + Sync {
    /// The proxies to attempt for `url`, in preference order.
    fn select(&self, url: &Url) -> Vec<Proxy>;

    /// Observes that `proxy` failed for `url`, so the selector can demote
    /// it in future selections.
    fn connect_failed(&self, url: &Url, proxy: &Proxy, error: &crate::Error);
}

/// The default selector: no proxies, connect directly.
#[derive(Debug, Default)]
pub struct DirectSelector;

impl ProxySelector for DirectSelector {
    fn select(&self, _url: &Url) -> Vec<Proxy> {
        Vec::new()
    }

    fn connect_failed(&self, _url: &Url, _proxy: &Proxy, _error: &crate::Error) {}
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Proxy::Direct => f.write_str("DIRECT"),
            Proxy::Http(ref host, port) => write!(f, "HTTP {}:{}", host, port),
            Proxy::Socks(ref host, port) => write!(f, "SOCKS {}:{}", host, port),
        }
    }
}

/// Establishes a CONNECT tunnel to `host:port` through an already opened
/// proxy stream, so TLS can run end to end through the proxy.
pub(crate) fn create_tunnel(
    stream: &mut (dyn NetworkStream + Send),
    host: &str,
    port: u16,
) -> crate::Result<()> {
    trace!("CONNECT {}:{}", host, port);
    write!(
        stream,
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n",
        host = host,
        port = port
    )
    .map_err(crate::Error::new_route)?;
    stream.flush().map_err(crate::Error::new_route)?;

    let mut buf = [0; 1024];
    let mut n = 0;
    while n < buf.len() {
        let read = stream.read(&mut buf[n..]).map_err(crate::Error::new_route)?;
        if read == 0 {
            return Err(crate::Error::new_route(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "proxy closed the stream during CONNECT",
            )));
        }
        n += read;
        let mut headers = [httparse::EMPTY_HEADER; 16];
        let mut response = httparse::Response::new(&mut headers);
        let parsed = response
            .parse(&buf[..n])
            .map_err(crate::Error::new_route)?;
        if parsed.is_complete() {
            let code = response.code.expect("complete response has a code");
            if (200..300).contains(&code) {
                trace!("CONNECT succeeded: {}", code);
                return Ok(());
            }
            return Err(crate::Error::new_route(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("proxy refused CONNECT with status {}", code),
            )));
        }
    }
    Err(crate::Error::new_route(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "proxy CONNECT response too large",
    )))
}

/// ALPN-style protocol preferences offered during connection setup.
pub(crate) fn negotiated_protocol(offered: &[Protocol], alpn: Option<&str>) -> Protocol {
    match alpn {
        Some("h2") if offered.contains(&Protocol::Http2) => Protocol::Http2,
        Some("http/1.0") => Protocol::Http10,
        _ => Protocol::Http11,
    }
}

#[cfg(test)]
mod tests {
    use super::{create_tunnel, Proxy};
    use crate::mock::MockStream;

    #[test]
    fn tunnel_accepts_2xx() {
        let mut stream = MockStream::with_input(b"HTTP/1.1 200 Connection Established\r\n\r\n");
        create_tunnel(&mut stream, "example.com", 443).unwrap();
        let written = stream.written();
        let text = std::str::from_utf8(&written).unwrap();
        assert!(text.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com:443\r\n"));
    }

    #[test]
    fn tunnel_rejects_non_2xx() {
        let mut stream = MockStream::with_input(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n");
        let err = create_tunnel(&mut stream, "example.com", 443).unwrap_err();
        assert!(err.is_route());
    }

    #[test]
    fn proxy_display() {
        assert_eq!(Proxy::Direct.to_string(), "DIRECT");
        assert_eq!(Proxy::Http("p".into(), 8080).to_string(), "HTTP p:8080");
    }
}
