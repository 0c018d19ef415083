//! Client requests.

use std::fmt;
use std::io;
use std::sync::Arc;

use url::Url;

use crate::body::RequestBody;
use crate::headers::Headers;

/// An HTTP request. Immutable once constructed; the engine derives new
/// requests instead of mutating this one.
#[derive(Clone)]
pub struct Request {
    method: String,
    url: Url,
    headers: Headers,
    body: Option<Arc<RequestBody>>,
    tag: Option<String>,
}

impl Request {
    /// Creates a request, validating the method and URL.
    pub fn new(method: &str, url: &str) -> crate::Result<Request> {
        let url = Url::parse(url)?;
        Request::with_url(method, url)
    }

    /// Creates a request from an already parsed URL.
    pub fn with_url(method: &str, url: Url) -> crate::Result<Request> {
        if method.is_empty() {
            return Err(crate::Error::new_request(invalid("method must not be empty")));
        }
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(crate::Error::new_request(invalid(format!(
                    "unexpected scheme: {}",
                    other
                ))));
            }
        }
        if url.host_str().is_none() {
            return Err(crate::Error::new_request(invalid("URL has no host")));
        }
        Ok(Request {
            method: method.to_owned(),
            url,
            headers: Headers::default(),
            body: None,
            tag: None,
        })
    }

    /// Shorthand for a GET request.
    pub fn get(url: &str) -> crate::Result<Request> {
        Request::new("GET", url)
    }

    /// The request method verb.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The target URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The caller-supplied headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The last value of `name`, ignoring ASCII case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// The request body, if any.
    pub fn body(&self) -> Option<&RequestBody> {
        self.body.as_deref()
    }

    pub(crate) fn body_arc(&self) -> Option<&Arc<RequestBody>> {
        self.body.as_ref()
    }

    /// The cancellation-grouping tag, if any.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Returns this request with `body` attached.
    pub fn body_set(mut self, body: RequestBody) -> Request {
        self.body = Some(Arc::new(body));
        self
    }

    /// Returns this request with a header line appended, or the error
    /// when the line fails header validation.
    pub fn header_added(mut self, name: &str, value: &str) -> crate::Result<Request> {
        let mut builder = self.headers.new_builder();
        builder.add(name, value)?;
        self.headers = builder.build();
        Ok(self)
    }

    /// Returns this request with `name` set to exactly `value`, or the
    /// error when the line fails header validation.
    pub fn header_set(mut self, name: &str, value: &str) -> crate::Result<Request> {
        let mut builder = self.headers.new_builder();
        builder.set(name, value)?;
        self.headers = builder.build();
        Ok(self)
    }

    /// Returns this request tagged for group cancellation.
    pub fn tag_set(mut self, tag: &str) -> Request {
        self.tag = Some(tag.to_owned());
        self
    }

    /// Whether the target scheme is `https`.
    pub fn is_https(&self) -> bool {
        self.url.scheme() == "https"
    }

    pub(crate) fn host(&self) -> &str {
        self.url.host_str().expect("validated at construction")
    }

    /// Explicit port, else the scheme default.
    pub(crate) fn effective_port(&self) -> u16 {
        effective_port(&self.url)
    }

    /// The `Host` header value: `host`, or `host:port` when the port is
    /// not the scheme default.
    pub(crate) fn host_header(&self) -> String {
        match self.url.port() {
            Some(port) if Some(port) != default_port(self.url.scheme()) => {
                format!("{}:{}", self.host(), port)
            }
            _ => self.host().to_owned(),
        }
    }

    /// The request-target: path plus optional query.
    pub(crate) fn request_path(&self) -> String {
        let mut target = self.url.path().to_owned();
        if let Some(query) = self.url.query() {
            target.push('?');
            target.push_str(query);
        }
        target
    }

    /// Whether the caller supplied their own validator headers.
    pub(crate) fn has_conditions(&self) -> bool {
        self.headers.get("If-Modified-Since").is_some()
            || self.headers.get("If-None-Match").is_some()
    }

    /// A copy of this request with different headers, same everything else.
    pub(crate) fn headers_replaced(&self, headers: Headers) -> Request {
        Request {
            method: self.method.clone(),
            url: self.url.clone(),
            headers,
            body: self.body.clone(),
            tag: self.tag.clone(),
        }
    }

    /// A copy redirected to `url` with `method`, keeping the tag. Headers
    /// and body are supplied by the follow-up logic.
    pub(crate) fn redirected(
        &self,
        method: &str,
        url: Url,
        headers: Headers,
        body: Option<Arc<RequestBody>>,
    ) -> Request {
        Request {
            method: method.to_owned(),
            url,
            headers,
            body,
            tag: self.tag.clone(),
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .field("tag", &self.tag)
            .finish()
    }
}

pub(crate) fn effective_port(url: &Url) -> u16 {
    url.port()
        .or_else(|| default_port(url.scheme()))
        .unwrap_or(80)
}

pub(crate) fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

fn invalid<E: Into<String>>(message: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message.into())
}

#[cfg(test)]
mod tests {
    use super::Request;

    #[test]
    fn rejects_unknown_scheme() {
        assert!(Request::get("ftp://example.com/").is_err());
    }

    #[test]
    fn rejects_empty_method() {
        assert!(Request::new("", "http://example.com/").is_err());
    }

    #[test]
    fn host_header_includes_only_non_default_ports() {
        let plain = Request::get("http://example.com/").unwrap();
        assert_eq!(plain.host_header(), "example.com");
        assert_eq!(plain.effective_port(), 80);

        let secure = Request::get("https://example.com/").unwrap();
        assert_eq!(secure.effective_port(), 443);

        let odd = Request::get("http://example.com:8080/").unwrap();
        assert_eq!(odd.host_header(), "example.com:8080");
    }

    #[test]
    fn request_path_carries_query() {
        let request = Request::get("http://example.com/search?q=x&n=2").unwrap();
        assert_eq!(request.request_path(), "/search?q=x&n=2");
    }
}
