//! Client responses.

use std::fmt;

use crate::body::ResponseBody;
use crate::headers::Headers;
use crate::net::Handshake;
use crate::request::Request;
use crate::Protocol;

/// An HTTP response: an immutable skeleton plus a one-shot body.
pub struct Response {
    request: Request,
    protocol: Protocol,
    code: u16,
    message: String,
    handshake: Option<Handshake>,
    headers: Headers,
    body: Option<ResponseBody>,
    network_response: Option<Box<Response>>,
    cache_response: Option<Box<Response>>,
    prior_response: Option<Box<Response>>,
    sent_at: u64,
    received_at: u64,
}

impl Response {
    /// The request that initiated this response. After redirects or
    /// authorization challenges this differs from the original request.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The protocol the response was spoken in.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The numeric status code.
    pub fn code(&self) -> u16 {
        self.code
    }

    /// The HTTP status message, like `"OK"`.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns true for codes in `[200, 300)`.
    pub fn is_successful(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// The TLS session this response arrived over, if any.
    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    /// The response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The last value of `name`, ignoring ASCII case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Metadata of the body, without consuming it.
    pub fn body(&self) -> Option<&ResponseBody> {
        self.body.as_ref()
    }

    /// Takes the one-shot body. Subsequent calls return `None`.
    pub fn take_body(&mut self) -> Option<ResponseBody> {
        self.body.take()
    }

    /// The raw response from the wire, if the network was consulted.
    /// Carries no body.
    pub fn network_response(&self) -> Option<&Response> {
        self.network_response.as_deref()
    }

    /// The stored response this one was composed from, if the cache was
    /// consulted. Carries no body.
    pub fn cache_response(&self) -> Option<&Response> {
        self.cache_response.as_deref()
    }

    /// The response that triggered the follow-up producing this one.
    pub fn prior_response(&self) -> Option<&Response> {
        self.prior_response.as_deref()
    }

    /// Milliseconds since epoch when the request left the client.
    pub fn sent_at(&self) -> u64 {
        self.sent_at
    }

    /// Milliseconds since epoch when the response headers arrived.
    pub fn received_at(&self) -> u64 {
        self.received_at
    }

    /// Returns an editable copy of this response.
    pub fn to_builder(&self) -> ResponseBuilder {
        ResponseBuilder {
            request: Some(self.request.clone()),
            protocol: self.protocol,
            code: Some(self.code),
            message: self.message.clone(),
            handshake: self.handshake.clone(),
            headers: self.headers.clone(),
            body: None,
            network_response: None,
            cache_response: None,
            prior_response: None,
            sent_at: self.sent_at,
            received_at: self.received_at,
        }
    }

    /// A body-less, link-less copy used for back-links.
    pub(crate) fn stripped(&self) -> Response {
        Response {
            request: self.request.clone(),
            protocol: self.protocol,
            code: self.code,
            message: self.message.clone(),
            handshake: self.handshake.clone(),
            headers: self.headers.clone(),
            body: None,
            network_response: None,
            cache_response: None,
            prior_response: None,
            sent_at: self.sent_at,
            received_at: self.received_at,
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("protocol", &self.protocol)
            .field("code", &self.code)
            .field("message", &self.message)
            .field("url", &self.request.url().as_str())
            .finish()
    }
}

/// Assembles a [`Response`].
#[derive(Debug, Default)]
pub struct ResponseBuilder {
    request: Option<Request>,
    protocol: Protocol,
    code: Option<u16>,
    message: String,
    handshake: Option<Handshake>,
    headers: Headers,
    body: Option<ResponseBody>,
    network_response: Option<Box<Response>>,
    cache_response: Option<Box<Response>>,
    prior_response: Option<Box<Response>>,
    sent_at: u64,
    received_at: u64,
}

impl ResponseBuilder {
    /// An empty builder.
    pub fn new() -> ResponseBuilder {
        ResponseBuilder::default()
    }

    /// Sets the request this response answers. Required.
    pub fn request(mut self, request: Request) -> ResponseBuilder {
        self.request = Some(request);
        self
    }

    /// Sets the protocol.
    pub fn protocol(mut self, protocol: Protocol) -> ResponseBuilder {
        self.protocol = protocol;
        self
    }

    /// Sets the status code. Required.
    pub fn code(mut self, code: u16) -> ResponseBuilder {
        self.code = Some(code);
        self
    }

    /// Sets the status message.
    pub fn message(mut self, message: &str) -> ResponseBuilder {
        self.message = message.to_owned();
        self
    }

    /// Sets the TLS session record.
    pub fn handshake(mut self, handshake: Option<Handshake>) -> ResponseBuilder {
        self.handshake = handshake;
        self
    }

    /// Replaces all headers.
    pub fn headers(mut self, headers: Headers) -> ResponseBuilder {
        self.headers = headers;
        self
    }

    /// Sets `name` to exactly `value`, dropping prior lines. Fails when
    /// the line fails header validation.
    pub fn header_set(mut self, name: &str, value: &str) -> crate::Result<ResponseBuilder> {
        let mut builder = self.headers.new_builder();
        builder.set(name, value)?;
        self.headers = builder.build();
        Ok(self)
    }

    /// Appends a header line. Fails when the line fails header
    /// validation.
    pub fn header_added(mut self, name: &str, value: &str) -> crate::Result<ResponseBuilder> {
        let mut builder = self.headers.new_builder();
        builder.add(name, value)?;
        self.headers = builder.build();
        Ok(self)
    }

    /// Removes every line named `name`.
    pub fn header_removed(mut self, name: &str) -> ResponseBuilder {
        let mut builder = self.headers.new_builder();
        builder.remove_all(name);
        self.headers = builder.build();
        self
    }

    /// Attaches the one-shot body.
    pub fn body(mut self, body: Option<ResponseBody>) -> ResponseBuilder {
        self.body = body;
        self
    }

    /// Records the raw network response; stored body-less.
    pub fn network_response(mut self, response: Option<Response>) -> ResponseBuilder {
        self.network_response = response.map(|r| Box::new(r.stripped()));
        self
    }

    /// Records the stored cache response; kept body-less.
    pub fn cache_response(mut self, response: Option<Response>) -> ResponseBuilder {
        self.cache_response = response.map(|r| Box::new(r.stripped()));
        self
    }

    /// Records the response that triggered this one; kept body-less.
    pub fn prior_response(mut self, response: Option<Response>) -> ResponseBuilder {
        self.prior_response = response.map(|r| Box::new(r.stripped()));
        self
    }

    /// Millis since epoch when the request left the client.
    pub fn sent_at(mut self, millis: u64) -> ResponseBuilder {
        self.sent_at = millis;
        self
    }

    /// Millis since epoch when the response headers arrived.
    pub fn received_at(mut self, millis: u64) -> ResponseBuilder {
        self.received_at = millis;
        self
    }

    /// Finishes the response.
    ///
    /// # Panics
    ///
    /// Panics if the request or status code was never set.
    pub fn build(self) -> Response {
        Response {
            request: self.request.expect("response has no request"),
            protocol: self.protocol,
            code: self.code.expect("response has no status code"),
            message: self.message,
            handshake: self.handshake,
            headers: self.headers,
            body: self.body,
            network_response: self.network_response,
            cache_response: self.cache_response,
            prior_response: self.prior_response,
            sent_at: self.sent_at,
            received_at: self.received_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ResponseBuilder;
    use crate::request::Request;

    #[test]
    fn body_is_one_shot() {
        let mut response = ResponseBuilder::new()
            .request(Request::get("http://example.com/").unwrap())
            .code(200)
            .message("OK")
            .body(Some(crate::body::ResponseBody::from_bytes(None, &b"hi"[..])))
            .build();
        assert!(response.take_body().is_some());
        assert!(response.take_body().is_none());
    }

    #[test]
    fn back_links_carry_no_body() {
        let network = ResponseBuilder::new()
            .request(Request::get("http://example.com/").unwrap())
            .code(200)
            .body(Some(crate::body::ResponseBody::from_bytes(None, &b"hi"[..])))
            .build();
        let user = ResponseBuilder::new()
            .request(Request::get("http://example.com/").unwrap())
            .code(200)
            .network_response(Some(network))
            .build();
        assert!(user.network_response().unwrap().body().is_none());
    }
}
