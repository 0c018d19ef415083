//! The request engine: owns one request/response exchange end to end.
//!
//! An engine takes the user's request through cache consultation,
//! connection acquisition, the network exchange, transparent decoding,
//! and produces the user-visible response. Authentication and redirect
//! follow-ups, and recovery onto the next route, are driven from the
//! [`Call`](crate::client::Call) loop, which hands the surviving
//! [`RouteSelector`] from one engine to the next.

use std::io::{self, Read};
use std::sync::Arc;

use log::{debug, trace};

use crate::body::{gunzipped, RequestBody, ResponseBody};
use crate::cache::strategy::{date_header_millis, is_cacheable, CacheStrategy};
use crate::cache::{combine_headers, CacheRequest};
use crate::client::interceptor::{Chain, Interceptor, NetworkChain};
use crate::client::pool::Connection;
use crate::client::proxy::{create_tunnel, negotiated_protocol, Proxy};
use crate::client::route::{Address, Route, RouteSelector};
use crate::client::{CallState, Client};
use crate::headers::Headers;
use crate::net::Handshake;
use crate::request::{effective_port, Request};
use crate::response::{Response, ResponseBuilder};
use crate::transport::Transport;
use crate::{now_millis, Protocol};

/// Extension header recording when the request left the client,
/// preserved by the cache for age computation.
pub(crate) const SENT_MILLIS: &str = "Carrier-Sent-Millis";
/// Extension header recording when the response headers arrived.
pub(crate) const RECEIVED_MILLIS: &str = "Carrier-Received-Millis";

pub(crate) struct Engine {
    client: Client,
    user_request: Request,
    network_request: Option<Request>,
    strategy_computed: bool,
    transparent_gzip: bool,
    cache_candidate: Option<Response>,
    cache_response: Option<Response>,
    user_response: Option<Response>,
    prior_response: Option<Response>,
    transport: Option<Box<dyn Transport>>,
    route_selector: Option<RouteSelector>,
    route: Option<Route>,
    handshake: Option<Handshake>,
    connection_recycled: bool,
    sent_at: u64,
    call_state: Arc<CallState>,
}

impl Engine {
    pub(crate) fn new(
        client: Client,
        user_request: Request,
        call_state: Arc<CallState>,
        route_selector: Option<RouteSelector>,
        prior_response: Option<Response>,
    ) -> Engine {
        Engine {
            client,
            user_request,
            network_request: None,
            strategy_computed: false,
            transparent_gzip: false,
            cache_candidate: None,
            cache_response: None,
            user_response: None,
            prior_response,
            transport: None,
            route_selector,
            route: None,
            handshake: None,
            connection_recycled: false,
            sent_at: 0,
            call_state,
        }
    }

    /// Consults the cache and, if the network is needed, acquires a
    /// connection. Idempotent.
    pub(crate) fn send_request(&mut self) -> crate::Result<()> {
        if self.strategy_computed {
            return Ok(());
        }
        if self.call_state.is_canceled() {
            return Err(crate::Error::new_canceled());
        }

        let network_request = self.derive_network_request()?;
        let candidate = match self.client.cache() {
            Some(cache) => cache.get(&network_request),
            None => None,
        };
        self.cache_candidate = candidate;

        let candidate_meta = self.cache_candidate.as_ref().map(Response::stripped);
        let strategy = CacheStrategy::compute(now_millis(), &network_request, candidate_meta);
        if let Some(cache) = self.client.cache() {
            cache.track_response(&strategy);
        }
        self.strategy_computed = true;
        self.network_request = strategy.network_request;
        self.cache_response = strategy.cache_response;
        trace!(
            "cache strategy: network={} cache={}",
            self.network_request.is_some(),
            self.cache_response.is_some()
        );

        if self.cache_candidate.is_some() && self.cache_response.is_none() {
            // The candidate is unusable; close its body.
            if let Some(mut candidate) = self.cache_candidate.take() {
                drop(candidate.take_body());
            }
        }

        if self.network_request.is_some() {
            if self.transport.is_none() {
                self.connect()?;
            }
            return Ok(());
        }

        // No network permitted: answer from the cache, or refuse.
        let user_response = match self.cache_response.take() {
            Some(cache_response) => {
                let body = self
                    .cache_candidate
                    .as_mut()
                    .and_then(Response::take_body);
                let (headers, body) = self.maybe_unzip(cache_response.headers().clone(), body);
                cache_response
                    .to_builder()
                    .request(self.user_request.clone())
                    .headers(headers)
                    .cache_response(Some(cache_response.stripped()))
                    .prior_response(self.prior_response.take())
                    .body(body)
                    .build()
            }
            None => {
                let now = now_millis();
                ResponseBuilder::new()
                    .request(self.user_request.clone())
                    .protocol(Protocol::Http11)
                    .code(504)
                    .message("Unsatisfiable Request (only-if-cached)")
                    .sent_at(now)
                    .received_at(now)
                    .body(Some(ResponseBody::empty()))
                    .build()
            }
        };
        self.user_response = Some(user_response);
        Ok(())
    }

    /// Flushes the request, reads the response, merges with the cache and
    /// applies transparent decoding. No-op when `send_request` already
    /// produced the response.
    pub(crate) fn read_response(&mut self) -> crate::Result<()> {
        if self.user_response.is_some() {
            return Ok(());
        }
        if self.call_state.is_canceled() {
            return Err(crate::Error::new_canceled());
        }
        let network_request = self
            .network_request
            .clone()
            .expect("send_request must run first");

        let mut network_response = {
            let mut chain = NetworkChain::new(self, network_request.clone());
            chain.proceed(network_request.clone())?
        };

        // Cookies travel to the jar no matter what happens next.
        let set_cookies: Vec<String> = network_response
            .headers()
            .values("Set-Cookie")
            .into_iter()
            .map(str::to_owned)
            .collect();
        if !set_cookies.is_empty() {
            self.client
                .cookie_jar()
                .save(network_request.url(), &set_cookies);
        }

        if let Some(cached) = self.cache_response.take() {
            if validate(&cached, &network_response) {
                debug!("conditional cache hit for {}", network_request.url());
                drop(network_response.take_body());
                let network_meta = network_response;
                let combined = combine_headers(cached.headers(), network_meta.headers());
                let body = self
                    .cache_candidate
                    .as_mut()
                    .and_then(Response::take_body);

                let user_meta = cached
                    .to_builder()
                    .request(self.user_request.clone())
                    .headers(combined)
                    .sent_at(network_meta.sent_at())
                    .received_at(network_meta.received_at())
                    .build();
                if let Some(cache) = self.client.cache() {
                    cache.track_conditional_cache_hit();
                    cache.update(&cached, &user_meta);
                }

                let (headers, body) = self.maybe_unzip(user_meta.headers().clone(), body);
                self.user_response = Some(
                    user_meta
                        .to_builder()
                        .headers(headers)
                        .cache_response(Some(cached))
                        .network_response(Some(network_meta))
                        .prior_response(self.prior_response.take())
                        .body(body)
                        .build(),
                );
                return Ok(());
            }
            // The stored response lost the race; drop its body.
            if let Some(mut candidate) = self.cache_candidate.take() {
                drop(candidate.take_body());
            }
        }

        let body = network_response.take_body();
        let network_meta = network_response;

        let user_meta = network_meta
            .to_builder()
            .request(self.user_request.clone())
            .build();

        let mut body = body;
        if let Some(cache) = self.client.cache() {
            if invalidates_cache(network_request.method()) {
                cache.remove(&network_request);
            } else if body.is_some() && is_cacheable(&user_meta, &network_request) {
                if let Some(cache_request) = cache.put(&user_meta) {
                    trace!("teeing response body into the cache");
                    body = body.map(|b| tee_to_cache(b, cache_request));
                }
            }
        }

        let (headers, body) = self.maybe_unzip(user_meta.headers().clone(), body);
        self.user_response = Some(
            user_meta
                .to_builder()
                .headers(headers)
                .network_response(Some(network_meta))
                .prior_response(self.prior_response.take())
                .body(body)
                .build(),
        );
        Ok(())
    }

    /// The terminal link of the interceptor chain: one wire exchange.
    pub(crate) fn transact(&mut self, request: Request) -> crate::Result<Response> {
        self.sent_at = now_millis();
        let transport = self.transport.as_mut().expect("connect must run first");

        transport.write_request_headers(&request)?;
        if let Some(body) = request.body() {
            if permits_request_body(request.method()) {
                write_request_body(transport.as_mut(), &request, body)?;
            }
        }
        transport.finish_request()?;

        let mut head = transport.read_response_headers()?;
        let received_at = now_millis();

        if head.code == 204 || head.code == 205 {
            if let Some(len) = head.headers.get("Content-Length") {
                if len.trim().parse::<u64>().unwrap_or(0) > 0 {
                    return Err(crate::Error::new_protocol(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("HTTP {} had non-zero Content-Length: {}", head.code, len),
                    )));
                }
            }
        }

        // Stamp the exchange times so the cache can compute ages later.
        let mut headers = head.headers.new_builder();
        headers.set(SENT_MILLIS, &self.sent_at.to_string())?;
        headers.set(RECEIVED_MILLIS, &received_at.to_string())?;
        head.headers = headers.build();

        let builder = ResponseBuilder::new()
            .request(request.clone())
            .protocol(head.protocol)
            .code(head.code)
            .message(&head.message)
            .handshake(self.handshake.clone())
            .headers(head.headers.clone())
            .sent_at(self.sent_at)
            .received_at(received_at);

        let transport = self.transport.take().expect("transport present");
        let body = if has_response_body(request.method(), head.code) {
            transport.open_response_body(&request, &head)?
        } else {
            transport.release_connection_on_idle();
            ResponseBody::empty()
        };
        Ok(builder.body(Some(body)).build())
    }

    /// Computes the follow-up for the final response: an authenticated
    /// retry, a redirect, or nothing.
    pub(crate) fn follow_up_request(&mut self) -> crate::Result<Option<Request>> {
        let response = self.user_response.as_ref().expect("response not ready");
        let code = response.code();
        let request = response.request().clone();
        let method = request.method().to_owned();
        let proxy = self
            .route
            .as_ref()
            .map(|r| r.proxy().clone())
            .or_else(|| self.client.proxy().cloned())
            .unwrap_or(Proxy::Direct);

        match code {
            401 | 407 => {
                if code == 407 && !proxy.is_http() {
                    return Err(crate::Error::new_protocol(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "received HTTP_PROXY_AUTH (407) code while not using an HTTP proxy",
                    )));
                }
                Ok(self.client.authenticator().authenticate(&proxy, response))
            }
            300 | 301 | 302 | 303 | 307 | 308 => {
                if !self.client.follow_redirects() {
                    return Ok(None);
                }
                // 307 and 308 must not rewrite the method, so only the
                // body-less methods are followed.
                if (code == 307 || code == 308) && method != "GET" && method != "HEAD" {
                    return Ok(None);
                }
                let location = match response.header("Location") {
                    Some(location) => location,
                    None => return Ok(None),
                };
                let url = match request.url().join(location) {
                    Ok(url) => url,
                    Err(_) => return Ok(None),
                };
                match url.scheme() {
                    "http" | "https" => {}
                    _ => return Ok(None),
                }
                if url.scheme() != request.url().scheme() && !self.client.follow_ssl_redirects() {
                    return Ok(None);
                }

                let mut headers = request.headers().new_builder();
                let mut next_method = method.clone();
                let mut body = request.body_arc().cloned();
                if permits_request_body(&method) {
                    next_method = "GET".to_owned();
                    body = None;
                    headers.remove_all("Transfer-Encoding");
                    headers.remove_all("Content-Length");
                    headers.remove_all("Content-Type");
                }

                let same_connection = url.host_str() == Some(request.host())
                    && effective_port(&url) == request.effective_port()
                    && url.scheme() == request.url().scheme();
                if !same_connection {
                    // Credentials must not leak across origins.
                    headers.remove_all("Authorization");
                }

                Ok(Some(request.redirected(
                    &next_method,
                    url,
                    headers.build(),
                    body,
                )))
            }
            _ => Ok(None),
        }
    }

    /// Attempts to carry on after `error` with a fresh engine on the next
    /// route, or surfaces the error when retrying cannot help.
    pub(crate) fn recover(mut self, error: crate::Error) -> crate::Result<Engine> {
        if error.is_recoverable() {
            if let (Some(selector), Some(route)) =
                (self.route_selector.as_mut(), self.route.as_ref())
            {
                // A connection that already served traffic failing now
                // says nothing about the route itself.
                if !self.connection_recycled {
                    selector.connect_failed(route, &error);
                }
            }
        }

        let replayable = match self.user_request.body() {
            None => true,
            // A route failure happens before any body byte is written.
            Some(body) => body.is_replayable() || error.is_route(),
        };
        let has_routes = self
            .route_selector
            .as_ref()
            .map(RouteSelector::has_next)
            .unwrap_or(false);

        if !error.is_recoverable()
            || !self.client.retry_on_connection_failure()
            || !replayable
            || !has_routes
        {
            return Err(error);
        }

        debug!("recovering from: {}", error);
        Ok(Engine::new(
            self.client.clone(),
            self.user_request.clone(),
            Arc::clone(&self.call_state),
            self.route_selector.take(),
            self.prior_response.take(),
        ))
    }

    /// Takes the finished user response.
    pub(crate) fn into_response(mut self) -> Response {
        self.user_response.take().expect("response not ready")
    }

    pub(crate) fn network_interceptor(&self, index: usize) -> Option<Arc<dyn Interceptor>> {
        self.client.network_interceptors().get(index).cloned()
    }

    pub(crate) fn connected_host_port(&self) -> Option<(String, u16)> {
        self.route
            .as_ref()
            .map(|r| (r.address().host().to_owned(), r.address().port()))
    }

    /// Applies the injected request headers the user left out. Fails if
    /// an injected collaborator (cookie jar, user agent, body metadata)
    /// supplies a value that is not a valid header.
    fn derive_network_request(&mut self) -> crate::Result<Request> {
        let user = &self.user_request;
        let mut headers = user.headers().new_builder();

        if headers.get("Host").is_none() {
            headers.set("Host", &user.host_header())?;
        }
        if headers.get("Connection").is_none() {
            headers.set("Connection", "Keep-Alive")?;
        }
        if headers.get("Accept-Encoding").is_none() {
            // The engine owns decoding when it asked for the encoding.
            self.transparent_gzip = true;
            headers.set("Accept-Encoding", "gzip")?;
        }
        let cookies = self.client.cookie_jar().load(user.url());
        if !cookies.is_empty() {
            let line = cookies
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect::<Vec<_>>()
                .join("; ");
            headers.set("Cookie", &line)?;
        }
        if headers.get("User-Agent").is_none() {
            headers.set("User-Agent", self.client.user_agent())?;
        }

        if let Some(body) = user.body() {
            if let Some(content_type) = body.content_type() {
                headers.set("Content-Type", content_type)?;
            }
            match body.content_length() {
                Some(len) => {
                    headers.set("Content-Length", &len.to_string())?;
                    headers.remove_all("Transfer-Encoding");
                }
                None => {
                    headers.set("Transfer-Encoding", "chunked")?;
                    headers.remove_all("Content-Length");
                }
            }
        }

        let network_request = user.headers_replaced(headers.build());
        self.network_request = Some(network_request.clone());
        Ok(network_request)
    }

    /// Prefers a pooled connection; otherwise opens the selector's next
    /// route. Wraps the result in a transport.
    fn connect(&mut self) -> crate::Result<()> {
        let request = self
            .network_request
            .clone()
            .expect("network request required to connect");
        let address = self.create_address(&request)?;

        if self.route_selector.is_none() {
            self.route_selector = Some(RouteSelector::new(
                address.clone(),
                request.url().clone(),
                self.client.dns(),
                self.client.route_database(),
            ));
        }

        let is_get = request.method() == "GET";
        let connection = match self.client.pool().get(&address, is_get) {
            Some(connection) => connection,
            None => {
                let route = self
                    .route_selector
                    .as_mut()
                    .expect("selector initialized above")
                    .next()?;
                self.route = Some(route.clone());
                self.connect_route(&route)?
            }
        };

        if let Ok(handle) = connection.duplicate_stream() {
            self.call_state.set_stream(handle);
        }
        self.route = Some(connection.route().clone());
        self.connection_recycled = connection.was_recycled();
        self.handshake = connection.handshake().cloned();
        self.transport = Some(match connection.protocol() {
            Protocol::Http2 => {
                // The HTTP/2 driver plugs in from outside this crate;
                // nothing registered one for this connection.
                return Err(crate::Error::new_protocol(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "h2 was negotiated but no HTTP/2 transport is available",
                )));
            }
            _ => Box::new(crate::http1::Http1Transport::new(
                connection,
                self.client.read_timeout(),
            )),
        });
        Ok(())
    }

    /// Opens the socket for `route`, tunnels and handshakes as the route
    /// requires.
    fn connect_route(&self, route: &Route) -> crate::Result<Connection> {
        let client = &self.client;
        let mut stream = client.connector().connect(route, client.connect_timeout())?;
        stream
            .set_read_timeout(client.read_timeout())
            .map_err(crate::Error::new_route)?;
        stream
            .set_write_timeout(client.write_timeout())
            .map_err(crate::Error::new_route)?;

        if route.requires_tunnel() {
            create_tunnel(&mut *stream, route.address().host(), route.address().port())?;
        }

        let (stream, handshake, protocol) = match route.address().tls_client() {
            Some(tls) => {
                let (stream, handshake) = tls.wrap_client(
                    stream,
                    route.address().host(),
                    route.address().certificate_pins(),
                )?;
                let protocol =
                    negotiated_protocol(route.address().protocols(), handshake.alpn_protocol.as_deref());
                (stream, Some(handshake), protocol)
            }
            None => (stream, None, Protocol::Http11),
        };

        let mut connection = Connection::new(route.clone(), stream, protocol, handshake);
        client.pool().adopt(&mut connection);
        client.route_database().connected(route);
        Ok(connection)
    }

    fn create_address(&self, request: &Request) -> crate::Result<Address> {
        let client = &self.client;
        let tls = if request.is_https() {
            match client.tls_client() {
                Some(tls) => Some(tls),
                None => {
                    return Err(crate::Error::new_request(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "no TLS client configured for an https request",
                    )));
                }
            }
        } else {
            None
        };
        Ok(Address::new(
            request.host(),
            request.effective_port(),
            tls,
            client.certificate_pins().to_vec(),
            client.authenticator(),
            client.protocols().to_vec(),
            client.connection_specs().to_vec(),
            client.proxy().cloned(),
            client.proxy_selector(),
        ))
    }

    /// Unwraps a gzip body the engine itself asked for, dropping the
    /// headers that no longer describe the decoded bytes.
    fn maybe_unzip(
        &self,
        headers: Headers,
        body: Option<ResponseBody>,
    ) -> (Headers, Option<ResponseBody>) {
        let gzipped = headers
            .get("Content-Encoding")
            .map(|v| v.eq_ignore_ascii_case("gzip"))
            .unwrap_or(false);
        if !self.transparent_gzip || !gzipped {
            return (headers, body);
        }
        let Some(body) = body else {
            return (headers, None);
        };
        trace!("unzipping response body");
        let mut builder = headers.new_builder();
        builder.remove_all("Content-Encoding");
        builder.remove_all("Content-Length");
        (builder.build(), Some(gunzipped(body)))
    }
}

/// Whether a 304, or a fresher `Last-Modified` on the stored entry,
/// lets the cached response stand in for the network one.
fn validate(cached: &Response, network: &Response) -> bool {
    if network.code() == 304 {
        return true;
    }
    if let Some(cached_modified) = date_header_millis(cached.headers(), "Last-Modified") {
        if let Some(network_modified) = date_header_millis(network.headers(), "Last-Modified") {
            if network_modified < cached_modified {
                return true;
            }
        }
    }
    false
}

pub(crate) fn permits_request_body(method: &str) -> bool {
    method != "GET" && method != "HEAD"
}

fn invalidates_cache(method: &str) -> bool {
    matches!(method, "POST" | "PUT" | "DELETE" | "PATCH" | "MOVE")
}

/// RFC 7230 §3.3.3: HEAD responses and 1xx/204/304 never carry a body,
/// whatever their headers claim.
fn has_response_body(method: &str, code: u16) -> bool {
    if method == "HEAD" {
        return false;
    }
    !((100..200).contains(&code) || code == 204 || code == 304)
}

fn write_request_body(
    transport: &mut dyn Transport,
    request: &Request,
    body: &RequestBody,
) -> crate::Result<()> {
    if let Some(bytes) = body.as_bytes() {
        // Replayable: buffered in full, written in one shot.
        transport.create_request_body(request, Some(bytes.len() as u64))?;
        transport.write_request_body(bytes)?;
        return Ok(());
    }
    let mut source = match body.take_stream() {
        Some(source) => source,
        None => {
            return Err(crate::Error::new_request(io::Error::new(
                io::ErrorKind::InvalidInput,
                "request body stream was already consumed",
            )));
        }
    };
    transport.create_request_body(request, body.content_length())?;
    let sink = transport
        .request_sink()
        .expect("create_request_body provides a sink");
    copy_body(&mut source, sink)?;
    Ok(())
}

fn copy_body(source: &mut (dyn Read + Send), sink: &mut (dyn std::io::Write + Send)) -> io::Result<()> {
    let mut buf = [0u8; 8 * 1024];
    loop {
        let n = source.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        sink.write_all(&buf[..n])?;
    }
}

/// Copies body bytes into the cache as the application reads them,
/// aborting the cache write if either side fails.
fn tee_to_cache(body: ResponseBody, cache_request: Box<dyn CacheRequest>) -> ResponseBody {
    body.map_source(|source| {
        Box::new(CacheWritingSource {
            source,
            cache_request: Some(cache_request),
            done: false,
        })
    })
}

struct CacheWritingSource {
    source: Box<dyn Read + Send>,
    cache_request: Option<Box<dyn CacheRequest>>,
    done: bool,
}

impl Read for CacheWritingSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = match self.source.read(buf) {
            Ok(n) => n,
            Err(err) => {
                if let Some(mut pending) = self.cache_request.take() {
                    pending.abort();
                }
                return Err(err);
            }
        };
        if n == 0 {
            self.done = true;
            // EOF finalizes the write: dropping without abort commits.
            self.cache_request.take();
            return Ok(0);
        }
        let write_failed = match self.cache_request {
            Some(ref mut pending) => pending.body().write_all(&buf[..n]).is_err(),
            None => false,
        };
        if write_failed {
            // The cache failed; the application need not care.
            if let Some(mut pending) = self.cache_request.take() {
                pending.abort();
            }
        }
        Ok(n)
    }
}

impl Drop for CacheWritingSource {
    fn drop(&mut self) {
        if !self.done {
            if let Some(mut pending) = self.cache_request.take() {
                pending.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{has_response_body, permits_request_body};

    #[test]
    fn bodiless_codes_and_methods() {
        assert!(!has_response_body("GET", 204));
        assert!(!has_response_body("GET", 304));
        assert!(!has_response_body("GET", 100));
        assert!(!has_response_body("HEAD", 200));
        assert!(has_response_body("GET", 200));
        assert!(has_response_body("POST", 201));
    }

    #[test]
    fn body_permissions() {
        assert!(!permits_request_body("GET"));
        assert!(!permits_request_body("HEAD"));
        assert!(permits_request_body("POST"));
        assert!(permits_request_body("DELETE"));
    }
}
