//! The client: configuration, calls, and the follow-up loop.

use std::fmt;
use std::io;
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;

use crate::cache::Cache;
use crate::client::auth::{Authenticator, NoAuthenticator};
use crate::client::cookie::{CookieJar, NoCookies};
use crate::client::dispatcher::Dispatcher;
use crate::client::dns::{Dns, SystemDns};
use crate::client::engine::Engine;
use crate::client::interceptor::Interceptor;
use crate::client::pool::ConnectionPool;
use crate::client::proxy::{DirectSelector, Proxy, ProxySelector};
use crate::client::route::{ConnectionSpec, RouteDatabase};
use crate::net::{HttpConnector, NetworkConnector, NetworkStream, TlsClient};
use crate::request::Request;
use crate::response::Response;
use crate::Protocol;

pub mod auth;
pub mod cookie;
pub mod dispatcher;
pub mod dns;
pub(crate) mod engine;
pub mod interceptor;
pub mod pool;
pub mod proxy;
pub mod route;


/// Redirect and authorization chains stop after this many follow-ups.
const MAX_FOLLOW_UPS: usize = 20;

/// Everything a [`Client`] is built from. All collaborators are injected
/// here; the crate keeps no global state.
pub struct Config {
    /// Socket connect deadline, `None` to block indefinitely.
    pub connect_timeout: Option<Duration>,
    /// Per-read socket deadline.
    pub read_timeout: Option<Duration>,
    /// Per-write socket deadline.
    pub write_timeout: Option<Duration>,
    /// Follow 3xx redirects.
    pub follow_redirects: bool,
    /// Follow redirects that cross between http and https.
    pub follow_ssl_redirects: bool,
    /// Retry requests on a fresh route after connection failures.
    pub retry_on_connection_failure: bool,
    /// Value injected as `User-Agent` when the request has none.
    pub user_agent: String,
    /// An explicit proxy, overriding the selector.
    pub proxy: Option<Proxy>,
    /// Consulted per-URL when no explicit proxy is set.
    pub proxy_selector: Arc<dyn ProxySelector>,
    /// Host name resolution.
    pub dns: Arc<dyn Dns>,
    /// Answers 401 and 407 challenges.
    pub authenticator: Arc<dyn Authenticator>,
    /// Supplies and receives cookies.
    pub cookie_jar: Arc<dyn CookieJar>,
    /// The response cache, if any.
    pub cache: Option<Arc<dyn Cache>>,
    /// Opens sockets.
    pub connector: Arc<dyn NetworkConnector>,
    /// Wraps sockets in TLS for https origins.
    pub tls_client: Option<Arc<dyn TlsClient>>,
    /// Pinned certificate fingerprints.
    pub certificate_pins: Vec<String>,
    /// Application protocols to offer, in preference order.
    pub protocols: Vec<Protocol>,
    /// TLS flavors to offer, in preference order.
    pub connection_specs: Vec<ConnectionSpec>,
    /// Observers of each network exchange.
    pub network_interceptors: Vec<Arc<dyn Interceptor>>,
    /// The connection pool, shareable between clients.
    pub pool: ConnectionPool,
    /// The async call scheduler, shareable between clients.
    pub dispatcher: Dispatcher,
    /// Shared memory of recently failed routes.
    pub route_database: Arc<RouteDatabase>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            connect_timeout: Some(Duration::from_secs(10)),
            read_timeout: Some(Duration::from_secs(10)),
            write_timeout: Some(Duration::from_secs(10)),
            follow_redirects: true,
            follow_ssl_redirects: true,
            retry_on_connection_failure: true,
            user_agent: crate::default_user_agent(),
            proxy: None,
            proxy_selector: Arc::new(DirectSelector),
            dns: Arc::new(SystemDns),
            authenticator: Arc::new(NoAuthenticator),
            cookie_jar: Arc::new(NoCookies),
            cache: None,
            connector: Arc::new(HttpConnector),
            tls_client: None,
            certificate_pins: Vec::new(),
            protocols: vec![Protocol::Http11],
            connection_specs: vec![ConnectionSpec::ModernTls, ConnectionSpec::Cleartext],
            network_interceptors: Vec::new(),
            pool: ConnectionPool::new(),
            dispatcher: Dispatcher::new(),
            route_database: Arc::new(RouteDatabase::new()),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("follow_redirects", &self.follow_redirects)
            .field("proxy", &self.proxy)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

/// An HTTP client: a [`Config`] and the machinery to execute calls
/// against it. Cheap to clone; clones share the pool and dispatcher.
#[derive(Clone, Debug)]
pub struct Client {
    config: Arc<Config>,
}

impl Client {
    /// A client with default configuration.
    pub fn new() -> Client {
        Client::with_config(Config::default())
    }

    /// A client built from an explicit configuration.
    pub fn with_config(config: Config) -> Client {
        Client {
            config: Arc::new(config),
        }
    }

    /// Prepares `request` for execution.
    pub fn new_call(&self, request: Request) -> Call {
        Call {
            client: self.clone(),
            request,
            state: Arc::new(CallState::new()),
        }
    }

    /// Cancels every queued or in-flight call tagged `tag`.
    pub fn cancel(&self, tag: &str) {
        self.config.dispatcher.cancel(tag);
    }

    /// The dispatcher scheduling this client's asynchronous calls.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.config.dispatcher
    }

    pub(crate) fn connect_timeout(&self) -> Option<Duration> {
        self.config.connect_timeout
    }

    pub(crate) fn read_timeout(&self) -> Option<Duration> {
        self.config.read_timeout
    }

    pub(crate) fn write_timeout(&self) -> Option<Duration> {
        self.config.write_timeout
    }

    pub(crate) fn follow_redirects(&self) -> bool {
        self.config.follow_redirects
    }

    pub(crate) fn follow_ssl_redirects(&self) -> bool {
        self.config.follow_ssl_redirects
    }

    pub(crate) fn retry_on_connection_failure(&self) -> bool {
        self.config.retry_on_connection_failure
    }

    pub(crate) fn user_agent(&self) -> &str {
        &self.config.user_agent
    }

    pub(crate) fn proxy(&self) -> Option<&Proxy> {
        self.config.proxy.as_ref()
    }

    pub(crate) fn proxy_selector(&self) -> Arc<dyn ProxySelector> {
        Arc::clone(&self.config.proxy_selector)
    }

    pub(crate) fn dns(&self) -> Arc<dyn Dns> {
        Arc::clone(&self.config.dns)
    }

    pub(crate) fn authenticator(&self) -> Arc<dyn Authenticator> {
        Arc::clone(&self.config.authenticator)
    }

    pub(crate) fn cookie_jar(&self) -> Arc<dyn CookieJar> {
        Arc::clone(&self.config.cookie_jar)
    }

    pub(crate) fn cache(&self) -> Option<&Arc<dyn Cache>> {
        self.config.cache.as_ref()
    }

    pub(crate) fn connector(&self) -> &Arc<dyn NetworkConnector> {
        &self.config.connector
    }

    pub(crate) fn tls_client(&self) -> Option<Arc<dyn TlsClient>> {
        self.config.tls_client.clone()
    }

    pub(crate) fn certificate_pins(&self) -> &[String] {
        &self.config.certificate_pins
    }

    pub(crate) fn protocols(&self) -> &[Protocol] {
        &self.config.protocols
    }

    pub(crate) fn connection_specs(&self) -> &[ConnectionSpec] {
        &self.config.connection_specs
    }

    pub(crate) fn network_interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.config.network_interceptors
    }

    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.config.pool
    }

    pub(crate) fn route_database(&self) -> Arc<RouteDatabase> {
        Arc::clone(&self.config.route_database)
    }
}

impl Default for Client {
    fn default() -> Client {
        Client::new()
    }
}

/// Shared call state: the cancel flag and a handle to whatever socket
/// the call is currently using.
pub(crate) struct CallState {
    canceled: AtomicBool,
    stream: Mutex<Option<Box<dyn NetworkStream + Send>>>,
}

impl CallState {
    fn new() -> CallState {
        CallState {
            canceled: AtomicBool::new(false),
            stream: Mutex::new(None),
        }
    }

    /// Flags the call canceled and shuts its socket down so blocked IO
    /// observes the close as an error. Idempotent and best-effort.
    pub(crate) fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        if let Some(ref stream) = *self.stream.lock().unwrap() {
            let _ = stream.close(Shutdown::Both);
        }
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Registers the socket in use, closing it right away if the call
    /// was already canceled.
    pub(crate) fn set_stream(&self, stream: Box<dyn NetworkStream + Send>) {
        if self.is_canceled() {
            let _ = stream.close(Shutdown::Both);
            return;
        }
        *self.stream.lock().unwrap() = Some(stream);
    }
}

impl fmt::Debug for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallState")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// A request readied for execution. A call executes at most once,
/// synchronously with [`execute`](Call::execute) or on the dispatcher
/// with [`enqueue`](Call::enqueue).
#[derive(Debug)]
pub struct Call {
    client: Client,
    request: Request,
    state: Arc<CallState>,
}

/// A handle for canceling one call from another thread.
#[derive(Clone, Debug)]
pub struct CallToken {
    state: Arc<CallState>,
}

impl CallToken {
    /// Cancels the call. In-flight IO observes the socket close.
    pub fn cancel(&self) {
        self.state.cancel();
    }

    /// Whether the call was canceled.
    pub fn is_canceled(&self) -> bool {
        self.state.is_canceled()
    }
}

impl Call {
    /// The request this call will execute.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// A cancel handle usable from any thread.
    pub fn token(&self) -> CallToken {
        CallToken {
            state: Arc::clone(&self.state),
        }
    }

    /// Executes the call on the current thread, registered with the
    /// dispatcher for counting and cancellation.
    pub fn execute(self) -> crate::Result<Response> {
        let dispatcher = self.client.dispatcher().clone();
        let id = dispatcher.executed(&self.state, self.request.host(), self.request.tag());
        let result = self.execute_inner();
        dispatcher.finished_sync(id);
        result
    }

    /// Schedules the call on the dispatcher; `callback` receives the
    /// outcome on a dispatcher thread.
    pub fn enqueue<F>(self, callback: F)
    where
        F: FnOnce(crate::Result<Response>) + Send + 'static,
    {
        let dispatcher = self.client.dispatcher().clone();
        dispatcher.enqueue(AsyncCall {
            call: self,
            callback: Box::new(callback),
        });
    }

    pub(crate) fn state(&self) -> Arc<CallState> {
        Arc::clone(&self.state)
    }

    /// The engine loop: send, read, recover onto remaining routes, obey
    /// follow-ups up to [`MAX_FOLLOW_UPS`].
    pub(crate) fn execute_inner(&self) -> crate::Result<Response> {
        let mut engine = Engine::new(
            self.client.clone(),
            self.request.clone(),
            Arc::clone(&self.state),
            None,
            None,
        );
        let mut follow_up_count = 0usize;
        loop {
            if self.state.is_canceled() {
                return Err(crate::Error::new_canceled());
            }

            match engine.send_request().and_then(|()| engine.read_response()) {
                Ok(()) => {}
                Err(err) => {
                    if self.state.is_canceled() {
                        return Err(crate::Error::new_canceled());
                    }
                    engine = engine.recover(err)?;
                    continue;
                }
            }

            match engine.follow_up_request()? {
                None => return Ok(engine.into_response()),
                Some(follow_up) => {
                    follow_up_count += 1;
                    if follow_up_count > MAX_FOLLOW_UPS {
                        return Err(crate::Error::new_protocol(io::Error::new(
                            io::ErrorKind::Other,
                            format!("too many follow-up requests: {}", follow_up_count),
                        )));
                    }
                    debug!("follow-up #{}: {:?}", follow_up_count, follow_up);
                    let mut response = engine.into_response();
                    // Close (drain) the interim body so its connection
                    // can be reused for the follow-up.
                    drop(response.take_body());
                    engine = Engine::new(
                        self.client.clone(),
                        follow_up,
                        Arc::clone(&self.state),
                        None,
                        Some(response),
                    );
                }
            }
        }
    }
}

/// A call queued on the dispatcher together with its completion
/// callback.
pub(crate) struct AsyncCall {
    pub(crate) call: Call,
    pub(crate) callback: Box<dyn FnOnce(crate::Result<Response>) + Send>,
}

impl fmt::Debug for AsyncCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCall")
            .field("request", self.call.request())
            .finish()
    }
}
