//! Routes: the concrete ways a request can reach its origin.
//!
//! An [`Address`] identifies an origin and everything needed to speak to
//! it, and doubles as the connection pool key. A [`Route`] is one concrete
//! attempt: the address through one proxy to one resolved socket address.
//! The [`RouteSelector`] walks routes in preference order, pushing
//! previously failed ones to the back of the line via the shared
//! [`RouteDatabase`].

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, trace};
use url::Url;

use crate::client::auth::Authenticator;
use crate::client::dns::Dns;
use crate::client::proxy::{Proxy, ProxySelector};
use crate::net::TlsClient;
use crate::Protocol;

/// TLS negotiation flavors a connection may offer, in preference order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionSpec {
    /// Current TLS versions and cipher suites.
    ModernTls,
    /// A fallback accepting older TLS configurations.
    CompatibleTls,
    /// No TLS at all.
    Cleartext,
}

/// An origin endpoint and the client facilities used to reach it. The
/// pooling key: connections are shared exactly between equal addresses.
#[derive(Clone)]
pub struct Address {
    host: String,
    port: u16,
    tls_client: Option<Arc<dyn TlsClient>>,
    certificate_pins: Vec<String>,
    authenticator: Arc<dyn Authenticator>,
    protocols: Vec<Protocol>,
    connection_specs: Vec<ConnectionSpec>,
    proxy: Option<Proxy>,
    proxy_selector: Arc<dyn ProxySelector>,
}

impl Address {
    /// Creates an address. `tls_client` is `None` for cleartext origins.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host: &str,
        port: u16,
        tls_client: Option<Arc<dyn TlsClient>>,
        certificate_pins: Vec<String>,
        authenticator: Arc<dyn Authenticator>,
        protocols: Vec<Protocol>,
        connection_specs: Vec<ConnectionSpec>,
        proxy: Option<Proxy>,
        proxy_selector: Arc<dyn ProxySelector>,
    ) -> Address {
        Address {
            host: host.to_owned(),
            port,
            tls_client,
            certificate_pins,
            authenticator,
            protocols,
            connection_specs,
            proxy,
            proxy_selector,
        }
    }

    /// The origin host name.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The origin port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The TLS seam, present for HTTPS origins.
    pub fn tls_client(&self) -> Option<&Arc<dyn TlsClient>> {
        self.tls_client.as_ref()
    }

    /// Pinned certificate fingerprints for the origin, if any.
    pub fn certificate_pins(&self) -> &[String] {
        &self.certificate_pins
    }

    /// The authenticator answering challenges for this origin.
    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.authenticator
    }

    /// Application protocols the client is willing to speak.
    pub fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    /// TLS flavors to offer, in order.
    pub fn connection_specs(&self) -> &[ConnectionSpec] {
        &self.connection_specs
    }

    /// The explicitly configured proxy, if any.
    pub fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    /// The selector consulted when no proxy is configured.
    pub fn proxy_selector(&self) -> &Arc<dyn ProxySelector> {
        &self.proxy_selector
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Address) -> bool {
        self.host == other.host
            && self.port == other.port
            && arc_opt_ptr(&self.tls_client) == arc_opt_ptr(&other.tls_client)
            && self.certificate_pins == other.certificate_pins
            && Arc::ptr_eq(&self.authenticator, &other.authenticator)
            && self.protocols == other.protocols
            && self.connection_specs == other.connection_specs
            && self.proxy == other.proxy
            && Arc::ptr_eq(&self.proxy_selector, &other.proxy_selector)
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
        arc_opt_ptr(&self.tls_client).hash(state);
        self.certificate_pins.hash(state);
        (Arc::as_ptr(&self.authenticator) as *const () as usize).hash(state);
        self.protocols.hash(state);
        self.connection_specs.hash(state);
        self.proxy.hash(state);
        (Arc::as_ptr(&self.proxy_selector) as *const () as usize).hash(state);
    }
}

fn arc_opt_ptr(arc: &Option<Arc<dyn TlsClient>>) -> usize {
    arc.as_ref()
        .map(|a| Arc::as_ptr(a) as *const () as usize)
        .unwrap_or(0)
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Address")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls_client.is_some())
            .field("proxy", &self.proxy)
            .finish()
    }
}

/// One concrete connection attempt: the address, through one proxy, to
/// one resolved socket address.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Route {
    address: Address,
    proxy: Proxy,
    socket_address: SocketAddr,
}

impl Route {
    pub(crate) fn new(address: Address, proxy: Proxy, socket_address: SocketAddr) -> Route {
        Route {
            address,
            proxy,
            socket_address,
        }
    }

    /// The origin address this route serves.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The proxy in the path, possibly [`Proxy::Direct`].
    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    /// The resolved socket address the socket connects to.
    pub fn socket_address(&self) -> SocketAddr {
        self.socket_address
    }

    /// Whether this route tunnels TLS through an HTTP proxy.
    pub fn requires_tunnel(&self) -> bool {
        self.address.tls_client.is_some() && self.proxy.is_http()
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Route({}:{} via {} at {})",
            self.address.host, self.address.port, self.proxy, self.socket_address
        )
    }
}

/// A blacklist of recently failed routes, shared across calls so the
/// whole client learns from one call's failures. Entries expire after a
/// TTL, restoring the route to normal preference order.
pub struct RouteDatabase {
    failed: Mutex<HashMap<Route, Instant>>,
    ttl: Duration,
}

impl RouteDatabase {
    /// A database demoting failed routes for five minutes.
    pub fn new() -> RouteDatabase {
        RouteDatabase::with_ttl(Duration::from_secs(5 * 60))
    }

    /// A database with a custom demotion TTL.
    pub fn with_ttl(ttl: Duration) -> RouteDatabase {
        RouteDatabase {
            failed: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Records a connection failure on `route`.
    pub fn failed(&self, route: &Route) {
        debug!("demoting failed route {:?}", route);
        self.failed
            .lock()
            .unwrap()
            .insert(route.clone(), Instant::now() + self.ttl);
    }

    /// Records a success, restoring the route immediately.
    pub fn connected(&self, route: &Route) {
        self.failed.lock().unwrap().remove(route);
    }

    /// Whether `route` failed recently and should be tried last.
    pub fn should_postpone(&self, route: &Route) -> bool {
        let mut failed = self.failed.lock().unwrap();
        match failed.get(route) {
            Some(&expires) if Instant::now() < expires => true,
            Some(_) => {
                failed.remove(route);
                false
            }
            None => false,
        }
    }
}

impl Default for RouteDatabase {
    fn default() -> RouteDatabase {
        RouteDatabase::new()
    }
}

impl fmt::Debug for RouteDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteDatabase")
            .field("failed", &self.failed.lock().unwrap().len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Walks the routes for one address in preference order: each proxy in
/// turn, each of its resolved socket addresses in turn, and finally any
/// routes that were postponed because they failed recently.
pub struct RouteSelector {
    address: Address,
    url: Url,
    dns: Arc<dyn Dns>,
    route_database: Arc<RouteDatabase>,

    proxies: Vec<Proxy>,
    next_proxy_index: usize,
    current_proxy: Option<Proxy>,

    socket_addresses: Vec<SocketAddr>,
    next_socket_address_index: usize,

    postponed_routes: Vec<Route>,
}

impl RouteSelector {
    /// Creates a selector. No resolution happens until
    /// [`RouteSelector::next`] is called.
    pub fn new(
        address: Address,
        url: Url,
        dns: Arc<dyn Dns>,
        route_database: Arc<RouteDatabase>,
    ) -> RouteSelector {
        let proxies = match address.proxy() {
            Some(proxy) => vec![proxy.clone()],
            None => {
                let mut selected = address.proxy_selector().select(&url);
                if selected.last() != Some(&Proxy::Direct) {
                    selected.push(Proxy::Direct);
                }
                selected
            }
        };
        RouteSelector {
            address,
            url,
            dns,
            route_database,
            proxies,
            next_proxy_index: 0,
            current_proxy: None,
            socket_addresses: Vec::new(),
            next_socket_address_index: 0,
            postponed_routes: Vec::new(),
        }
    }

    /// Whether another route remains, counting postponed ones.
    pub fn has_next(&self) -> bool {
        self.next_socket_address_index < self.socket_addresses.len()
            || self.next_proxy_index < self.proxies.len()
            || !self.postponed_routes.is_empty()
    }

    /// Produces the next route to attempt.
    pub fn next(&mut self) -> crate::Result<Route> {
        loop {
            if self.next_socket_address_index >= self.socket_addresses.len() {
                if self.next_proxy_index >= self.proxies.len() {
                    // Regular routes are exhausted; fall back to the ones
                    // that failed recently.
                    if !self.postponed_routes.is_empty() {
                        let route = self.postponed_routes.remove(0);
                        trace!("retrying postponed {:?}", route);
                        return Ok(route);
                    }
                    return Err(crate::Error::new_route(io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        format!("exhausted all routes for {}", self.address.host()),
                    )));
                }
                let proxy = self.proxies[self.next_proxy_index].clone();
                self.next_proxy_index += 1;
                self.reset_socket_addresses(&proxy)?;
                self.current_proxy = Some(proxy);
            }

            let socket_address = self.socket_addresses[self.next_socket_address_index];
            self.next_socket_address_index += 1;

            let proxy = self
                .current_proxy
                .clone()
                .expect("socket addresses imply a current proxy");
            let route = Route::new(self.address.clone(), proxy, socket_address);
            if self.route_database.should_postpone(&route) {
                self.postponed_routes.push(route);
                continue;
            }
            return Ok(route);
        }
    }

    /// Records that connecting via `route` failed, demoting the route and
    /// informing the proxy selector of non-direct failures.
    pub fn connect_failed(&mut self, route: &Route, error: &crate::Error) {
        if !route.proxy().is_direct() && self.address.proxy().is_none() {
            self.address
                .proxy_selector()
                .connect_failed(&self.url, route.proxy(), error);
        }
        self.route_database.failed(route);
    }

    /// Resolves the socket addresses to try for `proxy`.
    fn reset_socket_addresses(&mut self, proxy: &Proxy) -> crate::Result<()> {
        // An HTTP proxy is the socket target; for direct and SOCKS
        // connections the origin host is resolved here.
        let (host, port) = match *proxy {
            Proxy::Http(ref host, port) => (host.as_str(), port),
            Proxy::Direct | Proxy::Socks(..) => (self.address.host(), self.address.port()),
        };
        if port == 0 {
            return Err(crate::Error::new_request(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no route to {}:{}; port is out of range", host, port),
            )));
        }

        self.socket_addresses = match host.parse::<std::net::IpAddr>() {
            Ok(ip) => vec![SocketAddr::new(ip, port)],
            Err(_) => self
                .dns
                .lookup(host)
                .map_err(crate::Error::new_request)?
                .into_iter()
                .map(|ip| SocketAddr::new(ip, port))
                .collect(),
        };
        if self.socket_addresses.is_empty() {
            return Err(crate::Error::new_request(io::Error::new(
                io::ErrorKind::NotFound,
                format!("unknown host {}", host),
            )));
        }
        self.next_socket_address_index = 0;
        trace!("resolved {} to {:?}", host, self.socket_addresses);
        Ok(())
    }
}

impl fmt::Debug for RouteSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteSelector")
            .field("address", &self.address)
            .field("proxies", &self.proxies)
            .field("next_proxy_index", &self.next_proxy_index)
            .field("postponed", &self.postponed_routes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::net::IpAddr;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use url::Url;

    use super::{Address, ConnectionSpec, RouteDatabase, RouteSelector};
    use crate::client::auth::NoAuthenticator;
    use crate::client::dns::Dns;
    use crate::client::proxy::{DirectSelector, Proxy, ProxySelector};
    use crate::Protocol;

    struct FakeDns(Vec<IpAddr>);

    impl Dns for FakeDns {
        fn lookup(&self, _host: &str) -> io::Result<Vec<IpAddr>> {
            if self.0.is_empty() {
                Err(io::Error::new(io::ErrorKind::NotFound, "unknown host"))
            } else {
                Ok(self.0.clone())
            }
        }
    }

    fn address(proxy: Option<Proxy>) -> Address {
        Address::new(
            "example.com",
            80,
            None,
            Vec::new(),
            Arc::new(NoAuthenticator),
            vec![Protocol::Http11],
            vec![ConnectionSpec::Cleartext],
            proxy,
            Arc::new(DirectSelector),
        )
    }

    fn selector(proxy: Option<Proxy>, ips: &[&str]) -> RouteSelector {
        let ips = ips.iter().map(|ip| ip.parse().unwrap()).collect();
        RouteSelector::new(
            address(proxy),
            Url::parse("http://example.com/").unwrap(),
            Arc::new(FakeDns(ips)),
            Arc::new(RouteDatabase::new()),
        )
    }

    #[test]
    fn direct_routes_resolve_origin() {
        let mut selector = selector(None, &["10.0.0.1", "10.0.0.2"]);
        let first = selector.next().unwrap();
        assert!(first.proxy().is_direct());
        assert_eq!(first.socket_address().to_string(), "10.0.0.1:80");
        let second = selector.next().unwrap();
        assert_eq!(second.socket_address().to_string(), "10.0.0.2:80");
        assert!(!selector.has_next());
        assert!(selector.next().unwrap_err().is_route());
    }

    #[test]
    fn http_proxy_resolves_proxy_host() {
        let mut selector = selector(Some(Proxy::Http("10.1.1.1".into(), 8080)), &[]);
        let route = selector.next().unwrap();
        assert_eq!(route.socket_address().to_string(), "10.1.1.1:8080");
        assert!(route.proxy().is_http());
    }

    #[test]
    fn routes_are_unique_within_an_iteration() {
        let mut selector = selector(None, &["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        let mut seen = Vec::new();
        while selector.has_next() {
            let route = selector.next().unwrap();
            assert!(!seen.contains(&route));
            seen.push(route);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn failed_routes_are_postponed_to_the_end() {
        let database = Arc::new(RouteDatabase::new());
        let mut first_pass = RouteSelector::new(
            address(None),
            Url::parse("http://example.com/").unwrap(),
            Arc::new(FakeDns(vec![
                "10.0.0.1".parse().unwrap(),
                "10.0.0.2".parse().unwrap(),
            ])),
            Arc::clone(&database),
        );
        let bad = first_pass.next().unwrap();
        let err = crate::Error::new_io(io::Error::new(io::ErrorKind::ConnectionRefused, "nope"));
        first_pass.connect_failed(&bad, &err);

        let mut second_pass = RouteSelector::new(
            address(None),
            Url::parse("http://example.com/").unwrap(),
            Arc::new(FakeDns(vec![
                "10.0.0.1".parse().unwrap(),
                "10.0.0.2".parse().unwrap(),
            ])),
            database,
        );
        let routes: Vec<_> = std::iter::from_fn(|| {
            second_pass.has_next().then(|| second_pass.next().unwrap())
        })
        .collect();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].socket_address().to_string(), "10.0.0.2:80");
        assert_eq!(routes[1].socket_address().to_string(), "10.0.0.1:80");
    }

    #[test]
    fn demotion_expires_with_the_ttl() {
        let database = RouteDatabase::with_ttl(Duration::from_millis(0));
        let mut selector = selector(None, &["10.0.0.1"]);
        let route = selector.next().unwrap();
        database.failed(&route);
        assert!(!database.should_postpone(&route));
    }

    #[test]
    fn proxy_selector_is_notified_of_proxy_failures() {
        struct Recording(Mutex<Vec<Proxy>>);
        impl ProxySelector for Recording {
            fn select(&self, _url: &Url) -> Vec<Proxy> {
                vec![Proxy::Http("10.1.1.1".into(), 8080)]
            }
            fn connect_failed(&self, _url: &Url, proxy: &Proxy, _error: &crate::Error) {
                self.0.lock().unwrap().push(proxy.clone());
            }
        }

        let recording = Arc::new(Recording(Mutex::new(Vec::new())));
        let address = Address::new(
            "example.com",
            80,
            None,
            Vec::new(),
            Arc::new(NoAuthenticator),
            vec![Protocol::Http11],
            vec![ConnectionSpec::Cleartext],
            None,
            recording.clone(),
        );
        let mut selector = RouteSelector::new(
            address,
            Url::parse("http://example.com/").unwrap(),
            Arc::new(FakeDns(vec!["10.0.0.1".parse().unwrap()])),
            Arc::new(RouteDatabase::new()),
        );
        let route = selector.next().unwrap();
        assert!(route.proxy().is_http());
        let err = crate::Error::new_io(io::Error::new(io::ErrorKind::ConnectionRefused, "nope"));
        selector.connect_failed(&route, &err);
        assert_eq!(recording.0.lock().unwrap().len(), 1);
    }
}
