//! Client connection pooling.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::Shutdown;
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::{trace, warn};

use crate::client::route::{Address, Route};
use crate::net::{Handshake, NetworkStream};
use crate::Protocol;

/// A live socket with its negotiated protocol and pooling bookkeeping.
///
/// A connection is owned by one engine at a time. Dropping a reusable
/// connection returns it to the pool it came from; a connection marked
/// unusable closes its socket instead.
pub struct Connection {
    inner: Option<ConnectionInner>,
    pool: Weak<Mutex<PoolInner>>,
    reusable: bool,
}

struct ConnectionInner {
    route: Route,
    stream: Option<Box<dyn NetworkStream + Send>>,
    protocol: Protocol,
    handshake: Option<Handshake>,
    idle_at: Instant,
    recycled: bool,
}

impl Connection {
    /// Wraps a freshly connected stream. The connection is not yet
    /// associated with a pool; [`ConnectionPool::adopt`] does that.
    pub(crate) fn new(
        route: Route,
        stream: Box<dyn NetworkStream + Send>,
        protocol: Protocol,
        handshake: Option<Handshake>,
    ) -> Connection {
        Connection {
            inner: Some(ConnectionInner {
                route,
                stream: Some(stream),
                protocol,
                handshake,
                idle_at: Instant::now(),
                recycled: false,
            }),
            pool: Weak::new(),
            reusable: true,
        }
    }

    pub(crate) fn route(&self) -> &Route {
        &self.inner().route
    }

    pub(crate) fn protocol(&self) -> Protocol {
        self.inner().protocol
    }

    pub(crate) fn handshake(&self) -> Option<&Handshake> {
        self.inner().handshake.as_ref()
    }

    /// Whether this connection came out of the pool rather than a fresh
    /// socket. Failures on recycled connections don't demote the route.
    pub(crate) fn was_recycled(&self) -> bool {
        self.inner().recycled
    }

    /// Takes the stream out for the duration of an exchange.
    pub(crate) fn take_stream(&mut self) -> Box<dyn NetworkStream + Send> {
        self.inner
            .as_mut()
            .expect("connection already dismantled")
            .stream
            .take()
            .expect("stream already taken")
    }

    /// Puts the stream back after an exchange.
    pub(crate) fn restore_stream(&mut self, stream: Box<dyn NetworkStream + Send>) {
        let inner = self.inner.as_mut().expect("connection already dismantled");
        inner.stream = Some(stream);
        inner.idle_at = Instant::now();
    }

    /// A second handle to the socket, for cross-thread shutdown.
    pub(crate) fn duplicate_stream(&self) -> io::Result<Box<dyn NetworkStream + Send>> {
        match self.inner().stream {
            Some(ref stream) => stream.duplicate(),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "stream is checked out",
            )),
        }
    }

    /// Shuts the socket down in place, if the stream is currently home.
    pub(crate) fn shutdown(&self) -> io::Result<()> {
        match self.inner().stream {
            Some(ref stream) => stream.close(Shutdown::Both),
            None => Ok(()),
        }
    }

    /// Prevents this connection from returning to the pool.
    pub(crate) fn mark_not_reusable(&mut self) {
        self.reusable = false;
    }

    fn inner(&self) -> &ConnectionInner {
        self.inner.as_ref().expect("connection already dismantled")
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        if !self.reusable || inner.stream.is_none() {
            close_inner(inner);
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            trace!("returning connection to pool: {:?}", inner.route);
            if let Ok(mut locked) = pool.lock() {
                locked.reuse(inner);
                return;
            }
        }
        close_inner(inner);
    }
}

fn close_inner(inner: ConnectionInner) {
    if let Some(stream) = inner.stream {
        if let Err(err) = stream.close(Shutdown::Both) {
            // Secondary shutdown failures are expected on dead sockets.
            warn!("error closing connection: {}", err);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner {
            Some(ref inner) => f
                .debug_struct("Connection")
                .field("route", &inner.route)
                .field("protocol", &inner.protocol)
                .field("recycled", &inner.recycled)
                .finish(),
            None => f.pad("Connection(dismantled)"),
        }
    }
}

/// Configuration for the [`ConnectionPool`].
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// The maximum idle connections kept per address.
    pub max_idle_per_address: usize,
    /// The maximum idle connections kept overall.
    pub max_idle: usize,
    /// How long an idle connection may wait before eviction.
    pub keep_alive: Duration,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            max_idle_per_address: 5,
            max_idle: 10,
            keep_alive: Duration::from_secs(5 * 60),
        }
    }
}

struct PoolInner {
    conns: HashMap<Address, Vec<ConnectionInner>>,
    config: PoolConfig,
    sweeper_running: bool,
}

impl PoolInner {
    fn reuse(&mut self, mut inner: ConnectionInner) {
        inner.idle_at = Instant::now();
        inner.recycled = true;
        if self.total_idle() >= self.config.max_idle {
            trace!("pool full, closing instead of pooling");
            close_inner(inner);
            return;
        }
        // A multiplexed connection serves an address on its own and is
        // never crowded out by the per-address cap.
        let per_address = self.config.max_idle_per_address;
        let multiplexed = inner.protocol.is_multiplexed();
        let conns = self.conns.entry(inner.route.address().clone()).or_default();
        if !multiplexed && conns.len() >= per_address {
            trace!("address bucket full, closing instead of pooling");
            close_inner(inner);
            return;
        }
        conns.push(inner);
    }

    fn total_idle(&self) -> usize {
        self.conns.values().map(Vec::len).sum()
    }

    /// Drops idle connections past their keep-alive.
    fn evict_expired(&mut self) {
        let keep_alive = self.config.keep_alive;
        for conns in self.conns.values_mut() {
            let mut i = 0;
            while i < conns.len() {
                if conns[i].idle_at.elapsed() > keep_alive {
                    close_inner(conns.remove(i));
                } else {
                    i += 1;
                }
            }
        }
        self.conns.retain(|_, conns| !conns.is_empty());
    }
}

/// A keyed cache of live connections.
///
/// `get` prefers the most recently idle connection for an address,
/// probing HTTP/1 sockets for liveness before handing them out. A
/// background sweep evicts connections past the keep-alive window.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl ConnectionPool {
    /// A pool with default limits.
    pub fn new() -> ConnectionPool {
        ConnectionPool::with_config(PoolConfig::default())
    }

    /// A pool with explicit limits.
    pub fn with_config(config: PoolConfig) -> ConnectionPool {
        ConnectionPool {
            inner: Arc::new(Mutex::new(PoolInner {
                conns: HashMap::new(),
                config,
                sweeper_running: false,
            })),
        }
    }

    /// Associates a fresh connection with this pool so that dropping it
    /// recycles rather than closes.
    pub(crate) fn adopt(&self, connection: &mut Connection) {
        connection.pool = Arc::downgrade(&self.inner);
        self.start_sweeper();
    }

    /// Returns an idle connection for `address`, if a usable one exists.
    ///
    /// The liveness probe is skipped for idempotent GETs, which can safely
    /// retry on a connection that turns out to be dead.
    pub(crate) fn get(&self, address: &Address, is_get_request: bool) -> Option<Connection> {
        let mut locked = self.inner.lock().unwrap();
        let keep_alive = locked.config.keep_alive;
        let mut conns = locked.conns.remove(address)?;
        let mut found = None;
        while let Some(mut inner) = conns.pop() {
            if inner.idle_at.elapsed() > keep_alive {
                close_inner(inner);
                continue;
            }
            let fresh = match inner.stream {
                Some(ref mut stream) => is_get_request || stream.is_fresh(),
                None => false,
            };
            if !fresh {
                trace!("pooled connection is stale, closing");
                close_inner(inner);
                continue;
            }
            trace!("pool had connection, using");
            found = Some(inner);
            break;
        }
        if !conns.is_empty() {
            locked.conns.insert(address.clone(), conns);
        }
        found.map(|inner| Connection {
            inner: Some(inner),
            pool: Arc::downgrade(&self.inner),
            reusable: true,
        })
    }

    /// The number of idle connections, over all addresses.
    pub fn idle_count(&self) -> usize {
        self.inner.lock().unwrap().total_idle()
    }

    /// Closes and removes every idle connection.
    pub fn evict_all(&self) {
        let mut locked = self.inner.lock().unwrap();
        for (_, conns) in locked.conns.drain() {
            for inner in conns {
                close_inner(inner);
            }
        }
    }

    /// Starts the background sweep on first use.
    fn start_sweeper(&self) {
        let mut locked = self.inner.lock().unwrap();
        if locked.sweeper_running {
            return;
        }
        locked.sweeper_running = true;
        let interval = locked.config.keep_alive.min(Duration::from_secs(30));
        let weak = Arc::downgrade(&self.inner);
        let spawned = thread::Builder::new()
            .name("carrier-pool".to_owned())
            .spawn(move || loop {
                thread::sleep(interval);
                match weak.upgrade() {
                    Some(inner) => inner.lock().unwrap().evict_expired(),
                    None => return,
                }
            });
        if spawned.is_err() {
            // Without the sweeper, expiry still happens inline in get().
            locked.sweeper_running = false;
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> ConnectionPool {
        ConnectionPool::new()
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("idle", &self.idle_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{Connection, ConnectionPool, PoolConfig};
    use crate::client::auth::NoAuthenticator;
    use crate::client::proxy::{DirectSelector, Proxy};
    use crate::client::route::{Address, ConnectionSpec, Route};
    use crate::mock::MockStream;
    use crate::Protocol;

    fn address() -> Address {
        Address::new(
            "example.com",
            80,
            None,
            Vec::new(),
            Arc::new(NoAuthenticator),
            vec![Protocol::Http11],
            vec![ConnectionSpec::Cleartext],
            None,
            Arc::new(DirectSelector),
        )
    }

    fn connection(pool: &ConnectionPool, stream: MockStream) -> Connection {
        let route = Route::new(address(), Proxy::Direct, "10.0.0.1:80".parse().unwrap());
        let mut conn = Connection::new(route, Box::new(stream), Protocol::Http11, None);
        pool.adopt(&mut conn);
        conn
    }

    #[test]
    fn dropped_connections_are_recycled() {
        let pool = ConnectionPool::new();
        let conn = connection(&pool, MockStream::new());
        drop(conn);
        assert_eq!(pool.idle_count(), 1);

        let reused = pool.get(&address(), false).unwrap();
        assert!(reused.was_recycled());
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn unusable_connections_close_instead() {
        let pool = ConnectionPool::new();
        let handle = MockStream::new();
        let mut conn = connection(&pool, handle.clone());
        conn.mark_not_reusable();
        drop(conn);
        assert_eq!(pool.idle_count(), 0);
        assert!(handle.is_closed());
    }

    #[test]
    fn stale_connections_are_rejected_for_non_get() {
        let pool = ConnectionPool::new();
        let handle = MockStream::new();
        handle.set_stale();
        drop(connection(&pool, handle.clone()));
        assert_eq!(pool.idle_count(), 1);

        assert!(pool.get(&address(), false).is_none());
        assert!(handle.is_closed());
    }

    #[test]
    fn get_requests_may_reuse_stale_sockets() {
        let pool = ConnectionPool::new();
        let handle = MockStream::new();
        handle.set_stale();
        drop(connection(&pool, handle));
        assert!(pool.get(&address(), true).is_some());
    }

    #[test]
    fn per_address_idle_cap_is_enforced() {
        let pool = ConnectionPool::with_config(PoolConfig {
            max_idle_per_address: 2,
            max_idle: 10,
            keep_alive: Duration::from_secs(300),
        });
        let extra = MockStream::new();
        drop(connection(&pool, MockStream::new()));
        drop(connection(&pool, MockStream::new()));
        drop(connection(&pool, extra.clone()));
        assert_eq!(pool.idle_count(), 2);
        assert!(extra.is_closed());
    }

    #[test]
    fn keep_alive_expiry_applies_on_get() {
        let pool = ConnectionPool::with_config(PoolConfig {
            max_idle_per_address: 5,
            max_idle: 10,
            keep_alive: Duration::from_millis(0),
        });
        drop(connection(&pool, MockStream::new()));
        assert!(pool.get(&address(), true).is_none());
    }
}
