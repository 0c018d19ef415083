//! Network interceptors.
//!
//! Interceptors observe and rewrite each network exchange after the
//! connection is prepared and before bytes hit the transport. Each
//! interceptor receives the chain and must call
//! [`Chain::proceed`] exactly once; the terminal link performs the
//! actual exchange.

use crate::client::engine::Engine;
use crate::request::Request;
use crate::response::Response;

/// Observes and rewrites one network exchange.
pub trait Interceptor: Send + Sync {
    /// Handles the chain's request, normally by forwarding (a possibly
    /// modified copy of) it with [`Chain::proceed`] and returning the
    /// resulting response.
    fn intercept(&self, chain: &mut dyn Chain) -> crate::Result<Response>;
}

/// One link of the interceptor chain.
pub trait Chain {
    /// The request as it stands at this link.
    fn request(&self) -> &Request;

    /// Passes `request` to the next link, ultimately the wire exchange.
    ///
    /// # Panics
    ///
    /// Panics if called more than once from the same interceptor
    /// invocation, or if `request` retargets a different host or port
    /// than the prepared connection.
    fn proceed(&mut self, request: Request) -> crate::Result<Response>;
}

pub(crate) struct NetworkChain<'a> {
    engine: &'a mut Engine,
    index: usize,
    request: Request,
    calls: u32,
}

impl<'a> NetworkChain<'a> {
    pub(crate) fn new(engine: &'a mut Engine, request: Request) -> NetworkChain<'a> {
        NetworkChain {
            engine,
            index: 0,
            request,
            calls: 0,
        }
    }

    fn with_index(engine: &mut Engine, index: usize, request: Request) -> NetworkChain<'_> {
        NetworkChain {
            engine,
            index,
            request,
            calls: 0,
        }
    }
}

impl Chain for NetworkChain<'_> {
    fn request(&self) -> &Request {
        &self.request
    }

    fn proceed(&mut self, request: Request) -> crate::Result<Response> {
        self.calls += 1;
        assert!(
            self.calls <= 1,
            "network interceptor {} must call proceed() exactly once",
            self.index.saturating_sub(1)
        );
        if let Some((host, port)) = self.engine.connected_host_port() {
            assert!(
                request.host() == host && request.effective_port() == port,
                "network interceptor must retain the same host and port: \
                 connection is to {}:{}, request targets {}:{}",
                host,
                port,
                request.host(),
                request.effective_port()
            );
        }

        let interceptor = match self.engine.network_interceptor(self.index) {
            Some(interceptor) => interceptor,
            None => return self.engine.transact(request),
        };
        let mut next = NetworkChain::with_index(self.engine, self.index + 1, request);
        let response = interceptor.intercept(&mut next)?;
        assert!(
            next.calls == 1,
            "network interceptor {} must call proceed() exactly once",
            self.index
        );
        Ok(response)
    }
}
