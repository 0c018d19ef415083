#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # carrier
//!
//! carrier is a correct, pooled, caching HTTP client core written in and
//! for Rust.
//!
//! ## Features
//!
//! - HTTP/1.0 and HTTP/1.1, with HPACK for HTTP/2 header blocks
//! - Route selection across proxies and resolved addresses, with failure
//!   demotion and recovery
//! - Connection pooling with liveness checks and idle eviction
//! - RFC 7234 response caching against a pluggable store
//! - Transparent gzip
//! - Authentication and redirect follow-ups, bounded at 20
//! - A dispatcher enforcing global and per-host concurrency limits
//!
//! ## "Low-level"
//!
//! carrier is the execution engine under a client, meant to be a building
//! block: TLS, DNS, cookies, and cache storage plug in through traits, and
//! the polished request-building surface lives above this crate.
//!
//! ## Example
//!
//! ```no_run
//! use carrier::{Client, Request};
//!
//! # fn run() -> carrier::Result<()> {
//! let client = Client::new();
//! let mut response = client
//!     .new_call(Request::get("http://example.com/")?)
//!     .execute()?;
//! let body = response.take_body().expect("GET responses have a body");
//! println!("{}", body.string()?);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod body;
mod buffer;
pub mod cache;
pub mod client;
mod error;
pub mod headers;
pub mod hpack;
mod http1;
#[cfg(test)]
pub(crate) mod mock;
pub mod net;
mod request;
mod response;
pub mod transport;

pub use crate::body::{RequestBody, ResponseBody};
pub use crate::client::dispatcher::Dispatcher;
pub use crate::client::{Call, Client, Config};
pub use crate::error::{Error, Result};
pub use crate::headers::{Headers, HeadersBuilder};
pub use crate::request::Request;
pub use crate::response::{Response, ResponseBuilder};

/// The application protocol negotiated for a connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// `HTTP/1.0`, one request per connection.
    Http10,
    /// `HTTP/1.1` with keep-alive.
    #[default]
    Http11,
    /// `h2`, multiplexed streams over one connection.
    Http2,
}

impl Protocol {
    /// The ALPN identifier for this protocol.
    pub fn as_str(&self) -> &'static str {
        match *self {
            Protocol::Http10 => "http/1.0",
            Protocol::Http11 => "http/1.1",
            Protocol::Http2 => "h2",
        }
    }

    /// Whether several exchanges can be in flight on one connection.
    pub fn is_multiplexed(&self) -> bool {
        matches!(*self, Protocol::Http2)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `User-Agent` sent when the caller supplies none.
pub(crate) fn default_user_agent() -> String {
    concat!("carrier/", env!("CARGO_PKG_VERSION")).to_owned()
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
