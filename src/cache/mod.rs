//! The response cache contract and shared header plumbing.
//!
//! Storage itself is external: implementations of [`Cache`] persist
//! responses however they like (disk, memory, nothing). The engine drives
//! the contract — lookup before connecting, a write sink while the caller
//! reads the body, revalidation updates after a conditional hit.

use std::io::Write;

use crate::headers::Headers;
use crate::request::Request;
use crate::response::Response;

pub mod strategy;

pub use self::strategy::CacheStrategy;

/// A pluggable response store.
///
/// Implementations must restore [`Response::sent_at`] and
/// [`Response::received_at`] on responses returned from [`get`](Cache::get);
/// the engine records them in the `Carrier-Sent-Millis` and
/// `Carrier-Received-Millis` extension headers when handing a response to
/// [`put`](Cache::put).
pub trait Cache: Send + Sync {
    /// Returns the stored response for `request`, if any.
    fn get(&self, request: &Request) -> Option<Response>;

    /// Offers a response for storage. The response carries headers only;
    /// body bytes arrive through the returned [`CacheRequest`] as the
    /// application reads them. Returning `None` declines to store.
    fn put(&self, response: &Response) -> Option<Box<dyn CacheRequest>>;

    /// Drops the stored response for `request`, if any.
    fn remove(&self, request: &Request);

    /// Replaces `cached`'s metadata with `fresh`'s after a conditional hit.
    fn update(&self, cached: &Response, fresh: &Response);

    /// Observes which path a computed strategy chose, for statistics.
    fn track_response(&self, strategy: &CacheStrategy);

    /// Observes a conditional request answered with 304.
    fn track_conditional_cache_hit(&self);
}

/// An in-progress cache write.
pub trait CacheRequest: Send {
    /// The sink body bytes are copied into.
    fn body(&mut self) -> &mut dyn Write;

    /// Abandons the write, discarding anything buffered so far.
    fn abort(&mut self);
}

/// Combines cached and network headers after a 304 (RFC 7234 §4.3.4):
/// the network response wins on end-to-end fields it carries, 100-level
/// warnings from the cache are dropped as stale, and the network's
/// `Content-Length` is ignored because a 304 has no body.
pub(crate) fn combine_headers(cached: &Headers, network: &Headers) -> Headers {
    let mut result = Headers::builder();
    for (name, value) in cached.iter() {
        if name.eq_ignore_ascii_case("Warning") && value.starts_with('1') {
            continue;
        }
        if describes_content(name) || !is_end_to_end(name) || network.get(name).is_none() {
            result.add_lenient_pair(name, value);
        }
    }
    for (name, value) in network.iter() {
        if !describes_content(name) && is_end_to_end(name) {
            result.add_lenient_pair(name, value);
        }
    }
    result.build()
}

/// Headers that describe the stored body, which a 304 does not carry.
fn describes_content(name: &str) -> bool {
    name.eq_ignore_ascii_case("Content-Length")
        || name.eq_ignore_ascii_case("Content-Encoding")
        || name.eq_ignore_ascii_case("Content-Type")
}

/// Whether a header travels with the message rather than the connection
/// (RFC 2616 §13.5.1).
pub(crate) fn is_end_to_end(name: &str) -> bool {
    !name.eq_ignore_ascii_case("Connection")
        && !name.eq_ignore_ascii_case("Keep-Alive")
        && !name.eq_ignore_ascii_case("Proxy-Authenticate")
        && !name.eq_ignore_ascii_case("Proxy-Authorization")
        && !name.eq_ignore_ascii_case("TE")
        && !name.eq_ignore_ascii_case("Trailers")
        && !name.eq_ignore_ascii_case("Transfer-Encoding")
        && !name.eq_ignore_ascii_case("Upgrade")
}
