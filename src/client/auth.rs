//! Responding to authentication challenges.

use std::fmt;

use crate::client::proxy::Proxy;
use crate::request::Request;
use crate::response::Response;

/// Reacts to 401 and 407 challenges.
///
/// Given the challenged response, an authenticator either returns a new
/// request carrying credentials (typically the same request plus an
/// `Authorization` or `Proxy-Authorization` header) or `None` to give up.
pub trait Authenticator: Send + Sync {
    /// Answers the challenge in `response`, received via `proxy`.
    fn authenticate(&self, proxy: &Proxy, response: &Response) -> Option<Request>;
}

/// The default authenticator: never answers a challenge.
#[derive(Default)]
pub struct NoAuthenticator;

impl Authenticator for NoAuthenticator {
    fn authenticate(&self, _proxy: &Proxy, _response: &Response) -> Option<Request> {
        None
    }
}

impl fmt::Debug for NoAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("NoAuthenticator")
    }
}
