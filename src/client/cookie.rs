//! The cookie jar seam.

use std::fmt;

use url::Url;

/// Supplies cookies for outgoing requests and receives `Set-Cookie`
/// headers from responses. Persistence is up to the implementation.
pub trait CookieJar: Send + Sync {
    /// The cookies to send to `url`, as name/value pairs.
    fn load(&self, url: &Url) -> Vec<(String, String)>;

    /// Observes the `Set-Cookie` header values of a response from `url`.
    fn save(&self, url: &Url, set_cookies: &[String]);
}

/// The default jar: no cookies in, none remembered.
#[derive(Default)]
pub struct NoCookies;

impl CookieJar for NoCookies {
    fn load(&self, _url: &Url) -> Vec<(String, String)> {
        Vec::new()
    }

    fn save(&self, _url: &Url, _set_cookies: &[String]) {}
}

impl fmt::Debug for NoCookies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("NoCookies")
    }
}
