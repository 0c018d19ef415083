//! The caching decision: given a request, a stored response and the
//! current time, choose between the cache, the network, or both.

use std::time::UNIX_EPOCH;

use log::trace;

use crate::headers::Headers;
use crate::request::Request;
use crate::response::Response;

/// The decision for one request. Four shapes are possible:
///
/// - network request only: a regular request, the cache is no help;
/// - cache response only: serve the stored response as-is;
/// - both: a conditional request revalidating the stored response;
/// - neither: the request demanded `only-if-cached` and the cache cannot
///   satisfy it, so the engine synthesizes a 504.
#[derive(Debug)]
pub struct CacheStrategy {
    /// The request to send over the network, if the network is needed.
    pub network_request: Option<Request>,
    /// The stored response to serve or revalidate, if usable.
    pub cache_response: Option<Response>,
}

impl CacheStrategy {
    /// Computes the strategy for `request` at `now_millis`, consuming the
    /// stored candidate's skeleton. Pure: equal inputs produce an equal
    /// decision.
    pub fn compute(
        now_millis: u64,
        request: &Request,
        cached: Option<Response>,
    ) -> CacheStrategy {
        let strategy = Factory {
            now_millis,
            request,
        }
        .candidate(cached);

        if strategy.network_request.is_some()
            && CacheControl::parse(request.headers()).only_if_cached
        {
            // The caller forbade the network but the cache cannot answer.
            return CacheStrategy {
                network_request: None,
                cache_response: None,
            };
        }
        strategy
    }
}

/// Returns true if the response may be stored and later served for
/// `request`. This is the gate for writing to the cache, and for reading
/// a stored entry back out.
pub fn is_cacheable(response: &Response, request: &Request) -> bool {
    let response_caching = CacheControl::parse(response.headers());
    match response.code() {
        200 | 203 | 204 | 300 | 301 | 308 | 404 | 405 | 410 | 414 | 501 => {}
        302 | 307 => {
            // Cacheable only with explicit freshness or visibility.
            if response.header("Expires").is_none()
                && response_caching.max_age_seconds.is_none()
                && !response_caching.public
                && !response_caching.private
            {
                return false;
            }
        }
        _ => return false,
    }
    !response_caching.no_store && !CacheControl::parse(request.headers()).no_store
}

struct Factory<'a> {
    now_millis: u64,
    request: &'a Request,
}

impl Factory<'_> {
    fn network_only(&self) -> CacheStrategy {
        CacheStrategy {
            network_request: Some(self.request.clone()),
            cache_response: None,
        }
    }

    fn candidate(&self, cached: Option<Response>) -> CacheStrategy {
        let cached = match cached {
            Some(cached) => cached,
            None => return self.network_only(),
        };

        // An HTTPS exchange needs the stored TLS session details.
        if self.request.is_https() && cached.handshake().is_none() {
            return self.network_only();
        }

        if !is_cacheable(&cached, self.request) {
            return self.network_only();
        }

        let request_caching = CacheControl::parse(self.request.headers());
        if request_caching.no_cache || self.request.has_conditions() {
            return self.network_only();
        }

        let response_caching = CacheControl::parse(cached.headers());

        let age_millis = self.cache_response_age(&cached);
        let mut fresh_millis = self.compute_freshness_lifetime(&cached, &response_caching);
        if let Some(request_max_age) = request_caching.max_age_seconds {
            fresh_millis = fresh_millis.min(request_max_age.saturating_mul(1000));
        }
        let min_fresh_millis = request_caching
            .min_fresh_seconds
            .unwrap_or(0)
            .saturating_mul(1000);
        let max_stale_millis = if response_caching.must_revalidate {
            0
        } else {
            request_caching
                .max_stale_seconds
                .unwrap_or(0)
                .saturating_mul(1000)
        };

        trace!(
            "cache age={}ms fresh={}ms min-fresh={}ms max-stale={}ms",
            age_millis,
            fresh_millis,
            min_fresh_millis,
            max_stale_millis
        );

        if !response_caching.no_cache
            && age_millis.saturating_add(min_fresh_millis)
                < fresh_millis.saturating_add(max_stale_millis)
        {
            let mut headers = cached.headers().new_builder();
            if age_millis.saturating_add(min_fresh_millis) >= fresh_millis {
                headers.add_lenient_pair("Warning", "110 carrier \"Response is stale\"");
            }
            const ONE_DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;
            if age_millis > ONE_DAY_MILLIS && self.is_freshness_lifetime_heuristic(&cached) {
                headers.add_lenient_pair("Warning", "113 carrier \"Heuristic expiration\"");
            }
            let served = cached.to_builder().headers(headers.build()).build();
            return CacheStrategy {
                network_request: None,
                cache_response: Some(served),
            };
        }

        // Find a validator to attach. Prefer the ETag, then the
        // modification date, then the served date.
        let (condition_name, condition_value) = if let Some(etag) = cached.header("ETag") {
            ("If-None-Match", etag.to_owned())
        } else if let Some(last_modified) = cached.header("Last-Modified") {
            ("If-Modified-Since", last_modified.to_owned())
        } else if let Some(date) = cached.header("Date") {
            ("If-Modified-Since", date.to_owned())
        } else {
            // No condition to revalidate with.
            return self.network_only();
        };

        let mut headers = self.request.headers().new_builder();
        headers.add_lenient_pair(condition_name, &condition_value);
        let conditional_request = self.request.headers_replaced(headers.build());

        CacheStrategy {
            network_request: Some(conditional_request),
            cache_response: Some(cached),
        }
    }

    /// The current age of the cached response, per RFC 7234 §4.2.3.
    fn cache_response_age(&self, cached: &Response) -> i64 {
        let served_date = date_header_millis(cached.headers(), "Date");
        let received = cached.received_at() as i64;
        let sent = cached.sent_at() as i64;

        let apparent_received_age = match served_date {
            Some(served) => (received - served).max(0),
            None => 0,
        };
        let received_age = match age_header_seconds(cached.headers()) {
            Some(age) => apparent_received_age.max(age.saturating_mul(1000)),
            None => apparent_received_age,
        };
        let response_duration = received - sent;
        let resident_duration = self.now_millis as i64 - received;
        received_age + response_duration.max(0) + resident_duration.max(0)
    }

    /// How long the response stays fresh from its served date, per
    /// RFC 7234 §4.2.1 plus the 10% last-modified heuristic.
    fn compute_freshness_lifetime(&self, cached: &Response, caching: &CacheControl) -> i64 {
        if let Some(max_age) = caching.max_age_seconds {
            return max_age.saturating_mul(1000);
        }

        let served_date = date_header_millis(cached.headers(), "Date");
        if let Some(expires) = date_header_millis(cached.headers(), "Expires") {
            let served = served_date.unwrap_or(cached.received_at() as i64);
            return (expires - served).max(0);
        }

        if let Some(last_modified) = date_header_millis(cached.headers(), "Last-Modified") {
            // Freshness heuristic: a tenth of the document's age when
            // served. Not applied to URLs with a query, which tend to be
            // dynamic.
            if cached.request().url().query().is_none() {
                let served = served_date.unwrap_or(cached.sent_at() as i64);
                let delta = served - last_modified;
                return if delta > 0 { delta / 10 } else { 0 };
            }
        }

        0
    }

    /// Whether freshness came from the heuristic rather than explicit
    /// server policy.
    fn is_freshness_lifetime_heuristic(&self, cached: &Response) -> bool {
        CacheControl::parse(cached.headers()).max_age_seconds.is_none()
            && cached.header("Expires").is_none()
    }
}

/// The cache directives of one message, parsed from every
/// `Cache-Control` header plus legacy `Pragma: no-cache`.
#[derive(Debug, Default)]
pub(crate) struct CacheControl {
    pub no_cache: bool,
    pub no_store: bool,
    pub max_age_seconds: Option<i64>,
    pub min_fresh_seconds: Option<i64>,
    pub max_stale_seconds: Option<i64>,
    pub must_revalidate: bool,
    pub only_if_cached: bool,
    pub public: bool,
    pub private: bool,
}

impl CacheControl {
    pub fn parse(headers: &Headers) -> CacheControl {
        let mut result = CacheControl::default();
        for (name, value) in headers.iter() {
            let is_cache_control = name.eq_ignore_ascii_case("Cache-Control");
            if !is_cache_control && !name.eq_ignore_ascii_case("Pragma") {
                continue;
            }
            for directive in value.split(',') {
                let directive = directive.trim();
                let (key, arg) = match directive.split_once('=') {
                    Some((key, arg)) => (key.trim(), Some(arg.trim().trim_matches('"'))),
                    None => (directive, None),
                };
                match key.to_ascii_lowercase().as_str() {
                    "no-cache" => result.no_cache = true,
                    "no-store" if is_cache_control => result.no_store = true,
                    "max-age" if is_cache_control => {
                        result.max_age_seconds = parse_seconds(arg);
                    }
                    "min-fresh" if is_cache_control => {
                        result.min_fresh_seconds = parse_seconds(arg);
                    }
                    "max-stale" if is_cache_control => {
                        // Without an argument, any staleness is accepted.
                        result.max_stale_seconds =
                            parse_seconds(arg).or(Some(i64::MAX / 2000));
                    }
                    "must-revalidate" if is_cache_control => result.must_revalidate = true,
                    "only-if-cached" if is_cache_control => result.only_if_cached = true,
                    "public" if is_cache_control => result.public = true,
                    "private" if is_cache_control => result.private = true,
                    _ => {}
                }
            }
        }
        result
    }
}

fn parse_seconds(arg: Option<&str>) -> Option<i64> {
    arg.and_then(|s| s.parse::<i64>().ok()).map(|n| n.max(0))
}

/// Parses a date header into epoch millis, `None` when absent or
/// malformed.
pub(crate) fn date_header_millis(headers: &Headers, name: &str) -> Option<i64> {
    let value = headers.get(name)?;
    let time = httpdate::parse_http_date(value).ok()?;
    Some(
        time.duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0),
    )
}

fn age_header_seconds(headers: &Headers) -> Option<i64> {
    headers.get("Age").and_then(|v| v.trim().parse::<i64>().ok())
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::{is_cacheable, CacheStrategy};
    use crate::request::Request;
    use crate::response::{Response, ResponseBuilder};

    const NOW: u64 = 1_700_000_000_000;

    fn http_date(millis: u64) -> String {
        httpdate::fmt_http_date(UNIX_EPOCH + Duration::from_millis(millis))
    }

    fn request() -> Request {
        Request::get("http://example.com/doc").unwrap()
    }

    fn cached(age_millis: u64, headers: &[(&str, &str)]) -> Response {
        let served = NOW - age_millis;
        let mut builder = ResponseBuilder::new()
            .request(request())
            .code(200)
            .message("OK")
            .sent_at(served)
            .received_at(served)
            .header_added("Date", &http_date(served))
            .unwrap();
        for &(name, value) in headers {
            builder = builder.header_added(name, value).unwrap();
        }
        builder.build()
    }

    #[test]
    fn no_cached_response_means_network_only() {
        let strategy = CacheStrategy::compute(NOW, &request(), None);
        assert!(strategy.network_request.is_some());
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn fresh_max_age_is_a_cache_hit() {
        let response = cached(10_000, &[("Cache-Control", "max-age=60")]);
        let strategy = CacheStrategy::compute(NOW, &request(), Some(response));
        assert!(strategy.network_request.is_none());
        let hit = strategy.cache_response.unwrap();
        assert!(hit.header("Warning").is_none());
    }

    #[test]
    fn expired_max_age_with_etag_revalidates() {
        let response = cached(
            120_000,
            &[("Cache-Control", "max-age=60"), ("ETag", "\"v1\"")],
        );
        let strategy = CacheStrategy::compute(NOW, &request(), Some(response));
        let conditional = strategy.network_request.unwrap();
        assert_eq!(conditional.header("If-None-Match"), Some("\"v1\""));
        assert!(strategy.cache_response.is_some());
    }

    #[test]
    fn last_modified_is_second_choice_validator() {
        let response = cached(
            120_000,
            &[
                ("Cache-Control", "max-age=60"),
                ("Last-Modified", "Mon, 18 Jul 2016 16:06:00 GMT"),
            ],
        );
        let strategy = CacheStrategy::compute(NOW, &request(), Some(response));
        let conditional = strategy.network_request.unwrap();
        assert_eq!(
            conditional.header("If-Modified-Since"),
            Some("Mon, 18 Jul 2016 16:06:00 GMT")
        );
    }

    #[test]
    fn no_validator_means_network_only() {
        let served = NOW - 120_000;
        let response = ResponseBuilder::new()
            .request(request())
            .code(200)
            .sent_at(served)
            .received_at(served)
            .header_added("Cache-Control", "max-age=60")
            .unwrap()
            .build();
        let strategy = CacheStrategy::compute(NOW, &request(), Some(response));
        assert!(strategy.network_request.is_some());
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn max_stale_serves_expired_response_with_warning() {
        let response = cached(90_000, &[("Cache-Control", "max-age=60")]);
        let stale_ok = request().header_set("Cache-Control", "max-stale=120").unwrap();
        let strategy = CacheStrategy::compute(NOW, &stale_ok, Some(response));
        assert!(strategy.network_request.is_none());
        let hit = strategy.cache_response.unwrap();
        assert_eq!(
            hit.header("Warning"),
            Some("110 carrier \"Response is stale\"")
        );
    }

    #[test]
    fn must_revalidate_defeats_max_stale() {
        let response = cached(
            90_000,
            &[
                ("Cache-Control", "max-age=60, must-revalidate"),
                ("ETag", "\"v1\""),
            ],
        );
        let stale_ok = request().header_set("Cache-Control", "max-stale=120").unwrap();
        let strategy = CacheStrategy::compute(NOW, &stale_ok, Some(response));
        assert!(strategy.network_request.is_some());
    }

    #[test]
    fn heuristic_freshness_from_last_modified() {
        // Served 1 hour after modification: a tenth (6 minutes) is fresh.
        let served = NOW - 60_000;
        let modified = served - 3_600_000;
        let response = cached(60_000, &[("Last-Modified", &http_date(modified))]);
        let strategy = CacheStrategy::compute(NOW, &request(), Some(response));
        assert!(strategy.network_request.is_none());

        // But not for URLs with a query string.
        let query_request = Request::get("http://example.com/doc?v=1").unwrap();
        let served_response = ResponseBuilder::new()
            .request(query_request.clone())
            .code(200)
            .sent_at(served)
            .received_at(served)
            .header_added("Date", &http_date(served))
            .unwrap()
            .header_added("Last-Modified", &http_date(modified))
            .unwrap()
            .build();
        let strategy = CacheStrategy::compute(NOW, &query_request, Some(served_response));
        assert!(strategy.network_request.is_some());
    }

    #[test]
    fn heuristic_hit_older_than_a_day_carries_warning_113() {
        // Modified 30 days before serving; 10% = 3 days of freshness.
        let served = NOW - 2 * 24 * 3_600_000;
        let modified = served - 30 * 24 * 3_600_000;
        let response = ResponseBuilder::new()
            .request(request())
            .code(200)
            .sent_at(served)
            .received_at(served)
            .header_added("Date", &http_date(served))
            .unwrap()
            .header_added("Last-Modified", &http_date(modified))
            .unwrap()
            .build();
        let strategy = CacheStrategy::compute(NOW, &request(), Some(response));
        assert!(strategy.network_request.is_none());
        let hit = strategy.cache_response.unwrap();
        assert_eq!(
            hit.header("Warning"),
            Some("113 carrier \"Heuristic expiration\"")
        );
    }

    #[test]
    fn request_no_cache_goes_to_network() {
        let response = cached(1_000, &[("Cache-Control", "max-age=60")]);
        let no_cache = request().header_set("Cache-Control", "no-cache").unwrap();
        let strategy = CacheStrategy::compute(NOW, &no_cache, Some(response));
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn caller_conditions_go_to_network() {
        let response = cached(1_000, &[("Cache-Control", "max-age=60")]);
        let conditional = request().header_set("If-None-Match", "\"mine\"").unwrap();
        let strategy = CacheStrategy::compute(NOW, &conditional, Some(response));
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn https_without_handshake_goes_to_network() {
        let secure = Request::get("https://example.com/doc").unwrap();
        let served = NOW - 1_000;
        let response = ResponseBuilder::new()
            .request(secure.clone())
            .code(200)
            .sent_at(served)
            .received_at(served)
            .header_added("Cache-Control", "max-age=60")
            .unwrap()
            .build();
        let strategy = CacheStrategy::compute(NOW, &secure, Some(response));
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn only_if_cached_with_no_usable_entry_is_unsatisfiable() {
        let only_cached = request().header_set("Cache-Control", "only-if-cached").unwrap();
        let strategy = CacheStrategy::compute(NOW, &only_cached, None);
        assert!(strategy.network_request.is_none());
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn redirect_cacheability_needs_explicit_policy() {
        let plain_302 = cached(0, &[]);
        let plain_302 = {
            let mut b = plain_302.to_builder().code(302);
            b = b.header_removed("Cache-Control");
            b.build()
        };
        assert!(!is_cacheable(&plain_302, &request()));

        let expiring_302 = cached(0, &[("Expires", &http_date(NOW + 60_000))]);
        let expiring_302 = expiring_302.to_builder().code(302).build();
        assert!(is_cacheable(&expiring_302, &request()));

        let teapot = cached(0, &[("Cache-Control", "max-age=60")]);
        let teapot = teapot.to_builder().code(418).build();
        assert!(!is_cacheable(&teapot, &request()));
    }

    #[test]
    fn no_store_forbids_caching() {
        let response = cached(0, &[("Cache-Control", "no-store, max-age=60")]);
        assert!(!is_cacheable(&response, &request()));
    }

    #[test]
    fn strategy_is_deterministic() {
        let build = || cached(10_000, &[("Cache-Control", "max-age=60")]);
        let a = CacheStrategy::compute(NOW, &request(), Some(build()));
        let b = CacheStrategy::compute(NOW, &request(), Some(build()));
        assert_eq!(a.network_request.is_some(), b.network_request.is_some());
        assert_eq!(a.cache_response.is_some(), b.cache_response.is_some());
    }
}
