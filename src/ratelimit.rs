//! Client-side tracking of the platform's REST rate limits.
//!
//! Every response reports the bucket it counted against through the
//! `X-RateLimit-*` headers. The limiter learns which bucket an endpoint maps
//! to and how many requests that bucket allows, then refuses requests locally
//! once a bucket is empty instead of letting the server reject them.
//!
//! Buckets are keyed by `(bucket hash, major id)`: several limits are scoped
//! per channel or per webhook, so the same endpoint hitting two channels
//! draws from two independent buckets.

use crate::error::BucketExhausted;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use http::HeaderMap;
use parking_lot::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Delay reported when a bucket has no usable reset time
const FALLBACK_DELAY: Duration = Duration::from_millis(200);
/// Reset delays shorter than this fall back to `FALLBACK_DELAY`
const EPSILON: Duration = Duration::from_millis(10);
/// An empty bucket without reset info lets one request through after this
const STALE_TIMEOUT: Duration = Duration::from_secs(5);
/// Added to every exhaustion wait to absorb clock skew
const WAIT_BUFFER: Duration = Duration::from_millis(50);
/// Buckets unused for this long are dropped
const UNUSED_BUCKET_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Minimum spacing of prune passes
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

const LIMIT_HEADER: &str = "x-ratelimit-limit";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RESET_HEADER: &str = "x-ratelimit-reset";
const RESET_AFTER_HEADER: &str = "x-ratelimit-reset-after";
const BUCKET_HEADER: &str = "x-ratelimit-bucket";
const GLOBAL_HEADER: &str = "x-ratelimit-global";
const RETRY_AFTER_HEADER: &str = "retry-after";

/// Rate-limit metadata of one response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RatelimitHeaders {
    pub global: bool,
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Absolute reset time as reported by the server clock
    pub reset: Option<SystemTime>,
    pub reset_after: Option<Duration>,
    pub bucket: Option<String>,
    pub retry_after: Option<Duration>,
}

impl RatelimitHeaders {
    /// Extract the rate-limit headers; unparsable values are treated as absent
    pub fn parse(headers: &HeaderMap) -> Self {
        let text = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim);
        let number = |name: &str| text(name).and_then(|v| v.parse::<u32>().ok());
        let seconds = |name: &str| {
            text(name)
                .and_then(|v| v.parse::<f64>().ok())
                .and_then(|v| Duration::try_from_secs_f64(v).ok())
        };

        Self {
            global: text(GLOBAL_HEADER).is_some_and(|v| v.eq_ignore_ascii_case("true")),
            limit: number(LIMIT_HEADER),
            remaining: number(REMAINING_HEADER),
            reset: seconds(RESET_HEADER).map(|since_epoch| UNIX_EPOCH + since_epoch),
            reset_after: seconds(RESET_AFTER_HEADER),
            bucket: text(BUCKET_HEADER).filter(|v| !v.is_empty()).map(str::to_string),
            retry_after: seconds(RETRY_AFTER_HEADER),
        }
    }

    /// All bucket headers are present
    pub fn has_ratelimit_info(&self) -> bool {
        self.limit.is_some()
            && self.remaining.is_some()
            && self.reset.is_some()
            && self.reset_after.is_some()
            && self.bucket.is_some()
    }

    /// How long a global limit lasts, preferring the relative headers
    fn global_delay(&self) -> Option<Duration> {
        self.retry_after.or(self.reset_after).or_else(|| {
            self.reset
                .and_then(|reset| reset.duration_since(SystemTime::now()).ok())
        })
    }
}

/// Local view of one server-side bucket
#[derive(Debug, Clone)]
pub struct Bucket {
    key: String,
    major: u64,
    limit: u32,
    remaining: u32,
    next_reset: Option<Instant>,
    /// `next_reset` came from the server and has not been consumed yet
    reset_valid: bool,
    has_received_headers: bool,
    last_used: Instant,
}

impl Bucket {
    pub fn new(key: impl Into<String>, major: u64, limit: u32, now: Instant) -> Self {
        Self {
            key: key.into(),
            major,
            limit,
            remaining: limit,
            next_reset: None,
            reset_valid: false,
            has_received_headers: false,
            last_used: now,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn major(&self) -> u64 {
        self.major
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Refill on reset, or release one request from a stale empty bucket
    pub fn tick(&mut self, now: Instant) {
        // Before the first reset is known, measure staleness from now
        let next_reset = *self.next_reset.get_or_insert(now);

        if self.reset_valid && now > next_reset {
            debug!(
                "{}/{}: Bucket reset, refilling with {} requests",
                self.key, self.major, self.limit
            );
            self.remaining = self.limit;
            self.reset_valid = false;
            return;
        }

        if !self.reset_valid
            && self.remaining == 0
            && now.saturating_duration_since(next_reset) > STALE_TIMEOUT
        {
            warn!(
                "{}/{}: Bucket is stale ({:?} without rate limit info), allowing one request through",
                self.key, self.major, STALE_TIMEOUT
            );
            self.remaining = 1;
            self.next_reset = Some(now);
        }
    }

    /// Take one request from the bucket if any are left
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.last_used = now;

        if self.remaining > 0 {
            trace!(
                "{}/{}: {}/{} left, allowing through",
                self.key, self.major, self.remaining, self.limit
            );
            self.remaining -= 1;
            return true;
        }

        debug!(
            "{}/{}: {}/{} left, denying",
            self.key, self.major, self.remaining, self.limit
        );
        false
    }

    /// Fold a response's headers into the bucket.
    ///
    /// The reset time only moves forward. `remaining` is adopted from the
    /// first response only, and never raised above the local count, since
    /// requests already in flight have not been reported yet.
    pub fn handle_response(&mut self, headers: &RatelimitHeaders, now: Instant) {
        if let Some(reset_after) = headers.reset_after {
            let header_reset = now + reset_after;
            if self.next_reset.map_or(true, |current| header_reset > current) {
                trace!(
                    "{}/{}: Reset in {:?} (server remaining {:?}, local remaining {})",
                    self.key, self.major, reset_after, headers.remaining, self.remaining
                );
                self.next_reset = Some(header_reset);
                self.reset_valid = true;
            }
        }

        if let Some(limit) = headers.limit {
            self.limit = limit;
        }

        if let (Some(remaining), false) = (headers.remaining, self.has_received_headers) {
            let previous = self.remaining;
            self.remaining = remaining.min(self.remaining);
            self.has_received_headers = true;
            debug!(
                "{}/{}: First remaining {} from server, local {} -> {}",
                self.key, self.major, remaining, previous, self.remaining
            );
        }
    }

    /// How long until the bucket is expected to refill
    pub fn reset_delay(&self, now: Instant) -> Duration {
        if !self.reset_valid {
            return FALLBACK_DELAY;
        }

        let delay = self
            .next_reset
            .map_or(Duration::ZERO, |reset| reset.saturating_duration_since(now));
        if delay < EPSILON {
            FALLBACK_DELAY
        } else {
            delay
        }
    }
}

/// Shared rate-limit state for all requests of one client.
///
/// Safe to use from many tasks at once; each bucket is locked independently.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<(String, u64), Bucket>,
    /// Endpoint name to server bucket hash
    endpoint_keys: DashMap<String, String>,
    /// Bucket hash to its last reported limit
    known_limits: DashMap<String, u32>,
    global_expiry: Mutex<Option<Instant>>,
    last_prune: Mutex<Instant>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
            endpoint_keys: DashMap::new(),
            known_limits: DashMap::new(),
            global_expiry: Mutex::new(None),
            last_prune: Mutex::new(Instant::now()),
        }
    }

    /// Reserve one request on `endpoint`/`major`.
    ///
    /// Endpoints the limiter has not seen a response for yet are always let
    /// through. The error's `retry_after` includes a small safety buffer.
    pub fn allow_request(&self, endpoint: &str, major: u64, now: Instant) -> Result<(), BucketExhausted> {
        if let Some(expiry) = self.active_global_expiry(now) {
            warn!(
                "Globally rate limited for {:?}, refusing {}",
                expiry - now,
                endpoint
            );
            return Err(BucketExhausted {
                bucket: "global".to_string(),
                major,
                retry_after: expiry - now,
                global: true,
            });
        }

        self.maybe_prune(now);

        let Some(mut bucket) = self.bucket_mut(endpoint, major, now) else {
            debug!("No rate limit data for {}, allowing through", endpoint);
            return Ok(());
        };

        bucket.tick(now);
        if bucket.try_acquire(now) {
            return Ok(());
        }

        Err(BucketExhausted {
            bucket: bucket.value().key().to_string(),
            major,
            retry_after: bucket.reset_delay(now) + WAIT_BUFFER,
            global: false,
        })
    }

    /// Learn from a response to `endpoint`/`major`
    pub fn handle_response(&self, endpoint: &str, major: u64, headers: &RatelimitHeaders, now: Instant) {
        if headers.global {
            if let Some(delay) = headers.global_delay() {
                warn!("Global rate limit hit, resetting in {:?}", delay);
                *self.global_expiry.lock() = Some(now + delay);
            }
            return;
        }

        if !headers.has_ratelimit_info() {
            return;
        }

        if let Some(key) = &headers.bucket {
            self.endpoint_keys.insert(endpoint.to_string(), key.clone());
            if let Some(limit) = headers.limit {
                self.known_limits.insert(key.clone(), limit);
            }
        }

        if let Some(mut bucket) = self.bucket_mut(endpoint, major, now) {
            bucket.handle_response(headers, now);
        }
    }

    /// Number of live buckets
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Drop buckets that have not been used for five minutes
    pub fn prune(&self, now: Instant) {
        self.buckets.retain(|(key, major), bucket| {
            let keep = now.saturating_duration_since(bucket.last_used()) <= UNUSED_BUCKET_TIMEOUT;
            if !keep {
                debug!("Pruning unused bucket {}/{}", key, major);
            }
            keep
        });
    }

    fn maybe_prune(&self, now: Instant) {
        {
            let mut last_prune = self.last_prune.lock();
            if now.saturating_duration_since(*last_prune) < PRUNE_INTERVAL {
                return;
            }
            *last_prune = now;
        }
        self.prune(now);
    }

    fn active_global_expiry(&self, now: Instant) -> Option<Instant> {
        let mut expiry = self.global_expiry.lock();
        match *expiry {
            Some(at) if at > now => Some(at),
            Some(_) => {
                *expiry = None;
                None
            }
            None => None,
        }
    }

    /// The bucket for an endpoint, created from the known limit of its hash
    fn bucket_mut(&self, endpoint: &str, major: u64, now: Instant) -> Option<RefMut<'_, (String, u64), Bucket>> {
        let key = self.endpoint_keys.get(endpoint)?.value().clone();

        if let Some(bucket) = self.buckets.get_mut(&(key.clone(), major)) {
            return Some(bucket);
        }

        let limit = *self.known_limits.get(&key)?.value();
        debug!("Creating bucket {}/{} with limit {}", key, major, limit);
        Some(
            self.buckets
                .entry((key.clone(), major))
                .or_insert_with(|| Bucket::new(key, major, limit, now)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderName, HeaderValue};

    fn headers(pairs: &[(&str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            let name = HeaderName::from_bytes(name.as_bytes()).unwrap();
            map.insert(name, HeaderValue::from_static(value));
        }
        map
    }

    fn bucket_headers(bucket: &str, limit: u32, remaining: u32, reset_after: Duration) -> RatelimitHeaders {
        RatelimitHeaders {
            global: false,
            limit: Some(limit),
            remaining: Some(remaining),
            reset: Some(SystemTime::now() + reset_after),
            reset_after: Some(reset_after),
            bucket: Some(bucket.to_string()),
            retry_after: None,
        }
    }

    #[test]
    fn test_parse_headers() {
        let parsed = RatelimitHeaders::parse(&headers(&[
            ("X-RateLimit-Limit", "5"),
            ("X-RateLimit-Remaining", "4"),
            ("X-RateLimit-Reset", "1470173023.123"),
            ("X-RateLimit-Reset-After", "1.5"),
            ("X-RateLimit-Bucket", "abcd1234"),
        ]));

        assert_eq!(parsed.limit, Some(5));
        assert_eq!(parsed.remaining, Some(4));
        assert_eq!(parsed.reset_after, Some(Duration::from_millis(1500)));
        assert_eq!(parsed.bucket.as_deref(), Some("abcd1234"));
        assert!(!parsed.global);
        assert!(parsed.has_ratelimit_info());

        let reset = parsed.reset.unwrap().duration_since(UNIX_EPOCH).unwrap();
        assert_eq!(reset.as_secs(), 1470173023);
    }

    #[test]
    fn test_parse_global_and_garbage() {
        let parsed = RatelimitHeaders::parse(&headers(&[
            ("X-RateLimit-Global", "True"),
            ("Retry-After", "2"),
            ("X-RateLimit-Limit", "lots"),
            ("X-RateLimit-Reset-After", "-1"),
        ]));

        assert!(parsed.global);
        assert_eq!(parsed.retry_after, Some(Duration::from_secs(2)));
        assert_eq!(parsed.limit, None);
        assert_eq!(parsed.reset_after, None);
        assert!(!parsed.has_ratelimit_info());
    }

    #[test]
    fn test_unknown_endpoint_allowed() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        for _ in 0..10 {
            assert!(limiter.allow_request("get_channel", 1, now).is_ok());
        }
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn test_bucket_exhausts_and_refills() {
        let limiter = RateLimiter::new();
        let now = Instant::now();

        limiter.allow_request("create_message", 7, now).unwrap();
        limiter.handle_response(
            "create_message",
            7,
            &bucket_headers("hash", 2, 1, Duration::from_secs(2)),
            now,
        );
        assert_eq!(limiter.bucket_count(), 1);

        assert!(limiter.allow_request("create_message", 7, now).is_ok());
        let err = limiter.allow_request("create_message", 7, now).unwrap_err();
        assert_eq!(err.bucket, "hash");
        assert_eq!(err.major, 7);
        assert!(!err.global);
        assert_eq!(err.retry_after, Duration::from_secs(2) + WAIT_BUFFER);

        // Another channel has its own bucket with the known limit
        assert!(limiter.allow_request("create_message", 8, now).is_ok());
        assert_eq!(limiter.bucket_count(), 2);

        let later = now + Duration::from_millis(2001);
        assert!(limiter.allow_request("create_message", 7, later).is_ok());
        assert!(limiter.allow_request("create_message", 7, later).is_ok());
        assert!(limiter.allow_request("create_message", 7, later).is_err());
    }

    #[test]
    fn test_endpoints_share_server_bucket() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        let headers = bucket_headers("shared", 1, 0, Duration::from_secs(1));

        limiter.handle_response("edit_message", 3, &headers, now);
        limiter.handle_response("delete_message", 3, &headers, now);

        assert!(limiter.allow_request("delete_message", 3, now).is_err());
        assert!(limiter.allow_request("edit_message", 3, now).is_err());
    }

    #[test]
    fn test_first_remaining_only_lowers() {
        let now = Instant::now();
        let mut bucket = Bucket::new("b", 0, 5, now);

        assert!(bucket.try_acquire(now));
        assert!(bucket.try_acquire(now));
        bucket.handle_response(&bucket_headers("b", 5, 4, Duration::from_secs(1)), now);
        assert_eq!(bucket.remaining(), 3);

        // Later responses do not overwrite the local count
        bucket.handle_response(&bucket_headers("b", 5, 0, Duration::from_secs(1)), now);
        assert_eq!(bucket.remaining(), 3);
    }

    #[test]
    fn test_reset_only_moves_forward() {
        let now = Instant::now();
        let mut bucket = Bucket::new("b", 0, 1, now);

        bucket.handle_response(&bucket_headers("b", 1, 1, Duration::from_secs(3)), now);
        bucket.handle_response(&bucket_headers("b", 1, 1, Duration::from_secs(1)), now);
        assert_eq!(bucket.reset_delay(now), Duration::from_secs(3));
    }

    #[test]
    fn test_reset_delay_fallbacks() {
        let now = Instant::now();
        let mut bucket = Bucket::new("b", 0, 1, now);
        assert_eq!(bucket.reset_delay(now), FALLBACK_DELAY);

        bucket.handle_response(&bucket_headers("b", 1, 0, Duration::from_millis(5)), now);
        assert_eq!(bucket.reset_delay(now), FALLBACK_DELAY);
    }

    #[test]
    fn test_stale_bucket_releases_one() {
        let now = Instant::now();
        let mut bucket = Bucket::new("b", 0, 1, now);
        bucket.tick(now);
        assert!(bucket.try_acquire(now));

        let soon = now + Duration::from_secs(1);
        bucket.tick(soon);
        assert!(!bucket.try_acquire(soon));

        let stale = now + Duration::from_secs(6);
        bucket.tick(stale);
        assert!(bucket.try_acquire(stale));
        bucket.tick(stale);
        assert!(!bucket.try_acquire(stale));
    }

    #[test]
    fn test_global_limit() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        let global = RatelimitHeaders {
            global: true,
            retry_after: Some(Duration::from_secs(1)),
            ..Default::default()
        };

        limiter.handle_response("get_user", 0, &global, now);
        let err = limiter.allow_request("anything", 9, now).unwrap_err();
        assert!(err.global);
        assert_eq!(err.retry_after, Duration::from_secs(1));

        let later = now + Duration::from_secs(2);
        assert!(limiter.allow_request("anything", 9, later).is_ok());
    }

    #[test]
    fn test_prune_unused_buckets() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        limiter.handle_response("get_channel", 1, &bucket_headers("h", 5, 5, Duration::from_secs(1)), now);
        limiter.allow_request("get_channel", 1, now).unwrap();
        assert_eq!(limiter.bucket_count(), 1);

        limiter.prune(now + Duration::from_secs(60));
        assert_eq!(limiter.bucket_count(), 1);

        limiter.prune(now + Duration::from_secs(301));
        assert_eq!(limiter.bucket_count(), 0);

        // Known limits survive pruning; the bucket comes back on demand
        let later = now + Duration::from_secs(302);
        limiter.allow_request("get_channel", 1, later).unwrap();
        assert_eq!(limiter.bucket_count(), 1);
    }
}
