//! Rate-limited HTTP pipeline for the platform's REST API.
//!
//! Each call runs through three layers, outermost first:
//!
//! 1. a total-call timeout,
//! 2. a retry loop that waits out exhausted rate-limit buckets,
//! 3. the executor, which checks the [`RateLimiter`] before sending and
//!    feeds the response headers back into it.

use crate::config::{ConfigError, RestConfig};
use crate::error::{Error, RequestError};
use crate::metrics::Metrics;
use crate::ratelimit::{RateLimiter, RatelimitHeaders};
use bytes::Bytes;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, warn};

/// Placeholder for verb methods called without a body
pub const NO_BODY: Option<&()> = None;

/// Rate-limit identity of a request.
///
/// `endpoint` names the route independent of its ids; `major` is the
/// channel, guild or webhook id the route is scoped to, or 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Route {
    pub endpoint: &'static str,
    pub major: u64,
}

impl Route {
    pub const fn new(endpoint: &'static str, major: u64) -> Self {
        Self { endpoint, major }
    }
}

/// A file attached to a multipart request
#[derive(Debug, Clone)]
pub struct MultipartFile {
    pub filename: String,
    pub data: Bytes,
    pub description: Option<String>,
}

impl MultipartFile {
    pub fn new(filename: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            filename: filename.into(),
            data: data.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Request body, kept so every attempt can rebuild the request
enum Body {
    Empty,
    Json(Vec<u8>),
    Multipart {
        payload_json: Vec<u8>,
        files: Vec<MultipartFile>,
    },
}

/// HTTP client for the platform API.
///
/// Cheap to clone; clones share the connection pool, the rate limiter and
/// the metrics.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: Arc<str>,
    ratelimiter: Arc<RateLimiter>,
    metrics: Arc<Metrics>,
    timeout: Duration,
    max_ratelimit_retries: u32,
}

impl RestClient {
    pub fn new(config: RestConfig) -> Result<Self, Error> {
        let token = if config.token.starts_with("Bot ") {
            config.token.clone()
        } else {
            format!("Bot {}", config.token)
        };

        let mut auth = HeaderValue::from_str(&token).map_err(|_| ConfigError::InvalidToken)?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(config.user_agent.as_str())
            .http1_only()
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.as_str().into(),
            ratelimiter: Arc::new(RateLimiter::new()),
            metrics: Arc::new(Metrics::new()),
            timeout: config.timeout,
            max_ratelimit_retries: config.max_ratelimit_retries,
        })
    }

    /// Record responses into `metrics`, e.g. the cluster's
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Per-route response counts and latency
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn ratelimiter(&self) -> &Arc<RateLimiter> {
        &self.ratelimiter
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET `path`; a 404 yields `None` instead of an error
    pub async fn get<T: DeserializeOwned>(&self, path: &str, route: Route) -> Result<Option<T>, Error> {
        let body = self.send(Method::GET, path, route, &Body::Empty, true).await?;
        decode(body)
    }

    pub async fn post<T, B>(&self, path: &str, route: Route, body: Option<&B>) -> Result<Option<T>, Error>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = json_body(body)?;
        decode(self.send(Method::POST, path, route, &body, false).await?)
    }

    pub async fn patch<T, B>(&self, path: &str, route: Route, body: Option<&B>) -> Result<Option<T>, Error>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = json_body(body)?;
        decode(self.send(Method::PATCH, path, route, &body, false).await?)
    }

    pub async fn put<T, B>(&self, path: &str, route: Route, body: Option<&B>) -> Result<Option<T>, Error>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = json_body(body)?;
        decode(self.send(Method::PUT, path, route, &body, false).await?)
    }

    /// POST a multipart form: `payload` as `payload_json`, then `files[i]`
    pub async fn post_multipart<T, B>(
        &self,
        path: &str,
        route: Route,
        payload: &B,
        files: Vec<MultipartFile>,
    ) -> Result<Option<T>, Error>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = Body::Multipart {
            payload_json: serde_json::to_vec(payload)?,
            files,
        };
        decode(self.send(Method::POST, path, route, &body, false).await?)
    }

    pub async fn delete(&self, path: &str, route: Route) -> Result<(), Error> {
        self.send(Method::DELETE, path, route, &Body::Empty, false)
            .await
            .map(|_| ())
    }

    /// Run one call through the timeout and retry layers
    async fn send(
        &self,
        method: Method,
        path: &str,
        route: Route,
        body: &Body,
        ignore_not_found: bool,
    ) -> Result<Option<Bytes>, Error> {
        timeout(
            self.timeout,
            self.send_with_retries(method, path, route, body, ignore_not_found),
        )
        .await
        .map_err(|_| {
            warn!("{} {} timed out after {:?}", route.endpoint, clean_for_logging(path), self.timeout);
            Error::Timeout(self.timeout)
        })?
    }

    async fn send_with_retries(
        &self,
        method: Method,
        path: &str,
        route: Route,
        body: &Body,
        ignore_not_found: bool,
    ) -> Result<Option<Bytes>, Error> {
        let mut attempt = 0;
        loop {
            match self
                .execute(method.clone(), path, route, body, ignore_not_found)
                .await
            {
                Err(Error::BucketExhausted(exhausted)) if attempt < self.max_ratelimit_retries => {
                    attempt += 1;
                    debug!(
                        "{}: bucket {}/{} exhausted, retrying in {:?} (attempt {})",
                        route.endpoint, exhausted.bucket, exhausted.major, exhausted.retry_after, attempt
                    );
                    sleep(exhausted.retry_after).await;
                }
                result => return result,
            }
        }
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        route: Route,
        body: &Body,
        ignore_not_found: bool,
    ) -> Result<Option<Bytes>, Error> {
        self.ratelimiter
            .allow_request(route.endpoint, route.major, Instant::now())?;

        let logged_path = clean_for_logging(path);
        debug!("Request: {} {}", method, logged_path);

        let request = self.build_request(method.clone(), path, body)?;
        let started = Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                error!("HTTP error: {} {}: {}", method, logged_path, e);
                return Err(e.into());
            }
        };

        let status = response.status();
        let elapsed = started.elapsed();
        self.metrics
            .record_rest_response(&format!("{} {}", method, route.endpoint), status.as_u16(), elapsed);

        let headers = RatelimitHeaders::parse(response.headers());
        self.ratelimiter
            .handle_response(route.endpoint, route.major, &headers, Instant::now());

        debug!(
            "Response: {} {} -> {} (in {} ms)",
            method,
            logged_path,
            status,
            elapsed.as_millis()
        );

        if status.is_success() {
            if status == StatusCode::NO_CONTENT {
                return Ok(None);
            }
            let bytes = response.bytes().await?;
            return Ok(if bytes.is_empty() { None } else { Some(bytes) });
        }

        if status == StatusCode::NOT_FOUND && ignore_not_found {
            return Ok(None);
        }

        let text = response.text().await.unwrap_or_default();
        let err = RequestError::new(status.as_u16(), text);
        if let Some(api) = &err.api_error {
            warn!("API error: {} {} (on {} {})", api.code, api.message, method, logged_path);
        }
        Err(err.into())
    }

    fn build_request(&self, method: Method, path: &str, body: &Body) -> Result<reqwest::RequestBuilder, Error> {
        let request = self.http.request(method, format!("{}{}", self.base_url, path));
        Ok(match body {
            Body::Empty => request,
            Body::Json(json) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(json.clone()),
            Body::Multipart {
                payload_json,
                files,
            } => {
                let mut form = Form::new().part(
                    "payload_json",
                    Part::bytes(payload_json.clone()).mime_str("application/json")?,
                );
                for (i, file) in files.iter().enumerate() {
                    let part = Part::stream(file.data.clone()).file_name(file.filename.clone());
                    form = form.part(format!("files[{}]", i), part);
                }
                request.multipart(form)
            }
        })
    }
}

fn json_body<B: Serialize + ?Sized>(body: Option<&B>) -> Result<Body, Error> {
    Ok(match body {
        Some(body) => Body::Json(serde_json::to_vec(body)?),
        None => Body::Empty,
    })
}

fn decode<T: DeserializeOwned>(body: Option<Bytes>) -> Result<Option<T>, Error> {
    body.map(|bytes| serde_json::from_slice(&bytes))
        .transpose()
        .map_err(Error::from)
}

/// Replace webhook and interaction tokens in a request path with `:token`
pub fn clean_for_logging(path: &str) -> String {
    let (path, query) = match path.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path, None),
    };

    let mut segments: Vec<&str> = path.split('/').collect();
    for i in 0..segments.len() {
        let secret_follows = matches!(segments[i], "webhooks" | "interactions")
            && segments
                .get(i + 1)
                .is_some_and(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()));
        if secret_follows && i + 2 < segments.len() && !segments[i + 2].is_empty() {
            segments[i + 2] = ":token";
        }
    }

    let mut cleaned = segments.join("/");
    if let Some(query) = query {
        cleaned.push('?');
        cleaned.push_str(query);
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, RequestErrorKind};
    use serde::Deserialize;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Deserialize, PartialEq)]
    struct Thing {
        id: String,
    }

    fn client(server: &MockServer) -> RestClient {
        client_with(server, |b| b)
    }

    fn client_with(
        server: &MockServer,
        f: impl FnOnce(crate::config::RestConfigBuilder) -> crate::config::RestConfigBuilder,
    ) -> RestClient {
        let config = f(RestConfig::builder("token").base_url(server.uri()))
            .build()
            .unwrap();
        RestClient::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_get_sends_auth_and_decodes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/things/1"))
            .and(header("authorization", "Bot token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "1"})))
            .expect(1)
            .mount(&server)
            .await;

        let thing: Option<Thing> = client(&server)
            .get("/things/1", Route::new("get_thing", 1))
            .await
            .unwrap();
        assert_eq!(thing, Some(Thing { id: "1".to_string() }));
    }

    #[tokio::test]
    async fn test_get_not_found_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"code": 10003, "message": "Unknown Channel"})))
            .mount(&server)
            .await;

        let thing: Option<Thing> = client(&server)
            .get("/channels/5", Route::new("get_channel", 5))
            .await
            .unwrap();
        assert!(thing.is_none());
    }

    #[tokio::test]
    async fn test_post_not_found_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/channels/5/messages"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"code": 10003, "message": "Unknown Channel"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/channels/5/messages"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"code": 10003, "message": "Unknown Channel"})))
            .mount(&server)
            .await;

        let rest = client(&server);
        let route = Route::new("channel_messages", 5);
        let missing: Option<Thing> = rest.get("/channels/5/messages", route).await.unwrap();
        assert!(missing.is_none());

        let err = rest
            .post::<Thing, _>("/channels/5/messages", route, Some(&json!({"content": "hi"})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Request);
        let request = err.as_request_error().unwrap();
        assert_eq!(request.kind, RequestErrorKind::NotFound);
        assert_eq!(request.code(), Some(10003));
    }

    #[tokio::test]
    async fn test_responses_recorded_per_route_and_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/things/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "1"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/things/2"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let shared = Arc::new(Metrics::new());
        let rest = client(&server).with_metrics(shared.clone());
        let _: Option<Thing> = rest.get("/things/1", Route::new("get_thing", 1)).await.unwrap();
        let _: Option<Thing> = rest.get("/things/1", Route::new("get_thing", 1)).await.unwrap();
        let _: Option<Thing> = rest.get("/things/2", Route::new("get_thing", 2)).await.unwrap();
        rest.delete("/things/1", Route::new("delete_thing", 1)).await.unwrap();

        assert_eq!(shared.rest_responses(), 4);
        let summary: Vec<(String, u16, u64)> = rest
            .metrics()
            .route_metrics()
            .into_iter()
            .map(|r| (r.route, r.status, r.count))
            .collect();
        assert_eq!(
            summary,
            [
                ("DELETE delete_thing".to_string(), 204, 1),
                ("GET get_thing".to_string(), 200, 2),
                ("GET get_thing".to_string(), 404, 1),
            ]
        );
    }

    #[tokio::test]
    async fn test_not_found_on_other_verbs_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"code": 10008, "message": "Unknown Message"})))
            .mount(&server)
            .await;

        let err = client(&server)
            .delete("/channels/5/messages/6", Route::new("delete_message", 5))
            .await
            .unwrap_err();
        let request = err.as_request_error().unwrap();
        assert_eq!(request.kind, RequestErrorKind::NotFound);
        assert_eq!(request.code(), Some(10008));
    }

    #[tokio::test]
    async fn test_error_statuses_map_to_kinds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/forbidden"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({"code": 50013, "message": "Missing Permissions"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(502).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let rest = client(&server);
        let err = rest
            .post::<Thing, _>("/forbidden", Route::new("forbidden", 0), Some(&json!({})))
            .await
            .unwrap_err();
        let request = err.as_request_error().unwrap();
        assert_eq!(request.kind, RequestErrorKind::Forbidden);
        assert_eq!(request.api_error.as_ref().unwrap().message, "Missing Permissions");

        let err = rest
            .post::<Thing, _>("/broken", Route::new("broken", 0), NO_BODY)
            .await
            .unwrap_err();
        let request = err.as_request_error().unwrap();
        assert_eq!(request.kind, RequestErrorKind::Unknown);
        assert_eq!(request.status, 502);
        assert_eq!(request.body, "upstream down");
    }

    #[tokio::test]
    async fn test_no_content_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let result: Option<Thing> = client(&server)
            .put("/reactions", Route::new("create_reaction", 1), NO_BODY)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_waits_for_exhausted_bucket() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "1"}))
                    .insert_header("x-ratelimit-limit", "1")
                    .insert_header("x-ratelimit-remaining", "0")
                    .insert_header("x-ratelimit-reset", "1700000000.5")
                    .insert_header("x-ratelimit-reset-after", "0.2")
                    .insert_header("x-ratelimit-bucket", "abc"),
            )
            .expect(2)
            .mount(&server)
            .await;

        let rest = client(&server);
        let route = Route::new("get_thing", 1);
        let _: Option<Thing> = rest.get("/things/1", route).await.unwrap();

        let started = std::time::Instant::now();
        let thing: Option<Thing> = rest.get("/things/1", route).await.unwrap();
        assert!(thing.is_some());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_after_retry_cap() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "1"}))
                    .insert_header("x-ratelimit-limit", "1")
                    .insert_header("x-ratelimit-remaining", "0")
                    .insert_header("x-ratelimit-reset", "1700000000.5")
                    .insert_header("x-ratelimit-reset-after", "30")
                    .insert_header("x-ratelimit-bucket", "abc"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let rest = client_with(&server, |b| b.max_ratelimit_retries(0));
        let route = Route::new("get_thing", 1);
        let _: Option<Thing> = rest.get("/things/1", route).await.unwrap();

        let err = rest.get::<Thing>("/things/1", route).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BucketExhausted);
    }

    #[tokio::test]
    async fn test_timeout_bounds_call() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let rest = client_with(&server, |b| b.timeout(Duration::from_millis(100)));
        let err = rest
            .get::<Thing>("/slow", Route::new("slow", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_multipart_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("name=\"payload_json\""))
            .and(body_string_contains("filename=\"a.txt\""))
            .and(body_string_contains("hello"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "9"})))
            .expect(1)
            .mount(&server)
            .await;

        let thing: Option<Thing> = client(&server)
            .post_multipart(
                "/channels/1/messages",
                Route::new("create_message", 1),
                &json!({"content": "hi"}),
                vec![MultipartFile::new("a.txt", "hello")],
            )
            .await
            .unwrap();
        assert_eq!(thing, Some(Thing { id: "9".to_string() }));
    }

    #[test]
    fn test_clean_for_logging() {
        assert_eq!(
            clean_for_logging("/webhooks/123/s3cr3t?wait=true"),
            "/webhooks/123/:token?wait=true"
        );
        assert_eq!(
            clean_for_logging("/interactions/5/tok/callback"),
            "/interactions/5/:token/callback"
        );
        assert_eq!(clean_for_logging("/webhooks/123"), "/webhooks/123");
        assert_eq!(clean_for_logging("/channels/1/messages"), "/channels/1/messages");
    }
}
