//! HTTP transport.
//!
//! Turns a [`Request`] into an HTTP call against the configured endpoint,
//! applies the request's cache policy and classifies the response. A
//! `Transport` is owned by the client's request worker and is only ever
//! driven from there.

use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{cache_key, CachePolicy, CacheStore};
use crate::codec;
use crate::config::{Config, DEFAULT_MAX_CACHE_AGE};
use crate::error::{Error, Result};
use crate::value::Value;

/// URLs longer than this carry their query document in the body instead.
pub const MAX_URL_LEN: usize = 2048;

/// Header Deployd checks for the root key.
pub const SECRET_HEADER: &str = "dpd-ssh-key";

/// HTTP verbs used against a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }

    /// Only reads take part in caching.
    pub fn is_read(self) -> bool {
        self == Method::Get
    }

    fn to_reqwest(self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// One operation against a collection, with payloads already in wire form.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub entity_name: String,
    /// Entity id or reserved sub-path (`login`, `count`, ...).
    pub path: Option<String>,
    pub query: Option<Json>,
    pub body: Option<Json>,
    pub cache_policy: CachePolicy,
    pub max_cache_age: Duration,
}

impl Request {
    pub fn new(method: Method, entity_name: impl Into<String>) -> Self {
        Self {
            method,
            entity_name: entity_name.into(),
            path: None,
            query: None,
            body: None,
            cache_policy: CachePolicy::IgnoreCache,
            max_cache_age: DEFAULT_MAX_CACHE_AGE,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_query(mut self, query: Json) -> Self {
        self.query = Some(query);
        self
    }

    pub fn with_body(mut self, body: Json) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_cache(mut self, policy: CachePolicy, max_age: Duration) -> Self {
        self.cache_policy = policy;
        self.max_cache_age = max_age;
        self
    }
}

/// A classified, decoded response
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
    /// True when the body came from the cache rather than the network.
    pub from_cache: bool,
}

/// Error body returned by Deployd
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    errors: Option<serde_json::Map<String, Json>>,
}

impl ErrorBody {
    fn describe(&self) -> Option<String> {
        if let Some(message) = &self.message {
            return Some(message.clone());
        }
        self.errors.as_ref().map(|errors| {
            errors
                .iter()
                .map(|(field, reason)| match reason.as_str() {
                    Some(reason) => format!("{}: {}", field, reason),
                    None => format!("{}: {}", field, reason),
                })
                .collect::<Vec<_>>()
                .join(", ")
        })
    }
}

/// Map an HTTP status and raw body to a decoded value or a typed error.
pub fn classify(status: u16, body: &[u8]) -> Result<Value> {
    if (200..300).contains(&status) {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        let json: Json = serde_json::from_slice(body)?;
        return Ok(codec::decode(&json)?);
    }

    let parsed: ErrorBody = serde_json::from_slice(body).unwrap_or_default();
    let message = parsed.describe().unwrap_or_else(|| {
        let text = String::from_utf8_lossy(body).trim().to_string();
        if text.is_empty() {
            format!("HTTP {}", status)
        } else {
            text
        }
    });

    match status {
        400 if parsed.errors.is_some() => Err(Error::InvalidParams(message)),
        401 | 403 => Err(Error::OperationNotAllowed { status, message }),
        409 => Err(Error::DuplicateKey { status, message }),
        400..=599 if message.to_lowercase().contains("duplicate key") => {
            Err(Error::DuplicateKey { status, message })
        }
        400..=599 => Err(Error::OperationFailed {
            status: Some(status),
            message,
        }),
        _ => Err(Error::UnknownStatus(status)),
    }
}

fn send_error(e: reqwest::Error) -> Error {
    if e.is_connect() || e.is_timeout() || e.is_request() {
        Error::ConnectionFailed(e.to_string())
    } else {
        Error::from(e)
    }
}

/// HTTP transport with its response cache
pub struct Transport {
    http: reqwest::Client,
    endpoint: String,
    request_log: bool,
    cache: CacheStore,
}

impl Transport {
    pub fn new(config: &Config) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(secret) = &config.secret {
            let value = HeaderValue::from_str(secret)
                .map_err(|_| Error::InvalidParams("secret is not a valid header value".into()))?;
            headers.insert(HeaderName::from_static(SECRET_HEADER), value);
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .cookie_store(true)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::InvalidParams(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            request_log: config.request_log,
            cache: CacheStore::new(),
        })
    }

    /// Resolve the URL and body text for a request.
    pub fn prepare(&self, req: &Request) -> Result<(String, Option<String>)> {
        let mut url = format!("{}/{}", self.endpoint, urlencoding::encode(&req.entity_name));
        if let Some(path) = &req.path {
            url.push('/');
            url.push_str(&urlencoding::encode(path));
        }

        let mut body = match &req.body {
            Some(json) => Some(serde_json::to_string(json)?),
            None => None,
        };

        if let Some(query) = &req.query {
            let text = serde_json::to_string(query)?;
            let encoded = urlencoding::encode(&text);
            if req.method.is_read() && url.len() + 1 + encoded.len() <= MAX_URL_LEN {
                url.push('?');
                url.push_str(&encoded);
            } else if body.is_none() {
                body = Some(text);
            } else {
                return Err(Error::InvalidParams(
                    "request has both a body and an oversized query".into(),
                ));
            }
        }

        Ok((url, body))
    }

    /// Run a request through the cache policy and, if needed, the network.
    pub async fn execute(&mut self, req: &Request, request_id: Uuid) -> Result<Response> {
        let (url, body) = self.prepare(req)?;
        let cacheable = req.method.is_read() && req.cache_policy != CachePolicy::IgnoreCache;
        let key = cache_key(req.method.as_str(), &url, body.as_deref());
        self.cache.purge_expired(Instant::now());

        if cacheable && req.cache_policy == CachePolicy::UseCacheElseLoad {
            if let Some(entry) = self.cache.get_fresh(&key, req.max_cache_age, Instant::now()) {
                self.log_response(request_id, 200, &entry.body, true);
                return Ok(Response {
                    status: 200,
                    body: entry.body.clone(),
                    from_cache: true,
                });
            }
        }

        match self.send(req.method, &url, body, request_id).await {
            Ok(response) => {
                if cacheable {
                    self.cache.insert(
                        key,
                        response.body.clone(),
                        req.cache_policy,
                        req.max_cache_age,
                        Instant::now(),
                    );
                }
                Ok(response)
            }
            Err(err)
                if err.is_connectivity()
                    && cacheable
                    && req.cache_policy == CachePolicy::UseCacheIfOffline =>
            {
                match self.cache.get(&key) {
                    Some(entry) => {
                        warn!(request_id = %request_id, url = %url, error = %err, "server unreachable, serving cached response");
                        self.log_response(request_id, 200, &entry.body, true);
                        Ok(Response {
                            status: 200,
                            body: entry.body.clone(),
                            from_cache: true,
                        })
                    }
                    None => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<String>,
        request_id: Uuid,
    ) -> Result<Response> {
        if self.request_log {
            debug!(
                request_id = %request_id,
                method = method.as_str(),
                url = %url,
                body = body.as_deref().unwrap_or(""),
                "outbound request"
            );
        }

        let mut builder = self.http.request(method.to_reqwest(), url);
        if let Some(body) = body {
            builder = builder
                .header(CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = builder.send().await.map_err(send_error)?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(send_error)?;

        if self.request_log {
            debug!(
                request_id = %request_id,
                status,
                body = %String::from_utf8_lossy(&bytes),
                cached = false,
                "inbound response"
            );
        }

        let body = classify(status, &bytes)?;
        Ok(Response {
            status,
            body,
            from_cache: false,
        })
    }

    fn log_response(&self, request_id: Uuid, status: u16, body: &Value, cached: bool) {
        if self.request_log {
            debug!(
                request_id = %request_id,
                status,
                body = %codec::encode(body),
                cached,
                "inbound response"
            );
        }
    }

    /// Whether the cache holds a body this request could be answered from.
    pub fn has_cached(&mut self, req: &Request) -> Result<bool> {
        let (url, body) = self.prepare(req)?;
        self.cache.purge_expired(Instant::now());
        Ok(self
            .cache
            .contains(&cache_key(req.method.as_str(), &url, body.as_deref())))
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// True if the endpoint answers HTTP at all, whatever the status.
    pub async fn probe(&self) -> bool {
        self.http.get(&self.endpoint).send().await.is_ok()
    }
}
