//! Client configuration.

use std::time::Duration;

use crate::cache::CachePolicy;

/// Default request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default maximum age of a cached response
pub const DEFAULT_MAX_CACHE_AGE: Duration = Duration::from_secs(60);

/// Settings shared by every request issued through a [`Client`](crate::Client).
///
/// Built once at startup and handed to `Client::new`.
#[derive(Debug, Clone)]
pub struct Config {
  pub endpoint: String,
  pub secret: Option<String>,
  pub request_log: bool,
  pub timeout: Duration,
  pub cache_policy: CachePolicy,
  pub max_cache_age: Duration,
}

impl Config {
  pub fn new(endpoint: impl Into<String>) -> Self {
    let endpoint = endpoint.into().trim_end_matches('/').to_string();
    Self {
      endpoint,
      secret: None,
      request_log: false,
      timeout: DEFAULT_TIMEOUT,
      cache_policy: CachePolicy::default(),
      max_cache_age: DEFAULT_MAX_CACHE_AGE,
    }
  }

  /// API secret, sent as the Deployd root key header.
  pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
    self.secret = Some(secret.into());
    self
  }

  pub fn with_request_log(mut self, enabled: bool) -> Self {
    self.request_log = enabled;
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  /// Cache policy given to new queries and entities.
  pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
    self.cache_policy = policy;
    self
  }

  pub fn with_max_cache_age(mut self, max_age: Duration) -> Self {
    self.max_cache_age = max_age;
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_config_defaults() {
    let config = Config::new("http://localhost:2403/");
    assert_eq!(config.endpoint, "http://localhost:2403");
    assert!(config.secret.is_none());
    assert!(!config.request_log);
    assert_eq!(config.timeout, DEFAULT_TIMEOUT);
    assert_eq!(config.cache_policy, CachePolicy::IgnoreCache);
  }

  #[test]
  fn test_config_builder_chain() {
    let config = Config::new("https://api.example.com")
      .with_secret("s3cr3t")
      .with_request_log(true)
      .with_timeout(Duration::from_secs(5))
      .with_cache_policy(CachePolicy::UseCacheElseLoad)
      .with_max_cache_age(Duration::from_secs(300));

    assert_eq!(config.secret.as_deref(), Some("s3cr3t"));
    assert!(config.request_log);
    assert_eq!(config.timeout, Duration::from_secs(5));
    assert_eq!(config.cache_policy, CachePolicy::UseCacheElseLoad);
    assert_eq!(config.max_cache_age, Duration::from_secs(300));
  }
}
