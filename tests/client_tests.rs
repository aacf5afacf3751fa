//! Client tests for the Deployd Rust SDK.

use std::time::Duration;

use deployd::{CachePolicy, Client, Config, Error, ErrorKind, Method, Request};

#[test]
fn test_config_default() {
  let config = Config::new("http://localhost:2403");
  assert_eq!(config.endpoint, "http://localhost:2403");
  assert!(config.secret.is_none());
  assert!(!config.request_log);
  assert_eq!(config.cache_policy, CachePolicy::IgnoreCache);
  assert_eq!(config.max_cache_age, deployd::DEFAULT_MAX_CACHE_AGE);
}

#[test]
fn test_config_builder_chain() {
  let config = Config::new("https://api.example.com/")
    .with_secret("token123")
    .with_timeout(Duration::from_secs(3))
    .with_cache_policy(CachePolicy::UseCacheIfOffline);

  assert_eq!(config.endpoint, "https://api.example.com");
  assert_eq!(config.secret, Some("token123".to_string()));
  assert_eq!(config.timeout, Duration::from_secs(3));
  assert_eq!(config.cache_policy, CachePolicy::UseCacheIfOffline);
}

#[test]
fn test_client_rejects_invalid_endpoint() {
  let err = Client::new(Config::new("localhost:2403")).err().unwrap();
  assert_eq!(err.kind(), ErrorKind::InvalidParams);

  let err = Client::new(Config::new("")).err().unwrap();
  assert_eq!(err.kind(), ErrorKind::InvalidParams);
}

#[test]
fn test_client_rejects_bad_secret() {
  let config = Config::new("http://localhost:2403").with_secret("line\nbreak");
  let err = Client::new(config).err().unwrap();
  assert_eq!(err.kind(), ErrorKind::InvalidParams);
}

#[test]
fn test_entities_and_queries_inherit_cache_defaults() {
  let config = Config::new("http://localhost:2403").with_cache_policy(CachePolicy::UseCacheElseLoad);
  let client = Client::new(config).unwrap();
  assert_eq!(client.entity("posts").cache_policy(), CachePolicy::UseCacheElseLoad);
  assert_eq!(client.query("posts").entity_name(), "posts");
}

#[test]
fn test_unreachable_endpoint() {
  let client = Client::new(Config::new("http://127.0.0.1:9").with_timeout(Duration::from_secs(2))).unwrap();
  assert!(!client.endpoint_reachable().wait().unwrap());

  let err = client.submit(Request::new(Method::Get, "posts")).wait().unwrap_err();
  assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
  assert!(err.is_connectivity());
}

#[test]
fn test_error_display() {
  let err = Error::InvalidParams("title is required".to_string());
  assert_eq!(format!("{}", err), "Invalid parameters: title is required");

  let err = Error::OperationNotAllowed {
    status: 401,
    message: "not logged in".to_string(),
  };
  assert!(format!("{}", err).contains("status 401"));
  assert!(format!("{}", err).contains("not logged in"));

  let err = Error::DuplicateKey {
    status: 409,
    message: "username taken".to_string(),
  };
  assert!(format!("{}", err).contains("username taken"));

  let err = Error::ConnectionFailed("refused".to_string());
  assert_eq!(format!("{}", err), "Connection failed: refused");

  let err = Error::InvalidResponse("not json".to_string());
  assert_eq!(format!("{}", err), "Invalid response: not json");

  let err = Error::UnknownStatus(302);
  assert_eq!(format!("{}", err), "Unknown status: 302");
}

#[test]
fn test_error_codes() {
  assert_eq!(Error::InvalidParams(String::new()).code(), 100);
  assert_eq!(Error::ConnectionFailed(String::new()).code(), 200);
  assert_eq!(Error::UnknownStatus(302).code(), 202);
  assert_eq!(ErrorKind::DuplicateKey.code(), 103);
}
