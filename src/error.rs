//! Error types for the Deployd client SDK.

use thiserror::Error;

use crate::codec::CodecError;

/// Broad error category, stable across variants that carry different context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
  InvalidParams,
  OperationFailed,
  OperationNotAllowed,
  DuplicateKey,
  ConnectionFailed,
  InvalidResponse,
  UnknownStatus,
}

impl ErrorKind {
  /// Numeric error code, kept compatible with the other Deployd client kits.
  pub fn code(self) -> u16 {
    match self {
      ErrorKind::InvalidParams => 100,
      ErrorKind::OperationFailed => 101,
      ErrorKind::OperationNotAllowed => 102,
      ErrorKind::DuplicateKey => 103,
      ErrorKind::ConnectionFailed => 200,
      ErrorKind::InvalidResponse => 201,
      ErrorKind::UnknownStatus => 202,
    }
  }
}

#[derive(Error, Debug)]
pub enum Error {
  #[error("Invalid parameters: {0}")]
  InvalidParams(String),

  #[error("Operation not allowed (status {status}): {message}")]
  OperationNotAllowed { status: u16, message: String },

  #[error("Duplicate key (status {status}): {message}")]
  DuplicateKey { status: u16, message: String },

  #[error("Operation failed: {message}")]
  OperationFailed {
    status: Option<u16>,
    message: String,
  },

  #[error("Connection failed: {0}")]
  ConnectionFailed(String),

  #[error("Invalid response: {0}")]
  InvalidResponse(String),

  #[error("Unknown status: {0}")]
  UnknownStatus(u16),
}

impl Error {
  /// Shorthand for a failure detected before any request was sent.
  pub(crate) fn failed(message: impl Into<String>) -> Self {
    Self::OperationFailed {
      status: None,
      message: message.into(),
    }
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      Error::InvalidParams(_) => ErrorKind::InvalidParams,
      Error::OperationNotAllowed { .. } => ErrorKind::OperationNotAllowed,
      Error::DuplicateKey { .. } => ErrorKind::DuplicateKey,
      Error::OperationFailed { .. } => ErrorKind::OperationFailed,
      Error::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
      Error::InvalidResponse(_) => ErrorKind::InvalidResponse,
      Error::UnknownStatus(_) => ErrorKind::UnknownStatus,
    }
  }

  pub fn code(&self) -> u16 {
    self.kind().code()
  }

  /// HTTP status of the response that produced this error, if there was one.
  pub fn status(&self) -> Option<u16> {
    match self {
      Error::OperationNotAllowed { status, .. } | Error::DuplicateKey { status, .. } => {
        Some(*status)
      }
      Error::OperationFailed { status, .. } => *status,
      Error::UnknownStatus(status) => Some(*status),
      _ => None,
    }
  }

  /// True for failures where the server was never reached.
  pub fn is_connectivity(&self) -> bool {
    matches!(self, Error::ConnectionFailed(_))
  }
}

impl From<reqwest::Error> for Error {
  fn from(e: reqwest::Error) -> Self {
    if e.is_decode() {
      Self::InvalidResponse(e.to_string())
    } else if let Some(status) = e.status() {
      Self::OperationFailed {
        status: Some(status.as_u16()),
        message: e.to_string(),
      }
    } else {
      Self::ConnectionFailed(e.to_string())
    }
  }
}

impl From<serde_json::Error> for Error {
  fn from(e: serde_json::Error) -> Self {
    Self::InvalidResponse(e.to_string())
  }
}

impl From<CodecError> for Error {
  fn from(e: CodecError) -> Self {
    Self::InvalidResponse(e.to_string())
  }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_error_codes() {
    assert_eq!(Error::InvalidParams("x".into()).code(), 100);
    assert_eq!(Error::failed("x").code(), 101);
    assert_eq!(
      Error::OperationNotAllowed {
        status: 401,
        message: String::new()
      }
      .code(),
      102
    );
    assert_eq!(Error::ConnectionFailed("down".into()).code(), 200);
    assert_eq!(Error::UnknownStatus(302).code(), 202);
  }

  #[test]
  fn test_error_status() {
    assert_eq!(Error::failed("no id").status(), None);
    assert_eq!(Error::UnknownStatus(302).status(), Some(302));
    assert_eq!(
      Error::DuplicateKey {
        status: 409,
        message: "dup".into()
      }
      .status(),
      Some(409)
    );
  }

  #[test]
  fn test_codec_error_becomes_invalid_response() {
    let err: Error = CodecError::new("$.createdAt", "bad timestamp").into();
    assert_eq!(err.kind(), ErrorKind::InvalidResponse);
    assert!(err.to_string().contains("createdAt"));
  }
}
