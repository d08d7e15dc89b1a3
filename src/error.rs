//! Error type shared by the request executor and the sync engines.

use thiserror::Error;

/// Default message when a failed response carries neither `detail` nor `error`.
pub const GENERIC_FAILURE: &str = "Request failed";

pub type SyncResult<T> = Result<T, SyncError>;

/// Every failure surfaced by the core is normalized into this type.
///
/// It is `Clone` because a coalesced fetch hands the same outcome to every
/// waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
  /// Network failure or a response status outside `[200, 400)`.
  #[error("request failed: {message}")]
  Transport {
    status: Option<u16>,
    message: String,
  },

  /// The backend rejected our credentials (HTTP 401).
  #[error("session expired: {message}")]
  AuthExpired { message: String },

  /// The caller cancelled the request before its response was used.
  #[error("request aborted")]
  Aborted,

  /// The response body did not match the expected shape.
  #[error("malformed response: {0}")]
  Decode(String),

  /// A client-side policy refused the operation.
  #[error("{0}")]
  Rejected(String),

  /// A required parameter was not supplied.
  #[error("missing {0}")]
  Missing(&'static str),

  #[error("credential store: {0}")]
  Storage(String),

  #[error("internal error: {0}")]
  Internal(String),
}

impl SyncError {
  pub fn transport(status: Option<u16>, message: impl Into<String>) -> Self {
    Self::Transport {
      status,
      message: message.into(),
    }
  }

  /// HTTP status attached to the failure, if the server answered at all.
  pub fn status(&self) -> Option<u16> {
    match self {
      Self::Transport { status, .. } => *status,
      Self::AuthExpired { .. } => Some(401),
      _ => None,
    }
  }

  pub fn is_auth_expired(&self) -> bool {
    matches!(self, Self::AuthExpired { .. })
  }

  pub fn is_not_found(&self) -> bool {
    self.status() == Some(404)
  }
}

impl From<serde_json::Error> for SyncError {
  fn from(e: serde_json::Error) -> Self {
    Self::Decode(e.to_string())
  }
}

impl From<rusqlite::Error> for SyncError {
  fn from(e: rusqlite::Error) -> Self {
    Self::Storage(e.to_string())
  }
}
