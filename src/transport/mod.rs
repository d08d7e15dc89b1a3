//! Request execution against the dashboard backend.
//!
//! The [`Transport`] trait is the seam between the sync engines and the
//! network: [`HttpExecutor`] talks to the real backend, tests substitute a
//! scripted transport.

pub mod credentials;
mod http;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::cache::Scalar;
use crate::error::{SyncError, SyncResult};

pub use credentials::{CredentialStore, MemoryCredentials, SqliteCredentials};
pub use http::HttpExecutor;

/// A boxed future that returns a `SyncResult<T>`
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = SyncResult<T>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  /// Methods that carry a JSON body.
  pub fn is_mutating(self) -> bool {
    matches!(self, Method::Post | Method::Put | Method::Patch)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A single backend call, built fluently.
#[derive(Debug, Clone)]
pub struct ApiRequest {
  pub method: Method,
  pub endpoint: String,
  pub search: Vec<(String, Scalar)>,
  pub body: Option<Value>,
  pub headers: Vec<(String, String)>,
  pub signal: Option<CancellationToken>,
}

impl ApiRequest {
  pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
    Self {
      method,
      endpoint: endpoint.into(),
      search: Vec::new(),
      body: None,
      headers: Vec::new(),
      signal: None,
    }
  }

  pub fn get(endpoint: impl Into<String>) -> Self {
    Self::new(Method::Get, endpoint)
  }

  pub fn post(endpoint: impl Into<String>) -> Self {
    Self::new(Method::Post, endpoint)
  }

  pub fn put(endpoint: impl Into<String>) -> Self {
    Self::new(Method::Put, endpoint)
  }

  pub fn patch(endpoint: impl Into<String>) -> Self {
    Self::new(Method::Patch, endpoint)
  }

  pub fn delete(endpoint: impl Into<String>) -> Self {
    Self::new(Method::Delete, endpoint)
  }

  /// Add a search parameter. Falsy values are dropped when the URL is built.
  pub fn query(mut self, name: impl Into<String>, value: impl Into<Scalar>) -> Self {
    self.search.push((name.into(), value.into()));
    self
  }

  pub fn body<B: Serialize>(mut self, body: &B) -> SyncResult<Self> {
    self.body = Some(serde_json::to_value(body)?);
    Ok(self)
  }

  pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn signal(mut self, token: CancellationToken) -> Self {
    self.signal = Some(token);
    self
  }

  pub fn is_aborted(&self) -> bool {
    self.signal.as_ref().is_some_and(CancellationToken::is_cancelled)
  }

  /// Resolve against the backend base URL, appending non-falsy search params.
  pub fn url(&self, base: &Url) -> SyncResult<Url> {
    let joined = format!("{}{}", base.as_str().trim_end_matches('/'), self.endpoint);
    let mut url = Url::parse(&joined)
      .map_err(|e| SyncError::transport(None, format!("invalid url {}: {}", joined, e)))?;
    let params: Vec<&(String, Scalar)> =
      self.search.iter().filter(|(_, v)| !v.is_falsy()).collect();
    if !params.is_empty() {
      let mut pairs = url.query_pairs_mut();
      for (name, value) in params {
        pairs.append_pair(name, &value.to_string());
      }
    }
    Ok(url)
  }
}

/// Uniform result of a backend call.
///
/// Failures are returned as `Err(SyncError)`, so on the `Ok` side `error`
/// is always `None`; it is kept for parity with the response contract.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<T> {
  pub data: Option<T>,
  pub error: Option<String>,
  pub status: u16,
}

impl Envelope<Value> {
  /// Decode the raw payload into a typed envelope.
  pub fn decode<T: DeserializeOwned>(self) -> SyncResult<Envelope<T>> {
    let data = match self.data {
      Some(Value::Null) | None => None,
      Some(v) => Some(serde_json::from_value(v)?),
    };
    Ok(Envelope {
      data,
      error: self.error,
      status: self.status,
    })
  }
}

/// Executes backend calls. Implementations attach credentials, classify
/// status codes and normalize every failure into [`SyncError`].
pub trait Transport: Send + Sync {
  fn call(&self, request: ApiRequest) -> BoxFuture<Envelope<Value>>;
}

/// Call and decode in one step.
pub async fn execute<T: DeserializeOwned>(
  transport: &dyn Transport,
  request: ApiRequest,
) -> SyncResult<Envelope<T>> {
  transport.call(request).await?.decode()
}
