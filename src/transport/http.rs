//! reqwest-based request executor.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::credentials::{fingerprint, CredentialStore, ACCESS_TOKEN};
use super::{ApiRequest, BoxFuture, Envelope, Method, Transport};
use crate::error::{SyncError, SyncResult, GENERIC_FAILURE};

/// Executes [`ApiRequest`]s against the backend over HTTPS.
#[derive(Clone)]
pub struct HttpExecutor {
  client: reqwest::Client,
  base_url: Url,
  credentials: Arc<dyn CredentialStore>,
}

impl HttpExecutor {
  pub fn new(
    base_url: Url,
    timeout: Duration,
    credentials: Arc<dyn CredentialStore>,
  ) -> SyncResult<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| SyncError::transport(None, format!("failed to build http client: {}", e)))?;

    Ok(Self {
      client,
      base_url,
      credentials,
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  async fn send(
    client: reqwest::Client,
    base_url: Url,
    credentials: Arc<dyn CredentialStore>,
    request: ApiRequest,
  ) -> SyncResult<Envelope<Value>> {
    if request.is_aborted() {
      return Err(SyncError::Aborted);
    }

    let url = request.url(&base_url)?;
    let mut builder = client.request(reqwest_method(request.method), url.clone());

    if let Some(token) = credentials.get(ACCESS_TOKEN) {
      debug!(token = %fingerprint(&token), "attaching bearer token");
      builder = builder.bearer_auth(token);
    }
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if request.method.is_mutating() {
      builder = builder.header(CONTENT_TYPE, "application/json");
      if let Some(body) = &request.body {
        builder = builder.body(serde_json::to_vec(body)?);
      }
    }

    debug!(method = %request.method, %url, "sending request");

    let exchange = async {
      let response = builder.send().await?;
      let status = response.status().as_u16();
      let body = response.bytes().await?;
      Ok::<_, reqwest::Error>((status, body))
    };

    let outcome = match &request.signal {
      Some(signal) => tokio::select! {
        _ = signal.cancelled() => return Err(SyncError::Aborted),
        outcome = exchange => outcome,
      },
      None => exchange.await,
    };
    let (status, body) = outcome.map_err(|e| SyncError::transport(None, e.to_string()))?;

    // The response may arrive after the caller gave up on it
    if request.is_aborted() {
      return Err(SyncError::Aborted);
    }

    debug!(method = %request.method, %url, status, "response received");
    classify(request.method, status, &body)
  }
}

impl Transport for HttpExecutor {
  fn call(&self, request: ApiRequest) -> BoxFuture<Envelope<Value>> {
    Box::pin(Self::send(
      self.client.clone(),
      self.base_url.clone(),
      Arc::clone(&self.credentials),
      request,
    ))
  }
}

fn reqwest_method(method: Method) -> reqwest::Method {
  match method {
    Method::Get => reqwest::Method::GET,
    Method::Post => reqwest::Method::POST,
    Method::Put => reqwest::Method::PUT,
    Method::Patch => reqwest::Method::PATCH,
    Method::Delete => reqwest::Method::DELETE,
  }
}

/// Success is any status in `[200, 400)`.
pub(crate) fn is_success(status: u16) -> bool {
  (200..400).contains(&status)
}

/// Turn a status and raw body into the uniform envelope.
pub(crate) fn classify(method: Method, status: u16, body: &[u8]) -> SyncResult<Envelope<Value>> {
  if !is_success(status) {
    let message = failure_message(body);
    return Err(if status == 401 {
      SyncError::AuthExpired { message }
    } else {
      SyncError::transport(Some(status), message)
    });
  }

  let data = if method == Method::Delete {
    None
  } else {
    success_payload(body)?
  };

  Ok(Envelope {
    data,
    error: None,
    status,
  })
}

/// `detail`, then `error`, then the generic message.
///
/// Each field is checked on its own: a non-string `detail` (such as a
/// field-error object) does not hide a usable `error`.
pub(crate) fn failure_message(body: &[u8]) -> String {
  let Ok(Value::Object(fields)) = serde_json::from_slice::<Value>(body) else {
    return GENERIC_FAILURE.to_string();
  };
  ["detail", "error"]
    .iter()
    .find_map(|name| match fields.get(*name) {
      Some(Value::String(message)) if !message.is_empty() => Some(message.clone()),
      _ => None,
    })
    .unwrap_or_else(|| GENERIC_FAILURE.to_string())
}

/// A `{"data": ...}` wrapper is unwrapped; any other JSON is the payload itself.
pub(crate) fn success_payload(body: &[u8]) -> SyncResult<Option<Value>> {
  if body.iter().all(u8::is_ascii_whitespace) {
    return Ok(None);
  }
  let value: Value = serde_json::from_slice(body)?;
  match value {
    Value::Object(mut map) if map.contains_key("data") => Ok(map.remove("data")),
    Value::Null => Ok(None),
    other => Ok(Some(other)),
  }
}
