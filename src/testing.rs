//! Scripted in-memory transport for engine and dashboard tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use crate::transport::{ApiRequest, BoxFuture, Envelope, Method, Transport};

#[derive(Clone)]
struct Scripted {
  delay: Duration,
  outcome: SyncResult<Value>,
}

#[derive(Default)]
struct FakeState {
  /// The last scripted response of a route repeats once the queue is down to it
  routes: HashMap<(Method, String), VecDeque<Scripted>>,
  requests: Vec<ApiRequest>,
}

/// A [`Transport`] that answers from a per-route script and records every call.
#[derive(Clone, Default)]
pub struct FakeTransport {
  state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
  pub fn new() -> Self {
    Self::default()
  }

  fn push(&self, method: Method, endpoint: &str, delay: Duration, outcome: SyncResult<Value>) {
    self
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .routes
      .entry((method, endpoint.to_string()))
      .or_default()
      .push_back(Scripted { delay, outcome });
  }

  pub fn respond(&self, method: Method, endpoint: &str, data: Value) -> &Self {
    self.push(method, endpoint, Duration::ZERO, Ok(data));
    self
  }

  pub fn respond_after(&self, method: Method, endpoint: &str, delay: Duration, data: Value) -> &Self {
    self.push(method, endpoint, delay, Ok(data));
    self
  }

  pub fn fail(&self, method: Method, endpoint: &str, error: SyncError) -> &Self {
    self.push(method, endpoint, Duration::ZERO, Err(error));
    self
  }

  pub fn fail_after(&self, method: Method, endpoint: &str, delay: Duration, error: SyncError) -> &Self {
    self.push(method, endpoint, delay, Err(error));
    self
  }

  /// Number of calls made to one route.
  pub fn calls(&self, method: Method, endpoint: &str) -> usize {
    self
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .requests
      .iter()
      .filter(|r| r.method == method && r.endpoint == endpoint)
      .count()
  }

  pub fn requests(&self) -> Vec<ApiRequest> {
    self
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .requests
      .clone()
  }

  fn next(&self, request: &ApiRequest) -> Option<Scripted> {
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    state.requests.push(request.clone());
    let queue = state
      .routes
      .get_mut(&(request.method, request.endpoint.clone()))?;
    if queue.len() > 1 {
      queue.pop_front()
    } else {
      queue.front().cloned()
    }
  }
}

impl Transport for FakeTransport {
  fn call(&self, request: ApiRequest) -> BoxFuture<Envelope<Value>> {
    let scripted = self.next(&request);
    Box::pin(async move {
      if request.is_aborted() {
        return Err(SyncError::Aborted);
      }
      let Some(scripted) = scripted else {
        return Err(SyncError::transport(Some(404), "Not found."));
      };
      if !scripted.delay.is_zero() {
        tokio::time::sleep(scripted.delay).await;
      }
      if request.is_aborted() {
        return Err(SyncError::Aborted);
      }
      let data = match scripted.outcome? {
        _ if request.method == Method::Delete => None,
        Value::Null => None,
        value => Some(value),
      };
      Ok(Envelope {
        data,
        error: None,
        status: 200,
      })
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use tokio_util::sync::CancellationToken;

  #[tokio::test(start_paused = true)]
  async fn test_response_after_cancel_is_discarded() {
    let transport = FakeTransport::new();
    transport.respond_after(
      Method::Get,
      "/auth/incidents",
      Duration::from_secs(2),
      json!([{"id": 1}]),
    );

    let token = CancellationToken::new();
    let call = transport.call(ApiRequest::get("/auth/incidents").signal(token.clone()));
    let pending = tokio::spawn(call);

    tokio::time::sleep(Duration::from_secs(1)).await;
    token.cancel();

    assert_eq!(pending.await.unwrap().unwrap_err(), SyncError::Aborted);
    assert_eq!(transport.calls(Method::Get, "/auth/incidents"), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_uncancelled_delayed_response_arrives() {
    let transport = FakeTransport::new();
    transport.respond_after(Method::Get, "/parameters", Duration::from_secs(2), json!([]));

    let envelope = transport
      .call(ApiRequest::get("/parameters").signal(CancellationToken::new()))
      .await
      .unwrap();
    assert_eq!(envelope.data, Some(json!([])));
  }
}
