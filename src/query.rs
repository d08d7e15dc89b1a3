//! Query engine: cached reads with coalescing and last-fetch-wins commits.
//!
//! Inspired by TanStack Query. A [`QueryClient`] wraps the shared
//! [`EntityCache`]; a [`Query<T>`] binds one key to a fetcher and exposes
//! loading, fetching and error state for a view.
//!
//! # Example
//!
//! ```ignore
//! let api = api.clone();
//! let incidents = Query::new(
//!     &client,
//!     query_key!["get-incidents"],
//!     QueryOptions::stale_after(Duration::from_secs(30)),
//!     fetcher(move |_key| {
//!         let api = api.clone();
//!         async move { api.get_incidents().await }
//!     }),
//! );
//!
//! // Render: serves cached data, starts a background fetch when stale
//! let result = incidents.result();
//! if result.is_loading {
//!     render_spinner();
//! } else if let Some(list) = &result.data {
//!     render_list(list);
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::cache::{
  CacheEntry, CacheEvent, EntityCache, FetchStatus, QueryKey, SharedFetch, Subscription,
  Transaction,
};
use crate::error::{SyncError, SyncResult};
use crate::transport::BoxFuture;

/// A factory that produces the future fetching the value for a key.
pub type Fetcher<T> = Arc<dyn Fn(QueryKey) -> BoxFuture<T> + Send + Sync>;

/// Wrap a closure as a [`Fetcher`].
pub fn fetcher<T, F, Fut>(f: F) -> Fetcher<T>
where
  F: Fn(QueryKey) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = SyncResult<T>> + Send + 'static,
{
  Arc::new(move |key| Box::pin(f(key)))
}

/// Per-read options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
  /// How long a fetched value counts as fresh
  pub stale_after: Duration,
  /// A disabled query never fetches and reports no data
  pub enabled: bool,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      stale_after: Duration::ZERO,
      enabled: true,
    }
  }
}

impl QueryOptions {
  pub fn stale_after(stale_after: Duration) -> Self {
    Self {
      stale_after,
      ..Self::default()
    }
  }

  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }
}

/// What a view needs to render a query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<T> {
  /// Last successfully fetched (or locally written) value
  pub data: Option<T>,
  pub status: FetchStatus,
  /// True only during the initial load, when there is nothing to show yet
  pub is_loading: bool,
  /// True during any fetch, including background refetches
  pub is_fetching: bool,
  pub error: Option<SyncError>,
  pub is_stale: bool,
}

impl<T: DeserializeOwned> QueryResult<T> {
  fn disabled() -> Self {
    Self {
      data: None,
      status: FetchStatus::Idle,
      is_loading: false,
      is_fetching: false,
      error: None,
      is_stale: false,
    }
  }

  fn from_entry(entry: Option<&CacheEntry>, stale_after: Duration) -> Self {
    let Some(entry) = entry else {
      return Self {
        is_stale: true,
        ..Self::disabled()
      };
    };

    let (data, error) = match entry.data::<T>() {
      Ok(data) => (data, entry.error.clone()),
      Err(e) => (None, Some(e)),
    };

    Self {
      data,
      status: entry.status,
      is_loading: entry.is_fetching && entry.value.is_none(),
      is_fetching: entry.is_fetching,
      error,
      is_stale: entry.is_stale_after(stale_after),
    }
  }
}

impl<T> QueryResult<T> {
  pub fn is_success(&self) -> bool {
    self.status == FetchStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.error.is_some()
  }
}

/// Entry point to cached reads and cache writes.
///
/// Explicitly constructed and passed down; cloning shares the same cache.
#[derive(Clone, Debug, Default)]
pub struct QueryClient {
  cache: EntityCache,
}

impl QueryClient {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_cache(cache: EntityCache) -> Self {
    Self { cache }
  }

  pub fn cache(&self) -> &EntityCache {
    &self.cache
  }

  /// Render-time read.
  ///
  /// Returns the cached state immediately and, if the entry is absent or
  /// stale, starts a background fetch. A failed first load is not retried
  /// here; it waits for `refetch` or an invalidation. Must be called inside a
  /// tokio runtime.
  pub fn read<T>(&self, key: &QueryKey, options: QueryOptions, fetcher: &Fetcher<T>) -> QueryResult<T>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
  {
    if !options.enabled {
      return QueryResult::disabled();
    }

    let needs_fetch = match self.cache.get(key) {
      None => true,
      Some(entry) if entry.is_fetching => false,
      Some(entry) if entry.status == FetchStatus::Error => entry.invalidated,
      Some(entry) => entry.is_stale_after(options.stale_after),
    };
    if needs_fetch {
      // The fetch runs on its own task; nobody awaits it here.
      let _ = self.start(key, Some(options.stale_after), false, fetcher);
    }

    self.peek(key, options)
  }

  /// Cached state without triggering any fetch.
  pub fn peek<T: DeserializeOwned>(&self, key: &QueryKey, options: QueryOptions) -> QueryResult<T> {
    if !options.enabled {
      return QueryResult::disabled();
    }
    QueryResult::from_entry(self.cache.get(key).as_ref(), options.stale_after)
  }

  /// Fresh cached data, or the result of a (possibly shared) fetch.
  pub async fn fetch_query<T>(
    &self,
    key: &QueryKey,
    options: QueryOptions,
    fetcher: &Fetcher<T>,
  ) -> SyncResult<T>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
  {
    if let Some(entry) = self.cache.get(key) {
      if !entry.is_fetching && !entry.is_stale_after(options.stale_after) {
        if let Some(data) = entry.data::<T>()? {
          return Ok(data);
        }
      }
    }

    let (generation, fetch) = self.start(key, Some(options.stale_after), false, fetcher);
    self.settle(key, generation, fetch).await
  }

  /// Always hit the network, sharing a fetch already in flight for the key.
  pub async fn refetch<T>(&self, key: &QueryKey, fetcher: &Fetcher<T>) -> SyncResult<T>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
  {
    let (generation, fetch) = self.start(key, None, false, fetcher);
    self.settle(key, generation, fetch).await
  }

  /// Start a new fetch even if one is in flight. The older fetch keeps
  /// running but its result will not be applied.
  pub async fn refetch_replace<T>(&self, key: &QueryKey, fetcher: &Fetcher<T>) -> SyncResult<T>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
  {
    let (generation, fetch) = self.start(key, None, true, fetcher);
    self.settle(key, generation, fetch).await
  }

  /// Start (or join) a refetch without waiting for it.
  pub fn spawn_refetch<T>(&self, key: &QueryKey, fetcher: &Fetcher<T>)
  where
    T: Serialize + DeserializeOwned + Send + 'static,
  {
    let _ = self.start(key, None, false, fetcher);
  }

  /// Warm the cache if the entry is absent or stale.
  pub fn prefetch<T>(&self, key: &QueryKey, options: QueryOptions, fetcher: &Fetcher<T>)
  where
    T: Serialize + DeserializeOwned + Send + 'static,
  {
    let _ = self.read(key, options, fetcher);
  }

  pub fn get_query_data<T: DeserializeOwned>(&self, key: &QueryKey) -> SyncResult<Option<T>> {
    self.cache.get_data(key)
  }

  pub fn set_query_data<T: Serialize>(&self, key: &QueryKey, value: &T) -> SyncResult<()> {
    self.cache.set(key, value)
  }

  pub fn invalidate(&self, prefix: &QueryKey) -> usize {
    self.cache.invalidate(prefix)
  }

  pub fn cancel(&self, key: &QueryKey) -> bool {
    self.cache.cancel(key)
  }

  pub fn remove(&self, key: &QueryKey) -> bool {
    self.cache.remove(key)
  }

  /// Begin an optimistic write on `key`.
  pub fn transaction(&self, key: QueryKey) -> Transaction {
    Transaction::begin(&self.cache, key)
  }

  pub fn subscribe<F>(&self, key: &QueryKey, listener: F) -> Subscription
  where
    F: Fn(&CacheEvent) + Send + Sync + 'static,
  {
    self.cache.subscribe(key, listener)
  }

  /// Internal: join or launch the fetch for `key`.
  ///
  /// The network future runs on its own task and commits to the cache when
  /// it resolves, so background refetches complete even with no waiter.
  fn start<T>(
    &self,
    key: &QueryKey,
    stale_after: Option<Duration>,
    replace: bool,
    fetcher: &Fetcher<T>,
  ) -> (u64, SharedFetch)
  where
    T: Serialize + Send + 'static,
  {
    let cache = self.cache.clone();
    let fetcher = Arc::clone(fetcher);
    let owned_key = key.clone();

    self
      .cache
      .start_fetch(key, stale_after, replace, move |generation| {
        let handle = tokio::spawn(async move {
          let result = fetcher(owned_key.clone())
            .await
            .and_then(|data| serde_json::to_value(&data).map_err(SyncError::from));
          cache.commit_fetch(&owned_key, generation, &result);
          result
        });

        async move {
          handle
            .await
            .unwrap_or_else(|e| Err(SyncError::Internal(format!("fetch task failed: {}", e))))
        }
        .boxed()
        .shared()
      })
  }

  /// Internal: await a fetch, following it to whichever fetch superseded it.
  async fn settle<T: DeserializeOwned>(
    &self,
    key: &QueryKey,
    mut generation: u64,
    mut fetch: SharedFetch,
  ) -> SyncResult<T> {
    loop {
      let result: SyncResult<Value> = fetch.await;

      if let Some((current, next)) = self.cache.in_flight(key) {
        if current != generation {
          generation = current;
          fetch = next;
          continue;
        }
      }

      // Overwritten by a local write after this fetch started
      if self.cache.generation(key) != Some(generation) {
        if let Some(entry) = self.cache.get(key) {
          if !entry.invalidated {
            if let Some(data) = entry.data::<T>()? {
              return Ok(data);
            }
          }
        }
      }

      return result.and_then(|value| serde_json::from_value(value).map_err(SyncError::from));
    }
  }
}

/// A view's handle on one query: a key, a fetcher and read options.
pub struct Query<T> {
  client: QueryClient,
  key: QueryKey,
  options: QueryOptions,
  fetcher: Fetcher<T>,
}

impl<T> Query<T>
where
  T: Serialize + DeserializeOwned + Send + 'static,
{
  /// Create a query. Nothing is fetched until the first `result()`.
  pub fn new(client: &QueryClient, key: QueryKey, options: QueryOptions, fetcher: Fetcher<T>) -> Self {
    Self {
      client: client.clone(),
      key,
      options,
      fetcher,
    }
  }

  /// Builder form of [`Query::set_enabled`] that does not read.
  pub fn enabled(mut self, enabled: bool) -> Self {
    self.options.enabled = enabled;
    self
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  pub fn options(&self) -> QueryOptions {
    self.options
  }

  /// Current state, starting a fetch if the entry is absent or stale.
  pub fn result(&self) -> QueryResult<T> {
    self.client.read(&self.key, self.options, &self.fetcher)
  }

  /// Current state without side effects.
  pub fn peek(&self) -> QueryResult<T> {
    self.client.peek(&self.key, self.options)
  }

  pub fn data(&self) -> Option<T> {
    self.peek().data
  }

  /// Point the query at a new key (e.g. another incident was selected).
  pub fn set_key(&mut self, key: QueryKey) -> QueryResult<T> {
    self.key = key;
    self.result()
  }

  pub fn set_enabled(&mut self, enabled: bool) -> QueryResult<T> {
    self.options.enabled = enabled;
    self.result()
  }

  /// Force a refetch, sharing one already in flight.
  pub async fn refetch(&self) -> SyncResult<T> {
    self.client.refetch(&self.key, &self.fetcher).await
  }

  /// Force a refetch that supersedes any fetch in flight.
  pub async fn refetch_replace(&self) -> SyncResult<T> {
    self.client.refetch_replace(&self.key, &self.fetcher).await
  }

  /// Wait for any in-flight fetch to settle, then report the state.
  pub async fn wait(&self) -> QueryResult<T> {
    if let Some((generation, fetch)) = self.client.cache.in_flight(&self.key) {
      let _ = self.client.settle::<Value>(&self.key, generation, fetch).await;
    }
    self.peek()
  }

  /// Listen for changes to the current key.
  pub fn subscribe<F>(&self, listener: F) -> Subscription
  where
    F: Fn(&CacheEvent) + Send + Sync + 'static,
  {
    self.client.subscribe(&self.key, listener)
  }
}

impl<T> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("options", &self.options)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheEventKind;
  use crate::query_key;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;

  /// Fetcher whose n-th call sleeps `plan[n].0` ms and returns `plan[n].1`.
  fn scripted(plan: Vec<(u64, Result<&'static str, &'static str>)>) -> (Fetcher<String>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let plan = Arc::new(plan);
    let f = fetcher(move |_key| {
      let n = counter.fetch_add(1, Ordering::SeqCst);
      let (delay, outcome) = plan[n.min(plan.len() - 1)];
      async move {
        tokio::time::sleep(Duration::from_millis(delay)).await;
        outcome
          .map(String::from)
          .map_err(|e| SyncError::transport(Some(500), e))
      }
    });
    (f, calls)
  }

  fn fresh_for(secs: u64) -> QueryOptions {
    QueryOptions::stale_after(Duration::from_secs(secs))
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_reads_share_one_fetch() {
    let client = QueryClient::new();
    let key = query_key!["get-incidents"];
    let (f, calls) = scripted(vec![(50, Ok("list"))]);

    let (a, b) = tokio::join!(
      client.fetch_query::<String>(&key, fresh_for(30), &f),
      client.fetch_query::<String>(&key, fresh_for(30), &f),
    );

    assert_eq!(a.unwrap(), "list");
    assert_eq!(b.unwrap(), "list");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_fresh_entry_served_without_fetch() {
    let client = QueryClient::new();
    let key = query_key!["get-incidents"];
    let (f, calls) = scripted(vec![(10, Ok("list"))]);

    client.fetch_query::<String>(&key, fresh_for(30), &f).await.unwrap();
    let result = client.read::<String>(&key, fresh_for(30), &f);

    assert_eq!(result.data.as_deref(), Some("list"));
    assert!(!result.is_loading);
    assert!(!result.is_fetching);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_first_read_is_loading() {
    let client = QueryClient::new();
    let query = Query::new(
      &client,
      query_key!["get-incidents"],
      fresh_for(30),
      scripted(vec![(10, Ok("list"))]).0,
    );

    let first = query.result();
    assert!(first.is_loading);
    assert!(first.is_fetching);
    assert_eq!(first.data, None);

    let settled = query.wait().await;
    assert!(!settled.is_loading);
    assert_eq!(settled.data.as_deref(), Some("list"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_entry_revalidates_in_background() {
    let client = QueryClient::new();
    let key = query_key!["get-incidents"];
    let (f, calls) = scripted(vec![(10, Ok("old")), (10, Ok("new"))]);
    let query = Query::new(&client, key, fresh_for(30), f);

    query.result();
    query.wait().await;
    tokio::time::advance(Duration::from_secs(31)).await;

    let during = query.result();
    assert_eq!(during.data.as_deref(), Some("old"));
    assert!(during.is_fetching);
    assert!(!during.is_loading);
    assert!(during.is_stale);

    let after = query.wait().await;
    assert_eq!(after.data.as_deref(), Some("new"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_disabled_query_never_fetches() {
    let client = QueryClient::new();
    let (f, calls) = scripted(vec![(10, Ok("x"))]);
    let mut query = Query::new(
      &client,
      query_key!["incident-note", None::<i64>],
      fresh_for(10).enabled(false),
      f,
    );

    let result = query.result();
    assert_eq!(result.data, None);
    assert!(!result.is_fetching);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    query.set_enabled(true);
    query.wait().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_refetch_coalesces_with_in_flight() {
    let client = QueryClient::new();
    let key = query_key!["get-users"];
    let (f, calls) = scripted(vec![(50, Ok("users"))]);

    client.read::<String>(&key, fresh_for(60), &f);
    let refetched = client.refetch::<String>(&key, &f).await.unwrap();

    assert_eq!(refetched, "users");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_refetch_ignores_freshness() {
    let client = QueryClient::new();
    let key = query_key!["get-users"];
    let (f, calls) = scripted(vec![(5, Ok("one")), (5, Ok("two"))]);

    client.fetch_query::<String>(&key, fresh_for(600), &f).await.unwrap();
    assert_eq!(client.refetch::<String>(&key, &f).await.unwrap(), "two");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_slow_older_fetch_never_overwrites_newer() {
    let client = QueryClient::new();
    let key = query_key!["get-incidents"];
    // A is slow, B is fast; A resolves after B
    let (f, _) = scripted(vec![(100, Ok("A")), (10, Ok("B"))]);

    client.spawn_refetch::<String>(&key, &f);
    tokio::time::sleep(Duration::from_millis(1)).await;
    let b = client.refetch_replace::<String>(&key, &f).await.unwrap();
    assert_eq!(b, "B");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
      client.get_query_data::<String>(&key).unwrap().as_deref(),
      Some("B")
    );
    assert!(!client.cache().get(&key).unwrap().is_fetching);
  }

  #[tokio::test(start_paused = true)]
  async fn test_older_fetch_arriving_first_is_discarded() {
    let client = QueryClient::new();
    let key = query_key!["get-incidents"];
    let (f, _) = scripted(vec![(10, Ok("A")), (100, Ok("B"))]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _sub = client.subscribe(&key, move |event| {
      if event.kind == CacheEventKind::Updated {
        let value = event.entry.as_ref().and_then(|e| e.data::<String>().ok().flatten());
        sink.lock().unwrap().push(value);
      }
    });

    client.spawn_refetch::<String>(&key, &f);
    tokio::time::sleep(Duration::from_millis(1)).await;
    client.spawn_refetch_replace_for_test(&key, &f);

    tokio::time::sleep(Duration::from_millis(50)).await;
    // A has arrived but was not applied
    assert_eq!(client.get_query_data::<String>(&key).unwrap(), None);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
      client.get_query_data::<String>(&key).unwrap().as_deref(),
      Some("B")
    );
    assert_eq!(*seen.lock().unwrap(), vec![Some("B".to_string())]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_waiter_on_superseded_fetch_gets_latest() {
    let client = QueryClient::new();
    let key = query_key!["get-incidents"];
    let (f, _) = scripted(vec![(100, Ok("A")), (10, Ok("B"))]);

    let waiter = {
      let client = client.clone();
      let key = key.clone();
      let f = Arc::clone(&f);
      tokio::spawn(async move { client.fetch_query::<String>(&key, fresh_for(30), &f).await })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    client.refetch_replace::<String>(&key, &f).await.unwrap();

    assert_eq!(waiter.await.unwrap().unwrap(), "B");
  }

  #[tokio::test(start_paused = true)]
  async fn test_error_keeps_previous_data() {
    let client = QueryClient::new();
    let key = query_key!["backend-parameters"];
    let (f, _) = scripted(vec![(5, Ok("params")), (5, Err("backend down"))]);
    let query = Query::new(&client, key, fresh_for(0), f);

    query.refetch().await.unwrap();
    let err = query.refetch().await.unwrap_err();
    assert_eq!(err, SyncError::transport(Some(500), "backend down"));

    let result = query.peek();
    assert_eq!(result.data.as_deref(), Some("params"));
    assert_eq!(result.error, Some(err));
    assert_eq!(result.status, FetchStatus::Error);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_first_load_waits_for_manual_retry() {
    let client = QueryClient::new();
    let (f, calls) = scripted(vec![(5, Err("offline")), (5, Ok("back"))]);
    let query = Query::new(&client, query_key!["get-users"], fresh_for(60), f);

    query.result();
    let failed = query.wait().await;
    assert!(failed.is_error());
    assert_eq!(failed.data, None);

    // Re-rendering does not hammer the backend
    query.result();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_eq!(query.refetch().await.unwrap(), "back");
    assert!(!query.peek().is_error());
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidation_then_read_fetches_exactly_once() {
    let client = QueryClient::new();
    let key = query_key!["incident-note", 5];
    let (f, calls) = scripted(vec![(5, Ok("v1")), (5, Ok("v2"))]);
    let query = Query::new(&client, key.clone(), fresh_for(600), f);

    query.result();
    query.wait().await;
    client.invalidate(&query_key!["incident-note"]);

    let during = query.result();
    assert_eq!(during.data.as_deref(), Some("v1"));
    query.result();
    query.result();
    assert_eq!(query.wait().await.data.as_deref(), Some("v2"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_key_change_fetches_new_key() {
    let client = QueryClient::new();
    let f = fetcher(|key: QueryKey| async move {
      let id = key.param(0).and_then(|p| p.as_int()).unwrap_or_default();
      Ok(format!("notes for {}", id))
    });
    let mut query = Query::new(&client, query_key!["incident-note", 1], fresh_for(10), f);

    query.result();
    assert_eq!(query.wait().await.data.as_deref(), Some("notes for 1"));

    let switched = query.set_key(query_key!["incident-note", 2]);
    assert!(switched.is_loading);
    assert_eq!(query.wait().await.data.as_deref(), Some("notes for 2"));
    assert!(client.cache().contains(&query_key!["incident-note", 1]));
  }

  impl QueryClient {
    fn spawn_refetch_replace_for_test<T>(&self, key: &QueryKey, fetcher: &Fetcher<T>)
    where
      T: Serialize + Send + 'static,
    {
      let _ = self.start(key, None, true, fetcher);
    }
  }
}
