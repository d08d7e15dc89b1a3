//! Mutation engine: writes with optimistic projection, rollback and
//! settlement reconciliation.
//!
//! The sequence on [`Mutation::mutate`] is:
//!
//! 1. `on_mutate` runs synchronously and may open a [`Transaction`] holding
//!    the optimistic projection.
//! 2. The mutation future runs on its own task.
//! 3. On failure the transaction is rolled back, then `on_error` runs.
//! 4. On success the transaction is committed, `on_success` runs and the
//!    registered refetches are awaited.
//! 5. Either way the registered keys are invalidated and `on_settled` runs.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture as UnitFuture;
use futures::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::{QueryKey, Transaction};
use crate::error::{SyncError, SyncResult};
use crate::query::{Fetcher, QueryClient};
use crate::transport::BoxFuture;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutationStatus {
  #[default]
  Idle,
  Pending,
  Success,
  Error,
}

type MutateFn<I, O> = Arc<dyn Fn(I) -> BoxFuture<O> + Send + Sync>;
type OnMutate<I> = Arc<dyn Fn(&QueryClient, &I) -> SyncResult<Option<Transaction>> + Send + Sync>;
type OnSuccess<I, O> = Arc<dyn Fn(&QueryClient, &I, &O) + Send + Sync>;
type OnError<I> = Arc<dyn Fn(&QueryClient, &I, &SyncError) + Send + Sync>;
type OnSettled<I, O> = Arc<dyn Fn(&QueryClient, &I, &SyncResult<O>) + Send + Sync>;
type KeyFn<I> = Arc<dyn Fn(&I) -> QueryKey + Send + Sync>;
type Refetch<I> = Arc<dyn Fn(&QueryClient, &I) -> UnitFuture<'static, ()> + Send + Sync>;

struct Hooks<I, O> {
  run: MutateFn<I, O>,
  on_mutate: Option<OnMutate<I>>,
  on_success: Option<OnSuccess<I, O>>,
  on_error: Option<OnError<I>>,
  on_settled: Option<OnSettled<I, O>>,
  refetches: Vec<Refetch<I>>,
  invalidates: Vec<KeyFn<I>>,
}

impl<I, O> Clone for Hooks<I, O> {
  fn clone(&self) -> Self {
    Self {
      run: Arc::clone(&self.run),
      on_mutate: self.on_mutate.clone(),
      on_success: self.on_success.clone(),
      on_error: self.on_error.clone(),
      on_settled: self.on_settled.clone(),
      refetches: self.refetches.clone(),
      invalidates: self.invalidates.clone(),
    }
  }
}

#[derive(Debug, Default)]
struct MutationState {
  status: MutationStatus,
  pending: usize,
  error: Option<SyncError>,
}

/// A reusable write action, e.g. "send note" for one view.
///
/// The engine does not serialize concurrent `mutate` calls; a caller that
/// needs one write at a time checks [`Mutation::is_pending`] first.
pub struct Mutation<I, O> {
  name: &'static str,
  client: QueryClient,
  hooks: Arc<Hooks<I, O>>,
  state: Arc<Mutex<MutationState>>,
}

impl<I, O> Clone for Mutation<I, O> {
  fn clone(&self) -> Self {
    Self {
      name: self.name,
      client: self.client.clone(),
      hooks: Arc::clone(&self.hooks),
      state: Arc::clone(&self.state),
    }
  }
}

impl<I, O> Mutation<I, O>
where
  I: Clone + Send + Sync + 'static,
  O: Send + Sync + 'static,
{
  pub fn new<F, Fut>(client: &QueryClient, name: &'static str, f: F) -> Self
  where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<O>> + Send + 'static,
  {
    Self {
      name,
      client: client.clone(),
      hooks: Arc::new(Hooks {
        run: Arc::new(move |input| Box::pin(f(input))),
        on_mutate: None,
        on_success: None,
        on_error: None,
        on_settled: None,
        refetches: Vec::new(),
        invalidates: Vec::new(),
      }),
      state: Arc::default(),
    }
  }

  fn hooks_mut(&mut self) -> &mut Hooks<I, O> {
    Arc::make_mut(&mut self.hooks)
  }

  /// Optimistic phase. An `Err` fails the mutation without a network call.
  pub fn on_mutate<F>(mut self, f: F) -> Self
  where
    F: Fn(&QueryClient, &I) -> SyncResult<Option<Transaction>> + Send + Sync + 'static,
  {
    self.hooks_mut().on_mutate = Some(Arc::new(f));
    self
  }

  pub fn on_success<F>(mut self, f: F) -> Self
  where
    F: Fn(&QueryClient, &I, &O) + Send + Sync + 'static,
  {
    self.hooks_mut().on_success = Some(Arc::new(f));
    self
  }

  /// Runs after the optimistic transaction has been rolled back.
  pub fn on_error<F>(mut self, f: F) -> Self
  where
    F: Fn(&QueryClient, &I, &SyncError) + Send + Sync + 'static,
  {
    self.hooks_mut().on_error = Some(Arc::new(f));
    self
  }

  pub fn on_settled<F>(mut self, f: F) -> Self
  where
    F: Fn(&QueryClient, &I, &SyncResult<O>) + Send + Sync + 'static,
  {
    self.hooks_mut().on_settled = Some(Arc::new(f));
    self
  }

  /// Refetch a query after success, before the mutation settles.
  ///
  /// The refetch supersedes any fetch already in flight for the key, since
  /// that one may have started before the write landed.
  pub fn refetches<T, K>(mut self, key: K, fetcher: Fetcher<T>) -> Self
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    K: Fn(&I) -> QueryKey + Send + Sync + 'static,
  {
    let refetch: Refetch<I> = Arc::new(move |client, input| {
      let client = client.clone();
      let key = key(input);
      let fetcher = Arc::clone(&fetcher);
      async move {
        if let Err(e) = client.refetch_replace::<T>(&key, &fetcher).await {
          warn!(key = %key, error = %e, "refetch after mutation failed");
        }
      }
      .boxed()
    });
    self.hooks_mut().refetches.push(refetch);
    self
  }

  /// Invalidate a key (or key prefix) once the mutation settles, whatever the outcome.
  pub fn invalidates<K>(mut self, key: K) -> Self
  where
    K: Fn(&I) -> QueryKey + Send + Sync + 'static,
  {
    self.hooks_mut().invalidates.push(Arc::new(key));
    self
  }

  pub fn name(&self) -> &'static str {
    self.name
  }

  pub fn status(&self) -> MutationStatus {
    self.lock_state().status
  }

  pub fn is_pending(&self) -> bool {
    self.lock_state().pending > 0
  }

  /// Error of the last settled invocation, if it failed.
  pub fn error(&self) -> Option<SyncError> {
    self.lock_state().error.clone()
  }

  /// Return to `Idle` unless an invocation is still pending.
  pub fn reset(&self) {
    let mut state = self.lock_state();
    if state.pending == 0 {
      state.status = MutationStatus::Idle;
      state.error = None;
    }
  }

  fn lock_state(&self) -> std::sync::MutexGuard<'_, MutationState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Start the mutation. Must be called inside a tokio runtime.
  ///
  /// The optimistic projection is visible in the cache when this returns.
  /// Dropping the handle does not cancel the mutation.
  pub fn mutate(&self, input: I) -> MutationHandle<O> {
    {
      let mut state = self.lock_state();
      state.pending += 1;
      state.status = MutationStatus::Pending;
    }
    debug!(mutation = self.name, "mutation started");

    let optimistic = match &self.hooks.on_mutate {
      Some(hook) => hook(&self.client, &input),
      None => Ok(None),
    };

    let name = self.name;
    let client = self.client.clone();
    let hooks = Arc::clone(&self.hooks);
    let state = Arc::clone(&self.state);

    let task = tokio::spawn(async move {
      let (result, transaction) = match optimistic {
        Ok(transaction) => ((hooks.run)(input.clone()).await, transaction),
        Err(e) => (Err(e), None),
      };

      match &result {
        Ok(output) => {
          if let Some(transaction) = transaction {
            transaction.commit();
          }
          if let Some(hook) = &hooks.on_success {
            hook(&client, &input, output);
          }
          for refetch in &hooks.refetches {
            refetch(&client, &input).await;
          }
        }
        Err(e) => {
          warn!(mutation = name, error = %e, "mutation failed");
          if let Some(transaction) = transaction {
            transaction.rollback();
          }
          if let Some(hook) = &hooks.on_error {
            hook(&client, &input, e);
          }
        }
      }

      for key in &hooks.invalidates {
        client.invalidate(&key(&input));
      }
      if let Some(hook) = &hooks.on_settled {
        hook(&client, &input, &result);
      }

      {
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        state.pending = state.pending.saturating_sub(1);
        state.error = result.as_ref().err().cloned();
        if state.pending == 0 {
          state.status = if result.is_ok() {
            MutationStatus::Success
          } else {
            MutationStatus::Error
          };
        }
      }
      debug!(mutation = name, ok = result.is_ok(), "mutation settled");
      result
    });

    MutationHandle { task }
  }
}

impl<I, O> std::fmt::Debug for Mutation<I, O> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Mutation")
      .field("name", &self.name)
      .field("state", &*self.state.lock().unwrap_or_else(PoisonError::into_inner))
      .finish_non_exhaustive()
  }
}

/// Handle on one `mutate` invocation.
#[derive(Debug)]
pub struct MutationHandle<O> {
  task: JoinHandle<SyncResult<O>>,
}

impl<O> MutationHandle<O> {
  /// Wait until every hook has run and return the outcome.
  pub async fn settled(self) -> SyncResult<O> {
    self
      .task
      .await
      .unwrap_or_else(|e| Err(SyncError::Internal(format!("mutation task failed: {}", e))))
  }

  pub fn is_finished(&self) -> bool {
    self.task.is_finished()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query::{fetcher, QueryOptions};
  use crate::query_key;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  fn notes_key() -> QueryKey {
    query_key!["incident-note", 5]
  }

  fn prepend_note(client: &QueryClient, note: &String) -> SyncResult<Option<Transaction>> {
    let mut transaction = client.transaction(notes_key());
    let note = note.clone();
    transaction.apply::<Vec<String>, _>(move |old| {
      let mut notes = old.unwrap_or_default();
      notes.insert(0, note);
      notes
    })?;
    Ok(Some(transaction))
  }

  fn failing_send(client: &QueryClient) -> Mutation<String, ()> {
    Mutation::new(client, "send-note", |_note: String| async {
      tokio::time::sleep(Duration::from_millis(20)).await;
      Err(SyncError::transport(Some(500), "boom"))
    })
    .on_mutate(prepend_note)
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_optimistic_write_rolls_back_exactly() {
    let client = QueryClient::new();
    client
      .set_query_data(&notes_key(), &vec!["first".to_string()])
      .unwrap();
    let before = client.cache().get(&notes_key()).unwrap();

    let send = failing_send(&client);
    let handle = send.mutate("hello".to_string());

    let during: Vec<String> = client.get_query_data(&notes_key()).unwrap().unwrap();
    assert_eq!(during, vec!["hello".to_string(), "first".to_string()]);
    assert!(send.is_pending());
    assert_eq!(send.status(), MutationStatus::Pending);

    let err = handle.settled().await.unwrap_err();
    assert_eq!(err, SyncError::transport(Some(500), "boom"));
    assert_eq!(client.cache().get(&notes_key()).unwrap(), before);
    assert_eq!(send.status(), MutationStatus::Error);
    assert_eq!(send.error(), Some(err));
  }

  #[tokio::test(start_paused = true)]
  async fn test_settlement_invalidates_and_next_read_fetches_once() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let notes = fetcher(move |_key| {
      counter.fetch_add(1, Ordering::SeqCst);
      async { Ok(vec!["server".to_string()]) }
    });
    let options = QueryOptions::stale_after(Duration::from_secs(10));

    client.fetch_query(&notes_key(), options, &notes).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    for outcome in [Ok(()), Err(SyncError::transport(Some(400), "nope"))] {
      let send = Mutation::new(&client, "send-note", move |_note: String| {
        let outcome = outcome.clone();
        async move { outcome }
      })
      .on_mutate(prepend_note)
      .invalidates(|_| query_key!["incident-note"]);

      let before = calls.load(Ordering::SeqCst);
      let _ = send.mutate("hi".to_string()).settled().await;
      assert!(client.cache().get(&notes_key()).unwrap().invalidated);

      client.read(&notes_key(), options, &notes);
      client.read(&notes_key(), options, &notes);
      client.fetch_query(&notes_key(), options, &notes).await.unwrap();
      assert_eq!(calls.load(Ordering::SeqCst), before + 1);
    }
  }

  #[tokio::test]
  async fn test_success_commits_and_hooks_run_in_order() {
    let client = QueryClient::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    let (a, b, c) = (Arc::clone(&order), Arc::clone(&order), Arc::clone(&order));

    let send = Mutation::new(&client, "send-note", |note: String| async move { Ok(note.len()) })
      .on_mutate(prepend_note)
      .on_success(move |_, _, len| a.lock().unwrap().push(format!("success {}", len)))
      .on_error(move |_, _, _| b.lock().unwrap().push("error".to_string()))
      .on_settled(move |_, _, result| {
        c.lock().unwrap().push(format!("settled {}", result.is_ok()))
      });

    assert_eq!(send.mutate("hello".to_string()).settled().await.unwrap(), 5);
    assert_eq!(
      *order.lock().unwrap(),
      vec!["success 5".to_string(), "settled true".to_string()]
    );
    assert_eq!(
      client.get_query_data::<Vec<String>>(&notes_key()).unwrap(),
      Some(vec!["hello".to_string()])
    );
    assert_eq!(send.status(), MutationStatus::Success);

    send.reset();
    assert_eq!(send.status(), MutationStatus::Idle);
  }

  #[tokio::test]
  async fn test_refused_optimistic_phase_skips_network() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let send = Mutation::new(&client, "send-note", move |_note: String| {
      counter.fetch_add(1, Ordering::SeqCst);
      async { Ok(()) }
    })
    .on_mutate(|_, _| Err(SyncError::Rejected("incident is closed".into())));

    let err = send.mutate("late".to_string()).settled().await.unwrap_err();
    assert_eq!(err, SyncError::Rejected("incident is closed".into()));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(send.status(), MutationStatus::Error);
  }

  #[tokio::test(start_paused = true)]
  async fn test_refetch_lands_before_settlement() {
    let client = QueryClient::new();
    let key = query_key!["get-incidents"];
    client.set_query_data(&key, &vec![false]).unwrap();

    let list = fetcher(|_key| async {
      tokio::time::sleep(Duration::from_millis(30)).await;
      Ok(vec![true])
    });
    let close = Mutation::new(&client, "close-incident", |_id: i64| async { Ok(()) })
      .refetches(|_| query_key!["get-incidents"], list);

    let handle = close.mutate(1);
    // No optimistic path: the list only changes once the refetch resolves
    assert_eq!(client.get_query_data::<Vec<bool>>(&key).unwrap(), Some(vec![false]));
    handle.settled().await.unwrap();
    assert_eq!(client.get_query_data::<Vec<bool>>(&key).unwrap(), Some(vec![true]));
  }
}
