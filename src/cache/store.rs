//! Keyed entity store with fetch bookkeeping and per-key subscriptions.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use super::key::{QueryKey, Scalar};
use super::traits::{CacheEventKind, Cacheable, FetchStatus};
use crate::error::{SyncError, SyncResult};

/// A fetch that any number of waiters can await; resolves once per key and generation.
pub(crate) type SharedFetch = Shared<BoxFuture<'static, SyncResult<Value>>>;

/// Callback invoked synchronously after a change to a subscribed key.
pub type Listener = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

/// Read-only view of a cache entry. Callers get a copy, never the live entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub key: QueryKey,
  /// Last known value, kept across invalidations and failed fetches
  pub value: Option<Value>,
  pub fetched_at: Option<Instant>,
  pub stale_after: Duration,
  pub status: FetchStatus,
  pub error: Option<SyncError>,
  /// Marked stale explicitly; the next read refetches regardless of age
  pub invalidated: bool,
  pub is_fetching: bool,
}

impl CacheEntry {
  /// Stale according to the entry's own freshness window.
  pub fn is_stale(&self) -> bool {
    self.is_stale_after(self.stale_after)
  }

  /// Stale according to a caller-supplied freshness window.
  pub fn is_stale_after(&self, stale_after: Duration) -> bool {
    if self.invalidated {
      return true;
    }
    match self.fetched_at {
      Some(at) => Instant::now().saturating_duration_since(at) > stale_after,
      None => true,
    }
  }

  /// Deserialize the stored value.
  pub fn data<T: DeserializeOwned>(&self) -> SyncResult<Option<T>> {
    self
      .value
      .clone()
      .map(serde_json::from_value)
      .transpose()
      .map_err(SyncError::from)
  }
}

/// Notification delivered to subscribers of a key.
#[derive(Debug, Clone)]
pub struct CacheEvent {
  pub key: QueryKey,
  pub kind: CacheEventKind,
  /// Entry state right after the change; `None` once removed
  pub entry: Option<CacheEntry>,
}

struct Slot {
  /// Identity of this entry; a removed and recreated key gets a new id
  id: u64,
  value: Option<Value>,
  fetched_at: Option<Instant>,
  stale_after: Duration,
  status: FetchStatus,
  error: Option<SyncError>,
  invalidated: bool,
  /// Generation of the most recently started fetch or superseding write
  generation: u64,
  in_flight: Option<SharedFetch>,
}

impl Slot {
  fn new(id: u64) -> Self {
    Self {
      id,
      value: None,
      fetched_at: None,
      stale_after: Duration::ZERO,
      status: FetchStatus::Idle,
      error: None,
      invalidated: false,
      generation: id,
      in_flight: None,
    }
  }

  fn snapshot(&self, key: &QueryKey) -> CacheEntry {
    CacheEntry {
      key: key.clone(),
      value: self.value.clone(),
      fetched_at: self.fetched_at,
      stale_after: self.stale_after,
      status: self.status,
      error: self.error.clone(),
      invalidated: self.invalidated,
      is_fetching: self.in_flight.is_some(),
    }
  }

  /// Advance the generation so any in-flight result is discarded on arrival.
  fn supersede(&mut self, generation: u64) -> bool {
    self.generation = generation;
    let had_fetch = self.in_flight.take().is_some();
    if had_fetch {
      self.status = if self.value.is_some() {
        FetchStatus::Success
      } else if self.error.is_some() {
        FetchStatus::Error
      } else {
        FetchStatus::Idle
      };
    }
    had_fetch
  }

  fn write(&mut self, value: Value) {
    self.value = Some(value);
    self.fetched_at = Some(Instant::now());
    self.status = FetchStatus::Success;
    self.error = None;
    self.invalidated = false;
  }
}

/// State captured by a transaction before its optimistic write.
#[derive(Debug, Clone)]
pub(super) struct SlotSnapshot {
  pub entry_id: u64,
  pub value: Option<Value>,
  pub fetched_at: Option<Instant>,
  pub stale_after: Duration,
  pub status: FetchStatus,
  pub error: Option<SyncError>,
  pub invalidated: bool,
}

#[derive(Default)]
struct Inner {
  entries: HashMap<QueryKey, Slot>,
  listeners: HashMap<QueryKey, Vec<(u64, Listener)>>,
  counter: u64,
}

impl Inner {
  fn next_id(&mut self) -> u64 {
    self.counter += 1;
    self.counter
  }

  fn slot_mut(&mut self, key: &QueryKey) -> &mut Slot {
    let counter = &mut self.counter;
    self.entries.entry(key.clone()).or_insert_with(|| {
      *counter += 1;
      Slot::new(*counter)
    })
  }

  fn notice(&self, key: &QueryKey, kind: CacheEventKind) -> Option<Notice> {
    let listeners: Vec<Listener> = self
      .listeners
      .get(key)?
      .iter()
      .map(|(_, l)| Arc::clone(l))
      .collect();
    if listeners.is_empty() {
      return None;
    }
    Some(Notice {
      listeners,
      event: CacheEvent {
        key: key.clone(),
        kind,
        entry: self.entries.get(key).map(|s| s.snapshot(key)),
      },
    })
  }
}

struct Notice {
  listeners: Vec<Listener>,
  event: CacheEvent,
}

/// Listeners run after the lock is released so they may read the cache.
fn dispatch(notices: impl IntoIterator<Item = Notice>) {
  for notice in notices {
    for listener in &notice.listeners {
      listener(&notice.event);
    }
  }
}

/// The single shared store of server-backed entities.
///
/// Cloning yields another handle to the same store. All state changes happen
/// under one lock that is never held across an await point, so no reader can
/// observe a half-updated entry.
#[derive(Clone, Default)]
pub struct EntityCache {
  inner: Arc<Mutex<Inner>>,
}

impl EntityCache {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
    self.lock().entries.get(key).map(|s| s.snapshot(key))
  }

  /// Typed view of an entry's value.
  pub fn get_data<T: DeserializeOwned>(&self, key: &QueryKey) -> SyncResult<Option<T>> {
    match self.get(key) {
      Some(entry) => entry.data(),
      None => Ok(None),
    }
  }

  pub fn contains(&self, key: &QueryKey) -> bool {
    self.lock().entries.contains_key(key)
  }

  pub fn keys(&self) -> Vec<QueryKey> {
    let mut keys: Vec<QueryKey> = self.lock().entries.keys().cloned().collect();
    keys.sort();
    keys
  }

  /// Write a value as fresh, superseding any in-flight fetch for the key.
  pub fn set<T: Serialize>(&self, key: &QueryKey, value: &T) -> SyncResult<()> {
    let value = serde_json::to_value(value)?;
    let notice = {
      let mut inner = self.lock();
      let generation = inner.next_id();
      let slot = inner.slot_mut(key);
      slot.supersede(generation);
      slot.write(value);
      inner.notice(key, CacheEventKind::Updated)
    };
    dispatch(notice);
    Ok(())
  }

  /// Replace an entry's value with `f(current)`.
  ///
  /// `f` runs under the cache lock and must not touch the cache itself.
  pub fn update<T, F>(&self, key: &QueryKey, f: F) -> SyncResult<()>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce(Option<T>) -> T,
  {
    let notice = {
      let mut inner = self.lock();
      let current: Option<T> = match inner.entries.get(key).and_then(|s| s.value.clone()) {
        Some(Value::Null) | None => None,
        Some(v) => Some(serde_json::from_value(v)?),
      };
      let next = serde_json::to_value(f(current))?;
      let generation = inner.next_id();
      let slot = inner.slot_mut(key);
      slot.supersede(generation);
      slot.write(next);
      inner.notice(key, CacheEventKind::Updated)
    };
    dispatch(notice);
    Ok(())
  }

  /// Mark every entry whose key starts with `prefix` as stale.
  ///
  /// Values are kept so views can show them while the refetch runs. Any
  /// in-flight fetch for a matching key is superseded, so the next read
  /// starts exactly one new fetch. Returns the number of entries touched.
  pub fn invalidate(&self, prefix: &QueryKey) -> usize {
    let (count, notices) = {
      let mut inner = self.lock();
      let matching: Vec<QueryKey> = inner
        .entries
        .keys()
        .filter(|k| k.starts_with(prefix))
        .cloned()
        .collect();
      for key in &matching {
        let generation = inner.next_id();
        let slot = inner.slot_mut(key);
        slot.supersede(generation);
        slot.invalidated = true;
      }
      let notices: Vec<Notice> = matching
        .iter()
        .filter_map(|k| inner.notice(k, CacheEventKind::Invalidated))
        .collect();
      (matching.len(), notices)
    };
    debug!(prefix = %prefix, count, "invalidated cache entries");
    dispatch(notices);
    count
  }

  /// Supersede the in-flight fetch for a key without marking it stale.
  ///
  /// The network call keeps running; its result is simply not applied.
  pub fn cancel(&self, key: &QueryKey) -> bool {
    let (cancelled, notice) = {
      let mut inner = self.lock();
      let generation = inner.next_id();
      match inner.entries.get_mut(key) {
        Some(slot) => {
          let cancelled = slot.supersede(generation);
          let notice = if cancelled {
            inner.notice(key, CacheEventKind::Updated)
          } else {
            None
          };
          (cancelled, notice)
        }
        None => (false, None),
      }
    };
    dispatch(notice);
    cancelled
  }

  /// Drop an entry entirely. A pending fetch for it will not recreate it.
  pub fn remove(&self, key: &QueryKey) -> bool {
    let (removed, notice) = {
      let mut inner = self.lock();
      let removed = inner.entries.remove(key).is_some();
      let notice = if removed {
        inner.notice(key, CacheEventKind::Removed)
      } else {
        None
      };
      (removed, notice)
    };
    dispatch(notice);
    removed
  }

  pub fn clear(&self) {
    let notices: Vec<Notice> = {
      let mut inner = self.lock();
      let keys: Vec<QueryKey> = inner.entries.drain().map(|(k, _)| k).collect();
      keys
        .iter()
        .filter_map(|k| inner.notice(k, CacheEventKind::Removed))
        .collect()
    };
    dispatch(notices);
  }

  /// Drop the element with `id` from a list-shaped entry.
  ///
  /// Freshness metadata is left untouched. Returns `false` if the entry is
  /// absent or does not contain the id, so repeating the call is a no-op.
  pub fn remove_from_list<T: Cacheable>(&self, key: &QueryKey, id: &Scalar) -> SyncResult<bool> {
    let notice = {
      let mut inner = self.lock();
      let Some(slot) = inner.entries.get_mut(key) else {
        return Ok(false);
      };
      let Some(Value::Array(_)) = &slot.value else {
        return Ok(false);
      };
      let items: Vec<T> = slot.data_vec()?;
      let before = items.len();
      let kept: Vec<T> = items.into_iter().filter(|e| &e.entity_id() != id).collect();
      if kept.len() == before {
        return Ok(false);
      }
      slot.value = Some(serde_json::to_value(&kept)?);
      debug!(key = %key, entity = T::entity_type(), id = %id, "removed entity from cached list");
      inner.notice(key, CacheEventKind::Updated)
    };
    dispatch(notice);
    Ok(true)
  }

  /// Register a listener for one key. The returned handle unsubscribes on drop.
  pub fn subscribe<F>(&self, key: &QueryKey, listener: F) -> Subscription
  where
    F: Fn(&CacheEvent) + Send + Sync + 'static,
  {
    let mut inner = self.lock();
    let id = inner.next_id();
    inner
      .listeners
      .entry(key.clone())
      .or_default()
      .push((id, Arc::new(listener)));
    Subscription {
      inner: Arc::downgrade(&self.inner),
      key: key.clone(),
      id,
    }
  }

  pub fn subscriber_count(&self, key: &QueryKey) -> usize {
    self.lock().listeners.get(key).map_or(0, Vec::len)
  }

  // ==========================================================================
  // Fetch bookkeeping (query engine)
  // ==========================================================================

  /// Join the in-flight fetch for `key`, or start one via `launch`.
  ///
  /// With `replace`, a new fetch is started even if one is in flight; the
  /// older one is superseded. Returns the generation the caller awaits.
  pub(crate) fn start_fetch<F>(
    &self,
    key: &QueryKey,
    stale_after: Option<Duration>,
    replace: bool,
    launch: F,
  ) -> (u64, SharedFetch)
  where
    F: FnOnce(u64) -> SharedFetch,
  {
    let (generation, fetch, notice) = {
      let mut inner = self.lock();
      let generation = inner.next_id();
      let slot = inner.slot_mut(key);
      if let Some(stale_after) = stale_after {
        slot.stale_after = stale_after;
      }
      if !replace {
        if let Some(fetch) = &slot.in_flight {
          return (slot.generation, fetch.clone());
        }
      }
      slot.generation = generation;
      slot.status = FetchStatus::Loading;
      let fetch = launch(generation);
      slot.in_flight = Some(fetch.clone());
      let notice = inner.notice(key, CacheEventKind::Fetching);
      (generation, fetch, notice)
    };
    debug!(key = %key, generation, replace, "fetch started");
    dispatch(notice);
    (generation, fetch)
  }

  /// Apply a fetch result if it is still the most recently started one.
  pub(crate) fn commit_fetch(
    &self,
    key: &QueryKey,
    generation: u64,
    result: &SyncResult<Value>,
  ) -> bool {
    let notice = {
      let mut inner = self.lock();
      let Some(slot) = inner.entries.get_mut(key) else {
        debug!(key = %key, generation, "fetch result dropped, entry removed");
        return false;
      };
      if slot.generation != generation || slot.in_flight.is_none() {
        debug!(key = %key, generation, current = slot.generation, "superseded fetch result discarded");
        return false;
      }
      slot.in_flight = None;
      let kind = match result {
        Ok(value) => {
          slot.write(value.clone());
          CacheEventKind::Updated
        }
        Err(e) => {
          slot.status = FetchStatus::Error;
          slot.error = Some(e.clone());
          CacheEventKind::Failed
        }
      };
      inner.notice(key, kind)
    };
    debug!(key = %key, generation, ok = result.is_ok(), "fetch committed");
    dispatch(notice);
    true
  }

  pub(crate) fn in_flight(&self, key: &QueryKey) -> Option<(u64, SharedFetch)> {
    let inner = self.lock();
    let slot = inner.entries.get(key)?;
    slot
      .in_flight
      .as_ref()
      .map(|fetch| (slot.generation, fetch.clone()))
  }

  pub(crate) fn generation(&self, key: &QueryKey) -> Option<u64> {
    self.lock().entries.get(key).map(|s| s.generation)
  }

  // ==========================================================================
  // Transaction support
  // ==========================================================================

  pub(super) fn entry_id(&self, key: &QueryKey) -> Option<u64> {
    self.lock().entries.get(key).map(|s| s.id)
  }

  /// Capture an entry and supersede its in-flight fetch so that the fetch
  /// cannot overwrite the optimistic value about to be written.
  pub(super) fn begin_transaction(&self, key: &QueryKey) -> Option<SlotSnapshot> {
    let mut inner = self.lock();
    let generation = inner.next_id();
    let slot = inner.entries.get_mut(key)?;
    slot.supersede(generation);
    Some(SlotSnapshot {
      entry_id: slot.id,
      value: slot.value.clone(),
      fetched_at: slot.fetched_at,
      stale_after: slot.stale_after,
      status: slot.status,
      error: slot.error.clone(),
      invalidated: slot.invalidated,
    })
  }

  /// Undo an optimistic write.
  ///
  /// Only the entry the snapshot was taken from is restored; if it has been
  /// removed (or removed and recreated) since, nothing is written back.
  pub(super) fn restore(
    &self,
    key: &QueryKey,
    snapshot: Option<&SlotSnapshot>,
    written_id: Option<u64>,
  ) -> bool {
    let notice = {
      let mut inner = self.lock();
      let current_id = inner.entries.get(key).map(|s| s.id);
      match (snapshot, current_id) {
        (Some(snap), Some(id)) if id == snap.entry_id => {
          let slot = inner.slot_mut(key);
          slot.value = snap.value.clone();
          slot.fetched_at = snap.fetched_at;
          slot.stale_after = snap.stale_after;
          slot.status = if slot.in_flight.is_some() {
            FetchStatus::Loading
          } else {
            snap.status
          };
          slot.error = snap.error.clone();
          slot.invalidated = snap.invalidated;
          inner.notice(key, CacheEventKind::Updated)
        }
        (None, Some(id)) if Some(id) == written_id => {
          inner.entries.remove(key);
          inner.notice(key, CacheEventKind::Removed)
        }
        _ => {
          debug!(key = %key, "rollback skipped, entry no longer matches snapshot");
          return false;
        }
      }
    };
    dispatch(notice);
    true
  }
}

impl Slot {
  fn data_vec<T: DeserializeOwned>(&self) -> SyncResult<Vec<T>> {
    match &self.value {
      Some(v) => Ok(serde_json::from_value(v.clone())?),
      None => Ok(Vec::new()),
    }
  }
}

impl fmt::Debug for EntityCache {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EntityCache")
      .field("keys", &self.keys())
      .finish_non_exhaustive()
  }
}

/// Handle returned by [`EntityCache::subscribe`].
#[must_use = "dropping a Subscription unsubscribes its listener"]
pub struct Subscription {
  inner: Weak<Mutex<Inner>>,
  key: QueryKey,
  id: u64,
}

impl Subscription {
  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// Stop receiving events. Equivalent to dropping the handle.
  pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
  fn drop(&mut self) {
    let Some(inner) = self.inner.upgrade() else {
      return;
    };
    let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(listeners) = inner.listeners.get_mut(&self.key) {
      listeners.retain(|(id, _)| *id != self.id);
      if listeners.is_empty() {
        inner.listeners.remove(&self.key);
      }
    }
  }
}

impl fmt::Debug for Subscription {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Subscription")
      .field("key", &self.key)
      .field("id", &self.id)
      .finish()
  }
}
