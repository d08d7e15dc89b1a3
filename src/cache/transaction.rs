//! Optimistic write transactions over a single cache entry.

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::key::QueryKey;
use super::store::{EntityCache, SlotSnapshot};
use crate::error::SyncResult;

/// Snapshot, apply, then commit or roll back.
///
/// `begin` captures the entry and supersedes its in-flight fetch so a late
/// response cannot clobber the optimistic projection. `rollback` restores
/// the captured state but never resurrects an entry that was removed in the
/// meantime.
#[must_use = "a transaction should be committed or rolled back"]
pub struct Transaction {
  cache: EntityCache,
  key: QueryKey,
  snapshot: Option<SlotSnapshot>,
  written_id: Option<u64>,
  finished: bool,
}

impl Transaction {
  pub fn begin(cache: &EntityCache, key: QueryKey) -> Self {
    let snapshot = cache.begin_transaction(&key);
    debug!(key = %key, existed = snapshot.is_some(), "transaction started");
    Self {
      cache: cache.clone(),
      key,
      snapshot,
      written_id: None,
      finished: false,
    }
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// The value as it was before any optimistic write.
  pub fn previous<T: DeserializeOwned>(&self) -> SyncResult<Option<T>> {
    match self.snapshot.as_ref().and_then(|s| s.value.clone()) {
      Some(value) => Ok(Some(serde_json::from_value(value)?)),
      None => Ok(None),
    }
  }

  /// Write the optimistic projection `f(current)` into the live cache.
  pub fn apply<T, F>(&mut self, f: F) -> SyncResult<()>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce(Option<T>) -> T,
  {
    self.cache.update(&self.key, f)?;
    self.written_id = self.cache.entry_id(&self.key);
    Ok(())
  }

  /// Keep the optimistic value; reconciliation happens on invalidation.
  pub fn commit(mut self) {
    self.finished = true;
    debug!(key = %self.key, "transaction committed");
  }

  /// Restore the snapshot. Returns `false` if the entry had been removed
  /// or replaced, in which case nothing is written.
  pub fn rollback(mut self) -> bool {
    self.finished = true;
    let restored = self
      .cache
      .restore(&self.key, self.snapshot.as_ref(), self.written_id);
    if restored {
      warn!(key = %self.key, "optimistic update rolled back");
    }
    restored
  }
}

impl Drop for Transaction {
  fn drop(&mut self) {
    if !self.finished {
      debug!(key = %self.key, "transaction dropped unfinished, optimistic value kept");
    }
  }
}

impl std::fmt::Debug for Transaction {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Transaction")
      .field("key", &self.key)
      .field("had_entry", &self.snapshot.is_some())
      .field("finished", &self.finished)
      .finish()
  }
}
