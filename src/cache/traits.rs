//! Core traits and types for the caching system.

use serde::{de::DeserializeOwned, Serialize};

use super::key::Scalar;

/// Trait for entities that can live in the cache.
///
/// Entries are stored as JSON values, so anything cached must round-trip
/// through serde. The id is used for list-membership adjustments such as
/// dropping a deleted incident from the incidents list.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Unique identifier for this entity (e.g., incident id, user id)
  fn entity_id(&self) -> Scalar;

  /// Entity type name used in logs (e.g., "incident", "user")
  fn entity_type() -> &'static str;
}

/// Lifecycle of a cache entry's most recent fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchStatus {
  /// Never fetched, or only written locally
  #[default]
  Idle,
  /// A fetch originated by this entry is in flight
  Loading,
  /// The last fetch (or local write) succeeded
  Success,
  /// The last fetch failed; the previous value is retained
  Error,
}

/// What happened to an entry, as reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEventKind {
  /// A fetch started for the key
  Fetching,
  /// The value changed (fetch commit, local write or rollback)
  Updated,
  /// A fetch failed; the previous value is still available
  Failed,
  /// The entry was marked stale
  Invalidated,
  /// The entry was dropped
  Removed,
}
