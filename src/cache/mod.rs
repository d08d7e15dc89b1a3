//! In-memory entity cache shared by the query and mutation engines.
//!
//! This module provides:
//! - Structural query keys with prefix matching
//! - Stale-while-revalidate entries with per-key fetch generations
//! - Explicit publish/subscribe notifications per key
//! - Optimistic write transactions with snapshot rollback

mod key;
mod store;
mod traits;
mod transaction;

pub use key::{QueryKey, Scalar};
pub(crate) use store::SharedFetch;
pub use store::{CacheEntry, CacheEvent, EntityCache, Listener, Subscription};
pub use traits::{CacheEventKind, Cacheable, FetchStatus};
pub use transaction::Transaction;
