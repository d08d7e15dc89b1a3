//! Client-side data synchronization for the sensor dashboard.
//!
//! Reads go through the [`query`] engine and writes through the
//! [`mutation`] engine; both share one [`cache::EntityCache`] owned by an
//! explicitly constructed [`QueryClient`]. The [`api::Dashboard`] facade
//! binds every backend endpoint to those engines.

pub mod api;
pub mod cache;
pub mod error;
pub mod mutation;
pub mod query;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{SyncError, SyncResult};
pub use mutation::{Mutation, MutationHandle, MutationStatus};
pub use query::{fetcher, Fetcher, Query, QueryClient, QueryOptions, QueryResult};
pub use session::{RouteDecision, RouteGuard, Session, SessionState};
