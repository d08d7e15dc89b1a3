//! Dashboard backend: entity types, query keys, raw endpoints and the
//! synchronized facade built on the query and mutation engines.

mod client;
mod dashboard;
pub mod keys;
mod types;

pub use client::DashboardApi;
pub use dashboard::{Dashboard, DashboardSettings, NewNote};
pub use types::*;
