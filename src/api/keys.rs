//! Query keys, freshness windows and cache identities for dashboard entities.

use std::collections::HashMap;
use std::time::Duration;

use crate::cache::{Cacheable, QueryKey, Scalar};
use crate::query::QueryOptions;
use crate::query_key;

use super::types::{
  BackendParameter, Incident, IncidentNote, NotificationParameter, NotificationParameterType,
  UserInfo,
};

// ============================================================================
// Entity types (first element of every key)
// ============================================================================

pub const INCIDENTS: &str = "get-incidents";
pub const INCIDENT_NOTES: &str = "incident-note";
pub const USERS: &str = "get-users";
pub const CURRENT_USER: &str = "get-user";
pub const BACKEND_PARAMETERS: &str = "backend-parameters";
pub const NOTIFICATION_PARAMETERS: &str = "notifications-parameters";
pub const MONTH_AVERAGES: &str = "monthAverages";
pub const LATEST_RECORDS: &str = "latestNRecords";
pub const RANGE_RECORDS: &str = "rangeRecords";
pub const SUMMARY_STATISTICS: &str = "summaryStatistics";
pub const DATE_DIFF: &str = "diffBetween2Dates";

// ============================================================================
// Key constructors
// ============================================================================

pub fn incidents() -> QueryKey {
  query_key![INCIDENTS]
}

/// Notes of one incident; `None` while no incident is selected.
pub fn incident_notes(incident: Option<i64>) -> QueryKey {
  query_key![INCIDENT_NOTES, incident]
}

pub fn all_incident_notes() -> QueryKey {
  query_key![INCIDENT_NOTES]
}

pub fn users() -> QueryKey {
  query_key![USERS]
}

pub fn current_user() -> QueryKey {
  query_key![CURRENT_USER]
}

pub fn backend_parameters() -> QueryKey {
  query_key![BACKEND_PARAMETERS]
}

pub fn notification_parameters(kind: NotificationParameterType) -> QueryKey {
  query_key![NOTIFICATION_PARAMETERS, kind.as_str()]
}

pub fn month_averages() -> QueryKey {
  query_key![MONTH_AVERAGES]
}

pub fn latest_records(days: u32) -> QueryKey {
  query_key![LATEST_RECORDS, days]
}

pub fn range_records(from: &str, to: &str) -> QueryKey {
  query_key![RANGE_RECORDS, from, to]
}

pub fn summary_statistics() -> QueryKey {
  query_key![SUMMARY_STATISTICS]
}

pub fn date_diff(from: &str, to: &str) -> QueryKey {
  query_key![DATE_DIFF, from, to]
}

// ============================================================================
// Freshness
// ============================================================================

const SECOND: u64 = 1;
const MINUTE: u64 = 60 * SECOND;

/// Built-in freshness window for an entity type, in seconds.
fn default_stale_secs(entity_type: &str) -> u64 {
  match entity_type {
    INCIDENTS | SUMMARY_STATISTICS => 30 * SECOND,
    INCIDENT_NOTES => 10 * SECOND,
    CURRENT_USER => 5 * MINUTE,
    USERS | BACKEND_PARAMETERS | NOTIFICATION_PARAMETERS => 30 * MINUTE,
    MONTH_AVERAGES | LATEST_RECORDS | RANGE_RECORDS | DATE_DIFF => 60 * MINUTE,
    _ => 0,
  }
}

/// Freshness windows per entity type, with optional overrides from config.
#[derive(Debug, Clone, Default)]
pub struct Freshness {
  overrides: HashMap<String, u64>,
}

impl Freshness {
  pub fn new(overrides: HashMap<String, u64>) -> Self {
    Self { overrides }
  }

  pub fn stale_after(&self, entity_type: &str) -> Duration {
    let secs = self
      .overrides
      .get(entity_type)
      .copied()
      .unwrap_or_else(|| default_stale_secs(entity_type));
    Duration::from_secs(secs)
  }

  pub fn options(&self, key: &QueryKey) -> QueryOptions {
    QueryOptions::stale_after(self.stale_after(key.entity_type()))
  }
}

// ============================================================================
// Cacheable implementations
// ============================================================================

impl Cacheable for Incident {
  fn entity_id(&self) -> Scalar {
    Scalar::Int(self.id)
  }

  fn entity_type() -> &'static str {
    "incident"
  }
}

impl Cacheable for IncidentNote {
  fn entity_id(&self) -> Scalar {
    Scalar::Int(self.id)
  }

  fn entity_type() -> &'static str {
    "incident_note"
  }
}

impl Cacheable for UserInfo {
  fn entity_id(&self) -> Scalar {
    Scalar::from(&self.id)
  }

  fn entity_type() -> &'static str {
    "user"
  }
}

impl Cacheable for NotificationParameter {
  fn entity_id(&self) -> Scalar {
    Scalar::Int(self.id)
  }

  fn entity_type() -> &'static str {
    "notification_parameter"
  }
}

impl Cacheable for BackendParameter {
  // One value per parameter type
  fn entity_id(&self) -> Scalar {
    Scalar::from(self.kind.as_str())
  }

  fn entity_type() -> &'static str {
    "backend_parameter"
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_windows() {
    let freshness = Freshness::default();
    assert_eq!(freshness.stale_after(INCIDENTS), Duration::from_secs(30));
    assert_eq!(freshness.stale_after(INCIDENT_NOTES), Duration::from_secs(10));
    assert_eq!(freshness.stale_after(CURRENT_USER), Duration::from_secs(300));
    assert_eq!(freshness.stale_after(USERS), Duration::from_secs(1800));
    assert_eq!(freshness.stale_after(DATE_DIFF), Duration::from_secs(3600));
    assert_eq!(freshness.stale_after("unknown"), Duration::ZERO);
  }

  #[test]
  fn test_overrides_apply_per_entity_type() {
    let freshness = Freshness::new(HashMap::from([(INCIDENTS.to_string(), 5)]));
    assert_eq!(
      freshness.options(&incidents()).stale_after,
      Duration::from_secs(5)
    );
    assert_eq!(
      freshness.options(&incident_notes(Some(1))).stale_after,
      Duration::from_secs(10)
    );
  }

  #[test]
  fn test_keys_match_backend_conventions() {
    assert_eq!(incident_notes(Some(5)).to_string(), r#"["incident-note",5]"#);
    assert_eq!(incident_notes(None).to_string(), r#"["incident-note",null]"#);
    assert!(incident_notes(Some(5)).starts_with(&all_incident_notes()));
    assert_eq!(
      notification_parameters(NotificationParameterType::Sms).to_string(),
      r#"["notifications-parameters","SMS"]"#
    );
    assert_eq!(
      range_records("2024-01-01", "2024-02-01").to_string(),
      r#"["rangeRecords","2024-01-01","2024-02-01"]"#
    );
  }
}
