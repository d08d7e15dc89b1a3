//! Serde types matching the dashboard backend's JSON.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

// ============================================================================
// Users and session
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
  pub id: String,
  pub username: String,
  pub email: String,
  #[serde(default)]
  pub is_active: bool,
  #[serde(default)]
  pub is_staff: bool,
  #[serde(default)]
  pub created: String,
  #[serde(default)]
  pub updated: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
  pub email: String,
  pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
  pub refresh: String,
  pub access: String,
  pub user: UserInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddUserRequest {
  pub email: String,
  pub username: String,
  pub password: String,
  pub is_staff: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateUserRequest {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub email: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub username: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub is_staff: Option<bool>,
}

// ============================================================================
// Incidents and notes
// ============================================================================

/// A threshold breach reported by a sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
  pub id: i64,
  pub title: String,
  pub description: Option<String>,
  pub temperature: f64,
  pub humidity: f64,
  pub reported_at: String,
  #[serde(default)]
  pub resolved: bool,
  pub closed_by: Option<UserInfo>,
  #[serde(default)]
  pub updated_at: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateIncidentRequest {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub resolved: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloseIncidentRequest {
  pub incident_id: i64,
}

/// Author of a note: the backend sends the nested user on reads but only
/// the id when echoing a freshly created note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NoteAuthor {
  User(UserInfo),
  Id(String),
}

impl NoteAuthor {
  pub fn id(&self) -> &str {
    match self {
      NoteAuthor::User(user) => &user.id,
      NoteAuthor::Id(id) => id,
    }
  }

  pub fn display_name(&self) -> &str {
    match self {
      NoteAuthor::User(user) => &user.username,
      NoteAuthor::Id(id) => id,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentNote {
  /// Negative while the note is a local, unconfirmed projection
  pub id: i64,
  pub note: String,
  pub created_at: String,
  pub updated_at: String,
  pub user_id: NoteAuthor,
  pub incident: i64,
}

impl IncidentNote {
  pub fn is_provisional(&self) -> bool {
    self.id < 0
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateIncidentNote {
  pub note: String,
  pub incident: i64,
  pub user_id: String,
}

// ============================================================================
// Parameters
// ============================================================================

macro_rules! wire_enum {
  ($name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum $name {
      $(
        #[serde(rename = $wire)]
        $variant,
      )+
    }

    impl $name {
      pub const ALL: &'static [$name] = &[$($name::$variant),+];

      pub fn as_str(self) -> &'static str {
        match self {
          $($name::$variant => $wire,)+
        }
      }
    }

    impl fmt::Display for $name {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
      }
    }

    impl FromStr for $name {
      type Err = SyncError;

      fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        Self::ALL
          .iter()
          .copied()
          .find(|v| v.as_str() == upper)
          .ok_or_else(|| {
            SyncError::Rejected(format!(
              "unknown {} '{}', expected one of: {}",
              stringify!($name),
              s,
              Self::ALL.iter().map(|v| v.as_str()).collect::<Vec<_>>().join(", ")
            ))
          })
      }
    }
  };
}

wire_enum!(NotificationParameterType {
  Email => "EMAIL",
  Whatsapp => "WHATSAPP",
  Sms => "SMS",
  Telegram => "TELEGRAM",
});

wire_enum!(BackendParameterType {
  TempMax => "TEMP_MAX",
  TempMin => "TEMP_MIN",
  HumMax => "HUM_MAX",
  HumMin => "HUM_MIN",
  CounterThreshold => "COUNTER_TRESHHOLD",
});

/// A notification destination (an address, phone number or chat id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationParameter {
  pub id: i64,
  #[serde(rename = "mainResource")]
  pub main_resource: String,
  #[serde(rename = "type")]
  pub kind: NotificationParameterType,
  #[serde(default)]
  pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddNotificationParameter {
  #[serde(rename = "mainResource")]
  pub main_resource: String,
  #[serde(rename = "type")]
  pub kind: NotificationParameterType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendParameter {
  pub value: f64,
  #[serde(rename = "type")]
  pub kind: BackendParameterType,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetBackendParameter {
  pub value: f64,
}

// ============================================================================
// Sensor readings
// ============================================================================

/// One averaged temperature/humidity sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordData {
  #[serde(default)]
  pub temp: Option<f64>,
  #[serde(default)]
  pub hum: Option<f64>,
  pub dt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateDiff {
  pub from_date: String,
  pub to_date: String,
  pub temp_diff: f64,
  pub hum_diff: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extremes {
  pub temp: Option<f64>,
  pub hum: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtremesRecord {
  pub highest: Extremes,
  pub lowest: Extremes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvgRecord {
  pub record: RecordData,
  #[serde(rename = "humGrow", default)]
  pub hum_grow: Option<f64>,
  #[serde(rename = "humTemp", default)]
  pub hum_temp: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AveragesByPeriod {
  pub daily: AvgRecord,
  pub weekly: AvgRecord,
  pub monthly: AvgRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentRecord {
  pub record: RecordData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryStatistics {
  pub curr: CurrentRecord,
  pub avg: AveragesByPeriod,
  pub extremes: ExtremesRecord,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_note_author_accepts_nested_user_or_id() {
    let nested: IncidentNote = serde_json::from_value(json!({
      "id": 3,
      "note": "checked sensor",
      "created_at": "2024-05-01T10:00:00Z",
      "updated_at": "2024-05-01T10:00:00Z",
      "user_id": {"id": "u1", "username": "amal", "email": "amal@example.org",
                  "is_active": true, "is_staff": false},
      "incident": 5
    }))
    .unwrap();
    assert_eq!(nested.user_id.id(), "u1");
    assert_eq!(nested.user_id.display_name(), "amal");

    let flat: IncidentNote = serde_json::from_value(json!({
      "id": 4, "note": "ok", "created_at": "", "updated_at": "",
      "user_id": "u2", "incident": 5
    }))
    .unwrap();
    assert_eq!(flat.user_id, NoteAuthor::Id("u2".into()));
    assert!(!flat.is_provisional());
  }

  #[test]
  fn test_parameter_wire_names() {
    let param: BackendParameter =
      serde_json::from_value(json!({"value": 35.5, "type": "COUNTER_TRESHHOLD"})).unwrap();
    assert_eq!(param.kind, BackendParameterType::CounterThreshold);

    let body = serde_json::to_value(AddNotificationParameter {
      main_resource: "ops@example.org".into(),
      kind: NotificationParameterType::Email,
    })
    .unwrap();
    assert_eq!(body, json!({"mainResource": "ops@example.org", "type": "EMAIL"}));
  }

  #[test]
  fn test_parameter_type_from_str() {
    assert_eq!(
      "telegram".parse::<NotificationParameterType>().unwrap(),
      NotificationParameterType::Telegram
    );
    assert_eq!(
      "hum_min".parse::<BackendParameterType>().unwrap(),
      BackendParameterType::HumMin
    );
    let err = "FAX".parse::<NotificationParameterType>().unwrap_err();
    assert!(err.to_string().contains("EMAIL, WHATSAPP, SMS, TELEGRAM"));
  }

  #[test]
  fn test_partial_updates_skip_unset_fields() {
    let body = serde_json::to_value(UpdateUserRequest {
      is_staff: Some(true),
      ..Default::default()
    })
    .unwrap();
    assert_eq!(body, json!({"is_staff": true}));
  }

  #[test]
  fn test_summary_statistics_shape() {
    let stats: SummaryStatistics = serde_json::from_value(json!({
      "curr": {"record": {"temp": 21.5, "hum": 40.0, "dt": "2024-05-01"}},
      "avg": {
        "daily": {"record": {"temp": 20.0, "hum": 41.0, "dt": "2024-05-01"}, "humGrow": 1.5, "humTemp": null},
        "weekly": {"record": {"temp": 19.0, "hum": 42.0, "dt": "2024-04-28"}, "humGrow": null, "humTemp": null},
        "monthly": {"record": {"temp": 18.0, "hum": 43.0, "dt": "2024-04-01"}, "humGrow": null, "humTemp": 0.2}
      },
      "extremes": {"highest": {"temp": 31.0, "hum": 80.0}, "lowest": {"temp": 4.0, "hum": null}}
    }))
    .unwrap();
    assert_eq!(stats.curr.record.temp, Some(21.5));
    assert_eq!(stats.avg.daily.hum_grow, Some(1.5));
    assert_eq!(stats.extremes.lowest.hum, None);
  }
}
