//! Credential stores for the access and refresh tokens.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{SyncError, SyncResult};

/// Name of the bearer token credential.
pub const ACCESS_TOKEN: &str = "auth";
/// Name of the refresh token credential.
pub const REFRESH_TOKEN: &str = "refresh";

/// Named credential storage with optional expiry, in the manner of a cookie jar.
pub trait CredentialStore: Send + Sync {
  /// Current value, or `None` if absent or expired.
  fn get(&self, name: &str) -> Option<String>;

  fn set(&self, name: &str, value: &str, expires_in_days: Option<u32>) -> SyncResult<()>;

  fn remove(&self, name: &str) -> SyncResult<()>;
}

/// Short stable identifier for a secret, safe to put in logs.
pub fn fingerprint(secret: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(secret.as_bytes());
  let digest = hex::encode(hasher.finalize());
  digest[..12].to_string()
}

fn expiry(expires_in_days: Option<u32>) -> Option<DateTime<Utc>> {
  expires_in_days.map(|days| Utc::now() + Duration::days(i64::from(days)))
}

/// Process-local store, used by tests and one-shot runs.
#[derive(Debug, Default)]
pub struct MemoryCredentials {
  values: Mutex<HashMap<String, (String, Option<DateTime<Utc>>)>>,
}

impl MemoryCredentials {
  pub fn new() -> Self {
    Self::default()
  }

  /// Seed a credential, e.g. a token provided through the environment.
  pub fn with(self, name: &str, value: &str) -> Self {
    self
      .values
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(name.to_string(), (value.to_string(), None));
    self
  }
}

impl CredentialStore for MemoryCredentials {
  fn get(&self, name: &str) -> Option<String> {
    let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
    match values.get(name) {
      Some((_, Some(expires_at))) if *expires_at <= Utc::now() => {
        values.remove(name);
        None
      }
      Some((value, _)) => Some(value.clone()),
      None => None,
    }
  }

  fn set(&self, name: &str, value: &str, expires_in_days: Option<u32>) -> SyncResult<()> {
    self
      .values
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(name.to_string(), (value.to_string(), expiry(expires_in_days)));
    Ok(())
  }

  fn remove(&self, name: &str) -> SyncResult<()> {
    self
      .values
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(name);
    Ok(())
  }
}

/// SQLite-backed store so a login survives between runs.
pub struct SqliteCredentials {
  conn: Mutex<Connection>,
}

/// Schema for the credential table.
const CREDENTIAL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS credentials (
    name TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at TEXT
);
"#;

impl SqliteCredentials {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> SyncResult<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| SyncError::Storage(format!("failed to create {}: {}", parent.display(), e)))?;
    }

    let conn = Connection::open(path)?;
    Self::with_connection(conn)
  }

  /// Open the store at the default location under the user data directory.
  pub fn open_default() -> SyncResult<Self> {
    Self::open(&Self::default_path()?)
  }

  pub fn in_memory() -> SyncResult<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> SyncResult<Self> {
    conn.execute_batch(CREDENTIAL_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> SyncResult<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| SyncError::Storage("could not determine data directory".into()))?;

    Ok(data_dir.join("sensordash").join("credentials.db"))
  }

  fn lookup(&self, name: &str) -> SyncResult<Option<String>> {
    let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);

    let row: Option<(String, Option<String>)> = conn
      .query_row(
        "SELECT value, expires_at FROM credentials WHERE name = ?",
        params![name],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;

    let Some((value, expires_at)) = row else {
      return Ok(None);
    };

    if let Some(expires_at) = expires_at {
      let expires_at = DateTime::parse_from_rfc3339(&expires_at)
        .map_err(|e| SyncError::Storage(format!("bad expiry for {}: {}", name, e)))?;
      if expires_at <= Utc::now() {
        conn.execute("DELETE FROM credentials WHERE name = ?", params![name])?;
        return Ok(None);
      }
    }

    Ok(Some(value))
  }
}

impl CredentialStore for SqliteCredentials {
  fn get(&self, name: &str) -> Option<String> {
    match self.lookup(name) {
      Ok(value) => value,
      Err(e) => {
        warn!(name, error = %e, "credential lookup failed");
        None
      }
    }
  }

  fn set(&self, name: &str, value: &str, expires_in_days: Option<u32>) -> SyncResult<()> {
    let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
    let expires_at = expiry(expires_in_days).map(|t| t.to_rfc3339());

    conn.execute(
      "INSERT OR REPLACE INTO credentials (name, value, expires_at) VALUES (?, ?, ?)",
      params![name, value, expires_at],
    )?;

    Ok(())
  }

  fn remove(&self, name: &str) -> SyncResult<()> {
    let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
    conn.execute("DELETE FROM credentials WHERE name = ?", params![name])?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_memory_roundtrip_and_remove() {
    let store = MemoryCredentials::new();
    assert_eq!(store.get(ACCESS_TOKEN), None);
    store.set(ACCESS_TOKEN, "abc", Some(3)).unwrap();
    assert_eq!(store.get(ACCESS_TOKEN).as_deref(), Some("abc"));
    store.remove(ACCESS_TOKEN).unwrap();
    assert_eq!(store.get(ACCESS_TOKEN), None);
  }

  #[test]
  fn test_memory_zero_day_expiry_is_absent() {
    let store = MemoryCredentials::new();
    store.set(REFRESH_TOKEN, "r", Some(0)).unwrap();
    assert_eq!(store.get(REFRESH_TOKEN), None);
  }

  #[test]
  fn test_sqlite_persists_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("credentials.db");

    {
      let store = SqliteCredentials::open(&path).unwrap();
      store.set(ACCESS_TOKEN, "token-1", Some(3)).unwrap();
      store.set(REFRESH_TOKEN, "refresh-1", None).unwrap();
    }

    let store = SqliteCredentials::open(&path).unwrap();
    assert_eq!(store.get(ACCESS_TOKEN).as_deref(), Some("token-1"));
    assert_eq!(store.get(REFRESH_TOKEN).as_deref(), Some("refresh-1"));

    store.remove(ACCESS_TOKEN).unwrap();
    assert_eq!(store.get(ACCESS_TOKEN), None);
  }

  #[test]
  fn test_sqlite_expired_rows_are_purged() {
    let store = SqliteCredentials::in_memory().unwrap();
    store.set(ACCESS_TOKEN, "old", Some(0)).unwrap();
    assert_eq!(store.get(ACCESS_TOKEN), None);
    store.set(ACCESS_TOKEN, "new", Some(1)).unwrap();
    assert_eq!(store.get(ACCESS_TOKEN).as_deref(), Some("new"));
  }

  #[test]
  fn test_fingerprint_is_stable_and_short() {
    assert_eq!(fingerprint("secret"), fingerprint("secret"));
    assert_ne!(fingerprint("secret"), fingerprint("other"));
    assert_eq!(fingerprint("secret").len(), 12);
  }
}
