//! Synchronized dashboard: every backend read as a [`Query`] and every write
//! as a [`Mutation`], with the keys, freshness windows and reconciliation
//! rules each screen relies on.

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::debug;

use crate::cache::{QueryKey, Scalar, Transaction};
use crate::error::{SyncError, SyncResult};
use crate::mutation::Mutation;
use crate::query::{self, Fetcher, Query, QueryClient};
use crate::session::Session;
use crate::transport::{CredentialStore, Transport};

use super::client::DashboardApi;
use super::keys::{self, Freshness};
use super::types::{
  AddNotificationParameter, AddUserRequest, BackendParameter, BackendParameterType,
  CreateIncidentNote, DateDiff, Incident, IncidentNote, NoteAuthor, NotificationParameter,
  NotificationParameterType, RecordData, SummaryStatistics, UpdateIncidentRequest,
  UpdateUserRequest, UserInfo,
};

/// Behaviour switches for the dashboard.
#[derive(Debug, Clone, Default)]
pub struct DashboardSettings {
  pub freshness: Freshness,
  /// Accept new notes on incidents that are already resolved
  pub allow_notes_on_closed: bool,
}

/// Input of the send-note mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNote {
  pub incident: i64,
  pub message: String,
}

#[derive(Clone)]
pub struct Dashboard {
  client: QueryClient,
  api: DashboardApi,
  session: Session,
  settings: DashboardSettings,
  /// Source of provisional note ids: -1, -2, ...
  temp_ids: Arc<AtomicI64>,
}

impl Dashboard {
  pub fn new(
    client: &QueryClient,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    settings: DashboardSettings,
  ) -> Self {
    let api = DashboardApi::new(transport);
    let session = Session::new(client, api.clone(), credentials, settings.freshness.clone());
    Self {
      client: client.clone(),
      api,
      session,
      settings,
      temp_ids: Arc::new(AtomicI64::new(0)),
    }
  }

  pub fn client(&self) -> &QueryClient {
    &self.client
  }

  pub fn api(&self) -> &DashboardApi {
    &self.api
  }

  pub fn session(&self) -> &Session {
    &self.session
  }

  fn next_temp_id(&self) -> i64 {
    self.temp_ids.fetch_sub(1, Ordering::SeqCst) - 1
  }

  // ==========================================================================
  // Plumbing
  // ==========================================================================

  /// Wrap an API call as a fetcher. A rejected token ends the session.
  fn fetcher<T, F, Fut>(&self, f: F) -> Fetcher<T>
  where
    T: Send + 'static,
    F: Fn(DashboardApi, QueryKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<T>> + Send + 'static,
  {
    let api = self.api.clone();
    let session = self.session.clone();
    query::fetcher(move |key| guarded(session.clone(), f(api.clone(), key)))
  }

  fn mutation<I, O, F, Fut>(&self, name: &'static str, f: F) -> Mutation<I, O>
  where
    I: Clone + Send + Sync + 'static,
    O: Send + Sync + 'static,
    F: Fn(DashboardApi, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<O>> + Send + 'static,
  {
    let api = self.api.clone();
    let session = self.session.clone();
    Mutation::new(&self.client, name, move |input| {
      guarded(session.clone(), f(api.clone(), input))
    })
  }

  fn query<T>(&self, key: QueryKey, fetcher: Fetcher<T>) -> Query<T>
  where
    T: serde::Serialize + serde::de::DeserializeOwned + Send + 'static,
  {
    let options = self.settings.freshness.options(&key);
    Query::new(&self.client, key, options, fetcher)
  }

  // ==========================================================================
  // Fetchers (parameters come from the key so `Query::set_key` just works)
  // ==========================================================================

  fn incidents_fetcher(&self) -> Fetcher<Vec<Incident>> {
    self.fetcher(|api, _key| async move { api.get_incidents().await })
  }

  fn notes_fetcher(&self) -> Fetcher<Vec<IncidentNote>> {
    self.fetcher(|api, key| async move {
      let incident = key.param(0).and_then(Scalar::as_int);
      api.get_incident_notes(incident).await
    })
  }

  fn users_fetcher(&self) -> Fetcher<Vec<UserInfo>> {
    self.fetcher(|api, _key| async move { api.get_users().await })
  }

  fn backend_parameters_fetcher(&self) -> Fetcher<Vec<BackendParameter>> {
    self.fetcher(|api, _key| async move { api.get_backend_parameters().await })
  }

  fn notification_parameters_fetcher(&self) -> Fetcher<Vec<NotificationParameter>> {
    self.fetcher(|api, key| async move {
      let kind: NotificationParameterType = key
        .param(0)
        .and_then(Scalar::as_str)
        .ok_or(SyncError::Missing("notification type"))?
        .parse()?;
      api.get_notification_parameters(kind).await
    })
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  pub fn incidents(&self) -> Query<Vec<Incident>> {
    self.query(keys::incidents(), self.incidents_fetcher())
  }

  /// Notes of the selected incident; disabled while none is selected.
  pub fn incident_notes(&self, incident: Option<i64>) -> Query<Vec<IncidentNote>> {
    self
      .query(keys::incident_notes(incident), self.notes_fetcher())
      .enabled(incident.is_some())
  }

  pub fn users(&self) -> Query<Vec<UserInfo>> {
    self.query(keys::users(), self.users_fetcher())
  }

  pub fn backend_parameters(&self) -> Query<Vec<BackendParameter>> {
    self.query(keys::backend_parameters(), self.backend_parameters_fetcher())
  }

  pub fn notification_parameters(
    &self,
    kind: NotificationParameterType,
  ) -> Query<Vec<NotificationParameter>> {
    self.query(
      keys::notification_parameters(kind),
      self.notification_parameters_fetcher(),
    )
  }

  pub fn month_averages(&self) -> Query<Vec<RecordData>> {
    let fetcher = self.fetcher(|api, _key| async move { api.get_month_averages().await });
    self.query(keys::month_averages(), fetcher)
  }

  pub fn latest_records(&self, days: u32) -> Query<Vec<RecordData>> {
    let fetcher = self.fetcher(|api, key| async move {
      let days = key
        .param(0)
        .and_then(Scalar::as_int)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or(SyncError::Missing("number of days"))?;
      api.get_latest_records(days).await
    });
    self.query(keys::latest_records(days), fetcher)
  }

  /// Daily averages in `[from, to]`; disabled unless both dates are valid
  /// and ordered.
  pub fn range_records(&self, from: &str, to: &str) -> Query<Vec<RecordData>> {
    let fetcher = self.fetcher(|api, key| async move {
      let (from, to) = date_params(&key)?;
      api.get_range_records(&from, &to).await
    });
    self
      .query(keys::range_records(from, to), fetcher)
      .enabled(date_window(from, to).is_some_and(|(f, t)| f <= t))
  }

  pub fn summary_statistics(&self) -> Query<SummaryStatistics> {
    let fetcher = self.fetcher(|api, _key| async move { api.get_summary_statistics().await });
    self.query(keys::summary_statistics(), fetcher)
  }

  /// Difference between two days; disabled unless `to` is after `from`.
  pub fn date_diff(&self, from: &str, to: &str) -> Query<DateDiff> {
    let fetcher = self.fetcher(|api, key| async move {
      let (from, to) = date_params(&key)?;
      api.get_date_diff(&from, &to).await
    });
    self
      .query(keys::date_diff(from, to), fetcher)
      .enabled(date_window(from, to).is_some_and(|(f, t)| f < t))
  }

  // ==========================================================================
  // Writes
  // ==========================================================================

  /// Post a note with an optimistic preview.
  ///
  /// The provisional note (negative id, current session user, current time)
  /// is prepended to the incident's notes before the request is sent. It is
  /// rolled back on failure; on success the notes are refetched, and on
  /// settlement they are invalidated either way.
  pub fn send_note(&self) -> Mutation<NewNote, Option<IncidentNote>> {
    let session = self.session.clone();
    let this = self.clone();

    self
      .mutation("send-note", move |api, input: NewNote| {
        let user = session.user();
        async move {
          let user = user.ok_or(SyncError::Missing("signed-in user"))?;
          let note = CreateIncidentNote {
            note: input.message,
            incident: input.incident,
            user_id: user.id,
          };
          api.create_note(&note).await
        }
      })
      .on_mutate(move |client, input| this.project_note(client, input))
      .refetches(|input| keys::incident_notes(Some(input.incident)), self.notes_fetcher())
      .invalidates(|input| keys::incident_notes(Some(input.incident)))
  }

  fn project_note(&self, client: &QueryClient, input: &NewNote) -> SyncResult<Option<Transaction>> {
    if !self.settings.allow_notes_on_closed && self.is_closed(input.incident)? {
      return Err(SyncError::Rejected(format!(
        "incident {} is closed and no longer accepts notes",
        input.incident
      )));
    }
    let user = self
      .session
      .user()
      .ok_or(SyncError::Missing("signed-in user"))?;

    let now = Utc::now().to_rfc3339();
    let provisional = IncidentNote {
      id: self.next_temp_id(),
      note: input.message.clone(),
      created_at: now.clone(),
      updated_at: now,
      user_id: NoteAuthor::User(user),
      incident: input.incident,
    };
    debug!(incident = input.incident, id = provisional.id, "projecting provisional note");

    let mut transaction = client.transaction(keys::incident_notes(Some(input.incident)));
    transaction.apply::<Vec<IncidentNote>, _>(move |old| {
      let mut notes = old.unwrap_or_default();
      notes.insert(0, provisional);
      notes
    })?;
    Ok(Some(transaction))
  }

  /// Whether the cached incident list shows `incident` as resolved.
  fn is_closed(&self, incident: i64) -> SyncResult<bool> {
    let incidents: Option<Vec<Incident>> = self.client.get_query_data(&keys::incidents())?;
    Ok(
      incidents
        .unwrap_or_default()
        .iter()
        .any(|i| i.id == incident && i.resolved),
    )
  }

  /// Close an incident. There is no optimistic path: the list shows the
  /// incident as resolved only once the refetch lands.
  pub fn close_incident(&self) -> Mutation<i64, ()> {
    self
      .mutation("close-incident", |api, id: i64| async move {
        api.close_incident(id).await
      })
      .refetches(|_| keys::incidents(), self.incidents_fetcher())
  }

  /// Delete an incident, dropping it from the cached list and forgetting
  /// its notes. Deleting an id that is already gone leaves the list as is.
  pub fn delete_incident(&self) -> Mutation<i64, ()> {
    self
      .mutation("delete-incident", |api, id: i64| async move {
        api.delete_incident(id).await
      })
      .on_success(|client, id, _| {
        if let Err(e) = client
          .cache()
          .remove_from_list::<Incident>(&keys::incidents(), &Scalar::Int(*id))
        {
          debug!(error = %e, "incident list not adjusted");
        }
        client.remove(&keys::incident_notes(Some(*id)));
      })
      .invalidates(|_| keys::incidents())
  }

  pub fn update_incident(&self) -> Mutation<(i64, UpdateIncidentRequest), Option<Incident>> {
    self
      .mutation("update-incident", |api, (id, update): (i64, UpdateIncidentRequest)| async move {
        api.update_incident(id, &update).await
      })
      .invalidates(|_| keys::incidents())
  }

  pub fn add_notification(&self) -> Mutation<AddNotificationParameter, Option<NotificationParameter>> {
    self
      .mutation("add-notification", |api, parameter: AddNotificationParameter| async move {
        api.add_notification_parameter(&parameter).await
      })
      .refetches(
        |parameter| keys::notification_parameters(parameter.kind),
        self.notification_parameters_fetcher(),
      )
  }

  pub fn delete_notification(&self) -> Mutation<(NotificationParameterType, i64), ()> {
    self
      .mutation(
        "delete-notification",
        |api, (_, id): (NotificationParameterType, i64)| async move {
          api.delete_notification_parameter(id).await
        },
      )
      .refetches(
        |(kind, _)| keys::notification_parameters(*kind),
        self.notification_parameters_fetcher(),
      )
  }

  pub fn set_backend_parameter(
    &self,
  ) -> Mutation<(BackendParameterType, f64), Option<BackendParameter>> {
    self
      .mutation(
        "set-backend-parameter",
        |api, (kind, value): (BackendParameterType, f64)| async move {
          api.set_backend_parameter(kind, value).await
        },
      )
      .refetches(|_| keys::backend_parameters(), self.backend_parameters_fetcher())
  }

  pub fn create_user(&self) -> Mutation<AddUserRequest, Option<UserInfo>> {
    self
      .mutation("create-user", |api, user: AddUserRequest| async move {
        api.register_user(&user).await
      })
      .on_success(|client, _, _| {
        client.invalidate(&keys::users());
      })
  }

  pub fn update_user(&self) -> Mutation<(String, UpdateUserRequest), Option<UserInfo>> {
    self
      .mutation("update-user", |api, (id, update): (String, UpdateUserRequest)| async move {
        api.update_user(&id, &update).await
      })
      .on_success(|client, _, _| {
        client.invalidate(&keys::users());
      })
  }

  pub fn delete_user(&self) -> Mutation<String, ()> {
    self
      .mutation("delete-user", |api, id: String| async move {
        api.delete_user(&id).await
      })
      .on_success(|client, _, _| {
        client.invalidate(&keys::users());
      })
  }
}

impl std::fmt::Debug for Dashboard {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Dashboard")
      .field("settings", &self.settings)
      .field("session", &self.session)
      .finish_non_exhaustive()
  }
}

/// Await `fut`, ending the session if the backend rejected the token.
async fn guarded<T>(session: Session, fut: impl Future<Output = SyncResult<T>>) -> SyncResult<T> {
  let result = fut.await;
  if let Err(e) = &result {
    session.observe_error(e);
  }
  result
}

fn parse_day(s: &str) -> Option<NaiveDate> {
  NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

fn date_window(from: &str, to: &str) -> Option<(NaiveDate, NaiveDate)> {
  Some((parse_day(from)?, parse_day(to)?))
}

fn date_params(key: &QueryKey) -> SyncResult<(String, String)> {
  let param = |i| {
    key
      .param(i)
      .and_then(Scalar::as_str)
      .filter(|s| !s.is_empty())
      .map(str::to_string)
      .ok_or(SyncError::Missing("start and end dates"))
  };
  Ok((param(0)?, param(1)?))
}
