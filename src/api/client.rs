use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::error::{SyncError, SyncResult};
use crate::transport::{execute, ApiRequest, Transport};

use super::types::{
  AddNotificationParameter, AddUserRequest, BackendParameter, BackendParameterType,
  CloseIncidentRequest, CreateIncidentNote, DateDiff, Incident, IncidentNote, LoginRequest,
  LoginResponse, NotificationParameter, NotificationParameterType, RecordData,
  SetBackendParameter, SummaryStatistics, UpdateIncidentRequest, UpdateUserRequest, UserInfo,
};

/// Months covered by the monthly averages chart.
const MONTH_WINDOW: u32 = 12;

/// Dashboard backend endpoints, uncached.
#[derive(Clone)]
pub struct DashboardApi {
  transport: Arc<dyn Transport>,
}

impl DashboardApi {
  pub fn new(transport: Arc<dyn Transport>) -> Self {
    Self { transport }
  }

  async fn fetch<T: DeserializeOwned>(&self, request: ApiRequest) -> SyncResult<Option<T>> {
    Ok(execute(&*self.transport, request).await?.data)
  }

  /// A missing payload on a list endpoint means an empty list.
  async fn fetch_list<T: DeserializeOwned>(&self, request: ApiRequest) -> SyncResult<Vec<T>> {
    Ok(self.fetch(request).await?.unwrap_or_default())
  }

  async fn fetch_one<T: DeserializeOwned>(
    &self,
    request: ApiRequest,
    what: &'static str,
  ) -> SyncResult<T> {
    self.fetch(request).await?.ok_or(SyncError::Missing(what))
  }

  async fn send(&self, request: ApiRequest) -> SyncResult<()> {
    self.transport.call(request).await.map(|_| ())
  }

  // ==========================================================================
  // Session
  // ==========================================================================

  pub async fn login(&self, request: &LoginRequest) -> SyncResult<LoginResponse> {
    self
      .fetch_one(ApiRequest::post("/auth/login/").body(request)?, "login response")
      .await
  }

  /// `None` when the backend knows no user for the current token.
  pub async fn get_current_user(&self) -> SyncResult<Option<UserInfo>> {
    self
      .fetch(ApiRequest::get("/auth/current-user/current_user/"))
      .await
  }

  // ==========================================================================
  // Incidents
  // ==========================================================================

  pub async fn get_incidents(&self) -> SyncResult<Vec<Incident>> {
    self.fetch_list(ApiRequest::get("/auth/incidents")).await
  }

  pub async fn get_incident_notes(&self, incident: Option<i64>) -> SyncResult<Vec<IncidentNote>> {
    let incident = incident.ok_or(SyncError::Missing("incident id"))?;
    self
      .fetch_list(ApiRequest::get("/api/get-incidents-by-id").query("incident_id", incident))
      .await
  }

  pub async fn create_note(&self, note: &CreateIncidentNote) -> SyncResult<Option<IncidentNote>> {
    self
      .fetch(ApiRequest::post("/auth/incident-notes/").body(note)?)
      .await
  }

  pub async fn close_incident(&self, incident_id: i64) -> SyncResult<()> {
    self
      .send(ApiRequest::post("/api/incident/close").body(&CloseIncidentRequest { incident_id })?)
      .await
  }

  pub async fn update_incident(
    &self,
    incident_id: i64,
    update: &UpdateIncidentRequest,
  ) -> SyncResult<Option<Incident>> {
    self
      .fetch(ApiRequest::patch(format!("/auth/incidents/{}/", incident_id)).body(update)?)
      .await
  }

  pub async fn delete_incident(&self, incident_id: i64) -> SyncResult<()> {
    self
      .send(ApiRequest::delete(format!("/auth/incidents/{}/", incident_id)))
      .await
  }

  // ==========================================================================
  // Users
  // ==========================================================================

  pub async fn get_users(&self) -> SyncResult<Vec<UserInfo>> {
    self.fetch_list(ApiRequest::get("/auth/users")).await
  }

  pub async fn register_user(&self, user: &AddUserRequest) -> SyncResult<Option<UserInfo>> {
    self
      .fetch(ApiRequest::post("/auth/register/").body(user)?)
      .await
  }

  pub async fn update_user(
    &self,
    user_id: &str,
    update: &UpdateUserRequest,
  ) -> SyncResult<Option<UserInfo>> {
    self
      .fetch(ApiRequest::patch(format!("/auth/users/{}/", user_id)).body(update)?)
      .await
  }

  pub async fn delete_user(&self, user_id: &str) -> SyncResult<()> {
    self
      .send(ApiRequest::delete(format!("/auth/users/{}/", user_id)))
      .await
  }

  // ==========================================================================
  // Parameters
  // ==========================================================================

  pub async fn get_backend_parameters(&self) -> SyncResult<Vec<BackendParameter>> {
    self.fetch_list(ApiRequest::get("/parameters")).await
  }

  pub async fn set_backend_parameter(
    &self,
    kind: BackendParameterType,
    value: f64,
  ) -> SyncResult<Option<BackendParameter>> {
    self
      .fetch(
        ApiRequest::put(format!("/parameters/{}/", kind.as_str()))
          .body(&SetBackendParameter { value })?,
      )
      .await
  }

  pub async fn get_notification_parameters(
    &self,
    kind: NotificationParameterType,
  ) -> SyncResult<Vec<NotificationParameter>> {
    self
      .fetch_list(ApiRequest::get("/notifications/").query("type", kind.as_str()))
      .await
  }

  pub async fn add_notification_parameter(
    &self,
    parameter: &AddNotificationParameter,
  ) -> SyncResult<Option<NotificationParameter>> {
    self
      .fetch(ApiRequest::post("/notifications/add/").body(parameter)?)
      .await
  }

  pub async fn delete_notification_parameter(&self, parameter_id: i64) -> SyncResult<()> {
    self
      .send(ApiRequest::delete(format!("/notifications/delete/{}/", parameter_id)))
      .await
  }

  // ==========================================================================
  // Sensor readings
  // ==========================================================================

  pub async fn get_month_averages(&self) -> SyncResult<Vec<RecordData>> {
    self
      .fetch_list(ApiRequest::get("/api/dht/avg/months").query("n", MONTH_WINDOW))
      .await
  }

  /// Daily averages of the last `days` days, oldest first.
  pub async fn get_latest_records(&self, days: u32) -> SyncResult<Vec<RecordData>> {
    let mut records: Vec<RecordData> = self
      .fetch_list(ApiRequest::get("/api/dht/avg/days").query("n", days))
      .await?;
    records.reverse();
    Ok(records)
  }

  /// Daily averages between two `YYYY-MM-DD` dates, oldest first.
  pub async fn get_range_records(&self, from: &str, to: &str) -> SyncResult<Vec<RecordData>> {
    let mut records: Vec<RecordData> = self
      .fetch_list(
        ApiRequest::get("/api/dht/avg/range")
          .query("from", from)
          .query("to", to),
      )
      .await?;
    records.reverse();
    Ok(records)
  }

  pub async fn get_summary_statistics(&self) -> SyncResult<SummaryStatistics> {
    self
      .fetch_one(
        ApiRequest::get("/DHT/api/statistics").query("format", "json"),
        "summary statistics",
      )
      .await
  }

  pub async fn get_date_diff(&self, from: &str, to: &str) -> SyncResult<DateDiff> {
    self
      .fetch_one(
        ApiRequest::get("/api/dht/diff").query("from", from).query("to", to),
        "date comparison",
      )
      .await
  }
}

impl std::fmt::Debug for DashboardApi {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DashboardApi").finish_non_exhaustive()
  }
}
