/// Command-line surface and the handlers that drive the dashboard
use clap::{Args, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

use sensordash::api::keys;
use sensordash::api::{
  AddNotificationParameter, BackendParameterType, Dashboard, Incident, IncidentNote, NewNote,
  NotificationParameterType, RecordData, UserInfo,
};
use sensordash::cache::{CacheEvent, CacheEventKind};
use sensordash::{Query, RouteDecision, RouteGuard};

use crate::config::Config;

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Sign in and remember the session
  Login {
    #[arg(short, long)]
    email: String,
    /// Password (defaults to $SENSORDASH_PASSWORD)
    #[arg(short, long)]
    password: Option<String>,
  },
  /// Forget the stored session
  Logout,
  /// Show the signed-in user
  Whoami,
  /// Browse and manage incidents
  #[command(visible_alias = "i")]
  Incidents {
    #[command(subcommand)]
    action: IncidentsCommand,
  },
  /// Read and write incident notes
  #[command(visible_alias = "n")]
  Notes {
    #[command(subcommand)]
    action: NotesCommand,
  },
  /// Backend alert thresholds
  #[command(visible_alias = "p")]
  Params {
    #[command(subcommand)]
    action: ParamsCommand,
  },
  /// Notification targets per channel
  Notifications {
    #[command(subcommand)]
    action: NotificationsCommand,
  },
  /// Dashboard accounts
  #[command(visible_alias = "u")]
  Users {
    #[command(subcommand)]
    action: UsersCommand,
  },
  /// Temperature and humidity readings
  #[command(visible_alias = "r")]
  Readings {
    #[command(subcommand)]
    action: ReadingsCommand,
  },
  /// Poll the incident list and print what changes
  Watch(WatchArgs),
}

#[derive(Subcommand, Debug)]
pub enum IncidentsCommand {
  List,
  Close { id: i64 },
  Delete { id: i64 },
}

#[derive(Subcommand, Debug)]
pub enum NotesCommand {
  List { incident: i64 },
  Send { incident: i64, message: String },
}

#[derive(Subcommand, Debug)]
pub enum ParamsCommand {
  List,
  /// Set a threshold, e.g. `params set TEMP_MAX 28.5`
  Set { kind: BackendParameterType, value: f64 },
}

#[derive(Subcommand, Debug)]
pub enum NotificationsCommand {
  List { kind: NotificationParameterType },
  Add { kind: NotificationParameterType, resource: String },
  Remove { kind: NotificationParameterType, id: i64 },
}

#[derive(Subcommand, Debug)]
pub enum UsersCommand {
  List,
  Delete { id: String },
}

#[derive(Subcommand, Debug)]
pub enum ReadingsCommand {
  /// Current values, period averages and extremes
  Summary,
  /// Averages of the last twelve months
  Months,
  /// Daily averages of the last N days
  Days { n: u32 },
  /// Daily averages between two dates (YYYY-MM-DD)
  Range { from: String, to: String },
  /// Change between two dates (YYYY-MM-DD)
  Diff { from: String, to: String },
}

#[derive(Args, Debug)]
pub struct WatchArgs {
  /// Seconds between polls
  #[arg(short, long, default_value_t = 30)]
  pub interval: u64,
}

pub async fn run(command: Command, dashboard: &Dashboard) -> Result<()> {
  match command {
    Command::Login { email, password } => login(dashboard, &email, password).await,
    Command::Logout => {
      dashboard.session().logout()?;
      println!("Signed out.");
      Ok(())
    }
    Command::Whoami => {
      let user = require_user(dashboard).await?;
      print_user(&user);
      Ok(())
    }
    Command::Incidents { action } => {
      require_user(dashboard).await?;
      incidents(dashboard, action).await
    }
    Command::Notes { action } => {
      require_user(dashboard).await?;
      notes(dashboard, action).await
    }
    Command::Params { action } => {
      require_user(dashboard).await?;
      params(dashboard, action).await
    }
    Command::Notifications { action } => {
      require_user(dashboard).await?;
      notifications(dashboard, action).await
    }
    Command::Users { action } => {
      require_user(dashboard).await?;
      users(dashboard, action).await
    }
    Command::Readings { action } => {
      require_user(dashboard).await?;
      readings(dashboard, action).await
    }
    Command::Watch(args) => {
      require_user(dashboard).await?;
      watch(dashboard, args).await
    }
  }
}

async fn login(dashboard: &Dashboard, email: &str, password: Option<String>) -> Result<()> {
  let state = dashboard.session().resolve().await;
  if let RouteDecision::Redirect(_) = RouteGuard::PublicOnly.decide(&state) {
    if let Some(user) = state.user() {
      println!("Already signed in as {}.", user.email);
      return Ok(());
    }
  }

  let password = match password {
    Some(p) => p,
    None => Config::get_password()?,
  };
  let user = dashboard.session().login(email, &password).await?;
  println!("Signed in as {} ({}).", user.username, user.email);
  Ok(())
}

/// Resolve the stored session; protected commands need a signed-in user.
async fn require_user(dashboard: &Dashboard) -> Result<UserInfo> {
  let state = dashboard.session().resolve().await;
  match RouteGuard::Protected.decide(&state) {
    RouteDecision::Render => state
      .user()
      .cloned()
      .ok_or_else(|| eyre!("Session resolved without a user")),
    RouteDecision::Redirect(_) | RouteDecision::Loading => {
      Err(eyre!("Not signed in. Run `sensordash login --email <EMAIL>` first."))
    }
  }
}

/// Run a query to completion and return its data.
async fn load<T>(query: Query<T>) -> Result<T>
where
  T: Serialize + DeserializeOwned + Send + 'static,
{
  if !query.options().enabled {
    return Err(eyre!("Query {} is not runnable with these arguments", query.key()));
  }
  query.result();
  let result = query.wait().await;
  if let Some(error) = result.error {
    return Err(error.into());
  }
  result
    .data
    .ok_or_else(|| eyre!("No data returned for {}", query.key()))
}

async fn incidents(dashboard: &Dashboard, action: IncidentsCommand) -> Result<()> {
  match action {
    IncidentsCommand::List => {
      let incidents = load(dashboard.incidents()).await?;
      if incidents.is_empty() {
        println!("No incidents.");
      }
      for incident in &incidents {
        print_incident(incident);
      }
    }
    IncidentsCommand::Close { id } => {
      dashboard.close_incident().mutate(id).settled().await?;
      println!("Incident #{} closed.", id);
    }
    IncidentsCommand::Delete { id } => {
      dashboard.delete_incident().mutate(id).settled().await?;
      println!("Incident #{} deleted.", id);
    }
  }
  Ok(())
}

async fn notes(dashboard: &Dashboard, action: NotesCommand) -> Result<()> {
  match action {
    NotesCommand::List { incident } => {
      let notes = load(dashboard.incident_notes(Some(incident))).await?;
      if notes.is_empty() {
        println!("No notes on incident #{}.", incident);
      }
      for note in &notes {
        print_note(note);
      }
    }
    NotesCommand::Send { incident, message } => {
      // The closed-incident check reads the cached list.
      load(dashboard.incidents()).await?;
      dashboard
        .send_note()
        .mutate(NewNote { incident, message })
        .settled()
        .await?;

      let notes: Option<Vec<IncidentNote>> = dashboard
        .client()
        .get_query_data(&keys::incident_notes(Some(incident)))?;
      println!(
        "Note added; incident #{} has {} note(s).",
        incident,
        notes.map(|n| n.len()).unwrap_or_default()
      );
    }
  }
  Ok(())
}

async fn params(dashboard: &Dashboard, action: ParamsCommand) -> Result<()> {
  match action {
    ParamsCommand::List => {
      for parameter in load(dashboard.backend_parameters()).await? {
        println!("{:<20} {}", parameter.kind, parameter.value);
      }
    }
    ParamsCommand::Set { kind, value } => {
      dashboard
        .set_backend_parameter()
        .mutate((kind, value))
        .settled()
        .await?;
      println!("{} set to {}.", kind, value);
    }
  }
  Ok(())
}

async fn notifications(dashboard: &Dashboard, action: NotificationsCommand) -> Result<()> {
  match action {
    NotificationsCommand::List { kind } => {
      let parameters = load(dashboard.notification_parameters(kind)).await?;
      if parameters.is_empty() {
        println!("No {} targets.", kind);
      }
      for parameter in parameters {
        println!("{:>5}  {}  (added {})", parameter.id, parameter.main_resource, parameter.created_at);
      }
    }
    NotificationsCommand::Add { kind, resource } => {
      dashboard
        .add_notification()
        .mutate(AddNotificationParameter {
          main_resource: resource.clone(),
          kind,
        })
        .settled()
        .await?;
      println!("{} target {} added.", kind, resource);
    }
    NotificationsCommand::Remove { kind, id } => {
      dashboard
        .delete_notification()
        .mutate((kind, id))
        .settled()
        .await?;
      println!("{} target #{} removed.", kind, id);
    }
  }
  Ok(())
}

async fn users(dashboard: &Dashboard, action: UsersCommand) -> Result<()> {
  match action {
    UsersCommand::List => {
      for user in load(dashboard.users()).await? {
        print_user(&user);
      }
    }
    UsersCommand::Delete { id } => {
      dashboard.delete_user().mutate(id.clone()).settled().await?;
      println!("User {} deleted.", id);
    }
  }
  Ok(())
}

async fn readings(dashboard: &Dashboard, action: ReadingsCommand) -> Result<()> {
  match action {
    ReadingsCommand::Summary => {
      let stats = load(dashboard.summary_statistics()).await?;
      println!("current  {}", format_record(&stats.curr.record));
      println!("daily    {}", format_record(&stats.avg.daily.record));
      println!("weekly   {}", format_record(&stats.avg.weekly.record));
      println!("monthly  {}", format_record(&stats.avg.monthly.record));
      println!(
        "highest  temp {}  hum {}",
        format_value(stats.extremes.highest.temp),
        format_value(stats.extremes.highest.hum)
      );
      println!(
        "lowest   temp {}  hum {}",
        format_value(stats.extremes.lowest.temp),
        format_value(stats.extremes.lowest.hum)
      );
    }
    ReadingsCommand::Months => print_records(&load(dashboard.month_averages()).await?),
    ReadingsCommand::Days { n } => print_records(&load(dashboard.latest_records(n)).await?),
    ReadingsCommand::Range { from, to } => {
      let query = dashboard.range_records(&from, &to);
      if !query.options().enabled {
        return Err(eyre!("Expected two dates as YYYY-MM-DD with FROM not after TO"));
      }
      print_records(&load(query).await?);
    }
    ReadingsCommand::Diff { from, to } => {
      let query = dashboard.date_diff(&from, &to);
      if !query.options().enabled {
        return Err(eyre!("Expected two dates as YYYY-MM-DD with FROM before TO"));
      }
      let diff = load(query).await?;
      println!(
        "{} -> {}: temp {:+.1}  hum {:+.1}",
        diff.from_date, diff.to_date, diff.temp_diff, diff.hum_diff
      );
    }
  }
  Ok(())
}

/// What `watch` remembers about an incident between polls.
type Seen = BTreeMap<i64, bool>;

/// Describe the difference between two snapshots of the incident list.
fn incident_changes(previous: &Seen, current: &[Incident]) -> Vec<String> {
  let mut changes = Vec::new();
  for incident in current {
    match previous.get(&incident.id) {
      None => changes.push(format!("new      {}", incident_line(incident))),
      Some(false) if incident.resolved => changes.push(format!("resolved {}", incident_line(incident))),
      Some(true) if !incident.resolved => changes.push(format!("reopened {}", incident_line(incident))),
      Some(_) => {}
    }
  }
  for id in previous.keys() {
    if !current.iter().any(|i| i.id == *id) {
      changes.push(format!("removed  #{}", id));
    }
  }
  changes
}

async fn watch(dashboard: &Dashboard, args: WatchArgs) -> Result<()> {
  let query = dashboard.incidents();
  let seen: Mutex<Option<Seen>> = Mutex::new(None);

  let _subscription = query.subscribe(move |event: &CacheEvent| {
    if event.kind != CacheEventKind::Updated {
      if event.kind == CacheEventKind::Failed {
        if let Some(error) = event.entry.as_ref().and_then(|e| e.error.as_ref()) {
          println!("refresh failed: {}", error);
        }
      }
      return;
    }
    let Some(Ok(Some(current))) = event.entry.as_ref().map(|e| e.data::<Vec<Incident>>()) else {
      return;
    };

    let mut seen = seen.lock().unwrap_or_else(PoisonError::into_inner);
    match seen.as_ref() {
      None => {
        println!("{} incident(s), {} open", current.len(), current.iter().filter(|i| !i.resolved).count());
      }
      Some(previous) => {
        for line in incident_changes(previous, &current) {
          println!("{}", line);
        }
      }
    }
    *seen = Some(current.iter().map(|i| (i.id, i.resolved)).collect());
  });

  info!(interval = args.interval, "watching incidents");
  let mut ticker = tokio::time::interval(Duration::from_secs(args.interval.max(1)));
  loop {
    tokio::select! {
      _ = ticker.tick() => {
        if let Err(e) = query.refetch().await {
          warn!(error = %e, "incident poll failed");
          if e.is_auth_expired() {
            return Err(eyre!("Session expired. Run `sensordash login` again."));
          }
        }
      }
      _ = tokio::signal::ctrl_c() => {
        println!();
        return Ok(());
      }
    }
  }
}

fn incident_line(incident: &Incident) -> String {
  format!(
    "#{:<5} {:<8} {:<32} {:>6.1}°C {:>5.1}%  {}",
    incident.id,
    if incident.resolved { "closed" } else { "open" },
    incident.title,
    incident.temperature,
    incident.humidity,
    incident.reported_at
  )
}

fn print_incident(incident: &Incident) {
  println!("{}", incident_line(incident));
  if let Some(user) = &incident.closed_by {
    println!("       closed by {}", user.username);
  }
}

fn print_note(note: &IncidentNote) {
  println!("[{}] {}: {}", note.created_at, note.user_id.display_name(), note.note);
}

fn print_user(user: &UserInfo) {
  println!(
    "{}  {} <{}>{}{}",
    user.id,
    user.username,
    user.email,
    if user.is_staff { "  staff" } else { "" },
    if user.is_active { "" } else { "  inactive" }
  );
}

fn format_value(value: Option<f64>) -> String {
  value.map(|v| format!("{:.1}", v)).unwrap_or_else(|| "-".into())
}

fn format_record(record: &RecordData) -> String {
  format!(
    "temp {:>6}  hum {:>6}  {}",
    format_value(record.temp),
    format_value(record.hum),
    record.dt.as_deref().unwrap_or("")
  )
}

fn print_records(records: &[RecordData]) {
  if records.is_empty() {
    println!("No readings.");
  }
  for record in records {
    println!("{}", format_record(record));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use clap::Parser;

  #[derive(Parser, Debug)]
  struct Cli {
    #[command(subcommand)]
    command: Command,
  }

  fn incident(id: i64, resolved: bool) -> Incident {
    Incident {
      id,
      title: format!("Incident {}", id),
      description: None,
      temperature: 30.0,
      humidity: 40.0,
      reported_at: "2024-05-01T10:00:00Z".into(),
      resolved,
      closed_by: None,
      updated_at: "2024-05-01T10:00:00Z".into(),
    }
  }

  #[test]
  fn test_parses_nested_commands() {
    let cli = Cli::try_parse_from(["sensordash", "notes", "send", "7", "fan replaced"]).unwrap();
    match cli.command {
      Command::Notes {
        action: NotesCommand::Send { incident, message },
      } => {
        assert_eq!(incident, 7);
        assert_eq!(message, "fan replaced");
      }
      other => panic!("unexpected command: {:?}", other),
    }

    let cli = Cli::try_parse_from(["sensordash", "p", "set", "temp_max", "28.5"]).unwrap();
    assert!(matches!(
      cli.command,
      Command::Params {
        action: ParamsCommand::Set {
          kind: BackendParameterType::TempMax,
          ..
        }
      }
    ));
  }

  #[test]
  fn test_rejects_unknown_channel() {
    assert!(Cli::try_parse_from(["sensordash", "notifications", "list", "PIGEON"]).is_err());
    let cli = Cli::try_parse_from(["sensordash", "notifications", "list", "telegram"]).unwrap();
    assert!(matches!(
      cli.command,
      Command::Notifications {
        action: NotificationsCommand::List {
          kind: NotificationParameterType::Telegram
        }
      }
    ));
  }

  #[test]
  fn test_watch_interval_defaults() {
    let cli = Cli::try_parse_from(["sensordash", "watch"]).unwrap();
    assert!(matches!(cli.command, Command::Watch(WatchArgs { interval: 30 })));
  }

  #[test]
  fn test_reports_incident_changes() {
    let previous: Seen = [(1, false), (2, false), (3, true)].into_iter().collect();
    let current = vec![incident(1, false), incident(2, true), incident(4, false)];

    let changes = incident_changes(&previous, &current);
    assert_eq!(changes.len(), 3);
    assert!(changes[0].starts_with("resolved #2"));
    assert!(changes[1].starts_with("new      #4"));
    assert_eq!(changes[2], "removed  #3");
  }

  #[test]
  fn test_unchanged_list_reports_nothing() {
    let previous: Seen = [(1, false)].into_iter().collect();
    assert!(incident_changes(&previous, &[incident(1, false)]).is_empty());
  }
}
