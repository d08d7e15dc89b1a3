//! Session gate: authentication state derived from the current-user query.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::keys::{self, Freshness};
use crate::api::{DashboardApi, LoginRequest, UserInfo};
use crate::error::{SyncError, SyncResult};
use crate::query::{fetcher, Fetcher, QueryClient};
use crate::transport::credentials::{fingerprint, CredentialStore, ACCESS_TOKEN, REFRESH_TOKEN};

/// Days the access token stays valid in the credential store.
const ACCESS_TOKEN_DAYS: u32 = 3;

pub const SIGN_IN_ROUTE: &str = "/auth/sign-in";
pub const HOME_ROUTE: &str = "/";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
  /// Not yet resolved; views show a loading indicator
  #[default]
  Unknown,
  Authenticated(UserInfo),
  Unauthenticated,
}

impl SessionState {
  pub fn is_loading(&self) -> bool {
    matches!(self, SessionState::Unknown)
  }

  pub fn is_authenticated(&self) -> bool {
    matches!(self, SessionState::Authenticated(_))
  }

  pub fn user(&self) -> Option<&UserInfo> {
    match self {
      SessionState::Authenticated(user) => Some(user),
      _ => None,
    }
  }
}

struct Inner {
  client: QueryClient,
  api: DashboardApi,
  credentials: Arc<dyn CredentialStore>,
  freshness: Freshness,
  state: watch::Sender<SessionState>,
  /// Bumped on every login and logout; a resolve started under an older
  /// generation never publishes its result
  generation: AtomicU64,
}

/// Tracks who is signed in. Cloning shares the same session.
#[derive(Clone)]
pub struct Session {
  inner: Arc<Inner>,
}

impl Session {
  pub fn new(
    client: &QueryClient,
    api: DashboardApi,
    credentials: Arc<dyn CredentialStore>,
    freshness: Freshness,
  ) -> Self {
    let (state, _) = watch::channel(SessionState::Unknown);
    Self {
      inner: Arc::new(Inner {
        client: client.clone(),
        api,
        credentials,
        freshness,
        state,
        generation: AtomicU64::new(0),
      }),
    }
  }

  pub fn state(&self) -> SessionState {
    self.inner.state.borrow().clone()
  }

  pub fn user(&self) -> Option<UserInfo> {
    self.state().user().cloned()
  }

  /// Receive every state transition.
  pub fn watch(&self) -> watch::Receiver<SessionState> {
    self.inner.state.subscribe()
  }

  fn current_user_fetcher(&self) -> Fetcher<Option<UserInfo>> {
    let api = self.inner.api.clone();
    fetcher(move |_key| {
      let api = api.clone();
      async move { api.get_current_user().await }
    })
  }

  /// Publish `next` unless a login or logout happened since `generation`.
  fn transition(&self, generation: u64, next: SessionState) -> SessionState {
    if self.inner.generation.load(Ordering::SeqCst) != generation {
      debug!("discarding session result from before the last login or logout");
      return self.state();
    }
    self.publish(next)
  }

  fn publish(&self, next: SessionState) -> SessionState {
    let changed = self.inner.state.send_if_modified(|state| {
      if *state == next {
        return false;
      }
      *state = next.clone();
      true
    });
    if changed {
      match &next {
        SessionState::Authenticated(user) => info!(user = %user.username, "session authenticated"),
        SessionState::Unauthenticated => info!("session unauthenticated"),
        SessionState::Unknown => debug!("session unknown"),
      }
    }
    next
  }

  /// Run the current-user query and settle the state.
  ///
  /// Without an access token there is nothing to ask the backend and the
  /// session is unauthenticated straight away.
  pub async fn resolve(&self) -> SessionState {
    let generation = self.inner.generation.load(Ordering::SeqCst);

    let Some(token) = self.inner.credentials.get(ACCESS_TOKEN) else {
      return self.transition(generation, SessionState::Unauthenticated);
    };
    debug!(token = %fingerprint(&token), "resolving session");

    let key = keys::current_user();
    let options = self.inner.freshness.options(&key);
    let result = self
      .inner
      .client
      .fetch_query(&key, options, &self.current_user_fetcher())
      .await;

    let next = match result {
      Ok(Some(user)) => SessionState::Authenticated(user),
      Ok(None) => SessionState::Unauthenticated,
      Err(e) if e.is_auth_expired() => {
        if self.inner.generation.load(Ordering::SeqCst) == generation {
          self.expire();
        }
        return self.state();
      }
      Err(e) => {
        warn!(error = %e, "could not resolve current user");
        SessionState::Unauthenticated
      }
    };
    self.transition(generation, next)
  }

  /// Exchange credentials for tokens and become authenticated.
  pub async fn login(&self, email: &str, password: &str) -> SyncResult<UserInfo> {
    let request = LoginRequest {
      email: email.to_string(),
      password: password.to_string(),
    };
    let response = self.inner.api.login(&request).await?;

    let credentials = &self.inner.credentials;
    credentials.set(ACCESS_TOKEN, &response.access, Some(ACCESS_TOKEN_DAYS))?;
    credentials.set(REFRESH_TOKEN, &response.refresh, None)?;
    debug!(token = %fingerprint(&response.access), "stored access token");

    self.inner.generation.fetch_add(1, Ordering::SeqCst);
    self
      .inner
      .client
      .set_query_data(&keys::current_user(), &Some(response.user.clone()))?;
    self.publish(SessionState::Authenticated(response.user.clone()));
    Ok(response.user)
  }

  /// Forget the tokens and become unauthenticated, whatever is in flight.
  pub fn logout(&self) -> SyncResult<()> {
    self.inner.generation.fetch_add(1, Ordering::SeqCst);
    self.inner.client.remove(&keys::current_user());
    self.publish(SessionState::Unauthenticated);

    let credentials = &self.inner.credentials;
    credentials.remove(ACCESS_TOKEN)?;
    credentials.remove(REFRESH_TOKEN)?;
    Ok(())
  }

  /// Feed an error from any protected query; an expired token ends the session.
  pub fn observe_error(&self, error: &SyncError) -> bool {
    if !error.is_auth_expired() {
      return false;
    }
    self.expire();
    true
  }

  fn expire(&self) {
    warn!("access token rejected, signing out");
    if let Err(e) = self.logout() {
      warn!(error = %e, "failed to clear credentials");
    }
  }
}

impl std::fmt::Debug for Session {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Session")
      .field("state", &self.state())
      .field("generation", &self.inner.generation.load(Ordering::SeqCst))
      .finish_non_exhaustive()
  }
}

/// Outcome of guarding a route against the session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
  Loading,
  Render,
  Redirect(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteGuard {
  /// Requires a signed-in user
  Protected,
  /// Only for signed-out visitors, e.g. the sign-in page
  PublicOnly,
}

impl RouteGuard {
  pub fn decide(self, state: &SessionState) -> RouteDecision {
    match (self, state) {
      (_, SessionState::Unknown) => RouteDecision::Loading,
      (RouteGuard::Protected, SessionState::Authenticated(_)) => RouteDecision::Render,
      (RouteGuard::Protected, SessionState::Unauthenticated) => {
        RouteDecision::Redirect(SIGN_IN_ROUTE)
      }
      (RouteGuard::PublicOnly, SessionState::Authenticated(_)) => {
        RouteDecision::Redirect(HOME_ROUTE)
      }
      (RouteGuard::PublicOnly, SessionState::Unauthenticated) => RouteDecision::Render,
    }
  }
}
