//! Session lifecycle.
//!
//! `SessionManager` is the only writer of `Session`. Everything else reads a
//! snapshot or watches the channel returned by `subscribe`. The manager also
//! listens for invalidation broadcasts from the request pipeline, so a 401 on
//! any request ends the session without the pipeline knowing who is listening.

use std::sync::{Arc, Weak};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, RequestMode};
use crate::config::Config;
use crate::models::{LoginRequest, NewAccount, UserProfile};

use super::credentials::{CredentialStore, Credentials};
use super::error::{AuthError, RegistrationFailure};
use super::events::{AuthEvents, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Loading,
    Unauthenticated,
    Authenticated,
}

/// Authenticated-state snapshot. A user is present exactly when authenticated.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(tag = "phase", content = "user", rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub enum Session {
    /// Startup, before `restore` has resolved
    #[default]
    Loading,
    Unauthenticated,
    Authenticated(UserProfile),
}

impl Session {
    pub fn phase(&self) -> Phase {
        match self {
            Session::Loading => Phase::Loading,
            Session::Unauthenticated => Phase::Unauthenticated,
            Session::Authenticated(_) => Phase::Authenticated,
        }
    }

    pub fn user(&self) -> Option<&UserProfile> {
        match self {
            Session::Authenticated(user) => Some(user),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Session::Authenticated(_))
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, Session::Loading)
    }
}

/// Clear the credential and publish `Unauthenticated`. Safe to repeat.
///
/// Ending a session that was still `Loading` is part of startup and is only
/// logged at debug.
fn end_session(credentials: &Credentials, state: &watch::Sender<Session>, reason: &str) {
    if let Err(e) = credentials.clear() {
        warn!(error = %e, "Failed to clear stored credentials");
    }
    let mut previous = Phase::Unauthenticated;
    let changed = state.send_if_modified(|session| {
        previous = session.phase();
        if *session == Session::Unauthenticated {
            false
        } else {
            *session = Session::Unauthenticated;
            true
        }
    });
    match (changed, previous) {
        (true, Phase::Authenticated) => info!(reason, "Session ended"),
        (true, _) => debug!(reason, "Stored session discarded"),
        (false, _) => debug!(reason, "Session already ended"),
    }
}

/// Ends the session when dropped, so logout's local cleanup runs even if the
/// remote call is abandoned midway.
struct EndOnDrop<'a> {
    manager: &'a SessionManager,
}

impl Drop for EndOnDrop<'_> {
    fn drop(&mut self) {
        self.manager.end_session("logout");
    }
}

pub struct SessionManager {
    api: ApiClient,
    credentials: Credentials,
    state: Arc<watch::Sender<Session>>,
    // Held for the manager's lifetime; dropping it stops invalidation handling
    _invalidation: Subscription,
}

impl SessionManager {
    /// Take ownership of the request pipeline and listen on its event bus.
    pub fn new(api: ApiClient) -> Self {
        let credentials = api.credentials().clone();
        let (tx, _) = watch::channel(Session::Loading);
        let state = Arc::new(tx);

        let invalidation = {
            let credentials = credentials.clone();
            let state: Weak<watch::Sender<Session>> = Arc::downgrade(&state);
            api.events().on_invalidate(move || {
                if let Some(state) = state.upgrade() {
                    end_session(&credentials, &state, "invalidated by server");
                }
            })
        };

        Self {
            api,
            credentials,
            state,
            _invalidation: invalidation,
        }
    }

    /// Build the pipeline and the manager from config and a chosen store.
    pub fn from_config(config: &Config, store: Arc<dyn CredentialStore>) -> Result<Self, AuthError> {
        let api = ApiClient::new(config, Credentials::new(store), AuthEvents::new()).map_err(AuthError::Api)?;
        Ok(Self::new(api))
    }

    /// The request pipeline, for authenticated calls elsewhere in the app.
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn session(&self) -> Session {
        self.state.borrow().clone()
    }

    pub fn phase(&self) -> Phase {
        self.state.borrow().phase()
    }

    pub fn current_user(&self) -> Option<UserProfile> {
        self.state.borrow().user().cloned()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated()
    }

    /// Watch session changes. The receiver closes when the manager is dropped.
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.state.subscribe()
    }

    /// Wait until the session has left `Loading`.
    pub async fn resolved(&self) -> Session {
        let mut rx = self.state.subscribe();
        let resolved = match rx.wait_for(|session| !session.is_loading()).await {
            Ok(session) => session.clone(),
            Err(_) => self.session(),
        };
        resolved
    }

    fn end_session(&self, reason: &str) {
        end_session(&self.credentials, &self.state, reason);
    }

    fn publish(&self, session: Session) {
        self.state.send_replace(session);
    }

    /// Resolve the startup session. Never surfaces errors: a stale session
    /// on startup is normal, so failures are logged at debug only.
    pub async fn restore(&self) -> Session {
        let credential = match self.credentials.load() {
            Ok(credential) => credential,
            Err(e) => {
                debug!(error = %e, "Could not read stored credentials");
                self.end_session("stored credentials unreadable");
                return self.session();
            }
        };

        if !credential.present {
            if credential.token.is_some() {
                // A token without the login flag is never trusted
                self.end_session("incomplete stored session");
            } else {
                self.publish(Session::Unauthenticated);
            }
            debug!("No stored session");
            return self.session();
        }

        match self.api.fetch_profile(RequestMode::Silent).await {
            Ok(user) => {
                debug!(user = user.display_name(), "Stored session restored");
                self.publish(Session::Authenticated(user));
            }
            Err(e) => {
                debug!(error = %e, "Stored session is no longer valid");
                self.end_session("stored session rejected");
            }
        }
        self.session()
    }

    /// Exchange email and password for a token, persist it, and load the profile.
    ///
    /// If the profile cannot be loaded the login is rolled back: the stored
    /// token is cleared and the session ends `Unauthenticated`.
    pub async fn login(&self, email: &str, password: &str) -> Result<UserProfile, AuthError> {
        let request = LoginRequest::new(email, password);
        let auth = self.api.login(&request).await.map_err(AuthError::from_login_failure)?;

        if let Err(e) = self.credentials.persist(&auth.token) {
            warn!(error = %e, "Failed to persist token");
            self.end_session("token could not be stored");
            return Err(AuthError::Storage(e.to_string()));
        }

        match self.api.fetch_profile(RequestMode::Normal).await {
            Ok(user) => {
                info!(user = user.display_name(), "Login successful");
                self.publish(Session::Authenticated(user.clone()));
                Ok(user)
            }
            Err(e) => {
                warn!(error = %e, "Profile fetch after login failed, rolling back");
                self.end_session("login rolled back");
                Err(AuthError::Profile(e))
            }
        }
    }

    /// Create an account. The session is unaffected either way.
    pub async fn register(&self, account: &NewAccount) -> Result<(), AuthError> {
        match self.api.register(account).await {
            Ok(()) => {
                info!("Account created");
                Ok(())
            }
            Err(e) => {
                let failure = RegistrationFailure::classify(&e);
                debug!(error = %e, ?failure, "Registration refused");
                Err(AuthError::Registration(failure))
            }
        }
    }

    /// Tell the server, then end the local session regardless of the outcome.
    pub async fn logout(&self) {
        let _end = EndOnDrop { manager: self };
        if let Err(e) = self.api.logout().await {
            warn!(error = %e, "Remote logout failed, clearing local session anyway");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::auth::{Credential, FileStore, MemoryStore};

    fn manager_for(server: &MockServer) -> SessionManager {
        let config = Config {
            api_base_url: server.uri(),
            ..Config::default()
        };
        SessionManager::from_config(&config, Arc::new(MemoryStore::default())).unwrap()
    }

    async fn mount_login(server: &MockServer, token: &str) {
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": token})))
            .mount(server)
            .await;
    }

    async fn mount_profile(server: &MockServer, token: &str, name: &str) {
        Mock::given(method("GET"))
            .and(path("/auth/me"))
            .and(header("authorization", format!("Bearer {}", token).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"name": name})))
            .mount(server)
            .await;
    }

    fn absent() -> Credential {
        Credential::default()
    }

    #[tokio::test]
    async fn test_login_authenticates_and_persists() {
        let server = MockServer::start().await;
        mount_login(&server, "abc").await;
        mount_profile(&server, "abc", "A").await;
        let manager = manager_for(&server);

        let user = manager.login("a@b.com", "x").await.unwrap();
        assert_eq!(user.name.as_deref(), Some("A"));
        assert_eq!(manager.phase(), Phase::Authenticated);
        assert_eq!(manager.current_user().and_then(|u| u.name), Some("A".to_string()));
        assert_eq!(
            manager.credentials().load().unwrap(),
            Credential {
                token: Some("abc".to_string()),
                present: true
            }
        );
    }

    #[tokio::test]
    async fn test_login_with_bad_password() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let manager = manager_for(&server);

        let err = manager.login("a@b.com", "wrong").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
        assert_eq!(err.to_string(), "Invalid email or password");
        assert_eq!(manager.phase(), Phase::Unauthenticated);
        assert_eq!(manager.credentials().load().unwrap(), absent());
    }

    #[tokio::test]
    async fn test_login_rolls_back_when_profile_fails() {
        let server = MockServer::start().await;
        mount_login(&server, "abc").await;
        Mock::given(method("GET"))
            .and(path("/auth/me"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let manager = manager_for(&server);

        let err = manager.login("a@b.com", "x").await.unwrap_err();
        assert!(matches!(err, AuthError::Profile(_)));
        assert_eq!(manager.phase(), Phase::Unauthenticated);
        assert_eq!(manager.credentials().load().unwrap(), absent());
    }

    #[tokio::test]
    async fn test_logout_clears_even_when_remote_fails() {
        let server = MockServer::start().await;
        mount_login(&server, "abc").await;
        mount_profile(&server, "abc", "A").await;
        Mock::given(method("GET"))
            .and(path("/medications"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/logout"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;
        let manager = manager_for(&server);

        manager.login("a@b.com", "x").await.unwrap();
        for _ in 0..3 {
            let meds: Vec<serde_json::Value> = manager
                .api()
                .get_json("/medications", RequestMode::Normal)
                .await
                .unwrap();
            assert!(meds.is_empty());
        }
        manager.logout().await;

        assert_eq!(manager.session(), Session::Unauthenticated);
        assert_eq!(manager.credentials().load().unwrap(), absent());
    }

    #[tokio::test]
    async fn test_abandoned_logout_still_clears() {
        let server = MockServer::start().await;
        mount_login(&server, "abc").await;
        mount_profile(&server, "abc", "A").await;
        Mock::given(method("POST"))
            .and(path("/auth/logout"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;
        let manager = manager_for(&server);
        manager.login("a@b.com", "x").await.unwrap();

        let mut logout = Box::pin(manager.logout());
        assert!(futures::poll!(logout.as_mut()).is_pending());
        drop(logout);

        assert_eq!(manager.phase(), Phase::Unauthenticated);
        assert_eq!(manager.credentials().load().unwrap(), absent());
    }

    #[tokio::test]
    async fn test_restore_without_credentials_makes_no_requests() {
        let server = MockServer::start().await;
        let manager = manager_for(&server);
        assert!(manager.session().is_loading());

        let session = manager.restore().await;
        assert_eq!(session, Session::Unauthenticated);
        let requests = server.received_requests().await.unwrap();
        assert!(requests.is_empty());
    }

    #[tokio::test]
    async fn test_restore_ignores_token_without_flag() {
        let server = MockServer::start().await;
        let store = Arc::new(MemoryStore::default());
        store.set(crate::auth::credentials::TOKEN_KEY, "orphan").unwrap();
        let config = Config {
            api_base_url: server.uri(),
            ..Config::default()
        };
        let manager = SessionManager::from_config(&config, store).unwrap();

        assert_eq!(manager.restore().await, Session::Unauthenticated);
        assert!(server.received_requests().await.unwrap().is_empty());
        assert_eq!(manager.credentials().load().unwrap(), absent());
    }

    #[tokio::test]
    async fn test_restore_with_valid_token() {
        let server = MockServer::start().await;
        mount_profile(&server, "abc", "A").await;
        let manager = manager_for(&server);
        manager.credentials().persist("abc").unwrap();

        let session = manager.restore().await;
        assert_eq!(session.user().and_then(|u| u.name.as_deref()), Some("A"));
        assert_eq!(manager.resolved().await.phase(), Phase::Authenticated);
    }

    #[tokio::test]
    async fn test_restore_with_failing_profile_clears() {
        for response in [
            ResponseTemplate::new(401),
            ResponseTemplate::new(502),
            ResponseTemplate::new(200).set_body_string("not json"),
        ] {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/auth/me"))
                .respond_with(response)
                .expect(1)
                .mount(&server)
                .await;
            let manager = manager_for(&server);
            manager.credentials().persist("stale").unwrap();

            assert_eq!(manager.restore().await, Session::Unauthenticated);
            assert_eq!(manager.credentials().load().unwrap(), absent());
        }
    }

    #[tokio::test]
    async fn test_restore_rejected_by_server_notifies_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/me"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let manager = manager_for(&server);
        manager.credentials().persist("stale").unwrap();
        let mut rx = manager.subscribe();

        // The 401 handler and restore both end the session; watchers see it once
        assert_eq!(manager.restore().await, Session::Unauthenticated);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Session::Unauthenticated);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_credentials_file_does_not_block_login() {
        let server = MockServer::start().await;
        mount_login(&server, "abc").await;
        mount_profile(&server, "abc", "A").await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("credentials.json");
        std::fs::write(&file, r#"{"auth_tok"#).unwrap();

        let config = Config {
            api_base_url: server.uri(),
            ..Config::default()
        };
        let manager = SessionManager::from_config(&config, Arc::new(FileStore::new(file.clone()))).unwrap();

        assert_eq!(manager.restore().await, Session::Unauthenticated);
        assert!(server.received_requests().await.unwrap().is_empty());
        assert_eq!(manager.credentials().load().unwrap(), absent());

        manager.login("a@b.com", "x").await.unwrap();
        assert!(manager.is_authenticated());
        let reopened = Credentials::new(Arc::new(FileStore::new(file)));
        assert_eq!(reopened.token().unwrap().as_deref(), Some("abc"));
        assert!(reopened.was_logged_in().unwrap());
    }

    #[tokio::test]
    async fn test_login_accepts_numeric_user_id() {
        let server = MockServer::start().await;
        mount_login(&server, "abc").await;
        Mock::given(method("GET"))
            .and(path("/auth/me"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": 42, "name": "A"})))
            .mount(&server)
            .await;
        let manager = manager_for(&server);

        let user = manager.login("a@b.com", "x").await.unwrap();
        assert_eq!(user.id.as_deref(), Some("42"));
        assert_eq!(manager.current_user().and_then(|u| u.name), Some("A".to_string()));
        assert!(manager.credentials().load().unwrap().present);
    }

    #[tokio::test]
    async fn test_unauthorized_anywhere_ends_session() {
        let server = MockServer::start().await;
        mount_login(&server, "abc").await;
        mount_profile(&server, "abc", "A").await;
        Mock::given(method("GET"))
            .and(path("/medications/doses"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let manager = manager_for(&server);
        manager.login("a@b.com", "x").await.unwrap();
        let mut rx = manager.subscribe();

        let result: Result<serde_json::Value, _> = manager
            .api()
            .get_json("/medications/doses", RequestMode::Normal)
            .await;
        assert!(result.is_err());
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Session::Unauthenticated);
        assert_eq!(manager.credentials().load().unwrap(), absent());
    }

    #[tokio::test]
    async fn test_repeated_invalidation_is_a_noop() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/logout"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        let manager = manager_for(&server);
        manager.logout().await;
        assert_eq!(manager.session(), Session::Unauthenticated);

        let rx = manager.subscribe();
        let events = manager.api().events().clone();
        let (a, b) = futures::future::join(
            async { events.emit_invalidate() },
            async { events.emit_invalidate() },
        )
        .await;
        assert_eq!((a, b), (1, 1));
        assert_eq!(manager.session(), Session::Unauthenticated);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_register_conflict_is_duplicate_account() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/register"))
            .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({"message": "exists"})))
            .mount(&server)
            .await;
        let manager = manager_for(&server);
        manager.restore().await;
        let account = NewAccount {
            name: "A".to_string(),
            email: "a@b.com".to_string(),
            password: "x".to_string(),
            time_zone: None,
        };

        match manager.register(&account).await {
            Err(AuthError::Registration(failure)) => {
                assert_eq!(failure, RegistrationFailure::DuplicateAccount)
            }
            other => panic!("expected duplicate account, got {:?}", other),
        }
        assert_eq!(manager.phase(), Phase::Unauthenticated);
    }

    #[tokio::test]
    async fn test_register_success_leaves_session_alone() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/register"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;
        let manager = manager_for(&server);
        let account = NewAccount {
            name: "A".to_string(),
            email: "a@b.com".to_string(),
            password: "x".to_string(),
            time_zone: None,
        };

        manager.register(&account).await.unwrap();
        assert!(manager.session().is_loading());
        assert_eq!(manager.credentials().load().unwrap(), absent());
    }

    #[tokio::test]
    async fn test_dropping_manager_stops_listening() {
        let server = MockServer::start().await;
        let manager = manager_for(&server);
        let events = manager.api().events().clone();
        assert_eq!(events.subscriber_count(), 1);

        drop(manager);
        assert_eq!(events.emit_invalidate(), 0);
    }

    #[test]
    fn test_session_serializes_with_phase_tag() {
        let session = Session::Authenticated(UserProfile {
            name: Some("A".to_string()),
            ..Default::default()
        });
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["phase"], "authenticated");
        assert_eq!(json["user"]["name"], "A");
        assert_eq!(serde_json::to_value(Session::Loading).unwrap()["phase"], "loading");
    }
}
