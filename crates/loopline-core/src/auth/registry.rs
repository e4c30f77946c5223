//! Multi-account session registry.
//!
//! Owns the ordered list of known accounts and which one is active. A
//! switch is atomic from the UI's point of view: the previous credential
//! and the response cache are gone before the new account's credential is
//! installed, so no request started under account A can complete into
//! state visible to account B.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::api::transport::{HttpRequest, HttpTransport, Method};
use crate::api::ApiError;
use crate::cache::ResponseCache;
use crate::config::ClientConfig;
use crate::events::{EventBus, SessionEvent};
use crate::models::{AuthResponse, Session, UserProfile};
use crate::store::{credential_key, KeyValueStore, ACTIVE_USER_KEY, SESSION_LIST_KEY};

use super::{Credential, TokenManager};

struct RegistryState {
    sessions: Vec<Session>,
    active: Option<String>,
}

pub struct SessionRegistry {
    plain: Arc<dyn KeyValueStore>,
    secure: Arc<dyn KeyValueStore>,
    tokens: Arc<TokenManager>,
    transport: Arc<dyn HttpTransport>,
    cache: Arc<Mutex<ResponseCache>>,
    events: EventBus,
    base_url: String,
    request_timeout: Duration,
    state: Mutex<RegistryState>,
}

impl SessionRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        plain: Arc<dyn KeyValueStore>,
        secure: Arc<dyn KeyValueStore>,
        tokens: Arc<TokenManager>,
        transport: Arc<dyn HttpTransport>,
        cache: Arc<Mutex<ResponseCache>>,
        events: EventBus,
        config: &ClientConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            plain,
            secure,
            tokens,
            transport,
            cache,
            events,
            base_url: config.api_base_url.clone(),
            request_timeout: config.request_timeout,
            state: Mutex::new(RegistryState {
                sessions: Vec::new(),
                active: None,
            }),
        })
    }

    /// Load the persisted session list and active account, seeding the
    /// token manager. Returns whether a usable active session exists.
    pub async fn restore(&self) -> Result<bool, ApiError> {
        let sessions: Vec<Session> = match self
            .plain
            .get(SESSION_LIST_KEY)
            .map_err(ApiError::storage)?
        {
            Some(body) => serde_json::from_str(&body).unwrap_or_else(|err| {
                warn!(error = %err, "stored session list is corrupt, starting empty");
                Vec::new()
            }),
            None => Vec::new(),
        };
        let active = self
            .plain
            .get(ACTIVE_USER_KEY)
            .map_err(ApiError::storage)?
            .filter(|id| sessions.iter().any(|session| &session.id == id));

        {
            let mut state = self.state.lock().await;
            state.sessions = sessions;
            state.active = active.clone();
        }

        match active {
            Some(id) => self.tokens.restore(&id).await,
            None => Ok(false),
        }
    }

    pub async fn sessions(&self) -> Vec<Session> {
        self.state.lock().await.sessions.clone()
    }

    pub async fn active_id(&self) -> Option<String> {
        self.state.lock().await.active.clone()
    }

    pub async fn active_session(&self) -> Option<Session> {
        let state = self.state.lock().await;
        let active = state.active.as_deref()?;
        state
            .sessions
            .iter()
            .find(|session| session.id == active)
            .cloned()
    }

    /// Add or update a known account without changing which one is
    /// active. The credential lands in the secure partition.
    pub async fn add_session(
        &self,
        session: Session,
        credential: Credential,
    ) -> Result<(), ApiError> {
        let body =
            serde_json::to_string(&credential).map_err(|err| ApiError::Storage(err.to_string()))?;
        self.secure
            .put(&credential_key(&session.id), &body)
            .map_err(ApiError::storage)?;

        {
            let mut state = self.state.lock().await;
            Self::upsert(&mut state.sessions, session);
            self.persist_locked(&state)?;
        }
        self.events.emit(SessionEvent::SessionListChanged);
        Ok(())
    }

    /// Add (or update) an account and make it active. Used by login and
    /// registration.
    pub(crate) async fn activate(
        &self,
        session: Session,
        credential: Credential,
    ) -> Result<(), ApiError> {
        self.tokens.install(&session.id, credential).await?;
        {
            let mut state = self.state.lock().await;
            state.active = Some(session.id.clone());
            Self::upsert(&mut state.sessions, session);
            self.persist_locked(&state)?;
        }
        self.events.emit(SessionEvent::SessionListChanged);
        Ok(())
    }

    /// Atomically make another known account active.
    ///
    /// When the local copy lacks a usable credential, fresh credential and
    /// profile data are fetched first - before the current session is
    /// touched, so a failed fetch leaves it intact. If the fetch fails and
    /// this was the last remaining session, falls back to full logout.
    pub async fn switch_session(&self, id: &str) -> Result<Session, ApiError> {
        let (target, is_last) = {
            let state = self.state.lock().await;
            if state.active.as_deref() == Some(id) {
                // Already active; nothing to swap.
                let session = state
                    .sessions
                    .iter()
                    .find(|session| session.id == id)
                    .cloned()
                    .ok_or_else(|| ApiError::SessionNotFound(id.to_string()))?;
                return Ok(session);
            }
            let target = state
                .sessions
                .iter()
                .find(|session| session.id == id)
                .cloned()
                .ok_or_else(|| ApiError::SessionNotFound(id.to_string()))?;
            (target, state.sessions.len() == 1)
        };
        debug!(user_id = %target.id, "switching active session");

        let stored = self
            .secure
            .get(&credential_key(id))
            .map_err(ApiError::storage)?
            .and_then(|body| serde_json::from_str::<Credential>(&body).ok());
        let (credential, fetched_profile) = match stored {
            Some(credential) => (credential, None),
            None => match self.fetch_switch_credential(id).await {
                Ok(pair) => pair,
                Err(err) => {
                    if is_last {
                        warn!(error = %err, "switch failed for the only known session, logging out");
                        let _ = self.remove_session(id).await;
                        self.force_logout().await?;
                    }
                    return Err(err);
                }
            },
        };

        // Swap order matters: the old credential and account-scoped cache
        // are unusable before the new account becomes visible.
        self.tokens.invalidate().await;
        self.cache.lock().await.clear();
        self.tokens.install(id, credential).await?;

        let session = {
            let mut state = self.state.lock().await;
            let entry = state
                .sessions
                .iter_mut()
                .find(|session| session.id == id)
                .ok_or_else(|| ApiError::SessionNotFound(id.to_string()))?;
            if let Some(profile) = fetched_profile {
                entry.profile = profile;
            }
            entry.last_refresh = Utc::now();
            let snapshot = entry.clone();
            state.active = Some(id.to_string());
            self.persist_locked(&state)?;
            snapshot
        };

        self.events.emit(SessionEvent::SessionSwitched(id.to_string()));
        Ok(session)
    }

    /// Remove an account from the list. If it was active, no replacement
    /// is picked implicitly - the caller must log in or switch.
    pub async fn remove_session(&self, id: &str) -> Result<(), ApiError> {
        let was_active = {
            let mut state = self.state.lock().await;
            let index = state
                .sessions
                .iter()
                .position(|session| session.id == id)
                .ok_or_else(|| ApiError::SessionNotFound(id.to_string()))?;
            state.sessions.remove(index);
            let was_active = state.active.as_deref() == Some(id);
            if was_active {
                state.active = None;
            }
            self.persist_locked(&state)?;
            was_active
        };

        if let Err(err) = self.secure.delete(&credential_key(id)) {
            warn!(error = %err, "failed to delete stored credential");
        }
        if was_active {
            self.tokens.invalidate().await;
            self.cache.lock().await.clear();
        }
        self.events.emit(SessionEvent::SessionListChanged);
        Ok(())
    }

    /// Sign the active account out. Idempotent: a second call finds
    /// nothing to do and makes no network call.
    pub async fn logout(&self) -> Result<(), ApiError> {
        let active = self.state.lock().await.active.clone();
        let token = self.tokens.current_token().await;
        if active.is_none() && token.is_none() {
            debug!("logout with no active session is a no-op");
            return Ok(());
        }

        // Best-effort server-side revocation; local teardown proceeds
        // regardless of the outcome.
        if let Some(token) = token {
            let request = HttpRequest {
                method: Method::Post,
                url: format!("{}/auth/logout", self.base_url),
                bearer: Some(token),
                body: None,
                timeout: Some(self.request_timeout),
            };
            if let Err(err) = self.transport.execute(request).await {
                debug!(error = %err, "logout call failed");
            }
        }

        self.force_logout().await
    }

    /// Re-fetch the active account's profile into its denormalized view.
    pub async fn refresh_profile(&self) -> Result<UserProfile, ApiError> {
        let bearer = self.tokens.get_valid_token().await?;
        let request = HttpRequest {
            method: Method::Get,
            url: format!("{}/users/me", self.base_url),
            bearer: Some(bearer),
            body: None,
            timeout: Some(self.request_timeout),
        };
        let response = self.transport.execute(request).await?;
        if !response.is_success() {
            return Err(ApiError::from_status(response.status, &response.body));
        }
        let profile: UserProfile = response.json()?;

        {
            let mut state = self.state.lock().await;
            if let Some(active) = state.active.clone() {
                if let Some(entry) = state
                    .sessions
                    .iter_mut()
                    .find(|session| session.id == active)
                {
                    entry.profile = profile.clone();
                    entry.last_refresh = Utc::now();
                }
                self.persist_locked(&state)?;
            }
        }
        self.events.emit(SessionEvent::SessionListChanged);
        Ok(profile)
    }

    /// Local teardown of the active session: credential gone, cache
    /// cleared, account dropped from the list.
    async fn force_logout(&self) -> Result<(), ApiError> {
        self.tokens.invalidate().await;
        {
            let mut state = self.state.lock().await;
            if let Some(active) = state.active.take() {
                state.sessions.retain(|session| session.id != active);
                if let Err(err) = self.secure.delete(&credential_key(&active)) {
                    warn!(error = %err, "failed to delete stored credential");
                }
            }
            self.persist_locked(&state)?;
        }
        self.cache.lock().await.clear();
        self.events.emit(SessionEvent::SessionListChanged);
        Ok(())
    }

    /// Fetch fresh credential and profile data for a known account whose
    /// local credential is missing or unusable.
    async fn fetch_switch_credential(
        &self,
        user_id: &str,
    ) -> Result<(Credential, Option<UserProfile>), ApiError> {
        let bearer = self.tokens.get_valid_token().await.map_err(|err| {
            ApiError::SwitchFailed(format!("no active credential to authorize switch: {err}"))
        })?;
        let request = HttpRequest {
            method: Method::Post,
            url: format!("{}/auth/switch", self.base_url),
            bearer: Some(bearer),
            body: Some(json!({ "userId": user_id })),
            timeout: Some(self.request_timeout),
        };
        let response = self
            .transport
            .execute(request)
            .await
            .map_err(|err| ApiError::SwitchFailed(err.to_string()))?;
        if !response.is_success() {
            return Err(ApiError::SwitchFailed(format!(
                "switch rejected with status {}",
                response.status
            )));
        }
        let parsed: AuthResponse = response
            .json()
            .map_err(|err| ApiError::SwitchFailed(err.to_string()))?;
        let credential = Credential::from_expires_in(
            parsed.access_token,
            parsed.refresh_token,
            parsed.expires_in,
        );
        Ok((credential, Some(parsed.user)))
    }

    fn upsert(sessions: &mut Vec<Session>, session: Session) {
        match sessions.iter_mut().find(|existing| existing.id == session.id) {
            Some(existing) => *existing = session,
            None => sessions.push(session),
        }
    }

    fn persist_locked(&self, state: &RegistryState) -> Result<(), ApiError> {
        let list = serde_json::to_string(&state.sessions)
            .map_err(|err| ApiError::Storage(err.to_string()))?;
        self.plain
            .put(SESSION_LIST_KEY, &list)
            .map_err(ApiError::storage)?;
        match &state.active {
            Some(id) => self.plain.put(ACTIVE_USER_KEY, id).map_err(ApiError::storage),
            None => self.plain.delete(ACTIVE_USER_KEY).map_err(ApiError::storage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::transport::testing::MockTransport;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn profile(id: &str, username: &str) -> UserProfile {
        UserProfile {
            id: id.into(),
            username: username.into(),
            display_name: None,
            avatar_url: None,
        }
    }

    fn credential(token: &str) -> Credential {
        Credential::from_expires_in(token.into(), format!("refresh-{token}"), None)
    }

    struct Harness {
        registry: Arc<SessionRegistry>,
        tokens: Arc<TokenManager>,
        cache: Arc<Mutex<ResponseCache>>,
        events: EventBus,
        plain: Arc<MemoryStore>,
        secure: Arc<MemoryStore>,
    }

    fn harness(transport: Arc<MockTransport>) -> Harness {
        let config = ClientConfig {
            api_base_url: "https://api.test".into(),
            ..ClientConfig::default()
        };
        let plain = Arc::new(MemoryStore::new());
        let secure = Arc::new(MemoryStore::new());
        let events = EventBus::new();
        let tokens = TokenManager::new(
            transport.clone(),
            secure.clone(),
            events.clone(),
            &config,
        );
        let cache = Arc::new(Mutex::new(ResponseCache::new(
            config.cache_ttl_minutes,
            config.cache_capacity,
        )));
        let registry = SessionRegistry::new(
            plain.clone(),
            secure.clone(),
            tokens.clone(),
            transport,
            cache.clone(),
            events.clone(),
            &config,
        );
        Harness {
            registry,
            tokens,
            cache,
            events,
            plain,
            secure,
        }
    }

    async fn seed_two_accounts(h: &Harness) {
        h.registry
            .activate(Session::new(profile("u-a", "alice")), credential("A1"))
            .await
            .unwrap();
        h.registry
            .add_session(Session::new(profile("u-b", "bo")), credential("B1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_add_session_does_not_change_the_active_account() {
        let transport = MockTransport::new(|_| panic!("no network expected"));
        let h = harness(transport);
        seed_two_accounts(&h).await;

        assert_eq!(h.registry.active_id().await.as_deref(), Some("u-a"));
        assert_eq!(h.registry.sessions().await.len(), 2);
        assert_eq!(h.tokens.current_token().await.as_deref(), Some("A1"));
    }

    #[tokio::test]
    async fn test_switch_installs_the_stored_credential_and_isolates_state() {
        let transport = MockTransport::new(|_| panic!("switch should use the local credential"));
        let h = harness(transport);
        seed_two_accounts(&h).await;
        let mut events = h.events.subscribe();
        h.cache
            .lock()
            .await
            .insert("/feed".into(), json!(["alice's feed"]));

        let session = h.registry.switch_session("u-b").await.unwrap();

        assert_eq!(session.profile.username, "bo");
        assert_eq!(h.registry.active_id().await.as_deref(), Some("u-b"));
        // No cache entry written under the previous account survives.
        assert!(h.cache.lock().await.is_empty());
        // The previous account's token is never handed out again.
        assert_eq!(h.tokens.get_valid_token().await.unwrap(), "B1");
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::SessionSwitched("u-b".into())
        );
    }

    #[tokio::test]
    async fn test_switch_to_unknown_account_fails() {
        let transport = MockTransport::new(|_| panic!("no network expected"));
        let h = harness(transport);
        seed_two_accounts(&h).await;

        assert!(matches!(
            h.registry.switch_session("u-zz").await,
            Err(ApiError::SessionNotFound(_))
        ));
        assert_eq!(h.registry.active_id().await.as_deref(), Some("u-a"));
    }

    #[tokio::test]
    async fn test_switch_fetches_a_credential_when_the_local_copy_is_missing() {
        let transport = MockTransport::new(|request| {
            assert!(request.url.contains("/auth/switch"));
            assert_eq!(request.body.as_ref().unwrap()["userId"], "u-b");
            Ok(MockTransport::ok(json!({
                "success": true,
                "accessToken": "B2",
                "refreshToken": "BR2",
                "user": {"id": "u-b", "username": "bo", "displayName": "Bo!"}
            })))
        });
        let h = harness(transport.clone());
        seed_two_accounts(&h).await;
        // Simulate a lost keychain entry for the target account.
        h.secure.delete(&credential_key("u-b")).unwrap();

        let session = h.registry.switch_session("u-b").await.unwrap();

        assert_eq!(transport.count_to("/auth/switch"), 1);
        assert_eq!(session.profile.display_name.as_deref(), Some("Bo!"));
        assert_eq!(h.tokens.current_token().await.as_deref(), Some("B2"));
    }

    #[tokio::test]
    async fn test_failed_switch_leaves_the_current_session_intact() {
        let transport = MockTransport::new(|_| Ok(MockTransport::status(403, "forbidden")));
        let h = harness(transport);
        seed_two_accounts(&h).await;
        h.secure.delete(&credential_key("u-b")).unwrap();

        assert!(matches!(
            h.registry.switch_session("u-b").await,
            Err(ApiError::SwitchFailed(_))
        ));
        assert_eq!(h.registry.active_id().await.as_deref(), Some("u-a"));
        assert_eq!(h.tokens.current_token().await.as_deref(), Some("A1"));
    }

    #[tokio::test]
    async fn test_failed_switch_for_the_last_session_falls_back_to_logout() {
        let transport = MockTransport::new(|_| Err(ApiError::NetworkTransient("offline".into())));
        let h = harness(transport);
        // One account whose credential is gone, then deactivated so a
        // switch back to it must fetch.
        h.registry
            .activate(Session::new(profile("u-a", "alice")), credential("A1"))
            .await
            .unwrap();
        h.registry
            .add_session(Session::new(profile("u-b", "bo")), credential("B1"))
            .await
            .unwrap();
        h.registry.remove_session("u-a").await.unwrap();
        h.secure.delete(&credential_key("u-b")).unwrap();

        assert!(h.registry.switch_session("u-b").await.is_err());

        assert!(h.registry.sessions().await.is_empty());
        assert!(h.registry.active_id().await.is_none());
        assert!(h.tokens.current_token().await.is_none());
    }

    #[tokio::test]
    async fn test_remove_active_session_leaves_no_implicit_replacement() {
        let transport = MockTransport::new(|_| panic!("no network expected"));
        let h = harness(transport);
        seed_two_accounts(&h).await;
        h.cache.lock().await.insert("/feed".into(), json!([1]));

        h.registry.remove_session("u-a").await.unwrap();

        assert!(h.registry.active_id().await.is_none());
        assert!(h.tokens.current_token().await.is_none());
        assert!(h.cache.lock().await.is_empty());
        assert_eq!(h.registry.sessions().await.len(), 1);
        assert!(h.secure.get(&credential_key("u-a")).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let transport = MockTransport::new(|_| Ok(MockTransport::ok(json!({}))));
        let h = harness(transport.clone());
        h.registry
            .activate(Session::new(profile("u-a", "alice")), credential("A1"))
            .await
            .unwrap();

        h.registry.logout().await.unwrap();
        h.registry.logout().await.unwrap();

        assert_eq!(transport.count_to("/auth/logout"), 1);
        assert!(h.registry.active_id().await.is_none());
        assert!(h.registry.sessions().await.is_empty());
        assert!(h.tokens.current_token().await.is_none());
    }

    #[tokio::test]
    async fn test_restore_rebuilds_sessions_and_credential_from_storage() {
        let transport = MockTransport::new(|_| panic!("no network expected"));
        let h = harness(transport.clone());
        seed_two_accounts(&h).await;

        // A fresh process: same stores, new registry and token manager.
        let config = ClientConfig {
            api_base_url: "https://api.test".into(),
            ..ClientConfig::default()
        };
        let events = EventBus::new();
        let tokens = TokenManager::new(
            transport.clone(),
            h.secure.clone(),
            events.clone(),
            &config,
        );
        let cache = Arc::new(Mutex::new(ResponseCache::new(5, 16)));
        let fresh = SessionRegistry::new(
            h.plain.clone(),
            h.secure.clone(),
            tokens.clone(),
            transport,
            cache,
            events,
            &config,
        );

        assert!(fresh.restore().await.unwrap());
        assert_eq!(fresh.active_id().await.as_deref(), Some("u-a"));
        assert_eq!(fresh.sessions().await.len(), 2);
        assert_eq!(tokens.current_token().await.as_deref(), Some("A1"));
    }

    #[tokio::test]
    async fn test_refresh_profile_updates_the_denormalized_view() {
        let transport = MockTransport::new(|request| {
            assert!(request.url.contains("/users/me"));
            Ok(MockTransport::ok(json!({
                "id": "u-a",
                "username": "alice",
                "displayName": "Alice Prime",
                "avatarUrl": "https://cdn.test/alice.png"
            })))
        });
        let h = harness(transport);
        h.registry
            .activate(Session::new(profile("u-a", "alice")), credential("A1"))
            .await
            .unwrap();

        let profile = h.registry.refresh_profile().await.unwrap();

        assert_eq!(profile.display_name.as_deref(), Some("Alice Prime"));
        let active = h.registry.active_session().await.unwrap();
        assert_eq!(
            active.profile.avatar_url.as_deref(),
            Some("https://cdn.test/alice.png")
        );
    }
}
