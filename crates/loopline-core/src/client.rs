//! Top-level client facade.
//!
//! `Client` wires the subsystems together - token manager, dispatcher,
//! batch coalescer, session registry, realtime channel - around one
//! shared event bus and response cache. There is no ambient global state:
//! every instance is independent, and the storage/transport seams are
//! injected so tests run against in-memory implementations.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};

use crate::api::{
    ApiError, BatchCoalescer, Dispatcher, HttpTransport, Method, ReqwestTransport, RequestOptions,
};
use crate::auth::{Credential, SessionRegistry, TokenManager};
use crate::cache::ResponseCache;
use crate::config::ClientConfig;
use crate::events::{EventBus, SessionEvent};
use crate::models::{AuthResponse, Session, UserProfile};
use crate::realtime::RealtimeChannel;
use crate::store::{FileStore, KeyValueStore, KeychainStore};

pub struct Client {
    config: ClientConfig,
    events: EventBus,
    tokens: Arc<TokenManager>,
    dispatcher: Arc<Dispatcher>,
    batch: Arc<BatchCoalescer>,
    registry: Arc<SessionRegistry>,
    realtime: Arc<RealtimeChannel>,
}

impl Client {
    /// Production wiring: reqwest transport, keychain secure partition,
    /// file-backed plain partition.
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(config.request_timeout)?);
        let secure: Arc<dyn KeyValueStore> = Arc::new(KeychainStore::new());
        let plain: Arc<dyn KeyValueStore> = Arc::new(FileStore::open_default()?);
        Ok(Self::with_parts(config, transport, secure, plain))
    }

    /// Dependency-injected wiring.
    pub fn with_parts(
        config: ClientConfig,
        transport: Arc<dyn HttpTransport>,
        secure: Arc<dyn KeyValueStore>,
        plain: Arc<dyn KeyValueStore>,
    ) -> Self {
        let events = EventBus::new();
        let tokens = TokenManager::new(transport.clone(), secure.clone(), events.clone(), &config);
        let cache = Arc::new(Mutex::new(ResponseCache::new(
            config.cache_ttl_minutes,
            config.cache_capacity,
        )));
        let dispatcher = Dispatcher::new(transport.clone(), tokens.clone(), cache.clone(), &config);
        let batch = BatchCoalescer::new(dispatcher.clone(), config.batch_window);
        let registry = SessionRegistry::new(
            plain,
            secure,
            tokens.clone(),
            transport.clone(),
            cache,
            events.clone(),
            &config,
        );
        let realtime = RealtimeChannel::new(transport, tokens.clone(), events.clone(), &config);

        Self {
            config,
            events,
            tokens,
            dispatcher,
            batch,
            registry,
            realtime,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Restore persisted sessions from a previous run. Returns whether a
    /// usable active session exists.
    pub async fn restore(&self) -> Result<bool, ApiError> {
        self.registry.restore().await
    }

    pub async fn is_authenticated(&self) -> bool {
        self.tokens.is_authenticated().await
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Session, ApiError> {
        self.authenticate("/auth/login", username, password).await
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<Session, ApiError> {
        self.authenticate("/auth/register", username, password).await
    }

    /// Sign the active account out. Idempotent.
    pub async fn logout(&self) -> Result<(), ApiError> {
        self.registry.logout().await
    }

    /// Full-control request entry point.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value, ApiError> {
        self.dispatcher.request(method, endpoint, params, options).await
    }

    /// Cached read.
    pub async fn get(&self, endpoint: &str, params: Option<Value>) -> Result<Value, ApiError> {
        self.dispatcher
            .request(Method::Get, endpoint, params, RequestOptions::cached())
            .await
    }

    /// Read coalesced with other same-tick reads into one round trip.
    pub async fn get_batched(
        &self,
        endpoint: &str,
        params: Option<Value>,
    ) -> Result<Value, ApiError> {
        self.batch.enqueue(endpoint, params).await
    }

    /// Mutation; invalidates cached reads under the endpoint's prefix.
    pub async fn post(&self, endpoint: &str, body: Option<Value>) -> Result<Value, ApiError> {
        self.dispatcher
            .request(Method::Post, endpoint, body, RequestOptions::default())
            .await
    }

    /// Subscribe to session events (`AuthRequired`, `SessionSwitched`,
    /// `SessionListChanged`, `RealtimeOffline`).
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn realtime(&self) -> &Arc<RealtimeChannel> {
        &self.realtime
    }

    pub async fn sessions(&self) -> Vec<Session> {
        self.registry.sessions().await
    }

    pub async fn active_session(&self) -> Option<Session> {
        self.registry.active_session().await
    }

    pub async fn switch_session(&self, id: &str) -> Result<Session, ApiError> {
        self.registry.switch_session(id).await
    }

    pub async fn remove_session(&self, id: &str) -> Result<(), ApiError> {
        self.registry.remove_session(id).await
    }

    pub async fn refresh_profile(&self) -> Result<UserProfile, ApiError> {
        self.registry.refresh_profile().await
    }

    async fn authenticate(
        &self,
        endpoint: &str,
        username: &str,
        password: &str,
    ) -> Result<Session, ApiError> {
        let value = self
            .dispatcher
            .request(
                Method::Post,
                endpoint,
                Some(json!({ "username": username, "password": password })),
                RequestOptions::unauthenticated(),
            )
            .await?;
        let response: AuthResponse = serde_json::from_value(value)
            .map_err(|err| ApiError::InvalidResponse(format!("failed to parse auth response: {err}")))?;
        if !response.success {
            return Err(ApiError::Validation {
                message: "authentication rejected".into(),
                details: None,
            });
        }

        let credential = Credential::from_expires_in(
            response.access_token,
            response.refresh_token,
            response.expires_in,
        );
        let session = Session::new(response.user);
        self.registry.activate(session.clone(), credential).await?;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::transport::testing::MockTransport;
    use crate::store::MemoryStore;

    fn client_with(transport: Arc<MockTransport>) -> Client {
        let config = ClientConfig {
            api_base_url: "https://api.test".into(),
            ..ClientConfig::default()
        };
        Client::with_parts(
            config,
            transport,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
        )
    }

    fn login_response() -> Value {
        json!({
            "success": true,
            "accessToken": "A1",
            "refreshToken": "R1",
            "expiresIn": 1800,
            "user": {"id": "u-1", "username": "alice"}
        })
    }

    #[tokio::test]
    async fn test_login_activates_a_session_and_reads_hit_the_cache() {
        let transport = MockTransport::new(|request| {
            if request.url.contains("/auth/login") {
                Ok(MockTransport::ok(login_response()))
            } else {
                Ok(MockTransport::ok(json!({"username": "alice"})))
            }
        });
        let client = client_with(transport.clone());

        let session = client.login("alice", "p@ss").await.unwrap();
        assert_eq!(session.profile.username, "alice");
        assert!(client.is_authenticated().await);
        assert_eq!(client.active_session().await.unwrap().id, "u-1");

        client.get("/profile", None).await.unwrap();
        client.get("/profile", None).await.unwrap();
        // Second read inside the TTL never touched the network.
        assert_eq!(transport.count_to("/profile"), 1);
    }

    #[tokio::test]
    async fn test_login_surfaces_field_level_validation_errors() {
        let transport = MockTransport::new(|_| {
            Ok(MockTransport::status(
                422,
                r#"{"message": "invalid credentials", "errors": {"password": "incorrect"}}"#,
            ))
        });
        let client = client_with(transport);

        match client.login("alice", "wrong").await.unwrap_err() {
            ApiError::Validation { message, details } => {
                assert_eq!(message, "invalid credentials");
                assert_eq!(details.unwrap()["password"], "incorrect");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!client.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_logout_after_login_returns_to_the_anonymous_state() {
        let transport = MockTransport::new(|request| {
            if request.url.contains("/auth/login") {
                Ok(MockTransport::ok(login_response()))
            } else {
                Ok(MockTransport::ok(json!({})))
            }
        });
        let client = client_with(transport.clone());

        client.login("alice", "p@ss").await.unwrap();
        client.logout().await.unwrap();
        client.logout().await.unwrap();

        assert!(!client.is_authenticated().await);
        assert!(client.sessions().await.is_empty());
        assert_eq!(transport.count_to("/auth/logout"), 1);
    }
}
