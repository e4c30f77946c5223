//! Token lifecycle management.
//!
//! [`TokenManager`] owns the active session's credential and guarantees
//! that at most one refresh call is ever outstanding. The refresh state
//! machine is explicit - `Idle` or `InFlight` with a waiter list - so
//! callers that arrive mid-refresh subscribe to the in-flight outcome
//! instead of issuing a second network call. The refresh itself runs in a
//! detached task: cancelling the caller that started it cannot abort the
//! refresh other waiters depend on.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::api::transport::{HttpRequest, HttpTransport, Method};
use crate::api::ApiError;
use crate::config::{ClientConfig, RetryPolicy};
use crate::events::{EventBus, SessionEvent};
use crate::models::RefreshResponse;
use crate::store::{credential_key, KeyValueStore};

use super::Credential;

/// What the dispatcher sees when it asks for a token without committing
/// to wait.
pub(crate) enum TokenGate {
    Ready(String),
    /// A refresh is (now) in flight; the request should be parked and
    /// replayed after it settles.
    Refreshing,
}

enum RefreshState {
    Idle,
    InFlight {
        waiters: Vec<oneshot::Sender<Result<Credential, ApiError>>>,
    },
}

struct TokenState {
    user_id: Option<String>,
    credential: Option<Credential>,
    /// Bumped on install/invalidate/restore. A settling refresh whose
    /// epoch no longer matches belongs to a superseded session and must
    /// not write its outcome into current state.
    epoch: u64,
    refresh: RefreshState,
}

pub struct TokenManager {
    transport: Arc<dyn HttpTransport>,
    secure: Arc<dyn KeyValueStore>,
    events: EventBus,
    base_url: String,
    request_timeout: Duration,
    refresh_margin_minutes: i64,
    refresh_retry_limit: u32,
    retry: RetryPolicy,
    state: Mutex<TokenState>,
}

impl TokenManager {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        secure: Arc<dyn KeyValueStore>,
        events: EventBus,
        config: &ClientConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            secure,
            events,
            base_url: config.api_base_url.clone(),
            request_timeout: config.request_timeout,
            refresh_margin_minutes: config.refresh_margin_minutes,
            refresh_retry_limit: config.refresh_retry_limit,
            retry: config.retry.clone(),
            state: Mutex::new(TokenState {
                user_id: None,
                credential: None,
                epoch: 0,
                refresh: RefreshState::Idle,
            }),
        })
    }

    /// Seed state from the secure partition for the given account.
    /// Returns whether a stored credential was found.
    pub async fn restore(&self, user_id: &str) -> Result<bool, ApiError> {
        let stored = self
            .secure
            .get(&credential_key(user_id))
            .map_err(ApiError::storage)?;
        let credential = stored.and_then(|body| match serde_json::from_str::<Credential>(&body) {
            Ok(credential) => Some(credential),
            Err(err) => {
                warn!(error = %err, "stored credential is corrupt, ignoring");
                None
            }
        });

        let found = credential.is_some();
        let mut state = self.state.lock().await;
        state.user_id = Some(user_id.to_string());
        state.credential = credential;
        state.epoch += 1;
        Ok(found)
    }

    /// Swap in a credential obtained from login, registration, or a
    /// session switch, persisting it to the secure partition.
    pub async fn install(&self, user_id: &str, credential: Credential) -> Result<(), ApiError> {
        let body =
            serde_json::to_string(&credential).map_err(|err| ApiError::Storage(err.to_string()))?;
        self.secure
            .put(&credential_key(user_id), &body)
            .map_err(ApiError::storage)?;

        let mut state = self.state.lock().await;
        state.user_id = Some(user_id.to_string());
        state.credential = Some(credential);
        state.epoch += 1;
        Ok(())
    }

    /// Clear the credential without a backend call (logout, session
    /// switch). Idempotent.
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        if state.credential.is_none() && state.user_id.is_none() {
            return;
        }
        state.credential = None;
        state.epoch += 1;
        if let Some(user_id) = state.user_id.take() {
            self.wipe(&user_id);
        }
        debug!("credential invalidated");
    }

    /// The stored access token, with no freshness check.
    pub async fn current_token(&self) -> Option<String> {
        let state = self.state.lock().await;
        state
            .credential
            .as_ref()
            .map(|credential| credential.access_token.clone())
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state.lock().await.credential.is_some()
    }

    /// A currently-valid access token, refreshing first when the stored
    /// one is inside the refresh margin. Unknown expiry is returned as-is;
    /// validation is then deferred to the dispatcher's 401 handling.
    pub async fn get_valid_token(self: &Arc<Self>) -> Result<String, ApiError> {
        match self.poll_token().await? {
            TokenGate::Ready(token) => Ok(token),
            TokenGate::Refreshing => self.wait_refresh_settled().await,
        }
    }

    /// Non-committal token check for the dispatcher: either a usable
    /// token, or notice that a refresh is in flight (starting one if the
    /// stored token is stale).
    pub(crate) async fn poll_token(self: &Arc<Self>) -> Result<TokenGate, ApiError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if matches!(state.refresh, RefreshState::InFlight { .. }) {
            return Ok(TokenGate::Refreshing);
        }
        let credential = state.credential.as_ref().ok_or(ApiError::NotAuthenticated)?;
        if credential.needs_refresh(self.refresh_margin_minutes) {
            debug!("access token inside refresh margin, refreshing before dispatch");
            let refresh_token = credential.refresh_token.clone();
            let epoch = state.epoch;
            state.refresh = RefreshState::InFlight {
                waiters: Vec::new(),
            };
            self.spawn_driver(refresh_token, epoch);
            return Ok(TokenGate::Refreshing);
        }
        Ok(TokenGate::Ready(credential.access_token.clone()))
    }

    /// Refresh the credential, coalescing with any refresh already in
    /// flight. A failed refresh is terminal: the credential is cleared and
    /// `AuthRequired` is emitted exactly once.
    pub async fn refresh(self: &Arc<Self>) -> Result<Credential, ApiError> {
        let rx = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let (tx, rx) = oneshot::channel();
            match &mut state.refresh {
                RefreshState::InFlight { waiters } => waiters.push(tx),
                RefreshState::Idle => {
                    let credential =
                        state.credential.as_ref().ok_or(ApiError::NotAuthenticated)?;
                    let refresh_token = credential.refresh_token.clone();
                    let epoch = state.epoch;
                    state.refresh = RefreshState::InFlight { waiters: vec![tx] };
                    self.spawn_driver(refresh_token, epoch);
                }
            }
            rx
        };
        rx.await
            .map_err(|_| ApiError::RefreshFailed("refresh task dropped".into()))?
    }

    /// Start a refresh if none is in flight, without subscribing to its
    /// outcome. Used by the dispatcher's 401 recovery before parking.
    pub(crate) async fn ensure_refresh_started(self: &Arc<Self>) -> Result<(), ApiError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if matches!(state.refresh, RefreshState::InFlight { .. }) {
            return Ok(());
        }
        let credential = state.credential.as_ref().ok_or(ApiError::NotAuthenticated)?;
        let refresh_token = credential.refresh_token.clone();
        let epoch = state.epoch;
        state.refresh = RefreshState::InFlight {
            waiters: Vec::new(),
        };
        self.spawn_driver(refresh_token, epoch);
        Ok(())
    }

    pub(crate) async fn refresh_in_flight(&self) -> bool {
        matches!(
            self.state.lock().await.refresh,
            RefreshState::InFlight { .. }
        )
    }

    /// Access token once any in-flight refresh has settled; immediate when
    /// the state is idle. Used by the replay drain.
    pub(crate) async fn wait_refresh_settled(&self) -> Result<String, ApiError> {
        let rx = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            match &mut state.refresh {
                RefreshState::Idle => {
                    return state
                        .credential
                        .as_ref()
                        .map(|credential| credential.access_token.clone())
                        .ok_or(ApiError::NotAuthenticated);
                }
                RefreshState::InFlight { waiters } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
            }
        };
        let credential = rx
            .await
            .map_err(|_| ApiError::RefreshFailed("refresh task dropped".into()))??;
        Ok(credential.access_token)
    }

    fn spawn_driver(self: &Arc<Self>, refresh_token: String, epoch: u64) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let result = manager.execute_refresh(refresh_token).await;
            manager.settle(epoch, result).await;
        });
    }

    /// The network half of a refresh. Transient failures (network, 429,
    /// 5xx) are retried up to `refresh_retry_limit` times with the shared
    /// backoff; anything else is terminal immediately.
    async fn execute_refresh(&self, refresh_token: String) -> Result<Credential, ApiError> {
        let url = format!("{}/auth/refresh", self.base_url);
        let mut attempt: u32 = 0;
        loop {
            let request = HttpRequest {
                method: Method::Post,
                url: url.clone(),
                bearer: None,
                body: Some(json!({ "refreshToken": refresh_token })),
                timeout: Some(self.request_timeout),
            };
            let transient = match self.transport.execute(request).await {
                Ok(response) if response.is_success() => {
                    let parsed: RefreshResponse = response
                        .json()
                        .map_err(|err| ApiError::RefreshFailed(err.to_string()))?;
                    let rotated = parsed
                        .refresh_token
                        .unwrap_or_else(|| refresh_token.clone());
                    return Ok(Credential::from_expires_in(
                        parsed.access_token,
                        rotated,
                        parsed.expires_in,
                    ));
                }
                Ok(response) if response.status == 429 || (500..600).contains(&response.status) => {
                    ApiError::from_status(response.status, &response.body)
                }
                Ok(response) => {
                    return Err(ApiError::RefreshFailed(format!(
                        "refresh rejected with status {}",
                        response.status
                    )));
                }
                Err(err) => err,
            };

            if attempt >= self.refresh_retry_limit {
                return Err(ApiError::RefreshFailed(transient.to_string()));
            }
            attempt += 1;
            warn!(attempt, error = %transient, "transient failure during token refresh, backing off");
            tokio::time::sleep(self.retry.delay(attempt)).await;
        }
    }

    /// Apply a refresh outcome and release every waiter with it.
    async fn settle(&self, epoch: u64, result: Result<Credential, ApiError>) {
        let mut emit_auth_required = false;
        let (waiters, outcome) = {
            let mut state = self.state.lock().await;
            let waiters = match std::mem::replace(&mut state.refresh, RefreshState::Idle) {
                RefreshState::InFlight { waiters } => waiters,
                RefreshState::Idle => Vec::new(),
            };

            if state.epoch != epoch {
                // The session switched or logged out mid-refresh; this
                // outcome belongs to the old session and must not touch
                // current state.
                debug!("discarding refresh outcome for a superseded session");
                let stale: Result<Credential, ApiError> =
                    Err(ApiError::RefreshFailed("session changed during refresh".into()));
                (waiters, stale)
            } else {
                match result {
                    Ok(credential) => {
                        state.credential = Some(credential.clone());
                        if let Some(user_id) = &state.user_id {
                            self.persist(user_id, &credential);
                        }
                        info!("access token refreshed");
                        (waiters, Ok(credential))
                    }
                    Err(err) => {
                        state.credential = None;
                        if let Some(user_id) = state.user_id.take() {
                            self.wipe(&user_id);
                        }
                        warn!(error = %err, "token refresh failed; session requires re-authentication");
                        emit_auth_required = true;
                        (waiters, Err(err))
                    }
                }
            }
        };

        if emit_auth_required {
            self.events.emit(SessionEvent::AuthRequired);
        }
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn persist(&self, user_id: &str, credential: &Credential) {
        let result = serde_json::to_string(credential)
            .map_err(anyhow::Error::from)
            .and_then(|body| self.secure.put(&credential_key(user_id), &body));
        if let Err(err) = result {
            warn!(error = %err, "failed to persist refreshed credential");
        }
    }

    fn wipe(&self, user_id: &str) {
        if let Err(err) = self.secure.delete(&credential_key(user_id)) {
            warn!(error = %err, "failed to clear stored credential");
        }
    }
}
