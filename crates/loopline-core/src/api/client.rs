//! Authenticated request dispatch.
//!
//! [`Dispatcher`] executes resilient HTTP calls on behalf of the UI
//! layer: it consults the response cache, attaches bearer tokens, retries
//! transient failures with exponential backoff, and recovers from 401s
//! through the token manager's single-flight refresh.
//!
//! Requests that arrive while a refresh is in flight are parked in a FIFO
//! queue and replayed in arrival order by one drain task after the
//! refresh settles - so replay order is a structural property, not a
//! scheduling accident. A parked request is replayed at most once and
//! never triggers a second refresh.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::auth::tokens::TokenGate;
use crate::auth::TokenManager;
use crate::cache::ResponseCache;
use crate::config::{ClientConfig, RetryPolicy};

use super::transport::{canonical_query, HttpRequest, HttpTransport, Method};
use super::ApiError;

/// Per-request knobs. Defaults: authenticated, uncached, shared timeout.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Cache the response (reads only) under the endpoint+params key.
    pub cache: bool,
    /// Skip the bearer token (login/register endpoints).
    pub unauthenticated: bool,
    /// Override the client-wide request timeout.
    pub timeout: Option<Duration>,
    /// Cache prefix invalidated by a successful mutation; defaults to the
    /// request's own endpoint.
    pub invalidate_prefix: Option<String>,
}

impl RequestOptions {
    pub fn cached() -> Self {
        Self {
            cache: true,
            ..Self::default()
        }
    }

    pub fn unauthenticated() -> Self {
        Self {
            unauthenticated: true,
            ..Self::default()
        }
    }
}

#[derive(Clone)]
struct RequestParts {
    method: Method,
    endpoint: String,
    params: Option<Value>,
    options: RequestOptions,
}

struct PendingRequest {
    parts: RequestParts,
    resolve: oneshot::Sender<Result<Value, ApiError>>,
}

/// Queue of requests parked during a refresh, plus whether a drain task
/// is armed. Both live under one lock so exactly one drain runs at a
/// time and no parked request can be stranded.
#[derive(Default)]
struct PendingQueue {
    items: VecDeque<PendingRequest>,
    draining: bool,
}

pub struct Dispatcher {
    transport: Arc<dyn HttpTransport>,
    tokens: Arc<TokenManager>,
    cache: Arc<Mutex<ResponseCache>>,
    base_url: String,
    retry: RetryPolicy,
    request_timeout: Duration,
    pending: Mutex<PendingQueue>,
}

/// Cache key for a read: endpoint plus canonical query digest.
pub(crate) fn cache_key(endpoint: &str, params: Option<&Value>) -> String {
    match params {
        Some(params) => {
            let query = canonical_query(params);
            if query.is_empty() {
                endpoint.to_string()
            } else {
                format!("{endpoint}?{query}")
            }
        }
        None => endpoint.to_string(),
    }
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        tokens: Arc<TokenManager>,
        cache: Arc<Mutex<ResponseCache>>,
        config: &ClientConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            tokens,
            cache,
            base_url: config.api_base_url.clone(),
            retry: config.retry.clone(),
            request_timeout: config.request_timeout,
            pending: Mutex::new(PendingQueue::default()),
        })
    }

    /// Execute one logical request. Cancellation is dropping the returned
    /// future; it never cancels a shared refresh or other parked requests.
    pub async fn request(
        self: &Arc<Self>,
        method: Method,
        endpoint: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value, ApiError> {
        let parts = RequestParts {
            method,
            endpoint: endpoint.to_string(),
            params,
            options,
        };

        if let Some(key) = Self::read_cache_key(&parts) {
            if let Some(hit) = self.cache.lock().await.get(&key) {
                debug!(endpoint, "cache hit");
                return Ok(hit);
            }
        }

        if !parts.options.unauthenticated {
            match self.tokens.poll_token().await? {
                TokenGate::Ready(_) => {}
                TokenGate::Refreshing => {
                    let result = self.park(parts.clone()).await;
                    return self.finish(&parts, result).await;
                }
            }
        }

        let result = self.dispatch(parts.clone(), true).await;
        self.finish(&parts, result).await
    }

    /// The retry loop around one network exchange. `allow_refresh` is
    /// false on replays so a request can never chase 401s in a loop.
    async fn dispatch(
        self: &Arc<Self>,
        parts: RequestParts,
        allow_refresh: bool,
    ) -> Result<Value, ApiError> {
        let mut attempt: u32 = 0;
        loop {
            let bearer = if parts.options.unauthenticated {
                None
            } else {
                Some(
                    self.tokens
                        .current_token()
                        .await
                        .ok_or(ApiError::NotAuthenticated)?,
                )
            };

            let retryable = match self.transport.execute(self.build(&parts, bearer)).await {
                Ok(response) if response.status == 401 && !parts.options.unauthenticated => {
                    if !allow_refresh {
                        return Err(ApiError::NotAuthenticated);
                    }
                    // Kick off (or join) the single-flight refresh, then
                    // park for an in-order replay.
                    self.tokens.ensure_refresh_started().await?;
                    return self.park(parts).await;
                }
                Ok(response) if response.is_success() => {
                    if response.body.is_empty() {
                        return Ok(Value::Null);
                    }
                    return response.json::<Value>();
                }
                Ok(response) => {
                    let err = ApiError::from_status(response.status, &response.body);
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    err
                }
                Err(err) if err.is_retryable() => err,
                Err(err) => return Err(err),
            };

            attempt += 1;
            if attempt >= self.retry.max_attempts {
                return Err(retryable);
            }
            let delay = self.retry.delay(attempt);
            warn!(
                endpoint = %parts.endpoint,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %retryable,
                "transient failure, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Park a request until the in-flight refresh settles. The first
    /// parked request arms the drain task.
    ///
    /// Returns a boxed future (rather than `async fn`) because `park` and
    /// `dispatch`/`drain` recurse into each other across a `tokio::spawn`
    /// boundary; boxing here breaks the otherwise-cyclic opaque future
    /// type so the compiler can prove the spawned task is `Send`.
    fn park(self: &Arc<Self>, parts: RequestParts) -> BoxFuture<'_, Result<Value, ApiError>> {
        Box::pin(async move {
            let (tx, rx) = oneshot::channel();
            {
                let mut queue = self.pending.lock().await;
                queue.items.push_back(PendingRequest {
                    parts,
                    resolve: tx,
                });
                if !queue.draining {
                    queue.draining = true;
                    let dispatcher = Arc::clone(self);
                    tokio::spawn(async move { dispatcher.drain().await });
                }
            }
            rx.await
                .map_err(|_| ApiError::NetworkTransient("request dropped during replay".into()))?
        })
    }

    /// Replay parked requests in arrival order once the refresh settles.
    /// A failed refresh rejects every parked request with that failure;
    /// the `AuthRequired` notification is the token manager's, emitted
    /// once, not per request.
    async fn drain(self: Arc<Self>) {
        loop {
            let settled = self.tokens.wait_refresh_settled().await;
            let batch: Vec<PendingRequest> = {
                let mut queue = self.pending.lock().await;
                queue.items.drain(..).collect()
            };
            if !batch.is_empty() {
                debug!(
                    count = batch.len(),
                    ok = settled.is_ok(),
                    "replaying requests parked during refresh"
                );
            }
            for pending in batch {
                let result = match &settled {
                    Ok(_) => self.dispatch(pending.parts, false).await,
                    Err(err) => Err(err.clone()),
                };
                let _ = pending.resolve.send(result);
            }

            let mut queue = self.pending.lock().await;
            if queue.items.is_empty() {
                queue.draining = false;
                return;
            }
            // New arrivals parked under another refresh; go around again.
        }
    }

    /// Apply cache effects to a finished request.
    async fn finish(
        &self,
        parts: &RequestParts,
        result: Result<Value, ApiError>,
    ) -> Result<Value, ApiError> {
        if let Ok(value) = &result {
            if let Some(key) = Self::read_cache_key(parts) {
                self.cache.lock().await.insert(key, value.clone());
            } else if !parts.method.is_read() {
                let prefix = parts
                    .options
                    .invalidate_prefix
                    .clone()
                    .unwrap_or_else(|| parts.endpoint.clone());
                self.cache.lock().await.invalidate_prefix(&prefix);
            }
        }
        result
    }

    fn read_cache_key(parts: &RequestParts) -> Option<String> {
        (parts.method.is_read() && parts.options.cache)
            .then(|| cache_key(&parts.endpoint, parts.params.as_ref()))
    }

    fn build(&self, parts: &RequestParts, bearer: Option<String>) -> HttpRequest {
        let url = if parts.method.is_read() {
            match &parts.params {
                Some(params) => {
                    let query = canonical_query(params);
                    if query.is_empty() {
                        format!("{}{}", self.base_url, parts.endpoint)
                    } else {
                        format!("{}{}?{}", self.base_url, parts.endpoint, query)
                    }
                }
                None => format!("{}{}", self.base_url, parts.endpoint),
            }
        } else {
            format!("{}{}", self.base_url, parts.endpoint)
        };

        HttpRequest {
            method: parts.method,
            url,
            bearer,
            body: (!parts.method.is_read())
                .then(|| parts.params.clone())
                .flatten(),
            timeout: Some(parts.options.timeout.unwrap_or(self.request_timeout)),
        }
    }
}
