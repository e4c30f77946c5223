use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::api::transport::{HttpRequest, HttpTransport, Method};
use crate::auth::TokenManager;
use crate::config::{ClientConfig, RetryPolicy};
use crate::events::{EventBus, SessionEvent};

/// Close code the backend uses for an expired or invalid token.
const CLOSE_UNAUTHORIZED: u16 = 4401;

/// Fan-out capacity for incoming messages; a subscriber that stops
/// reading lags instead of growing an unbounded queue.
const INCOMING_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Idle,
    Connecting,
    Connected,
    /// Websocket gave up; running on the long-polling fallback.
    Polling,
    /// Both transports failed; a reconnect requires a new `connect()`.
    Offline,
}

/// One event frame from the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeMessage {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

enum SocketOutcome {
    /// The server refused or revoked the token.
    AuthRejected,
    Dropped { reason: String, was_connected: bool },
}

/// Live socket sharing the dispatcher's credential. Connects lazily on
/// first use; auth-class errors go through the token manager's
/// single-flight `refresh()` - the channel never refreshes on its own.
pub struct RealtimeChannel {
    transport: Arc<dyn HttpTransport>,
    tokens: Arc<TokenManager>,
    events: EventBus,
    ws_url: String,
    poll_url: String,
    retry: RetryPolicy,
    request_timeout: Duration,
    status_tx: watch::Sender<ChannelStatus>,
    incoming_tx: broadcast::Sender<RealtimeMessage>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeChannel {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        tokens: Arc<TokenManager>,
        events: EventBus,
        config: &ClientConfig,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(ChannelStatus::Idle);
        let (incoming_tx, _) = broadcast::channel(INCOMING_CAPACITY);
        Arc::new(Self {
            transport,
            tokens,
            events,
            ws_url: config.ws_url.clone(),
            poll_url: format!("{}/realtime/poll", config.api_base_url),
            retry: config.retry.clone(),
            request_timeout: config.request_timeout,
            status_tx,
            incoming_tx,
            task: Mutex::new(None),
        })
    }

    /// Observe connection state; the receiver starts at the current value.
    pub fn status(&self) -> watch::Receiver<ChannelStatus> {
        self.status_tx.subscribe()
    }

    /// Receive incoming messages. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeMessage> {
        self.incoming_tx.subscribe()
    }

    /// Start the connection loop if it is not already running.
    pub async fn connect(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if let Some(handle) = task.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        let channel = Arc::clone(self);
        *task = Some(tokio::spawn(async move { channel.run().await }));
    }

    pub async fn close(&self) {
        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            handle.abort();
        }
        self.set_status(ChannelStatus::Idle);
    }

    async fn run(self: Arc<Self>) {
        let mut attempts: u32 = 0;
        loop {
            let token = match self.tokens.get_valid_token().await {
                Ok(token) => token,
                Err(err) => {
                    warn!(error = %err, "realtime channel has no usable token");
                    self.go_offline();
                    return;
                }
            };

            self.set_status(ChannelStatus::Connecting);
            match self.run_socket(&token).await {
                SocketOutcome::AuthRejected => {
                    info!("realtime token rejected, requesting refresh");
                    if self.tokens.refresh().await.is_err() {
                        self.go_offline();
                        return;
                    }
                    attempts = 0;
                }
                SocketOutcome::Dropped {
                    reason,
                    was_connected,
                } => {
                    if was_connected {
                        attempts = 0;
                    }
                    attempts += 1;
                    if attempts >= self.retry.max_attempts {
                        warn!(reason = %reason, "websocket retries exhausted, falling back to polling");
                        self.set_status(ChannelStatus::Polling);
                        self.poll_fallback().await;
                        self.go_offline();
                        return;
                    }
                    let delay = self.retry.delay(attempts);
                    debug!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "websocket reconnect backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One socket lifetime: connect, pump frames, classify the exit.
    async fn run_socket(&self, token: &str) -> SocketOutcome {
        let request = match self.handshake_request(token) {
            Ok(request) => request,
            Err(reason) => {
                return SocketOutcome::Dropped {
                    reason,
                    was_connected: false,
                }
            }
        };
        let (stream, _) = match connect_async(request).await {
            Ok(connected) => connected,
            Err(WsError::Http(response)) if response.status().as_u16() == 401 => {
                return SocketOutcome::AuthRejected;
            }
            Err(err) => {
                return SocketOutcome::Dropped {
                    reason: err.to_string(),
                    was_connected: false,
                }
            }
        };

        self.set_status(ChannelStatus::Connected);
        info!("realtime channel connected");

        let (mut sink, mut source) = stream.split();
        while let Some(frame) = source.next().await {
            match frame {
                Ok(Message::Text(text)) => self.deliver(&text),
                Ok(Message::Ping(payload)) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Ok(Message::Close(Some(frame)))
                    if u16::from(frame.code) == CLOSE_UNAUTHORIZED =>
                {
                    return SocketOutcome::AuthRejected;
                }
                Ok(Message::Close(_)) => {
                    return SocketOutcome::Dropped {
                        reason: "closed by server".into(),
                        was_connected: true,
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    return SocketOutcome::Dropped {
                        reason: err.to_string(),
                        was_connected: true,
                    }
                }
            }
        }
        SocketOutcome::Dropped {
            reason: "stream ended".into(),
            was_connected: true,
        }
    }

    /// The websocket handshake carries the same bearer token as HTTP
    /// dispatch.
    fn handshake_request(&self, token: &str) -> Result<Request, String> {
        let mut request = self
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|err| err.to_string())?;
        let value =
            HeaderValue::from_str(&format!("Bearer {token}")).map_err(|err| err.to_string())?;
        request.headers_mut().insert(AUTHORIZATION, value);
        Ok(request)
    }

    /// Alternate transport, used once after websocket retries are
    /// exhausted: long-poll the backend until a poll fails.
    async fn poll_fallback(&self) {
        info!("realtime channel running on long-polling fallback");
        loop {
            let token = match self.tokens.get_valid_token().await {
                Ok(token) => token,
                Err(_) => return,
            };
            let request = HttpRequest {
                method: Method::Get,
                url: self.poll_url.clone(),
                bearer: Some(token),
                body: None,
                timeout: Some(self.request_timeout),
            };
            let response = match self.transport.execute(request).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(error = %err, "long poll failed");
                    return;
                }
            };
            match response.status {
                200 => match serde_json::from_str::<Vec<RealtimeMessage>>(&response.body) {
                    Ok(messages) => {
                        for message in messages {
                            let _ = self.incoming_tx.send(message);
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "could not parse poll payload");
                        return;
                    }
                },
                // Empty poll window; go again.
                204 => {}
                401 => {
                    if self.tokens.refresh().await.is_err() {
                        return;
                    }
                }
                status => {
                    warn!(status, "long poll rejected");
                    return;
                }
            }
        }
    }

    fn deliver(&self, text: &str) {
        match serde_json::from_str::<RealtimeMessage>(text) {
            Ok(message) => {
                debug!(event = %message.event, "realtime message");
                let _ = self.incoming_tx.send(message);
            }
            Err(err) => warn!(error = %err, "unparseable realtime frame"),
        }
    }

    fn set_status(&self, status: ChannelStatus) {
        self.status_tx.send_replace(status);
    }

    /// Persistent-disconnect signal: both transports are gone.
    fn go_offline(&self) {
        self.set_status(ChannelStatus::Offline);
        self.events.emit(SessionEvent::RealtimeOffline);
    }
}
