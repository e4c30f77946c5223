//! loopline-core - client services for the Loopline app.
//!
//! This crate is the session and API-client subsystem the UI layers sit
//! on: token lifecycle with single-flight refresh, authenticated request
//! dispatch with retry and caching, same-tick read batching,
//! multi-account session switching, and the realtime channel.
//!
//! Entry point is [`Client`]; construct one per process with
//! [`Client::new`], or inject storage and transport with
//! [`Client::with_parts`]. UI collaborators subscribe to
//! [`SessionEvent`]s for auth prompts and session changes.

pub mod api;
pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod events;
pub mod models;
pub mod realtime;
pub mod store;

pub use api::{
    ApiError, BatchCoalescer, Dispatcher, HttpRequest, HttpResponse, HttpTransport, Method,
    ReqwestTransport, RequestOptions,
};
pub use auth::{Credential, SessionRegistry, TokenManager};
pub use cache::ResponseCache;
pub use client::Client;
pub use config::{ClientConfig, RetryPolicy};
pub use events::{EventBus, SessionEvent};
pub use models::{Session, UserProfile};
pub use realtime::{ChannelStatus, RealtimeChannel, RealtimeMessage};
pub use store::{FileStore, KeyValueStore, KeychainStore, MemoryStore};
