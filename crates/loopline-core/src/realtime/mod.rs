//! Realtime channel.
//!
//! A persistent socket authenticated with the same access token the
//! dispatcher uses, with reconnect backoff and a one-shot long-polling
//! fallback.

pub mod channel;

pub use channel::{ChannelStatus, RealtimeChannel, RealtimeMessage};
