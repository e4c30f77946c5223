//! Wire and domain types shared across the core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Denormalized snapshot of an account's public identity, embedded in its
/// [`Session`]. Refreshed from `GET /users/me`; never a second source of
/// truth for profile data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// One logged-in account. Many sessions may exist concurrently; exactly
/// one is active at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Stable user identifier; doubles as the credential storage key.
    pub id: String,
    pub profile: UserProfile,
    pub last_refresh: DateTime<Utc>,
}

impl Session {
    pub fn new(profile: UserProfile) -> Self {
        Self {
            id: profile.id.clone(),
            profile,
            last_refresh: Utc::now(),
        }
    }
}

/// Response shape of `POST /auth/login`, `POST /auth/register`, and
/// `POST /auth/switch`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    #[serde(default)]
    pub success: bool,
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds until the access token expires, when the backend reports it.
    #[serde(default)]
    pub expires_in: Option<i64>,
    pub user: UserProfile,
}

/// Response shape of `POST /auth/refresh`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
    /// Rotated refresh token; absent means the old one stays valid.
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}
