use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Access/refresh token pair for one account.
///
/// Owned exclusively by the token manager; persisted in the secure
/// partition; mutated only by login, refresh, and logout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    /// Absent when the backend does not report expiry; validity is then
    /// established lazily by the dispatcher's 401 handling.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Build from an auth response's `expiresIn` seconds.
    pub fn from_expires_in(
        access_token: String,
        refresh_token: String,
        expires_in: Option<i64>,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at: expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
        }
    }

    /// Whether the access token is inside the refresh margin. Unknown
    /// expiry never triggers a proactive refresh.
    pub fn needs_refresh(&self, margin_minutes: i64) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now() + Duration::minutes(margin_minutes) >= expires_at,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(expires_in_secs: Option<i64>) -> Credential {
        Credential::from_expires_in("A1".into(), "R1".into(), expires_in_secs)
    }

    #[test]
    fn test_unknown_expiry_never_needs_refresh() {
        assert!(!credential(None).needs_refresh(5));
    }

    #[test]
    fn test_expiry_inside_margin_needs_refresh() {
        // 30 seconds away: inside the 5 minute margin.
        assert!(credential(Some(30)).needs_refresh(5));
        // Already expired.
        assert!(credential(Some(-10)).needs_refresh(5));
    }

    #[test]
    fn test_expiry_outside_margin_is_fresh() {
        assert!(!credential(Some(30 * 60)).needs_refresh(5));
    }
}
