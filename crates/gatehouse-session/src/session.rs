use chrono::{DateTime, SecondsFormat, Utc};
use gatehouse_security::AuthClaims;
use serde::{Deserialize, Serialize};

/// A live session. Times are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub claims: AuthClaims,
    pub token: String,
    pub created_at: u64,
    pub last_activity: u64,
    pub expires_at: u64,
}

impl Session {
    /// Whether the session is past its absolute expiry at `now`.
    pub fn is_expired(&self, now_millis: u64) -> bool {
        now_millis > self.expires_at
    }

    /// Seconds of life left at `now`.
    pub fn remaining_secs(&self, now_millis: u64) -> u64 {
        self.expires_at.saturating_sub(now_millis) / 1000
    }

    /// Client-facing view: never includes the owner's full claim set.
    pub fn summary(&self, now_millis: u64) -> serde_json::Value {
        serde_json::json!({
            "session_id": self.id,
            "token": self.token,
            "subject": self.claims.sub,
            "created_at": rfc3339(self.created_at),
            "expires_at": rfc3339(self.expires_at),
            "expires_in": self.remaining_secs(now_millis),
        })
    }
}

fn rfc3339(millis: u64) -> String {
    i64::try_from(millis)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session {
            id: "s1".into(),
            claims: AuthClaims::service(0),
            token: "t".into(),
            created_at: 1_700_000_000_000,
            last_activity: 1_700_000_000_000,
            expires_at: 1_700_000_060_000,
        }
    }

    #[test]
    fn test_expiry_boundary() {
        let s = session();
        assert!(!s.is_expired(s.expires_at));
        assert!(s.is_expired(s.expires_at + 1));
    }

    #[test]
    fn test_summary_formats_times() {
        let s = session();
        let v = s.summary(1_700_000_000_000);
        assert_eq!(v["session_id"], "s1");
        assert_eq!(v["expires_in"], 60);
        assert_eq!(v["created_at"], "2023-11-14T22:13:20Z");
    }
}
