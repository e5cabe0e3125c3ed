use crate::session::Session;
use crate::store::SessionStore;
use gatehouse_core::{GatewayError, GatewayResult, SharedClock};
use gatehouse_security::{AuthClaims, JwtCodec, TokenPayload};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Issues, refreshes and expires sessions.
///
/// Each session's token is an HS256 JWT whose `jti` is the session id and
/// whose grants sit under `claims`.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    codec: JwtCodec,
    expiration: Duration,
    clock: SharedClock,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        codec: JwtCodec,
        expiration: Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            codec,
            expiration,
            clock,
        }
    }

    fn expiration_millis(&self) -> u64 {
        u64::try_from(self.expiration.as_millis()).unwrap_or(u64::MAX)
    }

    fn mint(&self, id: &str, owner: &AuthClaims, now_millis: u64, expires_at: u64) -> GatewayResult<(String, AuthClaims)> {
        let iat = now_millis / 1000;
        let exp = expires_at / 1000;
        let payload = TokenPayload {
            sub: owner.sub.clone(),
            roles: BTreeSet::new(),
            permissions: BTreeSet::new(),
            claims: Some(owner.grants()),
            iat,
            exp,
            jti: Some(id.to_string()),
        };
        let token = self
            .codec
            .encode(&payload)
            .map_err(|e| GatewayError::Session(format!("failed to sign session token: {e}")))?;
        Ok((token, AuthClaims::from(payload)))
    }

    /// Open a session for an authenticated caller.
    pub async fn create(&self, owner: &AuthClaims) -> GatewayResult<Session> {
        let id = Uuid::new_v4().simple().to_string();
        let now = self.clock.now_millis();
        let expires_at = now.saturating_add(self.expiration_millis());
        let (token, claims) = self.mint(&id, owner, now, expires_at)?;

        let session = Session {
            id,
            claims,
            token,
            created_at: now,
            last_activity: now,
            expires_at,
        };
        self.store.create(&session).await?;
        info!(session_id = %session.id, subject = %session.claims.sub, "Session created");
        Ok(session)
    }

    /// Look up a live session, touching its activity timestamp.
    ///
    /// An expired session is removed and reported as absent.
    pub async fn get(&self, id: &str) -> GatewayResult<Option<Session>> {
        let Some(mut session) = self.store.get(id).await? else {
            return Ok(None);
        };
        let now = self.clock.now_millis();
        if session.is_expired(now) {
            self.store.delete(id).await?;
            debug!(session_id = %id, "Session expired on access");
            return Ok(None);
        }
        session.last_activity = now;
        if !self.store.update(&session).await? {
            debug!(session_id = %id, "Session deleted during access");
            return Ok(None);
        }
        Ok(Some(session))
    }

    /// Reissue the token of a live session with a fresh expiry.
    pub async fn refresh(&self, id: &str) -> GatewayResult<Option<Session>> {
        let Some(mut session) = self.get(id).await? else {
            return Ok(None);
        };
        let now = self.clock.now_millis();
        let expires_at = now.saturating_add(self.expiration_millis());
        let (token, claims) = self.mint(&session.id, &session.claims, now, expires_at)?;
        session.token = token;
        session.claims = claims;
        session.expires_at = expires_at;
        session.last_activity = now;
        if !self.store.update(&session).await? {
            debug!(session_id = %id, "Session deleted during refresh");
            return Ok(None);
        }
        info!(session_id = %session.id, "Session refreshed");
        Ok(Some(session))
    }

    /// Returns `true` if the session existed.
    pub async fn delete(&self, id: &str) -> GatewayResult<bool> {
        let removed = self.store.delete(id).await?;
        if removed {
            info!(session_id = %id, "Session deleted");
        }
        Ok(removed)
    }

    /// Whether a session exists and is unexpired, without touching it.
    pub async fn is_live(&self, id: &str) -> GatewayResult<bool> {
        let now = self.clock.now_millis();
        Ok(self
            .store
            .get(id)
            .await?
            .is_some_and(|s| !s.is_expired(now)))
    }

    /// Delete every expired session.
    pub async fn cleanup_expired(&self) -> GatewayResult<usize> {
        let removed = self.store.purge_expired(self.clock.now_millis()).await?;
        if removed > 0 {
            debug!(removed, "Expired sessions purged");
        }
        Ok(removed)
    }

    /// Number of stored sessions, expired ones included until purged.
    pub async fn count(&self) -> GatewayResult<usize> {
        Ok(self.store.list().await?.len())
    }

    /// The session lifetime.
    pub fn expiration(&self) -> Duration {
        self.expiration
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemorySessionStore;
    use gatehouse_core::ManualClock;

    fn owner() -> AuthClaims {
        let mut claims = AuthClaims::service(1_700_000_000);
        claims.sub = "alice".into();
        claims.roles.insert("operator".into());
        claims.permissions.insert("device:read".into());
        claims
    }

    fn manager(clock: Arc<ManualClock>) -> SessionManager {
        SessionManager::new(
            Arc::new(MemorySessionStore::new()),
            JwtCodec::new("secret"),
            Duration::from_secs(3600),
            clock,
        )
    }

    #[tokio::test]
    async fn test_create_embeds_session_id_in_token() {
        let clock = ManualClock::new(1_700_000_000_000);
        let mgr = manager(clock);
        let session = mgr.create(&owner()).await.unwrap();

        let payload: TokenPayload = JwtCodec::new("secret").decode(&session.token).unwrap();
        assert_eq!(payload.jti.as_deref(), Some(session.id.as_str()));
        assert_eq!(payload.exp, 1_700_000_000 + 3600);
        let grants = payload.claims.unwrap();
        assert!(grants.roles.contains("operator"));
        assert_eq!(session.claims.session_id.as_deref(), Some(session.id.as_str()));
        assert_eq!(session.id.len(), 32);
    }

    #[tokio::test]
    async fn test_get_touches_activity_not_expiry() {
        let clock = ManualClock::new(1_700_000_000_000);
        let mgr = manager(clock.clone());
        let session = mgr.create(&owner()).await.unwrap();

        clock.advance(Duration::from_secs(100));
        let fetched = mgr.get(&session.id).await.unwrap().unwrap();
        assert_eq!(fetched.last_activity, 1_700_000_100_000);
        assert_eq!(fetched.expires_at, session.expires_at);
    }

    #[tokio::test]
    async fn test_expired_session_is_removed_on_get() {
        let clock = ManualClock::new(1_700_000_000_000);
        let mgr = manager(clock.clone());
        let session = mgr.create(&owner()).await.unwrap();

        clock.advance(Duration::from_secs(3601));
        assert!(mgr.get(&session.id).await.unwrap().is_none());
        assert_eq!(mgr.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_refresh_keeps_id_and_extends() {
        let clock = ManualClock::new(1_700_000_000_000);
        let mgr = manager(clock.clone());
        let session = mgr.create(&owner()).await.unwrap();

        clock.advance(Duration::from_secs(1800));
        let refreshed = mgr.refresh(&session.id).await.unwrap().unwrap();
        assert_eq!(refreshed.id, session.id);
        assert_ne!(refreshed.token, session.token);
        assert_eq!(refreshed.expires_at, session.expires_at + 1_800_000);
        assert!(refreshed.claims.has_permission("device:read"));
    }

    #[tokio::test]
    async fn test_refresh_unknown_is_none() {
        let mgr = manager(ManualClock::new(0));
        assert!(mgr.refresh("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_and_cleanup() {
        let clock = ManualClock::new(1_700_000_000_000);
        let mgr = manager(clock.clone());
        let a = mgr.create(&owner()).await.unwrap();
        mgr.create(&owner()).await.unwrap();

        assert!(mgr.delete(&a.id).await.unwrap());
        assert!(!mgr.delete(&a.id).await.unwrap());
        assert!(!mgr.is_live(&a.id).await.unwrap());

        clock.advance(Duration::from_secs(4000));
        assert_eq!(mgr.cleanup_expired().await.unwrap(), 1);
        assert_eq!(mgr.count().await.unwrap(), 0);
    }
}
