use crate::session::Session;
use async_trait::async_trait;
use dashmap::DashMap;
use gatehouse_core::GatewayResult;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: &Session) -> GatewayResult<()>;
    async fn get(&self, id: &str) -> GatewayResult<Option<Session>>;
    /// Replace a stored session. Returns `false` and stores nothing if the
    /// session is gone, so a concurrent delete is never undone.
    async fn update(&self, session: &Session) -> GatewayResult<bool>;
    /// Returns `true` if a session was removed.
    async fn delete(&self, id: &str) -> GatewayResult<bool>;
    async fn list(&self) -> GatewayResult<Vec<String>>;

    /// Remove every session expired at `now_millis`, returning how many went.
    async fn purge_expired(&self, now_millis: u64) -> GatewayResult<usize> {
        let mut removed = 0;
        for id in self.list().await? {
            if let Some(session) = self.get(&id).await? {
                if session.is_expired(now_millis) && self.delete(&id).await? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// In-process session store, sharded by session id.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, Session>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: &Session) -> GatewayResult<()> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> GatewayResult<Option<Session>> {
        Ok(self.sessions.get(id).map(|s| s.value().clone()))
    }

    async fn update(&self, session: &Session) -> GatewayResult<bool> {
        match self.sessions.get_mut(&session.id) {
            Some(mut stored) => {
                *stored = session.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: &str) -> GatewayResult<bool> {
        Ok(self.sessions.remove(id).is_some())
    }

    async fn list(&self) -> GatewayResult<Vec<String>> {
        Ok(self.sessions.iter().map(|e| e.key().clone()).collect())
    }

    async fn purge_expired(&self, now_millis: u64) -> GatewayResult<usize> {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !s.is_expired(now_millis));
        Ok(before.saturating_sub(self.sessions.len()))
    }
}
