use crate::domain::session::{SessionName, SessionRecord};
use crate::ports::session::{AuthState, AuthStateRepository, SessionKeyRepository};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct InMemorySessionKeyRepository {
    inner: RwLock<HashMap<SessionName, SessionRecord>>,
}

impl InMemorySessionKeyRepository {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SessionKeyRepository for InMemorySessionKeyRepository {
    async fn find(&self, session_id: &SessionName) -> anyhow::Result<Option<SessionRecord>> {
        Ok(self.inner.read().await.get(session_id).cloned())
    }

    async fn insert_if_absent(&self, record: SessionRecord) -> anyhow::Result<SessionRecord> {
        let mut guard = self.inner.write().await;
        let stored = guard
            .entry(record.session_id.clone())
            .or_insert(record)
            .clone();
        Ok(stored)
    }
}

#[derive(Default)]
pub struct InMemoryAuthStateRepository {
    inner: RwLock<HashMap<SessionName, AuthState>>,
}

impl InMemoryAuthStateRepository {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl AuthStateRepository for InMemoryAuthStateRepository {
    async fn load(&self, session_id: &SessionName) -> anyhow::Result<Option<AuthState>> {
        Ok(self.inner.read().await.get(session_id).cloned())
    }

    async fn save(&self, state: AuthState) -> anyhow::Result<()> {
        self.inner
            .write()
            .await
            .insert(state.session_id.clone(), state);
        Ok(())
    }

    async fn remove(&self, session_id: &SessionName) -> anyhow::Result<()> {
        self.inner.write().await.remove(session_id);
        Ok(())
    }
}
