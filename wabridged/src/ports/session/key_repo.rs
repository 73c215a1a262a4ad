use crate::domain::session::{SessionName, SessionRecord};
use async_trait::async_trait;

#[async_trait]
pub trait SessionKeyRepository: Send + Sync {
    async fn find(&self, session_id: &SessionName) -> anyhow::Result<Option<SessionRecord>>;

    /// Stores `record` unless one already exists for its session id.
    /// Returns the record that is stored after the call.
    async fn insert_if_absent(&self, record: SessionRecord) -> anyhow::Result<SessionRecord>;
}
