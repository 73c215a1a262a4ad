use crate::domain::session::{ApiKey, SessionName, SessionRecord};
use crate::ports::session::SessionKeyRepository;
use anyhow::anyhow;
use tracing::info;

/// Loads the API key for `session_id`, creating the record on first use.
///
/// A record inserted concurrently by another process wins; its key is returned.
pub async fn ensure_session_record(
    keys: &dyn SessionKeyRepository,
    session_id: &SessionName,
) -> anyhow::Result<ApiKey> {
    if let Some(record) = keys.find(session_id).await? {
        return Ok(record.api_key);
    }
    let generated = ApiKey::generate().map_err(|err| anyhow!(err))?;
    let stored = keys
        .insert_if_absent(SessionRecord::new(session_id.clone(), generated.clone()))
        .await?;
    if stored.api_key == generated {
        info!(session = %session_id, api_key = %stored.api_key.redacted(), "session record created");
    } else {
        info!(session = %session_id, "session record created concurrently; reusing stored key");
    }
    Ok(stored.api_key)
}
