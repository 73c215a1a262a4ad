use crate::domain::session::{ApiKey, SessionName, SessionRecord};
use crate::ports::session::{AuthState, AuthStateRepository, SessionKeyRepository};
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS session_keys (
    session_id TEXT PRIMARY KEY NOT NULL,
    api_key    TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS auth_sessions (
    session_id TEXT PRIMARY KEY NOT NULL,
    payload    TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

#[derive(Debug, PartialEq, Eq)]
enum DatabaseLocation {
    Memory,
    File(PathBuf),
}

fn parse_database_url(url: &str) -> anyhow::Result<DatabaseLocation> {
    let url = url.trim();
    if url.is_empty() {
        bail!("database url is empty");
    }
    if url == "sqlite::memory:" || url == ":memory:" {
        return Ok(DatabaseLocation::Memory);
    }
    if let Some(path) = url.strip_prefix("sqlite://") {
        if path.is_empty() {
            bail!("database url {url} has no path");
        }
        return Ok(DatabaseLocation::File(PathBuf::from(path)));
    }
    if let Some(path) = url.strip_prefix("sqlite:") {
        return Ok(DatabaseLocation::File(PathBuf::from(path)));
    }
    if let Some((scheme, _)) = url.split_once("://") {
        bail!("unsupported database scheme '{scheme}' (expected sqlite)");
    }
    Ok(DatabaseLocation::File(PathBuf::from(url)))
}

/// Shared SQLite handle; every statement runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabase {
    async fn call<F, T>(&self, op: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| anyhow!("sqlite connection lock poisoned"))?;
            op(&guard).map_err(anyhow::Error::from)
        })
        .await
        .context("sqlite task join")?
    }
}

/// Opens (creating if needed) the bridge database and applies the schema.
pub fn open_database(url: &str) -> anyhow::Result<SqliteDatabase> {
    let conn = match parse_database_url(url)? {
        DatabaseLocation::Memory => {
            Connection::open_in_memory().context("opening in-memory sqlite database")?
        }
        DatabaseLocation::File(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating database directory {}", parent.display()))?;
            }
            let conn = Connection::open(&path)
                .with_context(|| format!("opening sqlite database {}", path.display()))?;
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
                .context("configuring sqlite pragmas")?;
            conn
        }
    };
    conn.execute_batch(SCHEMA_SQL)
        .context("applying bridge schema")?;
    Ok(SqliteDatabase {
        conn: Arc::new(Mutex::new(conn)),
    })
}

fn parse_timestamp(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .with_context(|| format!("invalid stored timestamp {raw}"))
}

#[derive(Clone)]
pub struct SqliteSessionKeyRepository {
    db: SqliteDatabase,
}

impl SqliteSessionKeyRepository {
    pub fn new(db: SqliteDatabase) -> Self {
        Self { db }
    }

    fn decode(row: (String, String, String)) -> anyhow::Result<SessionRecord> {
        let (session_id, api_key, created_at) = row;
        Ok(SessionRecord {
            session_id: SessionName::new(session_id).map_err(|err| anyhow!(err))?,
            api_key: ApiKey::parse(api_key).map_err(|err| anyhow!(err))?,
            created_at: parse_timestamp(&created_at)?,
        })
    }
}

#[async_trait]
impl SessionKeyRepository for SqliteSessionKeyRepository {
    async fn find(&self, session_id: &SessionName) -> anyhow::Result<Option<SessionRecord>> {
        let id = session_id.as_str().to_string();
        let row: Option<(String, String, String)> = self
            .db
            .call(move |conn| {
                conn.query_row(
                    "SELECT session_id, api_key, created_at FROM session_keys WHERE session_id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()
            })
            .await
            .context("loading session record")?;
        row.map(Self::decode).transpose()
    }

    async fn insert_if_absent(&self, record: SessionRecord) -> anyhow::Result<SessionRecord> {
        let id = record.session_id.as_str().to_string();
        let key = record.api_key.as_str().to_string();
        let created_at = record.created_at.to_rfc3339();
        let row: (String, String, String) = self
            .db
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO session_keys (session_id, api_key, created_at) VALUES (?1, ?2, ?3)",
                    params![id, key, created_at],
                )?;
                conn.query_row(
                    "SELECT session_id, api_key, created_at FROM session_keys WHERE session_id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
            })
            .await
            .context("storing session record")?;
        Self::decode(row)
    }
}

#[derive(Clone)]
pub struct SqliteAuthStateRepository {
    db: SqliteDatabase,
}

impl SqliteAuthStateRepository {
    pub fn new(db: SqliteDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AuthStateRepository for SqliteAuthStateRepository {
    async fn load(&self, session_id: &SessionName) -> anyhow::Result<Option<AuthState>> {
        let id = session_id.as_str().to_string();
        let row: Option<(String, String)> = self
            .db
            .call(move |conn| {
                conn.query_row(
                    "SELECT payload, updated_at FROM auth_sessions WHERE session_id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
            })
            .await
            .context("loading auth state")?;
        let Some((payload, updated_at)) = row else {
            return Ok(None);
        };
        Ok(Some(AuthState {
            session_id: session_id.clone(),
            payload: serde_json::from_str(&payload).context("parsing stored auth state")?,
            updated_at: parse_timestamp(&updated_at)?,
        }))
    }

    async fn save(&self, state: AuthState) -> anyhow::Result<()> {
        let id = state.session_id.as_str().to_string();
        let payload = serde_json::to_string(&state.payload)?;
        let updated_at = state.updated_at.to_rfc3339();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO auth_sessions (session_id, payload, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(session_id) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
                    params![id, payload, updated_at],
                )
            })
            .await
            .context("saving auth state")?;
        Ok(())
    }

    async fn remove(&self, session_id: &SessionName) -> anyhow::Result<()> {
        let id = session_id.as_str().to_string();
        self.db
            .call(move |conn| {
                conn.execute("DELETE FROM auth_sessions WHERE session_id = ?1", params![id])
            })
            .await
            .context("removing auth state")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn session() -> SessionName {
        SessionName::new("whatsapp").unwrap()
    }

    #[test]
    fn parses_supported_urls() {
        assert_eq!(
            parse_database_url("sqlite::memory:").unwrap(),
            DatabaseLocation::Memory
        );
        assert_eq!(
            parse_database_url("sqlite:///var/lib/wabridge.db").unwrap(),
            DatabaseLocation::File(PathBuf::from("/var/lib/wabridge.db"))
        );
        assert_eq!(
            parse_database_url("data/bridge.db").unwrap(),
            DatabaseLocation::File(PathBuf::from("data/bridge.db"))
        );
        assert!(parse_database_url("mongodb://localhost/whatsapp").is_err());
        assert!(parse_database_url("  ").is_err());
    }

    #[tokio::test]
    async fn session_key_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let url = format!("sqlite://{}", temp.path().join("nested/bridge.db").display());

        let repo = SqliteSessionKeyRepository::new(open_database(&url).unwrap());
        let record = SessionRecord::new(session(), ApiKey::generate().unwrap());
        let stored = repo.insert_if_absent(record.clone()).await.unwrap();
        assert_eq!(stored.api_key, record.api_key);
        drop(repo);

        let reopened = SqliteSessionKeyRepository::new(open_database(&url).unwrap());
        let found = reopened.find(&session()).await.unwrap().unwrap();
        assert_eq!(found.api_key, record.api_key);
    }

    #[tokio::test]
    async fn insert_if_absent_keeps_existing_key() {
        let repo = SqliteSessionKeyRepository::new(open_database("sqlite::memory:").unwrap());
        let first = SessionRecord::new(session(), ApiKey::parse("first").unwrap());
        let second = SessionRecord::new(session(), ApiKey::parse("second").unwrap());
        repo.insert_if_absent(first).await.unwrap();
        let stored = repo.insert_if_absent(second).await.unwrap();
        assert_eq!(stored.api_key.as_str(), "first");
    }

    #[tokio::test]
    async fn auth_state_upserts_and_removes() {
        let db = open_database("sqlite::memory:").unwrap();
        let repo = SqliteAuthStateRepository::new(db);
        assert!(repo.load(&session()).await.unwrap().is_none());

        repo.save(AuthState::new(session(), json!({"token": "one"})))
            .await
            .unwrap();
        repo.save(AuthState::new(session(), json!({"token": "two"})))
            .await
            .unwrap();
        let loaded = repo.load(&session()).await.unwrap().unwrap();
        assert_eq!(loaded.payload, json!({"token": "two"}));

        repo.remove(&session()).await.unwrap();
        assert!(repo.load(&session()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stores_share_one_database() {
        let db = open_database("sqlite::memory:").unwrap();
        let keys = SqliteSessionKeyRepository::new(db.clone());
        let auth = SqliteAuthStateRepository::new(db);
        keys.insert_if_absent(SessionRecord::new(session(), ApiKey::parse("k").unwrap()))
            .await
            .unwrap();
        auth.save(AuthState::new(session(), json!({})))
            .await
            .unwrap();
        assert!(keys.find(&session()).await.unwrap().is_some());
        assert!(auth.load(&session()).await.unwrap().is_some());
    }
}
