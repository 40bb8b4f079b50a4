use crate::chat::SessionCollection;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{sqlite::SqliteConnectOptions, ConnectOptions, Row, SqlitePool};
use std::{path::Path, str::FromStr, sync::Mutex};
use tracing::warn;

/// Key the session collection is stored under.
pub const CHAT_HISTORY_KEY: &str = "chatHistory";

/// Durable home of the session collection. Saves overwrite the whole blob.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn load(&self) -> Result<Option<SessionCollection>>;
    async fn save(&self, collection: &SessionCollection) -> Result<()>;
}

/// Parse a stored blob. A corrupt blob is logged and treated as absent.
fn decode(raw: &str) -> Option<SessionCollection> {
    match serde_json::from_str(raw) {
        Ok(collection) => Some(collection),
        Err(e) => {
            warn!("Discarding unreadable chat history: {}", e);
            None
        }
    }
}

#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new store.
    /// This will automatically create the database file if it doesn't exist.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Ok(Self { pool })
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read key")?;

        row.map(|r| r.try_get::<String, _>("value"))
            .transpose()
            .context("Failed to decode stored value")
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv (key, value)
            VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .context("Failed to write key")?;

        Ok(())
    }
}

#[async_trait]
impl Persistence for SqliteStore {
    async fn load(&self) -> Result<Option<SessionCollection>> {
        Ok(self.get(CHAT_HISTORY_KEY).await?.as_deref().and_then(decode))
    }

    async fn save(&self, collection: &SessionCollection) -> Result<()> {
        let raw = serde_json::to_string(collection).context("Failed to encode chat history")?;
        self.set(CHAT_HISTORY_KEY, &raw).await
    }
}

/// Process-local store holding the serialized blob, as a browser tab would.
/// Selected with `PINEAI_DB_PATH=:memory:`; history is lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blob: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn with_raw(raw: impl Into<String>) -> Self {
        Self {
            blob: Mutex::new(Some(raw.into())),
        }
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn load(&self) -> Result<Option<SessionCollection>> {
        let blob = self.blob.lock().unwrap();
        Ok(blob.as_deref().and_then(decode))
    }

    async fn save(&self, collection: &SessionCollection) -> Result<()> {
        let raw = serde_json::to_string(collection).context("Failed to encode chat history")?;
        *self.blob.lock().unwrap() = Some(raw);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{Message, Session};

    fn sample() -> SessionCollection {
        let mut session = Session::new("1700000000000", None);
        session.messages.push(Message::user("Show me COGS"));
        session.messages.push(Message::assistant("Here it is"));
        SessionCollection::new(vec![session])
    }

    #[tokio::test]
    async fn sqlite_store_overwrites_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("nested").join("pine.db"))
            .await
            .unwrap();
        store.init().await.unwrap();

        assert_eq!(store.load().await.unwrap(), None);

        let collection = sample();
        store.save(&collection).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(collection));

        let empty = SessionCollection::new(vec![]);
        store.save(&empty).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(empty));
    }

    #[tokio::test]
    async fn sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pine.db");
        let collection = sample();

        let first = SqliteStore::new(&path).await.unwrap();
        first.init().await.unwrap();
        first.save(&collection).await.unwrap();

        let second = SqliteStore::new(&path).await.unwrap();
        second.init().await.unwrap();
        assert_eq!(second.load().await.unwrap(), Some(collection));
    }

    #[tokio::test]
    async fn corrupt_blob_loads_as_absent() {
        let store = MemoryStore::with_raw("{not json");
        assert_eq!(store.load().await.unwrap(), None);
    }
}
