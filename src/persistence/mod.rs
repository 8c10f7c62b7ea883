use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::path::{Path, PathBuf};
use tokio::time::{timeout, Duration};

use crate::error::BotError;
use crate::execution::TrackerBook;
use crate::Result;

/// Durable home of the symbol -> tracker map
#[async_trait]
pub trait TrackerStore: Send + Sync {
    /// Load the saved book; missing or unreadable data yields an empty book
    async fn load(&self) -> Result<TrackerBook>;

    async fn save(&self, book: &TrackerBook) -> Result<()>;
}

/// Parse a stored snapshot, falling back to an empty book on corruption
fn decode_book(raw: &str, origin: &str) -> TrackerBook {
    match serde_json::from_str::<TrackerBook>(raw) {
        Ok(book) => book,
        Err(e) => {
            tracing::warn!("Tracker store {} is corrupt ({}), starting empty", origin, e);
            TrackerBook::new()
        }
    }
}

fn encode_book(book: &TrackerBook) -> Result<String> {
    serde_json::to_string_pretty(book)
        .map_err(|e| BotError::Persistence(format!("failed to encode trackers: {}", e)))
}

/// JSON file store; writes go to a sibling temp file then rename over the target
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TrackerStore for JsonFileStore {
    async fn load(&self) -> Result<TrackerBook> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => {
                let book = decode_book(&raw, &self.path.display().to_string());
                tracing::info!("Loaded {} trackers from {}", book.len(), self.path.display());
                Ok(book)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No tracker file at {}, starting empty", self.path.display());
                Ok(TrackerBook::new())
            }
            Err(e) => {
                tracing::warn!("Failed to read {} ({}), starting empty", self.path.display(), e);
                Ok(TrackerBook::new())
            }
        }
    }

    async fn save(&self, book: &TrackerBook) -> Result<()> {
        let encoded = encode_book(book)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, encoded).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::debug!("Saved {} trackers to {}", book.len(), self.path.display());
        Ok(())
    }
}

/// Redis store: the whole book as one JSON string value
pub struct RedisTrackerStore {
    conn: ConnectionManager,
    key: String,
}

impl RedisTrackerStore {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    /// * `key` - key holding the serialized book
    pub async fn connect(redis_url: &str, key: impl Into<String>) -> Result<Self> {
        let client = Client::open(redis_url)?;

        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| BotError::Persistence("Redis connection timeout after 5 seconds".into()))??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            key: key.into(),
        })
    }
}

#[async_trait]
impl TrackerStore for RedisTrackerStore {
    async fn load(&self) -> Result<TrackerBook> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(&self.key).await?;
        let book = match raw {
            Some(raw) => decode_book(&raw, &self.key),
            None => TrackerBook::new(),
        };
        tracing::info!("Loaded {} trackers from Redis key {}", book.len(), self.key);
        Ok(book)
    }

    async fn save(&self, book: &TrackerBook) -> Result<()> {
        let mut conn = self.conn.clone();
        let encoded = encode_book(book)?;
        conn.set::<_, _, ()>(&self.key, encoded).await?;
        tracing::debug!("Saved {} trackers to Redis key {}", book.len(), self.key);
        Ok(())
    }
}
