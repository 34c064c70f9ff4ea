//! Keyed blob store for finished recordings, backed by SQLite.
//!
//! Every logical operation opens its own connection. A save against a
//! connection whose schema lacks the `videos` container closes it, reopens
//! one version higher to force the upgrade step, and retries exactly once.

use crate::schema::{open_schema, StoreSchema, VIDEOS};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use facecap_core::recorder::{ArtifactSink, BoxError};
use facecap_core::types::{export_file_name, parse_key_timestamp};
use facecap_core::{VideoArtifact, VIDEO_MIME_TYPE};
use rusqlite::{params, ErrorCode, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store is blocked by another open connection")]
    Blocked,
    #[error("an artifact with key {0} already exists")]
    DuplicateKey(String),
    #[error("no artifact with key {0}")]
    NotFound(String),
    #[error("unsupported mime type: {0}")]
    UnsupportedMimeType(String),
    #[error("store schema has no videos container")]
    StaleSchema,
    #[error("store transaction failed: {0}")]
    Transaction(#[source] tokio_rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        if let tokio_rusqlite::Error::Rusqlite(inner) = &err {
            if matches!(
                inner.sqlite_error_code(),
                Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            ) {
                return StoreError::Blocked;
            }
            if is_missing_container(inner) {
                return StoreError::StaleSchema;
            }
        }
        StoreError::Transaction(err)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        tokio_rusqlite::Error::Rusqlite(err).into()
    }
}

fn is_missing_container(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.starts_with("no such table"))
}

fn is_constraint_violation(err: &tokio_rusqlite::Error) -> bool {
    matches!(
        err,
        tokio_rusqlite::Error::Rusqlite(inner)
            if inner.sqlite_error_code() == Some(ErrorCode::ConstraintViolation)
    )
}

/// One row of the catalog listing.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactSummary {
    pub key: String,
    pub size: u64,
    pub mime_type: String,
    /// Recovered from the key's numeric suffix; `None` for foreign keys.
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub handle: PlayableHandle,
}

/// Lazy reference to a stored payload, resolved on playback.
#[derive(Debug, Clone)]
pub struct PlayableHandle {
    store: VideoStore,
    key: String,
}

impl PlayableHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Read the full payload.
    pub async fn read(&self) -> Result<Vec<u8>, StoreError> {
        Ok(self.store.load(&self.key).await?.into_blob())
    }
}

/// A connection plus the schema it was opened against.
pub struct StoreConnection {
    conn: Connection,
    schema: StoreSchema,
}

impl StoreConnection {
    pub fn schema(&self) -> &StoreSchema {
        &self.schema
    }

    /// Insert `artifact`; `StaleSchema` if the connection predates the container.
    pub async fn insert(&self, artifact: &VideoArtifact) -> Result<(), StoreError> {
        if !self.schema.has_container(VIDEOS) {
            return Err(StoreError::StaleSchema);
        }

        let key = artifact.key().to_string();
        let row = (key.clone(), artifact.blob().to_vec(), artifact.mime_type().to_string(), artifact.size());
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO videos (key, blob, mime_type, size) VALUES (?1, ?2, ?3, ?4)",
                    params![row.0, row.1, row.2, row.3 as i64],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    StoreError::DuplicateKey(key)
                } else {
                    e.into()
                }
            })
    }

    async fn summaries(&self) -> Result<Vec<(String, u64, String)>, StoreError> {
        if !self.schema.has_container(VIDEOS) {
            return Ok(Vec::new());
        }
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT key, size, mime_type FROM videos")?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(|(key, size, mime)| (key, u64::try_from(size).unwrap_or(0), mime))
            .collect())
    }

    async fn get(&self, key: &str) -> Result<VideoArtifact, StoreError> {
        if !self.schema.has_container(VIDEOS) {
            return Err(StoreError::NotFound(key.to_string()));
        }
        let lookup = key.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT blob, mime_type FROM videos WHERE key = ?1",
                        params![lookup],
                        |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?)),
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;

        let (blob, mime_type) = row.ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Ok(VideoArtifact::with_key(key, blob, mime_type))
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        if !self.schema.has_container(VIDEOS) {
            return Err(StoreError::NotFound(key.to_string()));
        }
        let target = key.to_string();
        let removed = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM videos WHERE key = ?1", params![target])?))
            .await?;
        if removed == 0 {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(())
    }

    pub async fn close(self) -> Result<(), StoreError> {
        self.conn.close().await?;
        Ok(())
    }
}

/// Handle to the on-disk store. Cheap to clone; holds no open connection.
#[derive(Debug, Clone)]
pub struct VideoStore {
    path: Arc<PathBuf>,
    min_version: u32,
}

impl VideoStore {
    pub fn new(path: impl Into<PathBuf>, min_version: u32) -> Self {
        Self {
            path: Arc::new(path.into()),
            min_version: min_version.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open (creating if absent) at `min_version` or the stored version,
    /// whichever is higher. Fails with `Blocked` under lock contention.
    pub async fn open(&self, min_version: u32) -> Result<StoreConnection, StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let conn = Connection::open(self.path.as_path()).await?;
        let schema = conn.call(move |c| Ok(open_schema(c, min_version)?)).await?;
        tracing::debug!(path = %self.path.display(), version = schema.version, containers = ?schema.containers, "store opened");
        Ok(StoreConnection { conn, schema })
    }

    /// Persist `artifact`, repairing a stale schema with one forced upgrade.
    pub async fn save(&self, artifact: &VideoArtifact) -> Result<(), StoreError> {
        if artifact.mime_type() != VIDEO_MIME_TYPE {
            return Err(StoreError::UnsupportedMimeType(artifact.mime_type().to_string()));
        }

        let conn = self.open(self.min_version).await?;
        self.save_on(conn, artifact).await
    }

    /// Insert through `conn`. On `StaleSchema` the connection is closed and
    /// replaced by one opened a version higher, and the insert is retried
    /// once. The last connection used is always closed.
    async fn save_on(&self, mut conn: StoreConnection, artifact: &VideoArtifact) -> Result<(), StoreError> {
        let mut upgraded = false;
        loop {
            let result = conn.insert(artifact).await;
            match result {
                Err(StoreError::StaleSchema) if !upgraded => {
                    let next = conn.schema().version + 1;
                    tracing::warn!(version = conn.schema().version, next, "store schema stale; forcing upgrade");
                    conn.close().await?;
                    conn = self.open(next).await?;
                    upgraded = true;
                }
                result => {
                    close_quietly(conn).await;
                    if result.is_ok() {
                        tracing::info!(key = artifact.key(), size = artifact.size(), "artifact stored");
                    }
                    return result;
                }
            }
        }
    }

    /// Every stored artifact, most recently created first.
    pub async fn list_all(&self) -> Result<Vec<ArtifactSummary>, StoreError> {
        let conn = self.open(self.min_version).await?;
        let rows = conn.summaries().await;
        close_quietly(conn).await;

        let mut summaries: Vec<ArtifactSummary> = rows?
            .into_iter()
            .map(|(key, size, mime_type)| ArtifactSummary {
                created_at: parse_key_timestamp(&key),
                handle: PlayableHandle {
                    store: self.clone(),
                    key: key.clone(),
                },
                key,
                size,
                mime_type,
            })
            .collect();

        // `None` sorts below every timestamp, so foreign keys land last.
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.key.cmp(&a.key)));
        Ok(summaries)
    }

    /// Remove one artifact. `NotFound` when already gone.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.open(self.min_version).await?;
        let result = conn.remove(key).await;
        close_quietly(conn).await;
        if result.is_ok() {
            tracing::info!(key, "artifact deleted");
        }
        result
    }

    pub async fn load(&self, key: &str) -> Result<VideoArtifact, StoreError> {
        let conn = self.open(self.min_version).await?;
        let result = conn.get(key).await;
        close_quietly(conn).await;
        result
    }

    /// Write the artifact to `dir` as `face-recording-<key>.webm`.
    pub async fn export(&self, key: &str, dir: &Path) -> Result<PathBuf, StoreError> {
        let artifact = self.load(key).await?;
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(export_file_name(key));
        tokio::fs::write(&path, artifact.blob()).await?;
        tracing::info!(key, path = %path.display(), "artifact exported");
        Ok(path)
    }
}

async fn close_quietly(conn: StoreConnection) {
    if let Err(e) = conn.close().await {
        tracing::debug!(error = %e, "store connection close failed");
    }
}

#[async_trait]
impl ArtifactSink for VideoStore {
    async fn save(&self, artifact: &VideoArtifact) -> Result<(), BoxError> {
        VideoStore::save(self, artifact).await.map_err(Into::into)
    }
}
