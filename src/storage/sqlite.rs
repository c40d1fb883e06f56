//! SQLite storage implementation.
//!
//! This module provides a SQLite-based implementation of the `SectionStore`
//! trait. It uses rusqlite for database access and stores embeddings as
//! little-endian `f32` BLOBs. Similarity is computed in process over the
//! sections that pass the filter.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{
    check_dimension, rank_candidates, similarity, ScoredSection, SectionFilter, SectionStore,
    StorageError, StorageResult, UpsertOutcome,
};
use crate::models::{EmbeddingConfig, PaperMetadata, PaperSection, SectionKey};

const CONFIG_KEY: &str = "embedding";

/// SQLite-based section storage.
///
/// # Schema
/// The database contains two tables:
/// - `config`: (key TEXT PRIMARY KEY, value TEXT) holding the embedding
///   configuration as JSON
/// - `sections`: one row per (paper_id, section_name) with the section text,
///   provenance, metadata JSON and embedding BLOB. `seq` is assigned on first
///   insert and survives later upserts.
#[derive(Clone)]
pub struct SqliteStorage {
    /// Path of the database file, `None` for an in-memory database
    db_path: Option<PathBuf>,

    connection: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (or create) the database at `db_path`.
    ///
    /// Parent directories are created as needed.
    ///
    /// # Errors
    /// Returns `StorageError::ConnectionError` if the file cannot be opened
    pub fn open(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::ConnectionError(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let connection = Connection::open(&db_path)
            .map_err(|e| StorageError::ConnectionError(format!("{}: {e}", db_path.display())))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .map_err(|e| StorageError::ConnectionError(e.to_string()))?;
        connection
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(|e| StorageError::ConnectionError(e.to_string()))?;

        Ok(Self {
            db_path: Some(db_path),
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> StorageResult<Self> {
        let connection =
            Connection::open_in_memory().map_err(|e| StorageError::ConnectionError(e.to_string()))?;
        Ok(Self {
            db_path: None,
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Run `f` with the connection on the blocking thread pool.
    async fn with_connection<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&mut Connection) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let connection = Arc::clone(&self.connection);
        tokio::task::spawn_blocking(move || {
            let mut guard = connection
                .lock()
                .map_err(|_| StorageError::Other("database lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Other(format!("storage task failed: {e}")))?
    }
}

fn create_schema(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS config (
             key   TEXT PRIMARY KEY,
             value TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS sections (
             seq            INTEGER PRIMARY KEY AUTOINCREMENT,
             paper_id       TEXT NOT NULL,
             section_name   TEXT NOT NULL,
             paper_title    TEXT NOT NULL,
             paper_url      TEXT NOT NULL,
             content        TEXT NOT NULL,
             metadata       TEXT NOT NULL,
             embedding      BLOB NOT NULL,
             UNIQUE (paper_id, section_name)
         );
         CREATE INDEX IF NOT EXISTS idx_sections_paper ON sections (paper_id);",
    )
    .map_err(|e| StorageError::SchemaError(e.to_string()))
}

fn read_config(conn: &Connection) -> StorageResult<Option<EmbeddingConfig>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM config WHERE key = ?1",
            params![CONFIG_KEY],
            |row| row.get(0),
        )
        .optional()?;

    raw.map(|json| {
        serde_json::from_str(&json).map_err(|e| StorageError::SerializationError(e.to_string()))
    })
    .transpose()
}

fn require_config(conn: &Connection) -> StorageResult<EmbeddingConfig> {
    read_config(conn)?.ok_or(StorageError::MissingConfig)
}

/// Serialize an embedding vector to bytes for BLOB storage.
fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Deserialize an embedding vector from BLOB bytes.
///
/// # Errors
/// Returns `StorageError::SerializationError` if the byte length is not a
/// multiple of four
fn deserialize_embedding(bytes: &[u8]) -> StorageResult<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(StorageError::SerializationError(format!(
            "embedding blob has {} bytes, not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

struct SectionRow {
    seq: i64,
    paper_id: String,
    section_name: String,
    paper_title: String,
    paper_url: String,
    content: String,
    metadata: String,
    embedding: Vec<u8>,
}

impl SectionRow {
    fn into_section(self) -> StorageResult<(i64, PaperSection)> {
        let metadata: PaperMetadata = serde_json::from_str(&self.metadata)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        let section = PaperSection {
            key: SectionKey::new(self.paper_id, self.section_name),
            paper_title: self.paper_title,
            paper_url: self.paper_url,
            text: self.content,
            embedding: deserialize_embedding(&self.embedding)?,
            metadata,
        };
        Ok((self.seq, section))
    }
}

#[async_trait]
impl SectionStore for SqliteStorage {
    async fn initialize(&self) -> StorageResult<()> {
        self.with_connection(|conn| create_schema(conn)).await
    }

    async fn store_config(&self, config: &EmbeddingConfig) -> StorageResult<()> {
        let json =
            serde_json::to_string(config).map_err(|e| StorageError::SerializationError(e.to_string()))?;
        self.with_connection(move |conn| {
            conn.execute(
                "INSERT INTO config (key, value) VALUES (?1, ?2)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                params![CONFIG_KEY, json],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_config(&self) -> StorageResult<Option<EmbeddingConfig>> {
        self.with_connection(|conn| read_config(conn)).await
    }

    async fn upsert_section(&self, section: &PaperSection) -> StorageResult<UpsertOutcome> {
        let section = section.clone();
        self.with_connection(move |conn| {
            let config = require_config(conn)?;
            check_dimension(&config, &section.embedding)?;

            let metadata = serde_json::to_string(&section.metadata)
                .map_err(|e| StorageError::SerializationError(e.to_string()))?;

            let tx = conn.transaction()?;
            let existed: bool = tx.query_row(
                "SELECT EXISTS (SELECT 1 FROM sections WHERE paper_id = ?1 AND section_name = ?2)",
                params![section.key.paper_id, section.key.section_name],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO sections
                     (paper_id, section_name, paper_title, paper_url, content, metadata, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (paper_id, section_name) DO UPDATE SET
                     paper_title = excluded.paper_title,
                     paper_url   = excluded.paper_url,
                     content     = excluded.content,
                     metadata    = excluded.metadata,
                     embedding   = excluded.embedding",
                params![
                    section.key.paper_id,
                    section.key.section_name,
                    section.paper_title,
                    section.paper_url,
                    section.text,
                    metadata,
                    serialize_embedding(&section.embedding),
                ],
            )?;
            tx.commit()?;

            Ok(if existed {
                UpsertOutcome::Updated
            } else {
                UpsertOutcome::Inserted
            })
        })
        .await
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&SectionFilter>,
    ) -> StorageResult<Vec<ScoredSection>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let vector = vector.to_vec();
        let filter = filter.filter(|f| !f.is_empty()).cloned();

        self.with_connection(move |conn| {
            let Some(config) = read_config(conn)? else {
                return Ok(Vec::new());
            };
            check_dimension(&config, &vector)?;

            let mut stmt = conn.prepare(
                "SELECT seq, paper_id, section_name, paper_title, paper_url, content, metadata, embedding
                 FROM sections ORDER BY seq",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(SectionRow {
                    seq: row.get(0)?,
                    paper_id: row.get(1)?,
                    section_name: row.get(2)?,
                    paper_title: row.get(3)?,
                    paper_url: row.get(4)?,
                    content: row.get(5)?,
                    metadata: row.get(6)?,
                    embedding: row.get(7)?,
                })
            })?;

            let mut candidates = Vec::new();
            for row in rows {
                let (sequence, section) = row?.into_section()?;
                if filter.as_ref().is_some_and(|f| !f.matches(&section)) {
                    continue;
                }
                let score = similarity(config.metric, &vector, &section.embedding);
                candidates.push(ScoredSection {
                    section,
                    score,
                    sequence,
                });
            }

            debug!(candidates = candidates.len(), k, metric = %config.metric, "scored sections");
            Ok(rank_candidates(candidates, k))
        })
        .await
    }

    async fn count_sections(&self) -> StorageResult<usize> {
        self.with_connection(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM sections", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    async fn paper_ids(&self) -> StorageResult<Vec<String>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT paper_id FROM sections ORDER BY paper_id")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(ids)
        })
        .await
    }

    async fn reset(&self) -> StorageResult<()> {
        self.with_connection(|conn| {
            conn.execute("DELETE FROM sections", [])?;
            Ok(())
        })
        .await
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::QueryError(e.to_string())
    }
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("db_path", &self.db_path)
            .finish()
    }
}
