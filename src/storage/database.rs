//! SQLite-backed voicing store with an in-database cosine function
//!
//! Embeddings are stored as little-endian f32 blobs. Each pooled connection
//! registers a deterministic `cosine_sim(blob, blob)` scalar function, so the
//! nearest-neighbour query is evaluated entirely inside SQLite.

use super::StoreError;
use crate::error::{FretError, Result};
use crate::index::VoicingDocument;
use crate::strategy::{cosine_similarity, StoreHit, VectorStore};
use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS voicings (
        id TEXT PRIMARY KEY,
        chord_name TEXT NOT NULL,
        root_pitch_class INTEGER NOT NULL,
        pitch_classes TEXT NOT NULL,
        midi_notes TEXT NOT NULL,
        diagram TEXT NOT NULL,
        searchable_text TEXT NOT NULL,
        tags TEXT NOT NULL,
        embedding BLOB,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_voicings_chord_name ON voicings(chord_name);",
];

const DOCUMENT_COLUMNS: &str = "id, chord_name, root_pitch_class, pitch_classes, midi_notes, \
                                diagram, searchable_text, tags, embedding";

/// Store statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub documents: usize,
    pub embedded: usize,
}

pub struct SqliteVectorStore {
    pool: DbPool,
    path: PathBuf,
}

impl SqliteVectorStore {
    /// Open (or create) the store and run migrations
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FretError::Io {
                source: e,
                context: format!("Failed to create database directory: {:?}", parent),
            })?;
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA busy_timeout = 5000;
                ",
            )?;
            register_functions(conn)
        });

        let pool = Pool::builder().max_size(8).build(manager)?;

        let store = Self {
            pool,
            path: db_path.to_path_buf(),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Get a connection from the pool
    pub fn get_conn(
        &self,
    ) -> std::result::Result<r2d2::PooledConnection<SqliteConnectionManager>, StoreError> {
        Ok(self.pool.get()?)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.pool.get()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM _migrations",
            [],
            |row| row.get(0),
        )?;

        for (version, migration) in MIGRATIONS.iter().enumerate() {
            let version = version as i32 + 1;
            if version > current_version {
                tracing::info!("Applying migration {}", version);
                conn.execute_batch(migration)?;
                conn.execute(
                    "INSERT INTO _migrations (version, applied_at) VALUES (?1, datetime('now'))",
                    params![version],
                )?;
            }
        }

        Ok(())
    }

    /// Insert or replace a document
    pub fn upsert(&self, document: &VoicingDocument) -> std::result::Result<(), StoreError> {
        let conn = self.get_conn()?;
        upsert_with(&conn, document)
    }

    /// Insert or replace many documents in one transaction
    pub fn upsert_many(
        &self,
        documents: &[VoicingDocument],
    ) -> std::result::Result<usize, StoreError> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        for document in documents {
            upsert_with(&tx, document)?;
        }
        tx.commit()?;
        Ok(documents.len())
    }

    /// Delete a document; returns whether it existed
    pub fn remove(&self, id: &str) -> std::result::Result<bool, StoreError> {
        let conn = self.get_conn()?;
        let changed = conn.execute("DELETE FROM voicings WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn get(&self, id: &str) -> std::result::Result<Option<VoicingDocument>, StoreError> {
        let conn = self.get_conn()?;
        let document = conn
            .query_row(
                &format!("SELECT {} FROM voicings WHERE id = ?1", DOCUMENT_COLUMNS),
                params![id],
                row_to_document,
            )
            .optional()?;
        Ok(document)
    }

    /// Every stored document, ordered by id
    pub fn load_all(&self) -> std::result::Result<Vec<VoicingDocument>, StoreError> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM voicings ORDER BY id ASC",
            DOCUMENT_COLUMNS
        ))?;
        let rows = stmt.query_map([], row_to_document)?;
        let mut documents = Vec::new();
        for row in rows {
            documents.push(row?);
        }
        Ok(documents)
    }

    pub fn stats(&self) -> std::result::Result<StoreStats, StoreError> {
        let conn = self.get_conn()?;
        let (documents, embedded): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COUNT(embedding) FROM voicings",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(StoreStats {
            documents: documents as usize,
            embedded: embedded as usize,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn upsert_with(conn: &Connection, document: &VoicingDocument) -> std::result::Result<(), StoreError> {
    conn.execute(
        "INSERT INTO voicings (id, chord_name, root_pitch_class, pitch_classes, midi_notes,
                               diagram, searchable_text, tags, embedding, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(id) DO UPDATE SET
            chord_name = excluded.chord_name,
            root_pitch_class = excluded.root_pitch_class,
            pitch_classes = excluded.pitch_classes,
            midi_notes = excluded.midi_notes,
            diagram = excluded.diagram,
            searchable_text = excluded.searchable_text,
            tags = excluded.tags,
            embedding = excluded.embedding,
            updated_at = excluded.updated_at",
        params![
            document.id,
            document.chord_name,
            document.root_pitch_class,
            to_json(&document.pitch_classes)?,
            to_json(&document.midi_notes)?,
            document.diagram,
            document.searchable_text,
            to_json(&document.tags)?,
            document.embedding.as_deref().map(encode_vector),
            chrono::Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> std::result::Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Codec(e.to_string()))
}

fn row_to_document(row: &Row<'_>) -> rusqlite::Result<VoicingDocument> {
    let embedding: Option<Vec<u8>> = row.get(8)?;
    let embedding = match embedding {
        Some(bytes) => Some(decode_vector(&bytes).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                8,
                Type::Blob,
                "embedding blob length is not a multiple of 4".into(),
            )
        })?),
        None => None,
    };

    Ok(VoicingDocument {
        id: row.get(0)?,
        chord_name: row.get(1)?,
        root_pitch_class: row.get(2)?,
        pitch_classes: json_column(row, 3)?,
        midi_notes: json_column(row, 4)?,
        diagram: row.get(5)?,
        searchable_text: row.get(6)?,
        tags: json_column(row, 7)?,
        embedding,
    })
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "cosine_sim",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let stored: Option<Vec<u8>> = ctx.get(0)?;
            let query: Vec<u8> = ctx.get(1)?;
            let Some(stored) = stored else {
                return Ok(None);
            };
            match (decode_vector(&stored), decode_vector(&query)) {
                (Some(a), Some(b)) if a.len() == b.len() => {
                    Ok(Some(f64::from(cosine_similarity(&a, &b))))
                }
                _ => Ok(None),
            }
        },
    )
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

fn nearest_blocking(
    pool: &DbPool,
    query: &[f32],
    top_k: usize,
) -> std::result::Result<Vec<StoreHit>, StoreError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {}, score FROM (
            SELECT {}, cosine_sim(embedding, ?1) AS score
            FROM voicings
            WHERE embedding IS NOT NULL
         )
         WHERE score IS NOT NULL
         ORDER BY score DESC, id ASC
         LIMIT ?2",
        DOCUMENT_COLUMNS, DOCUMENT_COLUMNS
    ))?;

    let limit = i64::try_from(top_k).unwrap_or(i64::MAX);
    let rows = stmt.query_map(params![encode_vector(query), limit], |row| {
        let document = row_to_document(row)?;
        let score: f64 = row.get(9)?;
        Ok(StoreHit {
            document,
            score: score as f32,
        })
    })?;

    let mut hits = Vec::new();
    for row in rows {
        hits.push(row?);
    }
    Ok(hits)
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    fn describe(&self) -> String {
        format!("sqlite://{}", self.path.display())
    }

    async fn ping(&self) -> std::result::Result<(), StoreError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| StoreError::Unreachable(e.to_string()))?;
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    async fn nearest(
        &self,
        query: &[f32],
        top_k: usize,
    ) -> std::result::Result<Vec<StoreHit>, StoreError> {
        let pool = self.pool.clone();
        let query = query.to_vec();
        tokio::task::spawn_blocking(move || nearest_blocking(&pool, &query, top_k))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn doc(id: &str, name: &str, embedding: Option<Vec<f32>>) -> VoicingDocument {
        let mut doc = VoicingDocument::new(id, name, 0);
        doc.pitch_classes = vec![0, 4, 7];
        doc.tags = vec!["triad".to_string()];
        doc.embedding = embedding;
        doc
    }

    #[test]
    fn test_upsert_and_load() {
        let temp = TempDir::new().unwrap();
        let store = SqliteVectorStore::open(&temp.path().join("voicings.sqlite")).unwrap();

        store.upsert(&doc("1", "C", Some(vec![1.0, 0.5]))).unwrap();
        store.upsert(&doc("2", "Cm", None)).unwrap();
        store.upsert(&doc("1", "C6", Some(vec![0.5, 1.0]))).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].chord_name, "C6");
        assert_eq!(loaded[0].embedding, Some(vec![0.5, 1.0]));
        assert_eq!(loaded[0].tags, vec!["triad".to_string()]);
        assert_eq!(
            store.stats().unwrap(),
            StoreStats {
                documents: 2,
                embedded: 1
            }
        );

        assert!(store.remove("2").unwrap());
        assert!(!store.remove("2").unwrap());
        assert!(store.get("2").unwrap().is_none());
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("voicings.sqlite");
        {
            let store = SqliteVectorStore::open(&path).unwrap();
            store.upsert(&doc("1", "C", None)).unwrap();
        }
        let reopened = SqliteVectorStore::open(&path).unwrap();
        assert_eq!(reopened.stats().unwrap().documents, 1);
    }

    #[tokio::test]
    async fn test_nearest_runs_in_database() {
        let temp = TempDir::new().unwrap();
        let store = SqliteVectorStore::open(&temp.path().join("voicings.sqlite")).unwrap();
        store
            .upsert_many(&[
                doc("a", "A", Some(vec![1.0, 0.0, 0.0])),
                doc("b", "B", Some(vec![0.0, 1.0, 0.0])),
                doc("c", "C", Some(vec![0.9, 0.1, 0.0])),
                doc("d", "D", None),
                doc("e", "E", Some(vec![1.0, 0.0])),
            ])
            .unwrap();

        store.ping().await.unwrap();
        let hits = store.nearest(&[1.0, 0.0, 0.0], 2).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.document.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_vector_codec() {
        let v = vec![1.5, -2.25, 0.0];
        assert_eq!(decode_vector(&encode_vector(&v)), Some(v));
        assert_eq!(decode_vector(&[0, 1, 2]), None);
    }
}
