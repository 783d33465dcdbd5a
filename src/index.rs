//! Full-text search index over chunks.
//!
//! Backed by SQLite: the `chunks` table holds chunk metadata, the
//! `chunks_fts` FTS5 table holds the searchable text, and `tracked_files`
//! records what modification time each source was last indexed at.
//!
//! Every write that touches both `chunks` and `chunks_fts` runs in one
//! transaction, so a reader never sees searchable text without its
//! metadata or the reverse.
//!
//! # Ranking
//!
//! FTS5's bm25 `rank` is a cost (lower is better). It is negated when rows
//! are read, so [`SearchResult::score`] is **higher is better** and results
//! come back sorted descending by score.

use std::collections::HashMap;
use std::path::Path;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::config::Config;
use crate::db;
use crate::error::{Error, Result};
use crate::migrate;
use crate::models::{Chunk, SearchResult, TrackedFile};

pub struct SearchIndex {
    pool: SqlitePool,
    source_types: Option<Vec<String>>,
}

impl SearchIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            source_types: None,
        }
    }

    /// Open the configured database and make sure the schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let index = Self::open_path(&config.db.path).await?;
        Ok(index.with_source_types(config.source_names()))
    }

    pub async fn open_path(path: &Path) -> Result<Self> {
        let pool = db::connect_path(path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    /// Restrict filtered searches to these source types. An empty list
    /// disables the check.
    pub fn with_source_types(self, source_types: Vec<String>) -> Self {
        Self {
            source_types: if source_types.is_empty() {
                None
            } else {
                Some(source_types)
            },
            ..self
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Insert one chunk, replacing any chunk with the same id.
    pub async fn index(&self, chunk: &Chunk) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
            .bind(&chunk.id)
            .execute(&mut *tx)
            .await?;
        insert_chunk(&mut tx, chunk).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Remove every chunk and the tracking record for `path`.
    ///
    /// Returns the number of chunks removed; an unknown path removes nothing.
    pub async fn delete_by_source(&self, path: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let removed = delete_source_rows(&mut tx, path).await?;
        sqlx::query("DELETE FROM tracked_files WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed)
    }

    /// Replace all chunks of one source and record it as indexed at
    /// `modified_time`, in one transaction.
    pub async fn replace_source(
        &self,
        path: &str,
        modified_time: i64,
        chunks: &[Chunk],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        delete_source_rows(&mut tx, path).await?;
        for chunk in chunks {
            insert_chunk(&mut tx, chunk).await?;
        }
        upsert_tracked(
            &mut tx,
            &TrackedFile {
                path: path.to_string(),
                last_indexed_modified_time: modified_time,
                last_indexed_at: chrono::Utc::now().timestamp(),
            },
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Replace the whole index with `chunks`. Tracking records are rebuilt
    /// from the chunks' sources. An empty slice clears the index.
    pub async fn reindex(&self, chunks: &[Chunk]) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut latest: HashMap<&str, i64> = HashMap::new();
        for chunk in chunks {
            let entry = latest.entry(chunk.source_path.as_str()).or_insert(0);
            *entry = (*entry).max(chunk.modified_time);
        }
        let tracked: Vec<TrackedFile> = latest
            .into_iter()
            .map(|(path, modified)| TrackedFile {
                path: path.to_string(),
                last_indexed_modified_time: modified,
                last_indexed_at: now,
            })
            .collect();
        self.reindex_tracked(chunks, &tracked).await
    }

    /// Replace the whole index and tracking table in one transaction.
    pub async fn reindex_tracked(&self, chunks: &[Chunk], tracked: &[TrackedFile]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks_fts")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM tracked_files")
            .execute(&mut *tx)
            .await?;
        for chunk in chunks {
            insert_chunk(&mut tx, chunk).await?;
        }
        for file in tracked {
            upsert_tracked(&mut tx, file).await?;
        }
        tx.commit().await?;
        tracing::info!(chunks = chunks.len(), sources = tracked.len(), "index rebuilt");
        Ok(())
    }

    /// Ranked keyword search. A blank query yields no results.
    pub async fn search(&self, query: &str, limit: i64) -> Result<Vec<SearchResult>> {
        self.run_search(query, None, limit).await
    }

    /// Ranked keyword search restricted to one source type.
    pub async fn search_with_filter(
        &self,
        query: &str,
        source_type: &str,
        limit: i64,
    ) -> Result<Vec<SearchResult>> {
        self.check_source_type(source_type)?;
        self.run_search(query, Some(source_type), limit).await
    }

    pub fn check_source_type(&self, source_type: &str) -> Result<()> {
        if source_type.trim().is_empty() {
            return Err(Error::Validation("source type filter is empty".to_string()));
        }
        if let Some(known) = &self.source_types {
            if !known.iter().any(|t| t == source_type) {
                return Err(Error::Validation(format!(
                    "unknown source type '{}' (known: {})",
                    source_type,
                    known.join(", ")
                )));
            }
        }
        Ok(())
    }

    async fn run_search(
        &self,
        query: &str,
        source_type: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SearchResult>> {
        let Some(match_expr) = fts_query(query) else {
            return Ok(Vec::new());
        };
        if limit < 1 {
            return Ok(Vec::new());
        }

        let rows = match source_type {
            Some(st) => {
                sqlx::query(
                    r#"
                    SELECT chunks_fts.chunk_id AS chunk_id, c.source_type, c.source_path,
                           c.content, c.token_count, chunks_fts.rank AS rank
                    FROM chunks_fts
                    JOIN chunks c ON c.id = chunks_fts.chunk_id
                    WHERE chunks_fts MATCH ? AND c.source_type = ?
                    ORDER BY rank
                    LIMIT ?
                    "#,
                )
                .bind(&match_expr)
                .bind(st)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT chunks_fts.chunk_id AS chunk_id, c.source_type, c.source_path,
                           c.content, c.token_count, chunks_fts.rank AS rank
                    FROM chunks_fts
                    JOIN chunks c ON c.id = chunks_fts.chunk_id
                    WHERE chunks_fts MATCH ?
                    ORDER BY rank
                    LIMIT ?
                    "#,
                )
                .bind(&match_expr)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.iter().map(row_to_result).collect())
    }

    pub async fn chunk_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn source_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT source_path) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Chunk counts per source type, sorted by type.
    pub async fn counts_by_source_type(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT source_type, COUNT(*) AS n FROM chunks GROUP BY source_type ORDER BY source_type",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get("source_type"), r.get("n")))
            .collect())
    }

    pub async fn tracked_file(&self, path: &str) -> Result<Option<TrackedFile>> {
        let row = sqlx::query(
            "SELECT path, last_modified, last_indexed_at FROM tracked_files WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_tracked))
    }

    pub async fn tracked_files(&self) -> Result<Vec<TrackedFile>> {
        let rows = sqlx::query(
            "SELECT path, last_modified, last_indexed_at FROM tracked_files ORDER BY path",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_tracked).collect())
    }
}

async fn insert_chunk(tx: &mut Transaction<'_, Sqlite>, chunk: &Chunk) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO chunks
            (id, source_path, source_type, chunk_index, content, token_count, modified_time, metadata_json)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&chunk.id)
    .bind(&chunk.source_path)
    .bind(&chunk.source_type)
    .bind(chunk.chunk_index)
    .bind(&chunk.content)
    .bind(chunk.token_count as i64)
    .bind(chunk.modified_time)
    .bind(&chunk.metadata_json)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        "INSERT INTO chunks_fts (chunk_id, source_path, source_type, content) VALUES (?, ?, ?, ?)",
    )
    .bind(&chunk.id)
    .bind(&chunk.source_path)
    .bind(&chunk.source_type)
    .bind(&chunk.content)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn delete_source_rows(tx: &mut Transaction<'_, Sqlite>, path: &str) -> Result<u64> {
    sqlx::query("DELETE FROM chunks_fts WHERE source_path = ?")
        .bind(path)
        .execute(&mut **tx)
        .await?;
    let removed = sqlx::query("DELETE FROM chunks WHERE source_path = ?")
        .bind(path)
        .execute(&mut **tx)
        .await?
        .rows_affected();
    Ok(removed)
}

async fn upsert_tracked(tx: &mut Transaction<'_, Sqlite>, file: &TrackedFile) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO tracked_files (path, last_modified, last_indexed_at) VALUES (?, ?, ?)
        ON CONFLICT(path) DO UPDATE SET
            last_modified = excluded.last_modified,
            last_indexed_at = excluded.last_indexed_at
        "#,
    )
    .bind(&file.path)
    .bind(file.last_indexed_modified_time)
    .bind(file.last_indexed_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn row_to_result(row: &SqliteRow) -> SearchResult {
    let rank: f64 = row.get("rank");
    SearchResult {
        chunk_id: row.get("chunk_id"),
        source_type: row.get("source_type"),
        source_path: row.get("source_path"),
        content: row.get("content"),
        token_count: row.get::<i64, _>("token_count").max(0) as usize,
        score: -rank, // negate so higher = better
    }
}

fn row_to_tracked(row: &SqliteRow) -> TrackedFile {
    TrackedFile {
        path: row.get("path"),
        last_indexed_modified_time: row.get("last_modified"),
        last_indexed_at: row.get("last_indexed_at"),
    }
}

/// Turn free text into an FTS5 MATCH expression: every word quoted, joined
/// with OR. Returns `None` when the text has no searchable words.
pub fn fts_query(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| format!("\"{}\"", w))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}
