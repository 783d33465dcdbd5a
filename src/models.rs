//! Core data models used throughout Context Loom.
//!
//! These types represent the chunks, tracked files, retrieval candidates,
//! and conversation messages that flow through indexing and assembly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A token-bounded slice of a source document, the unit of indexing.
///
/// Identity is `(source_path, chunk_index)`; `id` is derived from that pair
/// by [`crate::chunk::chunk_id`].
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub content: String,
    pub source_type: String,
    pub source_path: String,
    pub chunk_index: i64,
    pub token_count: usize,
    /// Modification time of the source document, unix seconds.
    pub modified_time: i64,
    pub metadata_json: String,
}

/// Incremental-sync bookkeeping for one source document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedFile {
    pub path: String,
    pub last_indexed_modified_time: i64,
    pub last_indexed_at: i64,
}

/// A search hit from the index.
///
/// `score` is higher-is-better: the FTS5 bm25 rank (a cost) is negated
/// when rows are read, so every consumer sorts descending.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub source_type: String,
    pub source_path: String,
    pub content: String,
    pub token_count: usize,
    pub score: f64,
}

/// A retrieval candidate produced per query, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextChunk {
    pub content: String,
    pub source_type: String,
    pub source_path: String,
    /// Higher is more relevant.
    pub relevance_score: f64,
    pub token_count: usize,
}

impl From<SearchResult> for ContextChunk {
    fn from(r: SearchResult) -> Self {
        Self {
            content: r.content,
            source_type: r.source_type,
            source_path: r.source_path,
            relevance_score: r.score,
            token_count: r.token_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    /// A synthetic message standing in for compressed older turns.
    SystemSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}
