//! Token-window document chunker.
//!
//! Splits a document body into [`Chunk`]s with [`Tokenizer::split`], so every
//! chunk respects the configured `target_tokens` and neighbouring chunks
//! share `overlap` of their tokens.
//!
//! Each chunk receives a deterministic ID derived from its source path and
//! index, plus a SHA-256 hash of its text recorded in the metadata.

use sha2::{Digest, Sha256};

use crate::collection::DocumentEntry;
use crate::models::Chunk;
use crate::tokenizer::Tokenizer;

/// Deterministic chunk identifier for `(source_path, index)`.
pub fn chunk_id(source_path: &str, index: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_path.as_bytes());
    hasher.update(b"#");
    hasher.update(index.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Split a document into chunks with contiguous indices starting at 0.
/// An empty body yields no chunks.
pub fn chunk_document(
    tokenizer: &Tokenizer,
    entry: &DocumentEntry,
    body: &str,
    target_tokens: usize,
    overlap: f64,
) -> Vec<Chunk> {
    let windows = tokenizer.split(body, target_tokens, overlap);
    let count = windows.len();

    windows
        .into_iter()
        .enumerate()
        .map(|(i, text)| make_chunk(tokenizer, entry, i as i64, count, text))
        .collect()
}

fn make_chunk(
    tokenizer: &Tokenizer,
    entry: &DocumentEntry,
    index: i64,
    count: usize,
    text: String,
) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    let metadata = serde_json::json!({
        "chunk_index": index,
        "chunk_count": count,
        "content_hash": hash,
    });

    Chunk {
        id: chunk_id(&entry.path, index),
        token_count: tokenizer.count(&text),
        content: text,
        source_type: entry.source_type.clone(),
        source_path: entry.path.clone(),
        chunk_index: index,
        modified_time: entry.modified_time,
        metadata_json: metadata.to_string(),
    }
}
