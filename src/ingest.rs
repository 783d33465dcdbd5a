//! Index synchronization with a document collection.
//!
//! [`sync_with_collection`] is the steady-state path: it re-indexes only
//! documents that are new or whose modification time moved past the last
//! indexed one, and drops sources that left the collection.
//! [`full_reindex`] is the recovery path for when tracking state itself is
//! suspect: it rebuilds the whole index in one transaction.
//!
//! Both attempt every document. Failures are collected in the
//! [`SyncReport`] instead of aborting the batch.

use anyhow::{Context, Result as AnyResult};

use crate::chunk::chunk_document;
use crate::collection::{DocumentCollection, DocumentEntry, FsCollection};
use crate::config::{ChunkingConfig, Config};
use crate::error::{Error, Result};
use crate::index::SearchIndex;
use crate::models::{Chunk, TrackedFile};
use crate::progress::{ProgressMode, SyncProgressEvent, SyncProgressReporter};
use crate::tokenizer::Tokenizer;

/// Counts from one sync run, plus every per-document failure.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub scanned: usize,
    pub indexed: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub chunks_written: usize,
    /// `(path, cause)` for documents that could not be indexed.
    pub failures: Vec<(String, String)>,
}

impl SyncReport {
    /// `Err(BatchPartial)` if any document failed.
    pub fn check(&self) -> Result<()> {
        match self.failures.first() {
            None => Ok(()),
            Some((path, cause)) => Err(Error::BatchPartial {
                failed: self.failures.len(),
                total: self.scanned,
                first_path: path.clone(),
                first_cause: cause.clone(),
            }),
        }
    }
}

/// Everything needed to turn a document into chunks.
pub struct Indexer<'a> {
    pub tokenizer: &'a Tokenizer,
    pub chunking: &'a ChunkingConfig,
}

impl Indexer<'_> {
    async fn load_chunks(
        &self,
        collection: &dyn DocumentCollection,
        entry: &DocumentEntry,
    ) -> Result<Vec<Chunk>> {
        let body = collection.read(&entry.path).await?;
        Ok(chunk_document(
            self.tokenizer,
            entry,
            &body,
            self.chunking.target_tokens,
            self.chunking.overlap,
        ))
    }
}

pub async fn sync_with_collection(
    index: &SearchIndex,
    collection: &dyn DocumentCollection,
    indexer: &Indexer<'_>,
    progress: &dyn SyncProgressReporter,
) -> Result<SyncReport> {
    progress.report(SyncProgressEvent::Discovering);
    let entries = collection.list().await?;
    let tracked = index.tracked_files().await?;

    let mut report = SyncReport {
        scanned: entries.len(),
        ..Default::default()
    };
    let total = entries.len() as u64;

    for (n, entry) in entries.iter().enumerate() {
        let previous = tracked.iter().find(|t| t.path == entry.path);
        let stale = match previous {
            None => true,
            Some(t) => entry.modified_time > t.last_indexed_modified_time,
        };

        if stale {
            match index_document(index, collection, indexer, entry).await {
                Ok(written) => {
                    tracing::debug!(path = %entry.path, chunks = written, "indexed document");
                    report.indexed += 1;
                    report.chunks_written += written;
                }
                Err(e) => {
                    tracing::warn!(path = %entry.path, error = %e, "failed to index document");
                    report.failures.push((entry.path.clone(), e.to_string()));
                }
            }
        } else {
            report.unchanged += 1;
        }

        progress.report(SyncProgressEvent::Indexing {
            n: n as u64 + 1,
            total,
        });
    }

    let gone: Vec<&TrackedFile> = tracked
        .iter()
        .filter(|t| !entries.iter().any(|e| e.path == t.path))
        .collect();
    if !gone.is_empty() {
        progress.report(SyncProgressEvent::Pruning {
            stale: gone.len() as u64,
        });
    }
    for file in gone {
        match index.delete_by_source(&file.path).await {
            Ok(removed) => {
                tracing::debug!(path = %file.path, chunks = removed, "removed deleted document");
                report.deleted += 1;
            }
            Err(e) => {
                tracing::warn!(path = %file.path, error = %e, "failed to remove document");
                report.failures.push((file.path.clone(), e.to_string()));
            }
        }
    }

    tracing::info!(
        scanned = report.scanned,
        indexed = report.indexed,
        unchanged = report.unchanged,
        deleted = report.deleted,
        failed = report.failures.len(),
        "sync finished"
    );
    Ok(report)
}

async fn index_document(
    index: &SearchIndex,
    collection: &dyn DocumentCollection,
    indexer: &Indexer<'_>,
    entry: &DocumentEntry,
) -> Result<usize> {
    let chunks = indexer.load_chunks(collection, entry).await?;
    index
        .replace_source(&entry.path, entry.modified_time, &chunks)
        .await?;
    Ok(chunks.len())
}

/// Rebuild the index from scratch. Documents that fail to load are left
/// out (and untracked, so the next sync retries them).
pub async fn full_reindex(
    index: &SearchIndex,
    collection: &dyn DocumentCollection,
    indexer: &Indexer<'_>,
    progress: &dyn SyncProgressReporter,
) -> Result<SyncReport> {
    progress.report(SyncProgressEvent::Discovering);
    let entries = collection.list().await?;
    let previously_tracked = index.tracked_files().await?.len();
    let now = chrono::Utc::now().timestamp();

    let mut report = SyncReport {
        scanned: entries.len(),
        ..Default::default()
    };
    let mut all_chunks = Vec::new();
    let mut tracked = Vec::new();
    let total = entries.len() as u64;

    for (n, entry) in entries.iter().enumerate() {
        match indexer.load_chunks(collection, entry).await {
            Ok(chunks) => {
                report.indexed += 1;
                report.chunks_written += chunks.len();
                all_chunks.extend(chunks);
                tracked.push(TrackedFile {
                    path: entry.path.clone(),
                    last_indexed_modified_time: entry.modified_time,
                    last_indexed_at: now,
                });
            }
            Err(e) => {
                tracing::warn!(path = %entry.path, error = %e, "failed to load document");
                report.failures.push((entry.path.clone(), e.to_string()));
            }
        }
        progress.report(SyncProgressEvent::Indexing {
            n: n as u64 + 1,
            total,
        });
    }

    index.reindex_tracked(&all_chunks, &tracked).await?;
    report.deleted = previously_tracked.saturating_sub(tracked.len());
    Ok(report)
}

/// CLI entry point for `loom sync`.
pub async fn run_sync(config: &Config, full: bool, progress: Option<ProgressMode>) -> AnyResult<()> {
    let index = SearchIndex::open(config)
        .await
        .context("Failed to open index")?;
    let collection = FsCollection::from_config(config)?;
    let tokenizer = Tokenizer::new(&config.model.tokenizer)?;
    let indexer = Indexer {
        tokenizer: &tokenizer,
        chunking: &config.chunking,
    };
    let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();

    let report = if full {
        full_reindex(&index, &collection, &indexer, reporter.as_ref()).await?
    } else {
        sync_with_collection(&index, &collection, &indexer, reporter.as_ref()).await?
    };

    println!("sync documents{}", if full { " (full)" } else { "" });
    println!("  scanned: {}", report.scanned);
    println!("  indexed: {}", report.indexed);
    println!("  unchanged: {}", report.unchanged);
    println!("  deleted: {}", report.deleted);
    println!("  chunks written: {}", report.chunks_written);
    for (path, cause) in &report.failures {
        println!("  failed: {} ({})", path, cause);
    }

    index.close().await;
    report.check()?;
    println!("ok");
    Ok(())
}
