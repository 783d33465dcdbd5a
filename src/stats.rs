//! Index statistics.
//!
//! Summarizes what is indexed: chunk and document counts, a per-source-type
//! breakdown, and when the index was last written. Used by `loom stats`.

use anyhow::{Context, Result};

use crate::config::Config;
use crate::index::SearchIndex;

/// Run the stats command: query the index and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let index = SearchIndex::open(config)
        .await
        .context("Failed to open index")?;

    let total_chunks = index.chunk_count().await?;
    let total_docs = index.source_count().await?;
    let tracked = index.tracked_files().await?;
    let by_type = index.counts_by_source_type().await?;
    let last_indexed = tracked.iter().map(|t| t.last_indexed_at).max();

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Context Loom Index Stats");
    println!("========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Documents:   {}", total_docs);
    println!("  Tracked:     {}", tracked.len());
    println!("  Chunks:      {}", total_chunks);
    println!(
        "  Last sync:   {}",
        last_indexed
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string())
    );

    if !by_type.is_empty() {
        println!();
        println!("  By source type:");
        println!("  {:<24} {:>8}", "SOURCE TYPE", "CHUNKS");
        println!("  {}", "-".repeat(34));
        for (source_type, chunks) in &by_type {
            println!("  {:<24} {:>8}", source_type, chunks);
        }
    }

    println!();

    index.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_format_ts_relative() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
        assert_eq!(format_ts_relative(now - 86400), "1 day ago");
    }
}
