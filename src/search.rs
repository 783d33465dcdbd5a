//! `loom search`: ranked keyword search from the command line.

use anyhow::{Context, Result};

use crate::config::Config;
use crate::index::SearchIndex;

/// Width of the printed excerpt, in characters.
const EXCERPT_CHARS: usize = 160;

pub async fn run_search(
    config: &Config,
    query: &str,
    source_filter: Option<String>,
    limit: Option<i64>,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let index = SearchIndex::open(config)
        .await
        .context("Failed to open index")?;
    let limit = limit.unwrap_or(config.assembly.retrieval_limit);

    let results = match source_filter.as_deref() {
        Some(st) => index.search_with_filter(query, st, limit).await?,
        None => index.search(query, limit).await?,
    };

    if results.is_empty() {
        println!("No results.");
        index.close().await;
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} / {}",
            i + 1,
            result.score,
            result.source_type,
            result.source_path
        );
        println!("    tokens: {}", result.token_count);
        println!("    excerpt: \"{}\"", excerpt(&result.content));
        println!("    id: {}", result.chunk_id);
        println!();
    }

    index.close().await;
    Ok(())
}

fn excerpt(content: &str) -> String {
    let flat = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= EXCERPT_CHARS {
        return flat;
    }
    let cut: String = flat.chars().take(EXCERPT_CHARS).collect();
    format!("{}...", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excerpt_flattens_and_cuts() {
        assert_eq!(excerpt("a\n  b\tc"), "a b c");
        let long = "word ".repeat(100);
        let e = excerpt(&long);
        assert!(e.ends_with("..."));
        assert!(e.chars().count() <= EXCERPT_CHARS + 3);
    }
}
