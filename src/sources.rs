use anyhow::Result;

use crate::config::Config;

/// Print each configured source type with its directory and whether the
/// directory exists.
pub fn list_sources(config: &Config) -> Result<()> {
    if config.documents.sources.is_empty() {
        println!("No sources configured. Add [[documents.sources]] entries to the config.");
        return Ok(());
    }

    println!("{:<16} {:<40} {}", "SOURCE", "DIRECTORY", "STATUS");
    for source in &config.documents.sources {
        let dir = config.source_dir(source);
        let status = if dir.is_dir() { "OK" } else { "MISSING" };
        println!("{:<16} {:<40} {}", source.name, dir.display(), status);
    }

    Ok(())
}
