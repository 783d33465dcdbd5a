//! Canonical facts file.
//!
//! A plain-text file with one established fact per line (`#` lines are
//! comments). Facts lead the instruction block so that front-preserving
//! truncation drops the generic preamble before any fact.
//!
//! A missing file is treated the same way on every path: reading it yields
//! no facts, and appending to it creates it (parent directories included).

use std::io::Write;
use std::path::Path;

use crate::config::Config;
use crate::error::{Error, Result};

pub fn load_facts(path: &Path) -> Result<Vec<String>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| l.trim_start_matches("- ").to_string())
        .collect())
}

pub fn append_fact(path: &Path, fact: &str) -> Result<()> {
    let fact = fact.trim();
    if fact.is_empty() || fact.contains('\n') {
        return Err(Error::Validation(
            "a fact must be a single non-empty line".to_string(),
        ));
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let needs_newline = match std::fs::read(path) {
        Ok(bytes) => !bytes.is_empty() && !bytes.ends_with(b"\n"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => return Err(e.into()),
    };

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    if needs_newline {
        writeln!(file)?;
    }
    writeln!(file, "{}", fact)?;
    Ok(())
}

/// Render facts as the leading section of the instruction block.
pub fn render_facts(facts: &[String]) -> String {
    if facts.is_empty() {
        return String::new();
    }
    let mut out = String::from("Established facts:\n");
    for fact in facts {
        out.push_str("- ");
        out.push_str(fact);
        out.push('\n');
    }
    out
}

fn facts_path(config: &Config) -> anyhow::Result<&Path> {
    config
        .assembly
        .facts_file
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("No facts file configured. Set [assembly] facts_file in config."))
}

/// CLI entry point for `loom facts add`.
pub fn run_facts_add(config: &Config, fact: &str) -> anyhow::Result<()> {
    let path = facts_path(config)?;
    append_fact(path, fact)?;
    println!("Added fact to {}", path.display());
    Ok(())
}

/// CLI entry point for `loom facts list`.
pub fn run_facts_list(config: &Config) -> anyhow::Result<()> {
    let path = facts_path(config)?;
    let facts = load_facts(path)?;
    if facts.is_empty() {
        println!("No facts.");
        return Ok(());
    }
    for (i, fact) in facts.iter().enumerate() {
        println!("{}. {}", i + 1, fact);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_has_no_facts() {
        let tmp = TempDir::new().unwrap();
        assert!(load_facts(&tmp.path().join("nope.md")).unwrap().is_empty());
    }

    #[test]
    fn test_append_creates_missing_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("notes/facts.md");
        append_fact(&path, "The hero has green eyes.").unwrap();
        append_fact(&path, "  The castle fell in winter. ").unwrap();
        assert_eq!(
            load_facts(&path).unwrap(),
            vec!["The hero has green eyes.", "The castle fell in winter."]
        );
    }

    #[test]
    fn test_append_after_unterminated_line() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("facts.md");
        std::fs::write(&path, "# canon\n- First fact").unwrap();
        append_fact(&path, "Second fact").unwrap();
        assert_eq!(load_facts(&path).unwrap(), vec!["First fact", "Second fact"]);
    }

    #[test]
    fn test_append_rejects_blank() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            append_fact(&tmp.path().join("f.md"), "   "),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_render() {
        assert_eq!(render_facts(&[]), "");
        assert_eq!(
            render_facts(&["A".to_string(), "B".to_string()]),
            "Established facts:\n- A\n- B\n"
        );
    }
}
