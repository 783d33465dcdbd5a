//! Document collections: where indexable text comes from.
//!
//! A [`DocumentCollection`] lists documents with their modification times
//! and reads them by path. Every document belongs to one logical source
//! type. [`FsCollection`] walks configured directories on disk;
//! [`MemoryCollection`] holds documents in memory for tests and embedders.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{Error, Result};

/// A document as listed by a collection, before it is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentEntry {
    /// Collection-relative path, `/`-separated. Unique within a collection.
    pub path: String,
    pub source_type: String,
    /// Unix seconds.
    pub modified_time: i64,
}

#[async_trait]
pub trait DocumentCollection: Send + Sync {
    /// Every current document, sorted by path.
    async fn list(&self) -> Result<Vec<DocumentEntry>>;

    /// Full text of one document.
    async fn read(&self, path: &str) -> Result<String>;

    /// Logical source types this collection partitions documents into.
    fn source_types(&self) -> Vec<String>;
}

struct FsSource {
    name: String,
    dir: PathBuf,
    include: GlobSet,
}

/// Filesystem-backed collection built from `[documents]` config.
pub struct FsCollection {
    root: PathBuf,
    sources: Vec<FsSource>,
    exclude: GlobSet,
    follow_symlinks: bool,
}

impl FsCollection {
    pub fn from_config(config: &Config) -> Result<Self> {
        let docs = &config.documents;
        if docs.sources.is_empty() {
            return Err(Error::Validation(
                "no document sources configured; add [[documents.sources]] entries".to_string(),
            ));
        }

        let mut sources = Vec::new();
        for source in &docs.sources {
            sources.push(FsSource {
                name: source.name.clone(),
                dir: source.dir.clone(),
                include: build_globset(&source.include_globs)?,
            });
        }

        let mut default_excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        default_excludes.extend(docs.exclude_globs.clone());

        Ok(Self {
            root: docs.root.clone(),
            sources,
            exclude: build_globset(&default_excludes)?,
            follow_symlinks: docs.follow_symlinks,
        })
    }

    /// Entries that cannot be walked or stat'ed are logged and skipped.
    fn scan_source(&self, source: &FsSource) -> Result<Vec<DocumentEntry>> {
        let dir = self.root.join(&source.dir);
        if !dir.exists() {
            tracing::warn!(source = %source.name, dir = %dir.display(), "source directory does not exist");
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in WalkDir::new(&dir).follow_links(self.follow_symlinks) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(source = %source.name, error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let within_source = path.strip_prefix(&dir).unwrap_or(path);
            let within_source = to_slash(within_source);

            if self.exclude.is_match(&within_source) || !source.include.is_match(&within_source) {
                continue;
            }

            let modified_time = match modified_secs(path) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping document without metadata");
                    continue;
                }
            };
            let relative = to_slash(path.strip_prefix(&self.root).unwrap_or(path));
            entries.push(DocumentEntry {
                path: relative,
                source_type: source.name.clone(),
                modified_time,
            });
        }
        Ok(entries)
    }
}

#[async_trait]
impl DocumentCollection for FsCollection {
    async fn list(&self) -> Result<Vec<DocumentEntry>> {
        let mut entries = Vec::new();
        for source in &self.sources {
            entries.extend(self.scan_source(source)?);
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries.dedup_by(|a, b| a.path == b.path);
        Ok(entries)
    }

    async fn read(&self, path: &str) -> Result<String> {
        let relative = validate_relative(path)?;
        let full = self.root.join(relative);
        match tokio::fs::read_to_string(&full).await {
            Ok(body) => Ok(body),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("document {}", path)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn source_types(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name.clone()).collect()
    }
}

/// In-memory collection. Modification times are set explicitly.
#[derive(Default)]
pub struct MemoryCollection {
    source_types: Vec<String>,
    docs: RwLock<BTreeMap<String, (DocumentEntry, String)>>,
}

impl MemoryCollection {
    pub fn new(source_types: &[&str]) -> Self {
        Self {
            source_types: source_types.iter().map(|s| s.to_string()).collect(),
            docs: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn put(&self, path: &str, source_type: &str, modified_time: i64, body: &str) {
        let entry = DocumentEntry {
            path: path.to_string(),
            source_type: source_type.to_string(),
            modified_time,
        };
        self.docs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), (entry, body.to_string()));
    }

    pub fn remove(&self, path: &str) {
        self.docs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
    }
}

#[async_trait]
impl DocumentCollection for MemoryCollection {
    async fn list(&self) -> Result<Vec<DocumentEntry>> {
        let docs = self.docs.read().unwrap_or_else(|e| e.into_inner());
        Ok(docs.values().map(|(entry, _)| entry.clone()).collect())
    }

    async fn read(&self, path: &str) -> Result<String> {
        let docs = self.docs.read().unwrap_or_else(|e| e.into_inner());
        docs.get(path)
            .map(|(_, body)| body.clone())
            .ok_or_else(|| Error::NotFound(format!("document {}", path)))
    }

    fn source_types(&self) -> Vec<String> {
        self.source_types.clone()
    }
}

/// Reject absolute paths and `..` segments.
fn validate_relative(path: &str) -> Result<&Path> {
    let p = Path::new(path);
    let ok = !path.is_empty()
        && p.components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if ok {
        Ok(p)
    } else {
        Err(Error::Validation(format!(
            "document path must be relative without '..': {}",
            path
        )))
    }
}

fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn modified_secs(path: &Path) -> Result<i64> {
    let metadata = std::fs::metadata(path)?;
    let modified = metadata
        .modified()
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
    Ok(modified
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::Validation(format!("bad glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::Validation(format!("bad glob set: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DbConfig, DocumentsConfig, SourceConfig};
    use tempfile::TempDir;

    fn config_for(root: &Path) -> Config {
        let toml = format!(
            "[db]\npath = \"{}/db.sqlite\"\n",
            root.display()
        );
        let mut cfg: Config = toml::from_str(&toml).unwrap();
        cfg.db = DbConfig {
            path: root.join("db.sqlite"),
        };
        cfg.documents = DocumentsConfig {
            root: root.to_path_buf(),
            sources: vec![
                SourceConfig {
                    name: "characters".to_string(),
                    dir: PathBuf::from("characters"),
                    include_globs: vec!["**/*.md".to_string()],
                },
                SourceConfig {
                    name: "chapters".to_string(),
                    dir: PathBuf::from("chapters"),
                    include_globs: vec!["**/*.md".to_string(), "**/*.txt".to_string()],
                },
            ],
            exclude_globs: vec![],
            follow_symlinks: false,
        };
        cfg
    }

    #[tokio::test]
    async fn test_fs_collection_lists_by_source() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("characters")).unwrap();
        std::fs::create_dir_all(root.join("chapters/part1")).unwrap();
        std::fs::write(root.join("characters/hero.md"), "Hero is brave.").unwrap();
        std::fs::write(root.join("characters/skip.txt"), "not included").unwrap();
        std::fs::write(root.join("chapters/part1/one.txt"), "Chapter one.").unwrap();

        let coll = FsCollection::from_config(&config_for(root)).unwrap();
        let entries = coll.list().await.unwrap();
        let paths: Vec<(&str, &str)> = entries
            .iter()
            .map(|e| (e.path.as_str(), e.source_type.as_str()))
            .collect();
        assert_eq!(
            paths,
            vec![
                ("chapters/part1/one.txt", "chapters"),
                ("characters/hero.md", "characters"),
            ]
        );
        assert!(entries.iter().all(|e| e.modified_time > 0));
        assert_eq!(
            coll.read("characters/hero.md").await.unwrap(),
            "Hero is brave."
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fs_collection_skips_broken_symlink() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("characters")).unwrap();
        std::fs::write(root.join("characters/good.md"), "Still here.").unwrap();
        std::os::unix::fs::symlink(root.join("nowhere.md"), root.join("characters/bad.md"))
            .unwrap();

        for follow in [true, false] {
            let mut cfg = config_for(root);
            cfg.documents.follow_symlinks = follow;
            let coll = FsCollection::from_config(&cfg).unwrap();
            let paths: Vec<String> = coll
                .list()
                .await
                .unwrap()
                .into_iter()
                .map(|e| e.path)
                .collect();
            assert_eq!(paths, vec!["characters/good.md".to_string()]);
        }
    }

    #[tokio::test]
    async fn test_fs_collection_rejects_escaping_paths() {
        let tmp = TempDir::new().unwrap();
        let coll = FsCollection::from_config(&config_for(tmp.path())).unwrap();
        assert!(matches!(
            coll.read("../etc/passwd").await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            coll.read("/etc/passwd").await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            coll.read("characters/missing.md").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_collection() {
        let coll = MemoryCollection::new(&["notes"]);
        coll.put("b.md", "notes", 2, "bee");
        coll.put("a.md", "notes", 1, "ay");
        let listed = coll.list().await.unwrap();
        assert_eq!(listed[0].path, "a.md");
        assert_eq!(coll.read("b.md").await.unwrap(), "bee");
        coll.remove("b.md");
        assert!(coll.read("b.md").await.is_err());
    }
}
