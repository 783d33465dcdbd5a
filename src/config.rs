use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::budget::{BudgetRatios, ModelLimits};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub documents: DocumentsConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub budget: BudgetRatios,
    #[serde(default)]
    pub assembly: AssemblyConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub backend: Option<BackendConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DocumentsConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            sources: Vec::new(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

/// One logical source type, backed by a directory under the documents root.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub name: String,
    pub dir: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_target_tokens")]
    pub target_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap: f64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: default_target_tokens(),
            overlap: default_overlap(),
        }
    }
}

fn default_target_tokens() -> usize {
    512
}
fn default_overlap() -> f64 {
    0.1
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_model_name")]
    pub name: String,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: usize,
    #[serde(default = "default_tokenizer")]
    pub tokenizer: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model_name(),
            max_context_tokens: default_max_context_tokens(),
            max_output_tokens: default_max_output_tokens(),
            tokenizer: default_tokenizer(),
        }
    }
}

impl ModelConfig {
    pub fn limits(&self) -> ModelLimits {
        ModelLimits {
            max_context_tokens: self.max_context_tokens,
            max_output_tokens: self.max_output_tokens,
        }
    }
}

fn default_model_name() -> String {
    "gpt-4o-mini".to_string()
}
fn default_max_context_tokens() -> usize {
    8192
}
fn default_max_output_tokens() -> usize {
    4096
}
fn default_tokenizer() -> String {
    "cl100k_base".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssemblyConfig {
    #[serde(default = "default_preamble")]
    pub preamble: String,
    #[serde(default)]
    pub facts_file: Option<PathBuf>,
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
    #[serde(default = "default_retrieval_limit")]
    pub retrieval_limit: i64,
    #[serde(default = "default_format_reserve")]
    pub format_reserve: usize,
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            preamble: default_preamble(),
            facts_file: None,
            keep_recent: default_keep_recent(),
            retrieval_limit: default_retrieval_limit(),
            format_reserve: default_format_reserve(),
            safety_margin: default_safety_margin(),
        }
    }
}

fn default_preamble() -> String {
    "You are a careful writing collaborator. Ground your answers in the provided \
     reference material and the established facts. When the material does not \
     cover a question, say so instead of inventing details."
        .to_string()
}
fn default_keep_recent() -> usize {
    6
}
fn default_retrieval_limit() -> i64 {
    20
}
fn default_format_reserve() -> usize {
    50
}
fn default_safety_margin() -> f64 {
    0.05
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    120
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub model: Option<String>,
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

impl Config {
    /// Resolve a source's directory against the documents root.
    pub fn source_dir(&self, source: &SourceConfig) -> PathBuf {
        self.documents.root.join(&source.dir)
    }

    pub fn source_names(&self) -> Vec<String> {
        self.documents
            .sources
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.target_tokens == 0 {
        bail!("chunking.target_tokens must be > 0");
    }
    if !(0.0..1.0).contains(&config.chunking.overlap) {
        bail!("chunking.overlap must be in [0.0, 1.0)");
    }

    if config.model.max_context_tokens == 0 {
        bail!("model.max_context_tokens must be > 0");
    }

    config
        .budget
        .validate()
        .with_context(|| "Invalid [budget] ratios")?;

    if !(0.0..1.0).contains(&config.assembly.safety_margin) {
        bail!("assembly.safety_margin must be in [0.0, 1.0)");
    }
    if config.assembly.retrieval_limit < 1 {
        bail!("assembly.retrieval_limit must be >= 1");
    }

    let mut seen = HashSet::new();
    for source in &config.documents.sources {
        if source.name.trim().is_empty() {
            bail!("documents.sources entries need a non-empty name");
        }
        if !seen.insert(source.name.as_str()) {
            bail!("Duplicate source name: '{}'", source.name);
        }
    }

    if let Some(backend) = &config.backend {
        if !backend.base_url.starts_with("http://") && !backend.base_url.starts_with("https://")
        {
            bail!(
                "backend.base_url must be an http(s) URL, got '{}'",
                backend.base_url
            );
        }
    }

    Ok(())
}
