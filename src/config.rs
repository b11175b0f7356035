//! Configuration parsing and validation.
//!
//! casesheet is configured via a TOML file (default: `config/sheet.toml`).
//! The configuration is loaded once at startup and passed by reference to
//! every subsystem; providers are chosen from it explicitly, never from
//! global state.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/sheet.sqlite"
//!
//! [storage]
//! root = "./data/files"
//!
//! [chunking]
//! max_tokens = 256
//!
//! [retrieval]
//! top_k = 6
//!
//! [embedding]
//! provider = "ollama"
//! model = "mxbai-embed-large"
//!
//! [reasoning]
//! provider = "ollama"
//! model = "llama3.1"
//!
//! [reasoning.extract]
//! model = "llama3.1:70b"
//!
//! [pipeline]
//! max_attempts = 3
//! lease_secs = 300
//!
//! [audit]
//! auto_resolve = false
//! ```

use anyhow::{bail, Context, Result};
use casesheet_core::embedding::EMBEDDING_DIMS;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory holding the original uploaded files.
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    6
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hashed".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

/// Provider and model for one reasoning purpose.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ReasoningOverride {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReasoningConfig {
    #[serde(default = "default_reasoning_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub extract: ReasoningOverride,
    #[serde(default)]
    pub answer: ReasoningOverride,
    #[serde(default)]
    pub classify: ReasoningOverride,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_reasoning_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            provider: default_reasoning_provider(),
            model: None,
            url: None,
            extract: ReasoningOverride::default(),
            answer: ReasoningOverride::default(),
            classify: ReasoningOverride::default(),
            max_retries: default_max_retries(),
            timeout_secs: default_reasoning_timeout_secs(),
        }
    }
}

fn default_reasoning_provider() -> String {
    "heuristic".to_string()
}
fn default_reasoning_timeout_secs() -> u64 {
    120
}

/// What a reasoning provider is used for; each may pick its own model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningPurpose {
    Extract,
    Answer,
    Classify,
}

impl ReasoningPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningPurpose::Extract => "extract",
            ReasoningPurpose::Answer => "answer",
            ReasoningPurpose::Classify => "classify",
        }
    }
}

impl ReasoningConfig {
    /// Provider and model for `purpose`, falling back to the section default.
    pub fn resolve(&self, purpose: ReasoningPurpose) -> (String, Option<String>) {
        let over = match purpose {
            ReasoningPurpose::Extract => &self.extract,
            ReasoningPurpose::Answer => &self.answer,
            ReasoningPurpose::Classify => &self.classify,
        };
        (
            over.provider.clone().unwrap_or_else(|| self.provider.clone()),
            over.model.clone().or_else(|| self.model.clone()),
        )
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassifierConfig {
    #[serde(default = "default_classifier_provider")]
    pub provider: String,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            provider: default_classifier_provider(),
            min_confidence: default_min_confidence(),
        }
    }
}

fn default_classifier_provider() -> String {
    "keyword".to_string()
}
fn default_min_confidence() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: i64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: i64,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: i64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            lease_secs: default_lease_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_secs() -> i64 {
    2
}
fn default_backoff_max_secs() -> i64 {
    3600
}
fn default_lease_secs() -> i64 {
    300
}
fn default_poll_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default)]
    pub allow_unsourced: bool,
    #[serde(default = "default_currency")]
    pub currency: String,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            allow_unsourced: false,
            currency: default_currency(),
        }
    }
}

fn default_currency() -> String {
    "MXN".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuditConfig {
    #[serde(default)]
    pub auto_resolve: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Check value ranges and provider names.
    pub fn validate(&self) -> Result<()> {
        if self.chunking.max_tokens == 0 {
            bail!("chunking.max_tokens must be > 0");
        }
        if self.retrieval.top_k == 0 {
            bail!("retrieval.top_k must be >= 1");
        }

        match self.embedding.provider.as_str() {
            "hashed" | "openai" | "ollama" | "local" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be hashed, openai, ollama, or local.",
                other
            ),
        }
        if let Some(dims) = self.embedding.dims {
            if dims != EMBEDDING_DIMS {
                bail!(
                    "embedding.dims is {} but the chunk index stores {}-dimensional vectors",
                    dims,
                    EMBEDDING_DIMS
                );
            }
        }
        if matches!(self.embedding.provider.as_str(), "openai" | "ollama")
            && self.embedding.model.is_none()
        {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                self.embedding.provider
            );
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }

        for purpose in [
            ReasoningPurpose::Extract,
            ReasoningPurpose::Answer,
            ReasoningPurpose::Classify,
        ] {
            let (provider, model) = self.reasoning.resolve(purpose);
            match provider.as_str() {
                "heuristic" => {}
                "ollama" | "openai" if model.is_some() => {}
                "ollama" | "openai" => bail!(
                    "reasoning.model (or reasoning.{}.model) must be specified when provider is '{}'",
                    purpose.as_str(),
                    provider
                ),
                other => bail!(
                    "Unknown reasoning provider for {}: '{}'. Must be heuristic, ollama, or openai.",
                    purpose.as_str(),
                    other
                ),
            }
        }

        match self.classifier.provider.as_str() {
            "keyword" | "reasoning" => {}
            other => bail!(
                "Unknown classifier provider: '{}'. Must be keyword or reasoning.",
                other
            ),
        }
        if !(0.0..=1.0).contains(&self.classifier.min_confidence) {
            bail!("classifier.min_confidence must be in [0.0, 1.0]");
        }

        if self.pipeline.max_attempts == 0 {
            bail!("pipeline.max_attempts must be >= 1");
        }
        if self.pipeline.backoff_base_secs < 0
            || self.pipeline.backoff_max_secs < self.pipeline.backoff_base_secs
        {
            bail!("pipeline.backoff_max_secs must be >= pipeline.backoff_base_secs >= 0");
        }
        if self.pipeline.lease_secs <= 0 {
            bail!("pipeline.lease_secs must be > 0");
        }
        if self.extraction.currency.trim().is_empty() {
            bail!("extraction.currency must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [db]
        path = "sheet.sqlite"

        [storage]
        root = "files"

        [chunking]
        max_tokens = 256
    "#;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.retrieval.top_k, 6);
        assert_eq!(config.embedding.provider, "hashed");
        assert_eq!(config.reasoning.provider, "heuristic");
        assert_eq!(config.classifier.min_confidence, 0.5);
        assert_eq!(config.pipeline.max_attempts, 3);
        assert_eq!(config.pipeline.lease_secs, 300);
        assert!(!config.extraction.allow_unsourced);
        assert!(!config.audit.auto_resolve);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_per_purpose_override() {
        let toml = format!(
            "{}\n[reasoning]\nprovider = \"ollama\"\nmodel = \"small\"\n[reasoning.extract]\nmodel = \"large\"\n",
            MINIMAL
        );
        let config: Config = toml::from_str(&toml).unwrap();
        config.validate().unwrap();
        assert_eq!(
            config.reasoning.resolve(ReasoningPurpose::Extract),
            ("ollama".to_string(), Some("large".to_string()))
        );
        assert_eq!(
            config.reasoning.resolve(ReasoningPurpose::Answer),
            ("ollama".to_string(), Some("small".to_string()))
        );
    }

    #[test]
    fn test_wrong_dims_rejected() {
        let toml = format!("{}\n[embedding]\ndims = 768\n", MINIMAL);
        let config: Config = toml::from_str(&toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("embedding.dims"));
    }

    #[test]
    fn test_remote_reasoning_needs_model() {
        let toml = format!("{}\n[reasoning]\nprovider = \"openai\"\n", MINIMAL);
        let config: Config = toml::from_str(&toml).unwrap();
        assert!(config.validate().is_err());
    }
}
