//! Embedding providers.
//!
//! Concrete implementations of [`casesheet_core::embedding::Embedder`]:
//! - **[`HashedEmbedder`]**: deterministic and offline; the default.
//! - **[`OpenAIEmbedder`]**: `POST /v1/embeddings`, asking for
//!   [`EMBEDDING_DIMS`] dimensions.
//! - **[`OllamaEmbedder`]**: `POST /api/embed` on a local Ollama; the
//!   model must produce [`EMBEDDING_DIMS`]-dimensional vectors
//!   (e.g. `mxbai-embed-large`, `bge-m3`).
//! - **`LocalEmbedder`**: fastembed, behind the
//!   `local-embeddings-fastembed` feature.
//!
//! Every returned vector is checked against [`EMBEDDING_DIMS`]; a model
//! producing another size fails with
//! [`PipelineError::DimensionMismatch`] instead of polluting the index.
//!
//! # Provider Selection
//!
//! ```rust
//! # use casesheet::config::EmbeddingConfig;
//! # use casesheet::embedding::create_embedder;
//! let config = EmbeddingConfig::default(); // provider = "hashed"
//! let embedder = create_embedder(&config).unwrap();
//! assert_eq!(embedder.model_name(), "hashed");
//! ```

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use casesheet_core::embedding::{check_dims, Embedder, EMBEDDING_DIMS};
use casesheet_core::error::PipelineError;

pub use casesheet_core::embedding::HashedEmbedder;

use crate::config::EmbeddingConfig;
use crate::http::{build_client, JsonEndpoint};

const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

fn checked(vectors: Vec<Vec<f32>>, expected: usize) -> Result<Vec<Vec<f32>>> {
    if vectors.len() != expected {
        return Err(PipelineError::TransientProvider(format!(
            "embedding provider returned {} vectors for {} inputs",
            vectors.len(),
            expected
        ))
        .into());
    }
    for v in &vectors {
        check_dims(v)?;
    }
    Ok(vectors)
}

fn json_vector(value: &serde_json::Value) -> Result<Vec<f32>> {
    Ok(value
        .as_array()
        .ok_or_else(|| anyhow!("embedding is not an array"))?
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

// ============ OpenAI ============

pub struct OpenAIEmbedder {
    client: reqwest::Client,
    model: String,
    api_key: String,
    max_retries: u32,
}

impl OpenAIEmbedder {
    /// # Errors
    ///
    /// Fails if `embedding.model` is unset or `OPENAI_API_KEY` is missing.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            model,
            api_key,
            max_retries: config.max_retries,
        })
    }
}

/// Extract `data[].embedding`, ordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))?;
        indexed.push((index, json_vector(embedding)?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        EMBEDDING_DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let endpoint = JsonEndpoint {
            client: &self.client,
            service: "OpenAI",
            url: OPENAI_EMBEDDINGS_URL.to_string(),
            bearer: Some(&self.api_key),
            max_retries: self.max_retries,
        };
        let json = endpoint
            .post(&serde_json::json!({
                "model": self.model,
                "input": texts,
                "dimensions": EMBEDDING_DIMS,
            }))
            .await?;
        checked(parse_openai_response(&json)?, texts.len())
    }
}

// ============ Ollama ============

pub struct OllamaEmbedder {
    client: reqwest::Client,
    model: String,
    url: String,
    max_retries: u32,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| OLLAMA_DEFAULT_URL.to_string());
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            model,
            url,
            max_retries: config.max_retries,
        })
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?
        .iter()
        .map(json_vector)
        .collect()
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        EMBEDDING_DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let endpoint = JsonEndpoint {
            client: &self.client,
            service: "Ollama",
            url: format!("{}/api/embed", self.url.trim_end_matches('/')),
            bearer: None,
            max_retries: self.max_retries,
        };
        let json = endpoint
            .post(&serde_json::json!({
                "model": self.model,
                "input": texts,
            }))
            .await?;
        checked(parse_ollama_response(&json)?, texts.len())
    }
}

// ============ Local (fastembed) ============

/// Local inference with fastembed. Models are downloaded from Hugging Face
/// on first use and cached; afterwards no network calls are made.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalEmbedder {
    model_name: String,
    batch_size: usize,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "multilingual-e5-large".to_string());
        fastembed_model(&model_name)?;
        Ok(Self {
            model_name,
            batch_size: config.batch_size,
        })
    }
}

/// Supported local models; all produce 1024-dimensional vectors.
#[cfg(feature = "local-embeddings-fastembed")]
fn fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "mxbai-embed-large-v1" => Ok(fastembed::EmbeddingModel::MxbaiEmbedLargeV1),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             multilingual-e5-large, bge-large-en-v1.5, mxbai-embed-large-v1",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        EMBEDDING_DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = fastembed_model(&self.model_name)?;
        let batch_size = self.batch_size;
        let inputs = texts.to_vec();
        let expected = inputs.len();

        let vectors = tokio::task::spawn_blocking(move || {
            let mut embedder = fastembed::TextEmbedding::try_new(
                fastembed::InitOptions::new(model).with_show_download_progress(false),
            )
            .map_err(|e| anyhow!("Failed to initialize local embedding model: {}", e))?;
            embedder
                .embed(inputs, Some(batch_size))
                .map_err(|e| anyhow!("Local embedding failed: {}", e))
        })
        .await??;
        checked(vectors, expected)
    }
}

/// Create the [`Embedder`] named by `embedding.provider`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"hashed"` | [`HashedEmbedder`] |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"local"` | `LocalEmbedder` (requires `local-embeddings-fastembed`) |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    match config.provider.as_str() {
        "hashed" => Ok(Box::new(HashedEmbedder)),
        "openai" => Ok(Box::new(OpenAIEmbedder::new(config)?)),
        "ollama" => Ok(Box::new(OllamaEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Box::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}
