//! Concrete embedding providers.
//!
//! Implements the core [`EmbeddingProvider`] trait for:
//! - **[`DisabledProvider`]**: every call fails; the default when nothing is configured.
//! - **[`OpenAIProvider`]**: `POST /v1/embeddings` with retry and backoff.
//! - **[`OllamaProvider`]**: a local Ollama instance's `/api/embed` endpoint.
//! - **[`LocalProvider`]**: fastembed inference (feature `local-embeddings`).
//! - **[`HashProvider`]**: deterministic feature hashing, offline; for tests and demos.
//!
//! Every failure is reported as [`Error::Encoding`].
//!
//! # Retry Strategy
//!
//! The OpenAI and Ollama providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::time::Duration;

use csv_search_core::{EmbeddingProvider, Error, Result};

use crate::config::EmbeddingConfig;

const OPENAI_URL: &str = "https://api.openai.com/v1/embeddings";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

// ============ Disabled Provider ============

/// Provider used when `embedding.provider = "disabled"`.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(Error::encoding(
            "embedding provider is disabled; set [embedding].provider in the config",
        ))
    }
}

// ============ HTTP providers ============

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| Error::encoding(format!("failed to build HTTP client: {}", e)))
}

/// Send `request` up to `max_retries + 1` times and return the JSON body.
async fn send_with_retry<F>(label: &str, max_retries: u32, request: F) -> Result<serde_json::Value>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s, 4s, 8s, ...
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tracing::debug!(provider = label, attempt, ?delay, "retrying embedding request");
            tokio::time::sleep(delay).await;
        }

        match request().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response.json().await.map_err(|e| {
                        Error::encoding(format!("{} returned invalid JSON: {}", label, e))
                    });
                }

                let body_text = response.text().await.unwrap_or_default();
                let err = Error::encoding(format!("{} API error {}: {}", label, status, body_text));
                // Rate limited or server error: retry
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(err);
                    continue;
                }
                return Err(err);
            }
            Err(e) => {
                last_err = Some(Error::encoding(format!("{} request failed: {}", label, e)));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| Error::encoding(format!("{} embedding failed after retries", label))))
}

fn as_vector(value: &serde_json::Value, what: &str) -> Result<Vec<f32>> {
    value
        .as_array()
        .ok_or_else(|| Error::encoding(format!("invalid {} response: embedding is not an array", what)))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| Error::encoding(format!("invalid {} response: non-numeric value", what)))
        })
        .collect()
}

/// Extract `data[0].embedding` from an OpenAI response.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<f32>> {
    let first = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .ok_or_else(|| Error::encoding("invalid OpenAI response: missing data[0].embedding"))?;
    as_vector(first, "OpenAI")
}

/// Extract `embeddings[0]` from an Ollama response.
fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<f32>> {
    let first = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .and_then(|e| e.first())
        .ok_or_else(|| Error::encoding("invalid Ollama response: missing embeddings array"))?;
    as_vector(first, "Ollama")
}

fn check_dims(vector: Vec<f32>, dims: usize) -> Result<Vec<f32>> {
    if vector.len() != dims {
        return Err(Error::encoding(format!(
            "expected {} dimensions, provider returned {}",
            dims,
            vector.len()
        )));
    }
    Ok(vector)
}

fn required_model(config: &EmbeddingConfig, provider: &str) -> Result<String> {
    config.model.clone().ok_or_else(|| {
        Error::configuration(format!("embedding.model required for {} provider", provider))
    })
}

fn required_dims(config: &EmbeddingConfig, provider: &str) -> Result<usize> {
    config.dims.filter(|d| *d > 0).ok_or_else(|| {
        Error::configuration(format!("embedding.dims required for {} provider", provider))
    })
}

/// Embedding provider using the OpenAI API.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = required_model(config, "OpenAI")?;
        let dims = required_dims(config, "OpenAI")?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::configuration("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            model,
            dims,
            api_key,
            max_retries: config.max_retries,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        let json = send_with_retry("OpenAI", self.max_retries, || {
            self.client
                .post(OPENAI_URL)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
        })
        .await?;
        check_dims(parse_openai_response(&json)?, self.dims)
    }
}

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST {url}/api/embed` (default url `http://localhost:11434`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| OLLAMA_DEFAULT_URL.to_string());
        Ok(Self {
            model: required_model(config, "Ollama")?,
            dims: required_dims(config, "Ollama")?,
            url: url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        let endpoint = format!("{}/api/embed", self.url);
        let json = send_with_retry("Ollama", self.max_retries, || {
            self.client.post(&endpoint).json(&body)
        })
        .await?;
        check_dims(parse_ollama_response(&json)?, self.dims)
    }
}

// ============ Local Provider (fastembed) ============

#[cfg(feature = "local-embeddings")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => Err(Error::configuration(format!(
            "unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, \
             multilingual-e5-small, multilingual-e5-base, multilingual-e5-large",
            other
        ))),
    }
}

/// Local inference through fastembed.
///
/// The model is downloaded and loaded on the first call, then reused.
/// Inference runs on tokio's blocking pool.
#[cfg(feature = "local-embeddings")]
pub struct LocalProvider {
    model_name: String,
    dims: usize,
    model: fastembed::EmbeddingModel,
    loaded: std::sync::Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings")]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = required_model(config, "local")?;
        Ok(Self {
            model: config_to_fastembed_model(&model_name)?,
            dims: required_dims(config, "local")?,
            model_name,
            loaded: Default::default(),
        })
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let loaded = self.loaded.clone();
        let model = self.model.clone();
        let text = text.to_string();

        let vector = tokio::task::spawn_blocking(move || -> Result<Vec<f32>> {
            let mut guard = loaded
                .lock()
                .map_err(|_| Error::encoding("local model lock poisoned"))?;
            if guard.is_none() {
                tracing::info!(?model, "loading local embedding model");
                let instance = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(model).with_show_download_progress(false),
                )
                .map_err(|e| {
                    Error::encoding(format!("failed to initialize local embedding model: {}", e))
                })?;
                *guard = Some(instance);
            }
            let instance = guard
                .as_mut()
                .ok_or_else(|| Error::encoding("local embedding model not loaded"))?;
            let mut out = instance
                .embed(vec![text], None)
                .map_err(|e| Error::encoding(format!("local embedding failed: {}", e)))?;
            out.pop()
                .ok_or_else(|| Error::encoding("local embedding returned no vector"))
        })
        .await
        .map_err(|e| Error::encoding(format!("local embedding task failed: {}", e)))??;

        check_dims(vector, self.dims)
    }
}

// ============ Hash Provider ============

/// Deterministic offline embedder.
///
/// Each lowercase alphanumeric token is hashed with SHA-256 into one of
/// `dims` buckets with a sign bit; the result is L2-normalised. Similar
/// wording gives similar vectors, which is enough for tests and demos.
pub struct HashProvider {
    dims: usize,
}

impl HashProvider {
    pub fn new(dims: usize) -> Result<Self> {
        if dims == 0 {
            return Err(Error::configuration("embedding.dims must be > 0 for hash provider"));
        }
        Ok(Self { dims })
    }

    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let index = (u64::from_le_bytes(bucket) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[index] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashProvider {
    fn model_name(&self) -> &str {
        "hash"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vector(text))
    }
}

/// Create the [`EmbeddingProvider`] named by `config.provider`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
/// | `"local"` | `LocalProvider` (feature `local-embeddings`) |
/// | `"hash"` | [`HashProvider`] |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    let provider: Box<dyn EmbeddingProvider> = match config.provider.as_str() {
        "disabled" => Box::new(DisabledProvider),
        "openai" => Box::new(OpenAIProvider::new(config)?),
        "ollama" => Box::new(OllamaProvider::new(config)?),
        #[cfg(feature = "local-embeddings")]
        "local" => Box::new(LocalProvider::new(config)?),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => {
            return Err(Error::configuration(
                "local embedding provider requires --features local-embeddings",
            ))
        }
        "hash" => Box::new(HashProvider::new(config.dims.unwrap_or(0))?),
        other => {
            return Err(Error::configuration(format!(
                "unknown embedding provider: {}",
                other
            )))
        }
    };
    tracing::debug!(
        provider = %config.provider,
        model = provider.model_name(),
        dims = provider.dims(),
        "embedding provider ready"
    );
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use csv_search_core::vector::cosine_similarity;

    fn hash_config(dims: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: "hash".to_string(),
            dims: Some(dims),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_disabled_provider_fails_with_encoding_error() {
        let err = DisabledProvider.embed("hello").await.unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
    }

    #[tokio::test]
    async fn test_hash_provider_is_deterministic_and_normalised() {
        let p = create_provider(&hash_config(64)).unwrap();
        let a = p.embed("Red bicycle").await.unwrap();
        let b = p.embed("red  BICYCLE").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_hash_provider_similarity_tracks_shared_words() {
        let p = HashProvider::new(256).unwrap();
        let red = p.vector("red bicycle");
        let blue = p.vector("blue bicycle");
        let car = p.vector("green car");
        assert!(cosine_similarity(&red, &blue) > cosine_similarity(&red, &car));
    }

    #[test]
    fn test_hash_provider_empty_text_is_zero_vector() {
        let p = HashProvider::new(8).unwrap();
        assert!(p.vector("  ,, ").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_unknown_provider_is_configuration_error() {
        let cfg = EmbeddingConfig {
            provider: "onnx".to_string(),
            ..Default::default()
        };
        assert!(matches!(create_provider(&cfg), Err(Error::Configuration(_))));
        assert!(matches!(HashProvider::new(0), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_parse_responses() {
        let openai = serde_json::json!({"data": [{"embedding": [0.5, -1.0]}]});
        assert_eq!(parse_openai_response(&openai).unwrap(), vec![0.5, -1.0]);

        let ollama = serde_json::json!({"embeddings": [[1.0, 2.0, 3.0]]});
        assert_eq!(parse_ollama_response(&ollama).unwrap(), vec![1.0, 2.0, 3.0]);

        let broken = serde_json::json!({"data": []});
        assert!(matches!(parse_openai_response(&broken), Err(Error::Encoding(_))));
        assert!(check_dims(vec![1.0], 2).is_err());
    }
}
