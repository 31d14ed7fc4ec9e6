//! Embedding providers and vector helpers.
//!
//! Providers are selected by `[embedding].provider`:
//!
//! | Config Value | Provider |
//! |-------------|----------|
//! | `"disabled"` | [`DisabledProvider`], every call fails |
//! | `"hashing"` | [`HashingProvider`], offline token feature hashing |
//! | `"openai"` | [`OpenAIProvider`], `POST /v1/embeddings` |
//! | `"ollama"` | [`OllamaProvider`], `POST /api/embed` |
//! | `"local"` | `LocalProvider`, fastembed (feature `local-embeddings`) |
//!
//! The remote providers retry HTTP 429, 5xx and network errors with
//! exponential backoff (1s, 2s, 4s, ... capped at 32s). Other 4xx responses
//! fail immediately.

use anyhow::{bail, Result};
use std::collections::HashMap;
#[cfg(feature = "local-embeddings")]
use std::sync::OnceLock;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::EmbeddingConfig;

const DEFAULT_HASHING_DIMS: usize = 384;

pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
}

/// Embed a batch of texts with the configured provider, in input order.
///
/// Large inputs are split into `batch_size` requests.
pub async fn embed_texts(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let batch_size = config.batch_size.max(1);
    let mut out = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size) {
        let vectors = embed_batch(config, batch).await?;
        if vectors.len() != batch.len() {
            bail!(
                "Embedding provider returned {} vectors for {} texts",
                vectors.len(),
                batch.len()
            );
        }
        out.extend(vectors);
    }
    Ok(out)
}

async fn embed_batch(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    match config.provider.as_str() {
        "hashing" => {
            let dims = config.dims.unwrap_or(DEFAULT_HASHING_DIMS);
            Ok(texts.iter().map(|t| hashing_embed(t, dims)).collect())
        }
        "openai" => embed_openai(config, texts).await,
        "ollama" => embed_ollama(config, texts).await,
        #[cfg(feature = "local-embeddings")]
        "local" => embed_local(config, texts).await,
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings"),
        "disabled" => bail!("Embedding provider is disabled"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

pub async fn embed_query(config: &EmbeddingConfig, text: &str) -> Result<Vec<f32>> {
    let results = embed_texts(config, &[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
}

// ============ Disabled Provider ============

pub struct DisabledProvider;

impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
}

// ============ Hashing Provider ============

/// Deterministic bag-of-words embedder.
///
/// Each lowercased alphanumeric token is hashed with FNV-1a into one of
/// `dims` buckets with a hash-derived sign, and the result is L2-normalized.
/// Texts sharing vocabulary land close together, which is enough for
/// keyword-heavy FinOps questions and for running the whole pipeline
/// without network access or model downloads.
pub struct HashingProvider {
    dims: usize,
}

impl HashingProvider {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            dims: config.dims.unwrap_or(DEFAULT_HASHING_DIMS),
        }
    }
}

impl EmbeddingProvider for HashingProvider {
    fn model_name(&self) -> &str {
        "hashing"
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

pub fn hashing_embed(text: &str, dims: usize) -> Vec<f32> {
    let mut vec = vec![0.0f32; dims];
    if dims == 0 {
        return vec;
    }
    let lowered = text.to_lowercase();
    for token in lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
    {
        let hash = fnv1a_64(token.as_bytes());
        let bucket = (hash % dims as u64) as usize;
        let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
        vec[bucket] += sign;
    }
    normalize(&mut vec);
    vec
}

fn normalize(vec: &mut [f32]) {
    let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm < f32::EPSILON {
        return;
    }
    for value in vec {
        *value /= norm;
    }
}

fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

// ============ Remote Providers ============

/// Embeddings from the OpenAI API (`POST /v1/embeddings`).
///
/// Needs `embedding.model`, `embedding.dims` and the `OPENAI_API_KEY`
/// environment variable. The recorded model name is what the retrieval
/// index stores, so switching models forces an index rebuild.
pub struct OpenAIProvider {
    /// Model name, e.g. `"text-embedding-3-small"`.
    model: String,
    /// Vector dimensionality, e.g. `1536`.
    dims: usize,
}

impl OpenAIProvider {
    /// Fails when `model` or `dims` is missing from config, or when
    /// `OPENAI_API_KEY` is not set.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = remote_model_and_dims(config, "OpenAI")?;
        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }
        Ok(Self { model, dims })
    }
}

impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

/// Embeddings from a local Ollama server (`POST {url}/api/embed`).
///
/// `embedding.url` defaults to `http://localhost:11434`. No API key.
pub struct OllamaProvider {
    /// Model tag, e.g. `"nomic-embed-text"`.
    model: String,
    dims: usize,
}

impl OllamaProvider {
    /// Fails when `model` or `dims` is missing from config.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = remote_model_and_dims(config, "Ollama")?;
        Ok(Self { model, dims })
    }
}

impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

fn remote_model_and_dims(config: &EmbeddingConfig, label: &str) -> Result<(String, usize)> {
    let model = config
        .model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("embedding.model required for {} provider", label))?;
    let dims = config
        .dims
        .ok_or_else(|| anyhow::anyhow!("embedding.dims required for {} provider", label))?;
    Ok((model, dims))
}

/// One remote embeddings endpoint. Both services accept
/// `{"model": ..., "input": [...]}` and differ only in URL, auth and
/// response shape.
struct RemoteEndpoint {
    label: &'static str,
    url: String,
    bearer: Option<String>,
    parse: fn(&serde_json::Value) -> Result<Vec<Vec<f32>>>,
}

async fn embed_openai(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let api_key =
        std::env::var("OPENAI_API_KEY").map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
    let endpoint = RemoteEndpoint {
        label: "OpenAI",
        url: "https://api.openai.com/v1/embeddings".to_string(),
        bearer: Some(api_key),
        parse: parse_openai_response,
    };
    post_embeddings(config, &endpoint, texts).await
}

async fn embed_ollama(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let base = config.url.as_deref().unwrap_or("http://localhost:11434");
    let endpoint = RemoteEndpoint {
        label: "Ollama",
        url: format!("{}/api/embed", base.trim_end_matches('/')),
        bearer: None,
        parse: parse_ollama_response,
    };
    post_embeddings(config, &endpoint, texts).await
}

/// POST a batch with retry/backoff and return vectors in input order.
///
/// HTTP 429, 5xx and network errors are retried after 1s, 2s, 4s, ...
/// (capped at 32s). Any other non-success status fails immediately.
async fn post_embeddings(
    config: &EmbeddingConfig,
    endpoint: &RemoteEndpoint,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let model = config
        .model
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("embedding.model required"))?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    let body = serde_json::json!({
        "model": model,
        "input": texts,
    });

    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tracing::debug!(provider = endpoint.label, attempt, ?delay, "retrying embeddings request");
            tokio::time::sleep(delay).await;
        }

        let mut request = client.post(endpoint.url.as_str()).json(&body);
        if let Some(key) = &endpoint.bearer {
            request = request.bearer_auth(key);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let json: serde_json::Value = response.json().await?;
                    return (endpoint.parse)(&json);
                }

                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(anyhow::anyhow!(
                        "{} API error {}: {}",
                        endpoint.label,
                        status,
                        body_text
                    ));
                    continue;
                }
                bail!("{} API error {}: {}", endpoint.label, status, body_text);
            }
            Err(e) => {
                last_err = Some(anyhow::anyhow!(
                    "{} connection error at {}: {}",
                    endpoint.label,
                    endpoint.url,
                    e
                ));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        anyhow::anyhow!("{} embedding failed after retries", endpoint.label)
    }))
}

/// Extracts `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        indexed.push((index, json_vector(embedding, "OpenAI")?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Extracts `embeddings[]`, already in input order.
fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?
        .iter()
        .map(|e| json_vector(e, "Ollama"))
        .collect()
}

/// A JSON number array as `f32`s. Non-numeric entries are an error rather
/// than a silent zero.
fn json_vector(value: &serde_json::Value, label: &str) -> Result<Vec<f32>> {
    value
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("Invalid {} response: embedding is not an array", label))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| anyhow::anyhow!("Invalid {} response: non-numeric embedding value", label))
        })
        .collect()
}

// ============ Local Provider (fastembed) ============

/// Runs a sentence-embedding model in-process. The model is downloaded
/// from Hugging Face on first use and stays loaded for the life of the
/// process.
#[cfg(feature = "local-embeddings")]
pub struct LocalProvider {
    model_name: String,
    dims: usize,
}

#[cfg(feature = "local-embeddings")]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = local_model_name(config);
        config_to_fastembed_model(&model_name)?;
        let dims = config.dims.unwrap_or(match model_name.as_str() {
            "bge-base-en-v1.5" => 768,
            _ => 384,
        });
        Ok(Self { model_name, dims })
    }
}

#[cfg(feature = "local-embeddings")]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

#[cfg(feature = "local-embeddings")]
fn local_model_name(config: &EmbeddingConfig) -> String {
    config
        .model
        .clone()
        .unwrap_or_else(|| "all-minilm-l6-v2".to_string())
}

#[cfg(feature = "local-embeddings")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5",
            other
        ),
    }
}

/// Values built once per key and shared afterwards.
///
/// Initialisation runs under the cache lock. A failed build is not cached.
#[cfg_attr(not(feature = "local-embeddings"), allow(dead_code))]
struct ModelCache<T> {
    models: Mutex<HashMap<String, Arc<Mutex<T>>>>,
}

#[cfg_attr(not(feature = "local-embeddings"), allow(dead_code))]
impl<T> ModelCache<T> {
    fn new() -> Self {
        Self {
            models: Mutex::new(HashMap::new()),
        }
    }

    fn get_or_try_init(&self, key: &str, init: impl FnOnce() -> Result<T>) -> Result<Arc<Mutex<T>>> {
        let mut models = self
            .models
            .lock()
            .map_err(|_| anyhow::anyhow!("embedding model cache lock poisoned"))?;
        if let Some(model) = models.get(key) {
            return Ok(Arc::clone(model));
        }
        let model = Arc::new(Mutex::new(init()?));
        models.insert(key.to_string(), Arc::clone(&model));
        Ok(model)
    }
}

#[cfg(feature = "local-embeddings")]
static LOCAL_MODELS: OnceLock<ModelCache<fastembed::TextEmbedding>> = OnceLock::new();

#[cfg(feature = "local-embeddings")]
async fn embed_local(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let model_name = local_model_name(config);
    let fastembed_model = config_to_fastembed_model(&model_name)?;
    let batch_size = config.batch_size;
    let texts = texts.to_vec();

    tokio::task::spawn_blocking(move || {
        let model = LOCAL_MODELS.get_or_init(ModelCache::new).get_or_try_init(&model_name, || {
            tracing::info!(model = %model_name, "loading local embedding model");
            fastembed::TextEmbedding::try_new(
                fastembed::InitOptions::new(fastembed_model).with_show_download_progress(false),
            )
            .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))
        })?;
        let mut guard = model
            .lock()
            .map_err(|_| anyhow::anyhow!("local embedding model lock poisoned"))?;
        guard
            .embed(texts, Some(batch_size))
            .map_err(|e| anyhow::anyhow!("Local embedding failed: {}", e))
    })
    .await?
}

/// Provider metadata for `[embedding]`. The model name it reports is what
/// the retrieval index records and what queries are checked against.
///
/// Fails for unknown providers or incomplete remote/local settings.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "hashing" => Ok(Box::new(HashingProvider::new(config))),
        "openai" => Ok(Box::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Box::new(OllamaProvider::new(config)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Box::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Little-endian f32 bytes, `vec.len() * 4` long.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
