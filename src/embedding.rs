//! Concrete embedding gateways.
//!
//! Implements [`EmbeddingGateway`] for:
//! - **[`DisabledGateway`]**: every call fails; used when `provider = "disabled"`.
//! - **[`OpenAiGateway`]**: `POST {url}/embeddings` (OpenAI or a compatible server).
//! - **[`OllamaGateway`]**: `POST {url}/api/embed` on a local Ollama instance.
//!
//! # Error classification
//!
//! Gateways never retry. The ingest command owns the retry policy.
//! - Network errors and timeouts → [`Error::Transient`]
//! - HTTP 429 and 5xx → [`Error::Transient`]
//! - Other HTTP errors → [`Error::Collaborator`]
//! - Malformed or short responses → [`Error::Collaborator`]

use std::sync::Arc;

use async_trait::async_trait;

use credence_core::embedding::EmbeddingGateway;
use credence_core::{Error, Result};

use crate::config::EmbeddingConfig;
use crate::http::{classify_send_error, classify_status, http_client};

const OPENAI_DEFAULT_URL: &str = "https://api.openai.com/v1";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

// ============ Disabled Gateway ============

/// Gateway used when embeddings are not configured.
pub struct DisabledGateway {
    dims: usize,
}

#[async_trait]
impl EmbeddingGateway for DisabledGateway {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn max_batch(&self) -> usize {
        1
    }
    async fn embed_one(&self, _text: &str) -> Result<Vec<f32>> {
        Err(disabled())
    }
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(disabled())
    }
}

fn disabled() -> Error {
    Error::Configuration("embedding provider is disabled; set [embedding] provider in config".into())
}

// ============ Shared HTTP plumbing ============

async fn post_json(
    client: &reqwest::Client,
    service: &str,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
) -> Result<serde_json::Value> {
    let mut request = client.post(url).json(body);
    if let Some(token) = bearer {
        request = request.bearer_auth(token);
    }
    let response = request
        .send()
        .await
        .map_err(|e| classify_send_error(service, e))?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(classify_status(service, status, &text));
    }
    response.json().await.map_err(|e| {
        if e.is_decode() {
            Error::Collaborator(format!("Invalid {} response: {}", service, e))
        } else {
            classify_send_error(service, e)
        }
    })
}

fn ensure_count(service: &str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(Error::Collaborator(format!(
            "{} returned {} embeddings for {} inputs",
            service, got, expected
        )));
    }
    Ok(())
}

fn json_vector(service: &str, value: &serde_json::Value) -> Result<Vec<f32>> {
    value
        .as_array()
        .ok_or_else(|| Error::Collaborator(format!("Invalid {} response: embedding is not an array", service)))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| Error::Collaborator(format!("Invalid {} response: non-numeric component", service)))
        })
        .collect()
}

// ============ OpenAI Gateway ============

/// Gateway for the OpenAI embeddings API.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiGateway {
    client: reqwest::Client,
    api_key: String,
    url: String,
    model: String,
    dims: usize,
    batch_size: usize,
}

impl OpenAiGateway {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| OPENAI_DEFAULT_URL.to_string());

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            api_key,
            url: url.trim_end_matches('/').to_string(),
            model,
            dims: config.dims,
            batch_size: config.batch_size,
        })
    }
}

#[async_trait]
impl EmbeddingGateway for OpenAiGateway {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn max_batch(&self) -> usize {
        self.batch_size
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::Collaborator("Empty embedding response".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = post_json(
            &self.client,
            "OpenAI",
            &format!("{}/embeddings", self.url),
            Some(&self.api_key),
            &body,
        )
        .await?;
        let vectors = parse_openai_response(&json)?;
        ensure_count("OpenAI", vectors.len(), texts.len())?;
        Ok(vectors)
    }
}

/// Extract `data[].embedding` arrays, ordered by their `index` field.
pub fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| Error::Collaborator("Invalid OpenAI response: missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| Error::Collaborator("Invalid OpenAI response: missing embedding".into()))?;
        indexed.push((index, json_vector("OpenAI", embedding)?));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Gateway ============

/// Gateway for a local Ollama instance (default `http://localhost:11434`).
pub struct OllamaGateway {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    batch_size: usize,
}

impl OllamaGateway {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| OLLAMA_DEFAULT_URL.to_string());

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: url.trim_end_matches('/').to_string(),
            model,
            dims: config.dims,
            batch_size: config.batch_size,
        })
    }
}

#[async_trait]
impl EmbeddingGateway for OllamaGateway {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn max_batch(&self) -> usize {
        self.batch_size
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::Collaborator("Empty embedding response".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = post_json(
            &self.client,
            "Ollama",
            &format!("{}/api/embed", self.url),
            None,
            &body,
        )
        .await?;
        let vectors = parse_ollama_response(&json)?;
        ensure_count("Ollama", vectors.len(), texts.len())?;
        Ok(vectors)
    }
}

pub fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| Error::Collaborator("Invalid Ollama response: missing embeddings array".into()))?
        .iter()
        .map(|v| json_vector("Ollama", v))
        .collect()
}

/// Create the gateway named by `[embedding] provider`.
///
/// | Config Value | Gateway |
/// |-------------|---------|
/// | `"disabled"` | [`DisabledGateway`] |
/// | `"openai"` | [`OpenAiGateway`] |
/// | `"ollama"` | [`OllamaGateway`] |
pub fn create_gateway(config: &EmbeddingConfig) -> anyhow::Result<Arc<dyn EmbeddingGateway>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGateway { dims: config.dims })),
        "openai" => Ok(Arc::new(OpenAiGateway::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaGateway::new(config)?)),
        other => anyhow::bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_openai_response_sorted_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]},
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_openai_response_missing_data() {
        let err = parse_openai_response(&serde_json::json!({"error": "nope"})).unwrap_err();
        assert!(matches!(err, Error::Collaborator(_)));
    }

    #[test]
    fn test_ollama_response_rejects_non_numeric() {
        let json = serde_json::json!({"embeddings": [[1.0, "x"]]});
        assert!(parse_ollama_response(&json).is_err());

        let json = serde_json::json!({"embeddings": [[1.0, 2.0], [3.0, 4.0]]});
        assert_eq!(parse_ollama_response(&json).unwrap().len(), 2);
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status("x", StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(classify_status("x", StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(!classify_status("x", StatusCode::UNAUTHORIZED, "").is_retryable());
        assert!(matches!(
            classify_status("x", StatusCode::BAD_REQUEST, "bad"),
            Error::Collaborator(_)
        ));
    }

    #[tokio::test]
    async fn test_disabled_gateway_fails_with_configuration_error() {
        let gateway = create_gateway(&EmbeddingConfig::default()).unwrap();
        assert_eq!(gateway.model_name(), "disabled");
        let err = gateway.embed_one("hello").await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_unknown_provider() {
        let config = EmbeddingConfig {
            provider: "magic".into(),
            ..EmbeddingConfig::default()
        };
        assert!(create_gateway(&config).is_err());
    }
}
