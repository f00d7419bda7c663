//! TOML configuration parsing and validation.
//!
//! Every section except `[db]` is optional and falls back to the defaults
//! below. [`load_config`] rejects values that would make a later stage
//! misbehave (zero budgets, non-finite thresholds, an enabled embedding
//! provider without a model).

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use credence_core::trust::{InitialTrust, TrustParams};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub trust: TrustConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub include_text: bool,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token_env: default_token_env(),
            page_size: default_page_size(),
            timeout_secs: default_timeout_secs(),
            include_text: true,
        }
    }
}

fn default_token_env() -> String {
    "CREDENCE_FEED_TOKEN".to_string()
}
fn default_page_size() -> usize {
    1000
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// `"bytes"` or a path to a Hugging Face `tokenizer.json`. An enabled
    /// embedding provider requires the model's own tokenizer file.
    #[serde(default = "default_tokenizer")]
    pub tokenizer: String,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            tokenizer: default_tokenizer(),
        }
    }
}

fn default_max_tokens() -> usize {
    4000
}
fn default_tokenizer() -> String {
    "bytes".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum embedding requests in flight during ingestion.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL override (OpenAI-compatible endpoint or Ollama host).
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: default_dims(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_dims() -> usize {
    1536
}
fn default_batch_size() -> usize {
    64
}
fn default_concurrency() -> usize {
    4
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            threshold: default_threshold(),
        }
    }
}

fn default_limit() -> usize {
    100
}
fn default_threshold() -> f64 {
    0.68
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrustConfig {
    #[serde(default = "default_primary_multiplier")]
    pub primary_multiplier: f64,
    #[serde(default = "default_diffusion_multiplier")]
    pub diffusion_multiplier: f64,
    #[serde(default = "default_diffusion_limit")]
    pub diffusion_limit: usize,
    #[serde(default = "default_diffusion_threshold")]
    pub diffusion_threshold: f64,
    /// `"fixed"` or `"hashed"`.
    #[serde(default = "default_initial")]
    pub initial: String,
    #[serde(default = "default_initial_value")]
    pub initial_value: f64,
    #[serde(default = "default_max_cas_attempts")]
    pub max_cas_attempts: u32,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            primary_multiplier: default_primary_multiplier(),
            diffusion_multiplier: default_diffusion_multiplier(),
            diffusion_limit: default_diffusion_limit(),
            diffusion_threshold: default_diffusion_threshold(),
            initial: default_initial(),
            initial_value: default_initial_value(),
            max_cas_attempts: default_max_cas_attempts(),
        }
    }
}

impl TrustConfig {
    pub fn params(&self) -> TrustParams {
        TrustParams {
            primary_multiplier: self.primary_multiplier,
            diffusion_multiplier: self.diffusion_multiplier,
            diffusion_limit: self.diffusion_limit,
            diffusion_threshold: self.diffusion_threshold,
            max_cas_attempts: self.max_cas_attempts,
        }
    }

    /// Resolve the configured initial trust policy. Validated by [`load_config`].
    pub fn initial_policy(&self) -> Result<InitialTrust> {
        match self.initial.as_str() {
            "fixed" => Ok(InitialTrust::Fixed {
                value: self.initial_value,
            }),
            "hashed" => Ok(InitialTrust::Hashed),
            other => bail!(
                "Unknown trust.initial policy: '{}'. Must be fixed or hashed.",
                other
            ),
        }
    }
}

fn default_primary_multiplier() -> f64 {
    0.05
}
fn default_diffusion_multiplier() -> f64 {
    0.02
}
fn default_diffusion_limit() -> usize {
    15
}
fn default_diffusion_threshold() -> f64 {
    0.9
}
fn default_initial() -> String {
    "fixed".to_string()
}
fn default_initial_value() -> f64 {
    0.5
}
fn default_max_cas_attempts() -> u32 {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Retries of a failed ingest run on retryable errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }
    if config.feed.page_size == 0 {
        bail!("feed.page_size must be > 0");
    }

    if config.retrieval.limit == 0 {
        bail!("retrieval.limit must be >= 1");
    }
    if !config.retrieval.threshold.is_finite() {
        bail!("retrieval.threshold must be a finite number");
    }

    let trust = &config.trust;
    for (name, value) in [
        ("trust.primary_multiplier", trust.primary_multiplier),
        ("trust.diffusion_multiplier", trust.diffusion_multiplier),
    ] {
        if !value.is_finite() || value < 0.0 {
            bail!("{} must be a finite number >= 0", name);
        }
    }
    if !trust.diffusion_threshold.is_finite() {
        bail!("trust.diffusion_threshold must be a finite number");
    }
    if !(0.0..=1.0).contains(&trust.initial_value) {
        bail!("trust.initial_value must be in [0.0, 1.0]");
    }
    if trust.max_cas_attempts == 0 {
        bail!("trust.max_cas_attempts must be > 0");
    }
    trust.initial_policy()?;

    let embedding = &config.embedding;
    if embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    if embedding.concurrency == 0 {
        bail!("embedding.concurrency must be > 0");
    }
    if embedding.is_enabled() {
        if embedding.dims == 0 {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                embedding.provider
            );
        }
        if embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                embedding.provider
            );
        }
    }

    match embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if embedding.is_enabled() && config.chunking.tokenizer == "bytes" {
        bail!(
            "chunking.tokenizer must point to the tokenizer.json of the '{}' embedding model; \
             the byte codec does not count model tokens",
            embedding.provider
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse_config("[db]\npath = \"./data/credence.sqlite\"\n").unwrap();
        assert_eq!(config.chunking.max_tokens, 4000);
        assert_eq!(config.feed.page_size, 1000);
        assert_eq!(config.feed.token_env, "CREDENCE_FEED_TOKEN");
        assert_eq!(config.retrieval.limit, 100);
        assert_eq!(config.retrieval.threshold, 0.68);
        assert_eq!(config.embedding.dims, 1536);
        assert!(!config.embedding.is_enabled());
        assert_eq!(config.ingest.max_retries, 5);

        let params = config.trust.params();
        assert_eq!(params.primary_multiplier, 0.05);
        assert_eq!(params.diffusion_multiplier, 0.02);
        assert_eq!(params.diffusion_limit, 15);
        assert_eq!(params.diffusion_threshold, 0.9);
        assert_eq!(
            config.trust.initial_policy().unwrap(),
            InitialTrust::Fixed { value: 0.5 }
        );
    }

    #[test]
    fn test_zero_budget_rejected() {
        let err = parse_config("[db]\npath = \"x\"\n[chunking]\nmax_tokens = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_tokens"));
    }

    #[test]
    fn test_enabled_provider_requires_model() {
        let err = parse_config("[db]\npath = \"x\"\n[embedding]\nprovider = \"openai\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("embedding.model"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = parse_config(
            "[db]\npath = \"x\"\n[embedding]\nprovider = \"magic\"\nmodel = \"m\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn test_enabled_provider_requires_model_tokenizer() {
        let err = parse_config(
            "[db]\npath = \"x\"\n[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("chunking.tokenizer"));

        let config = parse_config(
            "[db]\npath = \"x\"\n[chunking]\ntokenizer = \"models/cl100k/tokenizer.json\"\n\
             [embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\n",
        )
        .unwrap();
        assert!(config.embedding.is_enabled());
    }

    #[test]
    fn test_trust_policy_validation() {
        let config = parse_config("[db]\npath = \"x\"\n[trust]\ninitial = \"hashed\"\n").unwrap();
        assert_eq!(config.trust.initial_policy().unwrap(), InitialTrust::Hashed);

        assert!(parse_config("[db]\npath = \"x\"\n[trust]\ninitial = \"random\"\n").is_err());
        assert!(parse_config("[db]\npath = \"x\"\n[trust]\ninitial_value = 1.5\n").is_err());
        assert!(parse_config("[db]\npath = \"x\"\n[trust]\nprimary_multiplier = -0.1\n").is_err());
    }
}
