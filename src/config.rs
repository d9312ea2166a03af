use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub similarity: SimilarityConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Number of messages replayed to a connection on room join.
    #[serde(default = "default_history_limit")]
    pub history_limit: i64,
}

fn default_history_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// HMAC-SHA256 signing secret shared by the HTTP and WebSocket surfaces.
    pub secret: String,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: i64,
}

fn default_token_ttl_secs() -> i64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Base URL of the embedding sidecar (remote provider only).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            url: None,
            model: None,
            dims: None,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct SimilarityConfig {
    /// Default score floor for `similar-by-image` when the caller omits one.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,
    /// Default score floor for `deduplicate`.
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f64,
    /// Hard cap on `top_k` for both ranking endpoints.
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            min_similarity: default_min_similarity(),
            dedup_threshold: default_dedup_threshold(),
            max_top_k: default_max_top_k(),
        }
    }
}

fn default_min_similarity() -> f64 {
    0.0
}
fn default_dedup_threshold() -> f64 {
    0.85
}
fn default_max_top_k() -> usize {
    50
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.auth.secret.is_empty() {
        anyhow::bail!("auth.secret must not be empty");
    }

    if config.auth.token_ttl_secs < 1 {
        anyhow::bail!("auth.token_ttl_secs must be >= 1");
    }

    if !(0.0..=1.0).contains(&config.similarity.min_similarity) {
        anyhow::bail!("similarity.min_similarity must be in [0.0, 1.0]");
    }

    if !(0.0..=1.0).contains(&config.similarity.dedup_threshold) {
        anyhow::bail!("similarity.dedup_threshold must be in [0.0, 1.0]");
    }

    if config.similarity.max_top_k == 0 {
        anyhow::bail!("similarity.max_top_k must be >= 1");
    }

    if config.server.history_limit < 1 {
        anyhow::bail!("server.history_limit must be >= 1");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.provider == "remote" && config.embedding.url.is_none() {
            anyhow::bail!("embedding.url must be set when provider is 'remote'");
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "remote" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or remote.",
            other
        ),
    }

    Ok(config)
}
