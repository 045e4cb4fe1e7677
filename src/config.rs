//! Runtime configuration for chat-relay.
//!
//! Non-secret knobs (listen address, upstream URLs, timeouts, model catalogue)
//! load from an optional JSON file. Provider credentials and the handful of
//! deployment overrides come from the environment through [`Cli`].

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound accepted for `max_tokens`, both per request and as a default.
pub const MAX_OUTPUT_TOKENS: u32 = 8192;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "chat-relay", about = "Authenticated chat-completion relay")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address. Takes precedence over `PORT`.
    #[arg(long)]
    pub listen: Option<String>,

    /// Listen port on all interfaces.
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,

    /// Firebase project id.
    #[arg(long, env = "FIREBASE_PROJECT_ID", hide_env_values = true)]
    pub firebase_project_id: Option<String>,

    /// Firebase service-account private key (PEM, `\n` escapes allowed).
    #[arg(
        long,
        env = "FIREBASE_PRIVATE_KEY",
        hide_env_values = true,
        allow_hyphen_values = true
    )]
    pub firebase_private_key: Option<String>,

    /// Firebase service-account client email.
    #[arg(long, env = "FIREBASE_CLIENT_EMAIL", hide_env_values = true)]
    pub firebase_client_email: Option<String>,

    /// API key for the LLM provider.
    #[arg(long, env = "GROQ_API_KEY", hide_env_values = true)]
    pub llm_api_key: Option<String>,

    /// Model used when a request does not name one.
    #[arg(long, env = "DEFAULT_MODEL")]
    pub default_model: Option<String>,

    /// Output-token bound used when a request does not set one.
    #[arg(long, env = "MAX_TOKENS")]
    pub max_tokens: Option<u32>,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Service-account credentials for the identity provider.
#[derive(Clone)]
pub struct ServiceAccount {
    pub project_id: String,
    pub client_email: String,
    pub private_key: String,
}

impl std::fmt::Debug for ServiceAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccount")
            .field("project_id", &self.project_id)
            .field("client_email", &self.client_email)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Secrets resolved from the environment at start-up.
#[derive(Clone)]
pub struct Credentials {
    pub service_account: ServiceAccount,
    pub llm_api_key: String,
}

impl Cli {
    /// Collect provider credentials, failing on the first one that is absent.
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let project_id = non_empty(&self.firebase_project_id)
            .ok_or(ConfigError::Missing("FIREBASE_PROJECT_ID"))?;
        let private_key = non_empty(&self.firebase_private_key)
            .ok_or(ConfigError::Missing("FIREBASE_PRIVATE_KEY"))?;
        let client_email = non_empty(&self.firebase_client_email)
            .ok_or(ConfigError::Missing("FIREBASE_CLIENT_EMAIL"))?;
        let llm_api_key =
            non_empty(&self.llm_api_key).ok_or(ConfigError::Missing("GROQ_API_KEY"))?;

        Ok(Credentials {
            service_account: ServiceAccount {
                project_id,
                client_email,
                // Keys pasted into env files usually carry escaped newlines.
                private_key: private_key.replace("\\n", "\n"),
            },
            llm_api_key,
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// LLM provider configuration.
    pub llm: LlmConfig,

    /// Identity provider configuration.
    pub identity: IdentityConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:3000").
    pub listen: String,

    /// Name reported by the banner and health endpoints.
    pub service_name: String,

    /// Maximum concurrent requests.
    pub max_concurrent_requests: usize,

    /// Maximum accepted request body size in bytes.
    pub body_limit_bytes: usize,

    /// Allowed CORS origins. Empty means any origin.
    pub cors_allowed_origins: Vec<String>,

    /// Include panic messages in 500 responses.
    pub expose_error_details: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3000".to_string(),
            service_name: "EimemesChat AI".to_string(),
            max_concurrent_requests: 256,
            body_limit_bytes: 100 * 1024,
            cors_allowed_origins: Vec::new(),
            expose_error_details: false,
        }
    }
}

/// An entry of the static model catalogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "maxTokens")]
    pub max_tokens: u32,
}

impl ModelInfo {
    fn new(id: &str, name: &str, max_tokens: u32) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            max_tokens,
        }
    }
}

/// LLM provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of the OpenAI-compatible API (without `/chat/completions`).
    pub base_url: String,

    /// Model used when the request names none.
    pub default_model: String,

    /// Output-token bound used when the request sets none.
    pub default_max_tokens: u32,

    /// Sampling temperature used when the request sets none.
    pub default_temperature: f64,

    /// System prompt used when the request sets none.
    pub system_prompt: String,

    /// Connect timeout for the shared HTTP client.
    pub connect_timeout_secs: u64,

    /// Bound on a non-streaming call, and on a streaming call until headers arrive.
    pub request_timeout_secs: u64,

    /// Longest gap tolerated between two chunks of a streaming response.
    pub stream_idle_timeout_secs: u64,

    /// Models advertised by `GET /api/chat/models`.
    pub models: Vec<ModelInfo>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.groq.com/openai/v1".to_string(),
            default_model: "llama3-8b-8192".to_string(),
            default_max_tokens: 1024,
            default_temperature: 0.7,
            system_prompt: "You are EimemesChat AI, a friendly and knowledgeable assistant. \
                            Answer clearly and concisely."
                .to_string(),
            connect_timeout_secs: 10,
            request_timeout_secs: 60,
            stream_idle_timeout_secs: 30,
            models: vec![
                ModelInfo::new("llama3-8b-8192", "Llama 3 8B", 8192),
                ModelInfo::new("llama3-70b-8192", "Llama 3 70B", 8192),
                ModelInfo::new("mixtral-8x7b-32768", "Mixtral 8x7B", 32768),
            ],
        }
    }
}

/// Identity provider endpoints and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// JWK set used to verify ID tokens.
    pub jwks_url: String,

    /// Issuer prefix; the project id is appended.
    pub issuer_prefix: String,

    /// OAuth2 token endpoint for the service-account grant.
    pub token_url: String,

    /// Identity Toolkit base URL.
    pub identity_toolkit_url: String,

    /// Bound on every identity provider HTTP call.
    pub request_timeout_secs: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            jwks_url: "https://www.googleapis.com/service_accounts/v1/jwk/securetoken@system.gserviceaccount.com"
                .to_string(),
            issuer_prefix: "https://securetoken.google.com/".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            identity_toolkit_url: "https://identitytoolkit.googleapis.com/v1".to_string(),
            request_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Overlay command-line and environment overrides onto the file settings.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(listen) = &cli.listen {
            self.server.listen = listen.clone();
        } else if let Some(port) = cli.port {
            self.server.listen = format!("0.0.0.0:{port}");
        }
        if let Some(model) = non_empty(&cli.default_model) {
            self.llm.default_model = model;
        }
        if let Some(max_tokens) = cli.max_tokens {
            self.llm.default_max_tokens = max_tokens;
        }
    }

    /// Reject settings the relay could never honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_OUTPUT_TOKENS).contains(&self.llm.default_max_tokens) {
            return Err(ConfigError::Invalid {
                field: "llm.default_max_tokens",
                reason: format!("must be between 1 and {MAX_OUTPUT_TOKENS}"),
            });
        }
        if !(0.0..=2.0).contains(&self.llm.default_temperature) {
            return Err(ConfigError::Invalid {
                field: "llm.default_temperature",
                reason: "must be between 0 and 2".to_string(),
            });
        }
        if self.llm.default_model.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "llm.default_model",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
