use std::net::SocketAddr;
use tracing::Level;

/// Why a bridge refused to start: a credential or listener setting was
/// absent or unusable. Raised before any socket is bound.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(String),
    #[error("environment variable {0} is unusable: {1}")]
    InvalidValue(String, String),
}

fn require(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingVar(name.to_string()))
}

fn bind_address(name: &str, default: &str) -> Result<SocketAddr, ConfigError> {
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<SocketAddr>()
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string()))
}

fn log_level() -> Result<Level, ConfigError> {
    let raw = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
    raw.parse::<Level>().map_err(|_| {
        ConfigError::InvalidValue(
            "RUST_LOG".to_string(),
            format!("'{}' is not a valid log level", raw),
        )
    })
}

/// Configuration for the Doubao dialogue bridge, loaded at startup.
#[derive(Clone, Debug)]
pub struct DoubaoConfig {
    pub bind_address: SocketAddr,
    pub app_id: String,
    pub access_key: String,
    /// Loaded alongside the other credentials; the realtime handshake itself
    /// authenticates with the app id and access key only.
    pub secret_key: String,
    pub speaker: String,
    pub log_level: Level,
}

impl DoubaoConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        Ok(Self {
            bind_address: bind_address("DOUBAO_BIND_ADDRESS", "0.0.0.0:3001")?,
            app_id: require("DOUBAO_APP_ID")?,
            access_key: require("DOUBAO_ACCESS_KEY")?,
            secret_key: require("DOUBAO_SECRET_KEY")?,
            speaker: std::env::var("DOUBAO_SPEAKER")
                .unwrap_or_else(|_| voicerelay_protocol::dialog::DEFAULT_SPEAKER.to_string()),
            log_level: log_level()?,
        })
    }
}

/// Configuration for the GLM pass-through bridge.
#[derive(Clone, Debug)]
pub struct GlmConfig {
    pub bind_address: SocketAddr,
    pub api_key: String,
    pub log_level: Level,
}

impl GlmConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        Ok(Self {
            bind_address: bind_address("GLM_BIND_ADDRESS", "0.0.0.0:3000")?,
            api_key: require("API_KEY")?,
            log_level: log_level()?,
        })
    }
}
