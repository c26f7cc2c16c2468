//! Configuration for mandi-server.
//!
//! Supports loading from TOML file with environment variable overrides.
//! Credentials come from the environment, never from the config file.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Logging level.
    pub log_level: LogLevel,

    /// Realtime gateway settings.
    pub gateway: GatewaySection,

    /// REST API settings.
    pub api: ApiSection,

    /// Language-model oracle settings.
    pub oracle: OracleSection,

    /// Payment gateway settings.
    pub payment: PaymentSection,
}

/// Logging level wrapper so the TOML stays a plain string.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct LogLevel(pub String);

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel("info".to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    /// WebSocket port.
    pub port: u16,
    /// Maximum concurrent clients.
    pub max_clients: usize,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            port: 3001,
            max_clients: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    /// HTTP port.
    pub port: u16,
    /// Enable CORS for frontend development.
    pub enable_cors: bool,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            port: 3002,
            enable_cors: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct OracleSection {
    /// Gemini API keys. Filled from the environment; multiple keys form the
    /// rotation ring.
    #[serde(skip)]
    pub api_keys: Vec<String>,
    /// Custom API base URL (tests point this at a local stub).
    pub base_url: Option<String>,
    /// Model name override.
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PaymentSection {
    /// Razorpay key id (from environment).
    #[serde(skip)]
    pub key_id: Option<String>,
    /// Razorpay key secret (from environment).
    #[serde(skip)]
    pub key_secret: Option<String>,
    /// Custom API base URL.
    pub base_url: Option<String>,
}

impl PaymentSection {
    /// Both credentials present.
    pub fn is_configured(&self) -> bool {
        self.key_id.is_some() && self.key_secret.is_some()
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML config")
    }

    /// Apply environment variable overrides for sensitive values.
    pub fn apply_env_overrides(&mut self) {
        // Gemini keys: GEMINI_API_KEY plus numbered fallbacks form the ring.
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            self.oracle.api_keys.push(key);
        }
        for n in 1..=5 {
            if let Ok(key) = std::env::var(format!("GEMINI_API_KEY_{n}")) {
                self.oracle.api_keys.push(key);
            }
        }

        if let Ok(key_id) = std::env::var("RAZORPAY_KEY_ID") {
            self.payment.key_id = Some(key_id);
        }
        if let Ok(secret) = std::env::var("RAZORPAY_KEY_SECRET") {
            self.payment.key_secret = Some(secret);
        }

        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse() {
                self.gateway.port = port;
            }
        }
        if let Ok(port) = std::env::var("API_PORT") {
            if let Ok(port) = port.parse() {
                self.api.port = port;
            }
        }
    }

    /// Validate configuration and return errors for invalid values.
    pub fn validate(&self) -> Result<()> {
        if self.oracle.api_keys.iter().all(|k| k.trim().is_empty()) {
            bail!("At least one Gemini API key is required (GEMINI_API_KEY)");
        }
        if self.gateway.port == self.api.port {
            bail!("Gateway and API ports must differ");
        }
        if self.payment.key_id.is_some() != self.payment.key_secret.is_some() {
            bail!("RAZORPAY_KEY_ID and RAZORPAY_KEY_SECRET must be set together");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.oracle.api_keys.push("test-key".to_string());
        config
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.gateway.port, 3001);
        assert_eq!(config.api.port, 3002);
        assert!(config.api.enable_cors);
        assert_eq!(config.log_level.0, "info");
    }

    #[test]
    fn test_parse_toml() {
        let config = ServerConfig::from_toml_str(
            r#"
            log_level = "debug"

            [gateway]
            port = 4001
            max_clients = 50

            [api]
            port = 4002
            enable_cors = false
            "#,
        )
        .unwrap();
        assert_eq!(config.log_level.0, "debug");
        assert_eq!(config.gateway.port, 4001);
        assert_eq!(config.gateway.max_clients, 50);
        assert!(!config.api.enable_cors);
    }

    #[test]
    fn test_validate_requires_oracle_key() {
        let config = ServerConfig::default();
        assert!(config.validate().is_err());
        assert!(configured().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_port_clash() {
        let mut config = configured();
        config.api.port = config.gateway.port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_half_payment_credentials() {
        let mut config = configured();
        config.payment.key_id = Some("rzp_test".to_string());
        assert!(config.validate().is_err());
        config.payment.key_secret = Some("secret".to_string());
        assert!(config.validate().is_ok());
    }
}
