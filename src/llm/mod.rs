//! Language client integration.
//!
//! The pipeline only sees the [`LlmProvider`] trait. Production traffic goes
//! to Anthropic through rig-core, bridged by [`RigAdapter`].

pub mod provider;
mod rig_adapter;

pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::sync::Arc;

use rig::client::CompletionClient;
use secrecy::{ExposeSecret, SecretString};

use crate::error::{ConfigError, LlmError};

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: SecretString,
    pub model: String,
    pub max_tokens: u64,
    pub temperature: f64,
}

impl LlmConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".into()))?;

        let max_tokens = match std::env::var("LEAD_AGENT_MAX_TOKENS") {
            Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "LEAD_AGENT_MAX_TOKENS".into(),
                message: format!("'{raw}' is not a token count"),
            })?,
            Err(_) => 1024,
        };
        let temperature = match std::env::var("LEAD_AGENT_TEMPERATURE") {
            Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "LEAD_AGENT_TEMPERATURE".into(),
                message: format!("'{raw}' is not a number"),
            })?,
            Err(_) => 0.4,
        };

        Ok(Self {
            api_key: SecretString::from(api_key),
            model: std::env::var("LEAD_AGENT_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string()),
            max_tokens,
            temperature,
        })
    }
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {}", e),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(Arc::new(
        RigAdapter::new(model, &config.model).with_defaults(config.max_tokens, config.temperature),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_provider_constructs_without_network() {
        // rig clients accept any key at construction; auth fails on first request.
        let config = LlmConfig {
            api_key: SecretString::from("test-key".to_string()),
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 512,
            temperature: 0.2,
        };
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.model_name(), "claude-sonnet-4-20250514");
    }
}
