//! Configuration types.
//!
//! Everything is read from environment variables with parsed defaults.

use std::time::Duration;

use crate::error::ConfigError;
use crate::lead::Stage;

/// Default system prompt for the sales assistant.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a friendly sales assistant for a solar energy cooperative. You talk to \
prospects over chat, in Brazilian Portuguese, in short informal messages.

Funnel stages:
0 - greeting, find out how they found us
1 - understand their situation (home or business, average bill)
2 - ask for a photo or PDF of the latest electricity bill
3 - lead is qualified: bill received or average consumption known
4 - collect registration data (name, CPF/CNPJ, email, full address)
5 - present the savings proposal and invite to sign
6 - closed: a human consultant takes over

Never invent savings numbers: only quote the numbers given to you in the \
context. If the contact asks for a person, set interest_level to \"humano\".";

/// Default apology sent when the language model is unavailable.
pub const DEFAULT_APOLOGY_MESSAGE: &str =
    "Desculpe, tive um probleminha técnico aqui. Pode me mandar sua última mensagem de novo?";

/// Core engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Stage at (or above) which a lead counts as qualified.
    pub qualified_threshold: Stage,
    /// Stage at which the proposal is generated; anything above is closed.
    pub terminal_stage: Stage,
    /// Maximum number of past messages sent to the model.
    pub history_limit: usize,
    /// Upper bound on a single language model call.
    pub llm_timeout: Duration,
    /// Sent when the language model call fails.
    pub apology_message: String,
    pub system_prompt: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            qualified_threshold: Stage(3),
            terminal_stage: Stage(5),
            history_limit: 30,
            llm_timeout: Duration::from_secs(60),
            apology_message: DEFAULT_APOLOGY_MESSAGE.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let qualified_threshold = Stage(env_parse(
            "LEAD_AGENT_QUALIFIED_STAGE",
            defaults.qualified_threshold.value(),
        )?);
        let terminal_stage = Stage(env_parse(
            "LEAD_AGENT_TERMINAL_STAGE",
            defaults.terminal_stage.value(),
        )?);
        if qualified_threshold > terminal_stage {
            return Err(ConfigError::InvalidValue {
                key: "LEAD_AGENT_QUALIFIED_STAGE".into(),
                message: format!(
                    "qualified stage {qualified_threshold} is past terminal stage {terminal_stage}"
                ),
            });
        }

        Ok(Self {
            qualified_threshold,
            terminal_stage,
            history_limit: env_parse("LEAD_AGENT_HISTORY_LIMIT", defaults.history_limit)?,
            llm_timeout: Duration::from_secs(env_parse(
                "LEAD_AGENT_LLM_TIMEOUT_SECS",
                defaults.llm_timeout.as_secs(),
            )?),
            apology_message: std::env::var("LEAD_AGENT_APOLOGY_MESSAGE")
                .unwrap_or(defaults.apology_message),
            system_prompt: std::env::var("LEAD_AGENT_SYSTEM_PROMPT")
                .unwrap_or(defaults.system_prompt),
        })
    }
}

/// Typing-cadence pacing for outbound segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacingConfig {
    /// Delay before the first segment.
    pub first_delay: Duration,
    /// Per-character typing time of the previous segment.
    pub per_char: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random jitter added to every delay after the first.
    pub max_jitter: Duration,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            first_delay: Duration::from_millis(300),
            per_char: Duration::from_millis(40),
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(3000),
            max_jitter: Duration::from_millis(400),
        }
    }
}

impl PacingConfig {
    /// No delays at all (tests, local CLI).
    pub fn immediate() -> Self {
        Self {
            first_delay: Duration::ZERO,
            per_char: Duration::ZERO,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let ms = |key: &str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(Duration::from_millis(env_parse(key, default.as_millis() as u64)?))
        };
        let config = Self {
            first_delay: ms("LEAD_AGENT_FIRST_DELAY_MS", d.first_delay)?,
            per_char: ms("LEAD_AGENT_PER_CHAR_MS", d.per_char)?,
            min_delay: ms("LEAD_AGENT_MIN_DELAY_MS", d.min_delay)?,
            max_delay: ms("LEAD_AGENT_MAX_DELAY_MS", d.max_delay)?,
            max_jitter: ms("LEAD_AGENT_MAX_JITTER_MS", d.max_jitter)?,
        };
        if config.min_delay > config.max_delay {
            return Err(ConfigError::InvalidValue {
                key: "LEAD_AGENT_MIN_DELAY_MS".into(),
                message: "min delay exceeds max delay".into(),
            });
        }
        Ok(config)
    }
}

/// HTTP surface and outbound transport settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: String,
    /// Base URL of the messaging provider's send API.
    pub transport_url: String,
    pub transport_token: Option<String>,
    /// Contact that receives admin alerts over the transport, if any.
    pub admin_contact: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let transport_url = std::env::var("LEAD_AGENT_TRANSPORT_URL")
            .map_err(|_| ConfigError::MissingEnvVar("LEAD_AGENT_TRANSPORT_URL".into()))?;

        Ok(Self {
            port: env_parse("LEAD_AGENT_PORT", 8080)?,
            db_path: std::env::var("LEAD_AGENT_DB_PATH")
                .unwrap_or_else(|_| "./data/lead-agent.db".to_string()),
            transport_url,
            transport_token: std::env::var("LEAD_AGENT_TRANSPORT_TOKEN").ok(),
            admin_contact: std::env::var("LEAD_AGENT_ADMIN_CONTACT")
                .ok()
                .filter(|s| !s.trim().is_empty()),
        })
    }
}

/// Read and parse an env var, falling back to `default` when unset.
fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
