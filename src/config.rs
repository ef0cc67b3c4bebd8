//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;

/// Vigil configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Discord gateway settings.
    pub discord: DiscordConfig,

    /// LLM provider configuration.
    pub llm: LlmConfig,

    /// Watch-loop behavior settings.
    pub watch: WatchConfig,

    /// Conversational debounce settings.
    pub debounce: DebounceConfig,
}

/// Discord gateway configuration.
#[derive(Debug, Clone)]
pub struct DiscordConfig {
    /// Bot token (from env).
    pub token: String,
}

/// LLM provider configuration.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible endpoint.
    pub base_url: String,

    /// API key (from env).
    pub api_key: Option<String>,

    /// Model used for watcher evaluation calls.
    pub evaluation_model: String,

    /// Model used for response generation calls.
    pub response_model: String,
}

/// Watch-loop behavior configuration.
#[derive(Debug, Clone, Copy)]
pub struct WatchConfig {
    /// Fixed tick interval of each channel's watch loop, in seconds.
    pub tick_secs: u64,

    /// Hard safety ceiling on a single loop's cumulative runtime, in seconds.
    pub loop_ceiling_secs: u64,

    /// Cadence of the independent stale-watcher sweep, in seconds.
    pub sweep_interval_secs: u64,

    /// How many recent channel messages to hand the response collaborator.
    pub context_limit: u8,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            tick_secs: 5,
            loop_ceiling_secs: 3600,
            sweep_interval_secs: 60,
            context_limit: 25,
        }
    }
}

/// Conversational debounce configuration.
#[derive(Debug, Clone, Copy)]
pub struct DebounceConfig {
    /// Rolling delay applied after each qualifying message, in seconds.
    pub initial_delay_secs: u64,

    /// Hard cap on total wait measured from the first burst message, in seconds.
    pub max_delay_secs: u64,

    /// Post-response grace window during which the channel stays hot, in seconds.
    pub hot_window_secs: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: 15,
            max_delay_secs: 60,
            hot_window_secs: 600,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self> {
        let token = std::env::var("VIGIL_DISCORD_TOKEN")
            .map_err(|_| ConfigError::MissingKey("VIGIL_DISCORD_TOKEN".into()))?;
        if token.trim().is_empty() {
            return Err(ConfigError::Invalid("VIGIL_DISCORD_TOKEN is empty".into()).into());
        }

        let llm = LlmConfig {
            base_url: std::env::var("VIGIL_LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key: std::env::var("VIGIL_LLM_API_KEY")
                .or_else(|_| std::env::var("OPENAI_API_KEY"))
                .ok(),
            evaluation_model: std::env::var("VIGIL_EVALUATION_MODEL")
                .unwrap_or_else(|_| "openai/gpt-4o-mini".into()),
            response_model: std::env::var("VIGIL_RESPONSE_MODEL")
                .unwrap_or_else(|_| "openai/gpt-4o".into()),
        };

        if llm.api_key.is_none() {
            return Err(ConfigError::Invalid(
                "No LLM API key found. Set VIGIL_LLM_API_KEY or OPENAI_API_KEY.".into(),
            )
            .into());
        }

        let watch = WatchConfig {
            tick_secs: env_u64("VIGIL_TICK_SECS", WatchConfig::default().tick_secs)?,
            loop_ceiling_secs: env_u64(
                "VIGIL_LOOP_CEILING_SECS",
                WatchConfig::default().loop_ceiling_secs,
            )?,
            sweep_interval_secs: env_u64(
                "VIGIL_SWEEP_INTERVAL_SECS",
                WatchConfig::default().sweep_interval_secs,
            )?,
            context_limit: WatchConfig::default().context_limit,
        };

        let debounce = DebounceConfig {
            initial_delay_secs: env_u64(
                "VIGIL_DEBOUNCE_DELAY_SECS",
                DebounceConfig::default().initial_delay_secs,
            )?,
            max_delay_secs: env_u64(
                "VIGIL_DEBOUNCE_CAP_SECS",
                DebounceConfig::default().max_delay_secs,
            )?,
            hot_window_secs: env_u64(
                "VIGIL_HOT_WINDOW_SECS",
                DebounceConfig::default().hot_window_secs,
            )?,
        };

        Ok(Self {
            discord: DiscordConfig { token },
            llm,
            watch,
            debounce,
        })
    }
}

/// Read an integer env var, falling back to a default when unset.
fn env_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(raw) => {
            let value = raw
                .parse::<u64>()
                .with_context(|| format!("{name} must be an integer, got {raw:?}"))
                .map_err(ConfigError::Other)?;
            Ok(value)
        }
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_defaults() {
        let config = WatchConfig::default();
        assert_eq!(config.tick_secs, 5);
        assert_eq!(config.loop_ceiling_secs, 3600);
        assert_eq!(config.sweep_interval_secs, 60);
    }

    #[test]
    fn test_debounce_defaults() {
        let config = DebounceConfig::default();
        assert_eq!(config.initial_delay_secs, 15);
        assert_eq!(config.max_delay_secs, 60);
        assert_eq!(config.hot_window_secs, 600);
    }

    #[test]
    fn test_env_u64_falls_back_when_unset() {
        let value = env_u64("VIGIL_TEST_UNSET_VARIABLE", 42).expect("default should apply");
        assert_eq!(value, 42);
    }
}
