use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::BotError;

#[derive(Debug, Clone)]
pub struct Config {
    openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_max_tokens: u32,
    pub openai_base_url: String,
    pub llm_timeout: Duration,
    pub database_path: PathBuf,
    pub state_file: PathBuf,
    pub target_channel_id: String,
    pub default_cost_center: String,
}

impl Config {
    /// Reads the process environment after loading `.env`, if there is one.
    pub fn from_env() -> Result<Self, BotError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, BotError> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let or = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let openai_max_tokens = match var("OPENAI_MAX_TOKENS") {
            Some(raw) => raw.parse().map_err(|_| {
                BotError::Configuration(format!("OPENAI_MAX_TOKENS is not a number: {}", raw))
            })?,
            None => 1024,
        };
        let timeout_secs: u64 = match var("LLM_TIMEOUT_SECS") {
            Some(raw) => raw.parse().map_err(|_| {
                BotError::Configuration(format!("LLM_TIMEOUT_SECS is not a number: {}", raw))
            })?,
            None => 30,
        };

        Ok(Config {
            openai_api_key: var("OPENAI_API_KEY"),
            openai_model: or("OPENAI_MODEL", "gpt-4o"),
            openai_max_tokens,
            openai_base_url: or("OPENAI_BASE_URL", "https://api.openai.com"),
            llm_timeout: Duration::from_secs(timeout_secs),
            database_path: PathBuf::from(or("DATABASE_PATH", "data/ledger.sqlite")),
            state_file: PathBuf::from(or("STATE_FILE", "state.json")),
            target_channel_id: or("TARGET_CHANNEL_ID", "main"),
            default_cost_center: or("DEFAULT_COST_CENTER", "operating"),
        })
    }

    /// Only the bot itself needs the key; ledger maintenance runs without it.
    pub fn openai_api_key(&self) -> Result<&str, BotError> {
        self.openai_api_key.as_deref().ok_or_else(|| {
            BotError::Configuration(
                "OPENAI_API_KEY is not set. Set it in .env or as an environment variable".to_string(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, BotError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[("OPENAI_API_KEY", "sk-test")]).unwrap();
        assert_eq!(config.openai_api_key().unwrap(), "sk-test");
        assert_eq!(config.openai_model, "gpt-4o");
        assert_eq!(config.openai_max_tokens, 1024);
        assert_eq!(config.llm_timeout, Duration::from_secs(30));
        assert_eq!(config.database_path, PathBuf::from("data/ledger.sqlite"));
        assert_eq!(config.target_channel_id, "main");
        assert_eq!(config.default_cost_center, "operating");
    }

    #[test]
    fn missing_key_is_a_configuration_error() {
        let config = load(&[("OPENAI_API_KEY", "  ")]).unwrap();
        assert!(matches!(
            config.openai_api_key(),
            Err(BotError::Configuration(_))
        ));
    }

    #[test]
    fn overrides_and_bad_numbers() {
        let config = load(&[("OPENAI_MODEL", "gpt-4o-mini"), ("LLM_TIMEOUT_SECS", "5")]).unwrap();
        assert_eq!(config.openai_model, "gpt-4o-mini");
        assert_eq!(config.llm_timeout, Duration::from_secs(5));

        let err = load(&[("OPENAI_MAX_TOKENS", "lots")]).unwrap_err();
        assert!(err.to_string().contains("OPENAI_MAX_TOKENS"));
    }
}
