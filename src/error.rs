use std::time::Duration;

use thiserror::Error;

/// Failures of the LLM transport. Never shown to users directly.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("empty response")]
    EmptyResponse,
}

#[derive(Debug, Error)]
pub enum BotError {
    /// The model answered with something that is not the JSON we asked for.
    #[error("could not extract data: {0}")]
    Extraction(String),
    /// Parseable but semantically invalid data.
    #[error("{0}")]
    Validation(String),
    #[error("account '{account}' not found")]
    UnknownAccount { account: String, known: Vec<String> },
    /// Network, timeout, rate limit or ledger failure. Safe to retry.
    #[error("service unavailable: {0}")]
    Transient(String),
    #[error("missing configuration: {0}")]
    Configuration(String),
}

impl BotError {
    pub fn validation(message: impl Into<String>) -> Self {
        BotError::Validation(message.into())
    }

    pub fn extraction(message: impl Into<String>) -> Self {
        BotError::Extraction(message.into())
    }

    pub fn user_message(&self) -> String {
        match self {
            BotError::Extraction(_) => {
                "Sorry, I couldn't make sense of that. Could you be more specific?".to_string()
            }
            BotError::Validation(rule) => {
                format!("I couldn't use that: {}. Please try again.", rule)
            }
            BotError::UnknownAccount { account, known } => {
                if known.is_empty() {
                    format!("⚠️ Account '{}' not found.", account)
                } else {
                    format!(
                        "⚠️ Account '{}' not found among the available accounts: {}",
                        account,
                        known.join(", ")
                    )
                }
            }
            BotError::Transient(_) | BotError::Configuration(_) => {
                "Sorry, something went wrong while processing your message. Please try again."
                    .to_string()
            }
        }
    }
}

impl From<LlmError> for BotError {
    fn from(err: LlmError) -> Self {
        BotError::Transient(err.to_string())
    }
}

impl From<rusqlite::Error> for BotError {
    fn from(err: rusqlite::Error) -> Self {
        BotError::Transient(format!("ledger: {}", err))
    }
}

pub type BotResult<T> = Result<T, BotError>;
