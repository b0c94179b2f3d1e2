use anyhow::{anyhow, Result};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::models::{ActionDecision, ConversationContext, Intent, MessageIntent, ReplyAction};
use crate::services::openai::{LlmService, UserContent};
use crate::utils::parse_model_json;

pub const ACTION_APOLOGY: &str = "Sorry, I couldn't process your reply. Please try again.";

const TRANSFER_WORDS: &[&str] = &["transferred", "transfer", "moved", "sent", "to"];
const EXPENSE_WORDS: &[&str] = &["spent", "bought", "paid", "purchased", "market", "pharmacy"];
const CONFIRM_WORDS: &[&str] = &[
    "yes",
    "ok",
    "okay",
    "confirm",
    "correct",
    "go ahead",
    "looks good",
    "sure",
];
const EDIT_WORDS: &[&str] = &["change", "swap", "fix", "replace", "edit"];
const HELP_WORDS: &[&str] = &["help", "commands"];

const INTENT_PROMPT: &str = r#"You analyse chat messages to identify what the user intends.

Return ONLY a valid JSON object:
{
    "intent": "transfer|expense|command|other",
    "confidence": 0.95,
    "extracted_data": {}
}

Intents:
- transfer: the user reports money moved between two of their accounts (e.g. "moved 3000 from checking to savings")
- expense: the user reports a purchase or payment (e.g. "spent $50 at the market", "bought lunch for 30")
- command: the user typed a bot command (e.g. "/status", "/help")
- other: anything not related to personal finances

For transfers put {"amount": 5000.0, "source_account": "...", "destination_account": "..."} in extracted_data.
For expenses put {"amount": 50.0, "establishment": "..."} in extracted_data.
Answer with the JSON only."#;

const ACTION_PROMPT: &str = r#"You interpret replies inside a thread where a bot is reviewing a receipt classification or a transfer with the user.

Return ONLY a valid JSON object:
{
    "action": "confirm|edit|account|help|error",
    "message": "short message for the user"
}

Actions:
- confirm: the user accepts what was shown (yes, ok, go ahead) WITHOUT naming an account and WITHOUT corrections
- edit: the user wants something changed (change, swap, fix, correct a value) OR states that something "is" different from what was shown
- account: the user names an account, alone or together with a confirmation (e.g. "ok, Checking Account", "yes, savings")
- help: the user asks for help
- error: the reply cannot be interpreted

Rules:
- confirmation plus an account name is "account", never "confirm"
- a corrected value or category ("X is actually Y", "the total is Z", "everything is Food") is "edit", never "confirm", even with affirmative words
- "classify everything as X" is "edit"
Answer with the JSON only."#;

const ACCOUNT_PROMPT: &str = r#"You identify which bank account a user is referring to.

Reply with EXACTLY one account name copied from the provided list, or NOT_IDENTIFIED if none matches. No other text."#;

pub struct IntentClassifier {
    llm: LlmService,
}

impl IntentClassifier {
    pub fn new(llm: LlmService) -> Self {
        IntentClassifier { llm }
    }

    pub async fn detect_intent(&self, text: &str) -> MessageIntent {
        let request = self
            .llm
            .json_request(
                INTENT_PROMPT,
                UserContent::Text(format!(
                    "User message: \"{}\"\n\nIdentify the intent and return the JSON.",
                    text
                )),
            )
            .with_max_tokens(200);

        match self.llm.complete(request).await {
            Ok(raw) => match parse_intent(&raw) {
                Ok(intent) => {
                    info!(intent = ?intent.intent, confidence = intent.confidence, "Detected intent");
                    intent
                }
                Err(err) => {
                    warn!(error = %err, reply = %raw, "Unusable intent reply, using keywords");
                    fallback_intent(text)
                }
            },
            Err(err) => {
                error!(error = %err, "Intent detection failed");
                MessageIntent::new(Intent::Other, 0.0)
            }
        }
    }

    pub async fn decide_action(&self, reply: &str, context: &ConversationContext) -> ActionDecision {
        let context_json = serde_json::to_string(context).unwrap_or_else(|_| "{}".to_string());
        let request = self
            .llm
            .json_request(
                ACTION_PROMPT,
                UserContent::Text(format!(
                    "User reply: \"{}\"\n\nContext: {}\n\nAnswer with the action JSON only.",
                    reply, context_json
                )),
            )
            .with_max_tokens(200);

        match self.llm.complete(request).await {
            Ok(raw) => match parse_action(&raw) {
                Ok(decision) => {
                    info!(action = ?decision.action, "Decided reply action");
                    decision
                }
                Err(err) => {
                    warn!(error = %err, reply = %raw, "Unusable action reply, using keywords");
                    fallback_action(reply)
                }
            },
            Err(err) => {
                error!(error = %err, "Action classification failed");
                ActionDecision::new(ReplyAction::Error, ACTION_APOLOGY)
            }
        }
    }

    /// Resolves the account a reply refers to. Falls back to the trimmed
    /// reply itself, which callers check against `accounts`.
    pub async fn identify_account(&self, reply: &str, accounts: &[String]) -> String {
        let raw_reply = reply.trim().to_string();
        if accounts.is_empty() {
            return raw_reply;
        }
        if let Some(account) = match_known_account(reply, accounts) {
            return account;
        }

        let request = self
            .llm
            .json_request(
                ACCOUNT_PROMPT,
                UserContent::Text(format!(
                    "User text: \"{}\"\n\nAvailable accounts: {}\n\nName the account or answer NOT_IDENTIFIED.",
                    reply,
                    accounts.join(", ")
                )),
            )
            .with_max_tokens(50)
            .plain_text();

        match self.llm.complete(request).await {
            Ok(answer) => {
                let answer = answer.trim().trim_matches(|c: char| c == '"' || c == '\'' || c == '`');
                match accounts
                    .iter()
                    .find(|account| account.eq_ignore_ascii_case(answer.trim()))
                {
                    Some(account) => {
                        info!(account = %account, "Identified account");
                        account.clone()
                    }
                    None => raw_reply,
                }
            }
            Err(err) => {
                warn!(error = %err, "Account identification failed");
                raw_reply
            }
        }
    }
}

fn parse_intent(raw: &str) -> Result<MessageIntent> {
    let value = parse_model_json(raw)?;
    let intent = value
        .get("intent")
        .and_then(Value::as_str)
        .and_then(Intent::parse)
        .ok_or_else(|| anyhow!("missing or unknown 'intent'"))?;
    let confidence = value
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(0.5)
        .clamp(0.0, 1.0);
    let extracted_data = match value.get("extracted_data") {
        Some(data @ Value::Object(_)) => data.clone(),
        _ => Value::Object(Default::default()),
    };
    Ok(MessageIntent {
        intent,
        confidence,
        extracted_data,
    })
}

fn parse_action(raw: &str) -> Result<ActionDecision> {
    let value = parse_model_json(raw)?;
    let action = value
        .get("action")
        .and_then(Value::as_str)
        .and_then(ReplyAction::parse)
        .ok_or_else(|| anyhow!("missing or unknown 'action'"))?;
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Ok(ActionDecision::new(action, message))
}

pub fn fallback_intent(text: &str) -> MessageIntent {
    if mentions_any(text, TRANSFER_WORDS) {
        MessageIntent::new(Intent::Transfer, 0.7)
    } else if mentions_any(text, EXPENSE_WORDS) {
        MessageIntent::new(Intent::Expense, 0.7)
    } else {
        MessageIntent::new(Intent::Other, 0.5)
    }
}

pub fn fallback_action(reply: &str) -> ActionDecision {
    if mentions_any(reply, CONFIRM_WORDS) {
        ActionDecision::new(ReplyAction::Confirm, "Confirmation received")
    } else if mentions_any(reply, EDIT_WORDS) {
        ActionDecision::new(ReplyAction::Edit, "Editing")
    } else if mentions_any(reply, HELP_WORDS) {
        ActionDecision::new(ReplyAction::Help, "Showing help")
    } else {
        ActionDecision::new(ReplyAction::Account, "Treating the reply as an account")
    }
}

/// Longest known account whose name appears in the reply, ignoring case.
pub fn match_known_account(reply: &str, accounts: &[String]) -> Option<String> {
    let reply = reply.to_lowercase();
    accounts
        .iter()
        .filter(|account| !account.trim().is_empty())
        .filter(|account| reply.contains(&account.trim().to_lowercase()))
        .max_by_key(|account| account.trim().len())
        .cloned()
}

// Single words must match a whole word; phrases match anywhere.
fn mentions_any(text: &str, keywords: &[&str]) -> bool {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect();
    keywords.iter().any(|keyword| {
        if keyword.contains(' ') {
            lower.contains(keyword)
        } else {
            words.contains(keyword)
        }
    })
}
