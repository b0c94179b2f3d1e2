use anyhow::Result;
use chrono::NaiveDate;
use jsonschema::JSONSchema;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::error::{BotError, BotResult};
use crate::models::{TransferData, MAX_AMOUNT};
use crate::services::openai::{compile_schema, LlmService, UserContent};
use crate::utils::{decimal_from_value, resolve_date, today};

const EDITABLE_FIELDS: &[&str] = &[
    "amount",
    "source_account",
    "destination_account",
    "transfer_date",
    "description",
];

pub struct TransferService {
    llm: LlmService,
    extract_schema: JSONSchema,
    edit_schema: JSONSchema,
}

impl TransferService {
    pub fn new(llm: LlmService) -> Result<Self> {
        Ok(TransferService {
            llm,
            extract_schema: compile_schema(&extract_schema())?,
            edit_schema: compile_schema(&json!({"type": "object"}))?,
        })
    }

    pub async fn extract(&self, text: &str, known_accounts: &[String]) -> BotResult<TransferData> {
        let today = today();
        let request = self.llm.json_request(
            extract_prompt(known_accounts, today),
            UserContent::Text(format!(
                "User message: \"{}\"\n\nAvailable accounts: {}\n\nProcess this transfer and return the JSON.",
                text,
                known_accounts.join(", ")
            )),
        );

        let value = self.llm.complete_json(request, &self.extract_schema).await?;
        let transfer = parse_transfer(&value, today)?;
        info!(
            amount = %transfer.amount,
            source = %transfer.source_account,
            destination = %transfer.destination_account,
            "Extracted transfer"
        );
        Ok(transfer)
    }

    /// Asks the model for the changed fields only and merges them onto
    /// `current`. The result is validated as a whole.
    pub async fn edit(&self, current: &TransferData, command: &str) -> BotResult<TransferData> {
        let current_json =
            serde_json::to_string(current).map_err(|e| BotError::Transient(e.to_string()))?;
        let request = self
            .llm
            .json_request(
                EDIT_PROMPT,
                UserContent::Text(format!(
                    "Current transfer: {}\nUser command: '{}'\n\nUpdate the transfer as requested and return the JSON.",
                    current_json, command
                )),
            )
            .with_max_tokens(500);

        let patch = self.llm.complete_json(request, &self.edit_schema).await?;
        merge_transfer(current, &patch, today())
    }
}

pub fn validate_transfer(transfer: &TransferData) -> BotResult<()> {
    if transfer.amount.is_sign_negative() || transfer.amount.is_zero() {
        return Err(BotError::validation(
            "the transfer amount must be greater than zero",
        ));
    }
    if transfer.amount > MAX_AMOUNT {
        return Err(BotError::validation(format!(
            "the transfer amount is larger than {}",
            MAX_AMOUNT
        )));
    }
    let source = transfer.source_account.trim();
    let destination = transfer.destination_account.trim();
    if source.is_empty() || destination.is_empty() {
        return Err(BotError::validation(
            "both the source and the destination account are required",
        ));
    }
    if source.eq_ignore_ascii_case(destination) {
        return Err(BotError::validation(
            "the source and destination accounts must be different",
        ));
    }
    Ok(())
}

pub fn parse_transfer(value: &Value, today: NaiveDate) -> BotResult<TransferData> {
    let amount = value
        .get("amount")
        .and_then(decimal_from_value)
        .ok_or_else(|| BotError::validation("the transfer amount is not a number"))?;
    let account = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(|name| name.trim().to_string())
            .unwrap_or_default()
    };
    let raw_date = value
        .get("transfer_date")
        .or_else(|| value.get("date"))
        .and_then(Value::as_str);

    let transfer = TransferData {
        amount,
        source_account: account("source_account"),
        destination_account: account("destination_account"),
        transfer_date: resolve_date(raw_date, today),
        description: normalize_description(value.get("description")),
    };
    validate_transfer(&transfer)?;
    Ok(transfer)
}

/// Overlays the known fields of `patch` onto `current`. The date is only
/// re-checked when the patch changes it.
pub fn merge_transfer(current: &TransferData, patch: &Value, today: NaiveDate) -> BotResult<TransferData> {
    let patch = patch
        .as_object()
        .ok_or_else(|| BotError::extraction("transfer edit is not an object"))?;
    let mut merged = match serde_json::to_value(current) {
        Ok(Value::Object(fields)) => fields,
        _ => Map::new(),
    };

    let mut date_changed = false;
    for (key, value) in patch {
        let key = if key == "date" { "transfer_date" } else { key.as_str() };
        if !EDITABLE_FIELDS.contains(&key) {
            continue;
        }
        date_changed |= key == "transfer_date";
        merged.insert(key.to_string(), value.clone());
    }

    let mut transfer = parse_transfer(&Value::Object(merged), today)?;
    if !date_changed {
        transfer.transfer_date = current.transfer_date;
    }
    Ok(transfer)
}

fn normalize_description(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty() && !text.eq_ignore_ascii_case("null"))
        .map(str::to_string)
}

fn extract_schema() -> Value {
    json!({
        "type": "object",
        "required": ["amount", "source_account", "destination_account"],
        "properties": {
            "amount": {"type": ["number", "string"]},
            "source_account": {"type": "string"},
            "destination_account": {"type": "string"},
            "date": {"type": ["string", "null"]},
            "description": {"type": ["string", "null"]}
        }
    })
}

fn extract_prompt(accounts: &[String], today: NaiveDate) -> String {
    format!(
        r#"You process transfers between bank accounts.

From the user's message identify:
1. the transfer amount
2. the source account (where the money leaves)
3. the destination account (where the money arrives)
4. the transfer date
5. a custom description, if the user gave one

Available accounts: {accounts}

Rules:
- ALWAYS use today's date ({today}) unless the message clearly states a different one
- pick the available account closest to the name the user mentioned
- if no account matches, use exactly the name the user mentioned
- if the user gave a reason or description include it, otherwise use null

Return a JSON object with this structure:
{{
    "amount": 0.0,
    "source_account": "source account name",
    "destination_account": "destination account name",
    "date": "{today}",
    "description": "custom description or null"
}}"#,
        accounts = accounts.join(", "),
        today = today.format("%Y-%m-%d"),
    )
}

const EDIT_PROMPT: &str = r#"You edit the details of a pending bank transfer.

The user may want to change the amount, the source account, the destination account, the description, or several of them at once.
Keep the original values when the command is unclear.

Return a JSON object containing only the fields that change, using the keys "amount", "source_account", "destination_account", "date" and "description"."#;
