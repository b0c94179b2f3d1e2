use anyhow::Result;
use chrono::NaiveDate;
use jsonschema::JSONSchema;
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::error::{BotError, BotResult};
use crate::models::{
    ClassificationData, TransactionItem, MAX_AMOUNT, UNCLASSIFIED_CATEGORY,
    UNIDENTIFIED_ESTABLISHMENT,
};
use crate::services::openai::{compile_schema, LlmService, UserContent};
use crate::utils::formatters::redistribute;
use crate::utils::{decimal_from_value, image_reference, parse_amount_text, resolve_date, today};

/// Phrases that pin every item to one category, checked in order.
const CATEGORY_LEXICON: &[(&[&str], &str)] = &[
    (&["basic food"], "Food - Basic"),
    (&["superfluous food"], "Food - Superfluous"),
    (&["treats"], "Food - Superfluous"),
    (&["home", "maintenance"], "Home - Maintenance"),
    (&["hygiene"], "Hygiene & Beauty - Basics"),
];

pub struct ClassificationService {
    llm: LlmService,
    document_schema: JSONSchema,
    items_schema: JSONSchema,
}

impl ClassificationService {
    pub fn new(llm: LlmService) -> Result<Self> {
        Ok(ClassificationService {
            llm,
            document_schema: compile_schema(&document_schema())?,
            items_schema: compile_schema(&items_schema())?,
        })
    }

    pub async fn classify_image(
        &self,
        image_ref: &str,
        categories: &[String],
    ) -> BotResult<ClassificationData> {
        let image_url =
            image_reference(image_ref).map_err(|e| BotError::Transient(format!("image: {}", e)))?;
        let request = self.llm.json_request(
            image_prompt(categories),
            UserContent::TextWithImage {
                text: "Classify the items on this receipt and return the JSON.".to_string(),
                image_url,
            },
        );

        let value = self
            .llm
            .complete_json(request, &self.document_schema)
            .await
            .map_err(|err| {
                error!(error = %err, "Receipt classification failed");
                err
            })?;
        let data = parse_classification(&value, categories, today())?;
        info!(items = data.items.len(), total = %data.total(), "Classified receipt");
        Ok(data)
    }

    pub async fn classify_text(
        &self,
        text: &str,
        categories: &[String],
    ) -> BotResult<ClassificationData> {
        let today = today();
        let request = self.llm.json_request(
            text_prompt(categories, today),
            UserContent::Text(format!(
                "User message: \"{}\"\n\nExtract the expense and classify it into the available categories.",
                text
            )),
        );

        let value = self
            .llm
            .complete_json(request, &self.document_schema)
            .await?;
        let data = parse_classification(&value, categories, today)?;
        info!(items = data.items.len(), total = %data.total(), "Classified text expense");
        Ok(data)
    }

    /// Applies a correction. Category phrases and target totals are handled
    /// locally; anything else goes to the model, which must return the
    /// whole updated item list.
    pub async fn edit(
        &self,
        current: &ClassificationData,
        command: &str,
    ) -> BotResult<ClassificationData> {
        if let Some(updated) = deterministic_edit(current, command)? {
            info!("Applied edit without the model");
            return Ok(updated);
        }

        let current_items = serde_json::to_string(&current.items)
            .map_err(|e| BotError::Transient(e.to_string()))?;
        let request = self.llm.json_request(
            EDIT_PROMPT,
            UserContent::Text(format!(
                "Current list: {}\nAvailable categories: {}\nUser command: '{}'\n\nUpdate the list as requested and return the JSON.",
                current_items,
                current.available_categories.join(", "),
                command
            )),
        );

        let value = self.llm.complete_json(request, &self.items_schema).await?;
        let raw_items = match &value {
            Value::Array(items) => items,
            other => other
                .get("items")
                .and_then(Value::as_array)
                .ok_or_else(|| BotError::extraction("edit reply has no item list"))?,
        };
        let items = parse_items(raw_items)?;
        Ok(current.with_items(items))
    }
}

/// Edits that need no model: a known category phrase, a target total, or
/// both. `Ok(None)` when the command carries neither.
pub fn deterministic_edit(
    current: &ClassificationData,
    command: &str,
) -> BotResult<Option<ClassificationData>> {
    let lower = command.to_lowercase();
    let target_total = extract_target_total(&lower);
    let target_category = lexicon_category(&lower, &current.available_categories)
        .or_else(|| blanket_category(&lower, &current.available_categories));

    if target_total.is_none() && target_category.is_none() {
        return Ok(None);
    }

    let mut items = current.items.clone();
    if let Some(category) = &target_category {
        for item in items.iter_mut() {
            item.category = category.clone();
        }
    }
    if let Some(total) = target_total {
        if total > MAX_AMOUNT {
            return Err(BotError::validation(format!(
                "a total of {} is larger than the ledger accepts",
                total
            )));
        }
        items = redistribute(&items, total).ok_or_else(|| {
            BotError::validation("the new total cannot be spread over these amounts")
        })?;
    }
    Ok(Some(current.with_items(items)))
}

/// First positive number after the word "total". Thousands separators are
/// accepted in either convention ("1.234,56" or "1,234.56").
pub fn extract_target_total(lower: &str) -> Option<Decimal> {
    let pattern = Regex::new(r"total[^\d]*?(\d[\d.,]*)").ok()?;
    let captures = pattern.captures(lower)?;
    let total = parse_amount_text(captures.get(1)?.as_str())?;
    (total > Decimal::ZERO).then_some(total)
}

fn lexicon_category(lower: &str, available: &[String]) -> Option<String> {
    CATEGORY_LEXICON
        .iter()
        .find(|(phrases, _)| phrases.iter().all(|phrase| lower.contains(phrase)))
        .map(|(_, category)| {
            available
                .iter()
                .find(|known| known.eq_ignore_ascii_case(category))
                .cloned()
                .unwrap_or_else(|| category.to_string())
        })
}

// "everything as Food", "classify all items into Transport", ...
fn blanket_category(lower: &str, available: &[String]) -> Option<String> {
    let pattern =
        Regex::new(r"\b(?:everything|all(?: items| of it)?)\s+(?:as|to|is|are|into)\s+(.+)$").ok()?;
    let named = pattern.captures(lower)?.get(1)?.as_str().trim();
    let named = named.trim_matches(|c: char| c == '"' || c == '\'' || c == '.' || c == '!');
    available
        .iter()
        .filter(|known| !known.trim().is_empty())
        .filter(|known| named.starts_with(&known.to_lowercase()))
        .max_by_key(|known| known.len())
        .cloned()
}

pub fn parse_classification(
    value: &Value,
    categories: &[String],
    today: NaiveDate,
) -> BotResult<ClassificationData> {
    let establishment = value
        .get("establishment")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(UNIDENTIFIED_ESTABLISHMENT)
        .to_string();
    let purchase_date = resolve_date(value.get("date").and_then(Value::as_str), today);
    let raw_items = value
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| BotError::extraction("reply has no item list"))?;
    let items = parse_items(raw_items)?;

    Ok(ClassificationData {
        establishment,
        purchase_date,
        items,
        available_categories: categories.to_vec(),
    })
}

/// Every item must be complete; one bad entry rejects the whole list.
pub fn parse_items(raw_items: &[Value]) -> BotResult<Vec<TransactionItem>> {
    if raw_items.is_empty() {
        return Err(BotError::validation("no items were found"));
    }
    let items = raw_items
        .iter()
        .enumerate()
        .map(|(index, raw)| parse_item(index + 1, raw))
        .collect::<BotResult<Vec<TransactionItem>>>()?;

    let total = items
        .iter()
        .try_fold(Decimal::ZERO, |sum, item| sum.checked_add(item.amount))
        .filter(|total| *total <= MAX_AMOUNT);
    if total.is_none() {
        return Err(BotError::validation(format!(
            "the items add up to more than {}",
            MAX_AMOUNT
        )));
    }
    Ok(items)
}

fn parse_item(position: usize, raw: &Value) -> BotResult<TransactionItem> {
    let text_field = |key: &str| {
        raw.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    };

    let description = text_field("description")
        .ok_or_else(|| BotError::validation(format!("item {} has no description", position)))?;
    let category = text_field("category")
        .ok_or_else(|| BotError::validation(format!("item '{}' has no category", description)))?;
    let amount = raw
        .get("amount")
        .and_then(decimal_from_value)
        .ok_or_else(|| {
            BotError::validation(format!("item '{}' has a non-numeric amount", description))
        })?;
    if amount > MAX_AMOUNT {
        return Err(BotError::validation(format!(
            "item '{}' is larger than {}",
            description, MAX_AMOUNT
        )));
    }
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(BotError::validation(format!(
            "item '{}' has a negative amount",
            description
        )));
    }

    Ok(TransactionItem {
        description,
        amount,
        category,
    })
}

fn document_schema() -> Value {
    json!({
        "type": "object",
        "required": ["items"],
        "properties": {
            "establishment": {"type": ["string", "null"]},
            "date": {"type": ["string", "null"]},
            "items": {"type": "array", "items": {"type": "object"}}
        }
    })
}

fn items_schema() -> Value {
    json!({
        "anyOf": [
            {"type": "array", "items": {"type": "object"}},
            {
                "type": "object",
                "required": ["items"],
                "properties": {"items": {"type": "array", "items": {"type": "object"}}}
            }
        ]
    })
}

fn image_prompt(categories: &[String]) -> String {
    format!(
        r#"Analyse this picture of a purchase receipt. Extract every item with its amount and classify it into one of these categories: {categories}.
Also identify the establishment where the purchase was made (e.g. supermarket, pharmacy) and the purchase date.
Return a JSON object with this structure:
{{"establishment": "establishment name", "date": "YYYY-MM-DD", "items": [{{"description": "item", "amount": 0.0, "category": "category"}}]}}
If the establishment cannot be identified use "{unidentified}". If the date cannot be read use null.
If you are unsure about the category of an item use "{unclassified}"."#,
        categories = categories.join(", "),
        unidentified = UNIDENTIFIED_ESTABLISHMENT,
        unclassified = UNCLASSIFIED_CATEGORY,
    )
}

fn text_prompt(categories: &[String], today: NaiveDate) -> String {
    format!(
        r#"You classify expenses into categories.

From the user's message extract the amount spent, the establishment or kind of place, and the most appropriate category.

Available categories: {categories}

ALWAYS use today's date ({today}) as the purchase date unless the message clearly states a different one.

Return a JSON object with this structure:
{{
    "establishment": "establishment name or kind of place",
    "date": "{today}",
    "items": [
        {{"description": "item or kind of expense", "amount": 0.0, "category": "most appropriate category"}}
    ]
}}

If the establishment cannot be identified use "{unidentified}".
If you are unsure about the category use "{unclassified}".
If the message mentions several items create one entry for each."#,
        categories = categories.join(", "),
        today = today.format("%Y-%m-%d"),
        unidentified = UNIDENTIFIED_ESTABLISHMENT,
        unclassified = UNCLASSIFIED_CATEGORY,
    )
}

const EDIT_PROMPT: &str = r#"You apply corrections to a JSON list of purchased items.

The user may want to:
- change the category of specific items
- change the category of every item
- correct the amount of specific items
- correct the total (redistributing the amounts proportionally)
- make several changes at once

Rules:
- "classify everything as [category]" changes the category of EVERY item
- a different total means redistributing the amounts proportionally to reach it
- keep the relative proportions between items when possible
- if you cannot understand the command keep the original values

Return a JSON object {"items": [{"description": "...", "amount": 0.0, "category": "..."}]} with the complete updated list."#;
