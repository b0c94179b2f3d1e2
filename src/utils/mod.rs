pub mod formatters;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use chrono::{Duration, Local, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

/// Dates further back than this are treated as hallucinated.
pub const STALE_AFTER_DAYS: i64 = 30;

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

pub fn format_money(value: Decimal) -> String {
    let mut rounded = value.round_dp(2);
    rounded.rescale(2);
    rounded.to_string()
}

pub fn parse_decimal(value: &str) -> Result<Decimal> {
    let cleaned = value
        .trim()
        .trim_start_matches('$')
        .trim()
        .replace(',', ".");
    Decimal::from_str(&cleaned)
        .or_else(|_| Decimal::from_scientific(&cleaned))
        .map_err(|e| anyhow!("Parse decimal: {}", e))
}

/// Reads an amount typed by a person. The last separator is the decimal
/// point when at most two digits follow it; every other `.` or `,` groups
/// thousands.
pub fn parse_amount_text(raw: &str) -> Option<Decimal> {
    let raw = raw.trim().trim_end_matches(|c: char| c == '.' || c == ',');
    if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_digit() || c == '.' || c == ',') {
        return None;
    }

    let (whole, cents) = match raw.rfind(|c: char| c == '.' || c == ',') {
        Some(pos) if raw.len() - pos - 1 <= 2 => (&raw[..pos], Some(&raw[pos + 1..])),
        _ => (raw, None),
    };
    let digits: String = whole.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    let text = match cents {
        Some(cents) => format!("{}.{}", digits, cents),
        None => digits,
    };
    Decimal::from_str(&text).ok()
}

/// Accepts JSON numbers and numeric strings.
pub fn decimal_from_value(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(number) => parse_decimal(&number.to_string()).ok(),
        Value::String(text) => parse_decimal(text).ok(),
        _ => None,
    }
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let formats = ["%Y-%m-%d", "%d.%m.%Y", "%d/%m/%Y", "%Y/%m/%d", "%Y.%m.%d"];
    formats
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

pub fn is_stale(date: NaiveDate, today: NaiveDate) -> bool {
    date < today - Duration::days(STALE_AFTER_DAYS)
}

pub fn clamp_stale_date(date: NaiveDate, today: NaiveDate) -> NaiveDate {
    if is_stale(date, today) {
        warn!(proposed = %date, replacement = %today, "Discarding stale date");
        today
    } else {
        date
    }
}

/// Missing or unreadable dates become `today`; stale ones are clamped.
pub fn resolve_date(raw: Option<&str>, today: NaiveDate) -> NaiveDate {
    match raw.and_then(parse_date) {
        Some(date) => clamp_stale_date(date, today),
        None => today,
    }
}

pub fn strip_code_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        text = rest.strip_prefix("json").unwrap_or(rest);
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    text.trim()
}

/// Parses a model reply as JSON, tolerating code fences and prose around
/// the outermost object or array.
pub fn parse_model_json(raw: &str) -> Result<Value> {
    let text = strip_code_fences(raw);
    if text.is_empty() {
        return Err(anyhow!("Empty model response"));
    }
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Ok(value);
    }

    let start = text.find(|c| c == '{' || c == '[');
    let end = text.rfind(|c| c == '}' || c == ']');
    match (start, end) {
        (Some(start), Some(end)) if end > start => {
            serde_json::from_str::<Value>(&text[start..=end]).context("Invalid JSON")
        }
        _ => Err(anyhow!("No JSON found in model response")),
    }
}

pub fn has_supported_extension(filename: &str, extensions: &[String]) -> bool {
    let lower = filename.to_lowercase();
    !lower.is_empty() && extensions.iter().any(|ext| lower.ends_with(ext.as_str()))
}

/// Remote references pass through; local files are inlined as data URLs.
pub fn image_reference(raw: &str) -> Result<String> {
    let raw = raw.trim();
    if raw.starts_with("http://") || raw.starts_with("https://") || raw.starts_with("data:") {
        return Ok(raw.to_string());
    }

    let path = Path::new(raw);
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let mime = match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    };
    Ok(format!(
        "data:{};base64,{}",
        mime,
        general_purpose::STANDARD.encode(bytes)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn strips_json_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n[1]\n```"), "[1]");
        assert_eq!(strip_code_fences("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn parses_json_wrapped_in_prose() {
        let value = parse_model_json("Sure! Here it is: {\"action\": \"confirm\"} hope it helps").unwrap();
        assert_eq!(value["action"], "confirm");
        assert!(parse_model_json("no json here").is_err());
        assert!(parse_model_json("```json\n```").is_err());
    }

    #[test]
    fn decimals_accept_commas_and_strings() {
        assert_eq!(parse_decimal("12,50").unwrap(), dec!(12.50));
        assert_eq!(parse_decimal("$ 7").unwrap(), dec!(7));
    }

    #[test]
    fn typed_amounts_with_grouping() {
        assert_eq!(parse_amount_text("1.234,56"), Some(dec!(1234.56)));
        assert_eq!(parse_amount_text("1,234.56"), Some(dec!(1234.56)));
        assert_eq!(parse_amount_text("12.345.678"), Some(dec!(12345678)));
        assert_eq!(parse_amount_text("45,90"), Some(dec!(45.90)));
        assert_eq!(parse_amount_text("12,5"), Some(dec!(12.5)));
        assert_eq!(parse_amount_text("120."), Some(dec!(120)));
        assert_eq!(parse_amount_text("12a"), None);
        assert_eq!(parse_amount_text(",5"), None);
        assert_eq!(decimal_from_value(&json!(50.0)).unwrap(), dec!(50));
        assert_eq!(decimal_from_value(&json!("19.9")).unwrap(), dec!(19.9));
        assert!(decimal_from_value(&json!("abc")).is_none());
        assert!(decimal_from_value(&json!(null)).is_none());
    }

    #[test]
    fn money_always_has_two_decimals() {
        assert_eq!(format_money(dec!(50)), "50.00");
        assert_eq!(format_money(dec!(3.456)), "3.46");
        assert_eq!(format_money(dec!(-12.5)), "-12.50");
    }

    #[test]
    fn dates_in_common_formats() {
        let expected = NaiveDate::from_ymd_opt(2026, 3, 9).unwrap();
        assert_eq!(parse_date("2026-03-09"), Some(expected));
        assert_eq!(parse_date("09/03/2026"), Some(expected));
        assert_eq!(parse_date("09.03.2026"), Some(expected));
        assert_eq!(parse_date("yesterday"), None);
    }

    #[test]
    fn stale_dates_are_replaced_with_today() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 14).unwrap();
        let stale = today - Duration::days(45);
        let recent = today - Duration::days(3);
        assert_eq!(resolve_date(Some(&stale.to_string()), today), today);
        assert_eq!(resolve_date(Some(&recent.to_string()), today), recent);
        assert_eq!(resolve_date(Some("not a date"), today), today);
        assert_eq!(resolve_date(None, today), today);
        assert!(!is_stale(today - Duration::days(30), today));
    }

    #[test]
    fn image_extensions_are_case_insensitive() {
        let exts = vec![".png".to_string(), ".jpg".to_string()];
        assert!(has_supported_extension("Receipt.PNG", &exts));
        assert!(!has_supported_extension("notes.txt", &exts));
        assert!(!has_supported_extension("", &exts));
    }

    #[test]
    fn remote_images_pass_through() {
        let url = "https://cdn.example/receipt.jpg";
        assert_eq!(image_reference(url).unwrap(), url);
    }

    #[test]
    fn local_images_become_data_urls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("receipt.png");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();
        let reference = image_reference(path.to_str().unwrap()).unwrap();
        assert_eq!(reference, "data:image/png;base64,AQID");
    }
}
