use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const UNIDENTIFIED_ESTABLISHMENT: &str = "Unidentified establishment";
pub const UNCLASSIFIED_CATEGORY: &str = "To classify";

/// Largest amount, per item and per list, accepted from extraction or an
/// edit (one trillion).
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(0xD4A5_1000, 0xE8, 0, false, 0);

/// Sum that stops at `Decimal::MAX` instead of panicking.
pub fn saturating_sum<'a>(amounts: impl IntoIterator<Item = &'a Decimal>) -> Decimal {
    amounts
        .into_iter()
        .fold(Decimal::ZERO, |sum, amount| sum.saturating_add(*amount))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionItem {
    pub description: String,
    pub amount: Decimal,
    pub category: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationData {
    pub establishment: String,
    pub purchase_date: NaiveDate,
    pub items: Vec<TransactionItem>,
    #[serde(default)]
    pub available_categories: Vec<String>,
}

impl ClassificationData {
    pub fn total(&self) -> Decimal {
        saturating_sum(self.items.iter().map(|item| &item.amount))
    }

    pub fn has_establishment(&self) -> bool {
        !self.establishment.trim().is_empty() && self.establishment != UNIDENTIFIED_ESTABLISHMENT
    }

    pub fn with_items(&self, items: Vec<TransactionItem>) -> Self {
        ClassificationData {
            establishment: self.establishment.clone(),
            purchase_date: self.purchase_date,
            items,
            available_categories: self.available_categories.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferData {
    pub amount: Decimal,
    pub source_account: String,
    pub destination_account: String,
    pub transfer_date: NaiveDate,
    #[serde(default)]
    pub description: Option<String>,
}

/// What a thread is about. A context carries exactly one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Conversation {
    #[serde(rename = "classification_data")]
    Classification(ClassificationData),
    #[serde(rename = "transfer_data")]
    Transfer(TransferData),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    AwaitingConfirmation,
    AwaitingAccount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub user_id: String,
    pub thread_id: String,
    #[serde(default)]
    pub attachment_url: Option<String>,
    #[serde(default)]
    pub message_content: Option<String>,
    #[serde(flatten)]
    pub conversation: Conversation,
    #[serde(default)]
    pub waiting_for_account: bool,
}

impl ConversationContext {
    pub fn new(user_id: &str, thread_id: &str, conversation: Conversation) -> Self {
        ConversationContext {
            user_id: user_id.to_string(),
            thread_id: thread_id.to_string(),
            attachment_url: None,
            message_content: None,
            conversation,
            waiting_for_account: false,
        }
    }

    pub fn stage(&self) -> Stage {
        match self.conversation {
            Conversation::Classification(_) if self.waiting_for_account => Stage::AwaitingAccount,
            _ => Stage::AwaitingConfirmation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Transfer,
    Expense,
    Command,
    Other,
}

impl Intent {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "transfer" => Some(Intent::Transfer),
            "expense" => Some(Intent::Expense),
            "command" => Some(Intent::Command),
            "other" => Some(Intent::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageIntent {
    pub intent: Intent,
    pub confidence: f64,
    #[serde(default)]
    pub extracted_data: Value,
}

impl MessageIntent {
    pub fn new(intent: Intent, confidence: f64) -> Self {
        MessageIntent {
            intent,
            confidence,
            extracted_data: Value::Object(Default::default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyAction {
    Confirm,
    Edit,
    Account,
    Help,
    Error,
}

impl ReplyAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "confirm" => Some(ReplyAction::Confirm),
            "edit" => Some(ReplyAction::Edit),
            "account" => Some(ReplyAction::Account),
            "help" => Some(ReplyAction::Help),
            "error" => Some(ReplyAction::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDecision {
    pub action: ReplyAction,
    pub message: String,
}

impl ActionDecision {
    pub fn new(action: ReplyAction, message: impl Into<String>) -> Self {
        ActionDecision {
            action,
            message: message.into(),
        }
    }
}

/// Items sharing a category, in the order the category was first seen.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryGroup {
    pub category: String,
    pub items: Vec<TransactionItem>,
}

impl CategoryGroup {
    pub fn subtotal(&self) -> Decimal {
        saturating_sum(self.items.iter().map(|item| &item.amount))
    }
}

/// A persisted ledger row. Negative amounts are debits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerLine {
    pub id: String,
    pub date: NaiveDate,
    pub description: String,
    pub account: String,
    pub category: String,
    pub cost_center: String,
    pub amount: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_context() -> ConversationContext {
        let data = ClassificationData {
            establishment: "Corner Market".to_string(),
            purchase_date: NaiveDate::from_ymd_opt(2026, 10, 2).unwrap(),
            items: vec![TransactionItem {
                description: "Bread".to_string(),
                amount: dec!(4.50),
                category: "Food".to_string(),
            }],
            available_categories: vec!["Food".to_string(), "Other".to_string()],
        };
        let mut context =
            ConversationContext::new("u1", "t1", Conversation::Classification(data));
        context.attachment_url = Some("https://cdn.example/receipt.png".to_string());
        context
    }

    #[test]
    fn context_round_trips_through_json() {
        let context = sample_context();
        let json = serde_json::to_string(&context).unwrap();
        let back: ConversationContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back, context);
    }

    #[test]
    fn payload_is_stored_under_its_own_key() {
        let value = serde_json::to_value(sample_context()).unwrap();
        assert!(value.get("classification_data").is_some());
        assert!(value.get("transfer_data").is_none());
        assert_eq!(value["classification_data"]["purchase_date"], "2026-10-02");
    }

    #[test]
    fn transfer_context_reads_from_stored_json() {
        let raw = r#"{
            "user_id": "u2",
            "thread_id": "t2",
            "transfer_data": {
                "amount": 250,
                "source_account": "Checking",
                "destination_account": "Savings",
                "transfer_date": "2026-10-10",
                "description": null
            }
        }"#;
        let context: ConversationContext = serde_json::from_str(raw).unwrap();
        match &context.conversation {
            Conversation::Transfer(transfer) => {
                assert_eq!(transfer.amount, dec!(250));
                assert_eq!(transfer.description, None);
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert!(!context.waiting_for_account);
        assert_eq!(context.stage(), Stage::AwaitingConfirmation);
    }

    #[test]
    fn waiting_for_account_only_applies_to_classifications() {
        let mut context = sample_context();
        context.waiting_for_account = true;
        assert_eq!(context.stage(), Stage::AwaitingAccount);
    }

    #[test]
    fn sentinel_establishment_is_not_reported() {
        let mut context = sample_context();
        if let Conversation::Classification(data) = &mut context.conversation {
            assert!(data.has_establishment());
            data.establishment = UNIDENTIFIED_ESTABLISHMENT.to_string();
            assert!(!data.has_establishment());
        }
    }

    #[test]
    fn totals_saturate_instead_of_overflowing() {
        assert_eq!(MAX_AMOUNT, dec!(1000000000000));
        let mut data = match sample_context().conversation {
            Conversation::Classification(data) => data,
            other => panic!("unexpected payload {:?}", other),
        };
        data.items = vec![
            TransactionItem {
                description: "Yacht".to_string(),
                amount: Decimal::MAX,
                category: "Other".to_string(),
            },
            TransactionItem {
                description: "Fuel".to_string(),
                amount: dec!(50000000000000000000000000000),
                category: "Other".to_string(),
            },
        ];
        assert_eq!(data.total(), Decimal::MAX);
    }
}
