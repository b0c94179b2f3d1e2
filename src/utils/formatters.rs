use rust_decimal::Decimal;

use crate::models::{
    CategoryGroup, ClassificationData, TransactionItem, TransferData, UNCLASSIFIED_CATEGORY,
};
use crate::utils::format_money;

pub const NO_TRANSACTIONS: &str = "No transactions found.";

pub fn group_by_category(items: &[TransactionItem]) -> Vec<CategoryGroup> {
    let mut groups: Vec<CategoryGroup> = Vec::new();
    for item in items {
        let category = match item.category.trim() {
            "" => UNCLASSIFIED_CATEGORY,
            name => name,
        };
        match groups.iter_mut().find(|group| group.category == category) {
            Some(group) => group.items.push(item.clone()),
            None => groups.push(CategoryGroup {
                category: category.to_string(),
                items: vec![item.clone()],
            }),
        }
    }
    groups
}

pub fn render_summary(groups: &[CategoryGroup], establishment: Option<&str>) -> String {
    if groups.is_empty() {
        return NO_TRANSACTIONS.to_string();
    }

    let mut summary = String::from("**Summary by category:**\n\n");
    if let Some(name) = establishment {
        summary.push_str(&format!("🏪 **Establishment:** {}\n\n", name));
    }

    let mut grand_total = Decimal::ZERO;
    for group in groups {
        let subtotal = group.subtotal();
        grand_total = grand_total.saturating_add(subtotal);
        let products: Vec<&str> = group
            .items
            .iter()
            .map(|item| item.description.as_str())
            .collect();
        summary.push_str(&format!(
            "**{}** - ${}\nItems: {}\n\n",
            group.category,
            format_money(subtotal),
            products.join(", ")
        ));
    }

    summary.push_str(&format!("**Grand total: ${}**", format_money(grand_total)));
    summary
}

pub fn render_classification_summary(data: &ClassificationData) -> String {
    let groups = group_by_category(&data.items);
    let establishment = data
        .has_establishment()
        .then_some(data.establishment.as_str());
    let mut summary = render_summary(&groups, establishment);
    summary.push_str(&format!(
        "\n\n📅 **Purchase date:** {}",
        data.purchase_date.format("%d/%m/%Y")
    ));
    summary
}

pub fn render_transfer_summary(data: &TransferData) -> String {
    format!(
        "**💸 Transfer detected**\n\n\
         💰 **Amount:** ${}\n\
         📤 **From:** {}\n\
         📥 **To:** {}\n\
         📅 **Date:** {}\n\
         📝 **Description:** {}\n\n\
         Please confirm it is correct. Type 'yes' or 'ok' to confirm, or tell me what to change.",
        format_money(data.amount),
        data.source_account,
        data.destination_account,
        data.transfer_date.format("%d/%m/%Y"),
        data.description.as_deref().unwrap_or("Transfer between accounts")
    )
}

/// Scales every amount so the items add up to `target_total`.
///
/// Amounts are rounded to cents and the rounding residue lands on the last
/// item. A list whose current total is zero is returned unchanged. `None`
/// when the arithmetic would overflow.
pub fn redistribute(items: &[TransactionItem], target_total: Decimal) -> Option<Vec<TransactionItem>> {
    let current_total = items
        .iter()
        .try_fold(Decimal::ZERO, |sum, item| sum.checked_add(item.amount))?;
    if items.is_empty() || current_total.is_zero() {
        return Some(items.to_vec());
    }

    let target_total = target_total.round_dp(2);
    let factor = target_total.checked_div(current_total)?;
    let mut updated = items
        .iter()
        .map(|item| {
            let amount = item.amount.checked_mul(factor)?.round_dp(2);
            Some(TransactionItem {
                amount,
                ..item.clone()
            })
        })
        .collect::<Option<Vec<TransactionItem>>>()?;

    let actual_total = updated
        .iter()
        .try_fold(Decimal::ZERO, |sum, item| sum.checked_add(item.amount))?;
    let residue = target_total.checked_sub(actual_total)?;
    if !residue.is_zero() {
        if let Some(last) = updated.last_mut() {
            last.amount = last.amount.checked_add(residue)?.round_dp(2);
        }
    }
    Some(updated)
}

pub fn classification_help() -> String {
    "**Available replies:**\n\
     - `yes`, `ok`, `go ahead` - confirms the classification\n\
     - `change [item] to [category]` - changes the category of one item\n\
     - `swap [category] for [new category]` - changes a whole category\n\
     - `the total is [value]` - rescales the amounts to a new total\n\
     - `help` - shows this message"
        .to_string()
}

pub fn transfer_help() -> String {
    "**Available replies for transfers:**\n\
     - `yes`, `ok`, `go ahead` - confirms the transfer\n\
     - `change amount to [value]` - changes the amount\n\
     - `change source account to [account]` - changes the source account\n\
     - `change destination account to [account]` - changes the destination account\n\
     - `change description to [text]` - changes the description\n\
     - `help` - shows this message"
        .to_string()
}
