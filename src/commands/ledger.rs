use anyhow::Result;

use crate::chat::{Embed, Reply};
use crate::db::Database;
use crate::models::LedgerLine;
use crate::utils::format_money;

pub const RECENT_TRANSFER_ROWS: usize = 10;

pub fn accounts(db: &Database) -> Result<Reply> {
    let accounts = db.get_accounts()?;
    Ok(listing("📋 **Available accounts:**", "No accounts found in the ledger.", &accounts))
}

pub fn categories(db: &Database) -> Result<Reply> {
    let categories = db.get_categories()?;
    Ok(listing(
        "🏷️ **Available categories:**",
        "No categories found in the ledger.",
        &categories,
    ))
}

fn listing(title: &str, empty: &str, names: &[String]) -> Reply {
    if names.is_empty() {
        return Reply::text(format!("{}\n{}", title, empty));
    }
    let lines: Vec<String> = names.iter().map(|name| format!("• {}", name)).collect();
    Reply::text(format!("{}\n{}", title, lines.join("\n")))
}

pub fn transfers(db: &Database) -> Result<Reply> {
    let lines = db.recent_transfers(RECENT_TRANSFER_ROWS)?;
    if lines.is_empty() {
        return Ok(Reply::text("📋 **Recent transfers:**\nNo transfers found."));
    }

    let mut embed = Embed::new("💸 Recent transfers");
    for (day, rows) in group_by_day(&lines) {
        let text: Vec<String> = rows.iter().map(|line| transfer_line(line)).collect();
        embed = embed.field(day, text.join("\n\n"));
    }
    Ok(Reply::Embed(embed.description(format!(
        "📊 Showing the {} most recent transfer rows",
        lines.len()
    ))))
}

fn group_by_day(lines: &[LedgerLine]) -> Vec<(String, Vec<&LedgerLine>)> {
    let mut days: Vec<(String, Vec<&LedgerLine>)> = Vec::new();
    for line in lines {
        let day = line.date.format("%d/%m/%Y").to_string();
        match days.iter_mut().find(|(existing, _)| *existing == day) {
            Some((_, rows)) => rows.push(line),
            None => days.push((day, vec![line])),
        }
    }
    days
}

fn transfer_line(line: &LedgerLine) -> String {
    let head = if line.amount.is_sign_negative() {
        format!("📤 **${}** from {}", format_money(line.amount.abs()), line.account)
    } else {
        format!("📥 **+${}** to {}", format_money(line.amount), line.account)
    };
    format!("{}\n   └ {}", head, line.description)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    #[test]
    fn transfers_are_grouped_by_day() {
        let db = Database::open_in_memory().unwrap();
        let first = NaiveDate::from_ymd_opt(2026, 10, 1).unwrap();
        let second = NaiveDate::from_ymd_opt(2026, 10, 3).unwrap();
        db.insert_transfer_pair(first, dec!(100), "Checking", "Savings", None)
            .unwrap();
        db.insert_transfer_pair(second, dec!(40), "Savings", "Wallet", Some("Cash"))
            .unwrap();

        let text = transfers(&db).unwrap().to_text();
        let newest = text.find("03/10/2026").unwrap();
        let oldest = text.find("01/10/2026").unwrap();
        assert!(newest < oldest);
        assert!(text.contains("📤 **$40.00** from Savings"));
        assert!(text.contains("📥 **+$100.00** to Savings"));
        assert!(text.contains("└ [BOT] Cash"));
        assert!(text.contains("Showing the 4 most recent"));
    }

    #[test]
    fn empty_ledger_listings() {
        let db = Database::open_in_memory().unwrap();
        assert!(accounts(&db).unwrap().to_text().contains("No accounts"));
        assert!(transfers(&db).unwrap().to_text().contains("No transfers"));
        db.add_category("Food").unwrap();
        assert!(categories(&db).unwrap().to_text().contains("• Food"));
    }
}
