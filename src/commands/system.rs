use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::chat::{Embed, Reply};
use crate::db::Database;
use crate::services::openai::LlmService;

pub async fn status(db: &Arc<Mutex<Database>>, llm: &LlmService) -> Reply {
    let ledger = match db.lock() {
        Ok(db) => db.check_connection().map_err(|e| e.to_string()),
        Err(_) => Err("DB lock poisoned".to_string()),
    };
    let model = llm.check_connection().await.map_err(|e| e.to_string());

    let overall = if ledger.is_ok() && model.is_ok() {
        "✅ Bot online and working!"
    } else {
        "❌ Bot has problems. Check the logs."
    };
    Reply::Embed(
        Embed::new("🤖 Bot status")
            .field("📊 Ledger", health_line(&ledger))
            .field("🧠 LLM", health_line(&model))
            .field("🎯 Overall", overall),
    )
}

fn health_line(result: &Result<(), String>) -> String {
    match result {
        Ok(()) => "✅ Online".to_string(),
        Err(err) => format!("❌ Offline\n{}", err),
    }
}

pub fn usage() -> Reply {
    Reply::Embed(
        Embed::new("💰 LLM usage")
            .description("Usage information is not available through the API.")
            .field("📈 Usage", "https://platform.openai.com/usage")
            .field("💳 Billing", "https://platform.openai.com/account/billing"),
    )
}

pub fn help() -> Reply {
    Reply::Embed(
        Embed::new("📖 Available commands")
            .field("/status", "Checks that the bot, the ledger and the LLM are reachable")
            .field("/usage", "Shows where to check LLM usage")
            .field("/accounts", "Lists every account known to the ledger")
            .field("/categories", "Lists every category")
            .field("/transfers", "Lists recent transfers")
            .field("/ping", "Checks that the bot answers")
            .field("/help", "Shows this message")
            .field(
                "💡 How to use",
                "• Post a receipt image to have it classified\n\
                 • Type an expense (e.g. 'spent $50 at the market')\n\
                 • Type a transfer (e.g. 'moved 5000 from checking to savings')",
            ),
    )
}

pub fn ping(received_at: Instant) -> Reply {
    Reply::text(format!(
        "🏓 Pong! Answered in {} ms.",
        received_at.elapsed().as_millis()
    ))
}
