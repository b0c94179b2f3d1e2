pub mod ledger;
pub mod system;

use anyhow::anyhow;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{error, info};

use crate::chat::Reply;
use crate::db::Database;
use crate::services::openai::LlmService;

/// The closed set of `/` commands understood in the operating channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    Usage,
    Accounts,
    Categories,
    Transfers,
    Help,
    Ping,
    Unknown(String),
}

impl Command {
    /// `None` when the text is not a command at all.
    pub fn parse(text: &str) -> Option<Command> {
        let name = text.trim().strip_prefix('/')?;
        let name = name
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_lowercase();
        let command = match name.as_str() {
            "status" => Command::Status,
            "usage" => Command::Usage,
            "accounts" | "list-accounts" => Command::Accounts,
            "categories" | "list-categories" => Command::Categories,
            "transfers" | "list-transfers" => Command::Transfers,
            "help" => Command::Help,
            "ping" => Command::Ping,
            _ => Command::Unknown(name),
        };
        Some(command)
    }
}

pub struct CommandContext<'a> {
    pub db: &'a Arc<Mutex<Database>>,
    pub llm: &'a LlmService,
    pub received_at: Instant,
}

/// Runs a command. Failures become an error reply; nothing here opens a
/// thread or touches conversation state.
pub async fn dispatch(command: &Command, ctx: &CommandContext<'_>) -> Reply {
    info!(command = ?command, "Running command");
    match command {
        Command::Status => system::status(ctx.db, ctx.llm).await,
        Command::Usage => system::usage(),
        Command::Help => system::help(),
        Command::Ping => system::ping(ctx.received_at),
        Command::Accounts => with_ledger(ctx.db, "accounts", ledger::accounts),
        Command::Categories => with_ledger(ctx.db, "categories", ledger::categories),
        Command::Transfers => with_ledger(ctx.db, "transfers", ledger::transfers),
        Command::Unknown(_) => Reply::text(
            "❌ Command not recognized. Type `/help` to see the available commands.",
        ),
    }
}

fn with_ledger<F>(db: &Arc<Mutex<Database>>, what: &str, render: F) -> Reply
where
    F: FnOnce(&Database) -> anyhow::Result<Reply>,
{
    let result = db
        .lock()
        .map_err(|_| anyhow!("DB lock poisoned"))
        .and_then(|db| render(&*db));
    match result {
        Ok(reply) => reply,
        Err(err) => {
            error!(error = %err, what, "Command failed");
            Reply::text(format!("❌ Error listing {}.", what))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{scripted_llm, ScriptedModel};

    #[test]
    fn parses_known_commands_and_aliases() {
        assert_eq!(Command::parse("/status"), Some(Command::Status));
        assert_eq!(Command::parse("  /PING "), Some(Command::Ping));
        assert_eq!(Command::parse("/list-accounts"), Some(Command::Accounts));
        assert_eq!(Command::parse("/transfers please"), Some(Command::Transfers));
        assert_eq!(
            Command::parse("/balance"),
            Some(Command::Unknown("balance".to_string()))
        );
        assert_eq!(Command::parse("status"), None);
    }

    #[tokio::test]
    async fn unknown_commands_point_to_help() {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let llm = scripted_llm(ScriptedModel::new(vec![]));
        let ctx = CommandContext {
            db: &db,
            llm: &llm,
            received_at: Instant::now(),
        };
        let reply = dispatch(&Command::Unknown("x".to_string()), &ctx).await;
        assert!(reply.to_text().contains("/help"));
    }
}
