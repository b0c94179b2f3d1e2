mod chat;
mod commands;
mod config;
mod db;
mod error;
mod models;
mod services;
mod utils;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::chat::console::{parse_line, ConsoleTransport};
use crate::config::Config;
use crate::db::Database;
use crate::services::dispatcher::Dispatcher;
use crate::services::handler::{ConversationHandler, HandlerSettings};
use crate::services::openai::{LlmService, OpenAIClient};
use crate::services::state::StateStore;

#[derive(Parser)]
#[command(name = "ledger-bot", about = "Chat bot that files receipts, expenses and transfers into a ledger")]
struct Cli {
    /// Ledger database, overrides DATABASE_PATH.
    #[arg(long, global = true)]
    database: Option<PathBuf>,
    /// Conversation state file, overrides STATE_FILE.
    #[arg(long, global = true)]
    state_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the bot against the console transport (default).
    Run,
    /// Register a category in the ledger.
    AddCategory { name: String },
    /// Register an account in the ledger.
    AddAccount { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(path) = cli.database {
        config.database_path = path;
    }
    if let Some(path) = cli.state_file {
        config.state_file = path;
    }

    let db = open_ledger(&config)?;
    match cli.command.unwrap_or(CliCommand::Run) {
        CliCommand::AddCategory { name } => {
            let added = db.add_category(name.trim())?;
            println!("{} category '{}'", if added { "Added" } else { "Already had" }, name.trim());
            Ok(())
        }
        CliCommand::AddAccount { name } => {
            let added = db.add_account(name.trim())?;
            println!("{} account '{}'", if added { "Added" } else { "Already had" }, name.trim());
            Ok(())
        }
        CliCommand::Run => run(config, db).await,
    }
}

fn open_ledger(config: &Config) -> Result<Database> {
    if let Some(parent) = config.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
    }
    let db = Database::new(config.database_path.clone())
        .with_context(|| format!("open ledger {}", config.database_path.display()))?;
    Ok(db.with_cost_center(&config.default_cost_center))
}

async fn run(config: Config, db: Database) -> Result<()> {
    let client = OpenAIClient::new(
        config.openai_api_key()?,
        &config.openai_model,
        &config.openai_base_url,
        config.llm_timeout,
    )?;
    let llm = LlmService::new(Arc::new(client), config.openai_max_tokens, config.llm_timeout);
    let state = Arc::new(StateStore::load(&config.state_file)?);
    info!(
        database = %config.database_path.display(),
        state_file = %state.path().display(),
        pending = state.len()?,
        "Bot online"
    );

    let handler = Arc::new(ConversationHandler::new(
        Arc::new(ConsoleTransport::new()),
        state,
        Arc::new(Mutex::new(db)),
        llm,
        HandlerSettings::new(&config.target_channel_id),
    )?);

    println!(
        "Type a message for #{}. Reply in a thread with `#<thread> <text>`, post a receipt with `!image <path|url>`.",
        config.target_channel_id
    );
    let mut dispatcher = Dispatcher::new(handler, &config.target_channel_id);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut next_id: u64 = 0;
    while let Some(line) = lines.next_line().await? {
        next_id += 1;
        let Some(message) = parse_line(&line, &next_id.to_string(), &config.target_channel_id, "console")
        else {
            continue;
        };
        if message.is_command() {
            debug!(content = %message.content, "Command received");
        }
        dispatcher.dispatch(message);
    }

    warn!("Input closed, finishing pending messages");
    dispatcher.shutdown().await;
    Ok(())
}
