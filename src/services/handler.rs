use anyhow::{anyhow, Result};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::chat::{Attachment, ChatTransport, IncomingMessage, Reply};
use crate::commands::{self, Command, CommandContext};
use crate::db::Database;
use crate::error::BotError;
use crate::models::{
    ActionDecision, ClassificationData, Conversation, ConversationContext, Intent, ReplyAction,
    Stage, TransferData,
};
use crate::services::classification::ClassificationService;
use crate::services::intent::IntentClassifier;
use crate::services::openai::LlmService;
use crate::services::state::StateStore;
use crate::services::transfer::TransferService;
use crate::utils::formatters::{
    classification_help, group_by_category, render_classification_summary,
    render_transfer_summary, transfer_help,
};
use crate::utils::{format_money, has_supported_extension};

pub const GENERIC_APOLOGY: &str =
    "Sorry, something went wrong while processing your message. Please try again.";
pub const SUPPORTED_IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".webp"];

const REVIEW_PROMPT: &str = "Please check the classification. If everything is right, type 'yes' or 'ok'. If something needs to change, tell me what.";
const RECHECK_PROMPT: &str = "Is it correct now? If so, type 'yes' or 'ok'.";
const ARCHIVED: &str = "This thread will be archived. Thanks!";
const SEEN_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub target_channel_id: String,
    pub image_extensions: Vec<String>,
}

impl HandlerSettings {
    pub fn new(target_channel_id: &str) -> Self {
        HandlerSettings {
            target_channel_id: target_channel_id.to_string(),
            image_extensions: SUPPORTED_IMAGE_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
        }
    }
}

/// Bounded memory of delivered message ids.
#[derive(Default)]
struct SeenMessages {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenMessages {
    fn first_time(&mut self, id: &str) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        if self.order.len() > SEEN_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

/// Routes every inbound message and drives the per-thread dialogue.
pub struct ConversationHandler {
    transport: Arc<dyn ChatTransport>,
    state: Arc<StateStore>,
    db: Arc<Mutex<Database>>,
    llm: LlmService,
    intents: IntentClassifier,
    classification: ClassificationService,
    transfers: TransferService,
    settings: HandlerSettings,
    seen: Mutex<SeenMessages>,
}

impl ConversationHandler {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        state: Arc<StateStore>,
        db: Arc<Mutex<Database>>,
        llm: LlmService,
        settings: HandlerSettings,
    ) -> Result<Self> {
        Ok(ConversationHandler {
            transport,
            state,
            db,
            intents: IntentClassifier::new(llm.clone()),
            classification: ClassificationService::new(llm.clone())?,
            transfers: TransferService::new(llm.clone())?,
            llm,
            settings,
            seen: Mutex::new(SeenMessages::default()),
        })
    }

    /// Never fails: anything that goes wrong is logged and answered with an
    /// apology, leaving the thread's context as it was.
    pub async fn on_message(&self, message: &IncomingMessage) {
        if message.from_bot {
            return;
        }
        if !self.first_delivery(&message.id) {
            debug!(message_id = %message.id, "Ignoring duplicate delivery");
            return;
        }

        if let Err(err) = self.route(message).await {
            error!(error = %err, channel = %message.channel_id, "Failed to process message");
            if let Err(send_err) = self
                .transport
                .send(&message.channel_id, Reply::text(GENERIC_APOLOGY))
                .await
            {
                error!(error = %send_err, "Failed to send apology");
            }
        }
    }

    fn first_delivery(&self, message_id: &str) -> bool {
        if message_id.is_empty() {
            return true;
        }
        match self.seen.lock() {
            Ok(mut seen) => seen.first_time(message_id),
            Err(_) => true,
        }
    }

    async fn route(&self, message: &IncomingMessage) -> Result<()> {
        if message.channel_id == self.settings.target_channel_id {
            if let Some(command) = Command::parse(&message.content) {
                return self.handle_command(message, &command).await;
            }
            if let Some(attachment) = message
                .attachments
                .iter()
                .find(|a| has_supported_extension(&a.filename, &self.settings.image_extensions))
            {
                return self.handle_image(message, attachment).await;
            }
            if message.attachments.is_empty() {
                return self.handle_text(message).await;
            }
            debug!(channel = %message.channel_id, "Ignoring unsupported attachment");
            return Ok(());
        }

        match self.state.get(&message.channel_id)? {
            Some(context) => self.handle_thread_reply(message, context).await,
            None => Ok(()),
        }
    }

    async fn handle_command(&self, message: &IncomingMessage, command: &Command) -> Result<()> {
        let ctx = CommandContext {
            db: &self.db,
            llm: &self.llm,
            received_at: Instant::now(),
        };
        let reply = commands::dispatch(command, &ctx).await;
        self.transport.send(&message.channel_id, reply).await
    }

    async fn handle_image(&self, message: &IncomingMessage, attachment: &Attachment) -> Result<()> {
        let Some(categories) = self.categories_or_warn(&message.channel_id).await? else {
            return Ok(());
        };

        let thread_id = self
            .transport
            .create_thread(message, &format!("Classification of {}", attachment.filename))
            .await?;
        self.send(
            &thread_id,
            "Hi! I received your image and I'm analysing it. I'll send the classification shortly.",
        )
        .await?;

        let data = match self.classification.classify_image(&attachment.url, &categories).await {
            Ok(data) => data,
            Err(err) => return self.report(&thread_id, err).await,
        };
        let mut context = ConversationContext::new(
            &message.author_id,
            &thread_id,
            Conversation::Classification(data.clone()),
        );
        context.attachment_url = Some(attachment.url.clone());
        self.state.insert(context)?;
        info!(thread_id = %thread_id, "Opened receipt thread");

        self.send(
            &thread_id,
            format!("{}\n\n{}", render_classification_summary(&data), REVIEW_PROMPT),
        )
        .await
    }

    async fn handle_text(&self, message: &IncomingMessage) -> Result<()> {
        let intent = self.intents.detect_intent(&message.content).await;
        match intent.intent {
            Intent::Expense => self.start_expense(message).await,
            Intent::Transfer => self.start_transfer(message).await,
            Intent::Command | Intent::Other => {
                debug!(intent = ?intent.intent, "No thread for this message");
                Ok(())
            }
        }
    }

    async fn start_expense(&self, message: &IncomingMessage) -> Result<()> {
        let Some(categories) = self.categories_or_warn(&message.channel_id).await? else {
            return Ok(());
        };
        let data = match self.classification.classify_text(&message.content, &categories).await {
            Ok(data) => data,
            Err(err) => return self.report(&message.channel_id, err).await,
        };

        let total = data.total();
        let name = if total.is_zero() {
            "Expense".to_string()
        } else {
            format!("Expense of ${}", format_money(total))
        };
        let thread_id = self.transport.create_thread(message, &name).await?;
        let mut context = ConversationContext::new(
            &message.author_id,
            &thread_id,
            Conversation::Classification(data.clone()),
        );
        context.message_content = Some(message.content.clone());
        self.state.insert(context)?;
        info!(thread_id = %thread_id, total = %total, "Opened expense thread");

        self.send(
            &thread_id,
            "Hi! I found an expense in your message. Here is how I classified it.",
        )
        .await?;
        self.send(
            &thread_id,
            format!("{}\n\n{}", render_classification_summary(&data), REVIEW_PROMPT),
        )
        .await
    }

    async fn start_transfer(&self, message: &IncomingMessage) -> Result<()> {
        let accounts = self.accounts()?;
        let data = match self.transfers.extract(&message.content, &accounts).await {
            Ok(data) => data,
            Err(err) => return self.report(&message.channel_id, err).await,
        };

        let thread_id = self
            .transport
            .create_thread(message, &format!("Transfer of ${}", format_money(data.amount)))
            .await?;
        let mut context = ConversationContext::new(
            &message.author_id,
            &thread_id,
            Conversation::Transfer(data.clone()),
        );
        context.message_content = Some(message.content.clone());
        self.state.insert(context)?;
        info!(thread_id = %thread_id, amount = %data.amount, "Opened transfer thread");

        self.send(&thread_id, "Hi! I found a transfer in your message.")
            .await?;
        self.send(&thread_id, render_transfer_summary(&data)).await
    }

    async fn handle_thread_reply(
        &self,
        message: &IncomingMessage,
        context: ConversationContext,
    ) -> Result<()> {
        let decision = self.intents.decide_action(&message.content, &context).await;
        debug!(thread_id = %context.thread_id, stage = ?context.stage(), action = ?decision.action, "Thread reply");
        match &context.conversation {
            Conversation::Classification(data) => {
                self.classification_reply(message, &context, data, decision)
                    .await
            }
            Conversation::Transfer(data) => self.transfer_reply(message, data, decision).await,
        }
    }

    async fn classification_reply(
        &self,
        message: &IncomingMessage,
        context: &ConversationContext,
        data: &ClassificationData,
        decision: ActionDecision,
    ) -> Result<()> {
        let thread_id = message.channel_id.as_str();
        match decision.action {
            ReplyAction::Confirm => {
                let text = match context.stage() {
                    Stage::AwaitingConfirmation => {
                        "Great! Please tell me the **account** so I can save the transactions."
                    }
                    Stage::AwaitingAccount => {
                        "I still need the **account** name to save the transactions."
                    }
                };
                self.state
                    .update(thread_id, |context| context.waiting_for_account = true)?;
                self.send(thread_id, text).await
            }
            ReplyAction::Edit => match self.classification.edit(data, &message.content).await {
                Ok(updated) => {
                    let summary = render_classification_summary(&updated);
                    self.state.update(thread_id, |context| {
                        context.conversation = Conversation::Classification(updated);
                        context.waiting_for_account = false;
                    })?;
                    self.send(thread_id, format!("{}\n\n{}", summary, RECHECK_PROMPT))
                        .await
                }
                Err(err) => self.report(thread_id, err).await,
            },
            ReplyAction::Account => self.save_classification(message, data).await,
            ReplyAction::Help => self.send(thread_id, classification_help()).await,
            ReplyAction::Error => self.send(thread_id, decision_text(&decision)).await,
        }
    }

    async fn save_classification(
        &self,
        message: &IncomingMessage,
        data: &ClassificationData,
    ) -> Result<()> {
        let thread_id = message.channel_id.as_str();
        let accounts = self.accounts()?;
        let account = self.intents.identify_account(&message.content, &accounts).await;
        if !accounts.is_empty() && !accounts.contains(&account) {
            let warning = BotError::UnknownAccount {
                account,
                known: accounts,
            };
            self.send(thread_id, warning.user_message()).await?;
            return self
                .send(
                    thread_id,
                    "Please give me a valid account, or correct the name if it is misspelled.",
                )
                .await;
        }

        let groups = group_by_category(&data.items);
        let (saved, errors) = {
            let db = self.lock_db()?;
            db.insert_grouped_expense(data.purchase_date, &groups, &account, &data.establishment)?
        };
        info!(thread_id, saved, errors, account = %account, "Saved classification");

        if saved > 0 {
            let noun = if saved == 1 { "category" } else { "categories" };
            self.send(
                thread_id,
                format!("✅ {} {} saved to account '{}'!", saved, noun, account),
            )
            .await?;
        }
        if errors > 0 {
            let noun = if errors == 1 { "category" } else { "categories" };
            self.send(thread_id, format!("❌ {} {} could not be saved.", errors, noun))
                .await?;
        }
        if saved > 0 {
            self.state.remove(thread_id)?;
            self.send(thread_id, ARCHIVED).await?;
        }
        Ok(())
    }

    async fn transfer_reply(
        &self,
        message: &IncomingMessage,
        data: &TransferData,
        decision: ActionDecision,
    ) -> Result<()> {
        let thread_id = message.channel_id.as_str();
        match decision.action {
            ReplyAction::Confirm => self.save_transfer(thread_id, data).await,
            ReplyAction::Edit => match self.transfers.edit(data, &message.content).await {
                Ok(updated) => {
                    let summary = render_transfer_summary(&updated);
                    self.state.update(thread_id, |context| {
                        context.conversation = Conversation::Transfer(updated);
                    })?;
                    self.send(thread_id, format!("{}\n\n{}", summary, RECHECK_PROMPT))
                        .await
                }
                Err(err) => self.report(thread_id, err).await,
            },
            ReplyAction::Account => {
                self.send(
                    thread_id,
                    "The accounts are the ones in the summary above. Type 'yes' to confirm, or tell me which account to change.",
                )
                .await
            }
            ReplyAction::Help => self.send(thread_id, transfer_help()).await,
            ReplyAction::Error => self.send(thread_id, decision_text(&decision)).await,
        }
    }

    async fn save_transfer(&self, thread_id: &str, data: &TransferData) -> Result<()> {
        let accounts = self.accounts()?;
        if !accounts.is_empty() {
            for account in [&data.source_account, &data.destination_account] {
                if !self.account_exists(account)? {
                    let warning = BotError::UnknownAccount {
                        account: account.clone(),
                        known: accounts.clone(),
                    };
                    self.send(thread_id, warning.user_message()).await?;
                    return self
                        .send(thread_id, "Tell me the correct account name and I'll update the transfer.")
                        .await;
                }
            }
        }

        {
            let db = self.lock_db()?;
            db.insert_transfer_pair(
                data.transfer_date,
                data.amount,
                &data.source_account,
                &data.destination_account,
                data.description.as_deref(),
            )?;
        }
        info!(thread_id, amount = %data.amount, "Saved transfer");

        self.state.remove(thread_id)?;
        self.send(
            thread_id,
            format!(
                "✅ Transfer of ${} from '{}' to '{}' saved!",
                format_money(data.amount),
                data.source_account,
                data.destination_account
            ),
        )
        .await?;
        self.send(thread_id, ARCHIVED).await
    }

    /// `None` after telling the user the ledger has no categories yet.
    async fn categories_or_warn(&self, channel_id: &str) -> Result<Option<Vec<String>>> {
        let categories = self.categories()?;
        if categories.is_empty() {
            warn!("Ledger has no categories");
            self.send(
                channel_id,
                "The ledger has no categories yet. Add some with `ledger-bot add-category <name>`.",
            )
            .await?;
            return Ok(None);
        }
        Ok(Some(categories))
    }

    fn categories(&self) -> Result<Vec<String>> {
        Ok(self.lock_db()?.get_categories()?)
    }

    fn accounts(&self) -> Result<Vec<String>> {
        Ok(self.lock_db()?.get_accounts()?)
    }

    fn account_exists(&self, name: &str) -> Result<bool> {
        Ok(self.lock_db()?.account_exists(name)?)
    }

    fn lock_db(&self) -> Result<MutexGuard<'_, Database>> {
        self.db.lock().map_err(|_| anyhow!("DB lock poisoned"))
    }

    async fn report(&self, channel_id: &str, err: BotError) -> Result<()> {
        warn!(error = %err, channel = %channel_id, "Request rejected");
        self.send(channel_id, err.user_message()).await
    }

    async fn send(&self, channel_id: &str, reply: impl Into<Reply>) -> Result<()> {
        self.transport.send(channel_id, reply.into()).await
    }
}

fn decision_text(decision: &ActionDecision) -> String {
    if decision.message.trim().is_empty() {
        "Sorry, I didn't understand. Could you be more specific?".to_string()
    } else {
        decision.message.clone()
    }
}
