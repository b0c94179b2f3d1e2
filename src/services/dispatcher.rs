use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::chat::IncomingMessage;
use crate::services::handler::ConversationHandler;

/// Feeds inbound messages to the handler.
///
/// Messages in the operating channel run concurrently. There, each one
/// opens its own thread. Messages inside a thread go through one queue per
/// thread id, so replies are handled in the order they arrived.
pub struct Dispatcher {
    handler: Arc<ConversationHandler>,
    target_channel_id: String,
    lanes: HashMap<String, mpsc::UnboundedSender<IncomingMessage>>,
    tasks: JoinSet<()>,
}

impl Dispatcher {
    pub fn new(handler: Arc<ConversationHandler>, target_channel_id: &str) -> Self {
        Dispatcher {
            handler,
            target_channel_id: target_channel_id.to_string(),
            lanes: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    pub fn dispatch(&mut self, message: IncomingMessage) {
        if message.channel_id == self.target_channel_id {
            let handler = self.handler.clone();
            self.tasks.spawn(async move {
                handler.on_message(&message).await;
            });
            return;
        }

        let message = match self.lanes.get(&message.channel_id) {
            Some(lane) => match lane.send(message) {
                Ok(()) => return,
                Err(closed) => closed.0,
            },
            None => message,
        };

        let channel_id = message.channel_id.clone();
        let (lane, mut queue) = mpsc::unbounded_channel::<IncomingMessage>();
        let handler = self.handler.clone();
        let lane_id = channel_id.clone();
        self.tasks.spawn(async move {
            while let Some(message) = queue.recv().await {
                handler.on_message(&message).await;
            }
            debug!(thread_id = %lane_id, "Thread queue closed");
        });
        if lane.send(message).is_err() {
            error!(thread_id = %channel_id, "Thread queue closed before its first message");
        }
        self.lanes.insert(channel_id, lane);
    }

    /// Closes every thread queue and waits until all accepted messages
    /// have been handled.
    pub async fn shutdown(mut self) {
        self.lanes.clear();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(err) = result {
                error!(error = %err, "Message task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{ClassificationData, Conversation, ConversationContext, TransactionItem};
    use crate::services::handler::HandlerSettings;
    use crate::services::state::StateStore;
    use crate::testing::{scripted_llm, RecordingTransport, ScriptedModel};
    use crate::utils::today;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    fn message(id: &str, channel: &str, content: &str) -> IncomingMessage {
        IncomingMessage {
            id: id.to_string(),
            channel_id: channel.to_string(),
            author_id: "u1".to_string(),
            content: content.to_string(),
            attachments: vec![],
            from_bot: false,
        }
    }

    struct Setup {
        dispatcher: Dispatcher,
        transport: Arc<RecordingTransport>,
        state: Arc<StateStore>,
        db: Arc<Mutex<Database>>,
        _dir: tempfile::TempDir,
    }

    fn setup(model: Arc<ScriptedModel>) -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateStore::load(dir.path().join("state.json")).unwrap());
        let db = Database::open_in_memory().unwrap();
        db.add_category("Food").unwrap();
        db.add_account("Savings").unwrap();
        let db = Arc::new(Mutex::new(db));
        let transport = RecordingTransport::new();
        let handler = ConversationHandler::new(
            transport.clone(),
            state.clone(),
            db.clone(),
            scripted_llm(model),
            HandlerSettings::new("main"),
        )
        .unwrap();
        Setup {
            dispatcher: Dispatcher::new(Arc::new(handler), "main"),
            transport,
            state,
            db,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn replies_in_one_thread_are_handled_in_order() {
        let mut s = setup(ScriptedModel::new(vec![
            r#"{"action": "confirm", "message": ""}"#,
            r#"{"action": "account", "message": ""}"#,
        ]));
        s.state
            .insert(ConversationContext::new(
                "u1",
                "t1",
                Conversation::Classification(ClassificationData {
                    establishment: "Corner Market".to_string(),
                    purchase_date: today(),
                    items: vec![TransactionItem {
                        description: "Bread".to_string(),
                        amount: dec!(3),
                        category: "Food".to_string(),
                    }],
                    available_categories: vec!["Food".to_string()],
                }),
            ))
            .unwrap();

        s.dispatcher.dispatch(message("m1", "t1", "yes"));
        s.dispatcher.dispatch(message("m2", "t1", "Savings"));
        s.dispatcher.shutdown().await;

        let texts = s.transport.texts_in("t1");
        assert!(texts[0].contains("**account**"));
        assert!(texts[1].contains("saved to account 'Savings'"));
        assert_eq!(s.db.lock().unwrap().count_lines().unwrap(), 1);
        assert!(!s.state.has("t1").unwrap());
    }

    #[tokio::test]
    async fn shutdown_waits_for_pending_messages() {
        let mut s = setup(ScriptedModel::new(vec![
            r#"{"intent": "expense", "confidence": 0.9}"#,
            r#"{"establishment": "Market", "date": null, "items": [{"description": "Groceries", "amount": 50, "category": "Food"}]}"#,
        ]));

        s.dispatcher.dispatch(message("m1", "main", "spent 50 at the market"));
        s.dispatcher.shutdown().await;

        assert_eq!(s.transport.threads().len(), 1);
        assert!(s.state.has("thread-1").unwrap());
    }
}
