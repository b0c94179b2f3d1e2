//! Scripted collaborators shared by the unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::chat::{ChatTransport, IncomingMessage, Reply};
use crate::error::LlmError;
use crate::services::openai::{ChatModel, CompletionRequest, LlmService};

/// Replays canned replies in order and records every request it sees.
/// An exhausted script answers with `LlmError::EmptyResponse`.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<&str>) -> Arc<Self> {
        Self::with_results(replies.into_iter().map(|r| Ok(r.to_string())).collect())
    }

    pub fn with_results(replies: Vec<Result<String, LlmError>>) -> Arc<Self> {
        Arc::new(ScriptedModel {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(LlmError::EmptyResponse))
    }

    async fn check_connection(&self) -> Result<(), LlmError> {
        Ok(())
    }
}

/// Never answers within any reasonable timeout.
pub struct StalledModel;

#[async_trait]
impl ChatModel for StalledModel {
    async fn complete(&self, _request: &CompletionRequest) -> Result<String, LlmError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Err(LlmError::EmptyResponse)
    }

    async fn check_connection(&self) -> Result<(), LlmError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}

pub fn scripted_llm(model: Arc<ScriptedModel>) -> LlmService {
    LlmService::new(model, 1024, Duration::from_secs(5))
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentReply {
    pub channel: String,
    pub reply: Reply,
}

/// Records outgoing replies and hands out sequential thread ids.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentReply>>,
    threads: Mutex<Vec<(String, String)>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingTransport::default())
    }

    pub fn sent(&self) -> Vec<SentReply> {
        self.sent.lock().unwrap().clone()
    }

    pub fn texts_in(&self, channel: &str) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|sent| sent.channel == channel)
            .map(|sent| sent.reply.to_text())
            .collect()
    }

    /// (thread id, thread name) pairs in creation order.
    pub fn threads(&self) -> Vec<(String, String)> {
        self.threads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn send(&self, channel_id: &str, reply: Reply) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(SentReply {
            channel: channel_id.to_string(),
            reply,
        });
        Ok(())
    }

    async fn create_thread(&self, _message: &IncomingMessage, name: &str) -> anyhow::Result<String> {
        let mut threads = self.threads.lock().unwrap();
        let id = format!("thread-{}", threads.len() + 1);
        threads.push((id.clone(), name.to_string()));
        Ok(id)
    }
}
