//! Deterministic collaborators for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::db::models::Session;
use crate::error::AppError;

use super::provider::{KnowledgeRetriever, ModelProvider, SessionStore, ToolHost};
use super::types::{
    ChatCompletion, ChatMessage, ChatOptions, KnowledgeBaseRef, ModelRef, RetrievalOptions,
    RetrievedChunk, ToolCall, ToolSpec,
};

type Responder = Box<dyn Fn(&[ChatMessage], &ChatOptions) -> Result<ChatCompletion, AppError> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub messages: Vec<ChatMessage>,
    pub options: ChatOptions,
}

/// Chat replies come from a FIFO queue, then from an optional responder
/// closure, then default to `"ok"`. Embeddings are letter/digit frequency
/// vectors, so related texts score between 0 and 1.
pub struct ScriptedProvider {
    queue: Mutex<VecDeque<Result<ChatCompletion, AppError>>>,
    responder: Option<Responder>,
    chat_delay: Option<Duration>,
    vision: bool,
    failing_embeddings: HashSet<String>,
    chat_log: Mutex<Vec<RecordedCall>>,
    embed_log: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            responder: None,
            chat_delay: None,
            vision: false,
            failing_embeddings: HashSet::new(),
            chat_log: Mutex::new(Vec::new()),
            embed_log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_responder<F>(mut self, f: F) -> Self
    where
        F: Fn(&[ChatMessage], &ChatOptions) -> Result<ChatCompletion, AppError> + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(f));
        self
    }

    pub fn with_chat_delay(mut self, delay: Duration) -> Self {
        self.chat_delay = Some(delay);
        self
    }

    pub fn with_vision(mut self) -> Self {
        self.vision = true;
        self
    }

    pub fn fail_embedding_for(mut self, text: &str) -> Self {
        self.failing_embeddings.insert(text.to_string());
        self
    }

    pub fn push_reply(&self, text: &str) {
        self.push(Ok(ChatCompletion::text(text)));
    }

    pub fn push(&self, reply: Result<ChatCompletion, AppError>) {
        self.queue.lock().unwrap().push_back(reply);
    }

    pub fn chat_calls(&self) -> Vec<RecordedCall> {
        self.chat_log.lock().unwrap().clone()
    }

    pub fn embed_calls(&self) -> usize {
        self.embed_log.lock().unwrap().len()
    }
}

/// Last user message text of a conversation.
pub fn last_user_text(messages: &[ChatMessage]) -> &str {
    messages
        .iter()
        .rev()
        .find(|m| m.role == super::types::Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or("")
}

fn char_histogram(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; 36];
    for c in text.to_lowercase().chars() {
        if let Some(d) = c.to_digit(36) {
            v[d as usize] += 1.0;
        }
    }
    v
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat_complete(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        cancel: &CancellationToken,
    ) -> Result<ChatCompletion, AppError> {
        self.chat_log.lock().unwrap().push(RecordedCall {
            messages: messages.to_vec(),
            options: options.clone(),
        });

        if let Some(delay) = self.chat_delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(AppError::Aborted("cancelled".into())),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if let Some(reply) = self.queue.lock().unwrap().pop_front() {
            return reply;
        }
        match self.responder {
            Some(ref f) => f(messages, options),
            None => Ok(ChatCompletion::text("ok")),
        }
    }

    async fn embed(&self, text: &str, _model: &ModelRef) -> Result<Vec<f32>, AppError> {
        self.embed_log.lock().unwrap().push(text.to_string());
        if self.failing_embeddings.contains(text) {
            return Err(AppError::Embedding(format!("embedding refused for '{text}'")));
        }
        Ok(char_histogram(text))
    }

    fn supports_vision(&self, _model: &ModelRef) -> bool {
        self.vision
    }
}

// ============================================================================
// Tool host
// ============================================================================

#[derive(Default)]
pub struct RecordingToolHost {
    specs: Vec<ToolSpec>,
    failing: HashSet<String>,
    invoked: Mutex<Vec<ToolCall>>,
}

impl RecordingToolHost {
    pub fn new(names: &[&str]) -> Self {
        Self {
            specs: names
                .iter()
                .map(|n| ToolSpec {
                    name: n.to_string(),
                    description: format!("{n} tool"),
                    parameters: serde_json::Value::Null,
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn failing(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    pub fn invoked(&self) -> Vec<ToolCall> {
        self.invoked.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolHost for RecordingToolHost {
    async fn resolve(&self, tool_ids: &[String]) -> Result<Vec<ToolSpec>, AppError> {
        tool_ids
            .iter()
            .map(|id| {
                self.specs
                    .iter()
                    .find(|s| &s.name == id)
                    .cloned()
                    .ok_or_else(|| AppError::NotFound(format!("Tool {id}")))
            })
            .collect()
    }

    async fn invoke(&self, call: &ToolCall) -> Result<String, AppError> {
        self.invoked.lock().unwrap().push(call.clone());
        if self.failing.contains(&call.name) {
            return Err(AppError::ToolInvocation(format!("{} is unavailable", call.name)));
        }
        Ok(format!("{} result", call.name))
    }
}

// ============================================================================
// Retriever
// ============================================================================

#[derive(Default)]
pub struct StaticRetriever {
    chunks: HashMap<String, Vec<RetrievedChunk>>,
    failing: HashSet<String>,
}

impl StaticRetriever {
    pub fn with_chunk(mut self, kb_id: &str, text: &str) -> Self {
        let entry = self.chunks.entry(kb_id.to_string()).or_default();
        entry.push(RetrievedChunk {
            file_id: format!("{kb_id}-file"),
            file_name: "doc.md".into(),
            index: entry.len(),
            similarity: 0.9,
            text: text.into(),
        });
        self
    }

    pub fn failing(mut self, kb_id: &str) -> Self {
        self.failing.insert(kb_id.to_string());
        self
    }
}

#[async_trait]
impl KnowledgeRetriever for StaticRetriever {
    async fn retrieve(
        &self,
        _query: &str,
        knowledge_base: &KnowledgeBaseRef,
        _embedding_model: &ModelRef,
        options: RetrievalOptions,
    ) -> Result<Vec<RetrievedChunk>, AppError> {
        if self.failing.contains(&knowledge_base.id) {
            return Err(AppError::Rag(format!("index {} offline", knowledge_base.id)));
        }
        let mut chunks = self.chunks.get(&knowledge_base.id).cloned().unwrap_or_default();
        chunks.truncate(options.top_k);
        Ok(chunks)
    }
}

// ============================================================================
// Store
// ============================================================================

#[derive(Default)]
pub struct MemoryStore {
    saved: Mutex<Vec<Session>>,
}

impl MemoryStore {
    pub fn sessions(&self) -> Vec<Session> {
        self.saved.lock().unwrap().clone()
    }
}

impl SessionStore for MemoryStore {
    fn save(&self, session: &Session) -> Result<(), AppError> {
        self.saved.lock().unwrap().push(session.clone());
        Ok(())
    }
}
