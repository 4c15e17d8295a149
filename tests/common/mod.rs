#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use rpi_engine::engine::types::{ChatCompletion, ChatMessage, ChatOptions, Role};
use rpi_engine::{AppError, ModelProvider, ModelRef, RunConfig, Session, SessionStore, TestPair};

pub type Responder = dyn Fn(&str, &ChatOptions) -> String + Send + Sync;

/// Deterministic provider for black-box runs.
///
/// Judge calls (JSON mode) and instruction rewrites are told apart from test
/// calls by their options and prompt text; everything else goes to `answer`.
pub struct StubProvider {
    answer: Box<Responder>,
    delay: Option<Duration>,
    fail_embedding_for: Option<String>,
    judge_calls: AtomicUsize,
    improve_calls: AtomicUsize,
}

impl StubProvider {
    pub fn new(answer: impl Fn(&str, &ChatOptions) -> String + Send + Sync + 'static) -> Self {
        Self {
            answer: Box::new(answer),
            delay: None,
            fail_embedding_for: None,
            judge_calls: AtomicUsize::new(0),
            improve_calls: AtomicUsize::new(0),
        }
    }

    /// Every chat call waits this long, or until cancelled.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail_embedding_for(mut self, text: &str) -> Self {
        self.fail_embedding_for = Some(text.to_string());
        self
    }

    pub fn judge_calls(&self) -> usize {
        self.judge_calls.load(Ordering::SeqCst)
    }

    pub fn improve_calls(&self) -> usize {
        self.improve_calls.load(Ordering::SeqCst)
    }
}

fn last_user(messages: &[ChatMessage]) -> &str {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or("")
}

fn is_rewrite_prompt(text: &str) -> bool {
    text.contains("## Current Instructions") || text.contains("There are no instructions yet")
}

#[async_trait]
impl ModelProvider for StubProvider {
    fn name(&self) -> &str {
        "stub"
    }

    async fn chat_complete(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        cancel: &CancellationToken,
    ) -> Result<ChatCompletion, AppError> {
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(AppError::Aborted("cancelled".into())),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let user = last_user(messages);
        if options.json {
            self.judge_calls.fetch_add(1, Ordering::SeqCst);
            return Ok(ChatCompletion::text(r#"{"score": 40, "feedback": "Partially correct."}"#));
        }
        if is_rewrite_prompt(user) {
            let n = self.improve_calls.fetch_add(1, Ordering::SeqCst) + 1;
            return Ok(ChatCompletion::text(format!("Improved instructions v{n}")));
        }
        Ok(ChatCompletion::text((self.answer)(user, options)))
    }

    async fn embed(&self, text: &str, _model: &ModelRef) -> Result<Vec<f32>, AppError> {
        if self.fail_embedding_for.as_deref() == Some(text) {
            return Err(AppError::Embedding("embedding service unavailable".into()));
        }
        // Letter histogram: similar texts land close together.
        let mut v = vec![0.0f32; 26];
        for c in text.to_lowercase().chars().filter(|c| c.is_ascii_lowercase()) {
            v[(c as u8 - b'a') as usize] += 1.0;
        }
        Ok(v)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    saved: Mutex<Vec<Session>>,
}

impl MemoryStore {
    pub fn sessions(&self) -> Vec<Session> {
        self.saved.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl SessionStore for MemoryStore {
    fn save(&self, session: &Session) -> Result<(), AppError> {
        self.saved
            .lock()
            .map_err(|_| AppError::Internal("store poisoned".into()))?
            .push(session.clone());
        Ok(())
    }
}

pub fn core_model() -> ModelRef {
    ModelRef::new("openai", "gpt-4o")
}

pub fn embedding_model() -> ModelRef {
    ModelRef::new("openai", "text-embedding-3-small")
}

pub fn config(pairs: Vec<TestPair>, iterations: u32, improve_mode: bool) -> RunConfig {
    RunConfig {
        instructions: "Answer the question.".into(),
        in_out_pairs: pairs,
        core_model: core_model(),
        embedding_model: Some(embedding_model()),
        iterations,
        improve_mode,
        selected_tools: vec![],
    }
}

pub fn shared(provider: StubProvider) -> Arc<StubProvider> {
    Arc::new(provider)
}
