pub mod openai;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::db::models::Session;
use crate::error::AppError;

use super::types::{
    ChatCompletion, ChatMessage, ChatOptions, KnowledgeBaseRef, ModelRef, RetrievalOptions,
    RetrievedChunk, ToolCall, ToolSpec,
};

// =============================================================================
// ModelProvider
// =============================================================================

/// Abstraction over an LLM backend.
///
/// Each provider knows how to:
/// - Run a chat completion with optional tool specs
/// - Embed a text with a given embedding model
/// - Report whether a model accepts image input
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Human-readable provider name for logs and error messages.
    fn name(&self) -> &str;

    /// Run one chat completion. Implementations that can abort an in-flight
    /// request should return `AppError::Aborted` once `cancel` fires.
    async fn chat_complete(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        cancel: &CancellationToken,
    ) -> Result<ChatCompletion, AppError>;

    async fn embed(&self, text: &str, model: &ModelRef) -> Result<Vec<f32>, AppError>;

    fn supports_vision(&self, model: &ModelRef) -> bool {
        let _ = model;
        false
    }
}

// =============================================================================
// Knowledge-base retrieval
// =============================================================================

#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    /// Top-K chunks of `knowledge_base` most similar to `query`.
    async fn retrieve(
        &self,
        query: &str,
        knowledge_base: &KnowledgeBaseRef,
        embedding_model: &ModelRef,
        options: RetrievalOptions,
    ) -> Result<Vec<RetrievedChunk>, AppError>;
}

// =============================================================================
// Tools (MCP- or agent-backed)
// =============================================================================

#[async_trait]
pub trait ToolHost: Send + Sync {
    /// Turn selected tool identifiers into function specs for the provider.
    async fn resolve(&self, tool_ids: &[String]) -> Result<Vec<ToolSpec>, AppError>;

    /// Execute one call and return its textual result.
    async fn invoke(&self, call: &ToolCall) -> Result<String, AppError>;
}

// =============================================================================
// Session storage
// =============================================================================

/// Receives the finished session. Responsible for its own atomicity.
pub trait SessionStore: Send + Sync {
    fn save(&self, session: &Session) -> Result<(), AppError>;
}
