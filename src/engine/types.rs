use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::db::models::Session;

// =============================================================================
// Models
// =============================================================================

/// A provider-qualified model reference, as stored on sessions and pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ModelRef {
    pub id: String,
    #[serde(default)]
    pub provider_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_name: Option<String>,
    /// Display label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ModelRef {
    pub fn new(provider_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider_id: provider_id.into(),
            provider_name: None,
            text: None,
        }
    }

    pub fn label(&self) -> &str {
        self.text.as_deref().unwrap_or(&self.id)
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.provider_id.is_empty() {
            write!(f, "{}", self.id)
        } else {
            write!(f, "{}/{}", self.provider_id, self.id)
        }
    }
}

// =============================================================================
// Chat messages
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// An image attached to a test pair input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ImageInput {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_mime")]
    pub mime_type: String,
    /// Base64 payload or an `http(s)://` / `data:` URL.
    pub data: String,
}

fn default_mime() -> String {
    "image/png".into()
}

impl ImageInput {
    /// URL form accepted by OpenAI-style multimodal content parts.
    pub fn as_url(&self) -> String {
        if self.data.starts_with("http://")
            || self.data.starts_with("https://")
            || self.data.starts_with("data:")
        {
            self.data.clone()
        } else {
            format!("data:{};base64,{}", self.mime_type, self.data)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageInput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: Vec::new(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::plain(Role::Tool, content)
        }
    }
}

/// A single tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Function spec handed to the provider for a resolved tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the arguments object.
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Other,
}

impl FinishReason {
    pub fn from_api(s: Option<&str>) -> Self {
        match s {
            Some("stop") | Some("end_turn") => FinishReason::Stop,
            Some("length") | Some("max_tokens") => FinishReason::Length,
            Some("tool_calls") | Some("tool_use") | Some("function_call") => {
                FinishReason::ToolCalls
            }
            Some("content_filter") => FinishReason::ContentFilter,
            _ => FinishReason::Other,
        }
    }
}

/// Per-call options for `ModelProvider::chat_complete`.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub model: ModelRef,
    pub tools: Vec<ToolSpec>,
    pub max_tokens: u32,
    pub time_limit_ms: u64,
    pub temperature: f32,
    /// Ask the provider for a JSON object response.
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatCompletion {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
}

impl ChatCompletion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Stop,
        }
    }
}

// =============================================================================
// Knowledge bases
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeBaseRef {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalOptions {
    pub top_k: usize,
    pub min_similarity: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievedChunk {
    pub file_id: String,
    pub file_name: String,
    pub index: usize,
    pub similarity: f32,
    pub text: String,
}

// =============================================================================
// Test pairs
// =============================================================================

/// A named evaluation rule applied to a pair's actual output.
///
/// The set is open: any tag can appear in a pair's settings, and the
/// `CheckRegistry` decides which tags have an evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckType(Cow<'static, str>);

impl CheckType {
    pub const JSON_VALID: CheckType = CheckType(Cow::Borrowed("JSON_VALID"));
    pub const TOOLS_CALL: CheckType = CheckType(Cow::Borrowed("TOOLS_CALL"));

    pub fn new(tag: impl Into<String>) -> Self {
        CheckType(Cow::Owned(tag.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A saved conversation prepended before the pair input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ContextRef {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

/// Argument expectations for one expected tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ToolExpectation {
    /// JSON Schema the call arguments must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_params: Option<serde_json::Value>,
    /// Key → value pairs the arguments must contain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(type = "Record<string, unknown> | null")]
    pub expected_values: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct TestSettings {
    #[serde(default)]
    #[ts(type = "Array<string>")]
    pub check_types: Vec<CheckType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextRef>,
    /// Model under test; falls back to the run's core model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<ModelRef>,
    #[serde(default)]
    pub use_json_schema: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub json_schema_strict: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools_called: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tool_expectations: HashMap<String, ToolExpectation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_bases: Option<Vec<KnowledgeBaseRef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<ImageInput>>,
}

impl TestSettings {
    pub fn has_check(&self, check: &CheckType) -> bool {
        self.check_types.contains(check)
    }

    /// The schema to enforce for JSON_VALID, if schema validation is on.
    pub fn active_json_schema(&self) -> Option<&serde_json::Value> {
        if self.use_json_schema {
            self.json_schema.as_ref()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TestPair {
    #[serde(rename = "in")]
    pub input: String,
    #[serde(rename = "out", default)]
    pub expected: String,
    #[serde(default)]
    pub settings: TestSettings,
}

impl TestPair {
    pub fn new(input: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            expected: expected.into(),
            settings: TestSettings::default(),
        }
    }
}

// =============================================================================
// Results
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct CalledTool {
    pub name: String,
    pub arguments: serde_json::Value,
    /// `None` when no parameter schema was configured for this tool.
    pub arguments_valid: Option<bool>,
    /// `None` when no expected values were configured for this tool.
    pub expected_values_valid: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(type = "Record<string, unknown> | null")]
    pub expected_values: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCallResult {
    pub success: bool,
    pub called_tools: Vec<CalledTool>,
    pub missing: Vec<String>,
}

impl ToolsCallResult {
    /// Builds a result whose `success` always mirrors `missing.is_empty()`.
    pub fn new(called_tools: Vec<CalledTool>, missing: Vec<String>) -> Self {
        Self {
            success: missing.is_empty(),
            called_tools,
            missing,
        }
    }
}

/// Outcome of one test pair in one iteration. Never mutated once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    #[serde(rename = "in")]
    pub input: String,
    #[serde(rename = "out")]
    pub expected: String,
    /// Actual model text.
    pub result: String,
    pub is_equal: bool,
    pub similarity: f64,
    pub ai_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_json_valid: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools_call_result: Option<ToolsCallResult>,
    /// Per-check scores (0–100) keyed by check tag, plus `similarity` and `ai`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scores: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub settings: TestSettings,
}

/// Prefix placed in `aiFeedback` when the model call itself failed.
pub const ERROR_MARKER: &str = "[error]";

// =============================================================================
// Runs
// =============================================================================

/// Everything the caller submits to start a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    #[serde(default)]
    pub instructions: String,
    pub in_out_pairs: Vec<TestPair>,
    pub core_model: ModelRef,
    /// Default embedding model for pairs that do not set their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<ModelRef>,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default = "default_improve_mode")]
    pub improve_mode: bool,
    #[serde(default)]
    pub selected_tools: Vec<String>,
}

fn default_iterations() -> u32 {
    1
}

fn default_improve_mode() -> bool {
    true
}

/// How a finished run ended. Only finished runs become sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Aborted,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Aborted => "aborted",
            RunStatus::Failed => "failed",
        }
    }
}

/// Ordered events emitted by a run. A run ends with exactly one of the
/// three `Run*` terminal events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    IterationStarted {
        index: usize,
    },
    TestCompleted {
        iteration: usize,
        pair_index: usize,
        result: TestResult,
    },
    ImprovementProduced {
        iteration: usize,
        instructions: String,
    },
    RunCompleted {
        session: Session,
    },
    RunAborted {
        partial_session: Session,
    },
    RunFailed {
        error: String,
        partial_session: Session,
    },
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::RunCompleted { .. }
                | ProgressEvent::RunAborted { .. }
                | ProgressEvent::RunFailed { .. }
        )
    }

    /// The session carried by a terminal event.
    pub fn session(&self) -> Option<&Session> {
        match self {
            ProgressEvent::RunCompleted { session } => Some(session),
            ProgressEvent::RunAborted { partial_session }
            | ProgressEvent::RunFailed { partial_session, .. } => Some(partial_session),
            _ => None,
        }
    }
}
