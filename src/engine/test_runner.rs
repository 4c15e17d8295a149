//! Runs one test pair against one set of instructions and scores the result.
//!
//! Steps per pair:
//!   1. resolve the model under test (pair override or core model)
//!   2. prepend the pair's saved conversation context
//!   3. retrieve knowledge-base chunks into the system prompt
//!   4. attach images when the model accepts them
//!   5. call the model, looping through tool calls
//!   6. run every configured check
//!   7. compare expected vs actual and ask the AI judge, unless a check
//!      replaces content scoring
//!
//! Per-pair failures never escape as errors: they become a zero-scored
//! `TestResult` with warnings. Only cancellation is returned as `Err`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::EngineSettings;
use crate::error::AppError;

use super::compare::{quick_compare, Comparison, EmbeddingCache, ScoreComparator};
use super::eval::{CheckContext, CheckOutcome, CheckRegistry};
use super::judge::AiJudge;
use super::prompt::build_rag_context;
use super::provider::{KnowledgeRetriever, ModelProvider, ToolHost};
use super::types::{
    ChatCompletion, ChatMessage, ChatOptions, KnowledgeBaseRef, ModelRef, RetrievalOptions,
    RetrievedChunk, TestPair, TestResult, ToolCall, ToolSpec, ERROR_MARKER,
};

/// Score keys that sit next to the per-check tags in `TestResult::scores`.
pub const SCORE_SIMILARITY: &str = "similarity";
pub const SCORE_AI: &str = "ai";

/// The external services a run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub provider: Arc<dyn ModelProvider>,
    pub retriever: Option<Arc<dyn KnowledgeRetriever>>,
    pub tool_host: Option<Arc<dyn ToolHost>>,
    pub checks: Arc<CheckRegistry>,
}

impl Collaborators {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            provider,
            retriever: None,
            tool_host: None,
            checks: Arc::new(CheckRegistry::default()),
        }
    }
}

/// Model text plus every tool call made while producing it.
#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub warnings: Vec<String>,
}

pub struct TestRunner {
    collab: Collaborators,
    settings: EngineSettings,
    comparator: ScoreComparator,
    judge: AiJudge,
    tool_specs: Vec<ToolSpec>,
    default_embedding_model: Option<ModelRef>,
}

impl TestRunner {
    pub fn new(
        collab: Collaborators,
        settings: EngineSettings,
        cache: Arc<EmbeddingCache>,
        tool_specs: Vec<ToolSpec>,
        default_embedding_model: Option<ModelRef>,
    ) -> Self {
        let comparator = ScoreComparator::new(collab.provider.clone(), cache);
        let judge = AiJudge::new(collab.provider.clone(), settings.clone());
        Self {
            collab,
            settings,
            comparator,
            judge,
            tool_specs,
            default_embedding_model,
        }
    }

    /// Run `pair` with `instructions` as the system prompt and score it.
    pub async fn run(
        &self,
        pair: &TestPair,
        instructions: &str,
        core_model: &ModelRef,
        cancel: &CancellationToken,
    ) -> Result<TestResult, AppError> {
        let model = pair.settings.model.as_ref().unwrap_or(core_model);
        let mut warnings = Vec::new();

        let messages = self.build_messages(pair, instructions, model, &mut warnings).await;
        let generation = match self.generate(messages, model, cancel).await {
            Ok(g) => g,
            Err(AppError::Aborted(reason)) => return Err(AppError::Aborted(reason)),
            Err(e) => {
                if e.is_recoverable() {
                    tracing::warn!(model = %model, error = %e, "Model call failed for test pair");
                } else {
                    tracing::error!(model = %model, kind = e.kind(), error = %e, "Test pair failed");
                }
                return Ok(self.failed_result(pair, &e, warnings));
            }
        };
        warnings.extend(generation.warnings.iter().cloned());

        self.score(pair, generation, core_model, warnings, cancel).await
    }

    /// Run `pair` through the same prompt, context, RAG and tool path and
    /// return the raw model text, for use as the pair's expected output.
    pub async fn fill_output(
        &self,
        pair: &TestPair,
        instructions: &str,
        core_model: &ModelRef,
        cancel: &CancellationToken,
    ) -> Result<String, AppError> {
        let model = pair.settings.model.as_ref().unwrap_or(core_model);
        let mut warnings = Vec::new();
        let messages = self.build_messages(pair, instructions, model, &mut warnings).await;
        for warning in &warnings {
            tracing::warn!(warning = %warning, "fill_output degraded");
        }

        let generation = self.generate(messages, model, cancel).await?;
        let text = generation.text.trim().to_string();
        if text.is_empty() {
            return Err(AppError::Provider("Model returned an empty output".into()));
        }
        Ok(text)
    }

    // ── Prompt assembly ─────────────────────────────────────────────

    async fn build_messages(
        &self,
        pair: &TestPair,
        instructions: &str,
        model: &ModelRef,
        warnings: &mut Vec<String>,
    ) -> Vec<ChatMessage> {
        let mut system = instructions.trim().to_string();
        if let Some(rag) = self.retrieve_context(pair, warnings).await {
            if !system.is_empty() {
                system.push_str("\n\n");
            }
            system.push_str(&rag);
        }

        let mut messages = Vec::new();
        if !system.is_empty() {
            messages.push(ChatMessage::system(system));
        }
        if let Some(ref context) = pair.settings.context {
            messages.extend(context.messages.iter().cloned());
        }

        let mut user = ChatMessage::user(pair.input.clone());
        if let Some(ref images) = pair.settings.images {
            if !images.is_empty() {
                if self.collab.provider.supports_vision(model) {
                    user.images = images.clone();
                } else {
                    warnings.push(format!(
                        "Model {model} does not accept images; {} image(s) dropped",
                        images.len()
                    ));
                }
            }
        }
        messages.push(user);
        messages
    }

    async fn retrieve_context(&self, pair: &TestPair, warnings: &mut Vec<String>) -> Option<String> {
        let bases: &[KnowledgeBaseRef] = match pair.settings.knowledge_bases {
            Some(ref kbs) if !kbs.is_empty() => kbs,
            _ => return None,
        };

        let Some(ref retriever) = self.collab.retriever else {
            warnings.push("Knowledge bases configured but no retriever available; continuing without context".into());
            return None;
        };
        let Some(embedding_model) = self.embedding_model_for(pair) else {
            warnings.push("Knowledge bases configured but no embedding model set; continuing without context".into());
            return None;
        };

        let options = RetrievalOptions {
            top_k: self.settings.rag_top_k,
            min_similarity: self.settings.rag_min_similarity,
        };

        let mut retrieved: Vec<(KnowledgeBaseRef, Vec<RetrievedChunk>)> = Vec::new();
        for kb in bases {
            match retriever.retrieve(&pair.input, kb, embedding_model, options).await {
                Ok(chunks) => {
                    tracing::debug!(knowledge_base = %kb.id, chunks = chunks.len(), "Retrieved context");
                    retrieved.push((kb.clone(), chunks));
                }
                Err(e) => {
                    tracing::warn!(knowledge_base = %kb.id, error = %e, "Knowledge retrieval failed");
                    warnings.push(format!("Retrieval from knowledge base '{}' failed: {e}", kb.id));
                }
            }
        }
        build_rag_context(&retrieved)
    }

    fn embedding_model_for<'a>(&'a self, pair: &'a TestPair) -> Option<&'a ModelRef> {
        pair.settings
            .embedding_model
            .as_ref()
            .or(self.default_embedding_model.as_ref())
    }

    // ── Model call + tool loop ──────────────────────────────────────

    async fn call_model(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        cancel: &CancellationToken,
    ) -> Result<ChatCompletion, AppError> {
        let limit = Duration::from_millis(self.settings.time_limit_ms);
        match tokio::time::timeout(limit, self.collab.provider.chat_complete(messages, options, cancel)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Provider(format!(
                "Model call timed out after {}ms",
                self.settings.time_limit_ms
            ))),
        }
    }

    async fn invoke_tool(&self, host: &dyn ToolHost, call: &ToolCall) -> Result<String, AppError> {
        let limit = Duration::from_millis(self.settings.time_limit_ms);
        match tokio::time::timeout(limit, host.invoke(call)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::ToolInvocation(format!("{} timed out", call.name))),
        }
    }

    /// Call the model, feeding tool results back until it answers without
    /// tool calls or `max_tool_iterations` rounds have run.
    pub async fn generate(
        &self,
        mut messages: Vec<ChatMessage>,
        model: &ModelRef,
        cancel: &CancellationToken,
    ) -> Result<Generation, AppError> {
        let options = ChatOptions {
            model: model.clone(),
            tools: self.tool_specs.clone(),
            max_tokens: self.settings.max_tokens,
            time_limit_ms: self.settings.time_limit_ms,
            temperature: self.settings.temperature,
            json: false,
        };

        let mut generation = Generation::default();
        let mut rounds = 0u32;

        loop {
            let completion = self.call_model(&messages, &options, cancel).await?;
            generation.tool_calls.extend(completion.tool_calls.iter().cloned());

            let Some(ref host) = self.collab.tool_host else {
                generation.text = completion.text;
                return Ok(generation);
            };
            if completion.tool_calls.is_empty() {
                generation.text = completion.text;
                return Ok(generation);
            }
            if rounds >= self.settings.max_tool_iterations {
                tracing::warn!(rounds, "Tool iteration limit reached");
                generation.warnings.push(format!(
                    "Stopped after {rounds} tool round(s); later tool calls were not executed"
                ));
                generation.text = completion.text;
                return Ok(generation);
            }
            rounds += 1;

            messages.push(ChatMessage::assistant_tool_calls(
                completion.text,
                completion.tool_calls.clone(),
            ));
            for call in &completion.tool_calls {
                let output = match self.invoke_tool(host.as_ref(), call).await {
                    Ok(out) => out,
                    Err(e) => {
                        tracing::warn!(tool = %call.name, error = %e, "Tool invocation failed");
                        generation
                            .warnings
                            .push(format!("Tool '{}' failed: {e}", call.name));
                        format!("Error: {e}")
                    }
                };
                messages.push(ChatMessage::tool_result(call.id.clone(), output));
            }
        }
    }

    // ── Scoring ─────────────────────────────────────────────────────

    fn evaluate_checks(
        &self,
        pair: &TestPair,
        generation: &Generation,
        warnings: &mut Vec<String>,
    ) -> Vec<CheckOutcome> {
        let ctx = CheckContext {
            actual: &generation.text,
            called_tools: &generation.tool_calls,
            settings: &pair.settings,
        };
        pair.settings
            .check_types
            .iter()
            .filter_map(|check| match self.collab.checks.get(check) {
                Some(evaluator) => Some(evaluator.evaluate(&ctx)),
                None => {
                    warnings.push(format!("Unknown check type '{check}' ignored"));
                    None
                }
            })
            .collect()
    }

    async fn score(
        &self,
        pair: &TestPair,
        generation: Generation,
        core_model: &ModelRef,
        mut warnings: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<TestResult, AppError> {
        let outcomes = self.evaluate_checks(pair, &generation, &mut warnings);
        let mut scores: BTreeMap<String, f64> = outcomes
            .iter()
            .map(|o| (o.check.to_string(), o.score))
            .collect();

        let replacing: Vec<&CheckOutcome> = outcomes
            .iter()
            .filter(|o| {
                self.collab
                    .checks
                    .get(&o.check)
                    .is_some_and(|e| e.replaces_content_scoring())
            })
            .collect();

        let (comparison, ai_score, ai_feedback) = if !replacing.is_empty() {
            let passed = replacing.iter().all(|o| o.passed);
            let feedback = replacing
                .iter()
                .map(|o| o.explanation.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            (Comparison::NONE, if passed { 100.0 } else { 0.0 }, Some(feedback))
        } else {
            let comparison = self.compare(pair, &generation.text, &mut warnings).await;
            if comparison.is_equal {
                (comparison, 100.0, None)
            } else {
                match self
                    .judge
                    .judge(&pair.input, &pair.expected, &generation.text, core_model, cancel)
                    .await
                {
                    Ok(j) => (comparison, j.score, Some(j.feedback)),
                    Err(AppError::Aborted(reason)) => return Err(AppError::Aborted(reason)),
                    Err(e) => {
                        tracing::warn!(error = %e, "AI judge failed");
                        warnings.push(format!("AI judge failed: {e}"));
                        (comparison, 0.0, Some(format!("{ERROR_MARKER} AI judge failed: {e}")))
                    }
                }
            }
        };

        scores.insert(SCORE_SIMILARITY.into(), (comparison.similarity * 100.0).round());
        scores.insert(SCORE_AI.into(), ai_score);

        let is_json_valid = outcomes.iter().find_map(|o| o.is_json_valid);
        let tools_call_result = outcomes.into_iter().find_map(|o| o.tools_call_result);

        Ok(TestResult {
            input: pair.input.clone(),
            expected: pair.expected.clone(),
            result: generation.text,
            is_equal: comparison.is_equal,
            similarity: comparison.similarity,
            ai_score,
            ai_feedback,
            is_json_valid,
            tools_call_result,
            scores,
            warnings,
            settings: pair.settings.clone(),
        })
    }

    async fn compare(&self, pair: &TestPair, actual: &str, warnings: &mut Vec<String>) -> Comparison {
        if let Some(decided) = quick_compare(&pair.expected, actual) {
            return decided;
        }
        let Some(embedding_model) = self.embedding_model_for(pair) else {
            warnings.push("No embedding model configured; similarity not computed".into());
            return Comparison::NONE;
        };
        match self.comparator.compare(&pair.expected, actual, embedding_model).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(model = %embedding_model, error = %e, "Embedding failed; similarity set to 0");
                warnings.push(format!("Similarity not computed: {e}"));
                Comparison::NONE
            }
        }
    }

    fn failed_result(&self, pair: &TestPair, error: &AppError, warnings: Vec<String>) -> TestResult {
        TestResult {
            input: pair.input.clone(),
            expected: pair.expected.clone(),
            result: String::new(),
            is_equal: false,
            similarity: 0.0,
            ai_score: 0.0,
            ai_feedback: Some(format!("{ERROR_MARKER} {error}")),
            is_json_valid: None,
            tools_call_result: None,
            scores: BTreeMap::new(),
            warnings,
            settings: pair.settings.clone(),
        }
    }
}
