//! Instruction rewriting between iterations.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::EngineSettings;
use crate::error::AppError;

use super::prompt::{build_generate_messages, build_improve_messages, strip_code_fences};
use super::provider::ModelProvider;
use super::types::{ChatOptions, ModelRef, TestPair, TestResult};

pub struct InstructionImprover {
    provider: Arc<dyn ModelProvider>,
    settings: EngineSettings,
}

impl InstructionImprover {
    pub fn new(provider: Arc<dyn ModelProvider>, settings: EngineSettings) -> Self {
        Self { provider, settings }
    }

    /// Rewrite `current` using the iteration's results, or write fresh
    /// instructions from `pairs` when `current` is empty.
    ///
    /// Never returns an empty string. Any failure other than cancellation is
    /// an `AppError::Improvement`.
    pub async fn improve(
        &self,
        current: &str,
        results: &[TestResult],
        pairs: &[TestPair],
        core_model: &ModelRef,
        cancel: &CancellationToken,
    ) -> Result<String, AppError> {
        let generating = current.trim().is_empty();
        let messages = if generating {
            build_generate_messages(pairs)
        } else {
            build_improve_messages(current, results)
        };

        let options = ChatOptions {
            model: core_model.clone(),
            tools: Vec::new(),
            max_tokens: self.settings.max_tokens,
            time_limit_ms: self.settings.time_limit_ms,
            temperature: self.settings.temperature,
            json: false,
        };

        let prompt_chars: usize = messages.iter().map(|m| m.content.len()).sum();
        tracing::debug!(model = %core_model, generating, prompt_chars, "Requesting improved instructions");

        let limit = Duration::from_millis(self.settings.time_limit_ms);
        let call = self.provider.chat_complete(&messages, &options, cancel);
        let completion = match tokio::time::timeout(limit, call).await {
            Ok(Ok(c)) => c,
            Ok(Err(AppError::Aborted(reason))) => return Err(AppError::Aborted(reason)),
            Ok(Err(e)) => return Err(AppError::Improvement(e.to_string())),
            Err(_) => {
                return Err(AppError::Improvement(format!(
                    "Model call timed out after {}ms",
                    self.settings.time_limit_ms
                )))
            }
        };

        let improved = strip_code_fences(&completion.text);
        if improved.is_empty() {
            return Err(AppError::Improvement("Model returned empty instructions".into()));
        }
        Ok(improved)
    }
}
