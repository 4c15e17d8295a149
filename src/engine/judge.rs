//! Model-driven scoring of an actual output against its reference.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::EngineSettings;
use crate::error::AppError;

use super::prompt::{build_judge_messages, strip_code_fences};
use super::provider::ModelProvider;
use super::types::{ChatOptions, ModelRef};

#[derive(Debug, Clone, PartialEq)]
pub struct Judgement {
    /// 0–100.
    pub score: f64,
    pub feedback: String,
}

pub struct AiJudge {
    provider: Arc<dyn ModelProvider>,
    settings: EngineSettings,
}

impl AiJudge {
    pub fn new(provider: Arc<dyn ModelProvider>, settings: EngineSettings) -> Self {
        Self { provider, settings }
    }

    /// One rubric call. Provider failures are returned to the caller; an
    /// unparseable reply is not an error and scores 0.
    pub async fn judge(
        &self,
        input: &str,
        expected: &str,
        actual: &str,
        model: &ModelRef,
        cancel: &CancellationToken,
    ) -> Result<Judgement, AppError> {
        let messages = build_judge_messages(input, expected, actual);
        let options = ChatOptions {
            model: model.clone(),
            tools: Vec::new(),
            max_tokens: self.settings.max_tokens,
            time_limit_ms: self.settings.time_limit_ms,
            temperature: 0.0,
            json: true,
        };

        let limit = Duration::from_millis(self.settings.time_limit_ms);
        let call = self.provider.chat_complete(&messages, &options, cancel);
        let completion = match tokio::time::timeout(limit, call).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(AppError::Provider(format!(
                    "Judge call timed out after {}ms",
                    self.settings.time_limit_ms
                )))
            }
        };
        let judgement = parse_judgement(&completion.text);
        tracing::debug!(model = %model, score = judgement.score, "AI judge scored output");
        Ok(judgement)
    }
}

fn score_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)score\s*[:=]\s*(\d+(?:\.\d+)?)").ok())
        .as_ref()
}

fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 100.0)
    }
}

/// Extract `{score, feedback}` from a judge reply.
///
/// Tries a JSON object first (also when wrapped in prose or a code fence),
/// then a `score: N` pattern. Falls back to score 0 with the raw reply as
/// feedback.
pub fn parse_judgement(raw: &str) -> Judgement {
    let text = strip_code_fences(raw);

    if let Some(judgement) = parse_json_judgement(&text) {
        return judgement;
    }

    if let Some(caps) = score_pattern().and_then(|re| re.captures(&text)) {
        if let Some(score) = caps.get(1).and_then(|m| m.as_str().parse::<f64>().ok()) {
            return Judgement {
                score: clamp_score(score),
                feedback: text.trim().to_string(),
            };
        }
    }

    Judgement {
        score: 0.0,
        feedback: raw.to_string(),
    }
}

fn parse_json_judgement(text: &str) -> Option<Judgement> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let value: Value = serde_json::from_str(&text[start..=end]).ok()?;

    let score = match value.get("score")? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().trim_end_matches('%').parse::<f64>().ok()?,
        _ => return None,
    };

    let feedback = ["feedback", "reason", "explanation"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_default();

    Some(Judgement {
        score: clamp_score(score),
        feedback,
    })
}
