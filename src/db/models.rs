use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::engine::types::{ModelRef, RunStatus, TestPair, TestResult};
use crate::error::AppError;

// ============================================================================
// Session
// ============================================================================

/// A finished (or cut short) improvement/testing run.
///
/// `output[i]` is the instructions text produced by the rewrite at the end of
/// iteration `i`; `tests[i]` holds the per-pair results of iteration `i`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    /// Milliseconds since the Unix epoch at run start.
    #[ts(type = "number")]
    pub timestamp: i64,
    pub instructions: String,
    pub core_model: ModelRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<ModelRef>,
    pub improve_mode: bool,
    pub iterations: u32,
    #[serde(default)]
    pub selected_tools: Vec<String>,
    #[serde(default)]
    pub in_out_pairs: Vec<TestPair>,
    #[serde(default)]
    pub output: Vec<String>,
    #[serde(default)]
    pub tests: Vec<Vec<TestResult>>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub summary: SessionSummary,
}

/// Aggregates derived from `tests`, consumed by session charts and the
/// "last session score" hint on each pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub iterations: Vec<IterationScore>,
    /// Scores of each pair in the last recorded iteration.
    pub last_scores: Vec<PairScore>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct IterationScore {
    pub avg_ai_score: f64,
    /// Average of per-pair similarity percentages (0–100).
    pub avg_similarity: f64,
    #[ts(type = "number")]
    pub equal_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct PairScore {
    pub ai_score: f64,
    pub similarity: f64,
    pub is_equal: bool,
}

impl SessionSummary {
    pub fn from_tests(tests: &[Vec<TestResult>]) -> Self {
        let iterations = tests
            .iter()
            .map(|iter| {
                let n = iter.len().max(1) as f64;
                IterationScore {
                    avg_ai_score: iter.iter().map(|t| t.ai_score).sum::<f64>() / n,
                    avg_similarity: iter
                        .iter()
                        .map(|t| (t.similarity * 100.0).round())
                        .sum::<f64>()
                        / n,
                    equal_count: iter.iter().filter(|t| t.is_equal).count(),
                }
            })
            .collect();

        let last_scores = tests
            .last()
            .map(|iter| {
                iter.iter()
                    .map(|t| PairScore {
                        ai_score: t.ai_score,
                        similarity: t.similarity,
                        is_equal: t.is_equal,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            iterations,
            last_scores,
        }
    }
}

// ============================================================================
// Import / export
// ============================================================================

/// Imported payloads are lenient: only `timestamp` and `instructions` are
/// required, everything else falls back to the defaults older exports used.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportedSession {
    timestamp: Option<i64>,
    instructions: Option<String>,
    core_model: Option<ModelRef>,
    /// Older exports name the core model `selectedModel`.
    selected_model: Option<ModelRef>,
    embedding_model: Option<ModelRef>,
    settings_embedding_model: Option<ModelRef>,
    improve_mode: Option<bool>,
    iterations: Option<u32>,
    #[serde(default)]
    selected_tools: Vec<String>,
    #[serde(default)]
    in_out_pairs: Vec<TestPair>,
    #[serde(default)]
    output: Vec<String>,
    #[serde(default)]
    tests: Vec<Vec<TestResult>>,
    status: Option<RunStatus>,
    error: Option<String>,
}

impl Session {
    /// Suggested file name for an exported session.
    pub fn export_file_name(&self) -> String {
        format!("RPI-session-{}.json", self.id)
    }

    pub fn export_json(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse an exported session. The imported session gets a fresh id.
    pub fn import_json(raw: &str) -> Result<Session, AppError> {
        let imported: ImportedSession = serde_json::from_str(raw)?;

        let timestamp = imported
            .timestamp
            .ok_or_else(|| AppError::Validation("Imported session is missing 'timestamp'".into()))?;
        let instructions = imported.instructions.ok_or_else(|| {
            AppError::Validation("Imported session is missing 'instructions'".into())
        })?;
        let core_model = imported
            .core_model
            .or(imported.selected_model)
            .unwrap_or_default();

        let summary = SessionSummary::from_tests(&imported.tests);
        Ok(Session {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp,
            instructions,
            core_model,
            embedding_model: imported.embedding_model.or(imported.settings_embedding_model),
            improve_mode: imported.improve_mode.unwrap_or(true),
            iterations: imported.iterations.unwrap_or(1),
            selected_tools: imported.selected_tools,
            in_out_pairs: imported.in_out_pairs,
            output: imported.output,
            tests: imported.tests,
            status: imported.status.unwrap_or(RunStatus::Completed),
            error: imported.error,
            summary,
        })
    }
}
