//! Assembles the finished `Session` from a run's collected results.

use crate::db::models::{Session, SessionSummary};

use super::types::{RunConfig, RunStatus, TestResult};

/// Created when a run starts; consumed by `finalize`, so a run can only
/// produce one session.
#[derive(Debug)]
pub struct SessionRecorder {
    id: String,
    timestamp: i64,
}

impl SessionRecorder {
    pub fn start() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Pure assembly: no I/O, and `output`/`tests` are stored as given.
    pub fn finalize(
        self,
        config: &RunConfig,
        output: Vec<String>,
        tests: Vec<Vec<TestResult>>,
        status: RunStatus,
        error: Option<String>,
    ) -> Session {
        let summary = SessionSummary::from_tests(&tests);
        Session {
            id: self.id,
            timestamp: self.timestamp,
            instructions: config.instructions.clone(),
            core_model: config.core_model.clone(),
            embedding_model: config.embedding_model.clone(),
            improve_mode: config.improve_mode,
            iterations: config.iterations,
            selected_tools: config.selected_tools.clone(),
            in_out_pairs: config.in_out_pairs.clone(),
            output,
            tests,
            status,
            error,
            summary,
        }
    }
}
