//! Drives a run through its iterations: Idle → Running → Completed | Aborted | Failed.
//!
//! Iteration `i` tests its active instructions (`tests[i]`); in improve mode
//! it then rewrites them (`output[i]`), and iteration `i + 1` tests
//! `output[i]`. An iteration is only recorded once both halves are done, so
//! an aborted improve-mode session always has `tests.len() == output.len()`.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::EngineSettings;
use crate::db::models::Session;
use crate::error::AppError;

use super::compare::EmbeddingCache;
use super::optimizer::InstructionImprover;
use super::provider::SessionStore;
use super::recorder::SessionRecorder;
use super::registry::RunGuard;
use super::test_runner::{Collaborators, TestRunner};
use super::types::{ProgressEvent, RunConfig, RunStatus, TestResult, ToolSpec};

/// How a run left the `Running` state.
#[derive(Debug)]
enum Terminal {
    Completed,
    Aborted,
    Failed(AppError),
}

/// Results of one iteration's test pass.
struct PassResult {
    results: Vec<TestResult>,
    aborted: bool,
}

pub struct IterationController {
    collab: Collaborators,
    settings: EngineSettings,
    store: Option<Arc<dyn SessionStore>>,
    events: mpsc::UnboundedSender<ProgressEvent>,
    cancel: CancellationToken,
}

impl IterationController {
    pub fn new(
        collab: Collaborators,
        settings: EngineSettings,
        store: Option<Arc<dyn SessionStore>>,
        events: mpsc::UnboundedSender<ProgressEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            collab,
            settings,
            store,
            events,
            cancel,
        }
    }

    fn emit(&self, event: ProgressEvent) {
        // A dropped receiver only means nobody is listening.
        let _ = self.events.send(event);
    }

    /// Run to a terminal state, persist the session, release `guard`, then
    /// send the terminal event.
    pub async fn run(self, config: RunConfig, recorder: SessionRecorder, mut guard: RunGuard) -> Session {
        tracing::info!(
            pairs = config.in_out_pairs.len(),
            iterations = config.iterations,
            improve_mode = config.improve_mode,
            model = %config.core_model,
            "Run started"
        );

        let mut output: Vec<String> = Vec::new();
        let mut tests: Vec<Vec<TestResult>> = Vec::new();
        let terminal = self.iterate(&config, &mut output, &mut tests).await;

        let (status, error) = match terminal {
            Terminal::Completed => (RunStatus::Completed, None),
            Terminal::Aborted => (RunStatus::Aborted, None),
            Terminal::Failed(ref e) => (RunStatus::Failed, Some(e.to_string())),
        };
        let session = recorder.finalize(&config, output, tests, status, error);

        match status {
            RunStatus::Failed => tracing::error!(
                error = session.error.as_deref().unwrap_or_default(),
                tests = session.tests.len(),
                "Run failed"
            ),
            _ => tracing::info!(
                status = status.as_str(),
                tests = session.tests.len(),
                output = session.output.len(),
                "Run finished"
            ),
        }

        if let Some(ref store) = self.store {
            if let Err(e) = store.save(&session) {
                tracing::error!(session_id = %session.id, error = %e, "Failed to persist session");
            }
        }

        guard.release();

        let event = match terminal {
            Terminal::Completed => ProgressEvent::RunCompleted {
                session: session.clone(),
            },
            Terminal::Aborted => ProgressEvent::RunAborted {
                partial_session: session.clone(),
            },
            Terminal::Failed(e) => ProgressEvent::RunFailed {
                error: e.to_string(),
                partial_session: session.clone(),
            },
        };
        self.emit(event);
        session
    }

    async fn iterate(
        &self,
        config: &RunConfig,
        output: &mut Vec<String>,
        tests: &mut Vec<Vec<TestResult>>,
    ) -> Terminal {
        let tool_specs = match self.resolve_tools(config).await {
            Ok(specs) => specs,
            Err(e) => return Terminal::Failed(e),
        };

        let runner = TestRunner::new(
            self.collab.clone(),
            self.settings.clone(),
            Arc::new(EmbeddingCache::new()),
            tool_specs,
            config.embedding_model.clone(),
        );
        let improver = InstructionImprover::new(self.collab.provider.clone(), self.settings.clone());

        // Test-only mode is a single pass whatever the configured count.
        let iterations = if config.improve_mode { config.iterations } else { 1 };
        let mut active = config.instructions.clone();

        for index in 0..iterations as usize {
            if self.cancel.is_cancelled() {
                return Terminal::Aborted;
            }

            tracing::info!(iteration = index, "Iteration started");
            self.emit(ProgressEvent::IterationStarted { index });

            let pass = self
                .test_pass(&runner, config, index, &active)
                .instrument(tracing::info_span!("iteration", iteration = index))
                .await;

            if !config.improve_mode {
                tests.push(pass.results);
                return if pass.aborted { Terminal::Aborted } else { Terminal::Completed };
            }
            if pass.aborted || self.cancel.is_cancelled() {
                return Terminal::Aborted;
            }

            match improver
                .improve(&active, &pass.results, &config.in_out_pairs, &config.core_model, &self.cancel)
                .await
            {
                Ok(improved) => {
                    tracing::info!(iteration = index, chars = improved.len(), "Instructions improved");
                    self.emit(ProgressEvent::ImprovementProduced {
                        iteration: index,
                        instructions: improved.clone(),
                    });
                    tests.push(pass.results);
                    output.push(improved.clone());
                    active = improved;
                }
                Err(AppError::Aborted(_)) => return Terminal::Aborted,
                Err(e) => {
                    tracing::error!(iteration = index, error = %e, "Improvement failed");
                    tests.push(pass.results);
                    return Terminal::Failed(e);
                }
            }
        }

        Terminal::Completed
    }

    async fn resolve_tools(&self, config: &RunConfig) -> Result<Vec<ToolSpec>, AppError> {
        if config.selected_tools.is_empty() {
            return Ok(Vec::new());
        }
        let Some(ref host) = self.collab.tool_host else {
            return Err(AppError::Validation(
                "Tools were selected but no tool host is configured".into(),
            ));
        };
        let specs = host.resolve(&config.selected_tools).await.map_err(|e| {
            AppError::Validation(format!("Could not resolve selected tools: {e}"))
        })?;
        tracing::debug!(tools = specs.len(), "Resolved tools");
        Ok(specs)
    }

    /// Test every pair with `instructions`, up to `max_concurrent_tests` at a
    /// time. Results keep pair order. Cancellation is checked before each
    /// pair is dispatched; a pass that sees it keeps only the pairs completed
    /// before the first undispatched one.
    async fn test_pass(
        &self,
        runner: &TestRunner,
        config: &RunConfig,
        iteration: usize,
        instructions: &str,
    ) -> PassResult {
        let cancel = &self.cancel;
        let core_model = &config.core_model;

        let pairs = config.in_out_pairs.iter().enumerate().map(|(pair_index, pair)| {
            async move {
                if cancel.is_cancelled() {
                    return None;
                }
                runner
                    .run(pair, instructions, core_model, cancel)
                    .instrument(tracing::debug_span!("pair", pair = pair_index))
                    .await
                    .ok()
            }
        }).collect::<Vec<_>>();

        let mut stream = futures_util::stream::iter(pairs).buffered(self.settings.max_concurrent_tests.max(1));
        let mut results = Vec::with_capacity(config.in_out_pairs.len());
        let mut aborted = false;

        let mut pair_index = 0usize;
        while let Some(outcome) = stream.next().await {
            match outcome {
                Some(result) if !aborted => {
                    tracing::debug!(
                        pair = pair_index,
                        ai_score = result.ai_score,
                        similarity = result.similarity,
                        is_equal = result.is_equal,
                        "Test pair completed"
                    );
                    self.emit(ProgressEvent::TestCompleted {
                        iteration,
                        pair_index,
                        result: result.clone(),
                    });
                    results.push(result);
                }
                Some(_) => {}
                None => aborted = true,
            }
            pair_index += 1;
        }

        PassResult { results, aborted }
    }
}
