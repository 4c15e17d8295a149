pub mod compare;
pub mod controller;
pub mod eval;
pub mod judge;
pub mod optimizer;
pub mod prompt;
pub mod provider;
pub mod recorder;
pub mod registry;
pub mod test_runner;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{EngineSettings, MAX_ITERATIONS};
use crate::error::AppError;
use crate::validation::{require_in_range, require_non_empty, require_valid_schema};

use self::compare::EmbeddingCache;
use self::controller::IterationController;
use self::eval::CheckEvaluator;
use self::provider::{KnowledgeRetriever, ModelProvider, SessionStore, ToolHost};
use self::recorder::SessionRecorder;
use self::registry::{ProgressStream, RunHandle, RunRegistry};
use self::test_runner::{Collaborators, TestRunner};
use self::types::{ModelRef, RunConfig, TestPair};

/// Stop the process-wide active run, if any. Idempotent.
pub fn stop() -> bool {
    RunRegistry::global().stop()
}

/// The top-level improvement engine. Cheap to clone; every clone shares the
/// same collaborators and run registry.
#[derive(Clone)]
pub struct Engine {
    collab: Collaborators,
    store: Option<Arc<dyn SessionStore>>,
    settings: EngineSettings,
    registry: Arc<RunRegistry>,
}

impl Engine {
    /// An engine on the process-wide registry with default settings and the
    /// built-in check evaluators.
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            collab: Collaborators::new(provider),
            store: None,
            settings: EngineSettings::default(),
            registry: RunRegistry::global(),
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn KnowledgeRetriever>) -> Self {
        self.collab.retriever = Some(retriever);
        self
    }

    pub fn with_tool_host(mut self, host: Arc<dyn ToolHost>) -> Self {
        self.collab.tool_host = Some(host);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a private registry instead of the process-wide one.
    pub fn with_registry(mut self, registry: Arc<RunRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Add or replace the evaluator for a check type.
    pub fn with_check(mut self, evaluator: Arc<dyn CheckEvaluator>) -> Self {
        Arc::make_mut(&mut self.collab.checks).register(evaluator);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Validate `config` and start a run in the background.
    ///
    /// Fails fast with `AppError::Validation` on bad settings or config, or
    /// when another run is already active on this engine's registry.
    pub fn start(&self, config: RunConfig) -> Result<RunHandle, AppError> {
        self.settings.validate()?;
        validate_config(&config)?;

        let recorder = SessionRecorder::start();
        let run_id = recorder.id().to_string();
        let cancel = CancellationToken::new();
        let guard = self.registry.begin(&run_id, cancel.clone())?;

        let (tx, events) = ProgressStream::channel();
        let controller = IterationController::new(
            self.collab.clone(),
            self.settings.clone(),
            self.store.clone(),
            tx,
            cancel.clone(),
        );

        let span = tracing::info_span!("run", run_id = %run_id);
        let task = tokio::spawn(controller.run(config, recorder, guard).instrument(span));

        Ok(RunHandle::new(run_id, cancel, events, task))
    }

    /// Start a run and return only its event stream. Use `stop()` to cancel.
    pub fn run(&self, config: RunConfig) -> Result<ProgressStream, AppError> {
        self.start(config).map(RunHandle::into_events)
    }

    /// Stop this engine's active run, if any. Idempotent.
    pub fn stop(&self) -> bool {
        self.registry.stop()
    }

    pub fn is_running(&self) -> bool {
        self.registry.is_running()
    }

    /// Run `pair` once with `instructions` and return the model's text so it
    /// can become the pair's expected output.
    pub async fn fill_output(
        &self,
        pair: &TestPair,
        instructions: &str,
        core_model: &ModelRef,
        selected_tools: &[String],
    ) -> Result<String, AppError> {
        self.settings.validate()?;
        require_non_empty("in", &pair.input)?;

        let tool_specs = if selected_tools.is_empty() {
            Vec::new()
        } else {
            let Some(ref host) = self.collab.tool_host else {
                return Err(AppError::Validation(
                    "Tools were selected but no tool host is configured".into(),
                ));
            };
            host.resolve(selected_tools).await?
        };

        let runner = TestRunner::new(
            self.collab.clone(),
            self.settings.clone(),
            Arc::new(EmbeddingCache::new()),
            tool_specs,
            None,
        );
        runner
            .fill_output(pair, instructions, core_model, &CancellationToken::new())
            .await
    }
}

/// Reject configs that cannot produce a meaningful run.
pub fn validate_config(config: &RunConfig) -> Result<(), AppError> {
    if config.in_out_pairs.is_empty() {
        return Err(AppError::Validation("At least one test pair is required".into()));
    }
    require_non_empty("coreModel.id", &config.core_model.id)?;
    require_in_range("iterations", config.iterations, 0, MAX_ITERATIONS)?;

    for (i, pair) in config.in_out_pairs.iter().enumerate() {
        require_non_empty(&format!("inOutPairs[{i}].in"), &pair.input)?;

        if let Some(schema) = pair.settings.active_json_schema() {
            require_valid_schema(&format!("inOutPairs[{i}].settings.jsonSchema"), schema)?;
        }
        for (tool, expectation) in &pair.settings.tool_expectations {
            if let Some(ref schema) = expectation.expected_params {
                require_valid_schema(
                    &format!("inOutPairs[{i}].settings.toolExpectations.{tool}.expectedParams"),
                    schema,
                )?;
            }
        }
    }
    Ok(())
}
