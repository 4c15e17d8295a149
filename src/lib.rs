//! Recursive prompt improvement and evaluation.
//!
//! A run tests a set of instructions against input/expected-output pairs,
//! scores every answer, and (in improve mode) asks the core model to rewrite
//! the instructions between iterations. See [`engine::Engine`].

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;
pub mod validation;

pub use config::{EngineSettings, ProviderSettings, Settings};
pub use db::models::{Session, SessionSummary};
pub use engine::eval::{CheckContext, CheckEvaluator, CheckOutcome};
pub use engine::provider::{KnowledgeRetriever, ModelProvider, SessionStore, ToolHost};
pub use engine::registry::{ProgressStream, RunHandle};
pub use engine::types::{
    CheckType, ModelRef, ProgressEvent, RunConfig, RunStatus, TestPair, TestResult, TestSettings,
    ToolsCallResult,
};
pub use engine::{stop, Engine};
pub use error::AppError;
