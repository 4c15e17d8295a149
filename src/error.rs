use serde::Serialize;

/// App-wide error type. Every fallible function returns `Result<T, AppError>`.
/// Serializes cleanly so a frontend gets structured error messages.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Model call failed or timed out.
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Instruction rewrite failed. Fatal to the run.
    #[error("Improvement error: {0}")]
    Improvement(String),

    #[error("Knowledge base retrieval error: {0}")]
    Rag(String),

    #[error("Tool invocation error: {0}")]
    ToolInvocation(String),

    /// Run cancelled by the user.
    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// Errors that only degrade a single test pair and never sink the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AppError::Provider(_)
                | AppError::Embedding(_)
                | AppError::Rag(_)
                | AppError::ToolInvocation(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Database(_) => "database",
            AppError::Pool(_) => "pool",
            AppError::NotFound(_) => "not_found",
            AppError::Validation(_) => "validation",
            AppError::Io(_) => "io",
            AppError::Serde(_) => "serde",
            AppError::Provider(_) => "provider",
            AppError::Embedding(_) => "embedding",
            AppError::Improvement(_) => "improvement",
            AppError::Rag(_) => "rag",
            AppError::ToolInvocation(_) => "tool_invocation",
            AppError::Aborted(_) => "aborted",
            AppError::Internal(_) => "internal",
        }
    }
}

/// Serialized as `{ error: "...", kind: "..." }` for frontend consumption.
impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("error", &self.to_string())?;
        s.serialize_field("kind", self.kind())?;
        s.end()
    }
}
