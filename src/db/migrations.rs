use rusqlite::Connection;

use crate::error::AppError;

/// Run the idempotent schema migration.
pub fn run(conn: &Connection) -> Result<(), AppError> {
    tracing::debug!("Running database migrations");

    conn.execute_batch(SCHEMA)?;

    tracing::info!("Database migrations complete");
    Ok(())
}

const SCHEMA: &str = r#"

-- ============================================================================
-- Sessions
-- ============================================================================

CREATE TABLE IF NOT EXISTS sessions (
    id              TEXT PRIMARY KEY,
    timestamp       INTEGER NOT NULL,
    instructions    TEXT NOT NULL,
    core_model_id   TEXT NOT NULL,
    core_model_text TEXT,
    improve_mode    INTEGER NOT NULL DEFAULT 1,
    iterations      INTEGER NOT NULL DEFAULT 1,
    status          TEXT NOT NULL,
    avg_ai_score    REAL,
    data            TEXT NOT NULL,
    created_at      TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_sessions_timestamp ON sessions(timestamp DESC);

"#;
