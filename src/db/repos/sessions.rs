use rusqlite::{params, Row};

use crate::db::models::Session;
use crate::db::DbPool;
use crate::error::AppError;

// ── Row mappers ────────────────────────────────────────────────

fn row_to_session(row: &Row) -> rusqlite::Result<Result<Session, AppError>> {
    let data: String = row.get("data")?;
    Ok(serde_json::from_str(&data).map_err(AppError::from))
}

// ── Sessions ───────────────────────────────────────────────────

/// Insert or replace a session. Sessions are immutable once persisted, so a
/// replace only happens when the same record is handed over twice.
pub fn save(pool: &DbPool, session: &Session) -> Result<(), AppError> {
    let data = serde_json::to_string(session)?;
    let avg_ai_score = session.summary.iterations.last().map(|i| i.avg_ai_score);

    let conn = pool.get()?;
    conn.execute(
        "INSERT OR REPLACE INTO sessions
         (id, timestamp, instructions, core_model_id, core_model_text, improve_mode,
          iterations, status, avg_ai_score, data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            session.id,
            session.timestamp,
            session.instructions,
            session.core_model.id,
            session.core_model.text,
            session.improve_mode as i32,
            session.iterations,
            session.status.as_str(),
            avg_ai_score,
            data,
        ],
    )?;

    tracing::debug!(session_id = %session.id, status = session.status.as_str(), "Session saved");
    Ok(())
}

pub fn get_by_id(pool: &DbPool, id: &str) -> Result<Session, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT data FROM sessions WHERE id = ?1",
        params![id],
        row_to_session,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(format!("Session {id}")),
        other => AppError::Database(other),
    })?
}

/// Newest first. `search` matches the instructions or the core model id/label.
pub fn list(pool: &DbPool, search: Option<&str>, limit: Option<i64>) -> Result<Vec<Session>, AppError> {
    let limit = limit.unwrap_or(100);
    let conn = pool.get()?;

    let rows: Vec<Result<Session, AppError>> = match search.map(str::trim).filter(|s| !s.is_empty()) {
        Some(term) => {
            let pattern = format!("%{}%", term.to_lowercase());
            let mut stmt = conn.prepare(
                "SELECT data FROM sessions
                 WHERE lower(instructions) LIKE ?1
                    OR lower(core_model_id) LIKE ?1
                    OR lower(coalesce(core_model_text, '')) LIKE ?1
                 ORDER BY timestamp DESC LIMIT ?2",
            )?;
            let mapped = stmt.query_map(params![pattern, limit], row_to_session)?;
            mapped.collect::<Result<Vec<_>, _>>()?
        }
        None => {
            let mut stmt =
                conn.prepare("SELECT data FROM sessions ORDER BY timestamp DESC LIMIT ?1")?;
            let mapped = stmt.query_map(params![limit], row_to_session)?;
            mapped.collect::<Result<Vec<_>, _>>()?
        }
    };

    rows.into_iter().collect()
}

pub fn delete(pool: &DbPool, id: &str) -> Result<bool, AppError> {
    let conn = pool.get()?;
    let rows = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
    Ok(rows > 0)
}

/// Remove every session. Returns the number of rows deleted.
pub fn clear_all(pool: &DbPool) -> Result<usize, AppError> {
    let conn = pool.get()?;
    let rows = conn.execute("DELETE FROM sessions", [])?;
    tracing::info!(deleted = rows, "Cleared all sessions");
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::db::models::SessionSummary;
    use crate::engine::types::{ModelRef, RunStatus};

    fn make_session(id: &str, timestamp: i64, instructions: &str, model: &str) -> Session {
        Session {
            id: id.into(),
            timestamp,
            instructions: instructions.into(),
            core_model: ModelRef::new("openai", model),
            embedding_model: None,
            improve_mode: true,
            iterations: 2,
            selected_tools: vec![],
            in_out_pairs: vec![],
            output: vec!["better".into()],
            tests: vec![vec![]],
            status: RunStatus::Completed,
            error: None,
            summary: SessionSummary::default(),
        }
    }

    #[test]
    fn test_crud_session() {
        let pool = init_test_db().unwrap();

        save(&pool, &make_session("s1", 10, "Answer in French", "gpt-4o")).unwrap();
        save(&pool, &make_session("s2", 20, "Answer in JSON", "llama3")).unwrap();

        let fetched = get_by_id(&pool, "s1").unwrap();
        assert_eq!(fetched.instructions, "Answer in French");
        assert_eq!(fetched.output, vec!["better".to_string()]);

        let all = list(&pool, None, None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "s2", "newest first");

        let by_model = list(&pool, Some("LLAMA"), None).unwrap();
        assert_eq!(by_model.len(), 1);
        assert_eq!(by_model[0].id, "s2");

        let by_text = list(&pool, Some("french"), None).unwrap();
        assert_eq!(by_text.len(), 1);

        assert!(delete(&pool, "s1").unwrap());
        assert!(!delete(&pool, "s1").unwrap());
        assert!(matches!(get_by_id(&pool, "s1"), Err(AppError::NotFound(_))));

        assert_eq!(clear_all(&pool).unwrap(), 1);
        assert!(list(&pool, None, None).unwrap().is_empty());
    }
}
