use std::fmt::Display;

use crate::error::AppError;

pub fn require_non_empty(field: &str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::Validation(format!("{field} cannot be empty")));
    }
    Ok(())
}

/// Inclusive range check for numeric settings.
pub fn require_in_range<T>(field: &str, value: T, min: T, max: T) -> Result<(), AppError>
where
    T: PartialOrd + Display + Copy,
{
    if value < min || value > max {
        return Err(AppError::Validation(format!(
            "{field} must be between {min} and {max} (got {value})"
        )));
    }
    Ok(())
}

/// Compile a JSON Schema, surfacing a malformed schema as a validation error.
pub fn require_valid_schema(field: &str, schema: &serde_json::Value) -> Result<(), AppError> {
    jsonschema::validator_for(schema)
        .map(|_| ())
        .map_err(|e| AppError::Validation(format!("{field} is not a valid JSON Schema: {e}")))
}
