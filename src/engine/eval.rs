//! Check evaluation for test pairs.
//!
//! Each `CheckType` tag maps to one `CheckEvaluator` held in a
//! `CheckRegistry`. The test runner looks evaluators up by tag, so new check
//! kinds are added by registering an evaluator rather than touching the
//! runner. Every evaluator produces a standardized `CheckOutcome`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::engine::types::{
    CalledTool, CheckType, TestSettings, ToolCall, ToolExpectation, ToolsCallResult,
};

// ============================================================================
// CheckOutcome: standardized output from any evaluator
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub check: CheckType,
    pub passed: bool,
    /// 0–100.
    pub score: f64,
    pub explanation: String,
    /// Set by JSON_VALID.
    pub is_json_valid: Option<bool>,
    /// Set by TOOLS_CALL.
    pub tools_call_result: Option<ToolsCallResult>,
}

impl CheckOutcome {
    pub fn pass_fail(check: CheckType, passed: bool, explanation: impl Into<String>) -> Self {
        Self {
            check,
            passed,
            score: if passed { 100.0 } else { 0.0 },
            explanation: explanation.into(),
            is_json_valid: None,
            tools_call_result: None,
        }
    }
}

// ============================================================================
// CheckContext: what every evaluator receives
// ============================================================================

pub struct CheckContext<'a> {
    /// The model's final text.
    pub actual: &'a str,
    /// Every tool call the model made, in order, across all tool rounds.
    pub called_tools: &'a [ToolCall],
    pub settings: &'a TestSettings,
}

pub trait CheckEvaluator: Send + Sync {
    fn check_type(&self) -> CheckType;

    /// When true, the pair's expected text is not used for equality,
    /// similarity or AI judging; this check alone decides the pair's score.
    fn replaces_content_scoring(&self) -> bool {
        false
    }

    fn evaluate(&self, ctx: &CheckContext<'_>) -> CheckOutcome;
}

// ============================================================================
// JSON_VALID
// ============================================================================

pub struct JsonValidEvaluator;

impl CheckEvaluator for JsonValidEvaluator {
    fn check_type(&self) -> CheckType {
        CheckType::JSON_VALID
    }

    fn evaluate(&self, ctx: &CheckContext<'_>) -> CheckOutcome {
        let outcome = |valid: bool, explanation: String| CheckOutcome {
            is_json_valid: Some(valid),
            ..CheckOutcome::pass_fail(CheckType::JSON_VALID, valid, explanation)
        };

        let parsed: Value = match serde_json::from_str(ctx.actual.trim()) {
            Ok(v) => v,
            Err(e) => return outcome(false, format!("Output is not valid JSON: {e}")),
        };

        let Some(schema) = ctx.settings.active_json_schema() else {
            return outcome(true, "Output is valid JSON".into());
        };

        let schema = if ctx.settings.json_schema_strict {
            strict_schema(schema)
        } else {
            schema.clone()
        };

        match schema_errors(&schema, &parsed) {
            Ok(errors) if errors.is_empty() => {
                outcome(true, "Output is valid JSON and matches the schema".into())
            }
            Ok(errors) => outcome(
                false,
                format!("Output does not match the schema: {}", errors.join("; ")),
            ),
            Err(e) => outcome(false, format!("JSON schema is invalid: {e}")),
        }
    }
}

/// Copy of `schema` where every object schema forbids unknown properties,
/// unless it already states its own `additionalProperties`.
pub fn strict_schema(schema: &Value) -> Value {
    let mut schema = schema.clone();
    forbid_additional(&mut schema);
    schema
}

fn forbid_additional(node: &mut Value) {
    match node {
        Value::Object(map) => {
            let is_object_schema = map.get("type").and_then(Value::as_str) == Some("object")
                || map.contains_key("properties");
            if is_object_schema && !map.contains_key("additionalProperties") {
                map.insert("additionalProperties".into(), Value::Bool(false));
            }
            for child in map.values_mut() {
                forbid_additional(child);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(forbid_additional),
        _ => {}
    }
}

/// Validation error messages for `instance`, or `Err` if the schema itself
/// does not compile.
fn schema_errors(schema: &Value, instance: &Value) -> Result<Vec<String>, String> {
    let validator = jsonschema::validator_for(schema).map_err(|e| e.to_string())?;
    Ok(validator
        .iter_errors(instance)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{path}: {e}")
            }
        })
        .collect())
}

// ============================================================================
// TOOLS_CALL
// ============================================================================

pub struct ToolsCallEvaluator;

impl ToolsCallEvaluator {
    fn inspect_call(call: &ToolCall, expectation: Option<&ToolExpectation>) -> CalledTool {
        let expected_params = expectation.and_then(|e| e.expected_params.clone());
        let expected_values = expectation.and_then(|e| e.expected_values.clone());

        let arguments_valid = expected_params
            .as_ref()
            .map(|schema| matches!(schema_errors(schema, &call.arguments), Ok(errs) if errs.is_empty()));
        let expected_values_valid = expected_values
            .as_ref()
            .map(|values| arguments_contain(&call.arguments, values));

        CalledTool {
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            arguments_valid,
            expected_values_valid,
            expected_params,
            expected_values,
        }
    }
}

impl CheckEvaluator for ToolsCallEvaluator {
    fn check_type(&self) -> CheckType {
        CheckType::TOOLS_CALL
    }

    fn replaces_content_scoring(&self) -> bool {
        true
    }

    fn evaluate(&self, ctx: &CheckContext<'_>) -> CheckOutcome {
        let expected: &[String] = ctx.settings.tools_called.as_deref().unwrap_or(&[]);

        let called_tools: Vec<CalledTool> = ctx
            .called_tools
            .iter()
            .map(|call| {
                // Argument checks apply only to tools the pair expects.
                let expectation = if expected.contains(&call.name) {
                    ctx.settings.tool_expectations.get(&call.name)
                } else {
                    None
                };
                Self::inspect_call(call, expectation)
            })
            .collect();

        let mut missing: Vec<String> = Vec::new();
        for name in expected {
            let found = ctx.called_tools.iter().any(|c| &c.name == name);
            if !found && !missing.contains(name) {
                missing.push(name.clone());
            }
        }

        let bad_arguments: Vec<String> = called_tools
            .iter()
            .filter(|t| t.arguments_valid == Some(false) || t.expected_values_valid == Some(false))
            .map(|t| t.name.clone())
            .collect();

        let result = ToolsCallResult::new(called_tools, missing);
        let passed = result.success && bad_arguments.is_empty();

        let explanation = if !result.success {
            format!("Expected tools not called: {}", result.missing.join(", "))
        } else if !bad_arguments.is_empty() {
            format!("Tool arguments did not match expectations: {}", bad_arguments.join(", "))
        } else if expected.is_empty() {
            "No tools were expected".into()
        } else {
            format!("All expected tools called: {}", expected.join(", "))
        };

        CheckOutcome {
            tools_call_result: Some(result),
            ..CheckOutcome::pass_fail(CheckType::TOOLS_CALL, passed, explanation)
        }
    }
}

/// True when every key in `expected` is present in `arguments` with a deeply
/// equal value. Keys not named in `expected` are ignored.
pub fn arguments_contain(arguments: &Value, expected: &Map<String, Value>) -> bool {
    let Some(args) = arguments.as_object() else {
        return expected.is_empty();
    };
    expected
        .iter()
        .all(|(key, want)| args.get(key).is_some_and(|got| values_match(got, want)))
}

/// Deep equality that compares numbers by value, so `1` matches `1.0`.
fn values_match(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_match(x, y))
        }
        (Value::Object(xm), Value::Object(ym)) => {
            xm.len() == ym.len()
                && xm
                    .iter()
                    .all(|(k, x)| ym.get(k).is_some_and(|y| values_match(x, y)))
        }
        _ => a == b,
    }
}

// ============================================================================
// CheckRegistry
// ============================================================================

#[derive(Clone)]
pub struct CheckRegistry {
    evaluators: HashMap<CheckType, Arc<dyn CheckEvaluator>>,
}

impl Default for CheckRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(JsonValidEvaluator));
        registry.register(Arc::new(ToolsCallEvaluator));
        registry
    }
}

impl CheckRegistry {
    pub fn empty() -> Self {
        Self {
            evaluators: HashMap::new(),
        }
    }

    /// Add or replace the evaluator for its check type.
    pub fn register(&mut self, evaluator: Arc<dyn CheckEvaluator>) {
        self.evaluators.insert(evaluator.check_type(), evaluator);
    }

    pub fn get(&self, check: &CheckType) -> Option<&Arc<dyn CheckEvaluator>> {
        self.evaluators.get(check)
    }

    /// Whether any of `checks` replaces content scoring.
    pub fn replaces_content_scoring(&self, checks: &[CheckType]) -> bool {
        checks
            .iter()
            .filter_map(|c| self.get(c))
            .any(|e| e.replaces_content_scoring())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx<'a>(actual: &'a str, calls: &'a [ToolCall], settings: &'a TestSettings) -> CheckContext<'a> {
        CheckContext {
            actual,
            called_tools: calls,
            settings,
        }
    }

    fn call(name: &str, arguments: Value) -> ToolCall {
        ToolCall {
            id: format!("call_{name}"),
            name: name.into(),
            arguments,
        }
    }

    #[test]
    fn test_json_valid_rejects_bad_json() {
        let settings = TestSettings::default();
        let outcome = JsonValidEvaluator.evaluate(&ctx("{bad json", &[], &settings));
        assert_eq!(outcome.is_json_valid, Some(false));
        assert!(!outcome.passed);
        assert_eq!(outcome.score, 0.0);
    }

    #[test]
    fn test_json_valid_accepts_json_with_whitespace() {
        let settings = TestSettings::default();
        let outcome = JsonValidEvaluator.evaluate(&ctx("  {\"a\": 1}\n", &[], &settings));
        assert_eq!(outcome.is_json_valid, Some(true));
    }

    #[test]
    fn test_json_schema_ignored_unless_enabled() {
        let settings = TestSettings {
            json_schema: Some(json!({ "type": "array" })),
            ..Default::default()
        };
        let outcome = JsonValidEvaluator.evaluate(&ctx("{}", &[], &settings));
        assert_eq!(outcome.is_json_valid, Some(true));
    }

    #[test]
    fn test_json_schema_strict_forbids_extra_keys() {
        let schema = json!({
            "type": "object",
            "properties": { "name": { "type": "string" } },
            "required": ["name"]
        });
        let mut settings = TestSettings {
            use_json_schema: true,
            json_schema: Some(schema),
            ..Default::default()
        };
        let output = r#"{"name": "Ada", "age": 36}"#;

        let lax = JsonValidEvaluator.evaluate(&ctx(output, &[], &settings));
        assert_eq!(lax.is_json_valid, Some(true));

        settings.json_schema_strict = true;
        let strict = JsonValidEvaluator.evaluate(&ctx(output, &[], &settings));
        assert_eq!(strict.is_json_valid, Some(false));
        assert!(strict.explanation.contains("schema"));
    }

    #[test]
    fn test_strict_schema_recurses_and_respects_explicit() {
        let schema = json!({
            "type": "object",
            "properties": {
                "inner": { "type": "object", "properties": { "x": {} } },
                "open": { "type": "object", "additionalProperties": true }
            }
        });
        let strict = strict_schema(&schema);
        assert_eq!(strict["additionalProperties"], false);
        assert_eq!(strict["properties"]["inner"]["additionalProperties"], false);
        assert_eq!(strict["properties"]["open"]["additionalProperties"], true);
    }

    #[test]
    fn test_tools_call_missing_tool() {
        let settings = TestSettings {
            check_types: vec![CheckType::TOOLS_CALL],
            tools_called: Some(vec!["search".into()]),
            ..Default::default()
        };
        let outcome = ToolsCallEvaluator.evaluate(&ctx("I don't know", &[], &settings));
        let result = outcome.tools_call_result.unwrap();
        assert!(!result.success);
        assert_eq!(result.missing, vec!["search".to_string()]);
        assert!(result.called_tools.is_empty());
        assert!(!outcome.passed);
    }

    #[test]
    fn test_tools_call_extra_calls_do_not_fail() {
        let settings = TestSettings {
            tools_called: Some(vec!["search".into()]),
            ..Default::default()
        };
        let calls = [call("search", json!({ "q": "rust" })), call("weather", json!({}))];
        let outcome = ToolsCallEvaluator.evaluate(&ctx("", &calls, &settings));
        let result = outcome.tools_call_result.unwrap();
        assert!(result.success);
        assert_eq!(result.called_tools.len(), 2);
        assert_eq!(result.called_tools[1].arguments_valid, None);
        assert!(outcome.passed);
    }

    #[test]
    fn test_tools_call_argument_expectations() {
        let mut expectations = HashMap::new();
        expectations.insert(
            "search".to_string(),
            ToolExpectation {
                expected_params: Some(json!({
                    "type": "object",
                    "properties": { "q": { "type": "string" }, "limit": { "type": "integer" } },
                    "required": ["q"]
                })),
                expected_values: Some(json!({ "limit": 5.0 }).as_object().cloned().unwrap()),
            },
        );
        let settings = TestSettings {
            tools_called: Some(vec!["search".into()]),
            tool_expectations: expectations,
            ..Default::default()
        };

        let good = [call("search", json!({ "q": "rust", "limit": 5 }))];
        let outcome = ToolsCallEvaluator.evaluate(&ctx("", &good, &settings));
        let tool = &outcome.tools_call_result.as_ref().unwrap().called_tools[0];
        assert_eq!(tool.arguments_valid, Some(true));
        assert_eq!(tool.expected_values_valid, Some(true));
        assert!(outcome.passed);

        let bad = [call("search", json!({ "limit": 3 }))];
        let outcome = ToolsCallEvaluator.evaluate(&ctx("", &bad, &settings));
        let result = outcome.tools_call_result.unwrap();
        assert!(result.success, "presence alone decides success");
        assert_eq!(result.called_tools[0].arguments_valid, Some(false));
        assert_eq!(result.called_tools[0].expected_values_valid, Some(false));
        assert!(!outcome.passed);
    }

    #[test]
    fn test_arguments_contain_deep() {
        let expected = json!({ "filter": { "tags": ["a", "b"] } });
        let expected = expected.as_object().unwrap();
        assert!(arguments_contain(
            &json!({ "filter": { "tags": ["a", "b"] }, "extra": 1 }),
            expected
        ));
        assert!(!arguments_contain(&json!({ "filter": { "tags": ["b", "a"] } }), expected));
        assert!(!arguments_contain(&json!("not an object"), expected));
    }

    #[test]
    fn test_registry_lookup_and_extension() {
        struct NonEmpty;
        impl CheckEvaluator for NonEmpty {
            fn check_type(&self) -> CheckType {
                CheckType::new("NON_EMPTY")
            }
            fn evaluate(&self, ctx: &CheckContext<'_>) -> CheckOutcome {
                CheckOutcome::pass_fail(self.check_type(), !ctx.actual.is_empty(), "non-empty")
            }
        }

        let mut registry = CheckRegistry::default();
        assert!(registry.get(&CheckType::JSON_VALID).is_some());
        assert!(registry.get(&CheckType::new("NON_EMPTY")).is_none());
        registry.register(Arc::new(NonEmpty));
        assert!(registry.get(&CheckType::new("NON_EMPTY")).is_some());

        assert!(registry.replaces_content_scoring(&[CheckType::JSON_VALID, CheckType::TOOLS_CALL]));
        assert!(!registry.replaces_content_scoring(&[CheckType::JSON_VALID, CheckType::new("NON_EMPTY")]));
    }
}
