//! Prompt builders for the judge, the instruction improver, and RAG context.

use crate::engine::types::{
    ChatMessage, CheckType, KnowledgeBaseRef, RetrievedChunk, TestPair, TestResult,
};

/// Per-field cap when quoting test texts back to a model.
const MAX_QUOTED_CHARS: usize = 2_000;

/// Truncate on a char boundary, marking the cut.
pub fn truncate_for_prompt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str(" …[truncated]");
    cut
}

fn quote(text: &str) -> String {
    truncate_for_prompt(text, MAX_QUOTED_CHARS)
}

/// Remove a surrounding markdown code fence (```lang ... ```), if any.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed.to_string();
    };
    // Drop the language tag line, if present.
    let body = match body.find('\n') {
        Some(pos) if !body[..pos].trim().contains(' ') => &body[pos + 1..],
        _ => body,
    };
    body.trim().to_string()
}

// ============================================================================
// AI judge
// ============================================================================

const JUDGE_SYSTEM: &str = "You are a strict evaluator of language model outputs. \
You compare an actual answer against a reference answer for the same input and rate \
how well the actual answer fulfils the same intent, content and format. \
Respond with a JSON object only: {\"score\": <number 0-100>, \"feedback\": \"<one or two sentences>\"}.";

pub fn build_judge_messages(input: &str, expected: &str, actual: &str) -> Vec<ChatMessage> {
    let mut prompt = String::new();

    prompt.push_str("## Input\n");
    prompt.push_str(&quote(input));
    prompt.push_str("\n\n");

    prompt.push_str("## Reference Output\n");
    if expected.trim().is_empty() {
        prompt.push_str("(No reference output was given. Judge the actual output on whether it is a correct, complete and well-formed answer to the input.)");
    } else {
        prompt.push_str(&quote(expected));
    }
    prompt.push_str("\n\n");

    prompt.push_str("## Actual Output\n");
    if actual.trim().is_empty() {
        prompt.push_str("(empty)");
    } else {
        prompt.push_str(&quote(actual));
    }
    prompt.push_str("\n\n");

    prompt.push_str("## Scoring\n");
    prompt.push_str("- 100: equivalent to the reference in meaning and format\n");
    prompt.push_str("- 70-99: correct with minor differences in wording or detail\n");
    prompt.push_str("- 30-69: partially correct or wrong format\n");
    prompt.push_str("- 0-29: wrong, missing or unrelated\n");

    vec![ChatMessage::system(JUDGE_SYSTEM), ChatMessage::user(prompt)]
}

// ============================================================================
// Instruction improvement / generation
// ============================================================================

const IMPROVE_SYSTEM: &str = "You are an expert prompt engineer. You rewrite system \
instructions for a language model so that it produces the expected outputs for the \
given test cases. Reply with the complete new instructions only, without commentary, \
headings about your changes, or code fences.";

fn is_failing(result: &TestResult) -> bool {
    if result.is_equal {
        return false;
    }
    let tools_failed = result
        .tools_call_result
        .as_ref()
        .is_some_and(|t| !t.success);
    tools_failed || result.is_json_valid == Some(false) || result.ai_score < 100.0
}

fn push_result(prompt: &mut String, n: usize, result: &TestResult) {
    prompt.push_str(&format!("### Test {n}\n"));
    prompt.push_str(&format!("**Input**:\n{}\n", quote(&result.input)));
    if !result.expected.trim().is_empty() {
        prompt.push_str(&format!("**Expected**:\n{}\n", quote(&result.expected)));
    }
    prompt.push_str(&format!("**Actual**:\n{}\n", quote(&result.result)));
    prompt.push_str(&format!(
        "**Score**: {:.0}/100 (similarity {:.0}%)\n",
        result.ai_score,
        result.similarity * 100.0
    ));
    if let Some(valid) = result.is_json_valid {
        prompt.push_str(&format!("**Valid JSON**: {}\n", if valid { "yes" } else { "no" }));
    }
    if let Some(ref tools) = result.tools_call_result {
        if !tools.missing.is_empty() {
            prompt.push_str(&format!("**Tools not called**: {}\n", tools.missing.join(", ")));
        }
    }
    if let Some(ref feedback) = result.ai_feedback {
        prompt.push_str(&format!("**Feedback**: {}\n", quote(feedback)));
    }
    prompt.push('\n');
}

pub fn build_improve_messages(current: &str, results: &[TestResult]) -> Vec<ChatMessage> {
    let mut prompt = String::new();

    prompt.push_str("## Current Instructions\n");
    prompt.push_str(current);
    prompt.push_str("\n\n");

    let failing: Vec<(usize, &TestResult)> = results
        .iter()
        .enumerate()
        .filter(|(_, r)| is_failing(r))
        .collect();

    prompt.push_str(&format!(
        "## Test Results\n{} of {} tests passed.\n\n",
        results.len() - failing.len(),
        results.len()
    ));

    if failing.is_empty() {
        prompt.push_str("All tests pass. Tighten and clarify the instructions without changing the behaviour they produce.\n");
    } else {
        prompt.push_str("## Failing Tests\n");
        for (i, result) in &failing {
            push_result(&mut prompt, i + 1, result);
        }
        prompt.push_str("Rewrite the instructions so these tests pass while keeping the passing ones passing.\n");
    }

    vec![ChatMessage::system(IMPROVE_SYSTEM), ChatMessage::user(prompt)]
}

pub fn build_generate_messages(pairs: &[TestPair]) -> Vec<ChatMessage> {
    let mut prompt = String::new();
    prompt.push_str("There are no instructions yet. Write system instructions that make a language model produce the expected output for each of these examples.\n\n");

    prompt.push_str("## Examples\n");
    for (i, pair) in pairs.iter().enumerate() {
        prompt.push_str(&format!("### Example {}\n", i + 1));
        prompt.push_str(&format!("**Input**:\n{}\n", quote(&pair.input)));
        if pair.expected.trim().is_empty() {
            prompt.push_str("**Expected**: (not given)\n");
        } else {
            prompt.push_str(&format!("**Expected**:\n{}\n", quote(&pair.expected)));
        }
        if let Some(ref tools) = pair.settings.tools_called {
            if !tools.is_empty() {
                prompt.push_str(&format!("**Must call tools**: {}\n", tools.join(", ")));
            }
        }
        if pair.settings.has_check(&CheckType::JSON_VALID) {
            prompt.push_str("**Output must be valid JSON**\n");
        }
        prompt.push('\n');
    }

    vec![ChatMessage::system(IMPROVE_SYSTEM), ChatMessage::user(prompt)]
}

// ============================================================================
// Knowledge-base context
// ============================================================================

/// System-prompt appendix with retrieved chunks, grouped per knowledge base.
pub fn build_rag_context(retrieved: &[(KnowledgeBaseRef, Vec<RetrievedChunk>)]) -> Option<String> {
    if retrieved.iter().all(|(_, chunks)| chunks.is_empty()) {
        return None;
    }

    let mut ctx = String::from("## Knowledge Base Context\nUse the following excerpts when they are relevant to the request.\n\n");
    for (kb, chunks) in retrieved.iter().filter(|(_, c)| !c.is_empty()) {
        let label = if kb.name.is_empty() { &kb.id } else { &kb.name };
        ctx.push_str(&format!("### {label}\n"));
        for chunk in chunks {
            ctx.push_str(&format!(
                "[{} #{} · {:.2}]\n{}\n\n",
                chunk.file_name, chunk.index, chunk.similarity, chunk.text
            ));
        }
    }
    Some(ctx.trim_end().to_string())
}
