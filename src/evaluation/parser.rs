//! Tolerant parsing of evaluator replies.
//!
//! Model providers pad JSON with Markdown fences, trailing prose, and the
//! occasional truncation. All cleaning lives here: the rest of the crate
//! only ever sees a `ParsedEvaluation` or a typed error. A reply that fails
//! to parse after repair is a failed record, never a panic.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::evaluation::types::ParsedEvaluation;
use crate::markers;

/// Parse a raw model reply into a structured evaluation.
///
/// Error cases: `EmptyResponse` for blank replies, `Refusal` when the reply
/// is a refusal phrase with no parseable JSON, `Parse` otherwise. A refusal
/// that still carries scores is kept as data.
pub fn parse_evaluation(raw: &str) -> Result<ParsedEvaluation> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::EmptyResponse);
    }

    let candidate = strip_fences(trimmed);
    let value = extract_object(candidate).and_then(|json| parse_with_repair(&json));

    match value.and_then(|v| build_evaluation(&v)) {
        Some(parsed) => Ok(parsed),
        None => {
            if markers::is_refusal(trimmed) {
                Err(Error::Refusal(snippet(trimmed)))
            } else {
                Err(Error::parse(format!("no evaluation object in: {}", snippet(trimmed))))
            }
        }
    }
}

fn snippet(text: &str) -> String {
    let mut s: String = text.chars().take(120).collect();
    if text.chars().count() > 120 {
        s.push('…');
    }
    s
}

/// Strip Markdown code fences, returning the fenced body when one exists.
fn strip_fences(text: &str) -> &str {
    for opener in ["```json", "```"] {
        if let Some(start) = text.find(opener) {
            let body_start = start + opener.len();
            let body = &text[body_start..];
            return match body.find("```") {
                Some(end) => body[..end].trim(),
                // Unterminated fence: keep everything after the opener
                None => body.trim(),
            };
        }
    }
    text
}

/// Extract the first brace-balanced JSON object, repairing truncation.
///
/// Scans with string/escape awareness. Control characters inside string
/// literals are re-escaped so the strict JSON parser accepts them. If the
/// input ends mid-object, outstanding strings and braces are closed.
fn extract_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut out = String::with_capacity(text.len() - start);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text[start..].chars() {
        if in_string {
            if escaped {
                out.push(c);
                escaped = false;
                continue;
            }
            match c {
                '\\' => {
                    out.push(c);
                    escaped = true;
                }
                '"' => {
                    out.push(c);
                    in_string = false;
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
                c => out.push(c),
            }
            continue;
        }

        match c {
            '"' => {
                out.push(c);
                in_string = true;
            }
            '{' | '[' => {
                out.push(c);
                stack.push(c);
            }
            '}' | ']' => {
                out.push(c);
                stack.pop();
                if stack.is_empty() {
                    // First balanced object complete; trailing prose ignored
                    return Some(out);
                }
            }
            c => out.push(c),
        }
    }

    // Truncated object: close the open string, drop a dangling partial
    // token, and close every open scope.
    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }
    let trimmed = out.trim_end().trim_end_matches(',').to_string();
    out = trimmed;
    for opener in stack.iter().rev() {
        out.push(if *opener == '{' { '}' } else { ']' });
    }
    Some(out)
}

/// Parse, and on failure retry once with the last (possibly truncated)
/// field dropped.
fn parse_with_repair(json: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str::<Value>(json) {
        return Some(v);
    }

    let closers: String = json
        .chars()
        .rev()
        .take_while(|c| matches!(c, '}' | ']'))
        .collect();
    let body = &json[..json.len() - closers.len()];
    let cut = body.rfind(',')?;
    let repaired = format!("{}{}", &body[..cut], closers.chars().rev().collect::<String>());
    serde_json::from_str::<Value>(&repaired).ok()
}

/// Fetch a unit-interval coordinate, tolerating string-encoded numbers and
/// short key aliases ("T" for "truth"). Returns (value, was_coerced).
fn coordinate(obj: &Value, long: &str, short: &str) -> Option<(f64, bool)> {
    let raw = obj.get(long).or_else(|| obj.get(short))?;
    match raw {
        Value::Number(n) => {
            let v = n.as_f64()?;
            let clamped = v.clamp(0.0, 1.0);
            Some((clamped, clamped != v))
        }
        Value::String(s) => {
            let v: f64 = s.trim().parse().ok()?;
            Some((v.clamp(0.0, 1.0), true))
        }
        _ => None,
    }
}

fn string_field(obj: &Value, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

fn string_list(obj: &Value, key: &str) -> Vec<String> {
    obj.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Assemble a `ParsedEvaluation` from a decoded JSON object.
///
/// At least one coordinate must be present; missing ones default to 0.5
/// (maximal indeterminacy about the missing axis) with the coercion flag set.
fn build_evaluation(obj: &Value) -> Option<ParsedEvaluation> {
    if !obj.is_object() {
        return None;
    }

    let truth = coordinate(obj, "truth", "T");
    let indeterminacy = coordinate(obj, "indeterminacy", "I");
    let falsehood = coordinate(obj, "falsehood", "F");
    if truth.is_none() && indeterminacy.is_none() && falsehood.is_none() {
        return None;
    }

    let missing = truth.is_none() || indeterminacy.is_none() || falsehood.is_none();
    let (t, t_coerced) = truth.unwrap_or((0.5, true));
    let (i, i_coerced) = indeterminacy.unwrap_or((0.5, true));
    let (f, f_coerced) = falsehood.unwrap_or((0.5, true));

    Some(ParsedEvaluation {
        truth: t,
        indeterminacy: i,
        falsehood: f,
        reasoning: string_field(obj, "reasoning").unwrap_or_default(),
        patterns_observed: string_list(obj, "patterns_observed"),
        consensus_patterns: string_list(obj, "consensus_patterns"),
        exchange_type: string_field(obj, "exchange_type"),
        trust_established: string_field(obj, "trust_established"),
        trust_claimed: string_field(obj, "trust_claimed"),
        trust_gap: string_field(obj, "trust_gap"),
        coerced: missing || t_coerced || i_coerced || f_coerced,
    })
}
