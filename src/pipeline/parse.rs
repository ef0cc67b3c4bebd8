//! Total, permissive parsing of collaborator output.
//!
//! LLM collaborators return loosely structured JSON, sometimes wrapped in
//! prose or with the wrong scalar types. Every coercion lives here as a
//! total function with a defined fallback, so the business logic never
//! inspects raw values.

use crate::pipeline::{EvaluationDecision, ResponseDirective};
use crate::watch::watcher::{UpdateFrequency, clamp_wait_secs};
use serde_json::Value;

/// Wait duration assumed when the collaborator omits or mangles the field.
pub const DEFAULT_WAIT_SECS: u64 = 120;

/// Coerce a loosely typed value to a bool. Recognizes real booleans,
/// "true"/"yes"/"1" strings (case-insensitive), and nonzero numbers.
/// Anything else is false.
pub fn coerce_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => {
            matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1")
        }
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => false,
    }
}

/// Extract message IDs from either a JSON array or a comma-separated string,
/// keeping only purely numeric tokens.
pub fn parse_message_ids(value: &Value) -> Vec<String> {
    let tokens: Vec<String> = match value {
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.trim().to_string(),
                Value::Number(n) => n.to_string(),
                _ => String::new(),
            })
            .collect(),
        Value::String(s) => s.split(',').map(|t| t.trim().to_string()).collect(),
        Value::Number(n) => vec![n.to_string()],
        _ => Vec::new(),
    };

    tokens
        .into_iter()
        .filter(|t| !t.is_empty() && t.chars().all(|c| c.is_ascii_digit()))
        .collect()
}

/// Match an update frequency out of free text or a number of seconds.
/// Unrecognized input falls back to one minute.
pub fn parse_update_frequency(value: &Value) -> UpdateFrequency {
    if let Some(n) = value.as_u64() {
        return match n {
            0..=10 => UpdateFrequency::TenSeconds,
            11..=60 => UpdateFrequency::OneMinute,
            _ => UpdateFrequency::FiveMinutes,
        };
    }
    let text = value.as_str().unwrap_or("").trim().to_ascii_lowercase();
    match text.as_str() {
        "10s" | "10 seconds" | "10sec" | "ten seconds" => UpdateFrequency::TenSeconds,
        "5m" | "5 minutes" | "5min" | "five minutes" => UpdateFrequency::FiveMinutes,
        _ => UpdateFrequency::OneMinute,
    }
}

/// Parse a wait duration in seconds, clamped to the watcher's allowed range.
pub fn parse_wait_secs(value: &Value) -> u64 {
    let raw = match value {
        Value::Number(n) => n.as_f64().map(|f| f.max(0.0) as u64),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    clamp_wait_secs(raw.unwrap_or(DEFAULT_WAIT_SECS))
}

/// Pull the first JSON object out of text that may wrap it in prose or a
/// code fence. Returns `None` when nothing parses.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed)
        && value.is_object()
    {
        return Some(value);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&trimmed[start..=end])
        .ok()
        .filter(Value::is_object)
}

/// Decode an evaluation decision from collaborator JSON, coercing every
/// field defensively.
pub fn parse_evaluation(value: &Value) -> EvaluationDecision {
    EvaluationDecision {
        should_respond: coerce_bool(&value["should_respond"]),
        relevant_message_ids: parse_message_ids(&value["relevant_message_ids"]),
        reasoning: value["reasoning"].as_str().unwrap_or("").to_string(),
        personality_hint: value["personality_hint"]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from),
    }
}

/// Decode a response directive from collaborator JSON.
pub fn parse_directive(value: &Value) -> ResponseDirective {
    ResponseDirective {
        response: value["response"].as_str().unwrap_or("").to_string(),
        continue_watching: coerce_bool(&value["continue_watching"]),
        watching_for: value["watching_for"].as_str().unwrap_or("").to_string(),
        wait_duration_secs: parse_wait_secs(match &value["wait_duration_secs"] {
            Value::Null => &value["wait_duration"],
            present => present,
        }),
        update_frequency: parse_update_frequency(&value["update_frequency"]),
        tokens_used: value["tokens_used"].as_u64().unwrap_or(0),
    }
}
