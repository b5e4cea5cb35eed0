// =============================================================================
// TOKEN ESTIMATION
// =============================================================================
//
// We don't ship a tokenizer. Every count here is the ~4 characters per token
// heuristic, applied to the JSON that actually goes over the wire so that
// role names, function names and schemas are paid for too.

use super::functions::FunctionSchema;
use super::models::ChatMessage;

/// Context windows for the models we know about. Anything else gets `DEFAULT_CONTEXT_WINDOW`.
const MODEL_CONTEXT_WINDOWS: &[(&str, usize)] = &[
    ("gpt-3.5-turbo", 16_385),
    ("gpt-4", 8_192),
    ("gpt-4-32k", 32_768),
    ("gpt-4-turbo", 128_000),
    ("gpt-4o", 128_000),
    ("gpt-4o-mini", 128_000),
    ("gpt-4.1", 1_047_576),
    ("gpt-4.1-mini", 1_047_576),
    ("gpt-4.1-nano", 1_047_576),
];

pub const DEFAULT_CONTEXT_WINDOW: usize = 4_096;

/// Headroom kept free under the model's context window.
pub const CONTEXT_HEADROOM: usize = 96;

/// Estimates the number of tokens in a text string (rounded up).
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() + 3) / 4
}

pub fn message_tokens(message: &ChatMessage) -> usize {
    match serde_json::to_string(message) {
        Ok(json) => estimate_tokens(&json),
        Err(_) => estimate_tokens(&message.content),
    }
}

pub fn payload_tokens(messages: &[ChatMessage]) -> usize {
    messages.iter().map(message_tokens).sum()
}

pub fn function_tokens(functions: &[FunctionSchema]) -> usize {
    functions
        .iter()
        .map(|f| match serde_json::to_string(f) {
            Ok(json) => estimate_tokens(&json),
            Err(_) => estimate_tokens(&f.description),
        })
        .sum()
}

/// Looks up the model's context window. Dated snapshots ("gpt-4o-2024-08-06")
/// resolve to the longest matching prefix.
pub fn context_window(model: &str) -> usize {
    MODEL_CONTEXT_WINDOWS
        .iter()
        .filter(|(name, _)| model.starts_with(name))
        .max_by_key(|(name, _)| name.len())
        .map(|(_, window)| *window)
        .unwrap_or(DEFAULT_CONTEXT_WINDOW)
}

/// Cuts text down to roughly `max_tokens`, on a char boundary.
pub fn cut_text_by_tokens(text: &str, max_tokens: usize) -> String {
    let max_bytes = max_tokens.saturating_mul(4);
    if text.len() <= max_bytes {
        return text.to_string();
    }

    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
