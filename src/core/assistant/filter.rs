// Regex blacklist applied to model replies before they're sent.
//
// Patterns are admin supplied, so each one runs on the blocking pool under a
// timeout instead of on the async worker.

use regex::{Regex, RegexBuilder};
use std::time::Duration;
use tokio::time::timeout;

pub const REGEX_TIMEOUT: Duration = Duration::from_secs(2);

/// Shown instead of the reply when a pattern failed and the guild blocks on failure.
pub const BLOCKED_REPLY: &str = "Response failed due to invalid regex, check logs for more info.";

/// Compiled programs bigger than this are rejected.
pub const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Compiles a blacklist pattern with the same limits replies are filtered with.
pub fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).size_limit(REGEX_SIZE_LIMIT).build()
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterOutcome {
    pub text: String,
    /// At least one pattern failed (invalid or timed out).
    pub failed: bool,
}

/// Removes every match of every pattern from `text`.
///
/// Failed patterns are skipped and logged. Callers decide what a failure
/// means through `block_failed_regex`.
pub async fn apply_blacklist(text: String, patterns: &[String]) -> FilterOutcome {
    let mut text = text;
    let mut failed = false;

    for pattern in patterns {
        let owned_pattern = pattern.clone();
        let input = text.clone();
        let task = tokio::task::spawn_blocking(move || {
            compile_pattern(&owned_pattern).map(|re| re.replace_all(&input, "").into_owned())
        });

        match timeout(REGEX_TIMEOUT, task).await {
            Ok(Ok(Ok(filtered))) => text = filtered,
            Ok(Ok(Err(e))) => {
                tracing::error!(pattern = %pattern, "Invalid blacklist regex: {}", e);
                failed = true;
            }
            Ok(Err(e)) => {
                tracing::error!(pattern = %pattern, "Regex worker panicked: {}", e);
                failed = true;
            }
            Err(_) => {
                tracing::error!(pattern = %pattern, "Regex took too long to process, skipping");
                failed = true;
            }
        }
    }

    FilterOutcome { text, failed }
}
