// Errors for the assistant pipeline.
//
// Vendor failures are mapped to a handful of variants so the Discord layer
// can turn each one into a short user-facing message.

use super::settings_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssistantError {
    #[error("No API key or endpoint is configured for this server")]
    NoApiKey,

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Invalid request ({status}): {message}")]
    InvalidRequest { status: u16, message: String },

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Failed to communicate with the API: {0}")]
    Connection(String),

    #[error("Malformed API response: {0}")]
    MalformedResponse(String),

    #[error("Conversation needs {tokens} tokens but the limit is {limit}")]
    TokenBudgetExceeded { tokens: usize, limit: usize },

    #[error("Model kept calling functions without answering after {0} calls")]
    FunctionLoopExhausted(usize),

    #[error("An embedding named '{0}' already exists")]
    EmbeddingExists(String),

    #[error("No embedding named '{0}'")]
    EmbeddingNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for AssistantError {
    fn from(err: StoreError) -> Self {
        AssistantError::Storage(err.to_string())
    }
}

impl AssistantError {
    /// True for failures that say nothing useful to the user and should be
    /// logged and reported through the owner's last-error command instead.
    pub fn is_unexpected(&self) -> bool {
        matches!(
            self,
            AssistantError::MalformedResponse(_) | AssistantError::Storage(_)
        )
    }

    /// Short message shown in Discord.
    ///
    /// `is_owner` switches the auth message between "fix your key" and
    /// "the bot's key is broken".
    pub fn user_message(&self, is_owner: bool) -> String {
        match self {
            AssistantError::NoApiKey => {
                "This command requires an API key or endpoint to be configured!".to_string()
            }
            AssistantError::Authentication(_) if is_owner => {
                "Invalid API key, please set a new valid key!".to_string()
            }
            AssistantError::Authentication(_) => {
                "Uh oh, looks like my API key is invalid!".to_string()
            }
            AssistantError::RateLimited(msg) => format!("Rate limit error: {}", msg),
            AssistantError::InvalidRequest { status, message } => {
                format!("Bad Request Error({}): {}", status, message)
            }
            AssistantError::ServerError { status, message } => {
                format!("Internal Server Error({}): {}", status, message)
            }
            AssistantError::Timeout(_) => "Request timed out, please try again.".to_string(),
            AssistantError::Connection(_) => "Failed to communicate with API!".to_string(),
            AssistantError::TokenBudgetExceeded { tokens, limit } => format!(
                "Your message is too long for the current token limit ({} > {}). \
                 An admin should raise `maxtokens` or shorten the prompts.",
                tokens, limit
            ),
            AssistantError::FunctionLoopExhausted(_) => {
                "I got stuck calling functions and never came up with an answer, please try again."
                    .to_string()
            }
            AssistantError::EmbeddingExists(name) => {
                format!("An embedding named `{}` already exists!", name)
            }
            AssistantError::EmbeddingNotFound(name) => {
                format!("No embedding named `{}` exists!", name)
            }
            AssistantError::MalformedResponse(_) | AssistantError::Storage(_) => {
                "Uh oh, something went wrong! Bot owner can use `/lasterror` to view the error."
                    .to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_message_depends_on_owner() {
        let err = AssistantError::Authentication("bad key".into());
        assert!(err.user_message(true).contains("set a new valid key"));
        assert!(err.user_message(false).contains("my API key is invalid"));
    }

    #[test]
    fn unexpected_errors_point_at_lasterror() {
        let err = AssistantError::MalformedResponse("no choices".into());
        assert!(err.is_unexpected());
        assert!(err.user_message(false).contains("/lasterror"));

        let rate = AssistantError::RateLimited("slow down".into());
        assert!(!rate.is_unexpected());
        assert_eq!(rate.user_message(false), "Rate limit error: slow down");
    }

    #[test]
    fn store_errors_convert() {
        let err: AssistantError = StoreError::Database("locked".into()).into();
        assert!(matches!(err, AssistantError::Storage(_)));
    }
}
