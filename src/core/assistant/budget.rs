// =============================================================================
// TOKEN BUDGET
// =============================================================================
//
// Before every vendor call the payload is trimmed until it fits:
// 1. Evict the oldest non-system history message (never the newest user message).
//    Function results left without their call are evicted with it.
// 2. With no history left, drop function schemas, oldest first.
// 3. Still too big: give up with `TokenBudgetExceeded` rather than send it.

use super::errors::AssistantError;
use super::functions::FunctionSchema;
use super::models::{GuildSettings, Requester, Role};
use super::tokens::{context_window, function_tokens, payload_tokens, CONTEXT_HEADROOM};
use super::conversation::PreparedChat;

/// Max tokens a member's conversation may use, before the response reserve.
pub fn max_conversation_tokens(settings: &GuildSettings, requester: &Requester) -> usize {
    let model = settings.get_user_model(requester);
    let window = context_window(&model).saturating_sub(CONTEXT_HEADROOM);
    settings.get_user_max_tokens(requester).min(window)
}

/// The limit the payload must fit in: conversation max minus the response reserve.
pub fn payload_limit(settings: &GuildSettings, requester: &Requester) -> usize {
    let max_tokens = max_conversation_tokens(settings, requester);
    if settings.max_response_tokens > 0 && max_tokens > settings.max_response_tokens {
        max_tokens - settings.max_response_tokens
    } else {
        max_tokens
    }
}

/// What had to go to make the payload fit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Degradation {
    pub evicted_messages: usize,
    pub dropped_functions: usize,
}

impl Degradation {
    pub fn degraded(&self) -> bool {
        self.evicted_messages > 0 || self.dropped_functions > 0
    }
}

pub fn degrade_conversation(
    chat: &mut PreparedChat,
    functions: &mut Vec<FunctionSchema>,
    limit: usize,
) -> Result<Degradation, AssistantError> {
    let mut report = Degradation::default();

    loop {
        let total = payload_tokens(&chat.messages) + function_tokens(functions);
        if total <= limit {
            if report.degraded() {
                tracing::debug!(
                    evicted = report.evicted_messages,
                    dropped_functions = report.dropped_functions,
                    total,
                    limit,
                    "Degraded conversation to fit token budget"
                );
            }
            return Ok(report);
        }

        let pinned = chat.pinned.min(chat.messages.len());
        let newest_user = chat
            .messages
            .iter()
            .enumerate()
            .skip(pinned)
            .rev()
            .find(|(_, m)| m.role == Role::User)
            .map(|(i, _)| i);

        let victim = (pinned..chat.messages.len())
            .find(|&i| chat.messages[i].role != Role::System && Some(i) != newest_user);

        if let Some(i) = victim {
            chat.messages.remove(i);
            report.evicted_messages += 1;
            while i < chat.messages.len() && chat.messages[i].is_function_result() {
                chat.messages.remove(i);
                report.evicted_messages += 1;
            }
            continue;
        }

        if !functions.is_empty() {
            functions.remove(0);
            report.dropped_functions += 1;
            continue;
        }

        tracing::warn!(total, limit, "Conversation cannot fit the token budget");
        return Err(AssistantError::TokenBudgetExceeded {
            tokens: total,
            limit,
        });
    }
}
