// Discord side of the assistant: turning serenity messages into chat input,
// sending replies back, and the passive listeners.

pub mod intake;
pub mod listener;
pub mod reply;

use crate::core::assistant::{AssistantError, ChatInput, ChatOutcome};
use crate::discord::Data;
use intake::{snapshot, ChatSource};
use poise::serenity_prelude as serenity;

/// Logs an assistant error and returns what the user should see. Unexpected
/// errors are kept for `lasterror`.
pub async fn report_error(data: &Data, err: &AssistantError, is_owner: bool) -> String {
    if err.is_unexpected() {
        tracing::error!("Assistant failed: {}", err);
        *data.last_error.lock().await = Some(err.to_string());
    } else {
        tracing::warn!("Assistant request failed: {}", err);
    }
    err.user_message(is_owner)
}

/// Runs one chat turn for `source`. The error side is the text to send back.
pub async fn answer(
    data: &Data,
    cache: &serenity::Cache,
    source: &ChatSource,
    question: String,
    is_owner: bool,
) -> Result<ChatOutcome, String> {
    let guild_id = source.guild_id.get();
    let settings = match data.assistant.settings(guild_id).await {
        Ok(settings) => settings,
        Err(e) => return Err(report_error(data, &e, is_owner).await),
    };

    let snap = snapshot(cache, source);
    if let Some(reason) =
        settings.denial_reason(&snap.requester, source.channel_id.get(), snap.category_id)
    {
        return Err(reason.to_string());
    }

    let input = ChatInput {
        guild_id,
        channel_id: source.channel_id.get(),
        requester: snap.requester,
        message: question,
        context: snap.context,
    };

    match data.assistant.chat(input).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => Err(report_error(data, &e, is_owner).await),
    }
}

pub const BRAIN: &str = "🧠";

/// Marks a message whose turn created or edited a memory.
pub async fn react_brain(http: &serenity::Http, message: &serenity::Message) {
    let reaction = serenity::ReactionType::Unicode(BRAIN.to_string());
    if let Err(e) = message.react(http, reaction).await {
        tracing::debug!("Couldn't add memory reaction: {}", e);
    }
}
