// Passive assistant behaviour: the assistant channel, 🧠 reactions from
// tutors, and forgetting guilds the bot leaves.

use super::intake::{build_question, ChatSource};
use super::reply::{plan_for_flags, send_to_channel};
use super::{answer, react_brain, report_error, BRAIN};
use crate::core::assistant::intake::{channel_action, parse_flags, ChannelAction};
use crate::core::assistant::Requester;
use crate::discord::{Data, Error};
use poise::serenity_prelude as serenity;

/// Answers messages in the guild's assistant channel.
pub async fn handle_message(
    ctx: &serenity::Context,
    framework: poise::FrameworkContext<'_, Data, Error>,
    data: &Data,
    message: &serenity::Message,
) -> Result<(), Error> {
    if message.author.bot || message.webhook_id.is_some() {
        return Ok(());
    }
    let Some(guild_id) = message.guild_id else {
        return Ok(());
    };

    let settings = data.assistant.settings(guild_id.get()).await?;
    if !settings.enabled || settings.channel_id != Some(message.channel_id.get()) {
        return Ok(());
    }
    // Commands in the assistant channel are handled by the framework
    if let Some(prefix) = framework.options.prefix_options.prefix.as_deref() {
        if message.content.starts_with(prefix) {
            return Ok(());
        }
    }

    let parsed = parse_flags(&message.content);
    match channel_action(&parsed, settings.min_length, settings.endswith_questionmark) {
        ChannelAction::Ignore => return Ok(()),
        ChannelAction::ResendLast => {
            let last = data
                .assistant
                .last_message(guild_id.get(), message.channel_id.get(), message.author.id.get())
                .await;
            match last {
                Ok(Some(content)) => {
                    let outgoing = plan_for_flags(&content, &parsed);
                    send_to_channel(&ctx.http, message, outgoing, settings.mention).await?;
                }
                Ok(None) => {
                    message
                        .reply(&ctx.http, "You have no conversation in this channel yet!")
                        .await?;
                }
                Err(e) => {
                    let is_owner = framework.options.owners.contains(&message.author.id);
                    message.reply(&ctx.http, report_error(data, &e, is_owner).await).await?;
                }
            }
            return Ok(());
        }
        ChannelAction::Answer => {}
    }

    let source = ChatSource::from_message(message, guild_id);
    let question = build_question(ctx, message, &parsed.question).await;
    let is_owner = framework.options.owners.contains(&message.author.id);

    let _typing = message.channel_id.start_typing(&ctx.http);
    match answer(data, &ctx.cache, &source, question, is_owner).await {
        Ok(outcome) => {
            if outcome.memory_touched {
                react_brain(&ctx.http, message).await;
            }
            let outgoing = plan_for_flags(&outcome.reply, &parsed);
            send_to_channel(&ctx.http, message, outgoing, settings.mention).await?;
        }
        Err(text) => {
            message.reply(&ctx.http, text).await?;
        }
    }
    Ok(())
}

/// A tutor reacting with 🧠 turns the message into a memory.
pub async fn handle_reaction(
    ctx: &serenity::Context,
    data: &Data,
    reaction: &serenity::Reaction,
) -> Result<(), Error> {
    if !matches!(&reaction.emoji, serenity::ReactionType::Unicode(e) if e == BRAIN) {
        return Ok(());
    }
    let (Some(guild_id), Some(user_id)) = (reaction.guild_id, reaction.user_id) else {
        return Ok(());
    };
    if user_id == ctx.cache.current_user().id {
        return Ok(());
    }

    let settings = data.assistant.settings(guild_id.get()).await?;
    let requester = Requester {
        user_id: user_id.get(),
        role_ids: reaction
            .member
            .as_ref()
            .map(|m| m.roles.iter().map(|r| r.get()).collect())
            .unwrap_or_default(),
        is_guild_owner: false,
    };
    if !settings.is_tutor(&requester) {
        return Ok(());
    }

    let message = reaction.message(&ctx.http).await?;
    if message.content.trim().is_empty() {
        return Ok(());
    }

    match data.assistant.remember(guild_id.get(), &message.content).await {
        Ok(name) => {
            tracing::info!(guild_id = guild_id.get(), user_id = user_id.get(), name = %name, "Tutor saved a memory");
            let done = serenity::ReactionType::Unicode("✅".to_string());
            if let Err(e) = message.react(&ctx.http, done).await {
                tracing::debug!("Couldn't confirm memory: {}", e);
            }
        }
        Err(e) => {
            let text = report_error(data, &e, false).await;
            tracing::debug!(reply = %text, "Memory from reaction failed");
        }
    }
    Ok(())
}

/// Drops cached conversations for a guild the bot was removed from.
pub fn handle_guild_delete(data: &Data, guild: &serenity::UnavailableGuild) {
    // Outages also send GuildDelete, with `unavailable` set
    if guild.unavailable {
        return;
    }
    let removed = data.assistant.clear_guild(guild.id.get());
    tracing::info!(guild_id = guild.id.get(), removed, "Left guild, cleared conversations");
}
