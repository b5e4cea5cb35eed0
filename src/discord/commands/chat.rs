// Member-facing assistant commands.
//
// The command extracts the question and who is asking, hands it to the
// shared `answer` flow and sends whatever comes back.

use crate::core::assistant::intake::{parse_flags, MAX_ATTACHMENT_BYTES};
use crate::core::assistant::tokens::estimate_tokens;
use crate::discord::assistant::intake::{build_question, snapshot, ChatSource};
use crate::discord::assistant::reply::{plan_for_flags, send_to_context};
use crate::discord::assistant::{answer, react_brain, report_error};
use crate::discord::{Context, Error};
use poise::serenity_prelude as serenity;

fn is_owner(ctx: Context<'_>) -> bool {
    ctx.framework().options().owners.contains(&ctx.author().id)
}

async fn source_for(
    ctx: Context<'_>,
    guild_id: serenity::GuildId,
    user: &serenity::User,
) -> Result<ChatSource, Error> {
    let member = guild_id.member(ctx, user.id).await?;
    Ok(ChatSource::from_member(&member, ctx.channel_id()))
}

/// Chat with the assistant.
///
/// Conversations are per member per channel. Optional flags:
/// `--outputfile <name>` sends the reply as a file, `--extract` splits code
/// blocks out of the reply, `--last` re-sends your last reply.
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    aliases("ask"),
    user_cooldown = 6
)]
pub async fn chat(
    ctx: Context<'_>,
    #[description = "What you want to ask"]
    #[rest]
    question: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be in a guild")?;
    let parsed = parse_flags(&question);

    if parsed.last {
        let last = ctx
            .data()
            .assistant
            .last_message(guild_id.get(), ctx.channel_id().get(), ctx.author().id.get())
            .await;
        match last {
            Ok(Some(content)) => send_to_context(ctx, plan_for_flags(&content, &parsed)).await?,
            Ok(None) => {
                ctx.say("You have no conversation in this channel yet!").await?;
            }
            Err(e) => {
                ctx.say(report_error(ctx.data(), &e, is_owner(ctx)).await).await?;
            }
        }
        return Ok(());
    }

    let source = source_for(ctx, guild_id, ctx.author()).await?;
    let question = match ctx {
        poise::Context::Prefix(prefix) => {
            build_question(ctx.serenity_context(), prefix.msg, &parsed.question).await
        }
        poise::Context::Application(_) => parsed.question.clone(),
    };
    if question.trim().is_empty() {
        ctx.say("Please include a question!").await?;
        return Ok(());
    }

    ctx.defer_or_broadcast().await?;
    let cache = &ctx.serenity_context().cache;
    match answer(ctx.data(), cache, &source, question, is_owner(ctx)).await {
        Ok(outcome) => {
            if outcome.memory_touched {
                if let poise::Context::Prefix(prefix) = ctx {
                    react_brain(&ctx.serenity_context().http, prefix.msg).await;
                }
            }
            send_to_context(ctx, plan_for_flags(&outcome.reply, &parsed)).await?;
        }
        Err(text) => {
            ctx.say(text).await?;
        }
    }
    Ok(())
}

/// Token and message counts for a conversation in this channel.
#[poise::command(prefix_command, slash_command, guild_only)]
pub async fn convostats(
    ctx: Context<'_>,
    #[description = "Member to check (defaults to you)"] user: Option<serenity::User>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be in a guild")?;
    let target = user.as_ref().unwrap_or_else(|| ctx.author());
    let source = source_for(ctx, guild_id, target).await?;
    let requester = snapshot(&ctx.serenity_context().cache, &source).requester;

    let stats = match ctx
        .data()
        .assistant
        .conversation_stats(guild_id.get(), ctx.channel_id().get(), &requester)
        .await
    {
        Ok(stats) => stats,
        Err(e) => {
            ctx.say(report_error(ctx.data(), &e, is_owner(ctx)).await).await?;
            return Ok(());
        }
    };

    let max_time = if stats.max_time == 0 {
        "never".to_string()
    } else {
        format!("{}s", stats.max_time)
    };
    let description = format!(
        "**Conversation stats for <@{}> in <#{}>**\n\
         `Messages:   `{}/{}\n\
         `Functions:  `{}\n\
         `Tokens:     `{}/{}\n\
         `Expires:    `{}\n\
         `Model:      `{}",
        target.id,
        ctx.channel_id(),
        stats.messages,
        stats.max_retention,
        stats.function_results,
        stats.tokens,
        stats.max_tokens,
        max_time,
        stats.model,
    );
    let embed = serenity::CreateEmbed::new()
        .description(description)
        .color(0x5865F2);
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Reset your conversation in this channel.
#[poise::command(prefix_command, slash_command, guild_only)]
pub async fn clearconvo(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be in a guild")?;
    ctx.data()
        .assistant
        .reset_conversation(guild_id.get(), ctx.channel_id().get(), ctx.author().id.get())
        .await?;
    ctx.say("Your conversation in this channel has been reset!")
        .await?;
    Ok(())
}

fn token_report(label: &str, text: &str) -> String {
    format!(
        "**{}**\n`Tokens:     `{}\n`Characters: `{}\n`Words:      `{}",
        label,
        estimate_tokens(text),
        text.chars().count(),
        text.split_whitespace().count()
    )
}

/// Estimate how many tokens some text or a text file would cost.
#[poise::command(prefix_command, slash_command)]
pub async fn tokens(
    ctx: Context<'_>,
    #[description = "A text file to count"] file: Option<serenity::Attachment>,
    #[description = "Text to count"]
    #[rest]
    text: Option<String>,
) -> Result<(), Error> {
    let report = match (file, text) {
        (Some(file), _) => {
            if file.size > MAX_ATTACHMENT_BYTES {
                ctx.say("That file is too large to count!").await?;
                return Ok(());
            }
            let bytes = file.download().await?;
            token_report(&file.filename, &String::from_utf8_lossy(&bytes))
        }
        (None, Some(text)) if !text.trim().is_empty() => token_report("Text", &text),
        _ => {
            ctx.say("Give me some text or attach a file to count!").await?;
            return Ok(());
        }
    };
    ctx.say(report).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_report_counts_text() {
        let report = token_report("notes.txt", "one two three four");
        assert!(report.starts_with("**notes.txt**"));
        assert!(report.contains("`Tokens:     `5"));
        assert!(report.contains("`Characters: `18"));
        assert!(report.contains("`Words:      `4"));
    }
}
