// Guild admin configuration for the assistant.
//
// Discord allows 25 options per command, so related settings live in
// subcommand groups: `/assistant prompt system`, `/assistant limits tokens`...

use crate::core::assistant::filter::compile_pattern;
use crate::core::assistant::{EmbedMethod, GuildSettings};
use crate::discord::{Context, Error};
use poise::serenity_prelude as serenity;
use poise::ChoiceParameter;

/// Loads, changes and saves the guild's settings, then replies with the text
/// the change produced.
async fn apply<F>(ctx: Context<'_>, f: F) -> Result<(), Error>
where
    F: FnOnce(&mut GuildSettings) -> String + Send,
{
    let guild_id = ctx.guild_id().ok_or("Must be in a guild")?.get();
    let text = ctx.data().assistant.update_settings(guild_id, f).await?;
    ctx.say(text).await?;
    Ok(())
}

fn on_off(value: bool) -> &'static str {
    if value {
        "enabled"
    } else {
        "disabled"
    }
}

/// Accepts a raw id or a user, role or channel mention.
fn parse_id(raw: &str) -> Option<u64> {
    raw.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim_start_matches(['@', '#', '&', '!'])
        .parse()
        .ok()
}

/// Configure the assistant for this server
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    subcommands(
        "view",
        "usage",
        "toggle",
        "channel",
        "apikey",
        "endpoint",
        "model",
        "temperature",
        "timezone",
        "tutor",
        "resetconvos",
        "prompt",
        "behavior",
        "limits",
        "embedding",
        "filter",
        "functions"
    )
)]
pub async fn assistant(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

// ============================================================================
// OVERVIEW
// ============================================================================

fn overview(settings: &GuildSettings) -> String {
    let channel = settings
        .channel_id
        .map(|id| format!("<#{}>", id))
        .unwrap_or_else(|| "Not set".to_string());
    let max_response = if settings.max_response_tokens == 0 {
        "Auto".to_string()
    } else {
        settings.max_response_tokens.to_string()
    };
    format!(
        "`Enabled:        `{}\n\
         `Channel:        `{}\n\
         `Model:          `{}\n\
         `Endpoint:       `{}\n\
         `API key:        `{}\n\
         `Temperature:    `{}\n\
         `Timezone:       `{}\n\
         `Max tokens:     `{}\n\
         `Max response:   `{}\n\
         `Max retention:  `{}\n\
         `Retention time: `{}s\n\
         `Mention:        `{}\n\
         `Collab convos:  `{}\n\
         `Persistent:     `{}\n\
         `Question mode:  `{}\n\
         `Needs '?':      `{}\n\
         `Min length:     `{}\n\
         `Top N:          `{}\n\
         `Relatedness:    `{}\n\
         `Embed method:   `{:?}\n\
         `Function calls: `{} (max {})\n\
         `Regex filters:  `{} (block on failure: {})\n\
         `Blacklisted:    `{}\n\
         `Tutors:         `{}",
        on_off(settings.enabled),
        channel,
        settings.model,
        settings.endpoint_override.as_deref().unwrap_or("Default"),
        if settings.api_key.is_some() { "Set" } else { "Not set" },
        settings.temperature,
        settings.timezone,
        settings.max_tokens,
        max_response,
        settings.max_retention,
        settings.max_retention_time,
        on_off(settings.mention),
        on_off(settings.collab_convos),
        on_off(settings.persistent_conversations),
        on_off(settings.question_mode),
        on_off(settings.endswith_questionmark),
        settings.min_length,
        settings.top_n,
        settings.min_relatedness,
        settings.embed_method,
        on_off(settings.use_function_calls),
        settings.max_function_calls,
        settings.regex_blacklist.len(),
        settings.block_failed_regex,
        settings.blacklist.len(),
        settings.tutors.len(),
    )
}

/// Show the current settings
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn view(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be in a guild")?.get();
    let settings = ctx.data().assistant.settings(guild_id).await?;

    let mut embed = serenity::CreateEmbed::new()
        .title("Assistant settings")
        .description(overview(&settings))
        .color(0x5865F2);
    let embeddings = ctx.data().assistant.list_embeddings(guild_id).await?.len();
    embed = embed.field("Embeddings", embeddings.to_string(), true);
    embed = embed.field(
        "Conversations",
        ctx.data().assistant.conversation_count().to_string(),
        true,
    );
    ctx.send(poise::CreateReply::default().embed(embed).ephemeral(true))
        .await?;
    Ok(())
}

fn usage_lines(settings: &GuildSettings) -> String {
    let mut models: Vec<_> = settings.usage.iter().collect();
    models.sort_by(|a, b| b.1.total.cmp(&a.1.total));
    let mut text: String = models
        .iter()
        .map(|(model, usage)| {
            format!(
                "**{}**: {} tokens ({} prompt, {} completion)\n",
                model, usage.total, usage.prompt, usage.completion
            )
        })
        .collect();
    if text.is_empty() {
        text.push_str("No usage recorded yet.\n");
    }
    text.push_str(&format!("Functions called: {}", settings.functions_called));
    text
}

/// Token usage per model
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn usage(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be in a guild")?.get();
    let settings = ctx.data().assistant.settings(guild_id).await?;
    let embed = serenity::CreateEmbed::new()
        .title("Assistant usage")
        .description(usage_lines(&settings))
        .color(0x5865F2);
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

// ============================================================================
// GENERAL
// ============================================================================

/// Turn the assistant on or off
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn toggle(ctx: Context<'_>) -> Result<(), Error> {
    apply(ctx, |s| {
        s.enabled = !s.enabled;
        format!("The assistant is now {}", on_off(s.enabled))
    })
    .await
}

/// Set the channel the assistant answers in, or clear it
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn channel(
    ctx: Context<'_>,
    #[description = "Assistant channel (leave empty to clear)"] channel: Option<
        serenity::GuildChannel,
    >,
) -> Result<(), Error> {
    let channel_id = channel.map(|c| c.id.get());
    apply(ctx, move |s| {
        s.channel_id = channel_id;
        match channel_id {
            Some(id) => format!("Assistant channel set to <#{}>", id),
            None => "Assistant channel cleared".to_string(),
        }
    })
    .await
}

/// Set this server's API key, or clear it to use the bot's
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn apikey(
    ctx: Context<'_>,
    #[description = "API key (leave empty to clear)"] key: Option<String>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be in a guild")?.get();
    let key = key.map(|k| k.trim().to_string()).filter(|k| !k.is_empty());
    let text = if key.is_some() {
        "API key set"
    } else {
        "API key cleared"
    };
    ctx.data()
        .assistant
        .update_settings(guild_id, move |s| s.api_key = key)
        .await?;
    ctx.send(poise::CreateReply::default().content(text).ephemeral(true))
        .await?;
    Ok(())
}

/// Point this server at a different OpenAI-compatible endpoint
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn endpoint(
    ctx: Context<'_>,
    #[description = "Base URL, e.g. http://localhost:11434/v1 (leave empty to clear)"]
    url: Option<String>,
) -> Result<(), Error> {
    let url = url
        .map(|u| u.trim().trim_end_matches('/').to_string())
        .filter(|u| !u.is_empty());
    if let Some(url) = &url {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            ctx.say("❌ The endpoint must be an http(s) URL").await?;
            return Ok(());
        }
    }
    apply(ctx, move |s| {
        let text = match &url {
            Some(url) => format!("Endpoint set to `{}`", url),
            None => "Endpoint cleared, using the default".to_string(),
        };
        s.endpoint_override = url;
        text
    })
    .await
}

/// Set the default chat model
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn model(
    ctx: Context<'_>,
    #[description = "Model name"] model: String,
) -> Result<(), Error> {
    let model = model.trim().to_string();
    if model.is_empty() {
        ctx.say("❌ The model name can't be empty").await?;
        return Ok(());
    }
    apply(ctx, move |s| {
        let text = format!("Model set to `{}`", model);
        s.model = model;
        text
    })
    .await
}

/// Set the sampling temperature (0 to 2)
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn temperature(
    ctx: Context<'_>,
    #[description = "Temperature"]
    #[min = 0]
    #[max = 2]
    temperature: f32,
) -> Result<(), Error> {
    if !(0.0..=2.0).contains(&temperature) {
        ctx.say("❌ Temperature must be between 0 and 2").await?;
        return Ok(());
    }
    apply(ctx, move |s| {
        s.temperature = temperature;
        format!("Temperature set to {}", temperature)
    })
    .await
}

/// Set the timezone used for {date} and {time} placeholders
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn timezone(
    ctx: Context<'_>,
    #[description = "IANA timezone, e.g. Europe/Stockholm"] timezone: String,
) -> Result<(), Error> {
    let Ok(tz) = timezone.trim().parse::<chrono_tz::Tz>() else {
        ctx.say("❌ Unknown timezone, use a name like `America/New_York`")
            .await?;
        return Ok(());
    };
    apply(ctx, move |s| {
        s.timezone = tz.name().to_string();
        format!("Timezone set to `{}`", s.timezone)
    })
    .await
}

/// Add or remove a tutor (user or role that can teach the assistant)
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn tutor(
    ctx: Context<'_>,
    #[description = "User or role mention, or an id"] target: String,
) -> Result<(), Error> {
    let Some(id) = parse_id(&target) else {
        ctx.say("❌ Mention a user or role, or give its id").await?;
        return Ok(());
    };
    apply(ctx, move |s| {
        if GuildSettings::toggle_id(&mut s.tutors, id) {
            format!("`{}` is now a tutor", id)
        } else {
            format!("`{}` is no longer a tutor", id)
        }
    })
    .await
}

/// Reset every conversation in this server
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn resetconvos(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be in a guild")?.get();
    let removed = ctx.data().assistant.clear_guild(guild_id);
    ctx.say(format!("Reset {} conversations", removed)).await?;
    Ok(())
}

// ============================================================================
// PROMPTS
// ============================================================================

/// Prompts sent ahead of every conversation
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    subcommands("prompt_system", "prompt_initial", "prompt_channel")
)]
pub async fn prompt(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Set the system prompt (leave empty to restore the default)
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    rename = "system"
)]
pub async fn prompt_system(
    ctx: Context<'_>,
    #[description = "System prompt, placeholders like {botname} allowed"] text: Option<String>,
) -> Result<(), Error> {
    apply(ctx, move |s| match text {
        Some(text) => {
            s.system_prompt = text;
            "System prompt updated".to_string()
        }
        None => {
            s.system_prompt = GuildSettings::default().system_prompt;
            "System prompt restored to the default".to_string()
        }
    })
    .await
}

/// Set the initial prompt (leave empty to clear)
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    rename = "initial"
)]
pub async fn prompt_initial(
    ctx: Context<'_>,
    #[description = "Initial prompt, placeholders like {server} allowed"] text: Option<String>,
) -> Result<(), Error> {
    apply(ctx, move |s| {
        s.prompt = text.unwrap_or_default();
        if s.prompt.is_empty() {
            "Initial prompt cleared".to_string()
        } else {
            "Initial prompt updated".to_string()
        }
    })
    .await
}

/// Set an extra prompt for one channel (leave text empty to remove it)
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    rename = "channel"
)]
pub async fn prompt_channel(
    ctx: Context<'_>,
    #[description = "Channel (defaults to this one)"] channel: Option<serenity::GuildChannel>,
    #[description = "Prompt for this channel"] text: Option<String>,
) -> Result<(), Error> {
    let channel_id = channel
        .map(|c| c.id)
        .unwrap_or_else(|| ctx.channel_id())
        .get();
    apply(ctx, move |s| match text.filter(|t| !t.trim().is_empty()) {
        Some(text) => {
            s.channel_prompts.insert(channel_id, text);
            format!("Prompt for <#{}> updated", channel_id)
        }
        None => {
            s.channel_prompts.remove(&channel_id);
            format!("Prompt for <#{}> removed", channel_id)
        }
    })
    .await
}

// ============================================================================
// BEHAVIOR
// ============================================================================

/// When and how the assistant replies in its channel
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    subcommands(
        "behavior_mention",
        "behavior_collab",
        "behavior_persist",
        "behavior_questionmode",
        "behavior_questionmark",
        "behavior_minlength"
    )
)]
pub async fn behavior(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Toggle pinging the author in replies
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    rename = "mention"
)]
pub async fn behavior_mention(ctx: Context<'_>) -> Result<(), Error> {
    apply(ctx, |s| {
        s.mention = !s.mention;
        format!("Mentions are now {}", on_off(s.mention))
    })
    .await
}

/// Toggle one shared conversation per channel
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    rename = "collab"
)]
pub async fn behavior_collab(ctx: Context<'_>) -> Result<(), Error> {
    apply(ctx, |s| {
        s.collab_convos = !s.collab_convos;
        format!("Collaborative conversations are now {}", on_off(s.collab_convos))
    })
    .await
}

/// Toggle keeping conversations across restarts
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    rename = "persist"
)]
pub async fn behavior_persist(ctx: Context<'_>) -> Result<(), Error> {
    apply(ctx, |s| {
        s.persistent_conversations = !s.persistent_conversations;
        format!(
            "Persistent conversations are now {}",
            on_off(s.persistent_conversations)
        )
    })
    .await
}

/// Toggle only pulling in embeddings for questions
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    rename = "questionmode"
)]
pub async fn behavior_questionmode(ctx: Context<'_>) -> Result<(), Error> {
    apply(ctx, |s| {
        s.question_mode = !s.question_mode;
        format!("Question mode is now {}", on_off(s.question_mode))
    })
    .await
}

/// Toggle only answering messages that end with a question mark
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    rename = "questionmark"
)]
pub async fn behavior_questionmark(ctx: Context<'_>) -> Result<(), Error> {
    apply(ctx, |s| {
        s.endswith_questionmark = !s.endswith_questionmark;
        format!(
            "Requiring a question mark is now {}",
            on_off(s.endswith_questionmark)
        )
    })
    .await
}

/// Minimum message length to answer in the assistant channel
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    rename = "minlength"
)]
pub async fn behavior_minlength(
    ctx: Context<'_>,
    #[description = "Characters"] length: usize,
) -> Result<(), Error> {
    apply(ctx, move |s| {
        s.min_length = length;
        format!("Minimum length set to {}", length)
    })
    .await
}

// ============================================================================
// LIMITS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, poise::ChoiceParameter)]
pub enum OverrideKind {
    #[name = "Max tokens"]
    Tokens,
    #[name = "Max retention"]
    Retention,
    #[name = "Retention time"]
    Time,
    #[name = "Model"]
    Model,
}

/// Sets or removes one role override. `Err` holds a message for bad values.
fn apply_override(
    settings: &mut GuildSettings,
    kind: OverrideKind,
    role_id: u64,
    value: Option<&str>,
) -> Result<String, String> {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        let removed = match kind {
            OverrideKind::Tokens => settings.max_token_role_override.remove(&role_id).is_some(),
            OverrideKind::Retention => settings
                .max_retention_role_override
                .remove(&role_id)
                .is_some(),
            OverrideKind::Time => settings.max_time_role_override.remove(&role_id).is_some(),
            OverrideKind::Model => settings.model_role_overrides.remove(&role_id).is_some(),
        };
        return Ok(if removed {
            format!("Removed the {} override for <@&{}>", kind.name(), role_id)
        } else {
            format!("<@&{}> has no {} override", role_id, kind.name())
        });
    };

    let number = || {
        value
            .parse::<u64>()
            .map_err(|_| format!("`{}` isn't a whole number", value))
    };
    match kind {
        OverrideKind::Tokens => {
            settings
                .max_token_role_override
                .insert(role_id, number()? as usize);
        }
        OverrideKind::Retention => {
            settings
                .max_retention_role_override
                .insert(role_id, number()? as usize);
        }
        OverrideKind::Time => {
            settings.max_time_role_override.insert(role_id, number()?);
        }
        OverrideKind::Model => {
            settings
                .model_role_overrides
                .insert(role_id, value.to_string());
        }
    }
    Ok(format!(
        "{} override for <@&{}> set to `{}`",
        kind.name(),
        role_id,
        value
    ))
}

/// Conversation size and lifetime limits
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    subcommands(
        "limits_tokens",
        "limits_response",
        "limits_retention",
        "limits_time",
        "limits_override"
    )
)]
pub async fn limits(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Max tokens a conversation may use
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    rename = "tokens"
)]
pub async fn limits_tokens(
    ctx: Context<'_>,
    #[description = "Tokens"]
    #[min = 1000]
    tokens: usize,
) -> Result<(), Error> {
    apply(ctx, move |s| {
        s.max_tokens = tokens;
        format!("Max tokens set to {}", tokens)
    })
    .await
}

/// Max tokens for a single reply (0 lets the endpoint decide)
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    rename = "response"
)]
pub async fn limits_response(
    ctx: Context<'_>,
    #[description = "Tokens"] tokens: usize,
) -> Result<(), Error> {
    apply(ctx, move |s| {
        s.max_response_tokens = tokens;
        if tokens == 0 {
            "Response length is now up to the endpoint".to_string()
        } else {
            format!("Max response tokens set to {}", tokens)
        }
    })
    .await
}

/// Messages kept per conversation (0 keeps none)
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    rename = "retention"
)]
pub async fn limits_retention(
    ctx: Context<'_>,
    #[description = "Messages"] messages: usize,
) -> Result<(), Error> {
    apply(ctx, move |s| {
        s.max_retention = messages;
        format!("Conversations now keep {} messages", messages)
    })
    .await
}

/// Seconds of inactivity before a conversation expires (0 never expires)
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    rename = "time"
)]
pub async fn limits_time(
    ctx: Context<'_>,
    #[description = "Seconds"] seconds: u64,
) -> Result<(), Error> {
    apply(ctx, move |s| {
        s.max_retention_time = seconds;
        if seconds == 0 {
            "Conversations no longer expire".to_string()
        } else {
            format!("Conversations expire after {}s", seconds)
        }
    })
    .await
}

/// Give a role its own limit or model (leave value empty to remove)
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    rename = "override"
)]
pub async fn limits_override(
    ctx: Context<'_>,
    #[description = "What to override"] kind: OverrideKind,
    #[description = "Role"] role: serenity::Role,
    #[description = "New value"] value: Option<String>,
) -> Result<(), Error> {
    let role_id = role.id.get();
    apply(ctx, move |s| {
        apply_override(s, kind, role_id, value.as_deref()).unwrap_or_else(|e| format!("❌ {}", e))
    })
    .await
}

// ============================================================================
// EMBEDDING RECALL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, poise::ChoiceParameter)]
pub enum EmbedMethodChoice {
    Dynamic,
    Static,
    User,
    Hybrid,
}

impl From<EmbedMethodChoice> for EmbedMethod {
    fn from(value: EmbedMethodChoice) -> Self {
        match value {
            EmbedMethodChoice::Dynamic => EmbedMethod::Dynamic,
            EmbedMethodChoice::Static => EmbedMethod::Static,
            EmbedMethodChoice::User => EmbedMethod::User,
            EmbedMethodChoice::Hybrid => EmbedMethod::Hybrid,
        }
    }
}

/// How stored embeddings are pulled into conversations
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    subcommands("embedding_topn", "embedding_relatedness", "embedding_method")
)]
pub async fn embedding(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// How many related embeddings to include (0 turns recall off)
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    rename = "topn"
)]
pub async fn embedding_topn(
    ctx: Context<'_>,
    #[description = "Entries"]
    #[max = 20]
    count: usize,
) -> Result<(), Error> {
    apply(ctx, move |s| {
        s.top_n = count;
        format!("Top N set to {}", count)
    })
    .await
}

/// Minimum similarity for an embedding to be included (0 to 1)
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    rename = "relatedness"
)]
pub async fn embedding_relatedness(
    ctx: Context<'_>,
    #[description = "Threshold"]
    #[min = 0]
    #[max = 1]
    threshold: f32,
) -> Result<(), Error> {
    if !(0.0..=1.0).contains(&threshold) {
        ctx.say("❌ Relatedness must be between 0 and 1").await?;
        return Ok(());
    }
    apply(ctx, move |s| {
        s.min_relatedness = threshold;
        format!("Minimum relatedness set to {}", threshold)
    })
    .await
}

/// Where related embeddings get injected
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    rename = "method"
)]
pub async fn embedding_method(
    ctx: Context<'_>,
    #[description = "Injection method"] method: EmbedMethodChoice,
) -> Result<(), Error> {
    apply(ctx, move |s| {
        s.embed_method = method.into();
        format!("Embed method set to {:?}", s.embed_method)
    })
    .await
}

// ============================================================================
// FILTERS
// ============================================================================

/// Who may use the assistant and what it may say
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    subcommands("filter_regex", "filter_failblock", "filter_blacklist")
)]
pub async fn filter(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Add or remove a pattern scrubbed from replies
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    rename = "regex"
)]
pub async fn filter_regex(
    ctx: Context<'_>,
    #[description = "Regular expression"] pattern: String,
) -> Result<(), Error> {
    if let Err(e) = compile_pattern(&pattern) {
        ctx.say(format!("❌ That pattern doesn't compile: {}", e))
            .await?;
        return Ok(());
    }
    apply(ctx, move |s| {
        if let Some(pos) = s.regex_blacklist.iter().position(|p| *p == pattern) {
            s.regex_blacklist.remove(pos);
            format!("Removed `{}` from the regex blacklist", pattern)
        } else {
            let text = format!("Added `{}` to the regex blacklist", pattern);
            s.regex_blacklist.push(pattern);
            text
        }
    })
    .await
}

/// Toggle blocking the reply when a pattern fails to run
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    rename = "failblock"
)]
pub async fn filter_failblock(ctx: Context<'_>) -> Result<(), Error> {
    apply(ctx, |s| {
        s.block_failed_regex = !s.block_failed_regex;
        format!(
            "Blocking replies on regex failure is now {}",
            on_off(s.block_failed_regex)
        )
    })
    .await
}

/// Blacklist or unblacklist a user, role, channel or category
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    rename = "blacklist"
)]
pub async fn filter_blacklist(
    ctx: Context<'_>,
    #[description = "Mention or id"] target: String,
) -> Result<(), Error> {
    let Some(id) = parse_id(&target) else {
        ctx.say("❌ Mention a user, role or channel, or give its id")
            .await?;
        return Ok(());
    };
    apply(ctx, move |s| {
        if GuildSettings::toggle_id(&mut s.blacklist, id) {
            format!("`{}` is now blacklisted", id)
        } else {
            format!("`{}` is no longer blacklisted", id)
        }
    })
    .await
}

// ============================================================================
// FUNCTION CALLING
// ============================================================================

/// Functions the model may call
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    subcommands(
        "functions_list",
        "functions_toggle",
        "functions_maxcalls",
        "functions_disable"
    )
)]
pub async fn functions(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// List registered functions and whether they're enabled here
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    rename = "list"
)]
pub async fn functions_list(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be in a guild")?.get();
    let settings = ctx.data().assistant.settings(guild_id).await?;
    let registered = ctx.data().assistant.functions().list();
    if registered.is_empty() {
        ctx.say("No functions are registered").await?;
        return Ok(());
    }

    let mut embed = serenity::CreateEmbed::new()
        .title(format!(
            "Functions (calling {})",
            on_off(settings.use_function_calls)
        ))
        .color(0x5865F2);
    for (owner, schema) in registered.into_iter().take(25) {
        let state = if settings.disabled_functions.contains(&schema.name) {
            "❌"
        } else {
            "✅"
        };
        embed = embed.field(
            format!("{} {}", state, schema.name),
            format!("{}\n*from {}*", schema.description, owner),
            false,
        );
    }
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Toggle function calling for this server
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    rename = "toggle"
)]
pub async fn functions_toggle(ctx: Context<'_>) -> Result<(), Error> {
    apply(ctx, |s| {
        s.use_function_calls = !s.use_function_calls;
        format!("Function calling is now {}", on_off(s.use_function_calls))
    })
    .await
}

/// Max function calls the model may make per message
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    rename = "maxcalls"
)]
pub async fn functions_maxcalls(
    ctx: Context<'_>,
    #[description = "Calls"]
    #[min = 1]
    #[max = 50]
    calls: usize,
) -> Result<(), Error> {
    apply(ctx, move |s| {
        s.max_function_calls = calls;
        format!("Max function calls set to {}", calls)
    })
    .await
}

/// Enable or disable a single function
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    rename = "disable"
)]
pub async fn functions_disable(
    ctx: Context<'_>,
    #[description = "Function name"] name: String,
) -> Result<(), Error> {
    let known = ctx
        .data()
        .assistant
        .functions()
        .list()
        .iter()
        .any(|(_, schema)| schema.name == name);
    if !known {
        ctx.say(format!("❌ No function named `{}` is registered", name))
            .await?;
        return Ok(());
    }
    apply(ctx, move |s| {
        if let Some(pos) = s.disabled_functions.iter().position(|f| *f == name) {
            s.disabled_functions.remove(pos);
            format!("`{}` is enabled", name)
        } else {
            let text = format!("`{}` is disabled", name);
            s.disabled_functions.push(name);
            text
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::assistant::Requester;

    #[test]
    fn ids_from_mentions_and_raw_text() {
        assert_eq!(parse_id("<@123>"), Some(123));
        assert_eq!(parse_id("<@!123>"), Some(123));
        assert_eq!(parse_id("<@&456>"), Some(456));
        assert_eq!(parse_id("<#789>"), Some(789));
        assert_eq!(parse_id(" 42 "), Some(42));
        assert_eq!(parse_id("general"), None);
    }

    #[test]
    fn overrides_set_and_remove() {
        let mut settings = GuildSettings::default();
        let requester = Requester {
            user_id: 1,
            role_ids: vec![7],
            is_guild_owner: false,
        };

        apply_override(&mut settings, OverrideKind::Tokens, 7, Some("16000")).unwrap();
        apply_override(&mut settings, OverrideKind::Model, 7, Some("gpt-4o")).unwrap();
        assert_eq!(settings.get_user_max_tokens(&requester), 16000);
        assert_eq!(settings.get_user_model(&requester), "gpt-4o");

        let text = apply_override(&mut settings, OverrideKind::Tokens, 7, None).unwrap();
        assert!(text.starts_with("Removed"));
        assert_eq!(settings.get_user_max_tokens(&requester), settings.max_tokens);
    }

    #[test]
    fn numeric_overrides_reject_text() {
        let mut settings = GuildSettings::default();
        assert!(apply_override(&mut settings, OverrideKind::Time, 7, Some("soon")).is_err());
        assert!(settings.max_time_role_override.is_empty());
    }

    #[test]
    fn usage_lists_heaviest_model_first() {
        let mut settings = GuildSettings::default();
        settings.usage.insert(
            "small".into(),
            crate::core::assistant::models::TokenUsage {
                total: 10,
                prompt: 8,
                completion: 2,
            },
        );
        settings.usage.insert(
            "big".into(),
            crate::core::assistant::models::TokenUsage {
                total: 500,
                prompt: 400,
                completion: 100,
            },
        );
        settings.functions_called = 3;
        let text = usage_lines(&settings);
        assert!(text.find("**big**") < text.find("**small**"));
        assert!(text.ends_with("Functions called: 3"));
    }
}
