// =============================================================================
// PROMPT ASSEMBLY
// =============================================================================
//
// System and initial prompts are admin-written templates with `{key}`
// placeholders. Substitution is plain string replacement so prompts that
// contain code (and therefore stray braces) never fail to format.

use super::conversation::Conversation;
use super::embeddings::RelatedEmbedding;
use super::models::{EmbedMethod, GuildSettings, Requester};
use super::tokens::estimate_tokens;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;

/// Everything the Discord layer knows about where a chat is happening.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub bot_name: String,
    pub guild_name: String,
    /// Unix seconds.
    pub guild_created_at: i64,
    pub owner_name: String,
    pub member_count: u64,
    pub username: String,
    pub display_name: String,
    pub avatar_url: String,
    /// (id, name), highest first, without @everyone.
    pub roles: Vec<(u64, String)>,
    pub channel_id: u64,
    pub channel_name: String,
    pub channel_topic: Option<String>,
}

/// Resolves the guild's timezone, falling back to UTC for unknown names.
pub fn guild_timezone(settings: &GuildSettings) -> Tz {
    settings.timezone.parse().unwrap_or_else(|_| {
        tracing::warn!(timezone = %settings.timezone, "Unknown timezone, using UTC");
        chrono_tz::UTC
    })
}

/// "a", "a and b", "a, b, and c".
pub fn humanize_list(items: &[String]) -> String {
    match items {
        [] => String::new(),
        [one] => one.clone(),
        [a, b] => format!("{} and {}", a, b),
        [rest @ .., last] => format!("{}, and {}", rest.join(", "), last),
    }
}

/// Placeholder values for the templates.
pub fn build_params(
    ctx: &PromptContext,
    settings: &GuildSettings,
    requester: &Requester,
    conversation: &Conversation,
    message: &str,
    now: DateTime<Utc>,
) -> Vec<(&'static str, String)> {
    let local = now.with_timezone(&guild_timezone(settings));
    let role_names: Vec<String> = ctx.roles.iter().map(|(_, name)| name.clone()).collect();
    let role_mentions: Vec<String> = ctx.roles.iter().map(|(id, _)| format!("<@&{}>", id)).collect();
    let conversation_tokens = conversation.token_count() + estimate_tokens(message);

    vec![
        ("botname", ctx.bot_name.clone()),
        ("timestamp", format!("<t:{}:F>", now.timestamp())),
        ("day", local.format("%A").to_string()),
        ("date", local.format("%B %d, %Y").to_string()),
        ("time", local.format("%I:%M %p").to_string()),
        ("timetz", local.format("%I:%M %p %Z").to_string()),
        ("members", ctx.member_count.to_string()),
        ("username", ctx.username.clone()),
        ("user", ctx.username.clone()),
        ("displayname", ctx.display_name.clone()),
        ("datetime", local.format("%Y-%m-%d %H:%M:%S").to_string()),
        ("roles", humanize_list(&role_names)),
        ("rolementions", humanize_list(&role_mentions)),
        ("avatar", ctx.avatar_url.clone()),
        ("owner", ctx.owner_name.clone()),
        ("servercreated", format!("<t:{}:F>", ctx.guild_created_at)),
        ("server", ctx.guild_name.clone()),
        ("messages", conversation.messages.len().to_string()),
        ("tokens", conversation_tokens.to_string()),
        ("retention", settings.get_user_max_retention(requester).to_string()),
        ("retentiontime", settings.get_user_max_time(requester).to_string()),
        ("channelname", ctx.channel_name.clone()),
        ("channelmention", format!("<#{}>", ctx.channel_id)),
        ("topic", ctx.channel_topic.clone().unwrap_or_default()),
    ]
}

/// Replaces every `{key}` it knows about and leaves everything else alone.
pub fn format_template(text: &str, params: &[(&str, String)]) -> String {
    let mut out = text.to_string();
    for (key, value) in params {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}

/// The system prompt for a channel: its own prompt if it has one.
pub fn system_template(settings: &GuildSettings, channel_id: u64) -> &str {
    settings
        .channel_prompts
        .get(&channel_id)
        .map(String::as_str)
        .unwrap_or(&settings.system_prompt)
}

/// The three pieces of text the model receives besides the history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledPrompt {
    pub system_prompt: String,
    pub initial_prompt: String,
    pub message: String,
}

impl AssembledPrompt {
    pub fn tokens(&self) -> usize {
        estimate_tokens(&self.system_prompt)
            + estimate_tokens(&self.initial_prompt)
            + estimate_tokens(&self.message)
    }
}

const EMBEDDINGS_HEADER: &str = "\n\n# RELATED EMBEDDINGS\n";

/// Adds related embeddings, best first, while they fit under `max_tokens`.
/// Returns how many were injected.
pub fn inject_embeddings(
    prompt: &mut AssembledPrompt,
    related: &[RelatedEmbedding],
    method: EmbedMethod,
    current_tokens: usize,
    max_tokens: usize,
) -> usize {
    let mut used = current_tokens;
    let mut blocks: Vec<String> = Vec::new();
    for entry in related {
        let block = format!("[{}](Relatedness: {:.4}): {}\n", entry.name, entry.score, entry.text);
        let cost = estimate_tokens(&block);
        if used + cost > max_tokens {
            tracing::debug!(injected = blocks.len(), "Cannot fit any more embeddings");
            break;
        }
        used += cost;
        blocks.push(block);
    }

    if blocks.is_empty() {
        return 0;
    }

    let all = format!("{}{}", EMBEDDINGS_HEADER, blocks.concat());
    match method {
        EmbedMethod::Static => prompt.message.push_str(&all),
        EmbedMethod::Dynamic => prompt.system_prompt.push_str(&all),
        EmbedMethod::User => prompt.initial_prompt.push_str(&all),
        EmbedMethod::Hybrid => {
            prompt.message.push_str(EMBEDDINGS_HEADER);
            prompt.message.push_str(&blocks[0]);
            if blocks.len() > 1 {
                prompt.system_prompt.push_str(EMBEDDINGS_HEADER);
                prompt.system_prompt.push_str(&blocks[1..].concat());
            }
        }
    }
    blocks.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn related(name: &str, text: &str, score: f32) -> RelatedEmbedding {
        RelatedEmbedding {
            name: name.into(),
            text: text.into(),
            score,
            dimensions: 3,
        }
    }

    fn prompt() -> AssembledPrompt {
        AssembledPrompt {
            system_prompt: "sys".into(),
            initial_prompt: "init".into(),
            message: "msg".into(),
        }
    }

    #[test]
    fn unknown_placeholders_are_left_alone() {
        let params = vec![("botname", "Vert".to_string())];
        let out = format_template("I am {botname}. fn x() { {unknown} }", &params);
        assert_eq!(out, "I am Vert. fn x() { {unknown} }");
        assert_eq!(format_template("{", &params), "{");
    }

    #[test]
    fn params_use_guild_timezone() {
        let mut settings = GuildSettings::default();
        settings.timezone = "America/New_York".into();
        let ctx = PromptContext {
            bot_name: "Vert".into(),
            roles: vec![(1, "Admin".into()), (2, "Mod".into())],
            channel_id: 42,
            ..Default::default()
        };
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 17, 30, 0).unwrap();

        let params = build_params(
            &ctx,
            &settings,
            &Requester::default(),
            &Conversation::default(),
            "hello",
            now,
        );
        let text = format_template(
            "{botname} {day} {time} {roles} {rolementions} {channelmention} {retention}",
            &params,
        );
        assert_eq!(text, "Vert Monday 12:30 PM Admin and Mod <@&1> and <@&2> <#42> 50");
    }

    #[test]
    fn bad_timezone_falls_back_to_utc() {
        let mut settings = GuildSettings::default();
        settings.timezone = "Mars/Olympus".into();
        assert_eq!(guild_timezone(&settings), chrono_tz::UTC);
    }

    #[test]
    fn humanize() {
        assert_eq!(humanize_list(&[]), "");
        assert_eq!(humanize_list(&["a".into()]), "a");
        assert_eq!(humanize_list(&["a".into(), "b".into()]), "a and b");
        assert_eq!(humanize_list(&["a".into(), "b".into(), "c".into()]), "a, b, and c");
    }

    #[test]
    fn channel_prompt_overrides_system() {
        let mut settings = GuildSettings::default();
        settings.channel_prompts.insert(7, "channel prompt".into());
        assert_eq!(system_template(&settings, 7), "channel prompt");
        assert_eq!(system_template(&settings, 8), settings.system_prompt);
    }

    #[test]
    fn embeddings_go_where_the_method_says() {
        let hits = vec![related("a", "alpha", 0.9), related("b", "beta", 0.8)];

        let mut p = prompt();
        assert_eq!(inject_embeddings(&mut p, &hits, EmbedMethod::Dynamic, 0, 1000), 2);
        assert!(p.system_prompt.contains("[a](Relatedness: 0.9000): alpha"));
        assert_eq!(p.message, "msg");

        let mut p = prompt();
        inject_embeddings(&mut p, &hits, EmbedMethod::Static, 0, 1000);
        assert!(p.message.contains("beta"));

        let mut p = prompt();
        inject_embeddings(&mut p, &hits, EmbedMethod::User, 0, 1000);
        assert!(p.initial_prompt.contains("alpha"));

        let mut p = prompt();
        inject_embeddings(&mut p, &hits, EmbedMethod::Hybrid, 0, 1000);
        assert!(p.message.contains("alpha") && !p.message.contains("beta"));
        assert!(p.system_prompt.contains("beta") && !p.system_prompt.contains("alpha"));
    }

    #[test]
    fn embeddings_stop_at_the_budget() {
        let hits = vec![related("a", &"x".repeat(40), 0.9), related("b", &"y".repeat(40), 0.8)];
        let mut p = prompt();
        // Each block is ~17 tokens, only one fits
        assert_eq!(inject_embeddings(&mut p, &hits, EmbedMethod::Dynamic, 0, 20), 1);
        assert!(!p.system_prompt.contains("yyyy"));

        let mut p = prompt();
        assert_eq!(inject_embeddings(&mut p, &hits, EmbedMethod::Dynamic, 100, 20), 0);
        assert_eq!(p, prompt());
    }
}
