// Pulls what the assistant core needs out of serenity types.
//
// Cache guards are not Send, so everything is copied out of the cache in
// plain functions before any await.

use crate::core::assistant::intake::{
    append_attachment, display_name, is_readable_attachment, quote_reference, replace_mentions, MentionTag,
    QuotedMessage, MAX_ATTACHMENT_BYTES,
};
use crate::core::assistant::{PromptContext, Requester};
use poise::serenity_prelude as serenity;

/// Who is asking and where.
#[derive(Debug, Clone)]
pub struct ChatSource {
    pub guild_id: serenity::GuildId,
    pub channel_id: serenity::ChannelId,
    pub author: serenity::User,
    pub role_ids: Vec<serenity::RoleId>,
    pub nick: Option<String>,
}

impl ChatSource {
    pub fn from_message(message: &serenity::Message, guild_id: serenity::GuildId) -> Self {
        let member = message.member.as_deref();
        Self {
            guild_id,
            channel_id: message.channel_id,
            author: message.author.clone(),
            role_ids: member.map(|m| m.roles.clone()).unwrap_or_default(),
            nick: member.and_then(|m| m.nick.clone()),
        }
    }

    pub fn from_member(member: &serenity::Member, channel_id: serenity::ChannelId) -> Self {
        Self {
            guild_id: member.guild_id,
            channel_id,
            author: member.user.clone(),
            role_ids: member.roles.clone(),
            nick: member.nick.clone(),
        }
    }
}

pub struct Snapshot {
    pub context: PromptContext,
    pub requester: Requester,
    pub category_id: Option<u64>,
}

/// The bot's id and the name members see it under in this guild.
pub fn bot_identity(
    cache: &serenity::Cache,
    guild_id: Option<serenity::GuildId>,
) -> (u64, String) {
    let (id, global_name, username) = {
        let me = cache.current_user();
        (me.id, me.global_name.clone(), me.name.clone())
    };
    let nick = guild_id
        .and_then(|g| cache.guild(g))
        .and_then(|guild| guild.members.get(&id).and_then(|m| m.nick.clone()));
    (
        id.get(),
        display_name(nick.as_deref(), global_name.as_deref(), &username),
    )
}

pub fn snapshot(cache: &serenity::Cache, source: &ChatSource) -> Snapshot {
    let author = &source.author;
    let display_name = display_name(
        source.nick.as_deref(),
        author.global_name.as_deref(),
        &author.name,
    );

    let mut context = PromptContext {
        bot_name: bot_identity(cache, Some(source.guild_id)).1,
        guild_created_at: source.guild_id.created_at().unix_timestamp(),
        username: author.name.clone(),
        display_name,
        avatar_url: author.face(),
        channel_id: source.channel_id.get(),
        ..Default::default()
    };
    let mut requester = Requester {
        user_id: author.id.get(),
        role_ids: source.role_ids.iter().map(|r| r.get()).collect(),
        is_guild_owner: false,
    };
    let mut category_id = None;

    if let Some(guild) = cache.guild(source.guild_id) {
        context.guild_name = guild.name.clone();
        context.member_count = guild.member_count;
        context.owner_name = guild
            .members
            .get(&guild.owner_id)
            .map(|m| m.user.name.clone())
            .unwrap_or_default();

        let mut roles: Vec<&serenity::Role> = source
            .role_ids
            .iter()
            .filter_map(|id| guild.roles.get(id))
            .collect();
        roles.sort_by(|a, b| b.position.cmp(&a.position));
        context.roles = roles.iter().map(|r| (r.id.get(), r.name.clone())).collect();
        requester.role_ids = roles.iter().map(|r| r.id.get()).collect();
        requester.is_guild_owner = guild.owner_id == author.id;

        if let Some(channel) = guild.channels.get(&source.channel_id) {
            context.channel_name = channel.name.clone();
            context.channel_topic = channel.topic.clone();
            category_id = channel.parent_id.map(|id| id.get());
        }
    }

    Snapshot {
        context,
        requester,
        category_id,
    }
}

/// Resolves the users, roles and channels mentioned in a message.
pub fn mention_tags(
    cache: &serenity::Cache,
    guild_id: serenity::GuildId,
    message: &serenity::Message,
) -> Vec<MentionTag> {
    let mut tags: Vec<MentionTag> = message
        .mentions
        .iter()
        .map(|user| MentionTag::User {
            id: user.id.get(),
            name: user.name.clone(),
            display_name: user.global_name.clone().unwrap_or_else(|| user.name.clone()),
        })
        .collect();

    if let Some(guild) = cache.guild(guild_id) {
        tags.extend(message.mention_roles.iter().filter_map(|id| {
            guild.roles.get(id).map(|role| MentionTag::Role {
                id: id.get(),
                name: role.name.clone(),
            })
        }));
        tags.extend(
            guild
                .channels
                .values()
                .filter(|c| message.content.contains(&format!("<#{}>", c.id)))
                .map(|c| MentionTag::Channel {
                    id: c.id.get(),
                    name: c.name.clone(),
                }),
        );
    }
    tags
}

/// Builds the prompt text for a message: readable mentions, inlined text
/// attachments and the message being replied to.
pub async fn build_question(
    ctx: &serenity::Context,
    message: &serenity::Message,
    question: &str,
) -> String {
    let (bot_id, bot_name) = bot_identity(&ctx.cache, message.guild_id);
    let tags = message
        .guild_id
        .map(|guild_id| mention_tags(&ctx.cache, guild_id, message))
        .unwrap_or_default();
    let mut question = replace_mentions(question, bot_id, &bot_name, &tags);

    for attachment in &message.attachments {
        if !is_readable_attachment(&attachment.filename) || attachment.size > MAX_ATTACHMENT_BYTES {
            continue;
        }
        match attachment.download().await {
            Ok(bytes) => append_attachment(
                &mut question,
                &attachment.filename,
                &String::from_utf8_lossy(&bytes),
            ),
            Err(e) => tracing::warn!(file = %attachment.filename, "Failed to download attachment: {}", e),
        }
    }

    if let Some(quoted) = message.referenced_message.as_deref() {
        let quoted = QuotedMessage {
            author_id: quoted.author.id.get(),
            author_name: quoted.author.name.clone(),
            content: quoted.content.clone(),
            replied_to_author: quoted.referenced_message.as_ref().map(|m| m.author.id.get()),
        };
        question = quote_reference(&question, &quoted, message.author.id.get(), bot_id);
    }

    question
}
