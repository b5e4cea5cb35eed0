// Sending assistant replies back to Discord.
//
// Planning is pure and tested; the two senders just walk the plan. An embed
// that fails to send (usually missing Embed Links) is retried as plain pages.

use crate::core::assistant::formatting::{
    pagify, plan_reply, split_output, OutputFile, ReplyPlan, MESSAGE_LIMIT, PAGE_DELIMS,
};
use crate::core::assistant::intake::ParsedQuestion;
use crate::discord::{Context, Error};
use poise::serenity_prelude as serenity;

const EMBED_COLOR: u32 = 0x5865F2;

#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Text(String),
    Embed(String),
    File(OutputFile),
}

/// Everything to send for one reply, in order.
pub fn plan_outgoing(reply: &str, output_file: Option<&str>, extract: bool) -> Vec<Outgoing> {
    let parts = split_output(reply, output_file, extract);
    let mut outgoing = Vec::new();
    for text in &parts.texts {
        match plan_reply(text, true) {
            ReplyPlan::Plain(pages) => outgoing.extend(pages.into_iter().map(Outgoing::Text)),
            ReplyPlan::Embeds(pages) => outgoing.extend(pages.into_iter().map(Outgoing::Embed)),
        }
    }
    outgoing.extend(parts.files.into_iter().map(Outgoing::File));
    outgoing
}

/// `plan_outgoing` with the `--outputfile` and `--extract` flags of a message.
pub fn plan_for_flags(reply: &str, parsed: &ParsedQuestion) -> Vec<Outgoing> {
    plan_outgoing(reply, parsed.output_file.as_deref(), parsed.extract)
}

fn attachment(file: &OutputFile) -> serenity::CreateAttachment {
    serenity::CreateAttachment::bytes(file.contents.as_bytes().to_vec(), file.name.clone())
}

fn embed(text: &str) -> serenity::CreateEmbed {
    serenity::CreateEmbed::new()
        .description(text)
        .color(EMBED_COLOR)
}

/// Replies to `message`, pinging the author only when `mention` is set.
pub async fn send_to_channel(
    http: &serenity::Http,
    message: &serenity::Message,
    outgoing: Vec<Outgoing>,
    mention: bool,
) -> Result<(), serenity::Error> {
    let channel = message.channel_id;
    for (index, item) in outgoing.iter().enumerate() {
        let mut builder = match item {
            Outgoing::Text(text) => serenity::CreateMessage::new().content(text),
            Outgoing::Embed(text) => serenity::CreateMessage::new().embed(embed(text)),
            Outgoing::File(file) => serenity::CreateMessage::new().add_file(attachment(file)),
        };
        if index == 0 {
            builder = builder
                .reference_message(message)
                .allowed_mentions(serenity::CreateAllowedMentions::new().replied_user(mention));
        }

        match (channel.send_message(http, builder).await, item) {
            (Ok(_), _) => {}
            (Err(e), Outgoing::Embed(text)) => {
                tracing::warn!("Embed failed, sending as text: {}", e);
                for page in pagify(text, MESSAGE_LIMIT, PAGE_DELIMS) {
                    channel.say(http, page).await?;
                }
            }
            (Err(e), _) => return Err(e),
        }
    }
    Ok(())
}

/// Sends the reply through a command context (prefix or slash).
pub async fn send_to_context(ctx: Context<'_>, outgoing: Vec<Outgoing>) -> Result<(), Error> {
    for item in outgoing {
        let reply = match &item {
            Outgoing::Text(text) => poise::CreateReply::default().content(text.clone()),
            Outgoing::Embed(text) => poise::CreateReply::default().embed(embed(text)),
            Outgoing::File(file) => poise::CreateReply::default().attachment(attachment(file)),
        };

        if let Err(e) = ctx.send(reply).await {
            let Outgoing::Embed(text) = item else {
                return Err(e.into());
            };
            tracing::warn!("Embed failed, sending as text: {}", e);
            for page in pagify(&text, MESSAGE_LIMIT, PAGE_DELIMS) {
                ctx.say(page).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::assistant::intake::parse_flags;

    #[test]
    fn short_reply_is_one_message() {
        assert_eq!(
            plan_outgoing("hello", None, false),
            vec![Outgoing::Text("hello".into())]
        );
    }

    #[test]
    fn long_reply_becomes_embed_pages() {
        let reply = "paragraph\n".repeat(900);
        let outgoing = plan_outgoing(&reply, None, false);
        assert!(outgoing.len() >= 3);
        assert!(outgoing.iter().all(|o| matches!(o, Outgoing::Embed(_))));
    }

    #[test]
    fn files_come_after_text() {
        let reply = "Here you go\n```py\nprint(1)\n```";
        let outgoing = plan_outgoing(reply, Some("script.py"), true);
        assert_eq!(outgoing[0], Outgoing::Text("Here you go\n[Code Removed]".into()));
        match &outgoing[1] {
            Outgoing::File(file) => {
                assert_eq!(file.name, "1_script.py");
                assert_eq!(file.contents, "print(1)");
            }
            other => panic!("expected a file, got {:?}", other),
        }
    }

    #[test]
    fn resent_last_reply_honours_output_flags() {
        let last = "Here you go\n```py\nprint(1)\n```";
        let parsed = parse_flags("--last --outputfile script.py");
        assert!(parsed.last);

        let outgoing = plan_for_flags(last, &parsed);
        assert_eq!(outgoing.len(), 1);
        match &outgoing[0] {
            Outgoing::File(file) => {
                assert_eq!(file.name, "script.py");
                assert_eq!(file.contents, last);
            }
            other => panic!("expected a file, got {:?}", other),
        }
    }
}
