// =============================================================================
// MESSAGE INTAKE
// =============================================================================
//
// Turns a raw Discord message into the prompt we send to the model. The
// Discord layer extracts mentions, attachments and the replied-to message into
// the plain types below; everything here is string work.

use regex::Regex;
use std::sync::LazyLock;

static OUTPUT_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"--outputfile\s+(\S+)").expect("valid outputfile regex"));
static EXTRACT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"--extract").expect("valid extract regex"));
static LAST: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"--last").expect("valid last regex"));
static IMAGE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://\S+\.(?:png|gif|webp|jpg|jpeg)\b").expect("valid image url regex")
});
static VALID_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]{1,64}$").expect("valid name regex"));

pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];

/// Text files we're willing to inline into the prompt.
pub const READ_EXTENSIONS: &[&str] = &[
    ".txt", ".py", ".json", ".yml", ".yaml", ".xml", ".html", ".ini", ".css", ".toml", ".md",
    ".conf", ".go", ".cfg", ".java", ".c", ".php", ".swift", ".vb", ".xhtml", ".rss", ".asp",
    ".js", ".ts", ".cs", ".c++", ".cc", ".ps1", ".bat", ".batch", ".shell", ".env", ".rs",
    ".sh", ".sql", ".log", ".csv",
];

/// Max bytes of one attachment we'll download and inline.
pub const MAX_ATTACHMENT_BYTES: u32 = 1_000_000;

/// A question with its command flags pulled out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedQuestion {
    pub question: String,
    /// `--outputfile <name>`: send the reply as a file.
    pub output_file: Option<String>,
    /// `--extract`: split code blocks out of the reply.
    pub extract: bool,
    /// `--last`: re-send the last message instead of asking.
    pub last: bool,
    /// Image URLs removed from the question. We don't send images to the model.
    pub image_urls: Vec<String>,
}

pub fn parse_flags(raw: &str) -> ParsedQuestion {
    let output_file = OUTPUT_FILE
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());
    let extract = EXTRACT.is_match(raw);
    let last = LAST.is_match(raw);
    let image_urls = IMAGE_URL
        .find_iter(raw)
        .map(|m| m.as_str().to_string())
        .collect();

    let question = OUTPUT_FILE.replace_all(raw, "");
    let question = EXTRACT.replace_all(&question, "");
    let question = LAST.replace_all(&question, "");
    let question = IMAGE_URL.replace_all(&question, "");

    ParsedQuestion {
        question: question.trim().to_string(),
        output_file,
        extract,
        last,
        image_urls,
    }
}

/// What the assistant channel does with a message once flags are parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelAction {
    Ignore,
    /// `--last`: re-send the newest conversation message.
    ResendLast,
    Answer,
}

/// `--last` is answered regardless of the question rules, since the flag
/// leaves nothing else behind.
pub fn channel_action(
    parsed: &ParsedQuestion,
    min_length: usize,
    require_questionmark: bool,
) -> ChannelAction {
    if parsed.last {
        return ChannelAction::ResendLast;
    }
    if parsed.question.chars().count() < min_length {
        return ChannelAction::Ignore;
    }
    if require_questionmark && !parsed.question.trim_end().ends_with('?') {
        return ChannelAction::Ignore;
    }
    ChannelAction::Answer
}

/// A mention found in the message, already resolved to names.
#[derive(Debug, Clone, PartialEq)]
pub enum MentionTag {
    User {
        id: u64,
        name: String,
        display_name: String,
    },
    Channel {
        id: u64,
        name: String,
    },
    Role {
        id: u64,
        name: String,
    },
}

/// Rewrites raw mentions into tags the model can read. The bot's own mention
/// becomes its display name.
pub fn replace_mentions(
    question: &str,
    bot_id: u64,
    bot_display_name: &str,
    mentions: &[MentionTag],
) -> String {
    let mut out = question
        .replace(&format!("<@{}>", bot_id), bot_display_name)
        .replace(&format!("<@!{}>", bot_id), bot_display_name);

    for mention in mentions {
        match mention {
            MentionTag::User {
                id,
                name,
                display_name,
            } => {
                let tag = format!(
                    "[Username: {} | Displayname: {} | Mention: <@{}>]",
                    name, display_name, id
                );
                out = out
                    .replace(&format!("<@{}>", id), &tag)
                    .replace(&format!("<@!{}>", id), &tag);
            }
            MentionTag::Channel { id, name } => {
                let tag = format!("[Channel: {} | Mention: <#{}>]", name, id);
                out = out.replace(&format!("<#{}>", id), &tag);
            }
            MentionTag::Role { id, name } => {
                let tag = format!("[Role: {} | Mention: <@&{}>]", name, id);
                out = out.replace(&format!("<@&{}>", id), &tag);
            }
        }
    }
    out
}

pub fn is_image_attachment(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    IMAGE_EXTENSIONS
        .iter()
        .any(|ext| lower.ends_with(&format!(".{}", ext)))
}

/// Files without an extension are assumed to be text.
pub fn is_readable_attachment(filename: &str) -> bool {
    if is_image_attachment(filename) {
        return false;
    }
    let lower = filename.to_lowercase();
    !lower.contains('.') || READ_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Appends an uploaded file's contents. Discord turns long pastes into
/// `message.txt`, which doesn't deserve a filename header.
pub fn append_attachment(question: &mut String, filename: &str, contents: &str) {
    if filename == "message.txt" {
        question.push_str(&format!("\n\n### Uploaded File:\n{}\n", contents));
    } else {
        question.push_str(&format!(
            "\n\n### Uploaded File ({}):\n{}\n",
            filename, contents
        ));
    }
}

/// The message being replied to.
#[derive(Debug, Clone)]
pub struct QuotedMessage {
    pub author_id: u64,
    pub author_name: String,
    pub content: String,
    /// Author of the message *it* replied to, if any.
    pub replied_to_author: Option<u64>,
}

/// Prepends the replied-to message when it isn't already part of the
/// author's conversation with the bot.
pub fn quote_reference(question: &str, quoted: &QuotedMessage, author_id: u64, bot_id: u64) -> String {
    if quoted.author_id == author_id || quoted.author_id == bot_id {
        return question.to_string();
    }
    if quoted
        .replied_to_author
        .is_some_and(|replied| replied != author_id)
    {
        return question.to_string();
    }
    format!(
        "# {} SAID:\n{}\n\n# REPLY\n{}",
        quoted.author_name, quoted.content, question
    )
}

/// What Discord shows for a member: server nickname, then global display
/// name, then the username.
pub fn display_name(nick: Option<&str>, global_name: Option<&str>, username: &str) -> String {
    nick.into_iter()
        .chain(global_name)
        .find(|n| !n.trim().is_empty())
        .unwrap_or(username)
        .to_string()
}

/// The `name` field on messages only accepts `^[a-zA-Z0-9_-]{1,64}$`. Strip
/// everything else; `None` when nothing usable is left.
pub fn clean_name(name: &str) -> Option<String> {
    if VALID_NAME.is_match(name) {
        return Some(name.to_string());
    }
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(64)
        .collect();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_extracted_and_removed() {
        let parsed = parse_flags("write a script --outputfile run.py --extract");
        assert_eq!(parsed.question, "write a script");
        assert_eq!(parsed.output_file.as_deref(), Some("run.py"));
        assert!(parsed.extract);
        assert!(!parsed.last);

        let parsed = parse_flags("--last");
        assert!(parsed.last);
        assert!(parsed.question.is_empty());
    }

    #[test]
    fn image_urls_are_stripped() {
        let parsed = parse_flags("what is this https://cdn.example.com/a/cat.png ?");
        assert_eq!(parsed.image_urls, vec!["https://cdn.example.com/a/cat.png"]);
        assert_eq!(parsed.question, "what is this  ?");
    }

    #[test]
    fn mentions_become_readable() {
        let mentions = vec![
            MentionTag::User {
                id: 5,
                name: "alice".into(),
                display_name: "Alice".into(),
            },
            MentionTag::Channel {
                id: 6,
                name: "general".into(),
            },
            MentionTag::Role {
                id: 7,
                name: "Mods".into(),
            },
        ];
        let out = replace_mentions("<@1> ask <@5> in <#6> or <@&7>", 1, "Bot", &mentions);
        assert_eq!(
            out,
            "Bot ask [Username: alice | Displayname: Alice | Mention: <@5>] in \
             [Channel: general | Mention: <#6>] or [Role: Mods | Mention: <@&7>]"
        );
    }

    #[test]
    fn attachment_rules() {
        assert!(is_readable_attachment("main.rs"));
        assert!(is_readable_attachment("README"));
        assert!(!is_readable_attachment("photo.PNG"));
        assert!(!is_readable_attachment("archive.zip"));
        assert!(is_image_attachment("photo.JPEG"));

        let mut question = "look".to_string();
        append_attachment(&mut question, "message.txt", "long paste");
        append_attachment(&mut question, "a.py", "print(1)");
        assert_eq!(
            question,
            "look\n\n### Uploaded File:\nlong paste\n\n\n### Uploaded File (a.py):\nprint(1)\n"
        );
    }

    #[test]
    fn quoting_skips_own_and_bot_messages() {
        let mut quoted = QuotedMessage {
            author_id: 3,
            author_name: "carol".into(),
            content: "the sky is green".into(),
            replied_to_author: None,
        };
        let out = quote_reference("is that true?", &quoted, 1, 2);
        assert_eq!(out, "# carol SAID:\nthe sky is green\n\n# REPLY\nis that true?");

        quoted.author_id = 1;
        assert_eq!(quote_reference("q", &quoted, 1, 2), "q");
        quoted.author_id = 2;
        assert_eq!(quote_reference("q", &quoted, 1, 2), "q");

        // A reply to someone else's thread is not quoted
        quoted.author_id = 3;
        quoted.replied_to_author = Some(9);
        assert_eq!(quote_reference("q", &quoted, 1, 2), "q");
    }

    #[test]
    fn names_are_cleaned() {
        assert_eq!(clean_name("vert_x-1").as_deref(), Some("vert_x-1"));
        assert_eq!(clean_name("Vert X!").as_deref(), Some("VertX"));
        assert_eq!(clean_name("!!!"), None);
        assert_eq!(clean_name(&"a".repeat(100)).map(|n| n.len()), Some(64));
    }

    #[test]
    fn display_name_prefers_nick_then_global_name() {
        assert_eq!(display_name(Some("Vertie"), Some("Vert"), "vert_bot"), "Vertie");
        assert_eq!(display_name(None, Some("Vert"), "vert_bot"), "Vert");
        assert_eq!(display_name(None, None, "vert_bot"), "vert_bot");

        let bot_name = display_name(None, Some("Vert"), "vert_bot");
        assert_eq!(replace_mentions("<@5> hi", 5, &bot_name, &[]), "Vert hi");
    }

    #[test]
    fn last_flag_bypasses_question_rules() {
        let last = parse_flags("--last");
        assert_eq!(last.question, "");
        assert_eq!(channel_action(&last, 7, true), ChannelAction::ResendLast);

        assert_eq!(channel_action(&parse_flags("hey"), 7, false), ChannelAction::Ignore);
        let statement = parse_flags("tell me about cats");
        assert_eq!(channel_action(&statement, 7, true), ChannelAction::Ignore);
        assert_eq!(channel_action(&statement, 7, false), ChannelAction::Answer);
    }
}
