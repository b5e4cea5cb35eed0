//! Formatting helpers for sending assistant replies to Discord.
//!
//! Discord caps plain messages at 2000 characters and embed descriptions at
//! 4096, so long replies get split into pages here before the Discord layer
//! sends them.

use regex::Regex;
use std::sync::LazyLock;

pub const MESSAGE_LIMIT: usize = 2000;
pub const EMBED_LIMIT: usize = 4000;
/// Page size for multi-embed replies, a little under the embed limit.
pub const EMBED_PAGE: usize = 3950;

/// Split points, in no particular priority: the last one before the limit wins.
pub const PAGE_DELIMS: &[&str] = &["```", "\n"];

static CODE_WITH_LANG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(\w+)(.*?)```").expect("valid code block regex"));
static CODE_ANY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(.*?)```").expect("valid code block regex"));

const CODE_REMOVED: &str = "[Code Removed]";

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Byte offset of the `n`th char (or the end of the string).
fn byte_offset(text: &str, n: usize) -> usize {
    text.char_indices()
        .nth(n)
        .map(|(i, _)| i)
        .unwrap_or(text.len())
}

/// Splits text into pages of at most `page_len` characters.
///
/// Each page ends right before the last delimiter found inside the window, so
/// delimiters start the next page. With no delimiter in range the text is cut
/// at the limit. Whitespace-only pages are dropped.
pub fn pagify(text: &str, page_len: usize, delims: &[&str]) -> Vec<String> {
    let page_len = page_len.max(1);
    let mut pages = Vec::new();
    let mut rest = text;

    while char_len(rest) > page_len {
        let window_end = byte_offset(rest, page_len);
        let window = &rest[..window_end];

        // Never split at 0, that would loop forever
        let split = delims
            .iter()
            .filter_map(|d| window.rfind(d).filter(|&i| i > 0))
            .max()
            .unwrap_or(window_end);

        let (page, next) = rest.split_at(split);
        if !page.trim().is_empty() {
            pages.push(page.to_string());
        }
        rest = next;
    }

    if !rest.trim().is_empty() {
        pages.push(rest.to_string());
    }
    pages
}

/// Contents of every fenced code block, trimmed.
pub fn extract_code_blocks(content: &str) -> Vec<String> {
    let tagged: Vec<String> = CODE_WITH_LANG
        .captures_iter(content)
        .map(|c| c[2].trim().to_string())
        .collect();
    if !tagged.is_empty() {
        return tagged;
    }
    CODE_ANY
        .captures_iter(content)
        .map(|c| c[1].trim().to_string())
        .collect()
}

/// (language, code) for every fenced code block. Language is empty for bare fences.
pub fn extract_code_blocks_with_lang(content: &str) -> Vec<(String, String)> {
    let tagged: Vec<(String, String)> = CODE_WITH_LANG
        .captures_iter(content)
        .map(|c| (c[1].to_string(), c[2].trim().to_string()))
        .collect();
    if !tagged.is_empty() {
        return tagged;
    }
    CODE_ANY
        .captures_iter(content)
        .map(|c| (String::new(), c[1].trim().to_string()))
        .collect()
}

pub fn remove_code_blocks(content: &str) -> String {
    let content = CODE_WITH_LANG.replace_all(content, CODE_REMOVED);
    let content = CODE_ANY.replace_all(content.trim(), CODE_REMOVED);
    content.trim().to_string()
}

pub fn box_code(code: &str, lang: &str) -> String {
    format!("```{}\n{}\n```", lang, code)
}

/// How one chunk of reply text should go out.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyPlan {
    /// One or more plain messages.
    Plain(Vec<String>),
    /// One or more embeds, each page as the description.
    Embeds(Vec<String>),
}

/// Short replies go as a message, medium ones as a single embed, long ones as
/// embed pages (or message pages without embed permission).
pub fn plan_reply(content: &str, embeds_allowed: bool) -> ReplyPlan {
    let len = char_len(content);
    if len <= MESSAGE_LIMIT {
        ReplyPlan::Plain(vec![content.to_string()])
    } else if len <= EMBED_LIMIT && embeds_allowed {
        ReplyPlan::Embeds(vec![content.to_string()])
    } else if embeds_allowed {
        ReplyPlan::Embeds(pagify(content, EMBED_PAGE, PAGE_DELIMS))
    } else {
        ReplyPlan::Plain(pagify(content, MESSAGE_LIMIT, PAGE_DELIMS))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputFile {
    pub name: String,
    pub contents: String,
}

/// A reply broken into the texts and files to send.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplyParts {
    pub texts: Vec<String>,
    pub files: Vec<OutputFile>,
}

/// Applies `--outputfile` and `--extract`:
/// - file only: the whole reply becomes one file
/// - file + extract: each code block becomes `<n>_<name>`, prose is sent
/// - extract only: prose first, then each code block as its own message
pub fn split_output(reply: &str, output_file: Option<&str>, extract: bool) -> ReplyParts {
    let mut parts = ReplyParts::default();
    match (output_file, extract) {
        (Some(name), false) => {
            parts.files.push(OutputFile {
                name: name.to_string(),
                contents: reply.to_string(),
            });
        }
        (Some(name), true) => {
            parts.files = extract_code_blocks(reply)
                .into_iter()
                .enumerate()
                .map(|(i, code)| OutputFile {
                    name: format!("{}_{}", i + 1, name),
                    contents: code,
                })
                .collect();
            parts.texts.push(remove_code_blocks(reply));
        }
        (None, true) => {
            parts.texts.push(remove_code_blocks(reply));
            parts.texts.extend(
                extract_code_blocks_with_lang(reply)
                    .iter()
                    .map(|(lang, code)| box_code(code, lang)),
            );
        }
        (None, false) => parts.texts.push(reply.to_string()),
    }
    parts.texts.retain(|t| !t.trim().is_empty());
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagify_splits_on_newlines() {
        let text = format!("{}\n{}", "a".repeat(15), "b".repeat(15));
        let pages = pagify(&text, 20, PAGE_DELIMS);
        assert_eq!(pages, vec!["a".repeat(15), format!("\n{}", "b".repeat(15))]);
    }

    #[test]
    fn pagify_prefers_the_latest_delimiter() {
        let text = "aaa```bbb\nccc\nddddddddddddddd";
        let pages = pagify(text, 16, PAGE_DELIMS);
        assert_eq!(pages[0], "aaa```bbb\nccc");
        assert!(pages.iter().all(|p| p.chars().count() <= 16));
    }

    #[test]
    fn pagify_hard_splits_without_delimiters() {
        let text = "é".repeat(25);
        let pages = pagify(&text, 10, PAGE_DELIMS);
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0].chars().count(), 10);
        assert_eq!(pages.concat(), text);
    }

    #[test]
    fn code_block_helpers() {
        let reply = "Here:\n```rust\nfn main() {}\n```\nand\n```py\nprint(1)\n```";
        assert_eq!(extract_code_blocks(reply), vec!["fn main() {}", "print(1)"]);
        assert_eq!(
            extract_code_blocks_with_lang(reply),
            vec![
                ("rust".to_string(), "fn main() {}".to_string()),
                ("py".to_string(), "print(1)".to_string())
            ]
        );
        assert_eq!(
            remove_code_blocks(reply),
            "Here:\n[Code Removed]\nand\n[Code Removed]"
        );

        let bare = "```\nplain\n```";
        assert_eq!(extract_code_blocks_with_lang(bare), vec![(String::new(), "plain".to_string())]);
    }

    #[test]
    fn reply_plan_by_length() {
        assert_eq!(plan_reply("hi", true), ReplyPlan::Plain(vec!["hi".into()]));

        let medium = "x".repeat(3000);
        assert_eq!(plan_reply(&medium, true), ReplyPlan::Embeds(vec![medium.clone()]));
        match plan_reply(&medium, false) {
            ReplyPlan::Plain(pages) => assert_eq!(pages.len(), 2),
            other => panic!("unexpected plan {:?}", other),
        }

        let long = "line\n".repeat(1000);
        match plan_reply(&long, true) {
            ReplyPlan::Embeds(pages) => {
                assert_eq!(pages.len(), 2);
                assert!(pages.iter().all(|p| p.chars().count() <= EMBED_PAGE));
            }
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn output_modes() {
        let reply = "Prose\n```py\nprint(1)\n```";

        let parts = split_output(reply, Some("out.py"), false);
        assert!(parts.texts.is_empty());
        assert_eq!(parts.files[0].contents, reply);

        let parts = split_output(reply, Some("out.py"), true);
        assert_eq!(parts.texts, vec!["Prose\n[Code Removed]"]);
        assert_eq!(parts.files[0].name, "1_out.py");
        assert_eq!(parts.files[0].contents, "print(1)");

        let parts = split_output(reply, None, true);
        assert_eq!(parts.texts, vec!["Prose\n[Code Removed]", "```py\nprint(1)\n```"]);

        let parts = split_output("   ", None, false);
        assert!(parts.texts.is_empty());
    }
}
