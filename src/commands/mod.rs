mod ask;
mod config;
mod followup;
mod manage;
mod sources;

use crate::answer::Followup;
use crate::state::Context;

/// Discord's message limit, with room for a trailing ellipsis.
pub const MESSAGE_LIMIT: usize = 1990;

/// Cite - ask questions and get answers with numbered sources
#[poise::command(
    slash_command,
    subcommands(
        "ask::ask",
        "ask::stop",
        "followup::followup",
        "sources::sources",
        "manage::clear",
        "manage::undo",
        "config::config"
    )
)]
pub async fn cite(_ctx: Context<'_>) -> Result<(), anyhow::Error> {
    Ok(())
}

/// Largest char boundary at or before `index`.
fn floor_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut i = index;
    while !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Split `text` into pieces of at most `limit` bytes, preferring to break at
/// a newline, then at a space.
pub fn chunks(text: &str, limit: usize) -> Vec<&str> {
    let mut out = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        let chunk_len = floor_boundary(remaining, limit);
        let split_at = if chunk_len < remaining.len() {
            remaining[..chunk_len]
                .rfind('\n')
                .or_else(|| remaining[..chunk_len].rfind(' '))
                .map(|i| i + 1)
                .filter(|&i| i > 0)
                .unwrap_or(chunk_len)
        } else {
            chunk_len
        };
        // A single char wider than `limit` still has to go somewhere.
        let split_at = if split_at == 0 {
            remaining.chars().next().map(char::len_utf8).unwrap_or(remaining.len())
        } else {
            split_at
        };
        out.push(&remaining[..split_at]);
        remaining = &remaining[split_at..];
    }
    out
}

/// Cut `text` to fit in one message.
pub fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    format!("{}…", &text[..floor_boundary(text, limit.saturating_sub(3))])
}

/// Send a message in Discord-safe chunks.
/// Uses ctx.say() for all chunks so follow-ups go through the interaction
/// webhook, which doesn't require Send Messages channel permission.
pub async fn send_chunked(ctx: &Context<'_>, text: &str) -> Result<(), anyhow::Error> {
    for chunk in chunks(text, MESSAGE_LIMIT) {
        ctx.say(chunk).await?;
    }
    Ok(())
}

/// Numbered follow-up list, or `None` if there are none.
pub fn format_followups(followups: &[Followup]) -> Option<String> {
    if followups.is_empty() {
        return None;
    }
    let mut out = String::from("**Follow-ups** (`/cite followup <n>`):\n");
    for (i, followup) in followups.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, followup.text));
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_prefer_newlines() {
        let text = "aaaa\nbbbb\ncccc";
        assert_eq!(chunks(text, 10), vec!["aaaa\nbbbb\n", "cccc"]);
    }

    #[test]
    fn test_chunks_fall_back_to_spaces_then_hard_split() {
        assert_eq!(chunks("aaa bbb ccc", 8), vec!["aaa bbb ", "ccc"]);
        assert_eq!(chunks("abcdefghij", 4), vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn test_chunks_respect_char_boundaries() {
        let text = "ééééé";
        let parts = chunks(text, 3);
        assert!(parts.iter().all(|p| p.len() <= 3));
        assert_eq!(parts.concat(), text);
    }

    #[test]
    fn test_chunks_never_empty() {
        assert!(chunks("", 10).is_empty());
        assert_eq!(chunks("🙂", 2), vec!["🙂"]);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        let cut = truncate("0123456789abcdef", 10);
        assert_eq!(cut, "0123456…");
    }

    #[test]
    fn test_format_followups() {
        assert_eq!(format_followups(&[]), None);
        let list = format_followups(&[Followup {
            text: "Why are sunsets red?".into(),
            page_reference: "8".into(),
            score: 0.0,
        }])
        .unwrap();
        assert!(list.ends_with("1. Why are sunsets red?\n"));
    }
}
