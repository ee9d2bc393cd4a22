use reqwest::Url;

use super::accumulator::AnswerState;
use super::citations::{Citation, CitationLookup, SourceCitation, MARKER};
use super::events::Phase;

/// A piece of a rendered paragraph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    /// A reference to the citation with this display index.
    Citation(usize),
}

pub type Paragraph = Vec<Segment>;

/// Split a paragraph around its markers.
///
/// Even positions are text runs and odd positions are marker keys, so the
/// result always has odd length: `"a [x] b"` → `["a ", "x", " b"]`.
pub fn split_markers(paragraph: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut last = 0;
    for caps in MARKER.captures_iter(paragraph) {
        let (whole, key) = match (caps.get(0), caps.get(1)) {
            (Some(whole), Some(key)) => (whole, key),
            _ => continue,
        };
        parts.push(&paragraph[last..whole.start()]);
        parts.push(key.as_str());
        last = whole.end();
    }
    parts.push(&paragraph[last..]);
    parts
}

/// Turn normalized text into paragraphs of text runs and citation references.
///
/// Markers without a lookup entry are kept as literal `[k]` text.
pub fn render(normalized: &str, lookup: &CitationLookup) -> Vec<Paragraph> {
    normalized
        .split('\n')
        .map(|paragraph| {
            let mut segments = Vec::new();
            let mut text = String::new();
            for (i, part) in split_markers(paragraph).into_iter().enumerate() {
                if i % 2 == 0 {
                    text.push_str(part);
                    continue;
                }
                match lookup.get(part) {
                    Some(citation) => {
                        if !text.is_empty() {
                            segments.push(Segment::Text(std::mem::take(&mut text)));
                        }
                        segments.push(Segment::Citation(citation.display_index));
                    }
                    None => {
                        text.push('[');
                        text.push_str(part);
                        text.push(']');
                    }
                }
            }
            if !text.is_empty() {
                segments.push(Segment::Text(text));
            }
            segments
        })
        .collect()
}

/// Where a citation links to. Sources without a url link to a title search.
pub fn citation_url(citation: &Citation) -> String {
    source_url(&citation.source)
}

fn source_url(source: &SourceCitation) -> String {
    match source.url.as_deref() {
        Some(url) if !url.is_empty() => url.to_string(),
        _ => Url::parse_with_params("https://duckduckgo.com/", &[("q", source.title.as_str())])
            .map(|u| u.to_string())
            .unwrap_or_else(|_| "https://duckduckgo.com/".to_string()),
    }
}

/// `[n] title - authors - date`, linked for Discord.
pub fn format_citation(citation: &Citation) -> String {
    format_source(&[citation.display_index], &citation.source)
}

/// Like [`format_citation`] for a source shown under several numbers:
/// `[1, 4] title - authors - date`.
pub fn format_source(indices: &[usize], source: &SourceCitation) -> String {
    let numbers = indices.iter().map(usize::to_string).collect::<Vec<_>>().join(", ");
    let mut line = format!("**[{}]** [{}](<{}>)", numbers, source.title, source_url(source));
    if !source.authors.is_empty() {
        line.push_str(" - ");
        line.push_str(&source.authors.join(", "));
    }
    if let Some(date) = source.date.as_deref().filter(|d| !d.is_empty()) {
        line.push_str(" - ");
        line.push_str(date);
    }
    line
}

/// Render paragraphs as Discord markdown with linked in-text citations.
pub fn to_markdown(paragraphs: &[Paragraph], lookup: &CitationLookup) -> String {
    paragraphs
        .iter()
        .map(|segments| {
            let mut line = String::new();
            for segment in segments {
                match segment {
                    Segment::Text(text) => line.push_str(text),
                    Segment::Citation(n) => match lookup.by_display_index(*n) {
                        Some(citation) => {
                            line.push_str(&format!("[\\[{}\\]](<{}>)", n, citation_url(citation)))
                        }
                        None => line.push_str(&format!("[{}]", n)),
                    },
                }
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// The text shown while no content has streamed yet.
pub fn loading_message(phase: &Phase) -> String {
    match phase {
        Phase::Started => "Loading: Sending query...".to_string(),
        Phase::Semantic => "Loading: Performing semantic search...".to_string(),
        Phase::History => "Loading: Processing history...".to_string(),
        Phase::Context => "Loading: Creating context...".to_string(),
        Phase::Prompt => "Loading: Creating prompt...".to_string(),
        Phase::Llm => "Loading: Waiting for LLM...".to_string(),
        Phase::Followups => "Checking for followups...".to_string(),
        other => format!("Loading: {}...", other),
    }
}

/// Render an in-progress or finished answer, sources list included.
pub fn render_answer(normalized: &str, lookup: &CitationLookup) -> String {
    let mut out = to_markdown(&render(normalized, lookup), lookup);
    if !lookup.is_empty() {
        out.push_str("\n\n**Sources:**\n");
        for citation in lookup.iter() {
            out.push_str(&format_citation(citation));
            out.push('\n');
        }
    }
    out
}

/// What the live message should show for the current state.
pub fn render_progress(state: &AnswerState) -> String {
    if state.normalized.is_empty() {
        return loading_message(&state.phase);
    }
    let mut out = render_answer(&state.normalized, &state.citations);
    if state.phase == Phase::Followups {
        out.push('\n');
        out.push_str(&loading_message(&state.phase));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::answer::citations::KeyScheme;

    fn lookup(keys: &[&str]) -> CitationLookup {
        let pool: Vec<SourceCitation> = keys
            .iter()
            .map(|k| SourceCitation {
                title: format!("Paper {}", k),
                url: Some(format!("https://example.com/{}", k)),
                reference: Some(k.to_string()),
                ..Default::default()
            })
            .collect();
        let mut lookup = CitationLookup::default();
        let text: String = keys.iter().map(|k| format!("[{}]", k)).collect();
        lookup.resolve(&text, &pool, KeyScheme::Explicit);
        lookup
    }

    #[test]
    fn test_split_markers_alternates() {
        assert_eq!(split_markers("a [x] b [y]"), vec!["a ", "x", " b ", "y", ""]);
        assert_eq!(split_markers("plain"), vec!["plain"]);
        assert_eq!(split_markers("[x]").len() % 2, 1);
    }

    #[test]
    fn test_render_interleaves_text_and_citations() {
        let lookup = lookup(&["a", "b"]);
        let paragraphs = render("The sky [a].\nAlso [b][a].", &lookup);
        assert_eq!(
            paragraphs,
            vec![
                vec![
                    Segment::Text("The sky ".into()),
                    Segment::Citation(1),
                    Segment::Text(".".into())
                ],
                vec![
                    Segment::Text("Also ".into()),
                    Segment::Citation(2),
                    Segment::Citation(1),
                    Segment::Text(".".into())
                ],
            ]
        );
    }

    #[test]
    fn test_unresolved_marker_renders_literally() {
        let lookup = lookup(&["a"]);
        let paragraphs = render("x [z] y [a]", &lookup);
        assert_eq!(
            paragraphs,
            vec![vec![Segment::Text("x [z] y ".into()), Segment::Citation(1)]]
        );
    }

    #[test]
    fn test_markdown_links() {
        let lookup = lookup(&["a"]);
        let md = to_markdown(&render("Sky [a]", &lookup), &lookup);
        assert_eq!(md, "Sky [\\[1\\]](<https://example.com/a>)");
    }

    #[test]
    fn test_citation_url_falls_back_to_search() {
        let citation = Citation {
            key: "a".into(),
            display_index: 1,
            source: SourceCitation {
                title: "AI risk & you".into(),
                ..Default::default()
            },
        };
        let url = citation_url(&citation);
        assert!(url.starts_with("https://duckduckgo.com/?q="));
        assert!(url.contains("AI+risk+%26+you"));
    }

    #[test]
    fn test_format_citation() {
        let citation = Citation {
            key: "a".into(),
            display_index: 3,
            source: SourceCitation {
                title: "Sky Paper".into(),
                authors: vec!["A. One".into(), "B. Two".into()],
                date: Some("2021-05-01".into()),
                url: Some("https://sky".into()),
                ..Default::default()
            },
        };
        assert_eq!(
            format_citation(&citation),
            "**[3]** [Sky Paper](<https://sky>) - A. One, B. Two - 2021-05-01"
        );
    }

    #[test]
    fn test_format_source_lists_every_number() {
        let source = SourceCitation {
            title: "Sky Paper".into(),
            url: Some("https://sky".into()),
            ..Default::default()
        };
        assert_eq!(format_source(&[1, 4], &source), "**[1, 4]** [Sky Paper](<https://sky>)");
    }

    #[test]
    fn test_loading_messages() {
        assert_eq!(loading_message(&Phase::Semantic), "Loading: Performing semantic search...");
        assert_eq!(
            loading_message(&Phase::Other("moderation".into())),
            "Loading: moderation..."
        );
    }
}
