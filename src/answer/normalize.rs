use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// `[a, b, c]` or `[1, 2]`: two or more bare tokens in one bracket.
static BARE_GROUP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[((?:(?:[a-z]+|[0-9]+),\s*)+(?:[a-z]+|[0-9]+))\]").expect("invalid group regex")
});

/// `[(a), (b)]`: two or more parenthesized tokens in one bracket.
static PAREN_GROUP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[((?:\((?:[a-z]+|[0-9]+)\),\s*)+\((?:[a-z]+|[0-9]+)\))\]")
        .expect("invalid paren group regex")
});

static PAREN_SINGLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\(([a-z]+|[0-9]+)\)\]").expect("invalid paren regex"));

static SPACED_SINGLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\s*([a-z]+|[0-9]+)\s*\]").expect("invalid spaced regex"));

/// Split the inside of a grouped bracket into one bracket per token.
fn split_group(caps: &Captures) -> String {
    caps[1]
        .split(',')
        .map(|token| format!("[{}]", token.trim()))
        .collect()
}

/// Rewrite citation markup into the canonical `[k]` form.
///
/// The model is not consistent about how it writes citations, so a known set
/// of variants is converged instead of rejected:
///
/// 1. `[a, b, c]` → `[a][b][c]` (and `[(a), (b)]` → `[(a)][(b)]`)
/// 2. `[(a)]` → `[a]`
/// 3. `[ a ]` → `[a]`
///
/// Each rule is a full pass over the text before the next one runs. Anything
/// else passes through untouched.
pub fn normalize(text: &str) -> String {
    let text = BARE_GROUP.replace_all(text, split_group);
    let text = PAREN_GROUP.replace_all(&text, split_group);
    let text = PAREN_SINGLE.replace_all(&text, "[$1]");
    let text = SPACED_SINGLE.replace_all(&text, "[$1]");
    text.into_owned()
}

/// Normalizes a growing text without re-normalizing its settled prefix.
///
/// Every rewrite matches a bracket span with no brackets inside it, so no
/// match can cross a position directly after a `]`. Everything up to the last
/// `]` is normalized once and cached; only the tail is redone per delta.
#[derive(Debug, Default, Clone)]
pub struct IncrementalNormalizer {
    raw: String,
    /// Byte offset into `raw` just past the last `]` seen.
    settled: usize,
    settled_text: String,
}

impl IncrementalNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: &str) {
        self.raw.push_str(delta);
        if let Some(pos) = self.raw[self.settled..].rfind(']') {
            let cut = self.settled + pos + 1;
            self.settled_text
                .push_str(&normalize(&self.raw[self.settled..cut]));
            self.settled = cut;
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Length of the normalized prefix that can no longer change.
    pub fn settled_len(&self) -> usize {
        self.settled_text.len()
    }

    /// The normalized form of everything pushed so far.
    pub fn text(&self) -> String {
        let mut out = String::with_capacity(self.raw.len());
        out.push_str(&self.settled_text);
        out.push_str(&normalize(&self.raw[self.settled..]));
        out
    }
}
