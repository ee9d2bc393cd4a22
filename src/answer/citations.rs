use std::collections::HashMap;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Deserializer, Serialize};

/// A canonical citation marker, `[k]` with `k` letters or digits.
pub static MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([a-z]+|[0-9]+)\]").expect("invalid marker regex"));

/// A source document as the backend describes it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceCitation {
    #[serde(default)]
    pub title: String,
    #[serde(default, alias = "author", deserialize_with = "one_or_many")]
    pub authors: Vec<String>,
    #[serde(default, alias = "date_published")]
    pub date: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// The excerpt the model was shown.
    #[serde(default, rename = "text")]
    pub source_text: Option<String>,
    /// The token the model uses to cite this source.
    #[serde(default, alias = "referenceKey", deserialize_with = "reference_key")]
    pub reference: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<Option<String>>),
}

fn one_or_many<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<String>, D::Error> {
    Ok(match Option::<OneOrMany>::deserialize(de)? {
        None => Vec::new(),
        Some(OneOrMany::One(author)) => vec![author],
        Some(OneOrMany::Many(authors)) => authors.into_iter().flatten().collect(),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum KeyRepr {
    Text(String),
    Number(u64),
}

fn reference_key<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<KeyRepr>::deserialize(de)?.map(|key| match key {
        KeyRepr::Text(text) => text,
        KeyRepr::Number(n) => n.to_string(),
    }))
}

/// A source that has been cited in an answer, with its display number.
#[derive(Debug, Clone, PartialEq)]
pub struct Citation {
    pub key: String,
    pub display_index: usize,
    pub source: SourceCitation,
}

/// How a marker token is matched against the source pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyScheme {
    /// `[k]` names the source whose `reference` is `k`.
    #[default]
    Explicit,
    /// `[k]` is an index into the pool: `a` is the first source, and so is `1`.
    Positional,
}

impl KeyScheme {
    pub fn find<'a>(&self, key: &str, pool: &'a [SourceCitation]) -> Option<&'a SourceCitation> {
        match self {
            KeyScheme::Explicit => pool.iter().find(|c| c.reference.as_deref() == Some(key)),
            KeyScheme::Positional => positional_index(key).and_then(|i| pool.get(i)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyScheme::Explicit => "explicit",
            KeyScheme::Positional => "positional",
        }
    }
}

impl FromStr for KeyScheme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "explicit" | "key" => Ok(KeyScheme::Explicit),
            "positional" | "index" => Ok(KeyScheme::Positional),
            other => anyhow::bail!("unknown citation key scheme '{}'", other),
        }
    }
}

/// Letters count bijectively from `a` = 0 (`z` = 25, `aa` = 26); digits from `1` = 0.
fn positional_index(key: &str) -> Option<usize> {
    if key.bytes().all(|b| b.is_ascii_digit()) {
        return key.parse::<usize>().ok()?.checked_sub(1);
    }
    key.bytes()
        .try_fold(0usize, |acc, b| {
            if !b.is_ascii_lowercase() {
                return None;
            }
            acc.checked_mul(26)?.checked_add((b - b'a') as usize + 1)
        })?
        .checked_sub(1)
}

/// Insertion-ordered map from marker key to citation.
///
/// Display indices are dense: the first key gets `base + 1`, the next
/// `base + 2`, and an index is never reassigned once given out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CitationLookup {
    base: usize,
    entries: Vec<Citation>,
    by_key: HashMap<String, usize>,
}

impl CitationLookup {
    pub fn with_base(base: usize) -> Self {
        Self {
            base,
            ..Self::default()
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Citation> {
        self.by_key.get(key).map(|&i| &self.entries[i])
    }

    pub fn by_display_index(&self, index: usize) -> Option<&Citation> {
        index
            .checked_sub(self.base + 1)
            .and_then(|i| self.entries.get(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Citation> {
        self.entries.iter()
    }

    /// The index the next new key would receive.
    pub fn next_index(&self) -> usize {
        self.base + self.entries.len() + 1
    }

    fn insert(&mut self, key: &str, source: SourceCitation) -> usize {
        let display_index = self.next_index();
        self.by_key.insert(key.to_string(), self.entries.len());
        self.entries.push(Citation {
            key: key.to_string(),
            display_index,
            source,
        });
        display_index
    }

    /// Scan `normalized` left to right and give every new, resolvable marker
    /// the next display index. Returns how many keys were added.
    ///
    /// Markers with no matching source are skipped; they stay literal text.
    pub fn resolve(&mut self, normalized: &str, pool: &[SourceCitation], scheme: KeyScheme) -> usize {
        let mut added = 0;
        for caps in MARKER.captures_iter(normalized) {
            let key = &caps[1];
            if self.by_key.contains_key(key) {
                continue;
            }
            if let Some(source) = scheme.find(key, pool) {
                self.insert(key, source.clone());
                added += 1;
            }
        }
        added
    }

    /// Replace each resolved `[k]` with `[display_index]`.
    pub fn renumber(&self, normalized: &str) -> String {
        MARKER
            .replace_all(normalized, |caps: &Captures| match self.get(&caps[1]) {
                Some(citation) => format!("[{}]", citation.display_index),
                None => caps[0].to_string(),
            })
            .into_owned()
    }

    pub fn into_citations(self) -> Vec<Citation> {
        self.entries
    }
}

/// The older entry shape: a bare citations array plus a separately derived
/// `key -> zero-based index` map (the index already includes the base).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LegacyCitations {
    #[serde(default)]
    pub citations: Vec<SourceCitation>,
    #[serde(default, rename = "citationsMap")]
    pub cite_map: HashMap<String, usize>,
    #[serde(default)]
    pub base_count: usize,
}

impl LegacyCitations {
    /// Collapse both maps into one lookup, inserting keys in the order their
    /// old indices were handed out.
    pub fn into_lookup(self, scheme: KeyScheme) -> CitationLookup {
        let mut order: Vec<(String, usize)> = self.cite_map.into_iter().collect();
        order.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let mut lookup = CitationLookup::with_base(self.base_count);
        for (key, _) in order {
            if let Some(source) = scheme.find(&key, &self.citations) {
                lookup.insert(&key, source.clone());
            }
        }
        lookup
    }
}
