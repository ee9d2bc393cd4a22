use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::citations::SourceCitation;
use super::decoder::StreamError;

/// Most follow-up questions offered after an answer.
pub const MAX_FOLLOWUPS: usize = 4;

/// Who authored a conversation turn, as the backend's history expects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Error,
    Deleted,
}

/// Where an answer is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Started,
    Semantic,
    History,
    Context,
    Prompt,
    Llm,
    Streaming,
    Followups,
    Done,
    Error,
    /// A loading phase the client has no special handling for.
    Other(String),
}

impl Phase {
    pub fn from_wire(name: &str) -> Self {
        match name {
            "started" => Phase::Started,
            "semantic" => Phase::Semantic,
            "history" | "checking history" => Phase::History,
            "context" => Phase::Context,
            "prompt" => Phase::Prompt,
            "llm" => Phase::Llm,
            "streaming" => Phase::Streaming,
            "followups" => Phase::Followups,
            "done" => Phase::Done,
            "error" => Phase::Error,
            other => Phase::Other(other.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Error)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Started => "started",
            Phase::Semantic => "semantic",
            Phase::History => "history",
            Phase::Context => "context",
            Phase::Prompt => "prompt",
            Phase::Llm => "llm",
            Phase::Streaming => "streaming",
            Phase::Followups => "followups",
            Phase::Done => "done",
            Phase::Error => "error",
            Phase::Other(name) => name,
        };
        f.write_str(name)
    }
}

/// A suggested next question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Followup {
    pub text: String,
    #[serde(rename = "pageid")]
    pub page_reference: String,
    #[serde(default)]
    pub score: f64,
}

/// Merge fresh follow-ups ahead of older ones.
///
/// Drops anything pointing at `answered`, keeps the first occurrence of each
/// page, and caps the result at [`MAX_FOLLOWUPS`].
pub fn merge_followups(fresh: Vec<Followup>, older: &[Followup], answered: Option<&str>) -> Vec<Followup> {
    let mut merged: Vec<Followup> = Vec::with_capacity(MAX_FOLLOWUPS);
    for followup in fresh.into_iter().chain(older.iter().cloned()) {
        if merged.len() == MAX_FOLLOWUPS {
            break;
        }
        if Some(followup.page_reference.as_str()) == answered
            || merged.iter().any(|f| f.page_reference == followup.page_reference)
        {
            continue;
        }
        merged.push(followup);
    }
    merged
}

/// One decoded unit of the answer stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Loading {
        phase: Option<Phase>,
        citations: Option<Vec<SourceCitation>>,
    },
    Citations(Vec<SourceCitation>),
    Content(String),
    /// Diagnostic prompt metadata, kept as raw JSON.
    Prompt(Value),
    Followups(Vec<Followup>),
    /// Older backends attach follow-ups to `done` as `followup_N` keys.
    Done { followups: Vec<Followup> },
    Error(String),
    /// A `state` this client does not act on (`thinking`, `enrich`, ...).
    Unrecognized(String),
}

impl StreamEvent {
    /// Parse one flushed frame.
    pub fn parse(frame: &str) -> Result<Self, StreamError> {
        let mut value: Value =
            serde_json::from_str(frame).map_err(|source| StreamError::MalformedFrame {
                frame: preview(frame),
                source,
            })?;
        let state = value
            .get("state")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or(StreamError::MissingState)?;

        let event = match state.as_str() {
            "loading" => StreamEvent::Loading {
                phase: field::<String>(&mut value, &state, "phase")?.map(|p| Phase::from_wire(&p)),
                citations: field(&mut value, &state, "citations")?,
            },
            "citations" => {
                StreamEvent::Citations(field(&mut value, &state, "citations")?.unwrap_or_default())
            }
            "streaming" => StreamEvent::Content(required(&mut value, &state, "content")?),
            "prompt" => {
                if let Value::Object(map) = &mut value {
                    map.remove("state");
                }
                StreamEvent::Prompt(value)
            }
            "followups" => {
                StreamEvent::Followups(field(&mut value, &state, "followups")?.unwrap_or_default())
            }
            "done" => StreamEvent::Done {
                followups: legacy_followups(&mut value, &state)?,
            },
            "error" => StreamEvent::Error(
                field::<String>(&mut value, &state, "error")?
                    .unwrap_or_else(|| "unknown error".to_string()),
            ),
            _ => StreamEvent::Unrecognized(state),
        };
        Ok(event)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error(_))
    }
}

fn field<T: DeserializeOwned>(
    value: &mut Value,
    state: &str,
    name: &'static str,
) -> Result<Option<T>, StreamError> {
    match value.get_mut(name).map(Value::take) {
        None | Some(Value::Null) => Ok(None),
        Some(raw) => serde_json::from_value(raw)
            .map(Some)
            .map_err(|source| StreamError::InvalidEvent {
                state: state.to_string(),
                field: name,
                source,
            }),
    }
}

fn required<T: DeserializeOwned>(value: &mut Value, state: &str, name: &'static str) -> Result<T, StreamError> {
    field(value, state, name)?.ok_or_else(|| StreamError::MissingField {
        state: state.to_string(),
        field: name,
    })
}

/// Collect `followup_0`, `followup_1`, ... in numeric order.
fn legacy_followups(value: &mut Value, state: &str) -> Result<Vec<Followup>, StreamError> {
    let Value::Object(map) = value else {
        return Ok(Vec::new());
    };
    let mut numbered = Vec::new();
    for (key, raw) in map.iter_mut() {
        let Some(n) = key.strip_prefix("followup_") else {
            continue;
        };
        let followup: Followup =
            serde_json::from_value(raw.take()).map_err(|source| StreamError::InvalidEvent {
                state: state.to_string(),
                field: "followup_*",
                source,
            })?;
        numbered.push((n.parse::<usize>().unwrap_or(usize::MAX), followup));
    }
    numbered.sort_by_key(|(n, _)| *n);
    Ok(numbered.into_iter().map(|(_, f)| f).collect())
}

fn preview(frame: &str) -> String {
    const MAX: usize = 200;
    if frame.len() <= MAX {
        return frame.to_string();
    }
    let mut end = MAX;
    while !frame.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &frame[..end])
}
