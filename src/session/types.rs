use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::answer::citations::SourceCitation;
use crate::answer::{Citation, Followup, Role};

/// Session id: blake3 hex hash of the channel and the session start time.
pub type SessionId = String;

#[derive(Debug, Clone, PartialEq)]
pub enum EntryKind {
    User,
    Assistant {
        citations: Vec<Citation>,
        /// Number of citations shown before this answer.
        base: usize,
    },
    Error,
    /// Human-written content fetched for a follow-up question.
    Authored { url: String },
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub kind: EntryKind,
    pub content: String,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl Entry {
    pub fn new(kind: EntryKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            deleted: false,
            created_at: Utc::now(),
        }
    }

    /// The role this entry is sent to the backend as, if it is sent at all.
    pub fn history_role(&self) -> Option<Role> {
        match self.kind {
            EntryKind::Error => None,
            _ if self.deleted => Some(Role::Deleted),
            EntryKind::User => Some(Role::User),
            EntryKind::Assistant { .. } | EntryKind::Authored { .. } => Some(Role::Assistant),
        }
    }
}

/// A conversation turn as the backend expects it in `history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: Role,
    pub content: String,
}

/// A human-written answer from the content service.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthoredAnswer {
    pub page_reference: String,
    pub title: String,
    pub content: String,
    pub url: String,
    pub related: Vec<Followup>,
}

/// One distinct source in a session, with every number it was shown under.
#[derive(Debug, Clone, PartialEq)]
pub struct BibliographyEntry {
    pub indices: Vec<usize>,
    pub source: SourceCitation,
}
