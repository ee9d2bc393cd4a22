pub mod types;

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::answer::{merge_followups, FinishedAnswer, Followup, Role};

use types::{AuthoredAnswer, BibliographyEntry, Entry, EntryKind, HistoryMessage, SessionId};

/// One channel's conversation.
pub struct ChatSession {
    pub id: SessionId,
    entries: Vec<Entry>,
    followups: Vec<Followup>,
    active: Option<(u64, CancellationToken)>,
    generation: u64,
}

impl ChatSession {
    pub fn new(channel_id: u64) -> Self {
        let seed = format!("{}:{}", channel_id, Utc::now().timestamp_nanos_opt().unwrap_or_default());
        Self {
            id: blake3::hash(seed.as_bytes()).to_hex().to_string(),
            entries: Vec::new(),
            followups: Vec::new(),
            active: None,
            generation: 0,
        }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn followups(&self) -> &[Followup] {
        &self.followups
    }

    /// Where the next answer's citation numbering starts.
    pub fn base_index(&self) -> usize {
        self.entries
            .iter()
            .filter_map(|e| match &e.kind {
                EntryKind::Assistant { citations, base } => Some(base + citations.len()),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    /// The history to send along with `query`.
    pub fn make_history(&self, query: &str) -> Vec<HistoryMessage> {
        self.entries
            .iter()
            .filter_map(|entry| {
                entry.history_role().map(|role| HistoryMessage {
                    role,
                    content: entry.content.trim().to_string(),
                })
            })
            .chain(std::iter::once(HistoryMessage {
                role: Role::User,
                content: query.to_string(),
            }))
            .collect()
    }

    /// Start a new stream, cancelling whichever one was running.
    pub fn begin(&mut self) -> (u64, CancellationToken) {
        self.cancel();
        self.generation += 1;
        let token = CancellationToken::new();
        self.active = Some((self.generation, token.clone()));
        self.followups.clear();
        (self.generation, token)
    }

    /// Cancel the running stream. Returns false if nothing was running.
    pub fn cancel(&mut self) -> bool {
        match self.active.take() {
            Some((generation, token)) => {
                debug!(session = %self.id, generation, "cancelling active stream");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Mark the stream started by `begin` as no longer running.
    pub fn end(&mut self, generation: u64) {
        if matches!(self.active, Some((g, _)) if g == generation) {
            self.active = None;
        }
    }

    /// Record a finished answer. The entry keeps the model's own marker keys;
    /// display numbers come from its citations.
    pub fn record_answer(&mut self, query: &str, answer: FinishedAnswer) {
        let base = answer.citations.base();
        self.entries.push(Entry::new(EntryKind::User, query));
        self.entries.push(Entry::new(
            EntryKind::Assistant {
                citations: answer.citations.into_citations(),
                base,
            },
            answer.normalized,
        ));
        self.followups = answer.followups;
    }

    pub fn record_error(&mut self, query: &str, message: &str) {
        self.entries.push(Entry::new(EntryKind::User, query));
        self.entries.push(Entry::new(EntryKind::Error, message));
    }

    /// Record a human-written answer; its related questions go ahead of the
    /// older follow-ups.
    pub fn record_authored(&mut self, question: &str, answer: AuthoredAnswer) {
        self.entries.push(Entry::new(EntryKind::User, question));
        self.entries.push(Entry::new(
            EntryKind::Authored { url: answer.url },
            answer.content,
        ));
        self.followups = merge_followups(answer.related, &self.followups, Some(&answer.page_reference));
    }

    /// Every source cited in this session, one per distinct `title + url`,
    /// in order of first appearance, with every number it was shown under.
    pub fn bibliography(&self) -> Vec<BibliographyEntry> {
        let mut positions: HashMap<(String, String), usize> = HashMap::new();
        let mut out: Vec<BibliographyEntry> = Vec::new();
        let cited = self.entries.iter().filter_map(|e| match &e.kind {
            EntryKind::Assistant { citations, .. } => Some(citations),
            _ => None,
        });
        for citation in cited.flatten() {
            let key = (
                citation.source.title.clone(),
                citation.source.url.clone().unwrap_or_default(),
            );
            match positions.get(&key) {
                Some(&i) => out[i].indices.push(citation.display_index),
                None => {
                    positions.insert(key, out.len());
                    out.push(BibliographyEntry {
                        indices: vec![citation.display_index],
                        source: citation.source.clone(),
                    });
                }
            }
        }
        out
    }

    /// Remove the latest exchange. Returns the question that was removed, if
    /// the last entry was an answer; otherwise the last entry is only marked
    /// deleted.
    pub fn undo(&mut self) -> Option<String> {
        let last = self.entries.last()?;
        if !matches!(last.kind, EntryKind::User) && self.entries.len() >= 2 {
            if let Some(answer) = self.entries.pop() {
                debug!(session = %self.id, created_at = %answer.created_at, "removing last exchange");
            }
            let question = self.entries.pop().map(|e| e.content);
            self.followups.clear();
            return question;
        }
        if let Some(last) = self.entries.last_mut() {
            last.deleted = true;
        }
        None
    }

    pub fn clear(&mut self) {
        self.cancel();
        self.entries.clear();
        self.followups.clear();
    }
}

/// In-memory sessions keyed by channel id.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<u64, ChatSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` on the channel's session, creating it on first use.
    pub async fn with_session<R>(&self, channel_id: u64, f: impl FnOnce(&mut ChatSession) -> R) -> R {
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(channel_id).or_insert_with(|| {
            let session = ChatSession::new(channel_id);
            info!(channel_id, session = %session.id, "new chat session");
            session
        });
        f(session)
    }

    /// Run `f` on the channel's session without creating one.
    pub async fn read<R>(&self, channel_id: u64, f: impl FnOnce(Option<&ChatSession>) -> R) -> R {
        let sessions = self.sessions.read().await;
        f(sessions.get(&channel_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::answer::citations::SourceCitation;
    use crate::answer::events::StreamEvent;
    use crate::answer::{Accumulator, KeyScheme, Outcome};

    fn answer(base: usize, text: &str, sources: Vec<SourceCitation>) -> FinishedAnswer {
        let mut acc = Accumulator::new(base, KeyScheme::Explicit);
        acc.apply(StreamEvent::Citations(sources));
        acc.apply(StreamEvent::Content(text.to_string()));
        acc.apply(StreamEvent::Done { followups: vec![] });
        match acc.finish() {
            Outcome::Answered(answer) => answer,
            other => panic!("expected an answer, got {:?}", other),
        }
    }

    fn source(key: &str, title: &str, url: &str) -> SourceCitation {
        SourceCitation {
            title: title.to_string(),
            url: Some(url.to_string()),
            reference: Some(key.to_string()),
            ..Default::default()
        }
    }

    fn followup(page: &str) -> Followup {
        Followup {
            text: format!("q{}", page),
            page_reference: page.to_string(),
            score: 0.0,
        }
    }

    #[test]
    fn test_session_id_is_blake3_hex() {
        let session = ChatSession::new(42);
        assert_eq!(session.id.len(), 64);
        assert!(session.id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_base_index_runs_across_answers() {
        let mut session = ChatSession::new(1);
        assert_eq!(session.base_index(), 0);
        session.record_answer(
            "first?",
            answer(0, "x [a] [b]", vec![source("a", "A", "u1"), source("b", "B", "u2")]),
        );
        assert_eq!(session.base_index(), 2);

        let second = answer(session.base_index(), "y [a]", vec![source("a", "C", "u3")]);
        assert_eq!(second.content, "y [3]");
        session.record_answer("second?", second);
        assert_eq!(session.base_index(), 3);
    }

    #[test]
    fn test_history_roles() {
        let mut session = ChatSession::new(1);
        session.record_error("broken?", "POST Error: 500");
        session.record_answer("real?", answer(0, "  yes  ", vec![]));
        session.record_authored(
            "authored?",
            AuthoredAnswer {
                page_reference: "7".into(),
                title: "T".into(),
                content: "human text".into(),
                url: "https://aisafety.info/?state=7".into(),
                related: vec![],
            },
        );

        let history = session.make_history("next?");
        let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                Role::User,
                Role::User,
                Role::Assistant,
                Role::User,
                Role::Assistant,
                Role::User
            ]
        );
        assert_eq!(history[2].content, "yes");
        assert_eq!(history.last().unwrap().content, "next?");
        assert_eq!(
            serde_json::to_value(&history[0]).unwrap(),
            serde_json::json!({"role": "user", "content": "broken?"})
        );
    }

    #[test]
    fn test_deleted_entries_keep_their_slot() {
        let mut session = ChatSession::new(1);
        session.record_answer("q", answer(0, "a", vec![]));
        session.entries.push(Entry::new(EntryKind::User, "dangling"));
        assert_eq!(session.undo(), None);
        let history = session.make_history("next");
        assert_eq!(history[2].role, Role::Deleted);
    }

    #[test]
    fn test_undo_removes_last_exchange() {
        let mut session = ChatSession::new(1);
        session.record_answer("q1", answer(0, "a1", vec![]));
        session.record_error("q2", "boom");
        assert_eq!(session.undo().as_deref(), Some("q2"));
        assert_eq!(session.entries().len(), 2);
    }

    #[test]
    fn test_begin_cancels_previous_stream() {
        let mut session = ChatSession::new(1);
        let (first_gen, first) = session.begin();
        let (second_gen, second) = session.begin();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        session.end(first_gen);
        assert!(session.cancel(), "a stale end must not clear the newer stream");
        assert!(second.is_cancelled());
        session.end(second_gen);
        assert!(!session.cancel());
    }

    #[test]
    fn test_authored_followups_merge() {
        let mut session = ChatSession::new(1);
        session.followups = vec![followup("1"), followup("2"), followup("3")];
        session.record_authored(
            "q2",
            AuthoredAnswer {
                page_reference: "2".into(),
                title: "two".into(),
                content: "text".into(),
                url: "u".into(),
                related: vec![followup("5"), followup("3"), followup("6")],
            },
        );
        let pages: Vec<&str> = session.followups().iter().map(|f| f.page_reference.as_str()).collect();
        assert_eq!(pages, vec!["5", "3", "6", "1"]);
    }

    #[test]
    fn test_bibliography_collapses_repeated_sources() {
        let mut session = ChatSession::new(1);
        session.record_answer("q1", answer(0, "[a]", vec![source("a", "Sky", "https://sky")]));
        session.record_answer(
            "q2",
            answer(1, "[a] [b]", vec![source("a", "Sky", "https://sky"), source("b", "Sea", "https://sea")]),
        );
        let bib = session.bibliography();
        let shown: Vec<(Vec<usize>, &str)> = bib
            .iter()
            .map(|e| (e.indices.clone(), e.source.title.as_str()))
            .collect();
        assert_eq!(shown, vec![(vec![1, 2], "Sky"), (vec![3], "Sea")]);
    }

    #[test]
    fn test_history_keeps_model_marker_keys() {
        let mut session = ChatSession::new(1);
        let blue = answer(4, "Blue [a].", vec![source("a", "Sky", "https://sky")]);
        assert_eq!(blue.content, "Blue [5].");
        session.record_answer("why blue?", blue);

        let history = session.make_history("and red?");
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].content, "Blue [a].");
        assert_eq!(session.base_index(), 5);
    }

    #[tokio::test]
    async fn test_store_creates_sessions_per_channel() {
        let store = SessionStore::new();
        let first = store.with_session(1, |s| s.id.clone()).await;
        let again = store.with_session(1, |s| s.id.clone()).await;
        let other = store.with_session(2, |s| s.id.clone()).await;
        assert_eq!(first, again);
        assert_ne!(first, other);
        assert!(store.read(3, |s| s.is_none()).await);
    }
}
