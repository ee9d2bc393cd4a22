use serde_json::Value;
use tracing::{debug, info, warn};

use super::citations::{CitationLookup, KeyScheme, SourceCitation};
use super::decoder::StreamError;
use super::events::{merge_followups, Followup, Phase, Role, StreamEvent};
use super::normalize::IncrementalNormalizer;

/// Why an answer ended without completing.
#[derive(Debug, Clone, PartialEq)]
pub enum Failure {
    /// The caller cancelled the stream. Never shown as an error.
    Aborted,
    /// The backend sent an `error` event.
    Upstream(String),
    /// The stream could not be read or decoded.
    Stream(String),
}

impl Failure {
    /// The user-visible message, if this failure should be shown at all.
    pub fn message(&self) -> Option<&str> {
        match self {
            Failure::Aborted => None,
            Failure::Upstream(msg) | Failure::Stream(msg) => Some(msg),
        }
    }
}

/// The evolving answer to one question.
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerState {
    pub role: Role,
    /// Display text: normalized, with resolved markers renumbered.
    pub content: String,
    /// Normalized text with the model's own marker keys.
    pub normalized: String,
    pub citations: CitationLookup,
    pub phase: Phase,
    pub followups: Vec<Followup>,
    pub prompt_info: Option<Value>,
    pub failure: Option<Failure>,
}

impl AnswerState {
    fn new(base: usize) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            normalized: String::new(),
            citations: CitationLookup::with_base(base),
            phase: Phase::Started,
            followups: Vec::new(),
            prompt_info: None,
            failure: None,
        }
    }
}

/// A completed answer, ready to become a conversation entry.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedAnswer {
    pub content: String,
    pub normalized: String,
    pub citations: CitationLookup,
    pub followups: Vec<Followup>,
    pub prompt_info: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Answered(FinishedAnswer),
    Failed(String),
    Aborted,
}

/// Folds stream events into an [`AnswerState`], one at a time.
pub struct Accumulator {
    state: AnswerState,
    sources: Vec<SourceCitation>,
    normalizer: IncrementalNormalizer,
    scheme: KeyScheme,
    /// Offset into the normalized text from which markers still need a scan.
    scan_from: usize,
}

impl Accumulator {
    /// Start a fresh answer whose citations are numbered after `base`.
    pub fn new(base: usize, scheme: KeyScheme) -> Self {
        Self {
            state: AnswerState::new(base),
            sources: Vec::new(),
            normalizer: IncrementalNormalizer::new(),
            scheme,
            scan_from: 0,
        }
    }

    pub fn state(&self) -> &AnswerState {
        &self.state
    }

    #[cfg(test)]
    pub fn sources(&self) -> &[SourceCitation] {
        &self.sources
    }

    pub fn is_finished(&self) -> bool {
        self.state.phase.is_terminal()
    }

    /// Apply one event. Returns false if the event changed nothing, which is
    /// always the case once the answer is finished.
    pub fn apply(&mut self, event: StreamEvent) -> bool {
        if self.is_finished() {
            debug!(phase = %self.state.phase, "dropping event after terminal state");
            return false;
        }
        match event {
            StreamEvent::Loading { phase, citations } => {
                if let Some(citations) = citations {
                    self.adopt_sources(citations);
                }
                // Only `done` and `error` events end an answer.
                match phase {
                    Some(phase) if phase.is_terminal() => {
                        debug!(phase = %phase, "ignoring terminal phase in loading event");
                    }
                    Some(phase) => self.state.phase = phase,
                    None => {}
                }
            }
            StreamEvent::Citations(citations) => self.adopt_sources(citations),
            StreamEvent::Content(delta) => {
                self.normalizer.push(&delta);
                self.refresh();
                self.state.phase = Phase::Streaming;
            }
            StreamEvent::Prompt(info) => self.state.prompt_info = Some(info),
            StreamEvent::Followups(followups) => {
                self.state.followups = merge_followups(followups, &[], None);
                self.state.phase = Phase::Followups;
            }
            StreamEvent::Done { followups } => {
                if self.state.followups.is_empty() {
                    self.state.followups = merge_followups(followups, &[], None);
                }
                self.state.phase = Phase::Done;
                info!(
                    content_len = self.state.content.len(),
                    citations = self.state.citations.len(),
                    followups = self.state.followups.len(),
                    "answer complete"
                );
            }
            StreamEvent::Error(message) => self.fail(Failure::Upstream(message)),
            StreamEvent::Unrecognized(state) => {
                debug!(state = %state, "ignoring unrecognized stream event");
                return false;
            }
        }
        true
    }

    /// Fold a decode or transport failure into the error state.
    pub fn fail_stream(&mut self, err: &StreamError) {
        if !self.is_finished() {
            self.fail(Failure::Stream(err.to_string()));
        }
    }

    /// Cancel the answer. Any partial content is dropped.
    pub fn abort(&mut self) {
        if !self.is_finished() {
            self.fail(Failure::Aborted);
        }
    }

    pub fn finish(self) -> Outcome {
        let state = self.state;
        match (state.phase, state.failure) {
            (_, Some(Failure::Aborted)) => Outcome::Aborted,
            (_, Some(failure)) => Outcome::Failed(failure.message().unwrap_or("unknown error").to_string()),
            (Phase::Done, None) => Outcome::Answered(FinishedAnswer {
                content: state.content,
                normalized: state.normalized,
                citations: state.citations,
                followups: state.followups,
                prompt_info: state.prompt_info,
            }),
            (phase, None) => {
                warn!(%phase, "stream ended before the answer completed");
                Outcome::Failed("stream ended before the answer completed".to_string())
            }
        }
    }

    fn adopt_sources(&mut self, citations: Vec<SourceCitation>) {
        let before = self.sources.len();
        for citation in citations {
            if !self.sources.contains(&citation) {
                self.sources.push(citation);
            }
        }
        if self.sources.len() != before {
            debug!(sources = self.sources.len(), "citation pool updated");
            // earlier unresolved markers may resolve against the new sources
            self.scan_from = 0;
            if !self.normalizer.raw().is_empty() {
                self.refresh();
            }
        }
    }

    /// Renormalize, resolve any new markers, and rebuild the display text.
    fn refresh(&mut self) {
        let normalized = self.normalizer.text();
        let added = self.state.citations.resolve(
            &normalized[self.scan_from..],
            &self.sources,
            self.scheme,
        );
        if added > 0 {
            debug!(added, total = self.state.citations.len(), "citations resolved");
        }
        self.scan_from = self.normalizer.settled_len();
        self.state.content = self.state.citations.renumber(&normalized);
        self.state.normalized = normalized;
    }

    fn fail(&mut self, failure: Failure) {
        match &failure {
            Failure::Aborted => info!(phase = %self.state.phase, "answer aborted"),
            Failure::Upstream(msg) | Failure::Stream(msg) => {
                warn!(phase = %self.state.phase, error = %msg, "answer failed")
            }
        }
        let base = self.state.citations.base();
        self.state.content.clear();
        self.state.normalized.clear();
        self.state.citations = CitationLookup::with_base(base);
        self.state.phase = Phase::Error;
        self.state.failure = Some(failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(key: &str, title: &str) -> SourceCitation {
        SourceCitation {
            title: title.to_string(),
            reference: Some(key.to_string()),
            ..Default::default()
        }
    }

    fn content(text: &str) -> StreamEvent {
        StreamEvent::Content(text.to_string())
    }

    fn done() -> StreamEvent {
        StreamEvent::Done { followups: vec![] }
    }

    #[test]
    fn test_end_to_end_fold() {
        let mut acc = Accumulator::new(0, KeyScheme::Explicit);
        acc.apply(StreamEvent::Loading {
            phase: Some(Phase::Semantic),
            citations: None,
        });
        acc.apply(StreamEvent::Citations(vec![
            source("a", "Sky Paper"),
            source("b", "Also Paper"),
        ]));
        acc.apply(content("The sky is blue [a]."));
        assert_eq!(acc.state().phase, Phase::Streaming);
        acc.apply(content(" Also [b]."));
        acc.apply(done());

        let Outcome::Answered(answer) = acc.finish() else {
            panic!("expected an answer");
        };
        assert_eq!(answer.content, "The sky is blue [1]. Also [2].");
        assert_eq!(answer.normalized, "The sky is blue [a]. Also [b].");
        assert_eq!(answer.citations.get("a").unwrap().display_index, 1);
        assert_eq!(answer.citations.get("a").unwrap().source.title, "Sky Paper");
        assert_eq!(answer.citations.get("b").unwrap().display_index, 2);
    }

    #[test]
    fn test_loading_cannot_end_the_answer() {
        let mut acc = Accumulator::new(0, KeyScheme::Explicit);
        acc.apply(content("Half an"));
        for name in ["done", "error"] {
            acc.apply(StreamEvent::Loading {
                phase: Some(Phase::from_wire(name)),
                citations: None,
            });
            assert!(!acc.is_finished());
            assert_eq!(acc.state().phase, Phase::Streaming);
        }
        acc.apply(content(" answer."));
        acc.apply(done());
        let Outcome::Answered(answer) = acc.finish() else {
            panic!("expected an answer");
        };
        assert_eq!(answer.content, "Half an answer.");
    }

    #[test]
    fn test_loading_done_then_eof_is_a_failure() {
        let mut acc = Accumulator::new(0, KeyScheme::Explicit);
        acc.apply(content("partial"));
        acc.apply(StreamEvent::Loading {
            phase: Some(Phase::Done),
            citations: None,
        });
        assert!(matches!(acc.finish(), Outcome::Failed(_)));
    }

    #[test]
    fn test_marker_straddling_deltas() {
        let mut acc = Accumulator::new(0, KeyScheme::Explicit);
        acc.apply(StreamEvent::Citations(vec![source("a", "A"), source("b", "B")]));
        acc.apply(content("Both [b,"));
        assert_eq!(acc.state().content, "Both [b,");
        acc.apply(content(" a] agree."));
        assert_eq!(acc.state().content, "Both [1][2] agree.");
        assert_eq!(acc.state().citations.get("b").unwrap().display_index, 1);
    }

    #[test]
    fn test_base_offset_carries_over() {
        let mut acc = Accumulator::new(5, KeyScheme::Explicit);
        acc.apply(StreamEvent::Citations(vec![source("a", "A")]));
        acc.apply(content("See [a]."));
        assert_eq!(acc.state().content, "See [6].");
    }

    #[test]
    fn test_loading_event_citations_are_adopted() {
        let mut acc = Accumulator::new(0, KeyScheme::Explicit);
        acc.apply(StreamEvent::Loading {
            phase: Some(Phase::Prompt),
            citations: Some(vec![source("a", "A")]),
        });
        assert_eq!(acc.state().phase, Phase::Prompt);
        assert_eq!(acc.sources().len(), 1);
    }

    #[test]
    fn test_late_citations_resolve_earlier_markers() {
        let mut acc = Accumulator::new(0, KeyScheme::Explicit);
        acc.apply(content("Early [a] claim."));
        assert_eq!(acc.state().content, "Early [a] claim.");
        assert!(acc.state().citations.is_empty());

        acc.apply(StreamEvent::Citations(vec![source("a", "A")]));
        assert_eq!(acc.state().content, "Early [1] claim.");

        // resending the same pool does not disturb existing numbers
        acc.apply(StreamEvent::Citations(vec![source("a", "A")]));
        assert_eq!(acc.sources().len(), 1);
        assert_eq!(acc.state().citations.get("a").unwrap().display_index, 1);
    }

    #[test]
    fn test_unresolved_marker_stays_literal() {
        let mut acc = Accumulator::new(0, KeyScheme::Explicit);
        acc.apply(StreamEvent::Citations(vec![source("a", "A")]));
        acc.apply(content("[z] and [a]"));
        assert_eq!(acc.state().content, "[z] and [1]");
    }

    #[test]
    fn test_upstream_error_discards_content() {
        let mut acc = Accumulator::new(0, KeyScheme::Explicit);
        acc.apply(content("partial"));
        acc.apply(StreamEvent::Error("model overloaded".into()));
        assert_eq!(acc.state().phase, Phase::Error);
        assert!(acc.state().content.is_empty());
        assert!(!acc.apply(content("more")));
        assert_eq!(acc.finish(), Outcome::Failed("model overloaded".into()));
    }

    #[test]
    fn test_abort_after_delta() {
        let mut acc = Accumulator::new(0, KeyScheme::Explicit);
        acc.apply(content("The sky"));
        acc.abort();
        assert_eq!(acc.state().phase, Phase::Error);
        assert_eq!(acc.state().failure, Some(Failure::Aborted));
        assert!(acc.state().content.is_empty());
        assert!(!acc.apply(done()));
        assert_eq!(acc.finish(), Outcome::Aborted);
    }

    #[test]
    fn test_abort_after_done_keeps_answer() {
        let mut acc = Accumulator::new(0, KeyScheme::Explicit);
        acc.apply(content("ok"));
        acc.apply(done());
        acc.abort();
        assert!(matches!(acc.finish(), Outcome::Answered(_)));
    }

    #[test]
    fn test_stream_failure() {
        let mut acc = Accumulator::new(0, KeyScheme::Explicit);
        acc.fail_stream(&StreamError::Status(502));
        assert_eq!(acc.finish(), Outcome::Failed("POST Error: 502".into()));
    }

    #[test]
    fn test_ending_without_done_is_a_failure() {
        let mut acc = Accumulator::new(0, KeyScheme::Explicit);
        acc.apply(content("half an ans"));
        assert!(matches!(acc.finish(), Outcome::Failed(_)));
    }

    #[test]
    fn test_followups_and_prompt_info() {
        let followup = Followup {
            text: "Next?".into(),
            page_reference: "42".into(),
            score: 0.7,
        };
        let mut acc = Accumulator::new(0, KeyScheme::Explicit);
        acc.apply(StreamEvent::Prompt(serde_json::json!({"promptedHistory": []})));
        assert_eq!(acc.state().phase, Phase::Started);
        acc.apply(content("answer"));
        acc.apply(StreamEvent::Followups(vec![followup.clone()]));
        assert_eq!(acc.state().phase, Phase::Followups);
        acc.apply(StreamEvent::Done {
            followups: vec![Followup {
                page_reference: "legacy".into(),
                ..followup.clone()
            }],
        });

        let Outcome::Answered(answer) = acc.finish() else {
            panic!("expected an answer");
        };
        assert_eq!(answer.followups, vec![followup]);
        assert!(answer.prompt_info.is_some());
    }

    #[test]
    fn test_unrecognized_event_is_ignored() {
        let mut acc = Accumulator::new(0, KeyScheme::Explicit);
        assert!(!acc.apply(StreamEvent::Unrecognized("thinking".into())));
        assert_eq!(acc.state().phase, Phase::Started);
    }
}
