use crate::error::{EngineError, EngineResult};
use crate::span::{Span, SpanLocator};
use crate::types::{CandidateId, SessionId, TurnId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackType {
    InlineComment,
    Overall,
    GuideSuggestion,
    Rating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationStatus {
    Pending,
    Confirmed,
    Rejected,
}

/// A feedback item as proposed by the interviewer, before the engine has
/// assigned it an id or anchored it to the artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateDraft {
    pub feedback_type: FeedbackType,
    pub content: String,
    pub highlighted_text: Option<String>,
    pub start_offset: Option<usize>,
    pub end_offset: Option<usize>,
    pub confidence: Option<f32>,
}

impl CandidateDraft {
    pub fn new(feedback_type: FeedbackType, content: impl Into<String>) -> Self {
        Self {
            feedback_type,
            content: content.into(),
            highlighted_text: None,
            start_offset: None,
            end_offset: None,
            confidence: None,
        }
    }

    pub fn with_highlight(mut self, text: impl Into<String>) -> Self {
        self.highlighted_text = Some(text.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionCandidate {
    pub id: CandidateId,
    pub session_id: SessionId,
    /// The interviewer turn that produced this item, if any.
    pub turn_id: Option<TurnId>,
    pub feedback_type: FeedbackType,
    pub content: String,
    /// The fragment as the reviewer phrased it.
    pub highlighted_text: Option<String>,
    pub span: Option<Span>,
    /// The artifact text at `span`, i.e. what is actually highlighted.
    pub resolved_text: Option<String>,
    pub confidence: f32,
    pub status: ConfirmationStatus,
    pub created_at: DateTime<Utc>,
}

impl ExtractionCandidate {
    pub fn is_pending(&self) -> bool {
        self.status == ConfirmationStatus::Pending
    }
}

/// Replacement values for a pending candidate. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionPatch {
    pub content: Option<String>,
    pub highlighted_text: Option<String>,
    pub span: Option<Span>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidencePolicy {
    /// Used when the interviewer gives no confidence.
    pub default_confidence: f32,
    /// Lower bound after halving the confidence of an unanchored comment.
    pub unresolved_floor: f32,
}

impl Default for ConfidencePolicy {
    fn default() -> Self {
        Self {
            default_confidence: 0.8,
            unresolved_floor: 0.05,
        }
    }
}

impl ConfidencePolicy {
    /// Confidence of an inline comment that lost its anchor.
    pub fn unanchored(&self, confidence: f32) -> f32 {
        (confidence / 2.0).max(self.unresolved_floor)
    }
}

/// Brings a confidence into `[0, 1]`. Whole numbers from 2 to 100 are read
/// as percentages; anything else outside the range is clamped.
pub fn normalize_confidence(raw: f32) -> Option<f32> {
    if !raw.is_finite() {
        return None;
    }
    let is_percentage = raw > 1.0 && raw <= 100.0 && raw.fract() == 0.0;
    let value = if is_percentage { raw / 100.0 } else { raw };
    Some(value.clamp(0.0, 1.0))
}

struct Anchoring {
    highlighted_text: Option<String>,
    span: Option<Span>,
    resolved_text: Option<String>,
}

fn anchor_draft(draft: &CandidateDraft, locator: &SpanLocator, anchor: Option<usize>) -> Anchoring {
    let highlighted = draft
        .highlighted_text
        .as_ref()
        .filter(|h| !h.trim().is_empty())
        .cloned();

    if let Some(fragment) = highlighted {
        let resolution = locator.locate(&fragment, anchor);
        return Anchoring {
            highlighted_text: Some(fragment),
            span: resolution.span,
            resolved_text: resolution.matched_text,
        };
    }

    // No quote: fall back on the offsets the interviewer computed itself.
    if let (Some(start), Some(end)) = (draft.start_offset, draft.end_offset) {
        let span = Span::new(start, end);
        if span.validate(locator.len()).is_ok() {
            let text = locator.slice(span);
            return Anchoring {
                highlighted_text: Some(text.clone()),
                span: Some(span),
                resolved_text: Some(text),
            };
        }
    }

    Anchoring {
        highlighted_text: None,
        span: None,
        resolved_text: None,
    }
}

/// Holds every extraction candidate, in creation order.
#[derive(Debug, Default)]
pub struct ExtractionStore {
    candidates: Vec<ExtractionCandidate>,
    policy: ConfidencePolicy,
}

impl ExtractionStore {
    pub fn new(policy: ConfidencePolicy) -> Self {
        Self {
            candidates: Vec::new(),
            policy,
        }
    }

    /// Stores a draft as a new pending candidate.
    ///
    /// Inline comments are anchored with `locator`; one that cannot be
    /// anchored is still kept, with its confidence halved.
    pub fn add(
        &mut self,
        session_id: SessionId,
        turn_id: Option<TurnId>,
        draft: CandidateDraft,
        locator: &SpanLocator,
        anchor: Option<usize>,
    ) -> ExtractionCandidate {
        let mut confidence = draft
            .confidence
            .and_then(normalize_confidence)
            .unwrap_or(self.policy.default_confidence);

        let anchoring = if draft.feedback_type == FeedbackType::InlineComment {
            let anchoring = anchor_draft(&draft, locator, anchor);
            if anchoring.span.is_none() {
                confidence = self.policy.unanchored(confidence);
                tracing::debug!(
                    session_id = %session_id,
                    highlighted = ?anchoring.highlighted_text,
                    "Inline comment could not be anchored to the artifact"
                );
            }
            anchoring
        } else {
            Anchoring {
                highlighted_text: None,
                span: None,
                resolved_text: None,
            }
        };

        let candidate = ExtractionCandidate {
            id: CandidateId::new(),
            session_id,
            turn_id,
            feedback_type: draft.feedback_type,
            content: draft.content,
            highlighted_text: anchoring.highlighted_text,
            span: anchoring.span,
            resolved_text: anchoring.resolved_text,
            confidence,
            status: ConfirmationStatus::Pending,
            created_at: Utc::now(),
        };
        self.candidates.push(candidate.clone());
        candidate
    }

    pub fn policy(&self) -> ConfidencePolicy {
        self.policy
    }

    pub fn get(&self, id: CandidateId) -> Option<&ExtractionCandidate> {
        self.candidates.iter().find(|c| c.id == id)
    }

    /// Applies `patch` to a pending candidate.
    ///
    /// An explicit span is validated against the artifact; a new highlighted
    /// text is re-anchored with `locator`. Highlight changes only apply to
    /// inline comments.
    pub fn edit(
        &mut self,
        id: CandidateId,
        patch: ExtractionPatch,
        locator: &SpanLocator,
    ) -> EngineResult<ExtractionCandidate> {
        let candidate = self
            .candidates
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(EngineError::CandidateNotFound(id))?;
        if !candidate.is_pending() {
            return Err(EngineError::CandidateFrozen(id));
        }
        apply_patch(candidate, patch, locator, self.policy)?;
        Ok(candidate.clone())
    }

    pub fn list_by_session(&self, session_id: SessionId) -> Vec<ExtractionCandidate> {
        self.candidates
            .iter()
            .filter(|c| c.session_id == session_id)
            .cloned()
            .collect()
    }

    pub(crate) fn session_mut(&mut self, session_id: SessionId) -> Vec<&mut ExtractionCandidate> {
        self.candidates
            .iter_mut()
            .filter(|c| c.session_id == session_id)
            .collect()
    }

    /// Candidates of a session grouped by type, for summary rendering.
    pub fn summary(&self, session_id: SessionId) -> ExtractionSummary {
        ExtractionSummary::from_candidates(&self.list_by_session(session_id))
    }
}

/// Validates `patch` completely before touching `candidate`.
///
/// A new highlight that no longer resolves costs the candidate confidence
/// the same way an unanchored comment does when it is first stored.
pub(crate) fn apply_patch(
    candidate: &mut ExtractionCandidate,
    patch: ExtractionPatch,
    locator: &SpanLocator,
    policy: ConfidencePolicy,
) -> EngineResult<()> {
    let is_inline = candidate.feedback_type == FeedbackType::InlineComment;

    if let Some(span) = patch.span.filter(|_| is_inline) {
        span.validate(locator.len())?;
        let text = locator.slice(span);
        candidate.highlighted_text = Some(patch.highlighted_text.unwrap_or_else(|| text.clone()));
        candidate.span = Some(span);
        candidate.resolved_text = Some(text);
    } else if let Some(fragment) = patch.highlighted_text.filter(|_| is_inline) {
        let anchor = candidate.span.map(|s| s.start);
        let resolution = locator.locate(&fragment, anchor);
        if candidate.span.is_some() && resolution.span.is_none() {
            candidate.confidence = policy.unanchored(candidate.confidence);
        }
        candidate.highlighted_text = Some(fragment);
        candidate.span = resolution.span;
        candidate.resolved_text = resolution.matched_text;
    }

    if let Some(content) = patch.content {
        candidate.content = content;
    }
    Ok(())
}

/// Read-side grouping of a session's candidates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionSummary {
    pub inline_comments: Vec<ExtractionCandidate>,
    pub overall: Vec<ExtractionCandidate>,
    pub guide_suggestions: Vec<ExtractionCandidate>,
    pub ratings: Vec<ExtractionCandidate>,
}

impl ExtractionSummary {
    pub fn from_candidates(candidates: &[ExtractionCandidate]) -> Self {
        let mut summary = Self::default();
        for candidate in candidates {
            let bucket = match candidate.feedback_type {
                FeedbackType::InlineComment => &mut summary.inline_comments,
                FeedbackType::Overall => &mut summary.overall,
                FeedbackType::GuideSuggestion => &mut summary.guide_suggestions,
                FeedbackType::Rating => &mut summary.ratings,
            };
            bucket.push(candidate.clone());
        }
        summary
    }

    pub fn is_empty(&self) -> bool {
        self.inline_comments.is_empty()
            && self.overall.is_empty()
            && self.guide_suggestions.is_empty()
            && self.ratings.is_empty()
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::from("## Feedback Summary\n\n");

        if !self.inline_comments.is_empty() {
            out.push_str(&format!(
                "### Inline Comments ({})\n",
                self.inline_comments.len()
            ));
            for item in &self.inline_comments {
                let quoted = item
                    .resolved_text
                    .as_deref()
                    .or(item.highlighted_text.as_deref())
                    .unwrap_or("N/A");
                out.push_str(&format!("- On \"{quoted}\": {}\n", item.content));
            }
            out.push('\n');
        }

        let sections = [
            ("Overall Observations", &self.overall),
            ("Guide Suggestions", &self.guide_suggestions),
        ];
        for (title, items) in sections {
            if items.is_empty() {
                continue;
            }
            out.push_str(&format!("### {title} ({})\n", items.len()));
            for item in items {
                out.push_str(&format!("- {}\n", item.content));
            }
            out.push('\n');
        }

        if !self.ratings.is_empty() {
            out.push_str("### Rating\n");
            for item in &self.ratings {
                out.push_str(&format!("- {}\n", item.content));
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POEM: &str = "The moment passed quietly.\nAnd the river kept its song.";

    fn store() -> ExtractionStore {
        ExtractionStore::new(ConfidencePolicy::default())
    }

    #[test]
    fn add_applies_defaults_and_anchors_inline_comments() {
        let locator = SpanLocator::new(POEM);
        let mut store = store();
        let session = SessionId::new();

        let inline = store.add(
            session,
            None,
            CandidateDraft::new(FeedbackType::InlineComment, "Too abrupt").with_highlight("the moment"),
            &locator,
            None,
        );
        assert_eq!(inline.status, ConfirmationStatus::Pending);
        assert_eq!(inline.confidence, 0.8);
        assert_eq!(inline.span, Some(Span::new(0, 10)));
        assert_eq!(inline.resolved_text.as_deref(), Some("The moment"));
        assert_eq!(inline.highlighted_text.as_deref(), Some("the moment"));

        let overall = store.add(
            session,
            None,
            CandidateDraft::new(FeedbackType::Overall, "Lovely imagery").with_confidence(90.0),
            &locator,
            None,
        );
        assert_eq!(overall.confidence, 0.9);
        assert!(overall.span.is_none());
        assert_eq!(store.list_by_session(session).len(), 2);
        assert!(store.list_by_session(SessionId::new()).is_empty());
    }

    #[test]
    fn unanchored_inline_comment_is_kept_with_reduced_confidence() {
        let locator = SpanLocator::new(POEM);
        let mut store = store();

        let c = store.add(
            SessionId::new(),
            None,
            CandidateDraft::new(FeedbackType::InlineComment, "Cut this")
                .with_highlight("a burning sky")
                .with_confidence(0.6),
            &locator,
            None,
        );
        assert!(c.span.is_none());
        assert!((c.confidence - 0.3).abs() < f32::EPSILON);

        let low = store.add(
            SessionId::new(),
            None,
            CandidateDraft::new(FeedbackType::InlineComment, "Hmm").with_confidence(0.06),
            &locator,
            None,
        );
        assert_eq!(low.confidence, 0.05);
    }

    #[test]
    fn offsets_without_quote_are_used_when_valid() {
        let locator = SpanLocator::new(POEM);
        let mut store = store();
        let mut draft = CandidateDraft::new(FeedbackType::InlineComment, "Nice verb");
        draft.start_offset = Some(11);
        draft.end_offset = Some(17);

        let c = store.add(SessionId::new(), None, draft, &locator, None);
        assert_eq!(c.span, Some(Span::new(11, 17)));
        assert_eq!(c.resolved_text.as_deref(), Some("passed"));
    }

    #[test]
    fn edit_rejects_frozen_candidates_and_bad_spans() {
        let locator = SpanLocator::new(POEM);
        let mut store = store();
        let c = store.add(
            SessionId::new(),
            None,
            CandidateDraft::new(FeedbackType::InlineComment, "x").with_highlight("river"),
            &locator,
            None,
        );

        let err = store
            .edit(
                c.id,
                ExtractionPatch {
                    span: Some(Span::new(5, 500)),
                    ..Default::default()
                },
                &locator,
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidSpan { .. }));
        // Failed edit leaves the candidate untouched.
        assert_eq!(store.get(c.id).unwrap().resolved_text.as_deref(), Some("river"));

        let edited = store
            .edit(
                c.id,
                ExtractionPatch {
                    content: Some("Lovely".into()),
                    highlighted_text: Some("kept its song".into()),
                    span: None,
                },
                &locator,
            )
            .unwrap();
        assert_eq!(edited.content, "Lovely");
        assert_eq!(edited.resolved_text.as_deref(), Some("kept its song"));

        store.session_mut(c.session_id)[0].status = ConfirmationStatus::Confirmed;
        let err = store
            .edit(c.id, ExtractionPatch::default(), &locator)
            .unwrap_err();
        assert!(matches!(err, EngineError::CandidateFrozen(_)));
    }

    #[test]
    fn summary_groups_by_type() {
        let locator = SpanLocator::new(POEM);
        let mut store = store();
        let session = SessionId::new();
        for draft in [
            CandidateDraft::new(FeedbackType::Rating, "Rating: 4/5"),
            CandidateDraft::new(FeedbackType::InlineComment, "Flat").with_highlight("river"),
            CandidateDraft::new(FeedbackType::GuideSuggestion, "Avoid rivers"),
        ] {
            store.add(session, None, draft, &locator, None);
        }

        let summary = store.summary(session);
        assert_eq!(summary.inline_comments.len(), 1);
        assert_eq!(summary.ratings.len(), 1);
        assert!(summary.overall.is_empty());

        let md = summary.to_markdown();
        assert!(md.contains("### Inline Comments (1)\n- On \"river\": Flat"));
        assert!(md.contains("### Guide Suggestions (1)\n- Avoid rivers"));
        assert!(!md.contains("Overall Observations"));
        assert!(md.contains("### Rating\n- Rating: 4/5"));
    }

    #[test]
    fn confidence_normalization() {
        assert_eq!(normalize_confidence(0.4), Some(0.4));
        assert_eq!(normalize_confidence(75.0), Some(0.75));
        assert_eq!(normalize_confidence(-1.0), Some(0.0));
        assert_eq!(normalize_confidence(f32::NAN), None);
        assert_eq!(normalize_confidence(1.5), Some(1.0));
        assert_eq!(normalize_confidence(150.0), Some(1.0));
        assert_eq!(normalize_confidence(100.0), Some(1.0));
    }

    #[test]
    fn highlight_edit_that_loses_its_anchor_halves_confidence() {
        let locator = SpanLocator::new(POEM);
        let mut store = store();
        let c = store.add(
            SessionId::new(),
            None,
            CandidateDraft::new(FeedbackType::InlineComment, "Flat")
                .with_highlight("river")
                .with_confidence(0.6),
            &locator,
            None,
        );

        let lost = ExtractionPatch {
            highlighted_text: Some("a burning sky".into()),
            ..Default::default()
        };
        let edited = store.edit(c.id, lost.clone(), &locator).unwrap();
        assert!(edited.span.is_none());
        assert!((edited.confidence - 0.3).abs() < f32::EPSILON);

        // Already unanchored, so a second miss does not halve again.
        let again = store.edit(c.id, lost, &locator).unwrap();
        assert!((again.confidence - 0.3).abs() < f32::EPSILON);
    }
}
