use crate::error::{EngineError, EngineResult};
use crate::extraction::{
    ConfidencePolicy, ConfirmationStatus, ExtractionCandidate, ExtractionPatch, FeedbackType,
    apply_patch,
};
use crate::span::SpanLocator;
use crate::types::{ArtifactId, CandidateId, Session, SessionId, SessionStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Confirm,
    Reject,
}

/// The reviewer's verdict on one candidate, with optional corrections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateDecision {
    pub candidate_id: CandidateId,
    pub decision: Decision,
    pub content: Option<String>,
    pub highlighted_text: Option<String>,
}

impl CandidateDecision {
    pub fn confirm(candidate_id: CandidateId) -> Self {
        Self {
            candidate_id,
            decision: Decision::Confirm,
            content: None,
            highlighted_text: None,
        }
    }

    pub fn reject(candidate_id: CandidateId) -> Self {
        Self {
            decision: Decision::Reject,
            ..Self::confirm(candidate_id)
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_highlight(mut self, text: impl Into<String>) -> Self {
        self.highlighted_text = Some(text.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializedInlineComment {
    pub candidate_id: CandidateId,
    /// The artifact text at `[start_offset, end_offset)`.
    pub highlighted_text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub comment: String,
}

/// Reviewer-approved feedback, ready for the revision pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaterializedFeedback {
    pub session_id: Option<SessionId>,
    pub artifact_id: Option<ArtifactId>,
    pub inline_comments: Vec<MaterializedInlineComment>,
    /// Confirmed inline comments that could not be anchored to the text.
    pub unanchored_comments: Vec<String>,
    pub overall: Option<String>,
    pub rating: Option<u8>,
    pub guide_suggestions: Vec<String>,
    pub confirmed: usize,
    pub rejected: usize,
}

impl MaterializedFeedback {
    /// Overall feedback with unanchored comments and suggested guide rules
    /// appended, the way the revision step reads it.
    pub fn revision_notes(&self) -> String {
        let mut notes = self.overall.clone().unwrap_or_default();
        let appendices = [
            ("Additional Comments", &self.unanchored_comments),
            ("Suggested Guide Rules", &self.guide_suggestions),
        ];
        for (title, items) in appendices {
            if items.is_empty() {
                continue;
            }
            if !notes.is_empty() {
                notes.push_str("\n\n");
            }
            notes.push_str(title);
            notes.push(':');
            for item in items {
                notes.push_str("\n- ");
                notes.push_str(item);
            }
        }
        notes
    }
}

/// Reads a rating from text such as `"4"` or `"Rating: 4/5"`: the first
/// integer in the text, if it is between 1 and 5.
///
/// A negative or fractional number (`"-3"`, `"3.7"`) is not a rating.
pub fn parse_rating(content: &str) -> Option<u8> {
    let chars: Vec<char> = content.chars().collect();
    let start = chars.iter().position(|c| c.is_ascii_digit())?;
    let end = chars[start..]
        .iter()
        .position(|c| !c.is_ascii_digit())
        .map_or(chars.len(), |len| start + len);

    if start > 0 && chars[start - 1] == '-' {
        return None;
    }
    let fractional = chars.get(end) == Some(&'.')
        && chars.get(end + 1).is_some_and(|c| c.is_ascii_digit());
    if fractional {
        return None;
    }

    let digits: String = chars[start..end].iter().collect();
    digits.parse::<u8>().ok().filter(|r| (1..=5).contains(r))
}

/// Applies `decisions` to every candidate of a completed session and folds
/// the confirmed ones into a `MaterializedFeedback`.
///
/// `candidates` must be the session's candidates in creation order. Anything
/// without a decision is rejected. All decisions are validated before any
/// candidate changes, so a failure leaves every candidate as it was.
pub fn reconcile(
    session: &Session,
    artifact_text: &str,
    candidates: &mut [&mut ExtractionCandidate],
    decisions: &[CandidateDecision],
    policy: ConfidencePolicy,
) -> EngineResult<MaterializedFeedback> {
    if session.status != SessionStatus::Completed {
        return Err(EngineError::SessionNotCompleted(session.id));
    }

    let mut by_id: HashMap<CandidateId, &CandidateDecision> = HashMap::new();
    for decision in decisions {
        if by_id.insert(decision.candidate_id, decision).is_some() {
            return Err(EngineError::InvalidDecisionSet(format!(
                "candidate {} is listed more than once",
                decision.candidate_id
            )));
        }
        if !candidates.iter().any(|c| c.id == decision.candidate_id) {
            return Err(EngineError::InvalidDecisionSet(format!(
                "candidate {} does not belong to session {}",
                decision.candidate_id, session.id
            )));
        }
    }
    if let Some(frozen) = candidates.iter().find(|c| !c.is_pending()) {
        return Err(EngineError::CandidateFrozen(frozen.id));
    }

    // Stage every change on copies first.
    let locator = SpanLocator::new(artifact_text);
    let mut staged = Vec::with_capacity(candidates.len());
    for candidate in candidates.iter() {
        let mut next = (**candidate).clone();
        match by_id.get(&candidate.id) {
            Some(decision) if decision.decision == Decision::Confirm => {
                let patch = ExtractionPatch {
                    content: decision.content.clone(),
                    highlighted_text: decision.highlighted_text.clone(),
                    span: None,
                };
                apply_patch(&mut next, patch, &locator, policy)?;
                next.status = ConfirmationStatus::Confirmed;
            }
            _ => next.status = ConfirmationStatus::Rejected,
        }
        staged.push(next);
    }

    for (slot, next) in candidates.iter_mut().zip(staged) {
        **slot = next;
    }

    let mut feedback = MaterializedFeedback {
        session_id: Some(session.id),
        artifact_id: Some(session.artifact_id.clone()),
        ..Default::default()
    };
    let mut overall_parts = Vec::new();

    for candidate in candidates.iter() {
        if candidate.status != ConfirmationStatus::Confirmed {
            feedback.rejected += 1;
            continue;
        }
        feedback.confirmed += 1;

        match candidate.feedback_type {
            FeedbackType::InlineComment => match (candidate.span, &candidate.resolved_text) {
                (Some(span), Some(text)) => {
                    feedback.inline_comments.push(MaterializedInlineComment {
                        candidate_id: candidate.id,
                        highlighted_text: text.clone(),
                        start_offset: span.start,
                        end_offset: span.end,
                        comment: candidate.content.clone(),
                    })
                }
                _ => feedback.unanchored_comments.push(candidate.content.clone()),
            },
            FeedbackType::Overall => overall_parts.push(candidate.content.clone()),
            FeedbackType::GuideSuggestion => {
                feedback.guide_suggestions.push(candidate.content.clone())
            }
            FeedbackType::Rating => match parse_rating(&candidate.content) {
                Some(rating) => feedback.rating = Some(rating),
                None => tracing::warn!(
                    candidate_id = %candidate.id,
                    content = %candidate.content,
                    "Dropping rating that is not an integer from 1 to 5"
                ),
            },
        }
    }

    if !overall_parts.is_empty() {
        feedback.overall = Some(overall_parts.join("\n\n"));
    }

    tracing::info!(
        session_id = %session.id,
        confirmed = feedback.confirmed,
        rejected = feedback.rejected,
        "Feedback reconciled"
    );
    Ok(feedback)
}
