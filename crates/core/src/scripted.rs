use crate::extraction::{CandidateDraft, FeedbackType};
use crate::interviewer::{Interviewer, InterviewerResponse, opening_greeting};
use crate::types::{Role, Turn};
use anyhow::Result;
use async_trait::async_trait;

const COMPLETION_SIGNALS: [&str; 8] = [
    "that's all",
    "i'm done",
    "nothing else",
    "that's it",
    "all done",
    "finished",
    "no more",
    "that's everything",
];

const INLINE_CUES: [&str; 5] = ["line", "phrase", "word", "part", "section"];
const OVERALL_CUES: [&str; 4] = ["overall", "general", "whole", "entire"];
const GUIDE_CUES: [&str; 5] = ["never", "don't", "avoid", "rule", "should"];

const LATER_QUESTIONS: [&str; 4] = [
    "Is there anything else about this poem that concerns you?",
    "How would you rate this poem overall on a scale of 1-5?",
    "Any other thoughts or suggestions?",
    "What would you say is the main thing that needs improvement?",
];

fn mentions_any(text: &str, cues: &[&str]) -> bool {
    cues.iter().any(|cue| text.contains(cue))
}

fn preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Finds the first rating digit (1 to 5) mentioned in a message.
fn spoken_rating(text: &str) -> Option<u32> {
    text.chars()
        .filter_map(|c| c.to_digit(10))
        .find(|d| (1..=5).contains(d))
}

/// A deterministic interviewer that needs no model.
///
/// It follows a fixed script keyed on how many times the reviewer has spoken
/// and on a few cue words, so the whole engine can run offline.
#[derive(Debug, Default, Clone)]
pub struct ScriptedInterviewer;

impl ScriptedInterviewer {
    fn reply_to(&self, artifact_text: &str, message: &str, reviewer_turns: usize) -> InterviewerResponse {
        let lower = message.to_lowercase();
        let lines: Vec<&str> = artifact_text.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut candidates = Vec::new();

        match reviewer_turns {
            1 => {
                if let Some(first) = lines.first().filter(|_| mentions_any(&lower, &INLINE_CUES)) {
                    candidates.push(
                        CandidateDraft::new(
                            FeedbackType::InlineComment,
                            format!("Reviewer mentioned: {}", preview(message, 50)),
                        )
                        .with_highlight(*first)
                        .with_confidence(0.7),
                    );
                }
                if mentions_any(&lower, &OVERALL_CUES) {
                    candidates.push(
                        CandidateDraft::new(
                            FeedbackType::Overall,
                            format!("Overall observation: {}", preview(message, 100)),
                        )
                        .with_confidence(0.8),
                    );
                }
                InterviewerResponse {
                    next_question: Some(
                        "That's helpful! Which parts of the poem stood out to you? Are there specific words or phrases that don't work?"
                            .to_string(),
                    ),
                    candidates,
                    is_complete: false,
                }
            }
            2 => {
                if let Some(second) = lines
                    .get(1)
                    .filter(|_| lower.contains("line") || lower.contains("word"))
                {
                    candidates.push(
                        CandidateDraft::new(
                            FeedbackType::InlineComment,
                            format!("Issue with this section: {}", preview(message, 50)),
                        )
                        .with_highlight(*second)
                        .with_confidence(0.75),
                    );
                }
                if mentions_any(&lower, &GUIDE_CUES) {
                    candidates.push(
                        CandidateDraft::new(
                            FeedbackType::GuideSuggestion,
                            format!("Suggested rule: {}", preview(message, 80)),
                        )
                        .with_confidence(0.8),
                    );
                }
                InterviewerResponse {
                    next_question: Some(
                        "Good points. Are there any rules you think should be added to the poetry guide to prevent similar issues?"
                            .to_string(),
                    ),
                    candidates,
                    is_complete: false,
                }
            }
            n => {
                if let Some(rating) = spoken_rating(message) {
                    candidates.push(
                        CandidateDraft::new(FeedbackType::Rating, format!("Rating: {rating}/5"))
                            .with_confidence(0.9),
                    );
                }
                if mentions_any(&lower, &COMPLETION_SIGNALS) {
                    return InterviewerResponse {
                        next_question: Some(
                            "Thank you for your feedback! I've captured everything you mentioned. You can now review the summary and confirm which items to include."
                                .to_string(),
                        ),
                        candidates,
                        is_complete: true,
                    };
                }
                let idx = n.saturating_sub(3).min(LATER_QUESTIONS.len() - 1);
                InterviewerResponse {
                    next_question: Some(LATER_QUESTIONS[idx].to_string()),
                    candidates,
                    is_complete: false,
                }
            }
        }
    }
}

#[async_trait]
impl Interviewer for ScriptedInterviewer {
    async fn respond(
        &self,
        artifact_text: &str,
        _guide_text: &str,
        history: &[Turn],
    ) -> Result<InterviewerResponse> {
        let reviewer_turns = history.iter().filter(|t| t.role == Role::Reviewer).count();
        let Some(last) = history.iter().rev().find(|t| t.role == Role::Reviewer) else {
            return Ok(InterviewerResponse::question(opening_greeting(artifact_text)));
        };
        Ok(self.reply_to(artifact_text, &last.content, reviewer_turns))
    }

    async fn extract_all(
        &self,
        artifact_text: &str,
        _guide_text: &str,
        history: &[Turn],
    ) -> Result<Vec<CandidateDraft>> {
        // Replay the script over every reviewer turn and keep what it finds.
        let mut drafts = Vec::new();
        let reviewer_turns = history.iter().filter(|t| t.role == Role::Reviewer);
        for (idx, turn) in reviewer_turns.enumerate() {
            drafts.extend(self.reply_to(artifact_text, &turn.content, idx + 1).candidates);
        }
        Ok(drafts)
    }
}
