use crate::types::{ArtifactId, CandidateId, SessionId};

/// Every failure the feedback engine reports to its caller.
///
/// None of these are fatal to the process. `TranscriptionFailed` and
/// `SessionBusy` leave all session state untouched, so the same call can be
/// retried as is.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Artifact {0} could not be loaded")]
    InvalidArtifact(ArtifactId),
    #[error("Artifact source failed: {0}")]
    Artifact(String),
    #[error("Artifact {artifact_id} already has an active session {session_id}")]
    ActiveSessionExists {
        artifact_id: ArtifactId,
        session_id: SessionId,
    },
    #[error("Session {0} not found")]
    SessionNotFound(SessionId),
    #[error("Session {0} is not active")]
    SessionNotActive(SessionId),
    #[error("Session {0} already has an interviewer call in flight")]
    SessionBusy(SessionId),
    #[error("Session {0} is not completed")]
    SessionNotCompleted(SessionId),
    #[error("Session {0} has already been confirmed")]
    AlreadyConfirmed(SessionId),
    #[error("Reviewer turn is empty")]
    EmptyTurn,
    #[error("Transcription failed: {0}")]
    TranscriptionFailed(String),
    #[error("Interviewer failed: {0}")]
    Interviewer(String),
    #[error("Invalid decision set: {0}")]
    InvalidDecisionSet(String),
    #[error("Candidate {0} not found")]
    CandidateNotFound(CandidateId),
    #[error("Candidate {0} is no longer pending")]
    CandidateFrozen(CandidateId),
    #[error("Span [{start}, {end}) is invalid for a text of {len} characters")]
    InvalidSpan { start: usize, end: usize, len: usize },
}

pub type EngineResult<T> = Result<T, EngineError>;
