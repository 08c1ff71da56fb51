pub mod artifact;
pub mod conversation;
pub mod error;
pub mod extraction;
pub mod interviewer;
pub mod live;
pub mod reconciler;
pub mod scripted;
pub mod session;
pub mod span;
pub mod transcription;
pub mod types;

pub use artifact::{Artifact, ArtifactSource, InMemoryArtifacts};
pub use error::{EngineError, EngineResult};
pub use extraction::{
    CandidateDraft, ConfidencePolicy, ConfirmationStatus, ExtractionCandidate, ExtractionPatch,
    ExtractionSummary, FeedbackType,
};
pub use interviewer::{Interviewer, InterviewerClient, InterviewerResponse};
pub use live::{LiveEvent, LiveSummary, pump_live_events, spawn_live_pump};
pub use reconciler::{CandidateDecision, Decision, MaterializedFeedback, MaterializedInlineComment};
pub use scripted::ScriptedInterviewer;
pub use session::{EngineConfig, ReviewerInput, SessionEngine, SessionSnapshot, TurnOutcome};
pub use span::{MatchMethod, Span, SpanLocator, SpanResolution};
pub use transcription::{OfflineTranscriber, Transcriber, WhisperTranscriber};
pub use types::{ArtifactId, AudioReference, Role, Session, SessionId, SessionStatus, Turn};
