use crate::error::{EngineError, EngineResult};
use crate::extraction::ExtractionCandidate;
use crate::session::SessionEngine;
use crate::types::{Role, SessionId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const LIVE_CHANNEL_CAPACITY: usize = 64;

/// Events a live audio connection produces once speech has been transcribed.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    ReviewerSpeech(String),
    InterviewerSpeech(String),
    /// The transport reported a problem; the call goes on.
    Error(String),
    Closed,
}

/// What a finished live call left behind.
#[derive(Debug, Clone, Default)]
pub struct LiveSummary {
    pub turns_recorded: usize,
    pub candidates: Vec<ExtractionCandidate>,
}

/// Feeds live events into a session until the connection closes, then
/// completes the session and extracts feedback from the whole transcript.
///
/// A closed channel counts as `Closed`. Empty utterances are skipped. If the
/// session stops being active mid-call the pump stops with that error.
pub async fn pump_live_events(
    engine: Arc<SessionEngine>,
    session_id: SessionId,
    mut rx: mpsc::Receiver<LiveEvent>,
) -> EngineResult<LiveSummary> {
    let mut summary = LiveSummary::default();

    while let Some(event) = rx.recv().await {
        let (role, text) = match event {
            LiveEvent::ReviewerSpeech(text) => (Role::Reviewer, text),
            LiveEvent::InterviewerSpeech(text) => (Role::Interviewer, text),
            LiveEvent::Error(message) => {
                tracing::warn!(session_id = %session_id, "Live connection error: {}", message);
                continue;
            }
            LiveEvent::Closed => break,
        };

        match engine.record_live_turn(session_id, role, &text).await {
            Ok(turn) => {
                summary.turns_recorded += 1;
                tracing::debug!(session_id = %session_id, sequence = turn.sequence, role = ?role, "Live turn recorded");
            }
            Err(EngineError::EmptyTurn) => continue,
            Err(e) => return Err(e),
        }
    }

    tracing::info!(
        session_id = %session_id,
        turns = summary.turns_recorded,
        "Live call closed, extracting feedback"
    );
    if engine.session(session_id).await?.is_active() {
        engine.complete(session_id).await?;
    }
    summary.candidates = engine.extract_from_transcript(session_id).await?;
    Ok(summary)
}

/// Starts a pump on its own task and returns the sender the transport writes to.
pub fn spawn_live_pump(
    engine: Arc<SessionEngine>,
    session_id: SessionId,
) -> (mpsc::Sender<LiveEvent>, JoinHandle<EngineResult<LiveSummary>>) {
    let (tx, rx) = mpsc::channel(LIVE_CHANNEL_CAPACITY);
    let handle = tokio::spawn(pump_live_events(engine, session_id, rx));
    (tx, handle)
}
