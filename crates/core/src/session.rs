use crate::artifact::{Artifact, ArtifactSource};
use crate::conversation::ConversationLog;
use crate::error::{EngineError, EngineResult};
use crate::extraction::{
    CandidateDraft, ConfidencePolicy, ExtractionCandidate, ExtractionPatch, ExtractionStore,
    ExtractionSummary,
};
use crate::interviewer::{Interviewer, opening_greeting};
use crate::reconciler::{CandidateDecision, MaterializedFeedback, reconcile};
use crate::span::SpanLocator;
use crate::transcription::{MAX_AUDIO_BYTES, Transcriber};
use crate::types::{
    ArtifactId, AudioReference, CandidateId, Role, Session, SessionId, SessionStatus, Turn, TurnId,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Appended when the interviewer has no further question.
const CLOSING_REMARK: &str =
    "Thank you, I have everything I need. You can now review the feedback I captured.";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub policy: ConfidencePolicy,
    /// Reject `start` while the artifact already has an active session.
    pub enforce_single_active: bool,
    pub max_audio_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy: ConfidencePolicy::default(),
            enforce_single_active: true,
            max_audio_bytes: MAX_AUDIO_BYTES,
        }
    }
}

/// What the reviewer said: typed text, or a recording to transcribe first.
#[derive(Debug, Clone)]
pub enum ReviewerInput {
    Text(String),
    Audio {
        bytes: Vec<u8>,
        reference: AudioReference,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub reviewer_turn: Turn,
    pub interviewer_turn: Turn,
    pub new_candidates: Vec<ExtractionCandidate>,
    /// The session after the turn; `Completed` if the interviewer ended it.
    pub session: Session,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session: Session,
    pub turns: Vec<Turn>,
    pub candidates: Vec<ExtractionCandidate>,
}

struct SessionEntry {
    session: Session,
    artifact: Arc<Artifact>,
    guide: String,
    log: ConversationLog,
    /// Held for the duration of every interviewer call on this session.
    gate: Arc<Mutex<()>>,
    /// Start offset of the most recently anchored inline comment.
    last_anchor: Option<usize>,
    feedback: Option<MaterializedFeedback>,
}

impl SessionEntry {
    fn claim(&self) -> EngineResult<OwnedMutexGuard<()>> {
        self.gate
            .clone()
            .try_lock_owned()
            .map_err(|_| EngineError::SessionBusy(self.session.id))
    }

    fn ensure_active(&self) -> EngineResult<()> {
        if self.session.is_active() {
            Ok(())
        } else {
            Err(EngineError::SessionNotActive(self.session.id))
        }
    }

    /// Anchors and stores `drafts`, then remembers where the last one landed.
    fn record_drafts(
        &mut self,
        store: &mut ExtractionStore,
        turn_id: Option<TurnId>,
        drafts: Vec<CandidateDraft>,
        anchor: Option<usize>,
    ) -> Vec<ExtractionCandidate> {
        let artifact = Arc::clone(&self.artifact);
        let locator = SpanLocator::new(&artifact.text);
        let added: Vec<ExtractionCandidate> = drafts
            .into_iter()
            .map(|draft| store.add(self.session.id, turn_id, draft, &locator, anchor))
            .collect();
        if let Some(span) = added.iter().rev().find_map(|c| c.span) {
            self.last_anchor = Some(span.start);
        }
        added
    }

    fn mark_completed(&mut self) {
        self.session.status = SessionStatus::Completed;
        self.session.completed_at = Some(Utc::now());
    }
}

struct EngineState {
    sessions: HashMap<SessionId, SessionEntry>,
    store: ExtractionStore,
}

fn lookup(
    sessions: &mut HashMap<SessionId, SessionEntry>,
    session_id: SessionId,
) -> EngineResult<&mut SessionEntry> {
    sessions
        .get_mut(&session_id)
        .ok_or(EngineError::SessionNotFound(session_id))
}

/// Drives feedback sessions from start to confirmation.
///
/// All bookkeeping sits behind one short-lived lock that is never held across
/// a call to the interviewer or the transcriber. Each session additionally
/// has a gate that is held for the whole of its in-flight interviewer call,
/// so a second call on the same session fails with `SessionBusy` while other
/// sessions proceed in parallel.
pub struct SessionEngine {
    interviewer: Arc<dyn Interviewer>,
    transcriber: Arc<dyn Transcriber>,
    artifacts: Arc<dyn ArtifactSource>,
    config: EngineConfig,
    state: Mutex<EngineState>,
}

impl SessionEngine {
    pub fn new(
        interviewer: Arc<dyn Interviewer>,
        transcriber: Arc<dyn Transcriber>,
        artifacts: Arc<dyn ArtifactSource>,
        config: EngineConfig,
    ) -> Self {
        let store = ExtractionStore::new(config.policy);
        Self {
            interviewer,
            transcriber,
            artifacts,
            config,
            state: Mutex::new(EngineState {
                sessions: HashMap::new(),
                store,
            }),
        }
    }

    /// Opens a session on an artifact and records the interviewer's opening
    /// turn. `initial_context` is appended to the artifact's guide for the
    /// lifetime of the session.
    pub async fn start(
        &self,
        artifact_id: ArtifactId,
        initial_context: Option<&str>,
    ) -> EngineResult<Session> {
        let artifact = self
            .artifacts
            .load(&artifact_id)
            .await
            .map_err(|e| EngineError::Artifact(e.to_string()))?
            .ok_or_else(|| EngineError::InvalidArtifact(artifact_id.clone()))?;
        let artifact = Arc::new(artifact);

        let guide = match initial_context.map(str::trim).filter(|c| !c.is_empty()) {
            Some(context) if !artifact.guide.is_empty() => {
                format!("{}\n\n{context}", artifact.guide)
            }
            Some(context) => context.to_string(),
            None => artifact.guide.clone(),
        };

        let session = Session::new(artifact_id.clone());
        let session_id = session.id;
        let gate = Arc::new(Mutex::new(()));
        let _guard = gate.clone().lock_owned().await;

        {
            let mut state = self.state.lock().await;
            if self.config.enforce_single_active {
                let existing = state
                    .sessions
                    .values()
                    .find(|e| e.session.artifact_id == artifact_id && e.session.is_active());
                if let Some(existing) = existing {
                    return Err(EngineError::ActiveSessionExists {
                        artifact_id,
                        session_id: existing.session.id,
                    });
                }
            }
            state.sessions.insert(
                session_id,
                SessionEntry {
                    session,
                    artifact: Arc::clone(&artifact),
                    guide: guide.clone(),
                    log: ConversationLog::new(session_id),
                    gate,
                    last_anchor: None,
                    feedback: None,
                },
            );
        }

        let opening = match self.interviewer.respond(&artifact.text, &guide, &[]).await {
            Ok(opening) => opening,
            Err(e) => {
                self.state.lock().await.sessions.remove(&session_id);
                tracing::error!(session_id = %session_id, "Interviewer failed to open the session: {:?}", e);
                return Err(EngineError::Interviewer(e.to_string()));
            }
        };

        let mut state = self.state.lock().await;
        let EngineState { sessions, store } = &mut *state;
        let entry = lookup(sessions, session_id)?;
        entry.ensure_active()?;

        let question = opening
            .next_question
            .unwrap_or_else(|| opening_greeting(&artifact.text));
        let turn_id = entry.log.append(Role::Interviewer, question, None).id;
        entry.record_drafts(store, Some(turn_id), opening.candidates, None);

        tracing::info!(
            session_id = %session_id,
            artifact_id = %entry.session.artifact_id,
            "Feedback session started"
        );
        Ok(entry.session.clone())
    }

    /// Records a reviewer turn and the interviewer's reply to it.
    ///
    /// A failed transcription leaves the session untouched. Once the reviewer
    /// turn is appended it stays in the log even if the interviewer fails.
    pub async fn submit_turn(
        &self,
        session_id: SessionId,
        input: ReviewerInput,
    ) -> EngineResult<TurnOutcome> {
        let (_guard, artifact, guide) = {
            let mut state = self.state.lock().await;
            let entry = lookup(&mut state.sessions, session_id)?;
            entry.ensure_active()?;
            let guard = entry.claim()?;
            (guard, Arc::clone(&entry.artifact), entry.guide.clone())
        };

        let (content, audio_reference) = self.resolve_input(session_id, input).await?;

        let (reviewer_turn, history, anchor) = {
            let mut state = self.state.lock().await;
            let entry = lookup(&mut state.sessions, session_id)?;
            // The session may have been cancelled while we were transcribing.
            entry.ensure_active()?;
            let reviewer_turn = entry
                .log
                .append(Role::Reviewer, content, audio_reference)
                .clone();
            let anchor = SpanLocator::new(&artifact.text)
                .anchor_from_turn(&reviewer_turn.content)
                .or(entry.last_anchor);
            (reviewer_turn, entry.log.turns().to_vec(), anchor)
        };

        tracing::debug!(
            session_id = %session_id,
            sequence = reviewer_turn.sequence,
            "Reviewer turn recorded, asking interviewer"
        );

        let response = self
            .interviewer
            .respond(&artifact.text, &guide, &history)
            .await
            .map_err(|e| {
                tracing::error!(session_id = %session_id, "Interviewer call failed: {:?}", e);
                EngineError::Interviewer(e.to_string())
            })?;

        let mut state = self.state.lock().await;
        let EngineState { sessions, store } = &mut *state;
        let entry = lookup(sessions, session_id)?;
        if entry.session.status == SessionStatus::Cancelled {
            tracing::warn!(
                session_id = %session_id,
                "Session was cancelled during the interviewer call, discarding its reply"
            );
            return Err(EngineError::SessionNotActive(session_id));
        }

        let question = response
            .next_question
            .unwrap_or_else(|| CLOSING_REMARK.to_string());
        let interviewer_turn = entry.log.append(Role::Interviewer, question, None).clone();
        let new_candidates =
            entry.record_drafts(store, Some(interviewer_turn.id), response.candidates, anchor);

        if response.is_complete && entry.session.is_active() {
            entry.mark_completed();
            tracing::info!(session_id = %session_id, "Interviewer signalled the conversation is complete");
        }

        Ok(TurnOutcome {
            reviewer_turn,
            interviewer_turn,
            new_candidates,
            session: entry.session.clone(),
        })
    }

    async fn resolve_input(
        &self,
        session_id: SessionId,
        input: ReviewerInput,
    ) -> EngineResult<(String, Option<AudioReference>)> {
        match input {
            ReviewerInput::Text(text) => {
                let text = text.trim();
                if text.is_empty() {
                    return Err(EngineError::EmptyTurn);
                }
                Ok((text.to_string(), None))
            }
            ReviewerInput::Audio { bytes, reference } => {
                if bytes.len() > self.config.max_audio_bytes {
                    return Err(EngineError::TranscriptionFailed(format!(
                        "audio is {} bytes, the limit is {}",
                        bytes.len(),
                        self.config.max_audio_bytes
                    )));
                }
                let text = self
                    .transcriber
                    .transcribe(&bytes, &reference.0)
                    .await
                    .map_err(|e| {
                        tracing::warn!(session_id = %session_id, "Transcription failed: {:?}", e);
                        EngineError::TranscriptionFailed(e.to_string())
                    })?;
                let text = text.trim();
                if text.is_empty() {
                    return Err(EngineError::TranscriptionFailed(
                        "transcription is empty".to_string(),
                    ));
                }
                Ok((text.to_string(), Some(reference)))
            }
        }
    }

    pub async fn complete(&self, session_id: SessionId) -> EngineResult<Session> {
        let mut state = self.state.lock().await;
        let entry = lookup(&mut state.sessions, session_id)?;
        entry.ensure_active()?;
        entry.mark_completed();
        tracing::info!(session_id = %session_id, "Feedback session completed");
        Ok(entry.session.clone())
    }

    /// Cancels an active or completed session. An interviewer call already
    /// in flight is not aborted, but its reply will be discarded.
    pub async fn cancel(&self, session_id: SessionId) -> EngineResult<Session> {
        let mut state = self.state.lock().await;
        let entry = lookup(&mut state.sessions, session_id)?;
        if entry.session.status == SessionStatus::Cancelled {
            return Err(EngineError::SessionNotActive(session_id));
        }
        if entry.feedback.is_some() {
            return Err(EngineError::AlreadyConfirmed(session_id));
        }
        entry.session.status = SessionStatus::Cancelled;
        entry.session.completed_at.get_or_insert_with(Utc::now);
        tracing::info!(session_id = %session_id, "Feedback session cancelled");
        Ok(entry.session.clone())
    }

    /// Applies the reviewer's decisions to every candidate of a completed
    /// session and returns the confirmed feedback. Succeeds at most once.
    pub async fn confirm(
        &self,
        session_id: SessionId,
        decisions: &[CandidateDecision],
    ) -> EngineResult<MaterializedFeedback> {
        let mut state = self.state.lock().await;
        let EngineState { sessions, store } = &mut *state;
        let entry = lookup(sessions, session_id)?;
        if entry.feedback.is_some() {
            return Err(EngineError::AlreadyConfirmed(session_id));
        }
        if entry.session.status != SessionStatus::Completed {
            return Err(EngineError::SessionNotCompleted(session_id));
        }
        let _guard = entry.claim()?;
        let policy = store.policy();

        let feedback = reconcile(
            &entry.session,
            &entry.artifact.text,
            &mut store.session_mut(session_id),
            decisions,
            policy,
        )?;
        entry.feedback = Some(feedback.clone());
        Ok(feedback)
    }

    pub async fn session(&self, session_id: SessionId) -> EngineResult<Session> {
        let mut state = self.state.lock().await;
        Ok(lookup(&mut state.sessions, session_id)?.session.clone())
    }

    pub async fn snapshot(&self, session_id: SessionId) -> EngineResult<SessionSnapshot> {
        let mut state = self.state.lock().await;
        let EngineState { sessions, store } = &mut *state;
        let entry = lookup(sessions, session_id)?;
        Ok(SessionSnapshot {
            session: entry.session.clone(),
            turns: entry.log.turns().to_vec(),
            candidates: store.list_by_session(session_id),
        })
    }

    /// The active session on an artifact, if there is one.
    pub async fn active_session_for(&self, artifact_id: &ArtifactId) -> Option<Session> {
        let state = self.state.lock().await;
        state
            .sessions
            .values()
            .map(|e| &e.session)
            .find(|s| &s.artifact_id == artifact_id && s.is_active())
            .cloned()
    }

    pub async fn list_candidates(
        &self,
        session_id: SessionId,
    ) -> EngineResult<Vec<ExtractionCandidate>> {
        let mut state = self.state.lock().await;
        lookup(&mut state.sessions, session_id)?;
        Ok(state.store.list_by_session(session_id))
    }

    pub async fn summary(&self, session_id: SessionId) -> EngineResult<ExtractionSummary> {
        let mut state = self.state.lock().await;
        lookup(&mut state.sessions, session_id)?;
        Ok(state.store.summary(session_id))
    }

    /// Edits a pending candidate before confirmation.
    pub async fn edit_candidate(
        &self,
        candidate_id: CandidateId,
        patch: ExtractionPatch,
    ) -> EngineResult<ExtractionCandidate> {
        let mut state = self.state.lock().await;
        let EngineState { sessions, store } = &mut *state;
        let session_id = store
            .get(candidate_id)
            .map(|c| c.session_id)
            .ok_or(EngineError::CandidateNotFound(candidate_id))?;
        let entry = lookup(sessions, session_id)?;
        if entry.session.status == SessionStatus::Cancelled {
            return Err(EngineError::SessionNotActive(session_id));
        }
        let locator = SpanLocator::new(&entry.artifact.text);
        store.edit(candidate_id, patch, &locator)
    }

    /// Appends a turn produced by a live audio connection.
    ///
    /// Live turns arrive already transcribed and do not call the interviewer,
    /// but they obey the same lifecycle as `submit_turn`, including
    /// `SessionBusy` while an interviewer call is in flight.
    pub async fn record_live_turn(
        &self,
        session_id: SessionId,
        role: Role,
        content: &str,
    ) -> EngineResult<Turn> {
        let content = content.trim();
        if content.is_empty() {
            return Err(EngineError::EmptyTurn);
        }
        let mut state = self.state.lock().await;
        let entry = lookup(&mut state.sessions, session_id)?;
        entry.ensure_active()?;
        // Never interleave with a reply that is still being produced.
        let _guard = entry.claim()?;
        Ok(entry.log.append(role, content.to_string(), None).clone())
    }

    /// Extracts candidates from the whole conversation in one interviewer
    /// call. The new candidates are not tied to any turn.
    pub async fn extract_from_transcript(
        &self,
        session_id: SessionId,
    ) -> EngineResult<Vec<ExtractionCandidate>> {
        let (_guard, artifact, guide, history) = {
            let mut state = self.state.lock().await;
            let entry = lookup(&mut state.sessions, session_id)?;
            if entry.session.status == SessionStatus::Cancelled {
                return Err(EngineError::SessionNotActive(session_id));
            }
            if entry.feedback.is_some() {
                return Err(EngineError::AlreadyConfirmed(session_id));
            }
            let guard = entry.claim()?;
            (
                guard,
                Arc::clone(&entry.artifact),
                entry.guide.clone(),
                entry.log.turns().to_vec(),
            )
        };

        let drafts = self
            .interviewer
            .extract_all(&artifact.text, &guide, &history)
            .await
            .map_err(|e| EngineError::Interviewer(e.to_string()))?;

        let mut state = self.state.lock().await;
        let EngineState { sessions, store } = &mut *state;
        let entry = lookup(sessions, session_id)?;
        if entry.session.status == SessionStatus::Cancelled {
            tracing::warn!(session_id = %session_id, "Session was cancelled during extraction, discarding results");
            return Err(EngineError::SessionNotActive(session_id));
        }
        let added = entry.record_drafts(store, None, drafts, None);
        tracing::info!(
            session_id = %session_id,
            candidates = added.len(),
            "Extracted feedback from transcript"
        );
        Ok(added)
    }
}
