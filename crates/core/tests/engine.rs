use anyhow::Result;
use async_trait::async_trait;
use poem_feedback_core::{
    Artifact, CandidateDecision, CandidateDraft, ConfirmationStatus, EngineConfig, EngineError,
    FeedbackType, InMemoryArtifacts, Interviewer, InterviewerResponse, OfflineTranscriber,
    ReviewerInput, Role, ScriptedInterviewer, SessionEngine, SessionStatus, Span, Turn,
};
use std::sync::Arc;
use tokio::sync::Notify;

const POEM: &str = "Silver rain on quiet roofs\nA heartbeat in the hall\nMorning comes";

/// Holds every reply to a reviewer turn starting with "hold" until released.
#[derive(Default)]
struct GatedInterviewer {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl Interviewer for GatedInterviewer {
    async fn respond(
        &self,
        _artifact_text: &str,
        _guide_text: &str,
        history: &[Turn],
    ) -> Result<InterviewerResponse> {
        let Some(last) = history.last() else {
            return Ok(InterviewerResponse::question("Hello"));
        };
        if last.content.starts_with("hold") {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(InterviewerResponse {
            next_question: Some("Go on".into()),
            candidates: vec![CandidateDraft::new(FeedbackType::Overall, last.content.clone())],
            is_complete: false,
        })
    }

    async fn extract_all(
        &self,
        _artifact_text: &str,
        _guide_text: &str,
        _history: &[Turn],
    ) -> Result<Vec<CandidateDraft>> {
        Ok(Vec::new())
    }
}

async fn artifacts() -> Arc<InMemoryArtifacts> {
    let artifacts = InMemoryArtifacts::new();
    artifacts
        .insert(Artifact::new("poem-1", POEM, "Never use the word 'heartbeat'."))
        .await;
    artifacts.insert(Artifact::new("poem-2", POEM, "")).await;
    Arc::new(artifacts)
}

async fn gated_engine() -> (Arc<SessionEngine>, Arc<GatedInterviewer>) {
    let interviewer = Arc::new(GatedInterviewer::default());
    let engine = SessionEngine::new(
        interviewer.clone(),
        Arc::new(OfflineTranscriber),
        artifacts().await,
        EngineConfig::default(),
    );
    (Arc::new(engine), interviewer)
}

#[tokio::test]
async fn concurrent_submit_on_one_session_is_rejected_as_busy() {
    let (engine, interviewer) = gated_engine().await;
    let session = engine.start("poem-1".into(), None).await.unwrap();

    let first = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move {
            engine
                .submit_turn(session.id, ReviewerInput::Text("hold on, the rhythm".into()))
                .await
        }
    });
    interviewer.entered.notified().await;

    let err = engine
        .submit_turn(session.id, ReviewerInput::Text("second thought".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SessionBusy(id) if id == session.id));

    interviewer.release.notify_one();
    let outcome = first.await.unwrap().unwrap();
    assert_eq!(outcome.session.status, SessionStatus::Active);

    let snapshot = engine.snapshot(session.id).await.unwrap();
    let roles: Vec<_> = snapshot.turns.iter().map(|t| t.role).collect();
    assert_eq!(roles, vec![Role::Interviewer, Role::Reviewer, Role::Interviewer]);
    assert_eq!(snapshot.turns[1].content, "hold on, the rhythm");
    assert_eq!(snapshot.candidates.len(), 1);
}

#[tokio::test]
async fn confirm_on_active_session_reports_not_completed_even_while_busy() {
    let (engine, interviewer) = gated_engine().await;
    let session = engine.start("poem-1".into(), None).await.unwrap();

    let in_flight = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move {
            engine
                .submit_turn(session.id, ReviewerInput::Text("hold that line".into()))
                .await
        }
    });
    interviewer.entered.notified().await;

    let err = engine.confirm(session.id, &[]).await.unwrap_err();
    assert!(matches!(err, EngineError::SessionNotCompleted(id) if id == session.id));

    interviewer.release.notify_one();
    in_flight.await.unwrap().unwrap();
    assert_eq!(
        engine.session(session.id).await.unwrap().status,
        SessionStatus::Active
    );
}

#[tokio::test]
async fn live_turn_is_rejected_while_a_reply_is_in_flight() {
    let (engine, interviewer) = gated_engine().await;
    let session = engine.start("poem-1".into(), None).await.unwrap();

    let in_flight = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move {
            engine
                .submit_turn(session.id, ReviewerInput::Text("hold the second stanza".into()))
                .await
        }
    });
    interviewer.entered.notified().await;

    let err = engine
        .record_live_turn(session.id, Role::Reviewer, "spoken over the reply")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SessionBusy(id) if id == session.id));

    interviewer.release.notify_one();
    in_flight.await.unwrap().unwrap();

    let snapshot = engine.snapshot(session.id).await.unwrap();
    let roles: Vec<_> = snapshot.turns.iter().map(|t| t.role).collect();
    assert_eq!(roles, vec![Role::Interviewer, Role::Reviewer, Role::Interviewer]);

    let live = engine
        .record_live_turn(session.id, Role::Reviewer, "now it fits")
        .await
        .unwrap();
    assert_eq!(live.sequence, 4);
}

#[tokio::test]
async fn other_sessions_proceed_while_one_is_busy() {
    let (engine, interviewer) = gated_engine().await;
    let slow = engine.start("poem-1".into(), None).await.unwrap();
    let fast = engine.start("poem-2".into(), None).await.unwrap();

    let pending = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move {
            engine
                .submit_turn(slow.id, ReviewerInput::Text("hold this".into()))
                .await
        }
    });
    interviewer.entered.notified().await;

    let outcome = engine
        .submit_turn(fast.id, ReviewerInput::Text("quick note".into()))
        .await
        .unwrap();
    assert_eq!(outcome.interviewer_turn.sequence, 3);

    interviewer.release.notify_one();
    assert!(pending.await.unwrap().is_ok());
}

#[tokio::test]
async fn cancel_during_interviewer_call_discards_the_reply() {
    let (engine, interviewer) = gated_engine().await;
    let session = engine.start("poem-1".into(), None).await.unwrap();

    let in_flight = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move {
            engine
                .submit_turn(session.id, ReviewerInput::Text("hold please".into()))
                .await
        }
    });
    interviewer.entered.notified().await;

    engine.cancel(session.id).await.unwrap();
    interviewer.release.notify_one();

    let err = in_flight.await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::SessionNotActive(_)));

    let snapshot = engine.snapshot(session.id).await.unwrap();
    assert_eq!(snapshot.session.status, SessionStatus::Cancelled);
    // The reviewer's words stay; the late reply does not.
    assert_eq!(snapshot.turns.len(), 2);
    assert_eq!(snapshot.turns[1].role, Role::Reviewer);
    assert!(snapshot.candidates.is_empty());
}

#[tokio::test]
async fn scripted_session_end_to_end() {
    let engine = SessionEngine::new(
        Arc::new(ScriptedInterviewer),
        Arc::new(OfflineTranscriber),
        artifacts().await,
        EngineConfig::default(),
    );
    let session = engine.start("poem-1".into(), None).await.unwrap();

    for message in [
        "The first line is weak, overall it's fine",
        "That word heartbeat, never use it",
        "I'd give it a 4, that's all",
    ] {
        engine
            .submit_turn(session.id, ReviewerInput::Text(message.into()))
            .await
            .unwrap();
    }

    let snapshot = engine.snapshot(session.id).await.unwrap();
    assert_eq!(snapshot.session.status, SessionStatus::Completed);
    let sequences: Vec<u64> = snapshot.turns.iter().map(|t| t.sequence).collect();
    assert_eq!(sequences, (1..=7).collect::<Vec<_>>());

    let summary = engine.summary(session.id).await.unwrap();
    assert_eq!(summary.inline_comments.len(), 2);
    assert_eq!(summary.overall.len(), 1);
    assert_eq!(summary.guide_suggestions.len(), 1);
    assert_eq!(summary.ratings.len(), 1);
    assert!(summary.to_markdown().contains("On \"A heartbeat in the hall\""));

    let decisions: Vec<_> = snapshot
        .candidates
        .iter()
        .filter(|c| c.feedback_type != FeedbackType::GuideSuggestion)
        .map(|c| CandidateDecision::confirm(c.id))
        .collect();
    let feedback = engine.confirm(session.id, &decisions).await.unwrap();

    assert_eq!(feedback.rating, Some(4));
    assert!(feedback.guide_suggestions.is_empty());
    assert_eq!(feedback.rejected, 1);
    assert_eq!(feedback.inline_comments.len(), 2);
    for inline in &feedback.inline_comments {
        let span = Span::new(inline.start_offset, inline.end_offset);
        assert!(span.validate(POEM.chars().count()).is_ok());
        assert_eq!(span.slice(POEM), inline.highlighted_text);
    }
    assert_eq!(feedback.inline_comments[0].highlighted_text, "Silver rain on quiet roofs");

    let json = serde_json::to_value(&feedback).unwrap();
    assert_eq!(json["rating"], 4);

    let statuses: Vec<_> = engine
        .list_candidates(session.id)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.status)
        .collect();
    assert_eq!(statuses.iter().filter(|s| **s == ConfirmationStatus::Confirmed).count(), 4);
}

#[tokio::test]
async fn audio_turns_carry_their_reference() {
    let engine = SessionEngine::new(
        Arc::new(ScriptedInterviewer),
        Arc::new(OfflineTranscriber),
        artifacts().await,
        EngineConfig::default(),
    );
    let session = engine.start("poem-2".into(), None).await.unwrap();

    let outcome = engine
        .submit_turn(
            session.id,
            ReviewerInput::Audio {
                bytes: vec![7; 16],
                reference: poem_feedback_core::AudioReference("take-1.webm".into()),
            },
        )
        .await
        .unwrap();
    assert!(outcome.reviewer_turn.content.contains("take-1.webm"));
    assert_eq!(
        outcome.reviewer_turn.audio_reference.map(|r| r.0).as_deref(),
        Some("take-1.webm")
    );
}
