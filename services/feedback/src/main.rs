use anyhow::{Context, Result};
use clap::Parser;
use feedback_service::commands::{HELP, ReplCommand, parse_command, parse_decision};
use feedback_service::config::Config;
use feedback_service::prompt_loader;
use poem_feedback_core::{
    Artifact, AudioReference, CandidateDecision, EngineConfig, EngineError, ExtractionCandidate,
    FeedbackType, InMemoryArtifacts, Interviewer, InterviewerClient, OfflineTranscriber,
    ReviewerInput, ScriptedInterviewer, SessionEngine, SessionId, SessionStatus, Transcriber,
    WhisperTranscriber,
};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing_subscriber::fmt::time::ChronoLocal;

type InputLines = Lines<BufReader<Stdin>>;

#[derive(Parser)]
#[command(version, about = "Talk through a poem with an interviewer and confirm the feedback it captured")]
struct Cli {
    /// Path to the poem under review
    poem: PathBuf,
    /// Path to the guide the poem was written against
    #[arg(long)]
    guide: Option<PathBuf>,
    /// Identifier of the poem; defaults to the file stem
    #[arg(long)]
    artifact_id: Option<String>,
    /// Extra guidance for the interviewer in this session
    #[arg(long)]
    context: Option<String>,
    /// Write the confirmed feedback here instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load application configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Configuration loaded successfully. Starting feedback service...");

    // --- 3. Parse Command-Line Arguments ---
    let args = Cli::parse();

    // --- 4. Load the Poem ---
    let text = tokio::fs::read_to_string(&args.poem)
        .await
        .with_context(|| format!("Failed to read poem: {}", args.poem.display()))?;
    let guide = match &args.guide {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read guide: {}", path.display()))?,
        None => String::new(),
    };
    let artifact_id = args
        .artifact_id
        .clone()
        .or_else(|| {
            args.poem
                .file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "poem".to_string());

    // --- 5. Load Prompts ---
    let prompts = prompt_loader::load_overrides(&config.prompts_dir)
        .context("Failed to load prompt overrides")?;
    tracing::info!("Loaded {} prompt overrides.", prompts.len());

    // --- 6. Engine Setup ---
    let (interviewer, transcriber) = build_collaborators(&config, &prompts);
    let artifacts = Arc::new(InMemoryArtifacts::new());
    artifacts
        .insert(Artifact::new(artifact_id.clone(), text, guide))
        .await;
    let engine = SessionEngine::new(
        interviewer,
        transcriber,
        artifacts,
        EngineConfig {
            max_audio_bytes: config.max_audio_bytes,
            ..Default::default()
        },
    );

    // --- 7. Conversation ---
    let session = engine
        .start(artifact_id.into(), args.context.as_deref())
        .await
        .context("Failed to start feedback session")?;
    let snapshot = engine.snapshot(session.id).await?;
    if let Some(opening) = snapshot.turns.last() {
        println!("\nInterviewer: {}\n", opening.content);
    }
    println!("(type /help for commands)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    if !converse(&engine, session.id, &mut lines).await? {
        println!("Session cancelled. Nothing was saved.");
        return Ok(());
    }

    // --- 8. Review and Confirm ---
    let summary = engine.summary(session.id).await?;
    if summary.is_empty() {
        println!("No feedback was captured.");
    } else {
        println!("\n{}", summary.to_markdown());
    }
    let decisions = review(&engine, session.id, &mut lines).await?;
    let feedback = engine
        .confirm(session.id, &decisions)
        .await
        .context("Failed to confirm feedback")?;

    let json = serde_json::to_string_pretty(&feedback)?;
    match &args.output {
        Some(path) => {
            tokio::fs::write(path, &json)
                .await
                .with_context(|| format!("Failed to write feedback: {}", path.display()))?;
            println!("Saved confirmed feedback to {}", path.display());
            let notes = feedback.revision_notes();
            if !notes.is_empty() {
                println!("\n{notes}");
            }
        }
        None => println!("{json}"),
    }

    Ok(())
}

fn build_collaborators(
    config: &Config,
    prompts: &HashMap<String, String>,
) -> (Arc<dyn Interviewer>, Arc<dyn Transcriber>) {
    let Some(api_key) = &config.openai_api_key else {
        tracing::warn!("OPENAI_API_KEY is not set, running offline with the scripted interviewer");
        let interviewer: Arc<dyn Interviewer> = Arc::new(ScriptedInterviewer);
        let transcriber: Arc<dyn Transcriber> = Arc::new(OfflineTranscriber);
        return (interviewer, transcriber);
    };

    let mut client = InterviewerClient::new(api_key.clone(), config.chat_model.clone());
    if let Some(behavior) = prompt_loader::interviewer_behavior(prompts) {
        tracing::info!("Using interviewer behavior from the prompts directory");
        client = client.with_behavior_prompt(behavior);
    }
    let interviewer: Arc<dyn Interviewer> = Arc::new(client);
    let transcriber: Arc<dyn Transcriber> = Arc::new(WhisperTranscriber::new(
        api_key.clone(),
        config.transcription_model.clone(),
    ));
    (interviewer, transcriber)
}

fn prompt(text: &str) -> Result<()> {
    print!("{text}");
    std::io::stdout().flush()?;
    Ok(())
}

/// Runs the conversation until it is completed (`true`) or cancelled (`false`).
async fn converse(engine: &SessionEngine, session_id: SessionId, lines: &mut InputLines) -> Result<bool> {
    loop {
        prompt("> ")?;
        let Some(line) = lines.next_line().await? else {
            engine.complete(session_id).await?;
            return Ok(true);
        };

        let input = match parse_command(&line) {
            ReplCommand::Empty => continue,
            ReplCommand::Help => {
                println!("{HELP}");
                continue;
            }
            ReplCommand::Unknown(command) => {
                println!("Unknown command: {command}\n{HELP}");
                continue;
            }
            ReplCommand::Summary => {
                println!("{}", engine.summary(session_id).await?.to_markdown());
                continue;
            }
            ReplCommand::Done => {
                engine.complete(session_id).await?;
                return Ok(true);
            }
            ReplCommand::Cancel => {
                engine.cancel(session_id).await?;
                return Ok(false);
            }
            ReplCommand::Say(text) => ReviewerInput::Text(text),
            ReplCommand::Audio(path) => match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| path.display().to_string());
                    ReviewerInput::Audio {
                        bytes,
                        reference: AudioReference(name),
                    }
                }
                Err(e) => {
                    println!("Could not read {}: {e}", path.display());
                    continue;
                }
            },
        };

        match engine.submit_turn(session_id, input).await {
            Ok(outcome) => {
                if outcome.reviewer_turn.audio_reference.is_some() {
                    println!("You (transcribed): {}", outcome.reviewer_turn.content);
                }
                println!("\nInterviewer: {}\n", outcome.interviewer_turn.content);
                if !outcome.new_candidates.is_empty() {
                    println!("(noted {} feedback item(s))", outcome.new_candidates.len());
                }
                if outcome.session.status == SessionStatus::Completed {
                    return Ok(true);
                }
            }
            Err(
                e @ (EngineError::TranscriptionFailed(_)
                | EngineError::Interviewer(_)
                | EngineError::EmptyTurn
                | EngineError::SessionBusy(_)),
            ) => println!("{e}. Please try again."),
            Err(e) => return Err(e.into()),
        }
    }
}

fn describe(candidate: &ExtractionCandidate) -> String {
    match candidate.feedback_type {
        FeedbackType::InlineComment => match &candidate.resolved_text {
            Some(text) => format!("[inline] On \"{text}\": {}", candidate.content),
            None => format!("[inline, not found in poem] {}", candidate.content),
        },
        FeedbackType::Overall => format!("[overall] {}", candidate.content),
        FeedbackType::GuideSuggestion => format!("[guide] {}", candidate.content),
        FeedbackType::Rating => format!("[rating] {}", candidate.content),
    }
}

/// Asks about each captured item in turn. Unanswered items are kept.
async fn review(
    engine: &SessionEngine,
    session_id: SessionId,
    lines: &mut InputLines,
) -> Result<Vec<CandidateDecision>> {
    let candidates = engine.list_candidates(session_id).await?;
    let mut decisions = Vec::with_capacity(candidates.len());

    for candidate in &candidates {
        let keep = loop {
            prompt(&format!("Keep {}? [Y/n] ", describe(candidate)))?;
            let answer = lines.next_line().await?.unwrap_or_default();
            match parse_decision(&answer) {
                Some(keep) => break keep,
                None => println!("Please answer y or n."),
            }
        };
        decisions.push(if keep {
            CandidateDecision::confirm(candidate.id)
        } else {
            CandidateDecision::reject(candidate.id)
        });
    }

    Ok(decisions)
}
