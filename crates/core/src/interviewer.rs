use crate::conversation::render_transcript;
use crate::extraction::{CandidateDraft, FeedbackType};
use crate::types::Turn;
use anyhow::Result;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

const FALLBACK_QUESTION: &str = "Could you tell me more?";
const UNPARSEABLE_QUESTION: &str = "Could you elaborate on that?";

/// What the interviewer returns for one turn of the conversation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InterviewerResponse {
    /// `None` when the interviewer has nothing left to ask.
    pub next_question: Option<String>,
    pub candidates: Vec<CandidateDraft>,
    /// Set once the reviewer has signalled they are done.
    pub is_complete: bool,
}

impl InterviewerResponse {
    pub fn question(text: impl Into<String>) -> Self {
        Self {
            next_question: Some(text.into()),
            ..Default::default()
        }
    }
}

/// The AI side of a feedback conversation.
///
/// Implementations are treated as slow, fallible remote calls that are safe
/// to retry; the engine never runs two of them at once for one session.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Interviewer: Send + Sync {
    /// Produces the next question and any feedback items found so far.
    /// An empty `history` asks for the opening turn.
    async fn respond(
        &self,
        artifact_text: &str,
        guide_text: &str,
        history: &[Turn],
    ) -> Result<InterviewerResponse>;

    /// Extracts every feedback item from a finished conversation at once.
    async fn extract_all(
        &self,
        artifact_text: &str,
        guide_text: &str,
        history: &[Turn],
    ) -> Result<Vec<CandidateDraft>>;
}

#[derive(Debug, Deserialize)]
pub struct LlmResponse {
    pub choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: Message,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct WireReply {
    follow_up_question: Option<String>,
    #[serde(default)]
    extracted_items: Vec<serde_json::Value>,
    #[serde(default)]
    is_complete: bool,
}

#[derive(Debug, Deserialize)]
struct WireItem {
    feedback_type: FeedbackType,
    content: String,
    highlighted_text: Option<String>,
    start_offset: Option<usize>,
    end_offset: Option<usize>,
    confidence: Option<f32>,
}

impl From<WireItem> for CandidateDraft {
    fn from(item: WireItem) -> Self {
        Self {
            feedback_type: item.feedback_type,
            content: item.content,
            highlighted_text: item.highlighted_text,
            start_offset: item.start_offset,
            end_offset: item.end_offset,
            confidence: item.confidence,
        }
    }
}

/// Removes a surrounding markdown code fence, if the model added one.
fn strip_code_fence(text: &str) -> &str {
    let body = if let Some((_, rest)) = text.split_once("```json") {
        rest
    } else if let Some((_, rest)) = text.split_once("```") {
        rest
    } else {
        return text.trim();
    };
    body.split("```").next().unwrap_or(body).trim()
}

fn parse_items(items: Vec<serde_json::Value>) -> Vec<CandidateDraft> {
    items
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<WireItem>(value) {
            Ok(item) => Some(item.into()),
            Err(e) => {
                tracing::warn!("Skipping malformed extracted item: {}", e);
                None
            }
        })
        .collect()
}

/// Parses a model reply into an `InterviewerResponse`.
///
/// Missing fields take defaults and malformed items are skipped. A reply that
/// is not JSON at all becomes a generic follow-up question with no items.
pub fn parse_interviewer_reply(reply: &str) -> InterviewerResponse {
    match serde_json::from_str::<WireReply>(strip_code_fence(reply)) {
        Ok(wire) => InterviewerResponse {
            next_question: Some(
                wire.follow_up_question
                    .unwrap_or_else(|| FALLBACK_QUESTION.to_string()),
            ),
            candidates: parse_items(wire.extracted_items),
            is_complete: wire.is_complete,
        },
        Err(e) => {
            tracing::warn!(
                "Interviewer reply is not valid JSON ({}): {:.200}",
                e,
                reply
            );
            InterviewerResponse::question(UNPARSEABLE_QUESTION)
        }
    }
}

/// Parses a post-call extraction reply (`{"extracted_items": [...]}`).
pub fn parse_extraction_reply(reply: &str) -> Vec<CandidateDraft> {
    #[derive(Deserialize)]
    struct WireExtraction {
        #[serde(default)]
        extracted_items: Vec<serde_json::Value>,
    }

    match serde_json::from_str::<WireExtraction>(strip_code_fence(reply)) {
        Ok(wire) => parse_items(wire.extracted_items),
        Err(e) => {
            tracing::warn!("Extraction reply is not valid JSON: {}", e);
            Vec::new()
        }
    }
}

/// The opening turn, shown before the reviewer has said anything.
pub fn opening_greeting(artifact_text: &str) -> String {
    format!(
        "Hello! I'm here to help you give feedback on this poem. Instead of filling out forms, \
let's just talk about what you noticed.\n\n\
I'll ask follow-up questions and note the specific feedback as we go. When we're done, \
you'll be able to review everything I captured.\n\n\
Here's the poem we'll be discussing:\n\n{artifact_text}\n\n\
To start: what are your initial thoughts? What stands out to you most?"
    )
}

pub const DEFAULT_BEHAVIOR_PROMPT: &str = r#"## Your Behavior:
- Ask clarifying questions to understand specific issues
- Probe for WHY something doesn't work
- When they mention a specific part of the poem, ask them to elaborate
- Ask "what would make this better?" to get actionable suggestions
- If they mention guide violations, dig into what rule should be added
- Keep questions conversational and natural
- Don't repeat questions; build on what they've already said
- Recognize when they're done (e.g. "that's all", "I'm finished", "nothing else")"#;

const EXTRACTION_RULES: &str = r#"## Extraction Rules:
Extract feedback items in these categories:

1. inline_comment: critique of a specific part of the poem. Quote the EXACT text
   from the poem in highlighted_text and give the critique as content.
2. overall: general observations about the whole poem.
3. guide_suggestion: a new rule for the guide (e.g. "Never use the word 'heartbeat'").
4. rating: a numeric rating from 1 to 5, only if they clearly gave one.

Each item carries a confidence between 0 and 1."#;

/// Calls an OpenAI-compatible chat completion endpoint.
pub struct InterviewerClient {
    client: Client,
    api_key: SecretString,
    model: String,
    api_base: String,
    behavior_prompt: String,
}

impl InterviewerClient {
    pub fn new(api_key: SecretString, model: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
            api_base: DEFAULT_API_BASE.to_string(),
            behavior_prompt: DEFAULT_BEHAVIOR_PROMPT.to_string(),
        }
    }

    /// Replaces the built-in behavior section of the system prompt.
    pub fn with_behavior_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.behavior_prompt = prompt.into();
        self
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn conversation_prompt(&self, artifact_text: &str, guide_text: &str, history: &[Turn]) -> String {
        let transcript = render_transcript(history);
        let behavior = &self.behavior_prompt;
        format!(
            r#"You are an expert poetry editor conducting a feedback session with a reviewer. Your goal is to extract structured feedback through natural conversation.

## The Poem Being Reviewed:
{artifact_text}

## The Poetry Guide:
{guide_text}

{behavior}

{EXTRACTION_RULES}

## Response Format:
Respond with ONLY valid JSON (no markdown code blocks):
{{
    "follow_up_question": "Your next question, or a short summary if complete",
    "extracted_items": [
        {{
            "feedback_type": "inline_comment|overall|guide_suggestion|rating",
            "content": "The feedback content or comment",
            "highlighted_text": "exact text from the poem (inline_comment only)",
            "confidence": 0.9
        }}
    ],
    "is_complete": false
}}

## Conversation So Far:
{transcript}

Based on this exchange, extract any new feedback items and formulate your next question."#
        )
    }

    pub fn extraction_prompt(&self, artifact_text: &str, guide_text: &str, history: &[Turn]) -> String {
        let transcript = render_transcript(history);
        format!(
            r#"You are an expert poetry editor. You have just finished a voice feedback session with a reviewer. Extract ALL structured feedback items from the complete transcript.

## The Poem Being Reviewed:
{artifact_text}

## The Poetry Guide:
{guide_text}

{EXTRACTION_RULES}

## Complete Conversation Transcript:
{transcript}

## Response Format:
Respond with ONLY valid JSON (no markdown code blocks):
{{
    "extracted_items": [
        {{
            "feedback_type": "inline_comment|overall|guide_suggestion|rating",
            "content": "The feedback content or comment",
            "highlighted_text": "exact text from the poem (inline_comment only)",
            "confidence": 0.9
        }}
    ]
}}

Extract every piece of actionable feedback from the conversation. Be thorough."#
        )
    }

    async fn chat(&self, system_prompt: String, max_tokens: u32, temperature: f32) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system_prompt }
            ],
            "max_tokens": max_tokens,
            "temperature": temperature
        });

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<LlmResponse>()
            .await?;

        let answer = &resp
            .choices
            .first()
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))?
            .message
            .content;
        Ok(answer.clone())
    }
}

#[async_trait]
impl Interviewer for InterviewerClient {
    async fn respond(
        &self,
        artifact_text: &str,
        guide_text: &str,
        history: &[Turn],
    ) -> Result<InterviewerResponse> {
        if history.is_empty() {
            return Ok(InterviewerResponse::question(opening_greeting(artifact_text)));
        }
        let prompt = self.conversation_prompt(artifact_text, guide_text, history);
        let reply = self.chat(prompt, 2048, 0.7).await?;
        Ok(parse_interviewer_reply(&reply))
    }

    async fn extract_all(
        &self,
        artifact_text: &str,
        guide_text: &str,
        history: &[Turn],
    ) -> Result<Vec<CandidateDraft>> {
        if history.is_empty() {
            return Ok(Vec::new());
        }
        let prompt = self.extraction_prompt(artifact_text, guide_text, history);
        let reply = self.chat(prompt, 4096, 0.3).await?;
        Ok(parse_extraction_reply(&reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ConversationLog;
    use crate::types::{Role, SessionId};

    #[test]
    fn parses_fenced_reply_with_items() {
        let reply = r#"Sure!
```json
{
  "follow_up_question": "Which word felt weakest?",
  "extracted_items": [
    {"feedback_type": "inline_comment", "content": "Cliche", "highlighted_text": "the moment", "confidence": 0.9},
    {"feedback_type": "rating", "content": "4", "confidence": 85},
    {"feedback_type": "mystery", "content": "dropped"}
  ],
  "is_complete": false
}
```"#;
        let parsed = parse_interviewer_reply(reply);
        assert_eq!(parsed.next_question.as_deref(), Some("Which word felt weakest?"));
        assert_eq!(parsed.candidates.len(), 2);
        assert_eq!(parsed.candidates[0].feedback_type, FeedbackType::InlineComment);
        assert_eq!(parsed.candidates[0].highlighted_text.as_deref(), Some("the moment"));
        assert_eq!(parsed.candidates[1].confidence, Some(85.0));
        assert!(!parsed.is_complete);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let parsed = parse_interviewer_reply(r#"{"is_complete": true}"#);
        assert_eq!(parsed.next_question.as_deref(), Some(FALLBACK_QUESTION));
        assert!(parsed.candidates.is_empty());
        assert!(parsed.is_complete);
    }

    #[test]
    fn garbage_reply_falls_back_to_question() {
        let parsed = parse_interviewer_reply("I think the poem is nice.");
        assert_eq!(parsed, InterviewerResponse::question(UNPARSEABLE_QUESTION));
    }

    #[test]
    fn extraction_reply_parsing() {
        let items = parse_extraction_reply(
            r#"```{"extracted_items": [{"feedback_type": "overall", "content": "Strong ending"}]}```"#,
        );
        assert_eq!(items, vec![CandidateDraft::new(FeedbackType::Overall, "Strong ending")]);
        assert!(parse_extraction_reply("nope").is_empty());
    }

    #[test]
    fn conversation_prompt_includes_context_and_transcript() {
        let client = InterviewerClient::new(SecretString::from("test-key".to_string()), "gpt-4o".into())
            .with_behavior_prompt("## Your Behavior:\n- Be brief");
        let mut log = ConversationLog::new(SessionId::new());
        log.append(Role::Interviewer, "What stands out?".into(), None);
        log.append(Role::Reviewer, "The ending drags".into(), None);

        let prompt = client.conversation_prompt("Roses bloom", "No cliches", log.turns());
        assert!(prompt.contains("Roses bloom"));
        assert!(prompt.contains("No cliches"));
        assert!(prompt.contains("- Be brief"));
        assert!(!prompt.contains("Probe for WHY"));
        assert!(prompt.contains("Reviewer: The ending drags"));
    }

    #[tokio::test]
    async fn empty_history_yields_greeting_without_network() {
        let client = InterviewerClient::new(SecretString::from("test-key".to_string()), "gpt-4o".into())
            .with_api_base("http://127.0.0.1:9");
        let resp = client.respond("Roses bloom", "", &[]).await.unwrap();
        let greeting = resp.next_question.unwrap();
        assert!(greeting.contains("Roses bloom"));
        assert!(resp.candidates.is_empty());
        assert!(client.extract_all("Roses bloom", "", &[]).await.unwrap().is_empty());
    }
}
