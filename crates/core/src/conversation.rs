use crate::types::{AudioReference, Role, SessionId, Turn, TurnId};
use chrono::Utc;

/// Append-only, ordered log of the turns of one session.
///
/// Sequence numbers start at 1 and are never reused; turns are never
/// reordered or removed.
#[derive(Debug, Clone)]
pub struct ConversationLog {
    session_id: SessionId,
    turns: Vec<Turn>,
    next_sequence: u64,
}

impl ConversationLog {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            turns: Vec::new(),
            next_sequence: 1,
        }
    }

    pub fn append(
        &mut self,
        role: Role,
        content: String,
        audio_reference: Option<AudioReference>,
    ) -> &Turn {
        let turn = Turn {
            id: TurnId::new(),
            session_id: self.session_id,
            role,
            content,
            audio_reference,
            sequence: self.next_sequence,
            created_at: Utc::now(),
        };
        self.next_sequence += 1;
        self.turns.push(turn);
        &self.turns[self.turns.len() - 1]
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// The most recent turn authored by `role`.
    pub fn last_by(&self, role: Role) -> Option<&Turn> {
        self.turns.iter().rev().find(|t| t.role == role)
    }

    /// Renders the log as `Role: content` lines for prompting.
    pub fn transcript(&self) -> String {
        render_transcript(&self.turns)
    }
}

pub fn render_transcript(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|t| format!("{}: {}", t.role.label(), t.content))
        .collect::<Vec<_>>()
        .join("\n")
}
