//! Per-user conversational state.
//!
//! A [`UserSession`] carries the rolling history, the agent-authored memory
//! notes and the nickname a user has given the agent. Sessions are mutated
//! only by the orchestrator, under that user's lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_HISTORY_CAP: usize = 30;
pub const DEFAULT_PROMPT_WINDOW: usize = 14;
pub const DEFAULT_MEMORY_MAX_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Persisted state for one platform-scoped user key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSession {
    pub user_id: String,
    /// Refreshed from every inbound message; not an identity.
    pub display_name: String,
    /// Newline-separated observations, oldest first.
    pub memory: String,
    /// Oldest first.
    pub history: Vec<Turn>,
    /// Empty means "use the default identity name".
    pub nickname: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserSession {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            memory: String::new(),
            history: Vec::new(),
            nickname: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn nickname(&self) -> Option<&str> {
        let trimmed = self.nickname.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    }

    /// Observations in the order they were recorded.
    pub fn memory_notes(&self) -> impl Iterator<Item = &str> {
        self.memory
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
    }

    /// The memory notes rendered as a single paragraph.
    pub fn memory_paragraph(&self) -> String {
        self.memory_notes().collect::<Vec<_>>().join(" ")
    }

    /// Append a user turn and an assistant turn, then keep only the newest
    /// `cap` entries.
    pub fn record_exchange(&mut self, user_text: &str, reply: &str, cap: usize) {
        self.history.push(Turn::user(user_text));
        self.history.push(Turn::assistant(reply));
        truncate_history(&mut self.history, cap);
        self.updated_at = Utc::now();
    }

    /// Add an observation unless an identical one is already remembered.
    /// Returns true when memory changed.
    pub fn remember(&mut self, observation: &str, max_chars: usize) -> bool {
        let note = collapse_whitespace(observation);
        if note.is_empty() {
            return false;
        }
        if self
            .memory_notes()
            .any(|existing| existing.to_lowercase() == note.to_lowercase())
        {
            return false;
        }

        let mut notes: Vec<String> = self.memory_notes().map(str::to_string).collect();
        notes.push(note);
        cap_notes(&mut notes, max_chars);
        self.memory = notes.join("\n");
        self.updated_at = Utc::now();
        true
    }

    /// Replace the nickname. An empty value or the agent's default name clears it.
    /// Returns true when the nickname changed.
    pub fn rename_agent(&mut self, nickname: &str, default_name: &str) -> bool {
        let collapsed = collapse_whitespace(nickname);
        let next = if collapsed.eq_ignore_ascii_case(&collapse_whitespace(default_name)) {
            String::new()
        } else {
            collapsed
        };
        if next == self.nickname {
            return false;
        }
        self.nickname = next;
        self.updated_at = Utc::now();
        true
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Drop oldest turns until at most `cap` remain.
pub fn truncate_history(history: &mut Vec<Turn>, cap: usize) {
    if history.len() > cap {
        let excess = history.len() - cap;
        history.drain(..excess);
    }
}

/// The most recent `window` turns.
pub fn window(history: &[Turn], window: usize) -> &[Turn] {
    let start = history.len().saturating_sub(window);
    &history[start..]
}

// The newest note always survives, even if it alone exceeds the budget.
fn cap_notes(notes: &mut Vec<String>, max_chars: usize) {
    let total = |notes: &[String]| -> usize {
        notes.iter().map(|n| n.chars().count()).sum::<usize>() + notes.len().saturating_sub(1)
    };
    while notes.len() > 1 && total(notes) > max_chars {
        notes.remove(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_starts_empty() {
        let session = UserSession::new("telegram:1", "Ann");
        assert!(session.memory.is_empty());
        assert!(session.history.is_empty());
        assert_eq!(session.nickname(), None);
        assert_eq!(session.memory_paragraph(), "");
    }

    #[test]
    fn history_stays_even_and_capped_after_many_exchanges() {
        let mut session = UserSession::new("u", "U");
        for i in 0..40 {
            session.record_exchange(&format!("q{}", i), &format!("a{}", i), DEFAULT_HISTORY_CAP);
            assert!(session.history.len() <= DEFAULT_HISTORY_CAP);
            assert_eq!(session.history.len() % 2, 0);
        }
        assert_eq!(session.history.first(), Some(&Turn::user("q25")));
        assert_eq!(session.history.last(), Some(&Turn::assistant("a39")));
    }

    #[test]
    fn window_returns_most_recent_turns() {
        let history: Vec<Turn> = (0..20).map(|i| Turn::user(i.to_string())).collect();
        let recent = window(&history, DEFAULT_PROMPT_WINDOW);
        assert_eq!(recent.len(), 14);
        assert_eq!(recent[0].content, "6");
        assert_eq!(window(&history[..3], 14).len(), 3);
    }

    #[test]
    fn remember_appends_and_skips_duplicates() {
        let mut session = UserSession::new("u", "U");
        assert!(session.remember("likes cats", 4000));
        assert!(session.remember("works  nights", 4000));
        assert!(!session.remember("Likes Cats", 4000));
        assert!(!session.remember("   ", 4000));
        assert_eq!(session.memory, "likes cats\nworks nights");
        assert_eq!(session.memory_paragraph(), "likes cats works nights");
    }

    #[test]
    fn remember_drops_oldest_notes_past_budget() {
        let mut session = UserSession::new("u", "U");
        session.remember("aaaaaaaaaa", 25);
        session.remember("bbbbbbbbbb", 25);
        session.remember("cccccccccc", 25);
        assert_eq!(session.memory, "bbbbbbbbbb\ncccccccccc");

        session.remember(&"d".repeat(40), 25);
        assert_eq!(session.memory, "d".repeat(40));
    }

    #[test]
    fn rename_agent_sets_and_clears() {
        let mut session = UserSession::new("u", "U");
        assert!(session.rename_agent(" Buddy ", "Rapport"));
        assert_eq!(session.nickname(), Some("Buddy"));
        assert!(!session.rename_agent("Buddy", "Rapport"));
        assert!(session.rename_agent("rapport", "Rapport"));
        assert_eq!(session.nickname(), None);
    }

    #[test]
    fn rename_agent_collapses_inner_whitespace() {
        let mut session = UserSession::new("u", "U");
        assert!(session.rename_agent("Nong \n  Mew", "Rapport"));
        assert_eq!(session.nickname, "Nong Mew");
        assert!(!session.rename_agent("Nong   Mew", "Rapport"));
    }
}
