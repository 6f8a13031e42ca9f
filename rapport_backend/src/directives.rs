//! Extraction of the bracketed state directives the model may append to a reply.
//!
//! Recognised forms are `[MEMORY: <observation>]` and `[NICKNAME: <name>]`,
//! matched ASCII case-insensitively. Both are located independently in the
//! raw text; the visible reply is whatever precedes the earliest one.
//!
//! Known limitation: a marker the model writes as prose (e.g. quoting
//! `[MEMORY: ...]` back to the user) is indistinguishable from a real
//! directive and will be consumed as one.

pub const MEMORY_MARKER: &str = "[MEMORY:";
pub const NICKNAME_MARKER: &str = "[NICKNAME:";
const DIRECTIVE_END: char = ']';

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedReply {
    pub visible_text: String,
    pub memory: Option<String>,
    pub nickname: Option<String>,
}

impl ParsedReply {
    pub fn has_directives(&self) -> bool {
        self.memory.is_some() || self.nickname.is_some()
    }
}

#[derive(Debug, Clone, Copy)]
struct Directive<'a> {
    start: usize,
    payload: &'a str,
}

/// Split raw model output into the user-visible reply and any directives.
///
/// An unterminated or empty directive counts as absent and leaves the text
/// around it untouched.
pub fn parse_reply(raw: &str) -> ParsedReply {
    let nickname = find_directive(raw, NICKNAME_MARKER);
    let memory = find_directive(raw, MEMORY_MARKER);

    let cut = [nickname, memory]
        .iter()
        .flatten()
        .map(|d| d.start)
        .min()
        .unwrap_or(raw.len());

    ParsedReply {
        visible_text: raw[..cut].trim().to_string(),
        memory: memory.map(|d| d.payload.to_string()),
        nickname: nickname.map(|d| d.payload.to_string()),
    }
}

fn find_directive<'a>(raw: &'a str, marker: &str) -> Option<Directive<'a>> {
    // ASCII uppercasing keeps byte offsets aligned with `raw`.
    let upper = raw.to_ascii_uppercase();
    let start = upper.find(marker)?;
    let payload_start = start + marker.len();
    let payload_len = raw[payload_start..].find(DIRECTIVE_END)?;
    let payload = raw[payload_start..payload_start + payload_len].trim();
    if payload.is_empty() {
        return None;
    }
    Some(Directive { start, payload })
}
