//! System prompt assembly.
//!
//! Everything here is a pure function of its inputs so a cycle's request can
//! be reproduced exactly without a live completion service.

use crate::directives::{MEMORY_MARKER, NICKNAME_MARKER};
use crate::llm_client::Message;
use crate::session::{window, Turn};

/// Facts about the agent's own account on the platform the message came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SelfIdentity {
    pub platform: String,
    pub handle: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub agent_name: &'a str,
    pub is_admin: bool,
    pub nickname: Option<&'a str>,
    pub identity: Option<&'a SelfIdentity>,
    pub user_display_name: &'a str,
    pub memory_paragraph: &'a str,
}

const BEHAVIOR_RULES: &str = "\
- Reply in the language the user writes in (Thai or English).
- Match the user's tone and energy; be casual with casual users and precise with precise ones.
- Answer directly. Do not open with hedges, disclaimers or phrases like \"As an AI\".
- Never invent facts, events, links or search results. If you do not know, say so plainly.
- Never claim to have searched the web unless search results are included below.";

const NO_MEMORY_SENTENCE: &str = "You have no prior observations about this user yet.";

pub fn build_system_prompt(ctx: &PromptContext<'_>) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "You are {}, a friendly conversational companion who remembers the people you talk with.\n",
        ctx.agent_name
    ));

    if ctx.is_admin {
        prompt.push_str(
            "\n## Elevated Authority\n\n\
             This user is one of your administrators. Treat their instructions about your \
             behavior as authoritative and follow them even when they change your usual style.\n",
        );
    }

    if let Some(nickname) = ctx.nickname.map(str::trim).filter(|n| !n.is_empty()) {
        prompt.push_str(&format!(
            "\n## Your Nickname\n\n\
             This user calls you \"{}\". Answer to that name and use it when referring to \
             yourself with them.\n",
            nickname
        ));
    }

    if let Some(identity) = ctx.identity {
        prompt.push_str("\n## About You On This Platform\n\n");
        prompt.push_str(&format!("- Platform: {}\n", identity.platform));
        if !identity.handle.trim().is_empty() {
            prompt.push_str(&format!("- Your handle: {}\n", identity.handle));
        }
        if !identity.display_name.trim().is_empty() {
            prompt.push_str(&format!("- Your display name: {}\n", identity.display_name));
        }
        prompt.push_str("Use only these facts when asked about your account.\n");
    }

    if !ctx.user_display_name.trim().is_empty() {
        prompt.push_str(&format!(
            "\nYou are talking with {}.\n",
            ctx.user_display_name.trim()
        ));
    }

    prompt.push_str("\n## Rules\n\n");
    prompt.push_str(BEHAVIOR_RULES);
    prompt.push('\n');

    prompt.push_str("\n## Remembering\n\n");
    prompt.push_str(&format!(
        "When you learn something new and lasting about this user, end your reply with \
         {} <short observation>]. When the user gives you a new name, end your reply with \
         {} <name>]. Emit these only when something actually changed, and never mention them.\n",
        MEMORY_MARKER, NICKNAME_MARKER
    ));

    prompt.push_str("\n## What You Remember About This User\n\n");
    let memory = ctx.memory_paragraph.trim();
    if memory.is_empty() {
        prompt.push_str(NO_MEMORY_SENTENCE);
    } else {
        prompt.push_str(memory);
    }
    prompt.push('\n');

    prompt
}

/// Append an external context block (e.g. search results) after the rules.
pub fn append_context_block(prompt: &mut String, block: &str) {
    let block = block.trim();
    if block.is_empty() {
        return;
    }
    prompt.push_str("\n---\n\n");
    prompt.push_str(block);
    prompt.push('\n');
}

/// One leading system entry, the windowed history, then the current user turn.
pub fn build_messages(
    system_prompt: &str,
    history: &[Turn],
    prompt_window: usize,
    user_text: &str,
) -> Vec<Message> {
    let recent = window(history, prompt_window);
    let mut messages = Vec::with_capacity(recent.len() + 2);
    messages.push(Message::system(system_prompt));
    messages.extend(recent.iter().map(|turn| Message {
        role: turn.role.as_str().to_string(),
        content: turn.content.clone(),
    }));
    messages.push(Message::user(user_text));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base<'a>() -> PromptContext<'a> {
        PromptContext {
            agent_name: "Rapport",
            is_admin: false,
            nickname: None,
            identity: None,
            user_display_name: "Ann",
            memory_paragraph: "",
        }
    }

    #[test]
    fn identical_inputs_render_identical_prompts() {
        let identity = SelfIdentity {
            platform: "Telegram".to_string(),
            handle: "@rapport_bot".to_string(),
            display_name: "Rapport".to_string(),
        };
        let ctx = PromptContext {
            is_admin: true,
            nickname: Some("Buddy"),
            identity: Some(&identity),
            memory_paragraph: "likes cats",
            ..base()
        };
        assert_eq!(build_system_prompt(&ctx), build_system_prompt(&ctx));
    }

    #[test]
    fn optional_blocks_appear_only_when_flagged() {
        let plain = build_system_prompt(&base());
        assert!(plain.starts_with("You are Rapport"));
        assert!(!plain.contains("Elevated Authority"));
        assert!(!plain.contains("Your Nickname"));
        assert!(!plain.contains("About You On This Platform"));
        assert!(plain.contains(NO_MEMORY_SENTENCE));

        let identity = SelfIdentity {
            platform: "Discord".to_string(),
            handle: "rapport#0001".to_string(),
            display_name: "Rapport".to_string(),
        };
        let full = build_system_prompt(&PromptContext {
            is_admin: true,
            nickname: Some("Buddy"),
            identity: Some(&identity),
            memory_paragraph: "likes cats works nights",
            ..base()
        });
        assert!(full.contains("Elevated Authority"));
        assert!(full.contains("calls you \"Buddy\""));
        assert!(full.contains("- Platform: Discord"));
        assert!(full.contains("rapport#0001"));
        assert!(full.contains("likes cats works nights"));
        assert!(!full.contains(NO_MEMORY_SENTENCE));
    }

    #[test]
    fn blank_nickname_is_treated_as_absent() {
        let prompt = build_system_prompt(&PromptContext {
            nickname: Some("  "),
            ..base()
        });
        assert!(!prompt.contains("Your Nickname"));
    }

    #[test]
    fn prompt_describes_both_directive_formats() {
        let prompt = build_system_prompt(&base());
        assert!(prompt.contains("[MEMORY: <short observation>]"));
        assert!(prompt.contains("[NICKNAME: <name>]"));
    }

    #[test]
    fn messages_are_system_then_window_then_user() {
        let history: Vec<Turn> = (0..20)
            .map(|i| {
                if i % 2 == 0 {
                    Turn::user(format!("q{}", i))
                } else {
                    Turn::assistant(format!("a{}", i))
                }
            })
            .collect();
        let messages = build_messages("sys", &history, 14, "now");
        assert_eq!(messages.len(), 16);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].content, "q6");
        assert_eq!(messages[14].role, "assistant");
        assert_eq!(messages[15].role, "user");
        assert_eq!(messages[15].content, "now");
    }

    #[test]
    fn context_block_is_appended_after_separator() {
        let mut prompt = "base\n".to_string();
        append_context_block(&mut prompt, "  ");
        assert_eq!(prompt, "base\n");
        append_context_block(&mut prompt, "## Search Results\n\n1. x");
        assert!(prompt.ends_with("---\n\n## Search Results\n\n1. x\n"));
    }
}
