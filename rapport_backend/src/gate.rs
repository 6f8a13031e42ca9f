//! Decides whether a message in a shared channel is addressed to the agent.

/// Everything the gate looks at for one inbound message.
#[derive(Debug, Clone, Copy)]
pub struct MentionCheck<'a> {
    pub text: &'a str,
    pub is_group: bool,
    /// The platform's own "you were mentioned / replied to" signal.
    pub structured_mention: bool,
    pub handle: &'a str,
    pub display_name: &'a str,
    /// The nickname this particular sender has given the agent.
    pub nickname: Option<&'a str>,
}

const MENTION_SIGIL: char = '@';

/// Direct messages always pass. Group messages pass on a structured mention
/// or when the text contains the handle (with or without `@`), the display
/// name, or the sender's nickname for the agent, case-insensitively.
pub fn should_process(check: &MentionCheck<'_>) -> bool {
    if !check.is_group || check.structured_mention {
        return true;
    }

    let text = check.text.to_lowercase();
    let bare_handle = check.handle.trim().trim_start_matches(MENTION_SIGIL);
    let sigil_handle = if bare_handle.is_empty() {
        String::new()
    } else {
        format!("{}{}", MENTION_SIGIL, bare_handle)
    };

    [
        bare_handle,
        sigil_handle.as_str(),
        check.display_name,
        check.nickname.unwrap_or(""),
    ]
    .iter()
    .map(|name| name.trim())
    // An empty needle would match every message.
    .filter(|name| !name.is_empty())
    .any(|name| text.contains(&name.to_lowercase()))
}
