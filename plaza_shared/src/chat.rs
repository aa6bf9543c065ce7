//! Chat broadcast.
//!
//! Chat is ephemeral: it is fanned out to every connection in the session and
//! never stored in entity state.

use crate::entity::PlayerId;

/// Maximum message length in characters.
pub const MAX_MESSAGE_LENGTH: usize = 256;

/// A chat line as delivered to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender: PlayerId,
    pub sender_name: String,
    pub text: String,
}

/// Trims whitespace and truncates; `None` if nothing is left.
pub fn sanitize_text(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_MESSAGE_LENGTH).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_rejects_blank_and_truncates() {
        assert_eq!(sanitize_text("   \n\t"), None);
        assert_eq!(sanitize_text("  hi  ").as_deref(), Some("hi"));
        let long = "x".repeat(MAX_MESSAGE_LENGTH + 10);
        assert_eq!(
            sanitize_text(&long).map(|s| s.chars().count()),
            Some(MAX_MESSAGE_LENGTH)
        );
    }
}
