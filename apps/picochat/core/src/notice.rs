//! Text of the notifications the relay broadcasts.

use crate::MAX_NAME_LENGTH;

/// Removes the newline and tab characters clients may smuggle into a line.
pub fn strip_controls(text: &str) -> String {
    text.chars().filter(|ch| !matches!(ch, '\n' | '\t')).collect()
}

/// Derives a display name from a decoded handshake payload: the leading
/// [`MAX_NAME_LENGTH`] characters with newlines and tabs removed afterwards.
/// An empty result is still a name.
pub fn display_name(handshake: &str) -> String {
    let leading: String = handshake.chars().take(MAX_NAME_LENGTH).collect();
    strip_controls(&leading)
}

pub fn join_notice(display_name: &str) -> String {
    format!("\n++ {display_name} joined")
}

pub fn leave_notice(display_name: &str) -> String {
    format!("\n-- {display_name} left")
}

/// Chat line as seen by every other client. `content` is stripped here.
pub fn chat_notice(display_name: &str, content: &str) -> String {
    format!("{display_name}:\n  {}", strip_controls(content))
}
