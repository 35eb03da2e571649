//! Terminal rendering of chat messages and notices.

use std::collections::HashSet;

use studygroup::{ChatMessage, MessageId, Notice};
use time::macros::format_description;

/// Prints each confirmed message once, in list order. Provisional entries
/// are held back until the server confirms them.
pub struct Printer {
    json: bool,
    printed: HashSet<MessageId>,
}

impl Printer {
    pub fn new(json: bool) -> Self {
        Self { json, printed: HashSet::new() }
    }

    /// Lines for messages not printed yet.
    pub fn pending_lines(&mut self, messages: &[ChatMessage]) -> Result<Vec<String>, serde_json::Error> {
        let mut lines = Vec::new();
        for message in messages.iter().filter(|m| !m.is_provisional()) {
            if self.printed.insert(message.id.clone()) {
                lines.push(self.render(message)?);
            }
        }
        Ok(lines)
    }

    fn render(&self, message: &ChatMessage) -> Result<String, serde_json::Error> {
        if self.json { serde_json::to_string(message) } else { Ok(format_line(message)) }
    }
}

/// `[HH:MM:SS] author: content`
pub fn format_line(message: &ChatMessage) -> String {
    let clock = format_description!("[hour]:[minute]:[second]");
    let stamp = message
        .created_at
        .format(clock)
        .unwrap_or_else(|_| message.created_at.unix_timestamp().to_string());
    format!("[{stamp}] {}: {}", message.author_display_name, message.content)
}

pub fn format_notice(notice: &Notice) -> String {
    format!("{}: {} ({})", notice.title, notice.description, notice.code)
}

#[cfg(test)]
#[path = "render_test.rs"]
mod tests;
