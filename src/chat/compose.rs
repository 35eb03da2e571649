//! Compose box state: the draft text and the in-flight flag.
//!
//! The send control is disabled while the draft is blank or a send is in
//! flight. Beginning a send takes the draft; a failed send puts it back.

use crate::error::SendError;
use crate::model::ChatMessage;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ComposeState {
    draft: String,
    sending: bool,
}

impl ComposeState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn draft(&self) -> &str {
        &self.draft
    }

    #[must_use]
    pub fn is_sending(&self) -> bool {
        self.sending
    }

    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.draft = text.into();
    }

    /// Whether the send control should be enabled.
    #[must_use]
    pub fn can_send(&self) -> bool {
        !self.sending && !self.draft.trim().is_empty()
    }

    /// Take the draft for sending and mark a send in flight. Returns `None`
    /// when sending is not allowed right now.
    pub fn begin_send(&mut self) -> Option<String> {
        if !self.can_send() {
            return None;
        }
        self.sending = true;
        Some(std::mem::take(&mut self.draft))
    }

    /// Clear the in-flight flag. On failure the typed text is restored
    /// unless the user already started a new draft.
    pub fn finish(&mut self, result: &Result<ChatMessage, SendError>) {
        self.sending = false;
        if let Err(err) = result {
            if let Some(content) = err.draft() {
                if self.draft.is_empty() {
                    content.clone_into(&mut self.draft);
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "compose_test.rs"]
mod tests;
