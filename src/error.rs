//! Error taxonomy for backend calls and chat operations.
//!
//! ERROR HANDLING
//! ==============
//! Nothing in this crate retries on its own. Every error carries a grepable
//! code and a retryable hint, and converts into a [`Notice`] the view shows
//! as a transient toast. Send errors keep the text the user typed so the
//! compose box can be refilled.

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code plus retry hint, shared by every error in the crate.
pub trait ErrorCode {
    /// Stable machine-readable code, e.g. `"E_SEND_REJECTED"`.
    fn error_code(&self) -> &'static str;

    /// Whether repeating the same call may succeed.
    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// BACKEND
// =============================================================================

/// Failures reported by a backend capability.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The request never produced a response (DNS, TLS, socket, timeout).
    #[error("request failed: {0}")]
    Transport(String),

    /// The platform answered with a non-success HTTP status.
    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// A response or row could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The realtime channel could not be opened or joined.
    #[error("subscription failed: {0}")]
    Subscribe(String),

    /// The underlying HTTP client could not be constructed.
    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),

    /// The backend refused the call outright (in-memory fault injection).
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl ErrorCode for BackendError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "E_TRANSPORT",
            Self::Status { .. } => "E_STATUS",
            Self::Decode(_) => "E_DECODE",
            Self::Subscribe(_) => "E_SUBSCRIBE",
            Self::HttpClientBuild(_) => "E_HTTP_CLIENT_BUILD",
            Self::Unavailable(_) => "E_UNAVAILABLE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Subscribe(_) | Self::Unavailable(_) | Self::Status { status: 429 | 500..=599, .. }
        )
    }
}

// =============================================================================
// LOAD
// =============================================================================

/// Bulk load of a group's history failed or was discarded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("could not load messages: {0}")]
    Backend(#[from] BackendError),

    /// A newer load started before this one finished; its result wins.
    #[error("load superseded by a newer load")]
    Superseded,

    /// The view was torn down while the load was in flight.
    #[error("chat view is closed")]
    Closed,
}

impl ErrorCode for LoadError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Backend(_) => "E_LOAD",
            Self::Superseded => "E_LOAD_SUPERSEDED",
            Self::Closed => "E_CLOSED",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Backend(e) => e.retryable(),
            Self::Superseded | Self::Closed => false,
        }
    }
}

// =============================================================================
// SEND
// =============================================================================

/// A message could not be sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("message is empty")]
    EmptyContent,

    #[error("you must be logged in to send messages")]
    AuthRequired { content: String },

    #[error("you are not a member of group {group_id}")]
    NotMember { group_id: String, content: String },

    #[error("failed to send message: {source}")]
    Rejected { content: String, source: BackendError },

    #[error("chat view is closed")]
    Closed { content: String },
}

impl SendError {
    /// Text to put back into the compose box, if any.
    #[must_use]
    pub fn draft(&self) -> Option<&str> {
        match self {
            Self::EmptyContent => None,
            Self::AuthRequired { content }
            | Self::NotMember { content, .. }
            | Self::Rejected { content, .. }
            | Self::Closed { content } => Some(content),
        }
    }
}

impl ErrorCode for SendError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::EmptyContent => "E_EMPTY_MESSAGE",
            Self::AuthRequired { .. } => "E_AUTH_REQUIRED",
            Self::NotMember { .. } => "E_NOT_MEMBER",
            Self::Rejected { .. } => "E_SEND_REJECTED",
            Self::Closed { .. } => "E_CLOSED",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Rejected { source, .. } => source.retryable(),
            _ => false,
        }
    }
}

// =============================================================================
// NOTICE
// =============================================================================

/// Transient user-facing notification (toast) describing a failure.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Notice {
    pub title: String,
    pub description: String,
    pub code: &'static str,
}

impl From<&LoadError> for Notice {
    fn from(err: &LoadError) -> Self {
        Self { title: "Error".to_owned(), description: err.to_string(), code: err.error_code() }
    }
}

impl From<&SendError> for Notice {
    fn from(err: &SendError) -> Self {
        Self { title: "Error sending message".to_owned(), description: err.to_string(), code: err.error_code() }
    }
}

#[cfg(test)]
#[path = "error_test.rs"]
mod tests;
