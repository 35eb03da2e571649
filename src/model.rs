//! Chat message model and the table rows it is built from.
//!
//! SYSTEM CONTEXT
//! ==============
//! Rows mirror the hosted tables (`group_messages`, `users`,
//! `group_members`) and the auth profile. `ChatMessage` is the view model:
//! one row plus a resolved author label, with an id that records whether the
//! server has confirmed it yet.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use uuid::Uuid;

use crate::backend::Row;
use crate::error::BackendError;

const TEMP_ID_PREFIX: &str = "tmp-";

// =============================================================================
// MESSAGE ID
// =============================================================================

/// Message identifier. Temporary ids exist only in local state until the
/// server assigns a permanent one; the two kinds never compare equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageId {
    Server(String),
    Temporary(Uuid),
}

impl MessageId {
    /// Fresh locally-unique temporary id.
    #[must_use]
    pub fn temporary() -> Self {
        Self::Temporary(Uuid::new_v4())
    }

    #[must_use]
    pub fn server(id: impl Into<String>) -> Self {
        Self::Server(id.into())
    }

    /// True while the message awaits server confirmation.
    #[must_use]
    pub fn is_provisional(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(id) => f.write_str(id),
            Self::Temporary(id) => write!(f, "{TEMP_ID_PREFIX}{id}"),
        }
    }
}

impl Serialize for MessageId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// =============================================================================
// CHAT MESSAGE
// =============================================================================

/// A message as rendered in a group's chat list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub group_id: String,
    pub author_id: String,
    /// Denormalized label; re-derivable from the user directory.
    pub author_display_name: String,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl ChatMessage {
    #[must_use]
    pub fn is_provisional(&self) -> bool {
        self.id.is_provisional()
    }

    /// Build a confirmed message from a stored row.
    #[must_use]
    pub fn from_row(row: MessageRow, author_display_name: String) -> Self {
        let created_at = row.created_at();
        Self {
            id: MessageId::Server(row.id),
            group_id: row.group_id,
            author_id: row.user_id,
            author_display_name,
            content: row.content,
            created_at,
        }
    }
}

// =============================================================================
// ROWS
// =============================================================================

/// One `group_messages` row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: String,
    pub group_id: String,
    pub user_id: String,
    pub content: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl MessageRow {
    /// Decode a generic row.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Decode`] if a required column is missing or mistyped.
    pub fn from_row(row: &Row) -> Result<Self, BackendError> {
        decode_row(row)
    }

    /// Parsed creation time. Rows without a timestamp sort as "now".
    #[must_use]
    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or_else(OffsetDateTime::now_utc)
    }
}

/// Insert payload for `group_messages`; id and timestamp come from the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NewMessageRow<'a> {
    pub group_id: &'a str,
    pub user_id: &'a str,
    pub content: &'a str,
}

impl NewMessageRow<'_> {
    #[must_use]
    pub fn into_row(self) -> Row {
        let mut row = Row::new();
        row.insert("group_id".to_owned(), self.group_id.into());
        row.insert("user_id".to_owned(), self.user_id.into());
        row.insert("content".to_owned(), self.content.into());
        row
    }
}

/// One `users` row as exposed by the user directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub username: Option<String>,
}

/// One `group_members` row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRow {
    pub group_id: String,
    pub user_id: String,
    #[serde(default)]
    pub is_admin: bool,
}

/// The authenticated user, as reported by the auth service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    /// `user_metadata.full_name` from the auth profile.
    #[serde(default)]
    pub full_name: Option<String>,
}

pub(crate) fn decode_row<T: serde::de::DeserializeOwned>(row: &Row) -> Result<T, BackendError> {
    serde_json::from_value(serde_json::Value::Object(row.clone())).map_err(|e| BackendError::Decode(e.to_string()))
}

// =============================================================================
// DISPLAY NAMES
// =============================================================================

/// Label for the local author of an optimistic message.
#[must_use]
pub fn local_display_name(user: &AuthUser, fallback: &str) -> String {
    non_blank(user.full_name.as_deref())
        .or_else(|| user.email.as_deref().and_then(email_local_part))
        .unwrap_or(fallback)
        .to_owned()
}

/// Label for the author of a loaded or remotely-notified message.
#[must_use]
pub fn remote_display_name(user: Option<&DirectoryUser>, placeholder: &str) -> String {
    user.and_then(|u| non_blank(u.username.as_deref()).or_else(|| email_local_part(&u.email)))
        .unwrap_or(placeholder)
        .to_owned()
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn email_local_part(email: &str) -> Option<&str> {
    email.split('@').next().map(str::trim).filter(|v| !v.is_empty())
}

// =============================================================================
// TIMESTAMPS
// =============================================================================

/// Parse a stored timestamp. Accepts RFC 3339, or an offset-less
/// `YYYY-MM-DD[T ]HH:MM:SS[.fff]` read as UTC.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    if let Ok(ts) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(ts);
    }
    let naive = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]");
    PrimitiveDateTime::parse(&raw.replacen(' ', "T", 1), naive)
        .map(PrimitiveDateTime::assume_utc)
        .ok()
}

/// Format a timestamp the way the platform stores it.
#[must_use]
pub fn format_timestamp(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_else(|_| ts.unix_timestamp().to_string())
}

#[cfg(test)]
#[path = "model_test.rs"]
mod tests;
