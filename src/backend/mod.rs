//! Backend capabilities the chat view depends on.
//!
//! SYSTEM CONTEXT
//! ==============
//! The hosted platform provides three things: table access plus the current
//! auth user (`DataAccess`), insert notifications (`LiveUpdates`) and user
//! profile lookup (`UserDirectory`). Each is an async trait so views take
//! them as explicit dependencies and tests swap in `memory::MemoryBackend`.
//!
//! DESIGN
//! ======
//! Rows travel as flat JSON objects; typed decoding happens in `model`.
//! Live updates are a bounded mpsc channel of [`InsertEvent`]s rather than
//! a callback, so teardown is just dropping or unsubscribing the receiver.

pub mod directory;
pub mod memory;
pub mod realtime;
pub mod rest;

use std::fmt;

use tokio::sync::mpsc;

use crate::error::BackendError;
use crate::model::{AuthUser, DirectoryUser};

/// Flat column -> value row.
pub type Row = serde_json::Map<String, serde_json::Value>;

// =============================================================================
// QUERY DESCRIPTORS
// =============================================================================

/// Conjunction of `column = value` conditions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Filter {
    conditions: Vec<(String, String)>,
}

impl Filter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a filter with one equality condition.
    #[must_use]
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new().and_eq(column, value)
    }

    /// Add an equality condition.
    #[must_use]
    pub fn and_eq(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.conditions.push((column.into(), value.into()));
        self
    }

    #[must_use]
    pub fn conditions(&self) -> &[(String, String)] {
        &self.conditions
    }

    /// Whether `row` satisfies every condition. Non-string values compare by
    /// their JSON text, so `true` matches `"true"` and `3` matches `"3"`.
    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        self.conditions.iter().all(|(column, expected)| match row.get(column) {
            Some(serde_json::Value::String(s)) => s == expected,
            Some(serde_json::Value::Null) | None => false,
            Some(other) => other.to_string() == *expected,
        })
    }
}

/// Sort order for a query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

impl Order {
    #[must_use]
    pub fn asc(column: impl Into<String>) -> Self {
        Self { column: column.into(), ascending: true }
    }

    #[must_use]
    pub fn desc(column: impl Into<String>) -> Self {
        Self { column: column.into(), ascending: false }
    }
}

// =============================================================================
// LIVE UPDATES
// =============================================================================

/// Handle identifying one live subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A row inserted by any client into a subscribed table.
#[derive(Clone, Debug, PartialEq)]
pub struct InsertEvent {
    pub table: String,
    pub record: Row,
}

/// An open subscription: its handle plus the channel events arrive on.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub events: mpsc::Receiver<InsertEvent>,
}

// =============================================================================
// CAPABILITIES
// =============================================================================

/// Table reads/writes and the authenticated user.
#[async_trait::async_trait]
pub trait DataAccess: Send + Sync {
    /// Fetch rows of `table` matching `filter`, optionally ordered.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] on transport or storage failure.
    async fn query(&self, table: &str, filter: &Filter, order: Option<&Order>) -> Result<Vec<Row>, BackendError>;

    /// Insert one row and return it as stored (with server-assigned columns).
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] if the insert is rejected or never completes.
    async fn insert(&self, table: &str, row: Row) -> Result<Row, BackendError>;

    /// The authenticated user, or `None` when signed out.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] if the auth service cannot be reached.
    async fn current_user(&self) -> Result<Option<AuthUser>, BackendError>;
}

/// Insert notifications for a filtered table.
#[async_trait::async_trait]
pub trait LiveUpdates: Send + Sync {
    /// Open a subscription delivering inserts into `table` that match `filter`.
    /// `buffer` bounds the event channel.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Subscribe`] if the channel cannot be opened.
    async fn subscribe(&self, table: &str, filter: &Filter, buffer: usize) -> Result<Subscription, BackendError>;

    /// Close a subscription. Unknown ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] if the platform rejects the leave.
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BackendError>;
}

/// Profile lookup by user id.
#[async_trait::async_trait]
pub trait UserDirectory: Send + Sync {
    /// # Errors
    ///
    /// Returns a [`BackendError`] if the directory cannot be queried.
    async fn get_user(&self, user_id: &str) -> Result<Option<DirectoryUser>, BackendError>;
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
