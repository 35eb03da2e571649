//! # studygroup
//!
//! Client-side core for study-group chat: a live, duplicate-free view of one
//! group's messages kept in sync across a bulk load, optimistic local sends,
//! and realtime insert notifications from the hosted backend.
//!
//! SYSTEM CONTEXT
//! ==============
//! Persistence, auth and realtime fan-out belong to the hosted platform.
//! `backend` exposes them as three async capabilities (`DataAccess`,
//! `LiveUpdates`, `UserDirectory`) with HTTP, websocket and in-memory
//! implementations. `chat` owns the reconciliation logic on top of them.

pub mod backend;
pub mod chat;
pub mod config;
pub mod error;
pub mod model;

pub use chat::session::{ChatDeps, ChatSession};
pub use config::{BackendConfig, ChatConfig};
pub use error::{BackendError, ErrorCode, LoadError, Notice, SendError};
pub use model::{ChatMessage, MessageId};
