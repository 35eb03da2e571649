//! Group chat: message reconciliation and the compose box.
//!
//! ARCHITECTURE
//! ============
//! `log` is the pure ordered list with reconciliation rules. `session` wraps
//! it with the backend capabilities, a live subscription and teardown.
//! `compose` is the draft/in-flight state of the send form.

pub mod compose;
pub mod log;
pub mod session;
