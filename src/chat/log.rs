//! Ordered, duplicate-free message list for one group.
//!
//! DESIGN
//! ======
//! Entries are kept sorted by `created_at`; equal timestamps keep insertion
//! order. Every entry carries a monotonically increasing sequence number so
//! a reload can tell which entries arrived after it started and keep them.
//!
//! INVARIANTS
//! ==========
//! - Ids are unique. Temporary and server ids never collide.
//! - `created_at` is non-decreasing in iteration order.
//! - A provisional entry is only ever confirmed (id swapped in place) or
//!   removed; it is never duplicated by its own confirmation. A reload
//!   keeps it until one of those happens.

use std::collections::HashSet;

use tracing::debug;

use crate::model::{ChatMessage, MessageId};

#[derive(Clone, Debug)]
struct Entry {
    seq: u64,
    message: ChatMessage,
}

/// Outcome of [`MessageLog::confirm`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Confirmation {
    /// The provisional entry now carries the server id.
    Reconciled,
    /// The server id was already present (delivered remotely or by a
    /// reload); the provisional entry was dropped in its favor and its
    /// author label carried over.
    Deduplicated,
    /// The provisional entry was already gone; the confirmed message was
    /// inserted.
    Inserted,
    /// Neither the provisional entry nor a missing server id: nothing to do.
    AlreadyPresent,
}

#[derive(Clone, Debug, Default)]
pub struct MessageLog {
    entries: Vec<Entry>,
    next_seq: u64,
}

impl MessageLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Messages in display order.
    pub fn iter(&self) -> impl Iterator<Item = &ChatMessage> {
        self.entries.iter().map(|e| &e.message)
    }

    #[must_use]
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.iter().cloned().collect()
    }

    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.position(id).is_some()
    }

    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&ChatMessage> {
        self.position(id).map(|idx| &self.entries[idx].message)
    }

    /// Sequence number the next inserted entry will get. Pass it to
    /// [`Self::replace`] to keep entries that arrive after this point.
    #[must_use]
    pub fn checkpoint(&self) -> u64 {
        self.next_seq
    }

    /// Replace the list with `loaded` (sorted, deduplicated by id). Entries
    /// inserted at or after `since` that the load does not contain are kept,
    /// as are all provisional entries.
    pub fn replace(&mut self, loaded: Vec<ChatMessage>, since: u64) {
        let late: Vec<Entry> = std::mem::take(&mut self.entries)
            .into_iter()
            .filter(|e| e.seq >= since || e.message.is_provisional())
            .collect();

        let mut seen = HashSet::with_capacity(loaded.len());
        let mut fresh: Vec<ChatMessage> = loaded.into_iter().filter(|m| seen.insert(m.id.clone())).collect();
        fresh.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        for message in fresh {
            let seq = self.bump_seq();
            self.entries.push(Entry { seq, message });
        }

        let mut kept = 0usize;
        for entry in late {
            if !self.contains(&entry.message.id) {
                self.insert_entry(entry);
                kept += 1;
            }
        }
        if kept > 0 {
            debug!(kept, "kept entries that raced the reload");
        }
    }

    /// Insert a locally-originated message that awaits confirmation.
    /// Returns false if the id is already present.
    pub fn insert_provisional(&mut self, message: ChatMessage) -> bool {
        self.insert_new(message)
    }

    /// Merge a message learned from a remote notification. No-op (returns
    /// false) when its id is already present.
    pub fn merge_remote(&mut self, message: ChatMessage) -> bool {
        self.insert_new(message)
    }

    /// Reconcile the provisional entry `temp_id` with its server-confirmed
    /// form. Content and timestamp are taken from `confirmed` only when they
    /// differ; a timestamp change re-sorts the entry.
    pub fn confirm(&mut self, temp_id: &MessageId, confirmed: ChatMessage) -> Confirmation {
        let server_present = self.contains(&confirmed.id);

        let Some(idx) = self.position(temp_id) else {
            if server_present {
                return Confirmation::AlreadyPresent;
            }
            self.insert_new(confirmed);
            return Confirmation::Inserted;
        };

        if server_present {
            let dropped = self.entries.remove(idx).message;
            if let Some(pos) = self.position(&confirmed.id) {
                self.entries[pos].message.author_display_name = dropped.author_display_name;
            }
            return Confirmation::Deduplicated;
        }

        let entry = &mut self.entries[idx];
        entry.message.id = confirmed.id;
        if entry.message.content != confirmed.content {
            entry.message.content = confirmed.content;
        }
        if entry.message.created_at != confirmed.created_at {
            entry.message.created_at = confirmed.created_at;
            let entry = self.entries.remove(idx);
            self.insert_entry(entry);
        }
        Confirmation::Reconciled
    }

    /// Remove the provisional entry `temp_id`, returning it if present.
    pub fn discard(&mut self, temp_id: &MessageId) -> Option<ChatMessage> {
        let idx = self.position(temp_id)?;
        Some(self.entries.remove(idx).message)
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.entries.iter().position(|e| e.message.id == *id)
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn insert_new(&mut self, message: ChatMessage) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        let seq = self.bump_seq();
        self.insert_entry(Entry { seq, message });
        true
    }

    /// Insert after every entry with `created_at <= entry.created_at`.
    fn insert_entry(&mut self, entry: Entry) {
        let at = self
            .entries
            .partition_point(|e| e.message.created_at <= entry.message.created_at);
        self.entries.insert(at, entry);
    }
}

#[cfg(test)]
#[path = "log_test.rs"]
mod tests;
