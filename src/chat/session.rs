//! Live chat view for one group.
//!
//! DESIGN
//! ======
//! A `ChatSession` merges three sources into one [`MessageLog`]: the bulk
//! history load, optimistic local sends and realtime insert notifications.
//! The state mutex is never held across backend I/O, so notifications keep
//! merging while a load or send is in flight. Every list change bumps a
//! `watch` revision so views can re-render.
//!
//! LIFECYCLE
//! =========
//! `open` subscribes and spawns a listener that holds only a `Weak` handle.
//! `teardown` closes the session exactly once: the listener stops, the
//! subscription is released, and late completions of in-flight loads or
//! sends no longer touch the list.
//!
//! RACE TO RECONCILE
//! =================
//! The subscription is not filtered by author, so a user's own send can
//! arrive as a notification before the insert call returns. The notification
//! lands under the server id; when the insert returns, the provisional entry
//! is dropped in favor of it instead of being confirmed into a duplicate.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use time::OffsetDateTime;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::log::{Confirmation, MessageLog};
use crate::backend::directory::TableDirectory;
use crate::backend::memory::MemoryBackend;
use crate::backend::realtime::RealtimeClient;
use crate::backend::rest::RestClient;
use crate::backend::{DataAccess, Filter, InsertEvent, LiveUpdates, Order, SubscriptionId, UserDirectory};
use crate::config::{BackendConfig, ChatConfig};
use crate::error::{BackendError, LoadError, SendError};
use crate::model::{ChatMessage, MessageId, MessageRow, NewMessageRow, local_display_name, remote_display_name};

// =============================================================================
// DEPENDENCIES
// =============================================================================

/// Backend capabilities a session runs against.
#[derive(Clone)]
pub struct ChatDeps {
    pub data: Arc<dyn DataAccess>,
    pub live: Arc<dyn LiveUpdates>,
    pub directory: Arc<dyn UserDirectory>,
}

impl ChatDeps {
    /// Every capability served by one in-memory backend.
    #[must_use]
    pub fn in_memory(backend: &Arc<MemoryBackend>, config: &ChatConfig) -> Self {
        let data: Arc<dyn DataAccess> = backend.clone();
        let directory = Arc::new(TableDirectory::new(data.clone(), config.users_table.clone()));
        Self { data, live: backend.clone(), directory }
    }

    /// REST for data and directory, websocket for live updates.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::HttpClientBuild`] if the HTTP client cannot be built.
    pub fn hosted(backend: &BackendConfig, config: &ChatConfig) -> Result<Self, BackendError> {
        let data: Arc<dyn DataAccess> = Arc::new(RestClient::new(backend)?);
        let directory = Arc::new(TableDirectory::new(data.clone(), config.users_table.clone()));
        Ok(Self { data, live: Arc::new(RealtimeClient::new(backend)), directory })
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// Cheap-to-clone handle on one group's live chat state.
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<Inner>,
}

struct Inner {
    group_id: String,
    config: ChatConfig,
    deps: ChatDeps,
    state: Mutex<SessionState>,
    revision: watch::Sender<u64>,
    listener: Mutex<Option<Listener>>,
}

#[derive(Default)]
struct SessionState {
    log: MessageLog,
    /// Resolved author labels by user id. Only successful lookups are cached.
    authors: HashMap<String, String>,
    load_generation: u64,
    closed: bool,
}

struct Listener {
    subscription: SubscriptionId,
    task: JoinHandle<()>,
}

impl ChatSession {
    /// Subscribe to the group's inserts and start merging them.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::Backend`] if the subscription cannot be opened.
    pub async fn open(group_id: impl Into<String>, deps: ChatDeps, config: ChatConfig) -> Result<Self, LoadError> {
        let group_id = group_id.into();
        let filter = Filter::eq("group_id", group_id.clone());
        let subscription = deps
            .live
            .subscribe(&config.messages_table, &filter, config.event_buffer)
            .await
            .inspect_err(|e| warn!(group_id = %group_id, error = %e, "chat subscription failed"))?;

        let (revision, _) = watch::channel(0);
        let inner = Arc::new(Inner {
            group_id,
            config,
            deps,
            state: Mutex::new(SessionState::default()),
            revision,
            listener: Mutex::new(None),
        });

        let task = tokio::spawn(listen(Arc::downgrade(&inner), subscription.events));
        *inner.listener.lock().await = Some(Listener { subscription: subscription.id, task });

        info!(group_id = %inner.group_id, subscription = %subscription.id, "chat session opened");
        Ok(Self { inner })
    }

    #[must_use]
    pub fn group_id(&self) -> &str {
        &self.inner.group_id
    }

    /// Snapshot of the list in display order.
    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.inner.state.lock().await.log.messages()
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.state.lock().await.closed
    }

    /// Current list revision; bumped on every change.
    #[must_use]
    pub fn revision(&self) -> u64 {
        *self.inner.revision.borrow()
    }

    /// Receiver that wakes on every list change.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    /// Fetch the group's history and replace the list with it. Entries that
    /// arrived while the fetch was in flight are kept.
    ///
    /// # Errors
    ///
    /// - [`LoadError::Backend`] if the query fails. Nothing is retried.
    /// - [`LoadError::Superseded`] if a newer load started meanwhile.
    /// - [`LoadError::Closed`] if the session was torn down.
    pub async fn load_initial(&self) -> Result<Vec<ChatMessage>, LoadError> {
        let inner = &self.inner;
        let (generation, since) = {
            let mut state = inner.state.lock().await;
            if state.closed {
                return Err(LoadError::Closed);
            }
            state.load_generation += 1;
            (state.load_generation, state.log.checkpoint())
        };

        let filter = Filter::eq("group_id", inner.group_id.clone());
        let rows = inner
            .deps
            .data
            .query(&inner.config.messages_table, &filter, Some(&Order::asc("created_at")))
            .await
            .inspect_err(|e| warn!(group_id = %inner.group_id, error = %e, "message load failed"))?;

        let mut loaded = Vec::with_capacity(rows.len());
        for row in &rows {
            match MessageRow::from_row(row) {
                Ok(row) => {
                    let name = inner.author_name(&row.user_id).await;
                    loaded.push(ChatMessage::from_row(row, name));
                }
                Err(e) => warn!(group_id = %inner.group_id, error = %e, "skipping malformed message row"),
            }
        }

        let snapshot = {
            let mut state = inner.state.lock().await;
            if state.closed {
                debug!(group_id = %inner.group_id, "load finished after teardown; discarded");
                return Err(LoadError::Closed);
            }
            if state.load_generation != generation {
                debug!(group_id = %inner.group_id, generation, "load superseded; discarded");
                return Err(LoadError::Superseded);
            }
            state.log.replace(loaded, since);
            state.log.messages()
        };
        inner.bump_revision();

        info!(group_id = %inner.group_id, count = snapshot.len(), "chat history loaded");
        Ok(snapshot)
    }

    /// Send `content` as the current user. The message appears immediately
    /// as provisional and is reconciled with the stored row when the insert
    /// returns, or removed if it fails.
    ///
    /// # Errors
    ///
    /// - [`SendError::EmptyContent`] for blank content; nothing is contacted.
    /// - [`SendError::AuthRequired`] when no user is signed in.
    /// - [`SendError::NotMember`] when membership checks are on and fail.
    /// - [`SendError::Rejected`] when the insert fails.
    /// - [`SendError::Closed`] when the session was already torn down.
    pub async fn send_message(&self, content: &str) -> Result<ChatMessage, SendError> {
        let inner = &self.inner;
        let text = content.trim();
        if text.is_empty() {
            return Err(SendError::EmptyContent);
        }
        if self.is_closed().await {
            return Err(SendError::Closed { content: content.to_owned() });
        }

        let user = match inner.deps.data.current_user().await {
            Ok(Some(user)) => user,
            Ok(None) => return Err(SendError::AuthRequired { content: content.to_owned() }),
            Err(e) => {
                warn!(group_id = %inner.group_id, error = %e, "could not resolve current user");
                return Err(SendError::AuthRequired { content: content.to_owned() });
            }
        };

        if inner.config.verify_membership {
            inner.check_membership(&user.id, content).await?;
        }

        let author_display_name = local_display_name(&user, &inner.config.self_author);
        let provisional = ChatMessage {
            id: MessageId::temporary(),
            group_id: inner.group_id.clone(),
            author_id: user.id.clone(),
            author_display_name: author_display_name.clone(),
            content: text.to_owned(),
            created_at: OffsetDateTime::now_utc(),
        };
        let temp_id = provisional.id.clone();
        {
            let mut state = inner.state.lock().await;
            if state.closed {
                return Err(SendError::Closed { content: content.to_owned() });
            }
            state.log.insert_provisional(provisional);
        }
        inner.bump_revision();
        debug!(group_id = %inner.group_id, temp_id = %temp_id, "provisional message inserted");

        let row = NewMessageRow { group_id: &inner.group_id, user_id: &user.id, content: text }.into_row();
        let stored = inner
            .deps
            .data
            .insert(&inner.config.messages_table, row)
            .await
            .and_then(|row| MessageRow::from_row(&row));

        match stored {
            Ok(row) => {
                let confirmed = ChatMessage::from_row(row, author_display_name);
                let outcome = {
                    let mut state = inner.state.lock().await;
                    if state.closed {
                        debug!(group_id = %inner.group_id, id = %confirmed.id, "send finished after teardown; list untouched");
                        return Ok(confirmed);
                    }
                    state.log.confirm(&temp_id, confirmed.clone())
                };
                if outcome != Confirmation::AlreadyPresent {
                    inner.bump_revision();
                }
                debug!(group_id = %inner.group_id, temp_id = %temp_id, id = %confirmed.id, ?outcome, "message confirmed");
                Ok(confirmed)
            }
            Err(source) => {
                warn!(group_id = %inner.group_id, temp_id = %temp_id, error = %source, "send failed; removing provisional message");
                let removed = {
                    let mut state = inner.state.lock().await;
                    if state.closed { None } else { state.log.discard(&temp_id) }
                };
                if removed.is_some() {
                    inner.bump_revision();
                }
                Err(SendError::Rejected { content: content.to_owned(), source })
            }
        }
    }

    /// Merge one insert notification. Returns whether the list changed.
    /// Known ids, other groups' rows and malformed rows are ignored; a
    /// failed author lookup falls back to the placeholder label.
    pub async fn on_remote_insert(&self, event: InsertEvent) -> bool {
        let inner = &self.inner;
        if event.table != inner.config.messages_table {
            debug!(table = %event.table, "ignoring notification for another table");
            return false;
        }
        let row = match MessageRow::from_row(&event.record) {
            Ok(row) => row,
            Err(e) => {
                warn!(group_id = %inner.group_id, error = %e, "dropping malformed notification");
                return false;
            }
        };
        if row.group_id != inner.group_id {
            debug!(group_id = %inner.group_id, other = %row.group_id, "ignoring notification for another group");
            return false;
        }

        let id = MessageId::server(row.id.clone());
        {
            let state = inner.state.lock().await;
            if state.closed || state.log.contains(&id) {
                return false;
            }
        }

        let name = inner.author_name(&row.user_id).await;
        let added = {
            let mut state = inner.state.lock().await;
            !state.closed && state.log.merge_remote(ChatMessage::from_row(row, name))
        };
        if added {
            inner.bump_revision();
            debug!(group_id = %inner.group_id, id = %id, "remote message merged");
        }
        added
    }

    /// Close the session: stop listening and release the subscription.
    /// Safe to call more than once; only the first call does anything.
    pub async fn teardown(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
        }

        let listener = inner.listener.lock().await.take();
        if let Some(listener) = listener {
            listener.task.abort();
            if let Err(e) = inner.deps.live.unsubscribe(listener.subscription).await {
                warn!(group_id = %inner.group_id, error = %e, "unsubscribe failed");
            }
        }
        info!(group_id = %inner.group_id, "chat session closed");
    }
}

impl Inner {
    fn bump_revision(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    async fn author_name(&self, user_id: &str) -> String {
        if let Some(name) = self.state.lock().await.authors.get(user_id) {
            return name.clone();
        }
        match self.deps.directory.get_user(user_id).await {
            Ok(Some(user)) => {
                let name = remote_display_name(Some(&user), &self.config.unknown_author);
                self.state.lock().await.authors.insert(user_id.to_owned(), name.clone());
                name
            }
            Ok(None) => self.config.unknown_author.clone(),
            Err(e) => {
                warn!(group_id = %self.group_id, user_id, error = %e, "author lookup failed");
                self.config.unknown_author.clone()
            }
        }
    }

    async fn check_membership(&self, user_id: &str, content: &str) -> Result<(), SendError> {
        let filter = Filter::eq("group_id", self.group_id.clone()).and_eq("user_id", user_id);
        match self.deps.data.query(&self.config.members_table, &filter, None).await {
            Ok(rows) if rows.is_empty() => {
                Err(SendError::NotMember { group_id: self.group_id.clone(), content: content.to_owned() })
            }
            Ok(_) => Ok(()),
            Err(source) => {
                warn!(group_id = %self.group_id, error = %source, "membership check failed");
                Err(SendError::Rejected { content: content.to_owned(), source })
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.task.abort();
            if !self.state.get_mut().closed {
                warn!(group_id = %self.group_id, subscription = %listener.subscription, "chat session dropped without teardown");
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let live = Arc::clone(&self.deps.live);
                    let id = listener.subscription;
                    handle.spawn(async move {
                        if let Err(e) = live.unsubscribe(id).await {
                            warn!(subscription = %id, error = %e, "unsubscribe failed");
                        }
                    });
                }
            }
        }
    }
}

async fn listen(session: Weak<Inner>, mut events: mpsc::Receiver<InsertEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = session.upgrade() else {
            break;
        };
        ChatSession { inner }.on_remote_insert(event).await;
    }
    debug!("chat listener stopped");
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
