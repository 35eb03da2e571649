//! In-memory backend implementing every capability.
//!
//! DESIGN
//! ======
//! Tables are `Vec<Row>` behind a `RwLock`; inserts get a UUID `id` and an
//! RFC 3339 `created_at` like the hosted platform assigns, then fan out to
//! every matching subscriber. Used by tests and the CLI demo.
//!
//! TESTING HOOKS
//! =============
//! - `fail_next_*` makes the next call of that kind fail once.
//! - `hold_*_replies` lets the operation take effect but withholds the
//!   reply until released, so tests can interleave notifications and
//!   teardown with an in-flight load or send.
//! - `broadcast` redelivers a notification as if the channel replayed it.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};

use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{DataAccess, Filter, InsertEvent, LiveUpdates, Order, Row, Subscription, SubscriptionId};
use crate::error::BackendError;
use crate::model::{AuthUser, format_timestamp, parse_timestamp};

struct Subscriber {
    table: String,
    filter: Filter,
    tx: mpsc::Sender<InsertEvent>,
}

#[derive(Default)]
struct Faults {
    query: Option<String>,
    insert: Option<String>,
    current_user: Option<String>,
    subscribe: Option<String>,
}

pub struct MemoryBackend {
    tables: RwLock<HashMap<String, Vec<Row>>>,
    current_user: RwLock<Option<AuthUser>>,
    subscribers: Mutex<HashMap<SubscriptionId, Subscriber>>,
    next_subscription: AtomicU64,
    faults: Mutex<Faults>,
    query_gate: watch::Sender<bool>,
    insert_gate: watch::Sender<bool>,
    query_calls: AtomicUsize,
    insert_calls: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            current_user: RwLock::new(None),
            subscribers: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            faults: Mutex::new(Faults::default()),
            query_gate: watch::Sender::new(false),
            insert_gate: watch::Sender::new(false),
            query_calls: AtomicUsize::new(0),
            insert_calls: AtomicUsize::new(0),
        }
    }

    /// Append rows to a table without notifying subscribers.
    pub async fn seed(&self, table: &str, rows: Vec<Row>) {
        self.tables.write().await.entry(table.to_owned()).or_default().extend(rows);
    }

    /// Snapshot of a table in insertion order.
    pub async fn rows(&self, table: &str) -> Vec<Row> {
        self.tables.read().await.get(table).cloned().unwrap_or_default()
    }

    pub async fn set_current_user(&self, user: Option<AuthUser>) {
        *self.current_user.write().await = user;
    }

    pub async fn fail_next_query(&self, reason: &str) {
        self.faults.lock().await.query = Some(reason.to_owned());
    }

    pub async fn fail_next_insert(&self, reason: &str) {
        self.faults.lock().await.insert = Some(reason.to_owned());
    }

    pub async fn fail_next_current_user(&self, reason: &str) {
        self.faults.lock().await.current_user = Some(reason.to_owned());
    }

    pub async fn fail_next_subscribe(&self, reason: &str) {
        self.faults.lock().await.subscribe = Some(reason.to_owned());
    }

    /// Hold query replies until [`Self::release_query_replies`].
    pub fn hold_query_replies(&self) {
        self.query_gate.send_replace(true);
    }

    pub fn release_query_replies(&self) {
        self.query_gate.send_replace(false);
    }

    /// Commit inserts (and notify subscribers) but hold the reply to the
    /// caller until [`Self::release_insert_replies`].
    pub fn hold_insert_replies(&self) {
        self.insert_gate.send_replace(true);
    }

    pub fn release_insert_replies(&self) {
        self.insert_gate.send_replace(false);
    }

    #[must_use]
    pub fn query_calls(&self) -> usize {
        self.query_calls.load(AtomicOrdering::SeqCst)
    }

    #[must_use]
    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(AtomicOrdering::SeqCst)
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Deliver `record` to every subscriber of `table` whose filter matches.
    /// Returns how many subscribers accepted it.
    pub async fn broadcast(&self, table: &str, record: &Row) -> usize {
        let mut subscribers = self.subscribers.lock().await;
        let mut delivered = 0;
        let mut closed = Vec::new();

        for (id, sub) in subscribers.iter() {
            if sub.table != table || !sub.filter.matches(record) {
                continue;
            }
            let event = InsertEvent { table: table.to_owned(), record: record.clone() };
            match sub.tx.try_send(event) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscription = %id, table, "live update queue full; dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            }
        }

        for id in closed {
            debug!(subscription = %id, "removing closed subscriber");
            subscribers.remove(&id);
        }
        delivered
    }

    async fn take_fault(&self, pick: impl FnOnce(&mut Faults) -> &mut Option<String>) -> Result<(), BackendError> {
        match pick(&mut *self.faults.lock().await).take() {
            Some(reason) => Err(BackendError::Unavailable(reason)),
            None => Ok(()),
        }
    }
}

async fn wait_released(gate: &watch::Sender<bool>) {
    let mut rx = gate.subscribe();
    if rx.wait_for(|held| !*held).await.is_err() {
        warn!("reply gate closed while held");
    }
}

fn compare_values(a: Option<&serde_json::Value>, b: Option<&serde_json::Value>) -> Ordering {
    use serde_json::Value;
    match (a, b) {
        (Some(Value::String(x)), Some(Value::String(y))) => match (parse_timestamp(x), parse_timestamp(y)) {
            (Some(tx), Some(ty)) => tx.cmp(&ty),
            _ => x.cmp(y),
        },
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            x.as_f64().partial_cmp(&y.as_f64()).unwrap_or(Ordering::Equal)
        }
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        // Nulls sort last, like Postgres ascending order.
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Greater,
        (_, None | Some(Value::Null)) => Ordering::Less,
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

#[async_trait::async_trait]
impl DataAccess for MemoryBackend {
    async fn query(&self, table: &str, filter: &Filter, order: Option<&Order>) -> Result<Vec<Row>, BackendError> {
        self.query_calls.fetch_add(1, AtomicOrdering::SeqCst);
        self.take_fault(|f| &mut f.query).await?;

        let mut rows: Vec<Row> = {
            let tables = self.tables.read().await;
            tables
                .get(table)
                .map(|rows| rows.iter().filter(|row| filter.matches(row)).cloned().collect())
                .unwrap_or_default()
        };

        if let Some(order) = order {
            rows.sort_by(|a, b| {
                let ord = compare_values(a.get(&order.column), b.get(&order.column));
                if order.ascending { ord } else { ord.reverse() }
            });
        }

        wait_released(&self.query_gate).await;
        Ok(rows)
    }

    async fn insert(&self, table: &str, mut row: Row) -> Result<Row, BackendError> {
        self.insert_calls.fetch_add(1, AtomicOrdering::SeqCst);
        self.take_fault(|f| &mut f.insert).await?;

        row.entry("id").or_insert_with(|| Uuid::new_v4().to_string().into());
        row.entry("created_at")
            .or_insert_with(|| format_timestamp(OffsetDateTime::now_utc()).into());

        self.tables.write().await.entry(table.to_owned()).or_default().push(row.clone());
        self.broadcast(table, &row).await;

        wait_released(&self.insert_gate).await;
        Ok(row)
    }

    async fn current_user(&self) -> Result<Option<AuthUser>, BackendError> {
        self.take_fault(|f| &mut f.current_user).await?;
        Ok(self.current_user.read().await.clone())
    }
}

#[async_trait::async_trait]
impl LiveUpdates for MemoryBackend {
    async fn subscribe(&self, table: &str, filter: &Filter, buffer: usize) -> Result<Subscription, BackendError> {
        if let Some(reason) = self.faults.lock().await.subscribe.take() {
            return Err(BackendError::Subscribe(reason));
        }

        let id = SubscriptionId(self.next_subscription.fetch_add(1, AtomicOrdering::SeqCst));
        let (tx, events) = mpsc::channel(buffer.max(1));
        self.subscribers
            .lock()
            .await
            .insert(id, Subscriber { table: table.to_owned(), filter: filter.clone(), tx });
        debug!(subscription = %id, table, "memory subscription opened");
        Ok(Subscription { id, events })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BackendError> {
        if self.subscribers.lock().await.remove(&id).is_some() {
            debug!(subscription = %id, "memory subscription closed");
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
