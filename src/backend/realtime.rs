//! Realtime websocket adapter for [`LiveUpdates`].
//!
//! ARCHITECTURE
//! ============
//! One websocket per subscription, speaking the Phoenix channel protocol
//! (JSON, `vsn=1.0.0`). `subscribe` connects, sends `phx_join` with a
//! `postgres_changes` INSERT config and waits for the join reply, then a
//! background task forwards matching inserts into the subscription channel
//! and heartbeats on the `phoenix` topic.
//!
//! ERROR HANDLING
//! ==============
//! After a successful join, disconnects are retried with exponential
//! backoff (1s doubling to 10s) until the subscription is closed or its
//! receiver dropped. Inserts committed during the gap are not replayed; the
//! chat view tolerates that and dedups anything delivered twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use super::{Filter, InsertEvent, LiveUpdates, Row, Subscription, SubscriptionId};
use crate::config::BackendConfig;
use crate::error::BackendError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PROTOCOL_VERSION: &str = "1.0.0";
const JOIN_REF: &str = "1";
const INITIAL_BACKOFF_MS: u64 = 1000;
const MAX_BACKOFF_MS: u64 = 10_000;

// =============================================================================
// CLIENT
// =============================================================================

struct ChannelHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct RealtimeClient {
    socket_url: String,
    access_token: Option<String>,
    heartbeat: Duration,
    join_timeout: Duration,
    next_id: AtomicU64,
    channels: Mutex<HashMap<SubscriptionId, ChannelHandle>>,
}

impl RealtimeClient {
    #[must_use]
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            socket_url: websocket_url(&config.url, &config.anon_key),
            access_token: config.access_token.clone(),
            heartbeat: Duration::from_secs(config.heartbeat_secs.max(1)),
            join_timeout: Duration::from_secs(config.timeouts.request_secs.max(1)),
            next_id: AtomicU64::new(1),
            channels: Mutex::new(HashMap::new()),
        }
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        for (_, handle) in self.channels.get_mut().drain() {
            handle.task.abort();
        }
    }
}

#[async_trait::async_trait]
impl LiveUpdates for RealtimeClient {
    async fn subscribe(&self, table: &str, filter: &Filter, buffer: usize) -> Result<Subscription, BackendError> {
        let params = JoinParams::new(table, filter, self.access_token.clone());
        let ws = open_channel(&self.socket_url, &params, self.join_timeout).await?;

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, events) = mpsc::channel(buffer.max(1));
        let (shutdown, shutdown_rx) = oneshot::channel();
        info!(subscription = %id, topic = %params.topic, "realtime channel joined");

        let task = tokio::spawn(run_channel(RunContext {
            id,
            socket_url: self.socket_url.clone(),
            params,
            tx,
            shutdown: shutdown_rx,
            heartbeat: self.heartbeat,
            join_timeout: self.join_timeout,
        }, ws));

        self.channels.lock().await.insert(id, ChannelHandle { shutdown, task });
        Ok(Subscription { id, events })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BackendError> {
        let Some(handle) = self.channels.lock().await.remove(&id) else {
            return Ok(());
        };

        if handle.shutdown.send(()).is_err() {
            debug!(subscription = %id, "realtime task already finished");
        }
        let mut task = handle.task;
        if tokio::time::timeout(self.join_timeout, &mut task).await.is_err() {
            warn!(subscription = %id, "realtime task did not stop in time; aborting");
            task.abort();
        }
        info!(subscription = %id, "realtime channel left");
        Ok(())
    }
}

// =============================================================================
// CHANNEL TASK
// =============================================================================

struct JoinParams {
    topic: String,
    table: String,
    filter: Option<String>,
    access_token: Option<String>,
}

impl JoinParams {
    fn new(table: &str, filter: &Filter, access_token: Option<String>) -> Self {
        let filter = realtime_filter(filter);
        let topic = match &filter {
            Some(f) => format!("realtime:{table}:{f}"),
            None => format!("realtime:{table}"),
        };
        Self { topic, table: table.to_owned(), filter, access_token }
    }
}

struct RunContext {
    id: SubscriptionId,
    socket_url: String,
    params: JoinParams,
    tx: mpsc::Sender<InsertEvent>,
    shutdown: oneshot::Receiver<()>,
    heartbeat: Duration,
    join_timeout: Duration,
}

enum PumpExit {
    Shutdown,
    ReceiverDropped,
    Disconnected(String),
}

async fn open_channel(socket_url: &str, params: &JoinParams, join_timeout: Duration) -> Result<WsStream, BackendError> {
    let (mut ws, _) = connect_async(socket_url)
        .await
        .map_err(|e| BackendError::Subscribe(format!("websocket connect failed: {e}")))?;

    let join = join_message(&params.topic, &params.table, params.filter.as_deref(), params.access_token.as_deref(), JOIN_REF);
    ws.send(Message::text(join.to_string()))
        .await
        .map_err(|e| BackendError::Subscribe(format!("join send failed: {e}")))?;

    match tokio::time::timeout(join_timeout, wait_join_reply(&mut ws)).await {
        Ok(result) => result.map(|()| ws),
        Err(_) => Err(BackendError::Subscribe("timed out waiting for join reply".to_owned())),
    }
}

async fn wait_join_reply(ws: &mut WsStream) -> Result<(), BackendError> {
    while let Some(incoming) = ws.next().await {
        let message = incoming.map_err(|e| BackendError::Subscribe(e.to_string()))?;
        let Message::Text(text) = message else {
            continue;
        };
        if let Some(Inbound::Reply { reference, ok, detail }) = parse_inbound(text.as_str()) {
            if reference.as_deref() == Some(JOIN_REF) {
                return if ok { Ok(()) } else { Err(BackendError::Subscribe(detail)) };
            }
        }
    }
    Err(BackendError::Subscribe("socket closed before join reply".to_owned()))
}

async fn run_channel(mut ctx: RunContext, mut ws: WsStream) {
    let mut backoff_ms = INITIAL_BACKOFF_MS;
    loop {
        match pump(&mut ctx, &mut ws).await {
            PumpExit::Shutdown | PumpExit::ReceiverDropped => {
                let leave = leave_message(&ctx.params.topic, "leave");
                if let Err(e) = ws.send(Message::text(leave.to_string())).await {
                    debug!(subscription = %ctx.id, error = %e, "leave send failed");
                }
                if let Err(e) = ws.close(None).await {
                    debug!(subscription = %ctx.id, error = %e, "websocket close failed");
                }
                return;
            }
            PumpExit::Disconnected(reason) => {
                warn!(subscription = %ctx.id, %reason, "realtime channel disconnected");
            }
        }

        // Reconnect with exponential backoff until rejoined or closed.
        loop {
            tokio::select! {
                _ = &mut ctx.shutdown => return,
                () = ctx.tx.closed() => return,
                () = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
            }
            backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);

            match open_channel(&ctx.socket_url, &ctx.params, ctx.join_timeout).await {
                Ok(fresh) => {
                    ws = fresh;
                    backoff_ms = INITIAL_BACKOFF_MS;
                    info!(subscription = %ctx.id, topic = %ctx.params.topic, "realtime channel rejoined");
                    break;
                }
                Err(e) => warn!(subscription = %ctx.id, error = %e, backoff_ms, "realtime rejoin failed"),
            }
        }
    }
}

async fn pump(ctx: &mut RunContext, ws: &mut WsStream) -> PumpExit {
    let mut ticker = tokio::time::interval(ctx.heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    let mut next_ref: u64 = 1;

    loop {
        tokio::select! {
            _ = &mut ctx.shutdown => return PumpExit::Shutdown,
            () = ctx.tx.closed() => return PumpExit::ReceiverDropped,
            _ = ticker.tick() => {
                next_ref += 1;
                let beat = heartbeat_message(&next_ref.to_string());
                if let Err(e) = ws.send(Message::text(beat.to_string())).await {
                    return PumpExit::Disconnected(e.to_string());
                }
            }
            incoming = ws.next() => {
                let text = match incoming {
                    None => return PumpExit::Disconnected("socket closed".to_owned()),
                    Some(Err(e)) => return PumpExit::Disconnected(e.to_string()),
                    Some(Ok(Message::Close(_))) => return PumpExit::Disconnected("close frame".to_owned()),
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(_)) => continue,
                };
                match parse_inbound(text.as_str()) {
                    Some(Inbound::Insert { table, record }) if table == ctx.params.table => {
                        if ctx.tx.send(InsertEvent { table, record }).await.is_err() {
                            return PumpExit::ReceiverDropped;
                        }
                    }
                    Some(Inbound::Insert { table, .. }) => {
                        debug!(subscription = %ctx.id, %table, "ignoring insert for another table");
                    }
                    Some(Inbound::Closed) => return PumpExit::Disconnected("channel closed by server".to_owned()),
                    Some(Inbound::Reply { ok: false, detail, .. }) => {
                        warn!(subscription = %ctx.id, %detail, "realtime error reply");
                    }
                    Some(Inbound::Reply { .. }) | None => {}
                }
            }
        }
    }
}

// =============================================================================
// PROTOCOL
// =============================================================================

/// Websocket endpoint for a project base URL.
pub(crate) fn websocket_url(base_url: &str, api_key: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_owned()
    };
    format!("{ws_base}/realtime/v1/websocket?apikey={api_key}&vsn={PROTOCOL_VERSION}")
}

/// Realtime accepts one `column=eq.value` filter per change listener.
pub(crate) fn realtime_filter(filter: &Filter) -> Option<String> {
    let conditions = filter.conditions();
    if conditions.len() > 1 {
        warn!(count = conditions.len(), "realtime supports one filter condition; using the first");
    }
    conditions.first().map(|(column, value)| format!("{column}=eq.{value}"))
}

pub(crate) fn join_message(
    topic: &str,
    table: &str,
    filter: Option<&str>,
    access_token: Option<&str>,
    reference: &str,
) -> Value {
    let mut change = json!({ "event": "INSERT", "schema": "public", "table": table });
    if let Some(filter) = filter {
        change["filter"] = Value::String(filter.to_owned());
    }
    let mut payload = json!({
        "config": {
            "broadcast": { "ack": false, "self": false },
            "presence": { "key": "" },
            "postgres_changes": [change],
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = Value::String(token.to_owned());
    }
    json!({ "topic": topic, "event": "phx_join", "payload": payload, "ref": reference })
}

pub(crate) fn heartbeat_message(reference: &str) -> Value {
    json!({ "topic": "phoenix", "event": "heartbeat", "payload": {}, "ref": reference })
}

pub(crate) fn leave_message(topic: &str, reference: &str) -> Value {
    json!({ "topic": topic, "event": "phx_leave", "payload": {}, "ref": reference })
}

/// Inbound message kinds the channel task acts on.
#[derive(Debug, PartialEq)]
pub(crate) enum Inbound {
    Reply { reference: Option<String>, ok: bool, detail: String },
    Insert { table: String, record: Row },
    Closed,
}

pub(crate) fn parse_inbound(text: &str) -> Option<Inbound> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "ignoring non-JSON realtime frame");
            return None;
        }
    };
    let event = value.get("event")?.as_str()?;
    let payload = value.get("payload")?;

    match event {
        "phx_reply" => {
            let status = payload.get("status").and_then(Value::as_str).unwrap_or_default();
            let detail = payload
                .get("response")
                .map(Value::to_string)
                .unwrap_or_default();
            let reference = value.get("ref").and_then(Value::as_str).map(str::to_owned);
            Some(Inbound::Reply { reference, ok: status == "ok", detail })
        }
        "postgres_changes" => {
            let data = payload.get("data")?;
            let kind = data
                .get("type")
                .or_else(|| data.get("eventType"))
                .and_then(Value::as_str)?;
            insert_from(kind, data)
        }
        "INSERT" => insert_from("INSERT", payload),
        "phx_close" | "phx_error" => Some(Inbound::Closed),
        _ => None,
    }
}

fn insert_from(kind: &str, data: &Value) -> Option<Inbound> {
    if kind != "INSERT" {
        return None;
    }
    let table = data.get("table")?.as_str()?.to_owned();
    let record = data.get("record")?.as_object()?.clone();
    Some(Inbound::Insert { table, record })
}

#[cfg(test)]
#[path = "realtime_test.rs"]
mod tests;
