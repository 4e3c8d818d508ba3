use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::{FlagSyncError, Result};
use crate::flag::FlagRecord;
use crate::metrics::Metrics;
use crate::notifier::{ChangeEvent, ChangeKind, ChangeNotifier};
use crate::requestor::{Requestor, USER_AGENT};
use crate::sse::{EventParser, SseEvent};
use crate::store::FlagRecordStore;

pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Opens the server push channel. Each call is one connection attempt.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn connect(&self) -> Result<ByteStream>;
}

/// `GET {stream_uri}/flags` as a `text/event-stream`.
pub struct HttpEventSource {
    client: reqwest::Client,
    url: String,
    sdk_key: String,
}

impl HttpEventSource {
    pub fn new(config: &SyncConfig) -> Self {
        // No overall timeout: the response body is expected to stay open.
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(config.request_timeout())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            url: config.stream_url("/flags"),
            sdk_key: config.sdk_key.clone().unwrap_or_default(),
        }
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn connect(&self) -> Result<ByteStream> {
        let response = self
            .client
            .get(&self.url)
            .header("Accept", "text/event-stream")
            .header("Authorization", &self.sdk_key)
            .send()
            .await
            .map_err(|e| FlagSyncError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FlagSyncError::from_status(status.as_u16(), "stream", body));
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| FlagSyncError::Transport(e.to_string())))
            .boxed())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// The only write path into the store for one start/stop cycle.
///
/// Every mutation runs under the `open` lock and checks it first; `close`
/// takes the same lock, so once it returns nothing more can commit. Change
/// events are delivered after the lock is released and only while the sink
/// is still open; an event already being delivered may overlap a `close`.
pub(crate) struct UpdateSink {
    store: Arc<FlagRecordStore>,
    notifier: Arc<ChangeNotifier>,
    metrics: Arc<Metrics>,
    open: Mutex<bool>,
}

impl UpdateSink {
    pub(crate) fn new(
        store: Arc<FlagRecordStore>,
        notifier: Arc<ChangeNotifier>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            notifier,
            metrics,
            open: Mutex::new(true),
        }
    }

    fn commit(&self, apply: impl FnOnce(&FlagRecordStore) -> Option<ChangeKind>) -> bool {
        let kind = {
            let open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
            if !*open {
                return false;
            }
            let Some(kind) = apply(&self.store) else {
                return false;
            };
            self.metrics.flags_total.set(self.store.len() as i64);
            kind
        };
        // Handlers run unlocked so they may call back into `stop()`.
        if self.is_open() {
            self.notifier.notify(ChangeEvent::new(kind));
        }
        true
    }

    pub(crate) fn init(&self, records: HashMap<String, FlagRecord>) -> bool {
        self.commit(|store| {
            store.init(records);
            Some(ChangeKind::Replaced { count: store.len() })
        })
    }

    pub(crate) fn upsert(&self, key: &str, record: FlagRecord) -> bool {
        let version = record.version;
        self.commit(|store| {
            store.upsert(key, record).then(|| ChangeKind::Updated {
                key: key.to_string(),
                version,
            })
        })
    }

    pub(crate) fn delete(&self, key: &str, version: u64) -> bool {
        self.commit(|store| {
            store.delete(key, version).then(|| ChangeKind::Deleted {
                key: key.to_string(),
                version,
            })
        })
    }

    /// Run `f` only while the sink is open, under the same lock as mutations.
    pub(crate) fn if_open(&self, f: impl FnOnce()) -> bool {
        let open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if !*open {
            return false;
        }
        f();
        true
    }

    pub(crate) fn is_open(&self) -> bool {
        *self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn close(&self) {
        *self.open.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }
}

// ── Wire payloads ───────────────────────────────────────────

#[derive(Deserialize)]
struct PutEnvelope {
    data: PutData,
}

#[derive(Deserialize)]
struct PutData {
    flags: HashMap<String, FlagRecord>,
}

#[derive(Deserialize)]
struct PatchPayload {
    #[serde(default)]
    path: Option<String>,
    data: FlagRecord,
}

#[derive(Deserialize)]
struct DeletePayload {
    path: String,
    version: u64,
}

/// Keys arrive as paths (`/my-flag`); the store is keyed without the separator.
pub(crate) fn key_from_path(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}

/// Decode a full snapshot: either a bare `key -> flag` map or the
/// `{"path": "/", "data": {"flags": {...}}}` envelope.
pub(crate) fn decode_put(data: &str) -> Result<HashMap<String, FlagRecord>> {
    let value: serde_json::Value =
        serde_json::from_str(data).map_err(|e| FlagSyncError::decode("put", e))?;
    let is_envelope = value
        .get("data")
        .and_then(|d| d.get("flags"))
        .is_some_and(|f| f.is_object());
    if is_envelope {
        let envelope: PutEnvelope =
            serde_json::from_value(value).map_err(|e| FlagSyncError::decode("put", e))?;
        return Ok(envelope.data.flags);
    }
    serde_json::from_value(value).map_err(|e| FlagSyncError::decode("put", e))
}

pub(crate) fn decode_patch(data: &str) -> Result<(String, FlagRecord)> {
    let payload: PatchPayload =
        serde_json::from_str(data).map_err(|e| FlagSyncError::decode("patch", e))?;
    let key = if payload.data.key.is_empty() {
        payload
            .path
            .as_deref()
            .map(key_from_path)
            .unwrap_or_default()
            .to_string()
    } else {
        payload.data.key.clone()
    };
    if key.is_empty() {
        return Err(FlagSyncError::decode("patch", "missing flag key"));
    }
    Ok((key, payload.data))
}

pub(crate) fn decode_delete(data: &str) -> Result<(String, u64)> {
    let payload: DeletePayload =
        serde_json::from_str(data).map_err(|e| FlagSyncError::decode("delete", e))?;
    let key = key_from_path(&payload.path);
    if key.is_empty() {
        return Err(FlagSyncError::decode("delete", "missing flag key"));
    }
    Ok((key.to_string(), payload.version))
}

/// `indirect/patch` carries the key itself, possibly JSON-quoted.
pub(crate) fn decode_indirect_key(data: &str) -> Result<String> {
    let raw = data.trim();
    let raw = match serde_json::from_str::<String>(raw) {
        Ok(unquoted) => unquoted,
        Err(_) => raw.to_string(),
    };
    let key = key_from_path(raw.trim());
    if key.is_empty() {
        return Err(FlagSyncError::decode("indirect/patch", "missing flag key"));
    }
    Ok(key.to_string())
}

fn metric_label(event: &str) -> &'static str {
    match event {
        "put" => "put",
        "patch" => "patch",
        "delete" => "delete",
        "indirect/put" => "indirect/put",
        "indirect/patch" => "indirect/patch",
        "heartbeat" => "heartbeat",
        _ => "other",
    }
}

// ── Processor ───────────────────────────────────────────────

enum ConnectionEnd {
    Closed,
    Failed(FlagSyncError),
    Stopped,
}

/// Per-task state of the stream loop.
struct StreamWorker {
    source: Arc<dyn EventSource>,
    requestor: Arc<dyn Requestor>,
    sink: Arc<UpdateSink>,
    metrics: Arc<Metrics>,
    state: Arc<watch::Sender<ConnectionState>>,
    ready: Option<oneshot::Sender<Result<()>>>,
    base_delay: Duration,
    max_delay: Duration,
    /// A snapshot was applied on the current connection.
    snapshot_applied: bool,
}

impl StreamWorker {
    fn set_state(&self, next: ConnectionState) {
        self.sink.if_open(|| {
            let prev = self.state.send_replace(next);
            if prev != next {
                debug!(from = %prev, to = %next, "stream state changed");
            }
        });
    }

    /// Resolve the pending `start()` once; later outcomes only get logged.
    fn report(&mut self, result: Result<()>) {
        if let Some(tx) = self.ready.take() {
            let _ = tx.send(result);
        }
    }

    fn apply_snapshot(&mut self, flags: HashMap<String, FlagRecord>) {
        let count = flags.len();
        if !self.sink.init(flags) {
            return;
        }
        self.snapshot_applied = true;
        self.set_state(ConnectionState::Connected);
        info!(flags = count, "flag snapshot applied");
        self.report(Ok(()));
    }

    /// Apply one event. An `Err` means the connection should be dropped.
    async fn handle_event(&mut self, event: SseEvent) -> Result<()> {
        self.metrics
            .stream_events
            .with_label_values(&[metric_label(&event.event)])
            .inc();

        match event.event.as_str() {
            "put" => match decode_put(&event.data) {
                Ok(flags) => {
                    self.apply_snapshot(flags);
                    Ok(())
                }
                Err(e) => {
                    self.metrics.decode_errors.with_label_values(&["put"]).inc();
                    error!(error = %e, "unexpected payload in put event");
                    self.report(Err(e.clone()));
                    Err(e)
                }
            },
            "patch" => {
                match decode_patch(&event.data) {
                    Ok((key, flag)) => {
                        let version = flag.version;
                        if self.sink.upsert(&key, flag) {
                            debug!(key, version, "flag updated");
                        } else {
                            debug!(key, version, "stale patch ignored");
                        }
                    }
                    Err(e) => {
                        self.metrics.decode_errors.with_label_values(&["patch"]).inc();
                        warn!(error = %e, "dropping malformed patch event");
                    }
                }
                Ok(())
            }
            "delete" => {
                match decode_delete(&event.data) {
                    Ok((key, version)) => {
                        if self.sink.delete(&key, version) {
                            debug!(key, version, "flag deleted");
                        }
                    }
                    Err(e) => {
                        self.metrics.decode_errors.with_label_values(&["delete"]).inc();
                        warn!(error = %e, "dropping malformed delete event");
                    }
                }
                Ok(())
            }
            "indirect/put" => {
                match self.requestor.fetch_all().await {
                    Ok(flags) => self.apply_snapshot(flags),
                    Err(e) => {
                        warn!(error = %e, "failed to fetch flags after indirect/put");
                        if !e.is_recoverable() {
                            self.report(Err(e));
                        }
                    }
                }
                Ok(())
            }
            "indirect/patch" => {
                match decode_indirect_key(&event.data) {
                    Ok(key) => match self.requestor.fetch_one(&key).await {
                        Ok(flag) => {
                            self.sink.upsert(&key, flag);
                        }
                        Err(e) => {
                            warn!(key, error = %e, "failed to fetch flag after indirect/patch")
                        }
                    },
                    Err(e) => {
                        self.metrics
                            .decode_errors
                            .with_label_values(&["indirect/patch"])
                            .inc();
                        warn!(error = %e, "dropping malformed indirect/patch event");
                    }
                }
                Ok(())
            }
            other => {
                debug!(event = other, "ignoring stream event");
                Ok(())
            }
        }
    }

    async fn consume(&mut self, mut stream: ByteStream) -> ConnectionEnd {
        let mut parser = EventParser::new();
        let end = 'read: loop {
            let chunk = match stream.next().await {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => break 'read ConnectionEnd::Failed(e),
                None => break 'read ConnectionEnd::Closed,
            };
            for event in parser.feed(&chunk) {
                if !self.sink.is_open() {
                    break 'read ConnectionEnd::Stopped;
                }
                if let Err(e) = self.handle_event(event).await {
                    break 'read ConnectionEnd::Failed(e);
                }
            }
        };
        if let Some(retry) = parser.retry() {
            self.base_delay = retry.min(self.max_delay);
        }
        end
    }

    async fn run(mut self) {
        let mut delay = self.base_delay;
        let mut attempt: u32 = 0;

        loop {
            if !self.sink.is_open() {
                break;
            }
            if attempt == 0 {
                self.set_state(ConnectionState::Connecting);
            } else {
                self.set_state(ConnectionState::Reconnecting);
                self.metrics.stream_reconnects.inc();
            }
            attempt = attempt.saturating_add(1);
            self.snapshot_applied = false;

            match self.source.connect().await {
                Ok(stream) => {
                    info!("connected to flag stream");
                    let lost = match self.consume(stream).await {
                        ConnectionEnd::Closed => {
                            warn!("flag stream closed, reconnecting");
                            FlagSyncError::Transport("stream closed before snapshot".into())
                        }
                        ConnectionEnd::Failed(e) => {
                            warn!(error = %e, "flag stream interrupted, reconnecting");
                            FlagSyncError::Transport(e.to_string())
                        }
                        ConnectionEnd::Stopped => break,
                    };
                    if self.snapshot_applied {
                        delay = self.base_delay;
                    } else {
                        self.report(Err(lost));
                    }
                }
                Err(e) if !e.is_recoverable() => {
                    error!(error = %e, "flag stream rejected, not retrying");
                    self.report(Err(e));
                    self.set_state(ConnectionState::Stopped);
                    return;
                }
                Err(e) => {
                    warn!(error = %e, retry_in = ?delay, "flag stream connection failed");
                    self.report(Err(FlagSyncError::Transport(e.to_string())));
                }
            }

            if !self.sink.is_open() {
                break;
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.max_delay).max(self.base_delay);
        }
    }
}

/// Keeps the store in step with the server push channel.
///
/// Owns one spawned task. Connection state is published on a watch
/// channel owned by the caller; the outcome of the first connection is
/// delivered once through the receiver returned by [`StreamProcessor::spawn`].
pub struct StreamProcessor {
    state: Arc<watch::Sender<ConnectionState>>,
    sink: Arc<UpdateSink>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamProcessor {
    pub(crate) fn spawn(
        config: &SyncConfig,
        source: Arc<dyn EventSource>,
        requestor: Arc<dyn Requestor>,
        sink: Arc<UpdateSink>,
        metrics: Arc<Metrics>,
        state: Arc<watch::Sender<ConnectionState>>,
    ) -> (Self, oneshot::Receiver<Result<()>>) {
        let (ready_tx, ready_rx) = oneshot::channel();

        let worker = StreamWorker {
            source,
            requestor,
            sink: Arc::clone(&sink),
            metrics,
            state: Arc::clone(&state),
            ready: Some(ready_tx),
            base_delay: config.initial_reconnect_delay(),
            max_delay: config.max_reconnect_delay(),
            snapshot_applied: false,
        };
        let task = tokio::spawn(worker.run());

        let processor = Self {
            state,
            sink,
            task: Mutex::new(Some(task)),
        };
        (processor, ready_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Halt the stream. Idempotent. Once this returns no store mutation
    /// from this processor can commit.
    pub fn stop(&self) {
        self.sink.close();
        self.state.send_replace(ConnectionState::Stopped);
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

impl Drop for StreamProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}
