//! Push subscriptions over a framed channel
//!
//! One connection carries any number of subscriptions. A background read
//! loop reassembles frames into messages, resolves subscribe/unsubscribe
//! acknowledgments, and dispatches notifications to handlers by
//! subscription id.
//!
//! Lifecycle: `Disconnected -> Connecting -> Open -> Closing -> Disconnected`.
//! When the read loop ends (close frame, end of stream or transport error)
//! every pending acknowledgment fails with a `Transport` error and active
//! handlers are dropped without being called.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, WalletError};
use crate::transport::{Frame, FrameConnector, FrameSink, FrameStream, RpcRequest};

/// Default ceiling for a reassembled message
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// How long a subscribe or unsubscribe waits for the server
const ACK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Ledger commitment level for subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Commitment {
    Processed,
    #[default]
    Confirmed,
    Finalized,
}

impl Commitment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Commitment::Processed => "processed",
            Commitment::Confirmed => "confirmed",
            Commitment::Finalized => "finalized",
        }
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Commitment {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "processed" => Ok(Commitment::Processed),
            "confirmed" => Ok(Commitment::Confirmed),
            "finalized" => Ok(Commitment::Finalized),
            other => Err(WalletError::validation(format!("unknown commitment: {}", other))),
        }
    }
}

/// Which log messages a `Logs` subscription receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogsFilter {
    All,
    AllWithVotes,
    /// Transactions mentioning this base58 address
    Mentions(String),
}

/// What a subscription watches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionTarget {
    /// Account data changes for a base58 public key
    Account(String),
    /// Confirmation of a base58 transaction signature. The ledger cancels
    /// these after the first notification.
    Signature(String),
    Logs(LogsFilter),
}

impl SubscriptionTarget {
    pub fn subscribe_method(&self) -> &'static str {
        match self {
            SubscriptionTarget::Account(_) => "accountSubscribe",
            SubscriptionTarget::Signature(_) => "signatureSubscribe",
            SubscriptionTarget::Logs(_) => "logsSubscribe",
        }
    }

    pub fn unsubscribe_method(&self) -> &'static str {
        match self {
            SubscriptionTarget::Account(_) => "accountUnsubscribe",
            SubscriptionTarget::Signature(_) => "signatureUnsubscribe",
            SubscriptionTarget::Logs(_) => "logsUnsubscribe",
        }
    }

    pub fn is_one_shot(&self) -> bool {
        matches!(self, SubscriptionTarget::Signature(_))
    }

    fn params(&self, commitment: Commitment) -> Value {
        match self {
            SubscriptionTarget::Account(pubkey) => json!([
                pubkey,
                {"encoding": "base64", "commitment": commitment.as_str()}
            ]),
            SubscriptionTarget::Signature(signature) => {
                json!([signature, {"commitment": commitment.as_str()}])
            }
            SubscriptionTarget::Logs(filter) => {
                let filter = match filter {
                    LogsFilter::All => json!("all"),
                    LogsFilter::AllWithVotes => json!("allWithVotes"),
                    LogsFilter::Mentions(address) => json!({"mentions": [address]}),
                };
                json!([filter, {"commitment": commitment.as_str()}])
            }
        }
    }
}

/// A push notification for one subscription
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub subscription: u64,
    pub method: String,
    pub result: Value,
}

pub type NotificationHandler = Arc<dyn Fn(Notification) + Send + Sync>;

/// An acknowledged subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: u64,
    target: SubscriptionTarget,
}

impl SubscriptionHandle {
    /// Server-assigned subscription id
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> &SubscriptionTarget {
        &self.target
    }
}

/// Accumulates frames until a final frame completes a message.
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    max_bytes: usize,
    discarding: bool,
}

impl FrameAssembler {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_bytes,
            discarding: false,
        }
    }

    /// Feed one frame; returns the complete message once the final frame
    /// arrives. Oversized messages are dropped whole.
    pub fn push(&mut self, frame: Frame) -> Option<Vec<u8>> {
        if self.discarding {
            self.discarding = !frame.is_final;
            return None;
        }

        self.buffer.extend_from_slice(&frame.payload);
        if self.buffer.len() > self.max_bytes {
            warn!(
                "Dropping message over {} bytes ({} buffered)",
                self.max_bytes,
                self.buffer.len()
            );
            self.buffer = Vec::new();
            self.discarding = !frame.is_final;
            return None;
        }

        if frame.is_final {
            Some(std::mem::take(&mut self.buffer))
        } else {
            None
        }
    }

    /// Bytes held for an incomplete message
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[derive(Clone)]
struct ActiveHandler {
    handler: NotificationHandler,
    one_shot: bool,
}

struct PendingAck {
    /// Registered under the server-assigned id when the ack arrives
    handler: Option<ActiveHandler>,
    reply: oneshot::Sender<Result<Value>>,
}

struct ChannelInner {
    connector: Arc<dyn FrameConnector>,
    sink: tokio::sync::Mutex<Option<Box<dyn FrameSink>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<ChannelState>,
    pending: Mutex<HashMap<u64, PendingAck>>,
    handlers: Mutex<HashMap<u64, ActiveHandler>>,
    next_id: AtomicU64,
    commitment: Commitment,
    max_message_bytes: usize,
}

/// Subscription channel handle. Clones share one connection.
#[derive(Clone)]
pub struct SubscriptionChannel {
    inner: Arc<ChannelInner>,
}

impl SubscriptionChannel {
    pub fn new(connector: Arc<dyn FrameConnector>, commitment: Commitment, max_message_bytes: usize) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                connector,
                sink: tokio::sync::Mutex::new(None),
                reader: Mutex::new(None),
                state: Mutex::new(ChannelState::Disconnected),
                pending: Mutex::new(HashMap::new()),
                handlers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                commitment,
                max_message_bytes,
            }),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Number of subscriptions with a live handler
    pub fn active_subscriptions(&self) -> usize {
        self.inner.handlers.lock().len()
    }

    /// Open the connection and start the read loop.
    pub async fn connect(&self, uri: &str) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != ChannelState::Disconnected {
                return Err(WalletError::InvalidState(format!(
                    "cannot connect while {:?}",
                    *state
                )));
            }
            *state = ChannelState::Connecting;
        }

        let (sink, stream) = match self.inner.connector.connect(uri).await {
            Ok(halves) => halves,
            Err(e) => {
                *self.inner.state.lock() = ChannelState::Disconnected;
                warn!("Subscription channel failed to connect to {}: {}", uri, e);
                return Err(e);
            }
        };

        *self.inner.sink.lock().await = Some(sink);
        *self.inner.state.lock() = ChannelState::Open;

        let inner = self.inner.clone();
        let reader = tokio::spawn(read_loop(inner, stream));
        *self.inner.reader.lock() = Some(reader);

        info!("Subscription channel open ({})", uri);
        Ok(())
    }

    /// Subscribe and wait for the server-assigned id.
    ///
    /// The handler is live from the moment the acknowledgment is read, so a
    /// notification sent right behind the ack is not missed.
    pub async fn subscribe<F>(&self, target: SubscriptionTarget, handler: F) -> Result<SubscriptionHandle>
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        let active = ActiveHandler {
            handler: Arc::new(handler),
            one_shot: target.is_one_shot(),
        };
        let params = target.params(self.inner.commitment);
        let result = self
            .request(target.subscribe_method(), params, Some(active))
            .await?;

        let id = result.as_u64().ok_or_else(|| {
            WalletError::protocol(-32603, format!("subscription id is not a number: {}", result))
        })?;

        debug!("Subscribed to {:?} as {}", target, id);
        Ok(SubscriptionHandle { id, target })
    }

    /// Drop the handler now, then ask the server to cancel.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        self.detach(handle);

        let method = handle.target.unsubscribe_method();
        self.request(method, json!([handle.id]), None).await?;
        debug!("Unsubscribed {}", handle.id);
        Ok(())
    }

    /// Stop delivering notifications for `handle` without telling the
    /// server. Returns false if the handler was already gone.
    pub fn detach(&self, handle: &SubscriptionHandle) -> bool {
        self.inner.handlers.lock().remove(&handle.id).is_some()
    }

    /// Close the connection. Pending acknowledgments fail and handlers are
    /// dropped.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state != ChannelState::Open {
                return;
            }
            *state = ChannelState::Closing;
        }

        if let Some(mut sink) = self.inner.sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                debug!("Close frame not sent: {}", e);
            }
        }

        let reader = self.inner.reader.lock().take();
        if let Some(reader) = reader {
            reader.abort();
        }

        self.inner.teardown("channel closed").await;
    }

    async fn request(&self, method: &str, params: Value, handler: Option<ActiveHandler>) -> Result<Value> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = serde_json::to_vec(&RpcRequest::new(id, method, params))
            .map_err(|e| WalletError::validation(format!("unencodable request: {}", e)))?;
        let (reply, ack) = oneshot::channel();

        {
            // State is checked under the pending lock so teardown cannot
            // drain before this entry lands.
            let mut pending = self.inner.pending.lock();
            let state = *self.inner.state.lock();
            if state != ChannelState::Open {
                return Err(WalletError::InvalidState(format!(
                    "{} requires an open channel ({:?})",
                    method, state
                )));
            }
            pending.insert(id, PendingAck { handler, reply });
        }

        let sent = match self.inner.sink.lock().await.as_mut() {
            Some(sink) => sink.send_frame(payload).await,
            None => Err(WalletError::Transport("channel closed".to_string())),
        };
        if let Err(e) = sent {
            self.inner.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(ACK_TIMEOUT, ack).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WalletError::Transport("channel closed".to_string())),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                warn!("No acknowledgment for {} after {:?}", method, ACK_TIMEOUT);
                Err(WalletError::Transport(format!("{} timed out", method)))
            }
        }
    }
}

async fn read_loop(inner: Arc<ChannelInner>, mut stream: Box<dyn FrameStream>) {
    let mut assembler = FrameAssembler::new(inner.max_message_bytes);

    let reason = loop {
        match stream.receive_frame().await {
            Ok(Some(frame)) if frame.is_close => break "closed by peer".to_string(),
            Ok(Some(frame)) => {
                if let Some(message) = assembler.push(frame) {
                    inner.dispatch(&message);
                }
            }
            Ok(None) => break "stream ended".to_string(),
            Err(e) => {
                warn!("Subscription channel read failed: {}", e);
                break e.to_string();
            }
        }
    };

    inner.reader.lock().take();
    inner.teardown(&reason).await;
}

impl ChannelInner {
    fn dispatch(&self, message: &[u8]) {
        let value: Value = match serde_json::from_slice(message) {
            Ok(value) => value,
            Err(e) => {
                debug!("Ignoring unparsable message: {}", e);
                return;
            }
        };

        if let Some(id) = value.get("id").and_then(Value::as_u64) {
            self.acknowledge(id, &value);
        } else if let Some(method) = value.get("method").and_then(Value::as_str) {
            self.notify(method, &value);
        }
    }

    fn acknowledge(&self, id: u64, value: &Value) {
        let Some(ack) = self.pending.lock().remove(&id) else {
            debug!("Acknowledgment for unknown request {}", id);
            return;
        };

        let outcome = match value.get("error") {
            Some(error) => Err(WalletError::protocol(
                error.get("code").and_then(Value::as_i64).unwrap_or(0),
                error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error"),
            )),
            None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
        };

        if let (Ok(result), Some(handler)) = (&outcome, ack.handler) {
            if let Some(subscription) = result.as_u64() {
                self.handlers.lock().insert(subscription, handler);
            }
        }

        // The caller may have given up waiting
        let _ = ack.reply.send(outcome);
    }

    fn notify(&self, method: &str, value: &Value) {
        let params = value.get("params");
        let Some(subscription) = params
            .and_then(|p| p.get("subscription"))
            .and_then(Value::as_u64)
        else {
            return;
        };

        let handler = {
            let mut handlers = self.handlers.lock();
            match handlers.get(&subscription) {
                Some(active) if active.one_shot => handlers.remove(&subscription),
                Some(active) => Some(active.clone()),
                None => None,
            }
        };

        let Some(active) = handler else {
            debug!("No handler for subscription {}", subscription);
            return;
        };

        let result = params
            .and_then(|p| p.get("result"))
            .cloned()
            .unwrap_or(Value::Null);

        (active.handler)(Notification {
            subscription,
            method: method.to_string(),
            result,
        });
    }

    async fn teardown(&self, reason: &str) {
        {
            let mut state = self.state.lock();
            if *state == ChannelState::Disconnected {
                return;
            }
            *state = ChannelState::Disconnected;
        }

        self.sink.lock().await.take();

        let pending: Vec<PendingAck> = self.pending.lock().drain().map(|(_, ack)| ack).collect();
        for ack in pending {
            let _ = ack
                .reply
                .send(Err(WalletError::Transport(reason.to_string())));
        }

        let orphaned = {
            let mut handlers = self.handlers.lock();
            let count = handlers.len();
            handlers.clear();
            count
        };

        info!(
            "Subscription channel disconnected: {} ({} subscriptions dropped)",
            reason, orphaned
        );
    }
}
