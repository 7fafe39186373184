//! Batched JSON-RPC composer
//!
//! Coalesces many ledger calls into one transport round trip. Each call
//! carries its own callback, invoked exactly once per flush in the order the
//! calls were enqueued, whatever order the endpoint answers in.
//!
//! A flush swaps the pending set out under the lock before sending, so calls
//! enqueued while a flush is in flight join the next batch instead of being
//! dropped.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, WalletError};
use crate::transport::{RpcRequest, RpcResponse, RpcTransport};

/// JSON-RPC internal error, used when the endpoint omits a response
const MISSING_RESPONSE_CODE: i64 = -32603;

/// JSON-RPC parse error, used when a result has an unexpected shape
const DECODE_ERROR_CODE: i64 = -32700;

/// Callback receiving the outcome of one batched call
pub type ResultCallback = Box<dyn FnOnce(Result<Value>) + Send + 'static>;

/// When the composer flushes on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoExecute {
    /// Only explicit `flush` calls send
    #[default]
    Manual,
    /// Flush once this many calls are pending
    Threshold(usize),
}

struct PendingCall {
    request: RpcRequest,
    on_result: ResultCallback,
}

struct Inner {
    transport: Arc<dyn RpcTransport>,
    pending: Mutex<Vec<PendingCall>>,
    next_id: AtomicU64,
    auto_execute: AutoExecute,
    runtime: Handle,
}

/// Batch composer handle. Clones share the same pending set.
#[derive(Clone)]
pub struct BatchComposer {
    inner: Arc<Inner>,
}

impl BatchComposer {
    /// Spawned flushes run on `runtime`.
    pub fn new(transport: Arc<dyn RpcTransport>, auto_execute: AutoExecute, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                pending: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                auto_execute,
                runtime,
            }),
        }
    }

    pub fn auto_execute(&self) -> AutoExecute {
        self.inner.auto_execute
    }

    /// Number of calls waiting for the next flush
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Queue a call. Nothing is sent unless the auto-execute threshold is
    /// reached, in which case the spawned flush is returned.
    pub fn enqueue<F>(&self, method: &str, params: Value, on_result: F) -> Option<JoinHandle<usize>>
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let pending = {
            let mut pending = self.inner.pending.lock();
            pending.push(PendingCall {
                request: RpcRequest::new(id, method, params),
                on_result: Box::new(on_result),
            });
            pending.len()
        };

        match self.inner.auto_execute {
            AutoExecute::Threshold(count) if pending >= count.max(1) => {
                debug!("Batch threshold {} reached, flushing", count);
                Some(self.spawn_flush())
            }
            _ => None,
        }
    }

    /// Queue a call whose result is decoded into `T` before the callback.
    pub fn enqueue_as<T, F>(&self, method: &str, params: Value, on_result: F) -> Option<JoinHandle<usize>>
    where
        T: DeserializeOwned,
        F: FnOnce(Result<T>) + Send + 'static,
    {
        self.enqueue(method, params, move |result| {
            on_result(result.and_then(|value| {
                serde_json::from_value(value).map_err(|e| {
                    WalletError::protocol(DECODE_ERROR_CODE, format!("unexpected result: {}", e))
                })
            }))
        })
    }

    /// Send every pending call as one batch and resolve the callbacks.
    ///
    /// Returns the number of callbacks invoked.
    pub async fn flush(&self) -> usize {
        let calls = std::mem::take(&mut *self.inner.pending.lock());
        if calls.is_empty() {
            return 0;
        }

        let requests: Vec<RpcRequest> = calls.iter().map(|call| call.request.clone()).collect();
        debug!("Flushing batch of {} calls", requests.len());

        match self.inner.transport.send_batch(requests).await {
            Ok(responses) => resolve(calls, responses),
            Err(e) => {
                warn!("Batch of {} calls failed: {}", calls.len(), e);
                let count = calls.len();
                for call in calls {
                    (call.on_result)(Err(e.clone()));
                }
                count
            }
        }
    }

    /// Flush on the runtime without waiting.
    pub fn spawn_flush(&self) -> JoinHandle<usize> {
        let composer = self.clone();
        self.inner.runtime.spawn(async move { composer.flush().await })
    }
}

/// Match responses to calls by id, invoking callbacks in enqueue order.
fn resolve(calls: Vec<PendingCall>, responses: Vec<RpcResponse>) -> usize {
    let mut by_id: HashMap<u64, RpcResponse> = responses
        .into_iter()
        .filter_map(|response| response.id.map(|id| (id, response)))
        .collect();

    let count = calls.len();
    for call in calls {
        let id = call.request.id;
        let outcome = match by_id.remove(&id) {
            Some(response) => response.into_result(),
            None => Err(WalletError::protocol(
                MISSING_RESPONSE_CODE,
                format!("no response for {} (id {})", call.request.method, id),
            )),
        };
        (call.on_result)(outcome);
    }
    count
}
