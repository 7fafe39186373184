//! Integration tests for thin-wallet
//!
//! These tests verify end-to-end wallet functionality including:
//! - Credential lifecycle (store, load, unload, change password)
//! - Batched requests and their callbacks
//! - Push subscriptions over a framed channel
//! - Ledger sync into cached values

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};

use thin_wallet::transport::{
    Frame, FrameConnector, FrameSink, FrameStream, RpcRequest, RpcResponse, RpcTransport,
};
use thin_wallet::{
    AccountIdentity, AutoExecute, BatchComposer, CacheKey, Commitment, CredentialStore,
    EncryptionScheme, FileStore, KdfParams, LedgerLink, MemoryStore, SubscriptionChannel,
    SubscriptionTarget, WalletError, WalletEvent, WalletSession,
};
use thin_wallet::subscription::ChannelState;

const TEST_PASSWORD: &str = "pw1";

// ============================================================================
// Test doubles
// ============================================================================

type Responder = Box<dyn Fn(&RpcRequest) -> Option<RpcResponse> + Send + Sync>;

/// Answers batches through a responder, in reverse order
struct ScriptedTransport {
    responder: Responder,
    batches: Mutex<Vec<Vec<String>>>,
    fail: AtomicBool,
}

impl ScriptedTransport {
    fn new(responder: impl Fn(&RpcRequest) -> Option<RpcResponse> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            batches: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }

    /// Echo the method name back as the result
    fn echo() -> Arc<Self> {
        Self::new(|r| Some(RpcResponse::success(r.id, json!(r.method))))
    }

    /// Ledger-like answers for a wallet holding `lamports`
    fn ledger(lamports: u64) -> Arc<Self> {
        Self::new(move |r| {
            let result = match r.method.as_str() {
                "getBalance" => json!({"context": {"slot": 1}, "value": lamports}),
                "getTokenAccountsByOwner" => json!({
                    "context": {"slot": 1},
                    "value": [{
                        "pubkey": "TokenAcc",
                        "account": {"data": {"parsed": {"info": {
                            "mint": "MintA",
                            "tokenAmount": {"amount": "250", "decimals": 1}
                        }}}}
                    }]
                }),
                "sendTransaction" => json!("5igSig"),
                _ => return Some(RpcResponse::failure(r.id, -32601, "Method not found")),
            };
            Some(RpcResponse::success(r.id, result))
        })
    }

    fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().clone()
    }
}

#[async_trait]
impl RpcTransport for ScriptedTransport {
    async fn send(&self, request: RpcRequest) -> thin_wallet::error::Result<Value> {
        match (self.responder)(&request) {
            Some(response) => response.into_result(),
            None => Err(WalletError::Transport("no response".to_string())),
        }
    }

    async fn send_batch(&self, requests: Vec<RpcRequest>) -> thin_wallet::error::Result<Vec<RpcResponse>> {
        self.batches
            .lock()
            .push(requests.iter().map(|r| r.method.clone()).collect());

        if self.fail.load(Ordering::SeqCst) {
            return Err(WalletError::Transport("connection reset".to_string()));
        }

        Ok(requests
            .iter()
            .rev()
            .filter_map(|r| (self.responder)(r))
            .collect())
    }
}

/// Holds each batch until released
struct GatedTransport {
    entered: Notify,
    gate: Notify,
}

#[async_trait]
impl RpcTransport for GatedTransport {
    async fn send(&self, request: RpcRequest) -> thin_wallet::error::Result<Value> {
        Ok(json!(request.id))
    }

    async fn send_batch(&self, requests: Vec<RpcRequest>) -> thin_wallet::error::Result<Vec<RpcResponse>> {
        self.entered.notify_one();
        self.gate.notified().await;
        Ok(requests
            .into_iter()
            .map(|r| RpcResponse::success(r.id, json!(r.method)))
            .collect())
    }
}

struct MockSink {
    to_server: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send_frame(&mut self, payload: Vec<u8>) -> thin_wallet::error::Result<()> {
        self.to_server
            .send(payload)
            .map_err(|_| WalletError::Transport("server gone".to_string()))
    }

    async fn close(&mut self) -> thin_wallet::error::Result<()> {
        Ok(())
    }
}

struct MockStream {
    from_server: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl FrameStream for MockStream {
    async fn receive_frame(&mut self) -> thin_wallet::error::Result<Option<Frame>> {
        Ok(self.from_server.recv().await)
    }
}

/// Hands out one pre-built in-memory connection
struct MockConnector {
    halves: Mutex<Option<(MockSink, MockStream)>>,
}

#[async_trait]
impl FrameConnector for MockConnector {
    async fn connect(&self, _uri: &str) -> thin_wallet::error::Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        let (sink, stream) = self
            .halves
            .lock()
            .take()
            .ok_or_else(|| WalletError::Transport("already connected".to_string()))?;
        Ok((Box::new(sink), Box::new(stream)))
    }
}

/// Server end of a mock connection
struct MockServer {
    to_client: mpsc::UnboundedSender<Frame>,
    from_client: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MockServer {
    async fn next_request(&mut self) -> Value {
        let payload = tokio::time::timeout(Duration::from_secs(5), self.from_client.recv())
            .await
            .expect("timed out waiting for a request")
            .expect("client hung up");
        serde_json::from_slice(&payload).unwrap()
    }

    fn send(&self, message: Value) {
        self.to_client.send(Frame::text(message.to_string())).unwrap();
    }

    fn ack(&self, request: &Value, result: Value) {
        self.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": result}));
    }

    fn notify(&self, method: &str, subscription: u64, result: Value) {
        self.send(json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": {"subscription": subscription, "result": result}
        }));
    }
}

fn mock_connection() -> (Arc<MockConnector>, MockServer) {
    let (to_server, from_client) = mpsc::unbounded_channel();
    let (to_client, from_server) = mpsc::unbounded_channel();
    let connector = MockConnector {
        halves: Mutex::new(Some((MockSink { to_server }, MockStream { from_server }))),
    };
    (Arc::new(connector), MockServer { to_client, from_client })
}

async fn open_channel() -> (SubscriptionChannel, MockServer) {
    let (connector, server) = mock_connection();
    let channel = SubscriptionChannel::new(connector, Commitment::Confirmed, 1024);
    channel.connect("ws://mock").await.unwrap();
    (channel, server)
}

/// Drain the session queue until `done` holds
async fn drain_until(session: &WalletSession, done: impl Fn(&WalletSession) -> bool) {
    for _ in 0..200 {
        session.queue().run_pending();
        if done(session) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn record_events(session: &WalletSession) -> Arc<Mutex<Vec<WalletEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    session.events().add_listener(move |event| sink.lock().push(*event));
    events
}

fn new_key_text() -> (String, String) {
    let identity = AccountIdentity::generate();
    (
        identity.private_key().to_string(),
        identity.public_key().to_string(),
    )
}

// ============================================================================
// Credential Lifecycle Tests
// ============================================================================

mod credential_lifecycle {
    use super::*;

    fn file_session(dir: &TempDir) -> WalletSession {
        let store = Arc::new(FileStore::new(dir.path().join("credential.json")));
        WalletSession::new(store, EncryptionScheme::default())
    }

    #[test]
    fn test_store_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let (key, public_key) = new_key_text();

        let session = file_session(&temp_dir);
        session.store(&key, TEST_PASSWORD).unwrap();
        assert!(session.is_loaded());

        // A fresh session over the same file
        let reopened = file_session(&temp_dir);
        assert!(reopened.exists());
        reopened.load(TEST_PASSWORD).unwrap();
        assert_eq!(reopened.public_key().unwrap(), public_key);
    }

    #[test]
    fn test_wrong_password_on_fresh_session() {
        let temp_dir = TempDir::new().unwrap();
        let (key, _) = new_key_text();
        file_session(&temp_dir).store(&key, TEST_PASSWORD).unwrap();

        let session = file_session(&temp_dir);
        let events = record_events(&session);

        assert_eq!(session.load("wrong"), Err(WalletError::LoadFailed));
        assert!(!session.is_loaded());
        session.queue().run_pending();
        assert!(events.lock().is_empty());
    }

    #[test]
    fn test_load_while_loaded_skips_storage() {
        let store = Arc::new(MemoryStore::new());
        let session = WalletSession::new(store.clone(), EncryptionScheme::default());
        let events = record_events(&session);
        let (key, public_key) = new_key_text();
        session.store(&key, TEST_PASSWORD).unwrap();

        // The record is not consulted again
        store.set_raw("garbage");
        assert_eq!(session.load(TEST_PASSWORD), Ok(()));
        assert!(session.is_loaded());
        assert_eq!(session.public_key().unwrap(), public_key);

        session.queue().run_pending();
        assert_eq!(*events.lock(), vec![WalletEvent::Loaded]);
    }

    #[test]
    fn test_load_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let (key, _) = new_key_text();
        file_session(&temp_dir).store(&key, TEST_PASSWORD).unwrap();

        let session = file_session(&temp_dir);
        let events = record_events(&session);
        session.load(TEST_PASSWORD).unwrap();
        session.load(TEST_PASSWORD).unwrap();
        session.queue().run_pending();

        assert_eq!(*events.lock(), vec![WalletEvent::Loaded]);
    }

    #[test]
    fn test_load_without_credential() {
        let temp_dir = TempDir::new().unwrap();
        let session = file_session(&temp_dir);
        assert!(!session.exists());
        assert_eq!(session.load(TEST_PASSWORD), Err(WalletError::LoadFailed));
    }

    #[test]
    fn test_corrupt_record() {
        let store = Arc::new(MemoryStore::new());
        let session = WalletSession::new(store.clone(), EncryptionScheme::default());
        let (key, _) = new_key_text();
        session.store(&key, TEST_PASSWORD).unwrap();

        // Flip one hex digit of the sealed blob
        let raw = store.raw().unwrap();
        let record: Value = serde_json::from_str(&raw).unwrap();
        let digest = record["digest"].as_str().unwrap();
        let flipped = if digest.ends_with('0') { "1" } else { "0" };
        let tampered = format!("{}{}", &digest[..digest.len() - 1], flipped);
        store.set_raw(json!({"version": 1, "digest": tampered}).to_string());

        let fresh = WalletSession::new(store, EncryptionScheme::default());
        assert_eq!(fresh.load(TEST_PASSWORD), Err(WalletError::LoadFailed));
        assert!(!fresh.is_loaded());
    }

    #[test]
    fn test_invalid_key_is_not_persisted() {
        let store = Arc::new(MemoryStore::new());
        let session = WalletSession::new(store.clone(), EncryptionScheme::default());

        // A bare 32-byte seed is not a full keypair
        let text = bs58::encode([7u8; 32]).into_string();

        assert!(matches!(
            session.store(&text, TEST_PASSWORD),
            Err(WalletError::Validation(_))
        ));
        assert!(!store.exists());
        assert!(!session.is_loaded());
    }

    #[test]
    fn test_store_replaces_previous_record() {
        let temp_dir = TempDir::new().unwrap();
        let (first, _) = new_key_text();
        let (second, second_public) = new_key_text();

        let session = file_session(&temp_dir);
        session.store(&first, "one").unwrap();
        session.store(&second, "two").unwrap();
        assert_eq!(session.public_key().unwrap(), second_public);

        let reopened = file_session(&temp_dir);
        assert_eq!(reopened.load("one"), Err(WalletError::LoadFailed));
        reopened.load("two").unwrap();
        assert_eq!(reopened.public_key().unwrap(), second_public);
    }

    #[test]
    fn test_unload_notifies_and_clears() {
        let temp_dir = TempDir::new().unwrap();
        let (key, _) = new_key_text();
        let session = file_session(&temp_dir);
        let events = record_events(&session);

        session.store(&key, TEST_PASSWORD).unwrap();
        session.unload();
        session.unload();
        session.queue().run_pending();

        assert!(!session.is_loaded());
        assert_eq!(*events.lock(), vec![WalletEvent::Loaded, WalletEvent::Unloaded]);
        assert!(session.with_identity(|id| id.public_key().to_string()).is_err());

        // The credential stays on disk
        session.load(TEST_PASSWORD).unwrap();
    }

    #[test]
    fn test_change_password() {
        let temp_dir = TempDir::new().unwrap();
        let (key, public_key) = new_key_text();
        let session = file_session(&temp_dir);
        session.store(&key, "old-password").unwrap();

        assert_eq!(
            session.change_password("not-it", "new-password"),
            Err(WalletError::CryptoVerification)
        );
        session.change_password("old-password", "new-password").unwrap();
        assert!(session.is_loaded());

        let reopened = file_session(&temp_dir);
        assert_eq!(reopened.load("old-password"), Err(WalletError::LoadFailed));
        reopened.load("new-password").unwrap();
        assert_eq!(reopened.public_key().unwrap(), public_key);
    }

    #[test]
    fn test_argon2_scheme() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(FileStore::new(temp_dir.path().join("credential.json")));
        let scheme = EncryptionScheme::new(
            KdfParams::argon2id_with(64, 1, 1),
            thin_wallet::CipherSuite::ChaCha20Poly1305,
        );
        let (key, public_key) = new_key_text();

        WalletSession::new(store.clone(), scheme.clone())
            .store(&key, TEST_PASSWORD)
            .unwrap();

        // The scheme travels with the record
        let session = WalletSession::new(store.clone(), EncryptionScheme::default());
        session.load(TEST_PASSWORD).unwrap();
        assert_eq!(session.public_key().unwrap(), public_key);
        assert!(matches!(store.read().unwrap().scheme().kdf, KdfParams::Argon2id { .. }));
    }

    #[test]
    fn test_signing_with_loaded_identity() {
        let store = Arc::new(MemoryStore::new());
        let session = WalletSession::new(store, EncryptionScheme::default());
        let (key, _) = new_key_text();
        session.store(&key, TEST_PASSWORD).unwrap();

        let signature = session.with_identity(|id| id.sign(b"message")).unwrap();
        assert!(session
            .with_identity(|id| id.verify(b"message", &signature))
            .unwrap());
    }
}

// ============================================================================
// Batch Composer Tests
// ============================================================================

mod batch_composer {
    use super::*;

    fn collector() -> (
        Arc<Mutex<Vec<(u32, thin_wallet::error::Result<Value>)>>>,
        impl Fn(u32) -> Box<dyn FnOnce(thin_wallet::error::Result<Value>) + Send>,
    ) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        let make = move |tag: u32| -> Box<dyn FnOnce(thin_wallet::error::Result<Value>) + Send> {
            let sink = sink.clone();
            Box::new(move |result| sink.lock().push((tag, result)))
        };
        (results, make)
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let transport = ScriptedTransport::echo();
        let composer = BatchComposer::new(transport.clone(), AutoExecute::Manual, Handle::current());
        let (results, callback) = collector();

        composer.enqueue("A", json!([]), callback(1));
        composer.enqueue("B", json!([]), callback(2));
        composer.enqueue("C", json!([]), callback(3));
        assert!(results.lock().is_empty());
        assert!(transport.batches().is_empty());

        assert_eq!(composer.flush().await, 3);

        let results = results.lock();
        let order: Vec<u32> = results.iter().map(|(tag, _)| *tag).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(results[0].1, Ok(json!("A")));
        assert_eq!(results[2].1, Ok(json!("C")));
        assert_eq!(transport.batches(), vec![vec!["A", "B", "C"]]);
    }

    #[tokio::test]
    async fn test_threshold_auto_flush() {
        let transport = ScriptedTransport::ledger(10);
        let composer = BatchComposer::new(transport.clone(), AutoExecute::Threshold(3), Handle::current());
        let (results, callback) = collector();

        assert!(composer.enqueue("getBalance", json!(["a"]), callback(1)).is_none());
        assert!(composer.enqueue("getBalance", json!(["b"]), callback(2)).is_none());
        let flush = composer
            .enqueue("getBalance", json!(["c"]), callback(3))
            .expect("third enqueue flushes");

        assert_eq!(flush.await.unwrap(), 3);
        assert_eq!(results.lock().len(), 3);
        assert_eq!(transport.batches().len(), 1);
        assert_eq!(composer.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_partial_failure() {
        let transport = ScriptedTransport::ledger(10);
        let composer = BatchComposer::new(transport, AutoExecute::Manual, Handle::current());
        let (results, callback) = collector();

        composer.enqueue("getBalance", json!(["a"]), callback(1));
        composer.enqueue("bogus", json!([]), callback(2));
        composer.enqueue("getBalance", json!(["b"]), callback(3));
        composer.flush().await;

        let results = results.lock();
        assert!(results[0].1.is_ok());
        assert_eq!(results[1].1, Err(WalletError::protocol(-32601, "Method not found")));
        assert!(results[2].1.is_ok());
    }

    #[tokio::test]
    async fn test_missing_response() {
        let transport = ScriptedTransport::new(|r| {
            (r.method != "dropped").then(|| RpcResponse::success(r.id, json!(1)))
        });
        let composer = BatchComposer::new(transport, AutoExecute::Manual, Handle::current());
        let (results, callback) = collector();

        composer.enqueue("kept", json!([]), callback(1));
        composer.enqueue("dropped", json!([]), callback(2));
        composer.flush().await;

        let results = results.lock();
        assert_eq!(results.len(), 2);
        assert!(results[0].1.is_ok());
        assert!(matches!(results[1].1, Err(WalletError::Protocol { .. })));
    }

    #[tokio::test]
    async fn test_transport_failure_resolves_everything() {
        let transport = ScriptedTransport::echo();
        transport.fail.store(true, Ordering::SeqCst);
        let composer = BatchComposer::new(transport, AutoExecute::Manual, Handle::current());
        let (results, callback) = collector();

        composer.enqueue("A", json!([]), callback(1));
        composer.enqueue("B", json!([]), callback(2));
        assert_eq!(composer.flush().await, 2);

        let results = results.lock();
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|(_, r)| matches!(r, Err(WalletError::Transport(_)))));
    }

    #[tokio::test]
    async fn test_enqueue_during_flush_joins_next_batch() {
        let transport = Arc::new(GatedTransport {
            entered: Notify::new(),
            gate: Notify::new(),
        });
        let composer = BatchComposer::new(transport.clone(), AutoExecute::Manual, Handle::current());
        let (results, callback) = collector();

        composer.enqueue("first", json!([]), callback(1));
        let in_flight = composer.spawn_flush();
        transport.entered.notified().await;

        composer.enqueue("second", json!([]), callback(2));
        assert_eq!(composer.pending_len(), 1);

        transport.gate.notify_one();
        assert_eq!(in_flight.await.unwrap(), 1);
        assert_eq!(results.lock().len(), 1);

        let next = composer.spawn_flush();
        transport.entered.notified().await;
        transport.gate.notify_one();
        assert_eq!(next.await.unwrap(), 1);

        let order: Vec<u32> = results.lock().iter().map(|(tag, _)| *tag).collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_typed_results() {
        let transport = ScriptedTransport::ledger(10);
        let composer = BatchComposer::new(transport, AutoExecute::Manual, Handle::current());
        let signature = Arc::new(Mutex::new(None));
        let sink = signature.clone();

        composer.enqueue_as::<String, _>("sendTransaction", json!(["AAAA"]), move |result| {
            *sink.lock() = Some(result);
        });
        composer.flush().await;

        assert_eq!(signature.lock().take(), Some(Ok("5igSig".to_string())));
    }
}

// ============================================================================
// Subscription Channel Tests
// ============================================================================

mod subscription_channel {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_and_receive() {
        let (channel, mut server) = open_channel().await;
        assert_eq!(channel.state(), ChannelState::Open);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let subscribing = tokio::spawn({
            let channel = channel.clone();
            async move {
                channel
                    .subscribe(SubscriptionTarget::Account("Wallet1".to_string()), move |n| {
                        let _ = tx.send(n);
                    })
                    .await
            }
        });

        let request = server.next_request().await;
        assert_eq!(request["method"], "accountSubscribe");
        assert_eq!(request["params"][0], "Wallet1");
        assert_eq!(request["params"][1]["commitment"], "confirmed");

        // Notification sent immediately behind the ack is not lost
        server.ack(&request, json!(42));
        server.notify("accountNotification", 42, json!({"value": {"lamports": 5}}));

        let handle = subscribing.await.unwrap().unwrap();
        assert_eq!(handle.id(), 42);

        let notification = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notification.subscription, 42);
        assert_eq!(notification.method, "accountNotification");
        assert_eq!(notification.result["value"]["lamports"], 5);
    }

    #[tokio::test]
    async fn test_fragmented_notification() {
        let (channel, mut server) = open_channel().await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let subscribing = tokio::spawn({
            let channel = channel.clone();
            async move {
                channel
                    .subscribe(SubscriptionTarget::Account("Wallet1".to_string()), move |n| {
                        let _ = tx.send(n);
                    })
                    .await
            }
        });
        let request = server.next_request().await;
        server.ack(&request, json!(3));
        subscribing.await.unwrap().unwrap();

        let message = json!({
            "jsonrpc": "2.0",
            "method": "accountNotification",
            "params": {"subscription": 3, "result": {"value": {"lamports": 77}}}
        })
        .to_string()
        .into_bytes();
        let (head, tail) = message.split_at(message.len() / 2);
        server.to_client.send(Frame::fragment(head.to_vec(), false)).unwrap();
        server.to_client.send(Frame::fragment(tail.to_vec(), true)).unwrap();

        let notification = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notification.result["value"]["lamports"], 77);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let (channel, mut server) = open_channel().await;
        let count = Arc::new(Mutex::new(0u32));
        let counter = count.clone();

        let subscribing = tokio::spawn({
            let channel = channel.clone();
            async move {
                channel
                    .subscribe(SubscriptionTarget::Account("Wallet1".to_string()), move |_| {
                        *counter.lock() += 1;
                    })
                    .await
            }
        });
        let request = server.next_request().await;
        server.ack(&request, json!(9));
        let handle = subscribing.await.unwrap().unwrap();
        assert_eq!(channel.active_subscriptions(), 1);

        let unsubscribing = tokio::spawn({
            let channel = channel.clone();
            let handle = handle.clone();
            async move { channel.unsubscribe(&handle).await }
        });
        let request = server.next_request().await;
        assert_eq!(request["method"], "accountUnsubscribe");
        assert_eq!(request["params"], json!([9]));

        // Handler is already gone before the server confirms
        assert_eq!(channel.active_subscriptions(), 0);
        server.notify("accountNotification", 9, json!({"value": {"lamports": 1}}));
        server.ack(&request, json!(true));
        unsubscribing.await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*count.lock(), 0);
    }

    #[tokio::test]
    async fn test_signature_subscription_is_one_shot() {
        let (channel, mut server) = open_channel().await;
        let count = Arc::new(Mutex::new(0u32));
        let counter = count.clone();

        let subscribing = tokio::spawn({
            let channel = channel.clone();
            async move {
                channel
                    .subscribe(SubscriptionTarget::Signature("5igSig".to_string()), move |_| {
                        *counter.lock() += 1;
                    })
                    .await
            }
        });
        let request = server.next_request().await;
        assert_eq!(request["method"], "signatureSubscribe");
        server.ack(&request, json!(11));
        subscribing.await.unwrap().unwrap();

        server.notify("signatureNotification", 11, json!({"value": {"err": null}}));
        server.notify("signatureNotification", 11, json!({"value": {"err": null}}));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*count.lock(), 1);
        assert_eq!(channel.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_server_error_on_subscribe() {
        let (channel, mut server) = open_channel().await;

        let subscribing = tokio::spawn({
            let channel = channel.clone();
            async move {
                channel
                    .subscribe(SubscriptionTarget::Account("bad".to_string()), |_| {})
                    .await
            }
        });
        let request = server.next_request().await;
        server.send(json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": {"code": -32602, "message": "Invalid param"}
        }));

        let result = subscribing.await.unwrap();
        assert_eq!(result, Err(WalletError::protocol(-32602, "Invalid param")));
        assert_eq!(channel.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_pending_acks() {
        let (channel, mut server) = open_channel().await;

        let subscribing = tokio::spawn({
            let channel = channel.clone();
            async move {
                channel
                    .subscribe(SubscriptionTarget::Account("Wallet1".to_string()), |_| {})
                    .await
            }
        });
        let _request = server.next_request().await;

        server.to_client.send(Frame::close()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), subscribing)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(WalletError::Transport(_))));

        for _ in 0..100 {
            if channel.state() == ChannelState::Disconnected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(channel.state(), ChannelState::Disconnected);

        let again = channel
            .subscribe(SubscriptionTarget::Account("Wallet1".to_string()), |_| {})
            .await;
        assert!(matches!(again, Err(WalletError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_local_close() {
        let (channel, _server) = open_channel().await;
        channel.close().await;
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert!(channel.connect("ws://mock").await.is_err());
    }
}

// ============================================================================
// Ledger Sync Tests
// ============================================================================

mod ledger_sync {
    use super::*;

    fn ledger_session(
        transport: Arc<ScriptedTransport>,
        channel: Option<SubscriptionChannel>,
    ) -> WalletSession {
        let ledger = LedgerLink {
            batch: BatchComposer::new(transport, AutoExecute::Manual, Handle::current()),
            channel,
            runtime: Handle::current(),
            commitment: Commitment::Confirmed,
        };
        WalletSession::with_ledger(Arc::new(MemoryStore::new()), EncryptionScheme::default(), ledger)
    }

    #[tokio::test]
    async fn test_load_triggers_sync() {
        let transport = ScriptedTransport::ledger(5_000);
        let session = ledger_session(transport.clone(), None);
        let events = record_events(&session);
        let (key, _) = new_key_text();

        session.store(&key, TEST_PASSWORD).unwrap();
        // No ledger I/O until the consumer runs the Loaded notification
        assert!(transport.batches().is_empty());

        drain_until(&session, |s| s.balance().epoch() > 0 && s.holdings().epoch() > 0).await;

        assert_eq!(*session.balance().value(), 5_000);
        let holdings = session.holdings();
        assert_eq!(holdings.value().len(), 1);
        assert_eq!(holdings.value()[0].mint, "MintA");
        assert_eq!(holdings.value()[0].amount, 250);

        let events = events.lock();
        assert_eq!(events[0], WalletEvent::Loaded);
        assert!(events.contains(&WalletEvent::CachedValueRefreshed(CacheKey::Balance)));
        assert!(events.contains(&WalletEvent::CachedValueRefreshed(CacheKey::TokenHoldings)));
        assert_eq!(
            transport.batches()[0],
            vec!["getBalance", "getTokenAccountsByOwner"]
        );
    }

    #[tokio::test]
    async fn test_refresh_advances_epoch() {
        let transport = ScriptedTransport::ledger(1);
        let session = ledger_session(transport, None);
        let (key, _) = new_key_text();
        session.store(&key, TEST_PASSWORD).unwrap();
        drain_until(&session, |s| s.balance().epoch() == 1).await;

        session.refresh().await.unwrap();
        session.queue().run_pending();
        assert_eq!(session.balance().epoch(), 2);
    }

    #[tokio::test]
    async fn test_results_after_unload_are_dropped() {
        let transport = ScriptedTransport::ledger(9);
        let session = ledger_session(transport, None);
        let (key, _) = new_key_text();
        session.store(&key, TEST_PASSWORD).unwrap();

        // Results are queued but not yet applied
        session.refresh().await.unwrap();
        session.unload();
        session.queue().run_pending();

        assert_eq!(session.balance().epoch(), 0);
        assert_eq!(*session.balance().value(), 0);
        assert!(session.holdings().value().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_requires_loaded_account() {
        let session = ledger_session(ScriptedTransport::ledger(1), None);
        assert!(matches!(
            session.refresh().await,
            Err(WalletError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_send_transaction() {
        let session = ledger_session(ScriptedTransport::ledger(1), None);
        assert!(session.send_transaction(b"signed").await.is_err());

        let (key, _) = new_key_text();
        session.store(&key, TEST_PASSWORD).unwrap();
        assert_eq!(session.send_transaction(b"signed").await.unwrap(), "5igSig");
    }

    #[tokio::test]
    async fn test_push_updates_and_teardown() {
        let (connector, mut server) = mock_connection();
        let channel = SubscriptionChannel::new(connector, Commitment::Confirmed, 4096);
        channel.connect("ws://mock").await.unwrap();

        let session = ledger_session(ScriptedTransport::ledger(100), Some(channel.clone()));
        let events = record_events(&session);
        let (key, public_key) = new_key_text();
        session.store(&key, TEST_PASSWORD).unwrap();
        session.queue().run_pending();

        let request = server.next_request().await;
        assert_eq!(request["method"], "accountSubscribe");
        assert_eq!(request["params"][0], public_key.as_str());
        server.ack(&request, json!(21));

        drain_until(&session, |s| s.subscription_count() == 1 && s.balance().epoch() >= 1).await;

        server.notify("accountNotification", 21, json!({"value": {"lamports": 900}}));
        drain_until(&session, |s| *s.balance().value() == 900).await;

        session.unload();
        assert!(!session.is_loaded());
        assert_eq!(session.subscription_count(), 0);
        assert_eq!(channel.active_subscriptions(), 0);

        let request = server.next_request().await;
        assert_eq!(request["method"], "accountUnsubscribe");
        assert_eq!(request["params"], json!([21]));
        server.ack(&request, json!(true));

        session.queue().run_pending();
        assert_eq!(session.balance().epoch(), 0);
        assert_eq!(events.lock().last(), Some(&WalletEvent::Unloaded));
    }

    #[tokio::test]
    async fn test_unload_with_silent_server() {
        let (channel, mut server) = open_channel().await;
        let session = ledger_session(ScriptedTransport::ledger(100), Some(channel.clone()));
        let (key, _) = new_key_text();
        session.store(&key, TEST_PASSWORD).unwrap();
        session.queue().run_pending();

        let request = server.next_request().await;
        server.ack(&request, json!(21));
        drain_until(&session, |s| s.subscription_count() == 1).await;

        // The unsubscribe is never acknowledged
        session.unload();
        assert!(!session.is_loaded());
        assert_eq!(session.balance().epoch(), 0);
        assert_eq!(channel.active_subscriptions(), 0);

        let request = server.next_request().await;
        assert_eq!(request["method"], "accountUnsubscribe");

        server.notify("accountNotification", 21, json!({"value": {"lamports": 5}}));
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.queue().run_pending();
        assert_eq!(session.balance().epoch(), 0);
    }

    #[tokio::test]
    async fn test_confirm_signature_requires_loaded_account() {
        let (channel, _server) = open_channel().await;
        let session = ledger_session(ScriptedTransport::ledger(1), Some(channel.clone()));

        let result = session.confirm_signature("5igSig", |_| {}).await;
        assert!(matches!(result, Err(WalletError::InvalidState(_))));
        assert_eq!(session.subscription_count(), 0);
        assert_eq!(channel.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_confirm_signature() {
        let (channel, mut server) = open_channel().await;
        let session = ledger_session(ScriptedTransport::ledger(1), Some(channel));
        let (key, _) = new_key_text();
        session.store(&key, TEST_PASSWORD).unwrap();
        let outcome = Arc::new(Mutex::new(None));
        let sink = outcome.clone();

        let confirming = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .confirm_signature("5igSig", move |result| {
                        *sink.lock() = Some(result);
                    })
                    .await
            }
        });
        let request = server.next_request().await;
        assert_eq!(request["method"], "signatureSubscribe");
        server.ack(&request, json!(4));
        confirming.await.unwrap().unwrap();
        assert_eq!(session.subscription_count(), 1);

        server.notify("signatureNotification", 4, json!({"context": {"slot": 3}, "value": {"err": null}}));
        drain_until(&session, |_| outcome.lock().is_some()).await;

        assert_eq!(outcome.lock().take(), Some(Ok(())));
        assert_eq!(session.subscription_count(), 0);
    }
}
