//! Wallet Session
//!
//! Gates every wallet operation behind a loaded/unloaded state machine and
//! keeps the balance and token holdings in sync with the ledger.
//!
//! `store` and `load` never touch the network. The `Loaded` notification is
//! posted to the consumer queue; when it runs, the session starts a ledger
//! sync (batched queries, then an account subscription) on the runtime.
//!
//! Results from background work are posted back through the queue and
//! applied only if the session generation still matches the one captured
//! when the work started, so nothing lands after `unload`.

use base64::Engine;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::batch::BatchComposer;
use crate::cache::Cached;
use crate::cipher::EncryptionScheme;
use crate::dispatch::MainThreadQueue;
use crate::error::{Result, WalletError};
use crate::events::{CacheKey, EventBus, WalletEvent};
use crate::identity::AccountIdentity;
use crate::storage::{CredentialRecord, CredentialStore};
use crate::subscription::{Commitment, SubscriptionChannel, SubscriptionHandle, SubscriptionTarget};

/// SPL token program
pub const TOKEN_PROGRAM_ID: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";

/// A token account owned by the wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenHolding {
    pub mint: String,
    /// Raw amount in the token's smallest unit
    pub amount: u64,
    pub decimals: u8,
}

/// Connection to a ledger endpoint
#[derive(Clone)]
pub struct LedgerLink {
    pub batch: BatchComposer,
    pub channel: Option<SubscriptionChannel>,
    pub runtime: Handle,
    pub commitment: Commitment,
}

struct SessionInner {
    store: Arc<dyn CredentialStore>,
    scheme: EncryptionScheme,
    identity: RwLock<Option<AccountIdentity>>,
    balance: RwLock<Cached<u64>>,
    holdings: RwLock<Cached<Vec<TokenHolding>>>,
    events: EventBus,
    queue: MainThreadQueue,
    ledger: Option<LedgerLink>,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
    generation: AtomicU64,
}

/// Wallet session handle. Clones share the same session.
#[derive(Clone)]
pub struct WalletSession {
    inner: Arc<SessionInner>,
}

/// Non-owning [`WalletSession`] reference
#[derive(Clone)]
pub struct WeakSession {
    inner: Weak<SessionInner>,
}

impl WeakSession {
    pub fn upgrade(&self) -> Option<WalletSession> {
        self.inner.upgrade().map(|inner| WalletSession { inner })
    }
}

impl WalletSession {
    /// Session without ledger access
    pub fn new(store: Arc<dyn CredentialStore>, scheme: EncryptionScheme) -> Self {
        Self::build(store, scheme, None)
    }

    pub fn with_ledger(store: Arc<dyn CredentialStore>, scheme: EncryptionScheme, ledger: LedgerLink) -> Self {
        Self::build(store, scheme, Some(ledger))
    }

    fn build(store: Arc<dyn CredentialStore>, scheme: EncryptionScheme, ledger: Option<LedgerLink>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                store,
                scheme,
                identity: RwLock::new(None),
                balance: RwLock::new(Cached::new()),
                holdings: RwLock::new(Cached::new()),
                events: EventBus::new(),
                queue: MainThreadQueue::new(),
                ledger,
                subscriptions: Mutex::new(Vec::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Handle that does not keep the session alive, for listeners and tasks
    /// owned by the session itself.
    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Queue drained by the consumer; notifications and cache updates run here.
    pub fn queue(&self) -> &MainThreadQueue {
        &self.inner.queue
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.identity.read().is_some()
    }

    /// Whether a credential record exists
    pub fn exists(&self) -> bool {
        self.inner.store.exists()
    }

    /// Base58 public key of the loaded account
    pub fn public_key(&self) -> Option<String> {
        self.inner
            .identity
            .read()
            .as_ref()
            .map(|identity| identity.public_key().to_string())
    }

    pub fn balance(&self) -> Cached<u64> {
        self.inner.balance.read().clone()
    }

    pub fn holdings(&self) -> Cached<Vec<TokenHolding>> {
        self.inner.holdings.read().clone()
    }

    /// Push channel of the attached ledger, if any
    pub fn subscription_channel(&self) -> Option<SubscriptionChannel> {
        self.channel().ok()
    }

    /// Number of tracked subscriptions
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    /// Borrow the loaded identity, e.g. to sign.
    pub fn with_identity<R>(&self, f: impl FnOnce(&AccountIdentity) -> R) -> Result<R> {
        let identity = self.inner.identity.read();
        match identity.as_ref() {
            Some(identity) => Ok(f(identity)),
            None => Err(WalletError::InvalidState("no account loaded".to_string())),
        }
    }

    /// Validate and persist a key, replacing any stored record, and load it.
    pub fn store(&self, private_key_text: &str, password: &str) -> Result<()> {
        if password.is_empty() {
            return Err(WalletError::validation("password must not be empty"));
        }
        if private_key_text.trim().is_empty() {
            return Err(WalletError::validation("private key must not be empty"));
        }

        let identity = AccountIdentity::from_base58(private_key_text).map_err(|e| {
            warn!("Entered an invalid private key");
            e
        })?;

        let scheme = self.inner.scheme.renewed();
        let record = CredentialRecord::seal(identity.private_key_bytes(), password, &scheme)?;
        self.inner.store.write(&record)?;

        let public_key = identity.public_key().to_string();
        let previous = self.inner.identity.write().replace(identity);
        if previous.is_some() {
            self.discard_ledger_state();
        }

        info!("Stored credential for {}", public_key);
        self.post_loaded();
        Ok(())
    }

    /// Unlock the stored credential.
    ///
    /// Every failure past input validation is `LoadFailed`; the log tells a
    /// missing record from a wrong password. A no-op when already loaded.
    pub fn load(&self, password: &str) -> Result<()> {
        if password.is_empty() {
            return Err(WalletError::validation("password must not be empty"));
        }

        if self.is_loaded() {
            debug!("Credential already loaded");
            return Ok(());
        }

        let record = self.inner.store.read().map_err(|e| {
            warn!("Unable to load the credential record: {}", e);
            WalletError::LoadFailed
        })?;

        let key_bytes = record.open(password).map_err(|_| {
            warn!("Could not unlock the credential: decryption unsuccessful");
            WalletError::LoadFailed
        })?;

        let identity = AccountIdentity::from_private_key_material(&key_bytes).map_err(|e| {
            warn!("Stored key material is invalid: {}", e);
            WalletError::LoadFailed
        })?;

        let public_key = identity.public_key().to_string();
        {
            let mut slot = self.inner.identity.write();
            if slot.is_some() {
                return Ok(());
            }
            *slot = Some(identity);
        }

        info!("Loaded account {}", public_key);
        self.post_loaded();
        Ok(())
    }

    /// Tear down subscriptions, clear cached values and drop the identity.
    ///
    /// Handlers stop at once; the server is told in the background, so a
    /// silent endpoint cannot hold the session loaded.
    pub fn unload(&self) {
        if !self.is_loaded() && self.subscription_count() == 0 {
            return;
        }

        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.release_subscriptions();

        self.inner.balance.write().clear();
        self.inner.holdings.write().clear();
        self.inner.identity.write().take();

        info!("Unloaded account");
        let events = self.inner.events.clone();
        self.inner.queue.post(move || events.emit(WalletEvent::Unloaded));
    }

    /// Re-encrypt the stored key under a new password.
    pub fn change_password(&self, old_password: &str, new_password: &str) -> Result<()> {
        if old_password.is_empty() || new_password.is_empty() {
            return Err(WalletError::validation("password must not be empty"));
        }

        let record = self.inner.store.read()?;
        let key_bytes = record.open(old_password).map_err(|e| {
            warn!("Password change rejected: current password did not unlock the credential");
            WalletError::from(e)
        })?;

        let scheme = record.scheme().renewed();
        let resealed = CredentialRecord::seal(&key_bytes, new_password, &scheme)?;
        self.inner.store.write(&resealed)?;
        info!("Credential password changed");
        Ok(())
    }

    /// Re-run the balance and token queries.
    pub async fn refresh(&self) -> Result<()> {
        let ledger = self.ledger()?;
        let public_key = self
            .public_key()
            .ok_or_else(|| WalletError::InvalidState("no account loaded".to_string()))?;
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let commitment = ledger.commitment.as_str();

        let target = Arc::downgrade(&self.inner);
        ledger.batch.enqueue(
            "getBalance",
            json!([public_key, {"commitment": commitment}]),
            move |result| match result.and_then(|value| parse_balance(&value)) {
                Ok(lamports) => post_current(&target, generation, move |inner| {
                    inner.balance.write().update(lamports);
                    inner.events.emit(WalletEvent::CachedValueRefreshed(CacheKey::Balance));
                }),
                Err(e) => warn!("Balance query failed: {}", e),
            },
        );

        let target = Arc::downgrade(&self.inner);
        ledger.batch.enqueue(
            "getTokenAccountsByOwner",
            json!([
                public_key,
                {"programId": TOKEN_PROGRAM_ID},
                {"encoding": "jsonParsed", "commitment": commitment}
            ]),
            move |result| match result.and_then(|value| parse_token_accounts(&value)) {
                Ok(holdings) => post_current(&target, generation, move |inner| {
                    inner.holdings.write().update(holdings);
                    inner
                        .events
                        .emit(WalletEvent::CachedValueRefreshed(CacheKey::TokenHoldings));
                }),
                Err(e) => warn!("Token account query failed: {}", e),
            },
        );

        ledger.batch.flush().await;
        Ok(())
    }

    /// Refresh on a fixed interval while the session is loaded. The task ends
    /// once every session handle is dropped.
    pub fn spawn_refresh_daemon(&self, interval: Duration) -> Result<JoinHandle<()>> {
        let ledger = self.ledger()?;
        let target = self.downgrade();

        Ok(ledger.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(session) = target.upgrade() else {
                    break;
                };
                if !session.is_loaded() {
                    continue;
                }
                if let Err(e) = session.refresh().await {
                    debug!("Periodic refresh failed: {}", e);
                }
            }
        }))
    }

    /// Submit a signed transaction; returns its signature.
    pub async fn send_transaction(&self, transaction: &[u8]) -> Result<String> {
        let ledger = self.ledger()?;
        if !self.is_loaded() {
            return Err(WalletError::InvalidState("no account loaded".to_string()));
        }

        let encoded = base64::engine::general_purpose::STANDARD.encode(transaction);
        let (reply, outcome) = oneshot::channel();
        ledger.batch.enqueue_as::<String, _>(
            "sendTransaction",
            json!([
                encoded,
                {"encoding": "base64", "preflightCommitment": ledger.commitment.as_str()}
            ]),
            move |result| {
                let _ = reply.send(result);
            },
        );
        ledger.batch.flush().await;

        let signature = outcome
            .await
            .map_err(|_| WalletError::Transport("request dropped".to_string()))??;
        info!("Submitted transaction {}", signature);
        Ok(signature)
    }

    /// Watch a transaction signature until the ledger reports it confirmed.
    ///
    /// `on_result` runs once on the consumer queue: `Ok(())` if the
    /// transaction succeeded, `Protocol` if it failed on chain.
    pub async fn confirm_signature<F>(&self, signature: &str, on_result: F) -> Result<SubscriptionHandle>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let channel = self.channel()?;
        if !self.is_loaded() {
            return Err(WalletError::InvalidState("no account loaded".to_string()));
        }
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let target = Arc::downgrade(&self.inner);
        let on_result = Mutex::new(Some(on_result));

        let handle = channel
            .subscribe(
                SubscriptionTarget::Signature(signature.to_string()),
                move |notification| {
                    let Some(on_result) = on_result.lock().take() else {
                        return;
                    };
                    let outcome = transaction_outcome(&notification.result);
                    let subscription = notification.subscription;
                    post_current(&target, generation, move |inner| {
                        inner
                            .subscriptions
                            .lock()
                            .retain(|handle| handle.id() != subscription);
                        on_result(outcome);
                    });
                },
            )
            .await?;

        self.track(handle.clone(), generation, &channel).await;
        Ok(handle)
    }

    fn ledger(&self) -> Result<&LedgerLink> {
        self.inner
            .ledger
            .as_ref()
            .ok_or_else(|| WalletError::InvalidState("no ledger endpoint configured".to_string()))
    }

    fn channel(&self) -> Result<SubscriptionChannel> {
        self.ledger()?
            .channel
            .clone()
            .ok_or_else(|| WalletError::InvalidState("no subscription channel configured".to_string()))
    }

    /// Keep a subscription for teardown, or cancel it if the session moved on
    /// while it was being acknowledged.
    async fn track(&self, handle: SubscriptionHandle, generation: u64, channel: &SubscriptionChannel) {
        {
            let mut subscriptions = self.inner.subscriptions.lock();
            if self.inner.generation.load(Ordering::SeqCst) == generation {
                subscriptions.push(handle);
                return;
            }
        }
        if let Err(e) = channel.unsubscribe(&handle).await {
            debug!("Unsubscribe {} failed: {}", handle.id(), e);
        }
    }

    /// Queue the `Loaded` notification. Ledger sync starts when it runs,
    /// unless the session was unloaded in between.
    fn post_loaded(&self) {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let session = self.clone();
        self.inner.queue.post(move || {
            session.inner.events.emit(WalletEvent::Loaded);
            if session.inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            let Some(runtime) = session.inner.ledger.as_ref().map(|l| l.runtime.clone()) else {
                return;
            };
            runtime.spawn(async move { session.sync_ledger(generation).await });
        });
    }

    /// Initial fetch and account subscription for a freshly loaded key.
    async fn sync_ledger(&self, generation: u64) {
        if let Err(e) = self.refresh().await {
            warn!("Initial ledger sync failed: {}", e);
        }

        let Ok(channel) = self.channel() else {
            return;
        };
        if !channel.is_open() {
            debug!("Subscription channel not open; skipping account subscription");
            return;
        }
        let Some(public_key) = self.public_key() else {
            return;
        };

        let target = Arc::downgrade(&self.inner);
        let subscribed = channel
            .subscribe(SubscriptionTarget::Account(public_key), move |notification| {
                match parse_account_lamports(&notification.result) {
                    Some(lamports) => post_current(&target, generation, move |inner| {
                        inner.balance.write().update(lamports);
                        inner.events.emit(WalletEvent::CachedValueRefreshed(CacheKey::Balance));
                    }),
                    None => debug!("Account notification without lamports"),
                }
            })
            .await;

        match subscribed {
            Ok(handle) => self.track(handle, generation, &channel).await,
            Err(e) => warn!("Account subscription failed: {}", e),
        }
    }

    /// Forget ledger state of a replaced identity.
    fn discard_ledger_state(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.balance.write().clear();
        self.inner.holdings.write().clear();
        self.release_subscriptions();
    }

    /// Detach every tracked handler now and cancel the subscriptions on the
    /// runtime.
    fn release_subscriptions(&self) {
        let handles = std::mem::take(&mut *self.inner.subscriptions.lock());
        if handles.is_empty() {
            return;
        }
        let (Ok(ledger), Ok(channel)) = (self.ledger(), self.channel()) else {
            return;
        };

        for handle in &handles {
            channel.detach(handle);
        }
        ledger.runtime.spawn(async move {
            for handle in handles {
                if let Err(e) = channel.unsubscribe(&handle).await {
                    debug!("Unsubscribe {} failed: {}", handle.id(), e);
                }
            }
        });
    }
}

/// Post `action` to the session queue, applying it only if the session is
/// alive and still at `generation`.
fn post_current<F>(target: &Weak<SessionInner>, generation: u64, action: F)
where
    F: FnOnce(&SessionInner) + Send + 'static,
{
    let Some(inner) = target.upgrade() else {
        return;
    };
    let target = target.clone();
    inner.queue.post(move || {
        let Some(inner) = target.upgrade() else {
            return;
        };
        if inner.generation.load(Ordering::SeqCst) != generation {
            debug!("Dropping result from a previous session");
            return;
        }
        action(&inner);
    });
}

/// `getBalance` returns `{ context, value }`
fn parse_balance(value: &Value) -> Result<u64> {
    value
        .get("value")
        .unwrap_or(value)
        .as_u64()
        .ok_or_else(|| WalletError::protocol(-32700, format!("unexpected balance: {}", value)))
}

/// Lamports from an `accountNotification` result
fn parse_account_lamports(result: &Value) -> Option<u64> {
    result
        .get("value")
        .and_then(|v| v.get("lamports"))
        .and_then(Value::as_u64)
}

fn parse_token_accounts(value: &Value) -> Result<Vec<TokenHolding>> {
    let accounts = value
        .get("value")
        .and_then(Value::as_array)
        .ok_or_else(|| WalletError::protocol(-32700, "token accounts missing"))?;

    let holdings = accounts
        .iter()
        .filter_map(|account| {
            let info = account.pointer("/account/data/parsed/info")?;
            let amount = info.pointer("/tokenAmount/amount")?.as_str()?.parse().ok()?;
            let decimals = info.pointer("/tokenAmount/decimals")?.as_u64()?;
            Some(TokenHolding {
                mint: info.get("mint")?.as_str()?.to_string(),
                amount,
                decimals: u8::try_from(decimals).ok()?,
            })
        })
        .collect();

    Ok(holdings)
}

/// `signatureNotification` carries `{ value: { err } }`
fn transaction_outcome(result: &Value) -> Result<()> {
    match result.pointer("/value/err") {
        None | Some(Value::Null) => Ok(()),
        Some(err) => Err(WalletError::protocol(0, format!("transaction failed: {}", err))),
    }
}
