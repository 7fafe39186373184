//! Thin Wallet
//!
//! A wallet client that keeps one ledger account credential encrypted at
//! rest and mirrors its balance and token holdings from a remote endpoint.
//!
//! ## Security Model
//!
//! - The private key never leaves the wallet; it is sealed on disk and
//!   zeroized in memory
//! - Every decryption failure is reported the same way
//! - Background results reach wallet state only through the consumer queue
//!
//! ## Layout
//!
//! - [`cipher`], [`identity`], [`storage`]: credential at rest
//! - [`batch`], [`subscription`], [`transport`]: ledger access
//! - [`cache`], [`dispatch`], [`events`], [`session`]: wallet state

pub mod batch;
pub mod cache;
pub mod cipher;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod identity;
pub mod secmem;
pub mod session;
pub mod storage;
pub mod subscription;
pub mod transport;

pub use batch::{AutoExecute, BatchComposer};
pub use cache::Cached;
pub use cipher::{CipherSuite, EncryptionScheme, KdfParams};
pub use config::WalletConfig;
pub use dispatch::MainThreadQueue;
pub use error::{CryptoError, WalletError};
pub use events::{CacheKey, EventBus, ListenerId, WalletEvent};
pub use identity::AccountIdentity;
pub use session::{LedgerLink, TokenHolding, WalletSession, WeakSession};
pub use storage::{CredentialRecord, CredentialStore, FileStore, MemoryStore};
pub use subscription::{Commitment, SubscriptionChannel, SubscriptionHandle, SubscriptionTarget};
