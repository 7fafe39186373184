//! Wallet error taxonomy

use thiserror::Error;

/// Opaque failure of the cipher engine.
///
/// Carries no detail: a wrong key, a truncated blob and a tag
/// mismatch are indistinguishable to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("could not recover plaintext")]
pub struct CryptoError;

/// Errors surfaced by the wallet core
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WalletError {
    /// Empty or malformed password or key, rejected before any I/O
    #[error("validation error: {0}")]
    Validation(String),

    /// Tag mismatch or decode failure while opening a sealed blob
    #[error("credential verification failed")]
    CryptoVerification,

    /// The credential record is missing or unreadable
    #[error("credential storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The credential could not be unlocked (missing record or bad password)
    #[error("unable to load the account credential")]
    LoadFailed,

    /// A request or connection could not complete
    #[error("transport failure: {0}")]
    Transport(String),

    /// The remote endpoint answered with a structured error
    #[error("RPC error {code}: {message}")]
    Protocol { code: i64, message: String },

    /// The operation is not allowed in the current state
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl WalletError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn protocol(code: i64, message: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
        }
    }
}

impl From<CryptoError> for WalletError {
    fn from(_: CryptoError) -> Self {
        Self::CryptoVerification
    }
}

pub type Result<T, E = WalletError> = std::result::Result<T, E>;
