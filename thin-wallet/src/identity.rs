//! Account Identity
//!
//! Turns raw Ed25519 keypair bytes (`seed || public key`) into a validated
//! account identity.
//!
//! Security: key bytes live in a boxed `Zeroizing` buffer that is wiped on
//! drop, and the buffer's pages are pinned with mlock() where permitted so
//! the key is not swapped to disk.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::fmt;
use std::sync::OnceLock;
use zeroize::Zeroizing;

use crate::error::{Result, WalletError};
use crate::secmem::{pin_bytes, PinnedRegion};

/// Full keypair length: 32-byte seed followed by the 32-byte public key
pub const KEYPAIR_LEN: usize = 64;

/// Ed25519 public key length
pub const PUBLIC_KEY_LEN: usize = 32;

/// Ed25519 seed length
const SEED_LEN: usize = 32;

/// Ed25519 signature length
pub const SIGNATURE_LEN: usize = 64;

/// A validated (private, public) ledger account keypair.
pub struct AccountIdentity {
    /// Must be declared before `keypair` so munlock runs while the memory is
    /// still valid (fields drop in declaration order).
    _pin: PinnedRegion,

    keypair: Box<Zeroizing<[u8; KEYPAIR_LEN]>>,

    public_key: [u8; PUBLIC_KEY_LEN],

    public_key_b58: OnceLock<String>,

    private_key_b58: OnceLock<Zeroizing<String>>,
}

impl AccountIdentity {
    /// Build an identity from the full 64-byte keypair.
    ///
    /// The last 32 bytes must be a valid point on the curve, otherwise no
    /// identity is produced.
    pub fn from_private_key_material(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEYPAIR_LEN {
            return Err(WalletError::validation(format!(
                "expected {} key bytes, got {}",
                KEYPAIR_LEN,
                bytes.len()
            )));
        }

        let mut public_key = [0u8; PUBLIC_KEY_LEN];
        public_key.copy_from_slice(&bytes[SEED_LEN..]);

        if !is_on_curve(&public_key) {
            return Err(WalletError::validation("public key is not on the curve"));
        }

        let mut keypair = Box::new(Zeroizing::new([0u8; KEYPAIR_LEN]));
        keypair.copy_from_slice(bytes);

        Ok(Self::assemble(keypair, public_key))
    }

    /// Build an identity from base58 encoded keypair text.
    pub fn from_base58(text: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            bs58::decode(text.trim())
                .into_vec()
                .map_err(|_| WalletError::validation("private key is not valid base58"))?,
        );
        Self::from_private_key_material(&bytes)
    }

    /// Generate a fresh identity from OS randomness.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let keypair = Box::new(Zeroizing::new(signing_key.to_keypair_bytes()));
        let public_key = signing_key.verifying_key().to_bytes();
        Self::assemble(keypair, public_key)
    }

    fn assemble(keypair: Box<Zeroizing<[u8; KEYPAIR_LEN]>>, public_key: [u8; PUBLIC_KEY_LEN]) -> Self {
        // SAFETY: the boxed buffer is owned by Self, never moves, and outlives
        // the pin guard (see field order).
        let pin = unsafe { pin_bytes(&keypair[..]) };
        Self {
            _pin: pin,
            keypair,
            public_key,
            public_key_b58: OnceLock::new(),
            private_key_b58: OnceLock::new(),
        }
    }

    /// Raw keypair bytes (`seed || public key`)
    pub fn private_key_bytes(&self) -> &[u8; KEYPAIR_LEN] {
        &self.keypair
    }

    pub fn public_key_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.public_key
    }

    /// Base58 public key, encoded on first access.
    pub fn public_key(&self) -> &str {
        self.public_key_b58
            .get_or_init(|| bs58::encode(self.public_key).into_string())
    }

    /// Base58 keypair, encoded on first access.
    pub fn private_key(&self) -> &str {
        self.private_key_b58
            .get_or_init(|| Zeroizing::new(bs58::encode(&self.keypair[..]).into_string()))
    }

    /// Sign a message with the account key.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        let mut seed = Zeroizing::new([0u8; SEED_LEN]);
        seed.copy_from_slice(&self.keypair[..SEED_LEN]);
        let signing_key = SigningKey::from_bytes(&seed);
        signing_key.sign(message).to_bytes()
    }

    /// Verify a signature against this identity's public key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        verify_signature(&self.public_key, message, signature)
    }

    /// Returns true if the key bytes are pinned in memory.
    pub fn is_memory_pinned(&self) -> bool {
        self._pin.is_pinned()
    }
}

impl fmt::Debug for AccountIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountIdentity")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// On-curve check for a candidate Ed25519 public key.
pub fn is_on_curve(public_key: &[u8; PUBLIC_KEY_LEN]) -> bool {
    VerifyingKey::from_bytes(public_key).is_ok()
}

/// Verify `signature` over `message` for a raw public key.
pub fn verify_signature(public_key: &[u8; PUBLIC_KEY_LEN], message: &[u8], signature: &[u8]) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    verifying_key.verify(message, &signature).is_ok()
}
