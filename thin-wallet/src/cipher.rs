//! Cipher Engine
//!
//! Protects the account credential at rest:
//! - SHA-256 password fingerprint (or Argon2id) for the 32-byte key
//! - HMAC-SHA256 tag over the plaintext, prepended before encryption
//! - AES-256-CTR under a fresh random IV, emitted as `IV || ciphertext`
//!
//! The algorithm choices are carried as tagged parameters
//! ([`EncryptionScheme`]) next to the sealed blob, so records written with
//! another scheme keep opening through the same interface.

use aes::Aes256;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::CryptoError;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// AES block-sized initialization vector
pub const IV_LEN: usize = 16;

/// HMAC-SHA256 output length
pub const TAG_LEN: usize = 32;

/// Symmetric key length for every supported suite
pub const KEY_LEN: usize = 32;

/// ChaCha20-Poly1305 nonce length
const CHACHA_NONCE_LEN: usize = 12;

/// Argon2 parameters (tuned for security vs. usability)
const ARGON2_MEMORY_KIB: u32 = 65536; // 64 MB
const ARGON2_ITERATIONS: u32 = 3;
const ARGON2_PARALLELISM: u32 = 4;
const ARGON2_SALT_LEN: usize = 16;

/// A derived symmetric key, zeroed on drop.
pub type CipherKey = Zeroizing<[u8; KEY_LEN]>;

/// SHA-256 fingerprint of a password, used directly as the cipher key.
pub fn password_fingerprint(password: &str) -> CipherKey {
    let digest = Sha256::digest(password.as_bytes());
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&digest);
    key
}

/// Tag, then encrypt `tag || plaintext` with AES-256-CTR.
///
/// A fresh IV is drawn from the OS RNG on every call.
pub fn encrypt_and_sign(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let tag = compute_tag(key, plaintext)?;

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let mut blob = Vec::with_capacity(IV_LEN + TAG_LEN + plaintext.len());
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&tag);
    blob.extend_from_slice(plaintext);

    let mut cipher = Aes256Ctr::new_from_slices(key, &iv).map_err(|_| CryptoError)?;
    cipher.apply_keystream(&mut blob[IV_LEN..]);

    Ok(blob)
}

/// Decrypt a blob produced by [`encrypt_and_sign`] and check its tag.
///
/// The decrypted buffer never leaves this function unless the tag matches.
pub fn decrypt_and_verify(blob: &[u8], key: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if blob.len() < IV_LEN + TAG_LEN {
        return Err(CryptoError);
    }
    let (iv, ciphertext) = blob.split_at(IV_LEN);

    let mut cipher = Aes256Ctr::new_from_slices(key, iv).map_err(|_| CryptoError)?;
    let mut composite = Zeroizing::new(ciphertext.to_vec());
    cipher.apply_keystream(&mut composite);

    let (stored_tag, plaintext) = composite.split_at(TAG_LEN);
    let expected_tag = compute_tag(key, plaintext)?;

    if bool::from(expected_tag.as_slice().ct_eq(stored_tag)) {
        Ok(Zeroizing::new(plaintext.to_vec()))
    } else {
        Err(CryptoError)
    }
}

fn compute_tag(key: &[u8], data: &[u8]) -> Result<[u8; TAG_LEN], CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError);
    }
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| CryptoError)?;
    mac.update(data);

    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    Ok(tag)
}

/// A symmetric construction that seals and opens byte payloads.
pub trait SealingCipher: Send + Sync {
    /// Seal `plaintext` under `key`.
    fn seal(&self, plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Open a sealed blob, failing closed on any tampering.
    fn open(&self, blob: &[u8], key: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError>;
}

struct AesCtrHmac;

impl SealingCipher for AesCtrHmac {
    fn seal(&self, plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        encrypt_and_sign(plaintext, key)
    }

    fn open(&self, blob: &[u8], key: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        decrypt_and_verify(blob, key)
    }
}

struct ChaChaPoly;

impl SealingCipher for ChaChaPoly {
    fn seal(&self, plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = <ChaCha20Poly1305 as KeyInit>::new_from_slice(key).map_err(|_| CryptoError)?;

        let mut nonce_bytes = [0u8; CHACHA_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CryptoError)?;

        let mut blob = Vec::with_capacity(CHACHA_NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn open(&self, blob: &[u8], key: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if blob.len() < CHACHA_NONCE_LEN {
            return Err(CryptoError);
        }
        let (nonce_bytes, ciphertext) = blob.split_at(CHACHA_NONCE_LEN);
        let cipher = <ChaCha20Poly1305 as KeyInit>::new_from_slice(key).map_err(|_| CryptoError)?;
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| CryptoError)
    }
}

/// Symmetric cipher suite identifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CipherSuite {
    /// AES-256-CTR over `HMAC-SHA256(plaintext) || plaintext`
    #[default]
    Aes256CtrHmacSha256,
    /// ChaCha20-Poly1305 AEAD with a random 12-byte nonce
    #[serde(rename = "chacha20_poly1305")]
    ChaCha20Poly1305,
}

impl CipherSuite {
    /// The implementation registered for this suite.
    pub fn engine(&self) -> &'static dyn SealingCipher {
        match self {
            CipherSuite::Aes256CtrHmacSha256 => &AesCtrHmac,
            CipherSuite::ChaCha20Poly1305 => &ChaChaPoly,
        }
    }
}

/// Password-to-key derivation parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum KdfParams {
    /// Plain SHA-256 fingerprint of the password
    #[default]
    Sha256,
    /// Argon2id with a per-record salt (hex encoded)
    Argon2id {
        salt: String,
        memory_kib: u32,
        iterations: u32,
        parallelism: u32,
    },
}

impl KdfParams {
    /// Argon2id with default costs and a fresh random salt.
    pub fn argon2id() -> Self {
        Self::argon2id_with(ARGON2_MEMORY_KIB, ARGON2_ITERATIONS, ARGON2_PARALLELISM)
    }

    /// Argon2id with explicit costs and a fresh random salt.
    pub fn argon2id_with(memory_kib: u32, iterations: u32, parallelism: u32) -> Self {
        let mut salt = [0u8; ARGON2_SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        Self::Argon2id {
            salt: hex::encode(salt),
            memory_kib,
            iterations,
            parallelism,
        }
    }

    /// Derive the symmetric key for `password`.
    pub fn derive_key(&self, password: &str) -> Result<CipherKey, CryptoError> {
        match self {
            KdfParams::Sha256 => Ok(password_fingerprint(password)),
            KdfParams::Argon2id {
                salt,
                memory_kib,
                iterations,
                parallelism,
            } => {
                let salt = hex::decode(salt).map_err(|_| CryptoError)?;
                let params =
                    argon2::Params::new(*memory_kib, *iterations, *parallelism, Some(KEY_LEN))
                        .map_err(|_| CryptoError)?;
                let argon2 =
                    argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

                let mut key = Zeroizing::new([0u8; KEY_LEN]);
                argon2
                    .hash_password_into(password.as_bytes(), &salt, &mut key[..])
                    .map_err(|_| CryptoError)?;
                Ok(key)
            }
        }
    }

    /// Same algorithm and costs, fresh salt. Used when re-sealing.
    pub fn renewed(&self) -> Self {
        match self {
            KdfParams::Sha256 => KdfParams::Sha256,
            KdfParams::Argon2id {
                memory_kib,
                iterations,
                parallelism,
                ..
            } => Self::argon2id_with(*memory_kib, *iterations, *parallelism),
        }
    }
}

/// A complete password-based sealing scheme
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionScheme {
    #[serde(default)]
    pub kdf: KdfParams,
    #[serde(default)]
    pub cipher: CipherSuite,
}

impl EncryptionScheme {
    pub fn new(kdf: KdfParams, cipher: CipherSuite) -> Self {
        Self { kdf, cipher }
    }

    /// Same algorithms, fresh KDF salt.
    pub fn renewed(&self) -> Self {
        Self::new(self.kdf.renewed(), self.cipher)
    }

    /// Seal `plaintext` under a key derived from `password`.
    pub fn seal(&self, plaintext: &[u8], password: &str) -> Result<Vec<u8>, CryptoError> {
        let key = self.kdf.derive_key(password)?;
        self.cipher.engine().seal(plaintext, &key[..])
    }

    /// Open a blob sealed with [`EncryptionScheme::seal`].
    pub fn open(&self, blob: &[u8], password: &str) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let key = self.kdf.derive_key(password)?;
        self.cipher.engine().open(blob, &key[..])
    }
}
