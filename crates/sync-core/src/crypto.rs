//! Vault encryption: key derivation, AES-256-GCM, and content/path hashing.
//!
//! Uses AES-256-GCM with:
//! - 256-bit key derived from the vault passphrase via scrypt
//! - 96-bit (12 byte) random IV per encryption
//! - 128-bit authentication tag, carried separately on the wire
//!
//! The relay only ever sees ciphertext, content hashes, and `hash_path`
//! outputs. Plaintext relative paths travel as sealed tokens (`seal_path`).

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use zeroize::Zeroize;

/// IV length for AES-256-GCM.
pub const IV_LEN: usize = 12;
/// Authentication tag length for AES-256-GCM.
pub const TAG_LEN: usize = 16;
/// Derived key length.
pub const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Tag verification failed: wrong key, or tampered ciphertext/IV/tag.
    #[error("Authentication failed: ciphertext or tag was tampered with, or the key is wrong")]
    AuthenticationFailed,

    #[error("Invalid {field} length: expected {expected}, got {got}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Encoding error: {0}")]
    Encoding(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// The symmetric key for a vault.
///
/// Never persisted and never sent to the relay. Zeroized on drop.
#[derive(Clone)]
pub struct VaultKey([u8; KEY_LEN]);

impl VaultKey {
    /// Create a key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VaultKey(<redacted>)")
    }
}

impl Drop for VaultKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// scrypt cost parameters.
///
/// Every device of a vault must use the same parameters, otherwise they
/// derive different keys from the same passphrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    /// log2 of the CPU/memory cost N (17 = 2^17)
    pub log_n: u8,
    /// Block size
    pub r: u32,
    /// Parallelism
    pub p: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        // 128 * r * N = 128 MiB of scratch memory
        Self {
            log_n: 17,
            r: 8,
            p: 1,
        }
    }
}

/// Derive the vault key from a passphrase with the default scrypt cost.
///
/// Deliberately slow. Async callers must run this on a blocking thread.
pub fn derive_key(passphrase: &str, vault_id: &str) -> Result<VaultKey> {
    derive_key_with(passphrase, vault_id, &KdfParams::default())
}

/// Derive the vault key with explicit scrypt parameters.
///
/// The salt is SHA-256 of the vault ID, so the same passphrase yields
/// unrelated keys for different vaults.
pub fn derive_key_with(passphrase: &str, vault_id: &str, params: &KdfParams) -> Result<VaultKey> {
    let salt = Sha256::digest(vault_id.as_bytes());
    let scrypt_params = scrypt::Params::new(params.log_n, params.r, params.p, KEY_LEN)
        .map_err(|e| CryptoError::KeyDerivation(format!("Invalid parameters: {}", e)))?;

    let mut key = [0u8; KEY_LEN];
    scrypt::scrypt(passphrase.as_bytes(), &salt, &scrypt_params, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    Ok(VaultKey(key))
}

/// Output of a single encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub iv: [u8; IV_LEN],
    pub tag: [u8; TAG_LEN],
    pub ciphertext: Vec<u8>,
}

/// Encrypt with AES-256-GCM under a fresh random IV.
///
/// Never reuse an IV with the same key; one is generated on every call.
pub fn encrypt(plaintext: &[u8], key: &VaultKey) -> Result<EncryptedPayload> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    // aes-gcm appends the tag to the ciphertext
    let mut sealed = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    if sealed.len() < TAG_LEN {
        return Err(CryptoError::Encryption("Ciphertext missing auth tag".into()));
    }

    let tag_start = sealed.len() - TAG_LEN;
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&sealed[tag_start..]);
    sealed.truncate(tag_start);

    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(nonce.as_slice());

    Ok(EncryptedPayload {
        iv,
        tag,
        ciphertext: sealed,
    })
}

/// Decrypt and verify AES-256-GCM ciphertext.
///
/// Fails with `AuthenticationFailed` if the tag doesn't verify; never returns
/// partial plaintext.
pub fn decrypt(ciphertext: &[u8], key: &VaultKey, iv: &[u8], tag: &[u8]) -> Result<Vec<u8>> {
    if iv.len() != IV_LEN {
        return Err(CryptoError::InvalidLength {
            field: "iv",
            expected: IV_LEN,
            got: iv.len(),
        });
    }
    if tag.len() != TAG_LEN {
        return Err(CryptoError::InvalidLength {
            field: "tag",
            expected: TAG_LEN,
            got: tag.len(),
        });
    }

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let nonce = Nonce::from_slice(iv);

    let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);

    cipher
        .decrypt(nonce, sealed.as_slice())
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// SHA-256 of file contents as lowercase hex.
pub fn hash_content(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// SHA-256 of a vault-relative path as lowercase hex.
///
/// This is the only form of a path the relay is allowed to index by.
pub fn hash_path(relative_path: &str) -> String {
    hex::encode(Sha256::digest(relative_path.as_bytes()))
}

/// Encrypt a relative path into an opaque base64 token (`iv || ciphertext || tag`).
pub fn seal_path(relative_path: &str, key: &VaultKey) -> Result<String> {
    let payload = encrypt(relative_path.as_bytes(), key)?;

    let mut token = Vec::with_capacity(IV_LEN + payload.ciphertext.len() + TAG_LEN);
    token.extend_from_slice(&payload.iv);
    token.extend_from_slice(&payload.ciphertext);
    token.extend_from_slice(&payload.tag);

    Ok(STANDARD.encode(token))
}

/// Recover a relative path from a token produced by [`seal_path`].
pub fn open_path(token: &str, key: &VaultKey) -> Result<String> {
    let raw = STANDARD
        .decode(token)
        .map_err(|e| CryptoError::Encoding(e.to_string()))?;

    if raw.len() < IV_LEN + TAG_LEN {
        return Err(CryptoError::InvalidLength {
            field: "path token",
            expected: IV_LEN + TAG_LEN,
            got: raw.len(),
        });
    }

    let (iv, rest) = raw.split_at(IV_LEN);
    let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);
    let plaintext = decrypt(ciphertext, key, iv, tag)?;

    String::from_utf8(plaintext).map_err(|e| CryptoError::Encoding(e.to_string()))
}
