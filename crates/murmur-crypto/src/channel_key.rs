//! Symmetric channel keys.
//!
//! A channel key is derived from nothing but the channel id, so every holder
//! of the id ends up with the same key: the id is the shared secret. Direct
//! message keys come from [`crate::Identity::derive_shared_key`] and use the
//! same AEAD wrapper.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;

/// Application salt for channel key derivation. Changing it partitions the network.
const CHANNEL_KEY_SALT: &[u8] = b"murmur-livechat-salt-v1";

/// Default PBKDF2 iteration count.
pub const KDF_ROUNDS: u32 = 100_000;

/// Nonce size for ChaCha20-Poly1305.
pub const NONCE_SIZE: usize = 12;

/// Encrypted payload with metadata needed for decryption.
#[derive(Debug, Clone)]
pub struct EncryptedData {
    /// ChaCha20-Poly1305 ciphertext (includes 16-byte auth tag).
    pub ciphertext: Vec<u8>,
    /// 12-byte nonce used for this encryption.
    pub nonce: [u8; NONCE_SIZE],
}

impl EncryptedData {
    /// Base64 of the nonce, as carried in the envelope's `iv` field.
    pub fn iv_base64(&self) -> String {
        B64.encode(self.nonce)
    }

    /// Base64 of the ciphertext, as carried in the envelope's `ct` field.
    pub fn ciphertext_base64(&self) -> String {
        B64.encode(&self.ciphertext)
    }
}

/// An AEAD key bound to one channel (or one DM pair).
#[derive(Clone)]
pub struct ChannelKey {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelKey").field("key", &"[REDACTED]").finish()
    }
}

/// Derive the channel key for `channel_id` with the default round count.
pub fn derive_channel_key(channel_id: &str) -> ChannelKey {
    derive_channel_key_with_rounds(channel_id, KDF_ROUNDS)
}

/// Derive the channel key for `channel_id` with an explicit round count.
///
/// Deterministic: the same id and round count always give the same key.
pub fn derive_channel_key_with_rounds(channel_id: &str, rounds: u32) -> ChannelKey {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(channel_id.as_bytes(), CHANNEL_KEY_SALT, rounds, &mut key);
    let channel_key = ChannelKey::from_bytes(&key);
    key.zeroize();
    channel_key
}

impl ChannelKey {
    /// Wrap raw 32-byte key material.
    pub fn from_bytes(key_bytes: &[u8; 32]) -> Self {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key_bytes));
        Self { cipher }
    }

    /// Encrypt plaintext under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedData, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::Seal(e.to_string()))?;

        Ok(EncryptedData {
            ciphertext,
            nonce: nonce_bytes,
        })
    }

    /// Decrypt ciphertext using the provided nonce.
    pub fn decrypt(&self, ciphertext: &[u8], nonce_bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(CryptoError::NonceLength {
                expected: NONCE_SIZE,
                actual: nonce_bytes.len(),
            });
        }
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| CryptoError::Open(e.to_string()))
    }

    /// Decrypt base64 `iv`/`ct` wire fields into a UTF-8 string.
    pub fn decrypt_wire(&self, iv_b64: &str, ct_b64: &str) -> Result<String, CryptoError> {
        let nonce = B64
            .decode(iv_b64)
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        let ciphertext = B64
            .decode(ct_b64)
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        let plain = self.decrypt(&ciphertext, &nonce)?;
        String::from_utf8(plain).map_err(|e| CryptoError::Encoding(e.to_string()))
    }
}
