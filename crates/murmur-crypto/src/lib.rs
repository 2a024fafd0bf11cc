//! Murmur E2E Encryption Library
//!
//! Provides the cryptographic primitives behind Murmur's encrypted chat
//! channels. The relay transport only ever sees ciphertext and public keys.
//!
//! ## Crypto primitives
//!
//! - **Channel keys**: PBKDF2-HMAC-SHA256 over the channel id (fixed salt), so
//!   anyone who knows the id derives the same key
//! - **Encryption**: ChaCha20-Poly1305 AEAD, fresh random 12-byte nonce per message
//! - **Identity**: Ed25519 signing keypair + X25519 exchange keypair per session
//! - **Direct messages**: X25519 ECDH → HKDF-SHA256 → channel key
//! - **Trust**: nickname → fingerprint trust-on-first-use store

pub mod channel_key;
pub mod error;
pub mod identity;
pub mod trust_store;

pub use channel_key::{
    ChannelKey, EncryptedData, KDF_ROUNDS, NONCE_SIZE, derive_channel_key,
    derive_channel_key_with_rounds,
};
pub use error::CryptoError;
pub use identity::{Identity, PublicKeys, fingerprint_of, verify_signature};
pub use trust_store::{TrustEntry, TrustStatus, TrustStore};
