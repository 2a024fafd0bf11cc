//! Failures surfaced by the key, cipher and trust-store layers.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Could not seal message: {0}")]
    Seal(String),

    /// Wrong key, truncated ciphertext or tampered tag.
    #[error("Could not open message: {0}")]
    Open(String),

    #[error("Key must be {expected} bytes, got {actual}")]
    KeyLength { expected: usize, actual: usize },

    #[error("Nonce must be {expected} bytes, got {actual}")]
    NonceLength { expected: usize, actual: usize },

    #[error("Malformed input: {0}")]
    Encoding(String),

    #[error("Key agreement failed: {0}")]
    KeyAgreement(String),

    #[error("Key file {} has mode {mode:o}, expected 600", .path.display())]
    KeyFilePermissions { path: PathBuf, mode: u32 },

    #[error("Key path {} has no parent directory", .0.display())]
    KeyPath(PathBuf),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
