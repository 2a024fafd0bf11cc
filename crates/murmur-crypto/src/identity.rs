//! Session identity: signing and key-exchange keypairs.
//!
//! Each chat session owns an Ed25519 signing keypair, used to sign the
//! canonical string of every outgoing envelope, and a separate X25519
//! keypair, used to agree on direct-message keys with peers found via
//! presence. Public keys travel as base64 of their raw 32-byte encodings.

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::channel_key::ChannelKey;
use crate::error::CryptoError;

/// Bytes of the SHA-256 digest shown in a fingerprint.
const FINGERPRINT_BYTES: usize = 8;

/// HKDF salt for direct-message key derivation.
const DM_HKDF_SALT: &[u8] = b"murmur-dm-hkdf-salt-v1";

/// HKDF info string for direct-message key derivation.
const DM_HKDF_INFO: &[u8] = b"murmur-dm-key-v1";

/// Length of a persisted identity file: signing seed followed by exchange secret.
const IDENTITY_FILE_LEN: usize = 64;

/// Public half of an identity, in the form announced via presence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeys {
    /// Ed25519 verifying key, base64.
    pub signing: String,
    /// X25519 public key, base64.
    pub exchange: String,
    /// Colon-hex fingerprint of the signing key.
    pub fingerprint: String,
}

/// A session's signing and key-exchange keypairs.
pub struct Identity {
    signing: SigningKey,
    exchange_secret: StaticSecret,
    exchange_public: PublicKey,
    fingerprint: String,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint)
            .field(
                "signing_public",
                &hex::encode(self.signing.verifying_key().as_bytes()),
            )
            .field("exchange_public", &hex::encode(self.exchange_public.as_bytes()))
            .field("secrets", &"[REDACTED]")
            .finish()
    }
}

impl Identity {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let exchange_secret = StaticSecret::random_from_rng(OsRng);
        Self::from_keys(signing, exchange_secret)
    }

    /// Reconstruct from raw 32-byte secrets.
    pub fn from_secret_bytes(signing_seed: &[u8], exchange: &[u8]) -> Result<Self, CryptoError> {
        let mut seed = to_array(signing_seed)?;
        let mut secret = to_array(exchange)?;
        let identity = Self::from_keys(SigningKey::from_bytes(&seed), StaticSecret::from(secret));
        seed.zeroize();
        secret.zeroize();
        Ok(identity)
    }

    fn from_keys(signing: SigningKey, exchange_secret: StaticSecret) -> Self {
        let exchange_public = PublicKey::from(&exchange_secret);
        let fingerprint = fingerprint_of(signing.verifying_key().as_bytes());
        Self {
            signing,
            exchange_secret,
            exchange_public,
            fingerprint,
        }
    }

    /// Colon-hex fingerprint of the signing public key.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Raw signing public key.
    pub fn signing_public_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Raw exchange public key.
    pub fn exchange_public_bytes(&self) -> [u8; 32] {
        *self.exchange_public.as_bytes()
    }

    /// Exported public keys for presence announcements and envelopes.
    pub fn public_keys(&self) -> PublicKeys {
        PublicKeys {
            signing: B64.encode(self.signing_public_bytes()),
            exchange: B64.encode(self.exchange_public_bytes()),
            fingerprint: self.fingerprint.clone(),
        }
    }

    /// Sign the UTF-8 bytes of `canonical`. Returns a base64 signature.
    pub fn sign(&self, canonical: &str) -> String {
        let signature: Signature = self.signing.sign(canonical.as_bytes());
        B64.encode(signature.to_bytes())
    }

    /// Agree on a symmetric key with the holder of `other_exchange_b64`.
    ///
    /// Both sides obtain the same key from each other's exchange public keys.
    pub fn derive_shared_key(&self, other_exchange_b64: &str) -> Result<ChannelKey, CryptoError> {
        let other = B64
            .decode(other_exchange_b64)
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        let other_public = PublicKey::from(to_array(&other)?);

        let shared = self.exchange_secret.diffie_hellman(&other_public);
        if !shared.was_contributory() {
            return Err(CryptoError::KeyAgreement(
                "peer exchange key is a low-order point".into(),
            ));
        }

        let hk = Hkdf::<Sha256>::new(Some(DM_HKDF_SALT), shared.as_bytes());
        let mut key = [0u8; 32];
        hk.expand(DM_HKDF_INFO, &mut key)
            .map_err(|e| CryptoError::KeyAgreement(e.to_string()))?;
        let channel_key = ChannelKey::from_bytes(&key);
        key.zeroize();
        Ok(channel_key)
    }

    /// Save both secrets to a file with restrictive permissions.
    pub fn save_to_file(&self, path: &Path) -> Result<(), CryptoError> {
        let dir = path
            .parent()
            .ok_or_else(|| CryptoError::KeyPath(path.to_path_buf()))?;
        std::fs::create_dir_all(dir)?;

        let mut bytes = [0u8; IDENTITY_FILE_LEN];
        bytes[..32].copy_from_slice(&self.signing.to_bytes());
        bytes[32..].copy_from_slice(&self.exchange_secret.to_bytes());
        let written = std::fs::write(path, bytes);
        bytes.zeroize();
        written?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// Load an identity saved by [`Identity::save_to_file`].
    ///
    /// On Unix, refuses files readable by anyone but the owner.
    pub fn load_from_file(path: &Path) -> Result<Self, CryptoError> {
        use std::io::Read;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(path)?.permissions().mode() & 0o777;
            if mode != 0o600 {
                return Err(CryptoError::KeyFilePermissions {
                    path: path.to_path_buf(),
                    mode,
                });
            }
        }

        let mut file = std::fs::File::open(path)?;
        let mut buf = [0u8; IDENTITY_FILE_LEN];
        file.read_exact(&mut buf)?;
        let result = Self::from_secret_bytes(&buf[..32], &buf[32..]);
        buf.zeroize();
        result
    }

    /// Load from file, or generate a new identity and save it.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            let identity = Self::generate();
            identity.save_to_file(path)?;
            Ok(identity)
        }
    }
}

/// Verify a base64 signature over `canonical` against a base64 Ed25519 key.
///
/// Any malformed input yields `false`.
pub fn verify_signature(canonical: &str, signature_b64: &str, public_key_b64: &str) -> bool {
    let Ok(key_bytes) = B64.decode(public_key_b64) else {
        return false;
    };
    let Ok(key_array) = to_array(&key_bytes) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_array) else {
        return false;
    };
    let Ok(sig_bytes) = B64.decode(signature_b64) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&sig_bytes) else {
        return false;
    };
    verifying_key.verify(canonical.as_bytes(), &signature).is_ok()
}

/// Colon-separated hex of the first bytes of SHA-256(`public_key`).
///
/// Short enough to compare by eye; not meant as a full-strength identifier.
pub fn fingerprint_of(public_key: &[u8]) -> String {
    let hash = Sha256::digest(public_key);
    hash[..FINGERPRINT_BYTES]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn to_array(bytes: &[u8]) -> Result<[u8; 32], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::KeyLength {
            expected: 32,
            actual: bytes.len(),
        })
}
