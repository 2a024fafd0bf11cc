//! Trust-on-first-use (TOFU) nickname store.
//!
//! Remembers which signing-key fingerprint a nickname used the first time it
//! was seen. Later messages under the same nickname are classified against
//! that record, so a key change stays visible on every message instead of
//! being silently re-learned.
//!
//! Records are keyed by nickname, not by key: two people sharing a nickname
//! share one record, and the second one shows up as a key change.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::error::CryptoError;

/// A stored fingerprint entry for a nickname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustEntry {
    pub nickname: String,
    /// Hex colon-separated fingerprint of the signing key first seen for this nickname.
    pub fingerprint: String,
    /// When this fingerprint was first seen (Unix timestamp, ms).
    pub first_seen: i64,
    /// When this fingerprint was last matched (Unix timestamp, ms).
    pub last_seen: i64,
}

/// Result of checking a nickname's fingerprint against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustStatus {
    /// First time seeing this nickname; a record was created.
    New,
    /// Fingerprint matches the stored record.
    Trusted,
    /// Fingerprint does NOT match. The stored record is left untouched.
    Changed { expected: String, actual: String },
}

/// Persistent nickname → fingerprint store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustStore {
    entries: HashMap<String, TrustEntry>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl TrustStore {
    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the store from a JSON file. Returns an empty store if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self, CryptoError> {
        let mut store: Self = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data)?
        } else {
            Self::default()
        };
        store.path = Some(path.to_path_buf());
        Ok(store)
    }

    /// Load the store, starting empty if the file is unreadable.
    ///
    /// The path is kept either way, so the next mutation rewrites the file.
    pub fn open(path: &Path) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "Trust store unreadable, starting empty");
            Self {
                entries: HashMap::new(),
                path: Some(path.to_path_buf()),
            }
        })
    }

    /// Save the store to its file. A no-op for in-memory stores.
    pub fn save(&self) -> Result<(), CryptoError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Check `fingerprint` for `nickname`, recording it on first sight.
    ///
    /// Uses constant-time comparison to prevent timing side-channel attacks.
    pub fn check(&mut self, nickname: &str, fingerprint: &str, now: i64) -> TrustStatus {
        let status = match self.entries.get_mut(nickname) {
            None => {
                self.entries.insert(
                    nickname.to_string(),
                    TrustEntry {
                        nickname: nickname.to_string(),
                        fingerprint: fingerprint.to_string(),
                        first_seen: now,
                        last_seen: now,
                    },
                );
                TrustStatus::New
            }
            Some(entry) if constant_time_str_eq(&entry.fingerprint, fingerprint) => {
                entry.last_seen = now;
                TrustStatus::Trusted
            }
            Some(entry) => {
                return TrustStatus::Changed {
                    expected: entry.fingerprint.clone(),
                    actual: fingerprint.to_string(),
                };
            }
        };
        self.persist();
        status
    }

    /// The fingerprint recorded for `nickname`, if any.
    pub fn fingerprint(&self, nickname: &str) -> Option<&str> {
        self.entries.get(nickname).map(|e| e.fingerprint.as_str())
    }

    /// All known entries, sorted by nickname.
    pub fn entries(&self) -> Vec<&TrustEntry> {
        let mut entries: Vec<_> = self.entries.values().collect();
        entries.sort_by(|a, b| a.nickname.cmp(&b.nickname));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Save after a mutation. Failure is logged and swallowed: the in-memory
    /// state stays authoritative for the rest of the session.
    fn persist(&self) {
        if let Err(e) = self.save() {
            warn!(error = %e, "Failed to persist trust store");
        }
    }
}

fn constant_time_str_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}
