//! Errors raised while resolving Murmur settings.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A setting has a value the chat core cannot work with.
    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    #[error("Failed to read settings file {}: {source}", .path.display())]
    ReadSettings {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings file {}: {source}", .path.display())]
    ParseSettings {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
