// ── Kernel Atoms: Error Types ───────────────────────────────────────────────
// Single canonical error enum for the kernel, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (I/O, DB, Crypto, Config…).
//   • The `#[from]` attribute wires std/external error conversions.
//   • No variant carries secret material (plaintext values, summaries,
//     key bytes, nonces, AAD) in its message. Crypto failures name the
//     key id or the operation, never the data.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum KernelError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// SQLite / rusqlite failure in the record store.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Envelope authentication failure, unsupported scheme, or missing key.
    /// The message identifies the key id / operation, never the content.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// FTS or vector backend failure.
    #[error("Index error: {0}")]
    Index(String),

    /// Embedding provider failure.
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Operation refused by the parking brake for the named scope.
    #[error("Brake engaged for scope '{0}'")]
    BrakeEngaged(String),

    /// Kernel configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Other(String),
}

impl KernelError {
    /// Create a crypto error without exposing plaintext or key material.
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto(message.into())
    }

    /// Create an index-backend error.
    pub fn index(message: impl Into<String>) -> Self {
        Self::Index(message.into())
    }
}

impl From<String> for KernelError {
    fn from(s: String) -> Self {
        KernelError::Other(s)
    }
}

impl From<&str> for KernelError {
    fn from(s: &str) -> Self {
        KernelError::Other(s.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All kernel operations return this type.
pub type KernelResult<T> = Result<T, KernelError>;
