//! Error types for hivechat

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a single memo could not be turned into plaintext.
///
/// Decrypt failures are local to one message: they are stored on the cached
/// record and never abort the batch the message arrived in.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecryptFailure {
    /// Checksum validation failed; recoverable by re-keying
    #[error("Memo was encrypted for a different key")]
    WrongKey,

    /// The payload could not be parsed; permanent
    #[error("Malformed memo payload: {0}")]
    MalformedPayload(String),

    /// The external signer is not present or did not answer; retryable
    #[error("Key holder unavailable")]
    KeyHolderUnavailable,
}

impl DecryptFailure {
    /// Whether a later retry can succeed without user intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DecryptFailure::KeyHolderUnavailable)
    }
}

/// Main error type for hivechat operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// The ledger RPC could not be reached; the caller decides retry policy
    #[error("Ledger provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The ledger returned an operation we could not decode
    #[error("Invalid ledger operation: {0}")]
    InvalidOperation(String),

    /// Memo decryption or encryption failed
    #[error("Memo codec error: {0}")]
    Decrypt(#[from] DecryptFailure),

    /// Invalid amount string (expected "0.001 HBD")
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Invalid or inconsistent configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Group was not found in the local directory
    #[error("Group not found: {0}")]
    GroupNotFound(String),

    /// Live stream or engine was cancelled
    #[error("Sync cancelled")]
    Cancelled,

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::ProviderUnavailable(_) => true,
            SyncError::Decrypt(failure) => failure.is_retryable(),
            _ => false,
        }
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;
