//! Error types for the transaction engine.

use std::path::PathBuf;

/// Errors surfaced by transaction operations and the manager.
///
/// Variants carry the context a caller needs to act on the failure: the
/// offending path, the contended resource and its timeout, or the
/// transaction id of a fatal post-prepare inconsistency.
#[derive(Debug, thiserror::Error)]
pub enum TxError {
    /// A caller-supplied path resolves outside the base directory.
    #[error("path escapes the base directory: {}", path.display())]
    PathOutsideBase {
        /// The path as supplied by the caller.
        path: PathBuf,
    },

    /// The source of a rename, copy, or directory snapshot does not exist.
    #[error("source path does not exist: {}", path.display())]
    SourceMissing {
        /// Base-relative path of the missing source.
        path: PathBuf,
    },

    /// The target of a read does not exist in staging or the base directory.
    #[error("target path does not exist: {}", path.display())]
    TargetMissing {
        /// Base-relative path of the missing target.
        path: PathBuf,
    },

    /// Lock acquisition did not succeed within the configured timeout.
    #[error(
        "timed out after {timeout_ms} ms waiting for a lock on {}",
        resource.display()
    )]
    LockTimeout {
        /// Base-relative path of the contended resource.
        resource: PathBuf,
        /// The configured acquisition timeout in milliseconds.
        timeout_ms: u64,
    },

    /// A journaled operation references a staging artifact that is not on
    /// disk during commit execution.
    ///
    /// This is fatal: the transaction has crossed the prepare barrier and
    /// must be rolled forward by recovery, never rolled back.
    #[error(
        "staging artifact missing for transaction {tx_id}: {}",
        path.display()
    )]
    StagingMissing {
        /// Id of the affected transaction.
        tx_id: String,
        /// Absolute path of the missing staging artifact.
        path: PathBuf,
    },

    /// An operation was invoked on a handle whose transaction has already
    /// committed or rolled back.
    #[error("transaction is closed; the scope has already committed or rolled back")]
    TransactionClosed,

    /// `run` was called before `initialize`.
    #[error("transaction manager is not initialized; call initialize() first")]
    NotInitialized,

    /// Journal serialization failed.
    #[error("journal serialization failed: {0}")]
    SerializeFailed(#[source] serde_json::Error),

    /// An I/O error from the host filesystem, with the operation that
    /// triggered it.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Human-readable description of the operation that failed.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl TxError {
    /// Convenience constructor for I/O errors with context.
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
