//! Shared helpers for the integration suites.

#![allow(dead_code)]

use std::path::Path;

use fstx::{TxConfig, TxError, TxManager};

/// Builds and initializes a manager over `base` with default settings.
pub async fn manager(base: &Path) -> TxManager {
    let mgr = TxManager::new(TxConfig::new(base));
    mgr.initialize().await.expect("initialize manager");
    mgr
}

/// Reads a base-relative file as UTF-8, panicking on absence.
pub fn read(base: &Path, rel: &str) -> String {
    std::fs::read_to_string(base.join(rel))
        .unwrap_or_else(|e| panic!("read {rel}: {e}"))
}

/// Entry count of a metadata subdirectory, treating absence as empty.
pub fn metadata_entries(base: &Path, sub: &str) -> usize {
    match std::fs::read_dir(base.join(".tx").join(sub)) {
        Ok(reader) => reader.count(),
        Err(_) => 0,
    }
}

/// Scope error type for exercising rollback on caller failures.
#[derive(Debug, thiserror::Error)]
pub enum TestError {
    /// Propagated engine error.
    #[error("transaction error: {0}")]
    Tx(#[from] TxError),
    /// Deliberate scope failure.
    #[error("scope failure: {0}")]
    Boom(&'static str),
}
