//! Durable per-transaction journal records.
//!
//! The journal file is the single source of truth for a transaction's
//! intended effect. Each transaction owns one record persisted as
//! `journal/<id>.json`, a human-readable JSON object with four fields:
//! `id`, `status`, `operations`, and `snapshots`.
//!
//! # Durability
//!
//! Writes come in two flavors. The durable path — used for the prepare
//! barrier — follows the temp-file + fsync + rename + directory-fsync
//! protocol, so a crash at any point leaves either the old complete record
//! or the new complete record, never a torn one. The non-durable path is a
//! plain async write; a record torn by a crash there belonged to an
//! IN_PROGRESS transaction and is discarded by recovery anyway.
//!
//! # Corruption
//!
//! A record that cannot be parsed (or that exceeds the size cap) is treated
//! as absent and logged; recovery must never be blocked by a single damaged
//! file. Transient permission errors from the host filesystem are retried
//! with exponential backoff before being raised.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tracing::warn;

use crate::error::TxError;
use crate::fsops;

/// Maximum size accepted for a journal record on read.
///
/// Anything larger is treated as corrupt; a damaged or adversarial file
/// must not exhaust memory during recovery.
const MAX_JOURNAL_SIZE: u64 = 16 * 1024 * 1024;

/// Attempts for transient permission errors, including the first.
const IO_RETRY_ATTEMPTS: u32 = 4;

/// Base delay for the exponential backoff between retries.
const IO_RETRY_BASE_DELAY: Duration = Duration::from_millis(20);

/// Journal file extension.
const JOURNAL_EXT: &str = "json";

/// Lifecycle status of a transaction, as persisted in its journal.
///
/// The PREPARED barrier is the durability pivot: a crash before it rolls
/// the transaction back, a crash after it rolls the transaction forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    /// Begun but not yet past the prepare barrier.
    InProgress,
    /// Durably recorded; the committed state is now the only valid outcome.
    Prepared,
    /// All operations applied to the base directory.
    Committed,
    /// Rolled back; the base directory is unchanged.
    RolledBack,
}

/// A single journaled operation, applied to the base directory at commit.
///
/// All paths are base-relative and normalized. Operations are applied in
/// insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JournalOp {
    /// Staged content at `staging/<id>/<path>` replaces `<base>/<path>`.
    Write {
        /// Target path.
        path: PathBuf,
    },
    /// `<base>/<path>` exists as a directory after commit.
    Mkdir {
        /// Target path.
        path: PathBuf,
    },
    /// `<base>/<path>` does not exist after commit.
    Rm {
        /// Target path.
        path: PathBuf,
    },
    /// Staged content at `staging/<id>/<to>` becomes `<base>/<to>`;
    /// `<base>/<from>` is deleted.
    Rename {
        /// Source path.
        from: PathBuf,
        /// Destination path.
        to: PathBuf,
    },
    /// Staged content at `staging/<id>/<to>` becomes `<base>/<to>`;
    /// `<base>/<from>` is left intact.
    Cp {
        /// Source path.
        from: PathBuf,
        /// Destination path.
        to: PathBuf,
    },
}

/// The persisted record of one transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JournalRecord {
    /// Transaction id: 128 random bits, hex-encoded, filename-safe.
    pub id: String,
    /// Lifecycle status.
    pub status: TxStatus,
    /// Ordered, append-only operation list.
    pub operations: Vec<JournalOp>,
    /// Overwrite-target relative path → snapshot location under
    /// `staging/<id>/_snapshots/`.
    pub snapshots: BTreeMap<String, PathBuf>,
}

impl JournalRecord {
    /// A fresh IN_PROGRESS record with no operations and no snapshots.
    #[must_use]
    pub fn new(id: String) -> Self {
        Self {
            id,
            status: TxStatus::InProgress,
            operations: Vec::new(),
            snapshots: BTreeMap::new(),
        }
    }
}

/// Reads, writes, lists, and deletes journal records keyed by id.
#[derive(Debug, Clone)]
pub(crate) struct JournalStore {
    dir: PathBuf,
}

impl JournalStore {
    pub(crate) fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{JOURNAL_EXT}"))
    }

    /// Persists `record`, creating the journal directory if needed.
    ///
    /// With `durable` set, the content is forced to stable storage before
    /// this returns; otherwise a regular write is used.
    pub(crate) async fn write(
        &self,
        record: &JournalRecord,
        durable: bool,
    ) -> Result<(), TxError> {
        let bytes = serde_json::to_vec_pretty(record).map_err(TxError::SerializeFailed)?;
        let path = self.path_for(&record.id);

        retry_transient("write journal record", || {
            let store = self.clone();
            let id = record.id.clone();
            let path = path.clone();
            let bytes = bytes.clone();
            async move {
                fs::create_dir_all(&store.dir).await?;
                if durable {
                    store.write_durable(&path, &id, &bytes).await
                } else {
                    fs::write(&path, &bytes).await
                }
            }
        })
        .await
    }

    /// Temp file in the journal directory, fsync, atomic rename, then
    /// fsync of the directory entry.
    async fn write_durable(&self, path: &Path, id: &str, bytes: &[u8]) -> io::Result<()> {
        let tmp = self.dir.join(format!(".{id}.{JOURNAL_EXT}.tmp"));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await?;
        fsops::fsync_dir(&self.dir)
    }

    /// Loads the record for `id`.
    ///
    /// Returns `Ok(None)` when the file does not exist, and also — with a
    /// warning — when it is oversized or unparsable, so that a single
    /// corrupt record cannot block recovery.
    pub(crate) async fn read(&self, id: &str) -> Result<Option<JournalRecord>, TxError> {
        let path = self.path_for(id);

        let metadata = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TxError::io("stat journal record", e)),
        };
        if metadata.len() > MAX_JOURNAL_SIZE {
            warn!(
                tx_id = %id,
                size = metadata.len(),
                max = MAX_JOURNAL_SIZE,
                "journal record exceeds size cap; treating as corrupt"
            );
            return Ok(None);
        }

        let read_path = path.clone();
        let bytes = match retry_transient("read journal record", move || {
            let path = read_path.clone();
            async move { fs::read(&path).await }
        })
        .await
        {
            Ok(bytes) => bytes,
            Err(TxError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match serde_json::from_slice(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(
                    tx_id = %id,
                    error = %e,
                    "journal record unparsable; treating as absent"
                );
                Ok(None)
            }
        }
    }

    /// Enumerates the ids of all journal records on disk.
    pub(crate) async fn list_ids(&self) -> Result<Vec<String>, TxError> {
        let mut reader = match fs::read_dir(&self.dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(TxError::io("list journal directory", e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| TxError::io("list journal directory", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(JOURNAL_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                if !stem.starts_with('.') {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Deletes the record for `id`. Absence is not an error.
    pub(crate) async fn delete(&self, id: &str) -> Result<(), TxError> {
        let path = self.path_for(id);
        match retry_transient("delete journal record", move || {
            let path = path.clone();
            async move { fs::remove_file(&path).await }
        })
        .await
        {
            Ok(()) => Ok(()),
            Err(TxError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Runs `op`, retrying transient permission failures with exponential
/// backoff. Antivirus scanners and slow metadata propagation surface as
/// short-lived `PermissionDenied` on some host filesystems.
async fn retry_transient<T, F, Fut>(context: &str, mut op: F) -> Result<T, TxError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = io::Result<T>>,
{
    let mut delay = IO_RETRY_BASE_DELAY;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied && attempt < IO_RETRY_ATTEMPTS =>
            {
                warn!(
                    context,
                    attempt,
                    error = %e,
                    "transient permission error; retrying"
                );
                sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(TxError::io(context, e)),
        }
    }
}
