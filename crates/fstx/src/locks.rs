//! Path-keyed advisory locks backed by lockfiles.
//!
//! Every filesystem resource a transaction touches is serialized through a
//! sidecar lockfile `locks/<sha256(rel)>.lock` carrying a kernel advisory
//! lock. The digest makes the lockfile name filesystem-safe and
//! collision-resistant regardless of what the resource path contains, and
//! the kernel releases the lock when its holder dies, so stale owners
//! never wedge the base directory.
//!
//! Shared locks are mutually compatible; an exclusive lock conflicts with
//! everything. Acquisition polls at a fixed interval until the configured
//! timeout, then fails with a contention error naming the resource.
//!
//! The lockfile primitive anchors a lock to an existing resource, so a
//! request against a path that does not exist first materializes a
//! placeholder (an empty file when the path carries an extension, else an
//! empty directory). The placeholder path is reported back to the caller,
//! which records it for deletion on rollback.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::time::sleep;

use crate::error::TxError;
use crate::paths::rel_key;

/// Fixed interval between lock acquisition attempts.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lock compatibility mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockMode {
    /// Compatible with other shared holders.
    Shared,
    /// Conflicts with all other holders.
    Exclusive,
}

/// Acquires and releases advisory locks under a single locks directory.
#[derive(Debug, Clone)]
pub(crate) struct LockManager {
    base: PathBuf,
    locks_dir: PathBuf,
    timeout: Duration,
}

/// One held lock: the mode and the open lockfile carrying the kernel lock.
#[derive(Debug)]
struct HeldLock {
    mode: LockMode,
    file: std::fs::File,
}

/// The locks a single transaction currently holds, keyed by resource path.
///
/// Locks are held from first acquisition until end of transaction; an
/// operation that needs a resource this set already covers reuses the held
/// lock (upgrading shared to exclusive in place when required) instead of
/// deadlocking against itself.
#[derive(Debug, Default)]
pub(crate) struct LockSet {
    held: HashMap<String, HeldLock>,
}

impl LockSet {
    /// Releases every held lock. Idempotent; releasing a lock whose file
    /// was unlinked or stolen out from under us is treated as success.
    pub(crate) fn release_all(&mut self) {
        for (_, held) in self.held.drain() {
            let _ = fs2::FileExt::unlock(&held.file);
        }
    }
}

impl LockManager {
    pub(crate) fn new(base: PathBuf, locks_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            base,
            locks_dir,
            timeout,
        }
    }

    /// Acquires a lock on the base-relative resource `rel` for `set`.
    ///
    /// Returns the path of a placeholder that had to be materialized to
    /// anchor the lock, if any, so the caller can schedule it for deletion
    /// on rollback.
    ///
    /// # Errors
    ///
    /// [`TxError::LockTimeout`] when the resource stays contended past the
    /// configured timeout; [`TxError::Io`] for host filesystem failures.
    pub(crate) async fn acquire(
        &self,
        set: &mut LockSet,
        rel: &Path,
        mode: LockMode,
    ) -> Result<Option<PathBuf>, TxError> {
        let key = rel_key(rel);

        if let Some(held) = set.held.get_mut(&key) {
            if held.mode == LockMode::Exclusive || mode == LockMode::Shared {
                return Ok(None);
            }
            // Upgrade in place on the same descriptor.
            self.wait_for_lock(&held.file, LockMode::Exclusive, rel).await?;
            held.mode = LockMode::Exclusive;
            return Ok(None);
        }

        let target = self.base.join(rel);
        let placeholder = if path_exists(&target).await {
            None
        } else {
            Some(self.materialize_placeholder(&target).await?)
        };

        fs::create_dir_all(&self.locks_dir)
            .await
            .map_err(|e| TxError::io("create locks directory", e))?;
        let lock_path = self.locks_dir.join(format!("{}.lock", lock_digest(&key)));
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| TxError::io("open lockfile", e))?;

        self.wait_for_lock(&file, mode, rel).await?;
        set.held.insert(key, HeldLock { mode, file });
        Ok(placeholder)
    }

    /// Polls the advisory lock until acquired or the timeout elapses.
    async fn wait_for_lock(
        &self,
        file: &std::fs::File,
        mode: LockMode,
        resource: &Path,
    ) -> Result<(), TxError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let attempt = match mode {
                LockMode::Shared => fs2::FileExt::try_lock_shared(file),
                LockMode::Exclusive => fs2::FileExt::try_lock_exclusive(file),
            };
            match attempt {
                Ok(()) => return Ok(()),
                Err(e) if is_contended(&e) => {
                    if Instant::now() >= deadline {
                        return Err(TxError::LockTimeout {
                            resource: resource.to_path_buf(),
                            timeout_ms: self.timeout.as_millis() as u64,
                        });
                    }
                    sleep(LOCK_POLL_INTERVAL).await;
                }
                Err(e) => return Err(TxError::io("acquire advisory lock", e)),
            }
        }
    }

    /// Creates an empty file or directory at `target` purely to anchor a
    /// lock. An extension means file, anything else means directory.
    async fn materialize_placeholder(&self, target: &Path) -> Result<PathBuf, TxError> {
        if target.extension().is_some() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| TxError::io("create placeholder parent", e))?;
            }
            fs::write(target, b"")
                .await
                .map_err(|e| TxError::io("create placeholder file", e))?;
        } else {
            fs::create_dir_all(target)
                .await
                .map_err(|e| TxError::io("create placeholder directory", e))?;
        }
        Ok(target.to_path_buf())
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

async fn path_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

fn lock_digest(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}
