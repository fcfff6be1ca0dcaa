//! The transaction handle and its operation semantics.
//!
//! Every operation follows the same shape: confine the caller path, take
//! the locks the operation needs, check preconditions against the
//! transaction-aware view of the tree, mutate the staging area, and append
//! to the journal. Nothing touches the base directory until commit; locks
//! are held from first acquisition to end of transaction.
//!
//! # Transaction-aware existence
//!
//! Whether a path "exists" inside an open transaction is decided by the
//! journal first, the staging tree second, and the base directory last:
//!
//! 1. journaled `RM` of the path → nonexistent
//! 2. journaled `RENAME` away from the path → nonexistent
//! 3. journaled `RENAME` onto the path → exists
//! 4. journaled `WRITE`/`CP`/`MKDIR` of the path → exists
//! 5. otherwise staging presence, then base presence
//!
//! # Isolation
//!
//! Read-committed only. A competing writer blocks on the path lock until
//! this transaction commits or rolls back, then observes its effect. Two
//! processes that both append to a file before either commits serialize
//! on the exclusive lock but the committed result is the last writer's
//! payload, not a concatenation.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tokio::sync::Mutex;

use crate::error::TxError;
use crate::journal::{JournalOp, JournalRecord, JournalStore};
use crate::locks::{LockManager, LockMode, LockSet};
use crate::paths::{rel_key, PathGuard};
use crate::staging::StagingArea;

/// Handle to an open transaction.
///
/// The handle is cheap to clone and safe to move into the scope future.
/// Operations take `&self`; internal state is serialized on a transaction
/// mutex, so a single transaction's operations execute one at a time while
/// distinct transactions interleave freely at suspension points.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub(crate) inner: Arc<TxInner>,
}

#[derive(Debug)]
pub(crate) struct TxInner {
    pub(crate) id: String,
    pub(crate) guard: PathGuard,
    pub(crate) staging: StagingArea,
    pub(crate) journal: JournalStore,
    pub(crate) locks: LockManager,
    pub(crate) state: Mutex<TxState>,
}

#[derive(Debug)]
pub(crate) struct TxState {
    pub(crate) record: JournalRecord,
    pub(crate) lock_set: LockSet,
    pub(crate) temp_resources: Vec<PathBuf>,
    pub(crate) closed: bool,
}

impl Transaction {
    pub(crate) fn new(
        id: String,
        guard: PathGuard,
        staging: StagingArea,
        journal: JournalStore,
        locks: LockManager,
        record: JournalRecord,
    ) -> Self {
        Self {
            inner: Arc::new(TxInner {
                id,
                guard,
                staging,
                journal,
                locks,
                state: Mutex::new(TxState {
                    record,
                    lock_set: LockSet::default(),
                    temp_resources: Vec::new(),
                    closed: false,
                }),
            }),
        }
    }

    /// The transaction's textual id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Stages `data` as the new content of `path`.
    ///
    /// The staged content replaces the base file at commit. Repeated
    /// writes to the same path overwrite the staged content; the journal
    /// keeps a single `WRITE` entry per path.
    ///
    /// # Errors
    ///
    /// [`TxError::PathOutsideBase`], [`TxError::LockTimeout`], or an I/O
    /// failure staging the content.
    pub async fn write(
        &self,
        path: impl AsRef<Path>,
        data: impl AsRef<[u8]>,
    ) -> Result<(), TxError> {
        let rel = self.inner.guard.resolve(path.as_ref())?;
        let mut state = self.inner.state.lock().await;
        ensure_open(&state)?;

        let lock_rel = if path_exists(&self.inner.guard.absolute(&rel)).await {
            rel.clone()
        } else {
            parent_of(&rel)
        };
        self.acquire(&mut state, &lock_rel, LockMode::Exclusive).await?;

        self.stage_bytes(&rel, data.as_ref()).await?;
        self.journal_write_entry(&mut state, rel).await
    }

    /// Appends `data` to the transaction's view of `path`.
    ///
    /// The current content is the staged content if present, else the base
    /// content, else empty. Journaled as a `WRITE`: across transactions
    /// the committed result is read-committed, last-writer-wins.
    ///
    /// # Errors
    ///
    /// Same surface as [`Transaction::write`].
    pub async fn append(
        &self,
        path: impl AsRef<Path>,
        data: impl AsRef<[u8]>,
    ) -> Result<(), TxError> {
        let rel = self.inner.guard.resolve(path.as_ref())?;
        let mut state = self.inner.state.lock().await;
        ensure_open(&state)?;

        self.acquire(&mut state, &rel, LockMode::Exclusive).await?;

        let staged = self.inner.staging.path_for(&rel);
        let base = self.inner.guard.absolute(&rel);
        let mut content = if path_exists(&staged).await {
            fs::read(&staged)
                .await
                .map_err(|e| TxError::io("read staged content", e))?
        } else if path_exists(&base).await {
            fs::read(&base)
                .await
                .map_err(|e| TxError::io("read base content", e))?
        } else {
            Vec::new()
        };
        content.extend_from_slice(data.as_ref());

        self.stage_bytes(&rel, &content).await?;
        self.journal_write_entry(&mut state, rel).await
    }

    /// Reads the transaction's view of `path`: staged content if present,
    /// else the base content.
    ///
    /// Earlier `RM`/`RENAME` journal entries do not hide a staged file
    /// here; a read inside the transaction sees its own uncommitted state.
    ///
    /// # Errors
    ///
    /// [`TxError::TargetMissing`] when the path exists in neither staging
    /// nor the base directory.
    pub async fn read(&self, path: impl AsRef<Path>) -> Result<Vec<u8>, TxError> {
        let rel = self.inner.guard.resolve(path.as_ref())?;
        let mut state = self.inner.state.lock().await;
        ensure_open(&state)?;

        let staged = self.inner.staging.path_for(&rel);
        let base = self.inner.guard.absolute(&rel);
        if !path_exists(&staged).await && !path_exists(&base).await {
            return Err(TxError::TargetMissing { path: rel });
        }

        self.acquire(&mut state, &rel, LockMode::Shared).await?;

        let source = if path_exists(&staged).await { staged } else { base };
        match fs::read(&source).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(TxError::TargetMissing { path: rel })
            }
            Err(e) => Err(TxError::io("read content", e)),
        }
    }

    /// Schedules `path` for removal at commit.
    ///
    /// The base directory is untouched until then; removing the same path
    /// twice within a transaction is a no-op. At commit the removal is
    /// forced — absence is not an error.
    ///
    /// # Errors
    ///
    /// An `InvalidInput` I/O error when `path` is a directory and
    /// `recursive` is false.
    pub async fn remove(&self, path: impl AsRef<Path>, recursive: bool) -> Result<(), TxError> {
        let rel = self.inner.guard.resolve(path.as_ref())?;
        let mut state = self.inner.state.lock().await;
        ensure_open(&state)?;

        self.acquire(&mut state, &parent_of(&rel), LockMode::Exclusive)
            .await?;

        if !recursive && self.view_is_directory(&rel).await {
            return Err(TxError::io(
                format!("remove {}", rel.display()),
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "path is a directory; pass recursive to remove it",
                ),
            ));
        }

        let entry = JournalOp::Rm { path: rel };
        if !state.record.operations.contains(&entry) {
            state.record.operations.push(entry);
            self.persist_journal(&state).await?;
        }
        Ok(())
    }

    /// Stages a directory at `path`, created in the base tree at commit.
    ///
    /// The `recursive` flag is passed through to the staging mkdir, so a
    /// non-recursive call requires the staged parent to exist. Repeating
    /// the call for the same path is a no-op.
    ///
    /// # Errors
    ///
    /// [`TxError::Io`] when the staging mkdir fails.
    pub async fn mkdir(&self, path: impl AsRef<Path>, recursive: bool) -> Result<(), TxError> {
        let rel = self.inner.guard.resolve(path.as_ref())?;
        let mut state = self.inner.state.lock().await;
        ensure_open(&state)?;

        self.acquire(&mut state, &parent_of(&rel), LockMode::Exclusive)
            .await?;

        let staged = self.inner.staging.path_for(&rel);
        let created = if recursive {
            fs::create_dir_all(&staged).await
        } else {
            fs::create_dir(&staged).await
        };
        match created {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(TxError::io("create staged directory", e)),
        }

        let entry = JournalOp::Mkdir { path: rel };
        if !state.record.operations.contains(&entry) {
            state.record.operations.push(entry);
            self.persist_journal(&state).await?;
        }
        Ok(())
    }

    /// True when `path` exists in the transaction's view of the tree.
    ///
    /// Pure computation over the journal, staging, and base; acquires no
    /// locks.
    pub async fn exists(&self, path: impl AsRef<Path>) -> Result<bool, TxError> {
        let rel = self.inner.guard.resolve(path.as_ref())?;
        let state = self.inner.state.lock().await;
        ensure_open(&state)?;
        Ok(self.view_exists(&state, &rel).await)
    }

    /// Moves `old` to `new` at commit, overwriting an existing `new`.
    ///
    /// When the destination exists, its pre-transaction base content is
    /// snapshotted first so rollback can restore it. Parent directories of
    /// both endpoints are locked exclusively, in sorted path order.
    ///
    /// # Errors
    ///
    /// [`TxError::SourceMissing`] when `old` does not exist in the
    /// transaction's view.
    pub async fn rename(
        &self,
        old: impl AsRef<Path>,
        new: impl AsRef<Path>,
    ) -> Result<(), TxError> {
        let old_rel = self.inner.guard.resolve(old.as_ref())?;
        let new_rel = self.inner.guard.resolve(new.as_ref())?;
        if old_rel == new_rel {
            return Ok(());
        }

        let mut state = self.inner.state.lock().await;
        ensure_open(&state)?;

        if !self.view_exists(&state, &old_rel).await {
            return Err(TxError::SourceMissing { path: old_rel });
        }

        let mut lock_targets = vec![parent_of(&old_rel), parent_of(&new_rel)];
        lock_targets.sort();
        lock_targets.dedup();
        for target in &lock_targets {
            self.acquire(&mut state, target, LockMode::Exclusive).await?;
        }

        if self.view_exists(&state, &new_rel).await {
            self.snapshot_overwrite_target(&mut state, &new_rel).await?;
        }

        let staged_old = self.inner.staging.path_for(&old_rel);
        let source = if path_exists(&staged_old).await {
            staged_old
        } else {
            self.inner.guard.absolute(&old_rel)
        };
        crate::fsops::copy_path(&source, &self.inner.staging.path_for(&new_rel))
            .await
            .map_err(|e| TxError::io("stage rename content", e))?;

        state.record.operations.push(JournalOp::Rename {
            from: old_rel,
            to: new_rel,
        });
        self.persist_journal(&state).await
    }

    /// Copies `src` to `dst` at commit, leaving `src` intact.
    ///
    /// The staged form of `src` is preferred over its base form, so a copy
    /// after a write in the same transaction observes the write. An
    /// existing destination is snapshotted as in [`Transaction::rename`].
    ///
    /// # Errors
    ///
    /// [`TxError::SourceMissing`] when `src` does not exist in the
    /// transaction's view; an `InvalidInput` I/O error when `src` is a
    /// directory and `recursive` is false.
    pub async fn copy(
        &self,
        src: impl AsRef<Path>,
        dst: impl AsRef<Path>,
        recursive: bool,
    ) -> Result<(), TxError> {
        let src_rel = self.inner.guard.resolve(src.as_ref())?;
        let dst_rel = self.inner.guard.resolve(dst.as_ref())?;
        if src_rel == dst_rel {
            return Ok(());
        }

        let mut state = self.inner.state.lock().await;
        ensure_open(&state)?;

        if !self.view_exists(&state, &src_rel).await {
            return Err(TxError::SourceMissing { path: src_rel });
        }

        let mut lock_targets = vec![
            (src_rel.clone(), LockMode::Shared),
            (parent_of(&dst_rel), LockMode::Exclusive),
        ];
        lock_targets.sort_by(|a, b| a.0.cmp(&b.0));
        if lock_targets[0].0 == lock_targets[1].0 {
            lock_targets.truncate(1);
            lock_targets[0].1 = LockMode::Exclusive;
        }
        for (target, mode) in &lock_targets {
            self.acquire(&mut state, target, *mode).await?;
        }

        if !recursive && self.view_is_directory(&src_rel).await {
            return Err(TxError::io(
                format!("copy {}", src_rel.display()),
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "source is a directory; pass recursive to copy it",
                ),
            ));
        }

        if self.view_exists(&state, &dst_rel).await {
            self.snapshot_overwrite_target(&mut state, &dst_rel).await?;
        }

        let staged_src = self.inner.staging.path_for(&src_rel);
        let source = if path_exists(&staged_src).await {
            staged_src
        } else {
            self.inner.guard.absolute(&src_rel)
        };
        crate::fsops::copy_path(&source, &self.inner.staging.path_for(&dst_rel))
            .await
            .map_err(|e| TxError::io("stage copy content", e))?;

        state.record.operations.push(JournalOp::Cp {
            from: src_rel,
            to: dst_rel,
        });
        self.persist_journal(&state).await
    }

    /// Records a rollback checkpoint of an existing base directory.
    ///
    /// The directory is copied into the snapshot tree and restored on
    /// rollback even though the transaction records no operation against
    /// it. Intended for callers mutating a directory through channels the
    /// journal cannot see.
    ///
    /// # Errors
    ///
    /// [`TxError::SourceMissing`] when `path` is not an existing base
    /// directory.
    pub async fn snapshot_dir(&self, path: impl AsRef<Path>) -> Result<(), TxError> {
        let rel = self.inner.guard.resolve(path.as_ref())?;
        let mut state = self.inner.state.lock().await;
        ensure_open(&state)?;

        let base = self.inner.guard.absolute(&rel);
        let is_dir = fs::metadata(&base)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(TxError::SourceMissing { path: rel });
        }

        self.acquire(&mut state, &rel, LockMode::Shared).await?;

        let snapshot = self.inner.staging.snapshot_path_for(&rel);
        crate::fsops::copy_path(&base, &snapshot)
            .await
            .map_err(|e| TxError::io("snapshot directory", e))?;
        state.record.snapshots.insert(rel_key(&rel), snapshot);
        self.persist_journal(&state).await
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    /// Acquires a lock, recording any placeholder the lock manager had to
    /// materialize so rollback can delete it.
    async fn acquire(
        &self,
        state: &mut TxState,
        rel: &Path,
        mode: LockMode,
    ) -> Result<(), TxError> {
        let placeholder = self
            .inner
            .locks
            .acquire(&mut state.lock_set, rel, mode)
            .await?;
        if let Some(path) = placeholder {
            state.temp_resources.push(path);
        }
        Ok(())
    }

    async fn stage_bytes(&self, rel: &Path, data: &[u8]) -> Result<(), TxError> {
        let staged = self.inner.staging.path_for(rel);
        crate::fsops::ensure_parent_dir(&staged)
            .await
            .map_err(|e| TxError::io("create staging parents", e))?;
        fs::write(&staged, data)
            .await
            .map_err(|e| TxError::io("stage content", e))
    }

    /// Appends a `WRITE` entry unless one already covers the path; the
    /// staged content is the latest either way.
    async fn journal_write_entry(
        &self,
        state: &mut TxState,
        rel: PathBuf,
    ) -> Result<(), TxError> {
        let entry = JournalOp::Write { path: rel };
        if !state.record.operations.contains(&entry) {
            state.record.operations.push(entry);
            self.persist_journal(state).await?;
        }
        Ok(())
    }

    /// Backs up the pre-transaction base content of an overwrite target.
    ///
    /// Only base content is snapshotted; a destination that exists purely
    /// inside the transaction has nothing to restore on rollback.
    async fn snapshot_overwrite_target(
        &self,
        state: &mut TxState,
        rel: &Path,
    ) -> Result<(), TxError> {
        let base = self.inner.guard.absolute(rel);
        if !path_exists(&base).await {
            return Ok(());
        }
        let snapshot = self.inner.staging.snapshot_path_for(rel);
        crate::fsops::copy_path(&base, &snapshot)
            .await
            .map_err(|e| TxError::io("snapshot overwrite target", e))?;
        state.record.snapshots.insert(rel_key(rel), snapshot);
        Ok(())
    }

    async fn persist_journal(&self, state: &TxState) -> Result<(), TxError> {
        self.inner.journal.write(&state.record, false).await
    }

    /// Transaction-aware existence; rule order is significant.
    pub(crate) async fn view_exists(&self, state: &TxState, rel: &Path) -> bool {
        let ops = &state.record.operations;
        if ops
            .iter()
            .any(|op| matches!(op, JournalOp::Rm { path } if path == rel))
        {
            return false;
        }
        if ops
            .iter()
            .any(|op| matches!(op, JournalOp::Rename { from, .. } if from == rel))
        {
            return false;
        }
        if ops
            .iter()
            .any(|op| matches!(op, JournalOp::Rename { to, .. } if to == rel))
        {
            return true;
        }
        if ops.iter().any(|op| match op {
            JournalOp::Write { path } | JournalOp::Mkdir { path } => path == rel,
            JournalOp::Cp { to, .. } => to == rel,
            _ => false,
        }) {
            return true;
        }
        if path_exists(&self.inner.staging.path_for(rel)).await {
            return true;
        }
        path_exists(&self.inner.guard.absolute(rel)).await
    }

    /// Whether the transaction's view of `rel` is a directory, consulting
    /// staging before the base tree.
    async fn view_is_directory(&self, rel: &Path) -> bool {
        for candidate in [
            self.inner.staging.path_for(rel),
            self.inner.guard.absolute(rel),
        ] {
            if let Ok(meta) = fs::metadata(&candidate).await {
                return meta.is_dir();
            }
        }
        false
    }
}

fn ensure_open(state: &TxState) -> Result<(), TxError> {
    if state.closed {
        return Err(TxError::TransactionClosed);
    }
    Ok(())
}

fn parent_of(rel: &Path) -> PathBuf {
    rel.parent().map(Path::to_path_buf).unwrap_or_default()
}

async fn path_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}
