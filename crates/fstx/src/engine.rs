//! Transaction lifecycle: begin, two-phase commit, rollback, cleanup.
//!
//! # Commit protocol
//!
//! Phase 1 (prepare) durably rewrites the journal with status PREPARED.
//! That write is the point of no return: a crash before it leaves the base
//! directory untouched (recovery discards the transaction), a crash after
//! it leaves a record that recovery rolls forward to the committed state.
//!
//! Phase 2 (execute) applies the journaled operations to the base
//! directory in insertion order. A failure here is not recoverable
//! locally: the transaction is PREPARED, so the engine logs the failure,
//! surfaces it, and leaves the journal for the next recovery pass to
//! replay. It never rolls back from this path.
//!
//! Rollback restores snapshotted overwrite targets, deletes lock
//! placeholders, releases locks, and destroys the transaction's metadata.
//! It runs to completion no matter what; individual failures are logged
//! and skipped so the caller always gets the scope's original error back.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;
use tokio::time::sleep;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::TxError;
use crate::fsops;
use crate::journal::{JournalOp, JournalRecord, JournalStore, TxStatus};
use crate::locks::LockManager;
use crate::paths::PathGuard;
use crate::staging::StagingArea;
use crate::transaction::Transaction;

/// Attempts when probing for a staging artifact that should exist.
const STAGING_PROBE_ATTEMPTS: u32 = 3;

/// Delay between staging probes; absorbs antivirus and metadata
/// propagation artefacts on some host filesystems.
const STAGING_PROBE_DELAY: Duration = Duration::from_millis(50);

/// Creates a fresh transaction: staging directory on disk, IN_PROGRESS
/// journal record persisted, empty lock and temp-resource sets.
pub(crate) async fn begin(
    guard: PathGuard,
    staging_root: &Path,
    journal: JournalStore,
    locks: LockManager,
) -> Result<Transaction, TxError> {
    let id = Uuid::new_v4().simple().to_string();
    let staging = StagingArea::new(staging_root, &id);
    staging.create().await?;

    let record = JournalRecord::new(id.clone());
    if let Err(e) = journal.write(&record, false).await {
        // Don't leave an orphan staging tree behind a failed begin.
        let _ = staging.destroy().await;
        return Err(e);
    }

    debug!(tx_id = %id, "transaction begun");
    Ok(Transaction::new(id, guard, staging, journal, locks, record))
}

/// Commits the transaction: durable prepare, in-order execute, cleanup.
///
/// A prepare failure rolls the transaction back before returning the
/// error. An execute failure leaves the transaction PREPARED for recovery
/// and surfaces the error without rollback.
pub(crate) async fn commit(tx: &Transaction) -> Result<(), TxError> {
    {
        let mut state = tx.inner.state.lock().await;
        if state.closed {
            return Err(TxError::TransactionClosed);
        }
        state.record.status = TxStatus::Prepared;
        if let Err(e) = tx.inner.journal.write(&state.record, true).await {
            // The durability barrier was never crossed; the pre-commit
            // state is still the valid outcome.
            state.record.status = TxStatus::InProgress;
            drop(state);
            rollback(tx).await;
            return Err(e);
        }
    }

    let mut state = tx.inner.state.lock().await;
    let base = tx.inner.guard.base().to_path_buf();
    let operations = state.record.operations.clone();
    if let Err(e) = apply_ops(&base, &tx.inner.staging, &tx.inner.id, &operations, false).await {
        error!(
            tx_id = %tx.inner.id,
            error = %e,
            "commit execution failed; transaction stays prepared for recovery"
        );
        state.closed = true;
        return Err(e);
    }

    state.record.status = TxStatus::Committed;
    if let Err(e) = tx.inner.journal.write(&state.record, false).await {
        warn!(tx_id = %tx.inner.id, error = %e, "failed to record COMMITTED status");
    }

    if let Err(e) = tx.inner.journal.delete(&tx.inner.id).await {
        warn!(tx_id = %tx.inner.id, error = %e, "failed to delete journal after commit");
    }
    if let Err(e) = tx.inner.staging.destroy().await {
        warn!(tx_id = %tx.inner.id, error = %e, "failed to remove staging after commit");
    }
    state.lock_set.release_all();
    state.closed = true;
    debug!(tx_id = %tx.inner.id, "transaction committed");
    Ok(())
}

/// Rolls the transaction back. Never fails; every step is best-effort so
/// the caller's original error survives.
pub(crate) async fn rollback(tx: &Transaction) {
    let mut state = tx.inner.state.lock().await;
    if state.closed {
        return;
    }

    let base = tx.inner.guard.base().to_path_buf();
    for (key, snapshot) in &state.record.snapshots {
        if !fs::try_exists(snapshot).await.unwrap_or(false) {
            warn!(
                tx_id = %tx.inner.id,
                snapshot = %snapshot.display(),
                "snapshot missing on rollback; skipping"
            );
            continue;
        }
        let dest = base.join(Path::new(key));
        if let Err(e) = fsops::copy_path(snapshot, &dest).await {
            warn!(
                tx_id = %tx.inner.id,
                path = %dest.display(),
                error = %e,
                "failed to restore snapshot on rollback"
            );
        }
    }

    for resource in &state.temp_resources {
        if let Err(e) = fsops::remove_path(resource).await {
            warn!(
                tx_id = %tx.inner.id,
                path = %resource.display(),
                error = %e,
                "failed to remove lock placeholder on rollback"
            );
        }
    }

    state.lock_set.release_all();

    state.record.status = TxStatus::RolledBack;
    if let Err(e) = tx.inner.journal.write(&state.record, false).await {
        warn!(tx_id = %tx.inner.id, error = %e, "failed to record ROLLED_BACK status");
    }
    if let Err(e) = tx.inner.journal.delete(&tx.inner.id).await {
        warn!(tx_id = %tx.inner.id, error = %e, "failed to delete journal after rollback");
    }
    if let Err(e) = tx.inner.staging.destroy().await {
        warn!(tx_id = %tx.inner.id, error = %e, "failed to remove staging after rollback");
    }
    state.closed = true;
    debug!(tx_id = %tx.inner.id, "transaction rolled back");
}

/// Applies journaled operations to the base directory, in insertion order.
///
/// Used by commit execution and by recovery roll-forward. With
/// `skip_missing_staging`, an operation whose staging artifact is gone is
/// logged and skipped (a crash mid-execute may have consumed it already);
/// otherwise that condition is the fatal [`TxError::StagingMissing`].
///
/// A staging artifact that a later operation in the list still consumes
/// is copied out rather than moved, so sequences like a `WRITE` followed
/// by a `RENAME` onto the same destination replay without cannibalizing
/// each other's source. The last operation touching a destination wins.
pub(crate) async fn apply_ops(
    base: &Path,
    staging: &StagingArea,
    tx_id: &str,
    ops: &[JournalOp],
    skip_missing_staging: bool,
) -> Result<(), TxError> {
    for (idx, op) in ops.iter().enumerate() {
        let preserve = later_op_consumes(ops, idx);
        apply_one(base, staging, tx_id, op, preserve, skip_missing_staging).await?;
    }
    Ok(())
}

/// The staging artifact an operation consumes during execution, if any.
fn staged_target(op: &JournalOp) -> Option<&Path> {
    match op {
        JournalOp::Write { path } => Some(path),
        JournalOp::Rename { to, .. } | JournalOp::Cp { to, .. } => Some(to),
        JournalOp::Rm { .. } | JournalOp::Mkdir { .. } => None,
    }
}

/// True when an operation after `idx` consumes the same staging artifact.
fn later_op_consumes(ops: &[JournalOp], idx: usize) -> bool {
    let Some(rel) = staged_target(&ops[idx]) else {
        return false;
    };
    ops[idx + 1..]
        .iter()
        .any(|later| staged_target(later) == Some(rel))
}

async fn apply_one(
    base: &Path,
    staging: &StagingArea,
    tx_id: &str,
    op: &JournalOp,
    preserve_staging: bool,
    skip_missing_staging: bool,
) -> Result<(), TxError> {
    match op {
        JournalOp::Write { path } => {
            let Some(staged) = staged_source(staging, tx_id, path, skip_missing_staging).await?
            else {
                return Ok(());
            };
            let dest = base.join(path);
            place(&staged, &dest, preserve_staging)
                .await
                .map_err(|e| TxError::io(format!("apply WRITE {}", path.display()), e))
        }
        JournalOp::Rm { path } => {
            let dest = base.join(path);
            fsops::remove_path(&dest)
                .await
                .map_err(|e| TxError::io(format!("apply RM {}", path.display()), e))
        }
        JournalOp::Mkdir { path } => {
            let dest = base.join(path);
            fs::create_dir_all(&dest)
                .await
                .map_err(|e| TxError::io(format!("apply MKDIR {}", path.display()), e))
        }
        JournalOp::Rename { from, to } => {
            let Some(staged) = staged_source(staging, tx_id, to, skip_missing_staging).await?
            else {
                return Ok(());
            };
            let dest = base.join(to);
            place(&staged, &dest, preserve_staging)
                .await
                .map_err(|e| TxError::io(format!("apply RENAME to {}", to.display()), e))?;
            fsops::remove_path(&base.join(from))
                .await
                .map_err(|e| TxError::io(format!("apply RENAME from {}", from.display()), e))
        }
        JournalOp::Cp { to, .. } => {
            let Some(staged) = staged_source(staging, tx_id, to, skip_missing_staging).await?
            else {
                return Ok(());
            };
            let dest = base.join(to);
            // Copy, not move: staging stays intact until cleanup because
            // other staged artifacts under the same tree may still be
            // referenced.
            fsops::copy_path(&staged, &dest)
                .await
                .map_err(|e| TxError::io(format!("apply CP {}", to.display()), e))
        }
    }
}

/// Moves a staging artifact into place, or copies it when a later
/// operation still needs it.
async fn place(staged: &Path, dest: &Path, preserve_staging: bool) -> std::io::Result<()> {
    if preserve_staging {
        fsops::copy_path(staged, dest).await
    } else {
        fsops::move_path(staged, dest).await
    }
}

/// Resolves the staging artifact an operation consumes, probing a bounded
/// number of times before declaring it missing.
async fn staged_source(
    staging: &StagingArea,
    tx_id: &str,
    rel: &Path,
    skip_missing: bool,
) -> Result<Option<PathBuf>, TxError> {
    let staged = staging.path_for(rel);
    for attempt in 1..=STAGING_PROBE_ATTEMPTS {
        if fs::try_exists(&staged).await.unwrap_or(false) {
            return Ok(Some(staged));
        }
        if attempt < STAGING_PROBE_ATTEMPTS {
            sleep(STAGING_PROBE_DELAY).await;
        }
    }
    if skip_missing {
        warn!(
            tx_id = %tx_id,
            path = %staged.display(),
            "staging artifact missing during roll-forward; skipping operation"
        );
        return Ok(None);
    }
    Err(TxError::StagingMissing {
        tx_id: tx_id.to_string(),
        path: staged,
    })
}
