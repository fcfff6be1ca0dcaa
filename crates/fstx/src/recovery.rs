//! Startup reconciliation of journals left behind by earlier runs.
//!
//! Recovery runs once, from manager initialization, before any new
//! transaction begins. Each journal found on disk is dispatched by status:
//!
//! - **IN_PROGRESS** — the transaction never crossed the prepare barrier;
//!   its staging tree and journal are discarded and the base directory is
//!   not touched.
//! - **PREPARED** — the durability barrier was crossed; the operations are
//!   replayed exactly as commit execution applies them. An operation whose
//!   staging artifact is gone was (at least partially) applied before the
//!   crash and is skipped.
//! - **COMMITTED / ROLLED_BACK** — terminal; leftover metadata is
//!   garbage-collected.
//!
//! Per-transaction failures are swallowed and the scan continues: a
//! manager that refuses to start is worse than an incompletely cleaned
//! metadata directory.

use std::path::Path;

use tracing::{info, warn};

use crate::engine;
use crate::journal::{JournalStore, TxStatus};
use crate::staging::StagingArea;

/// Counters describing what a recovery pass found and did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RecoveryOutcome {
    /// IN_PROGRESS or unreadable records discarded without base mutation.
    pub(crate) discarded: u32,
    /// PREPARED records replayed onto the base directory.
    pub(crate) rolled_forward: u32,
    /// Terminal records whose metadata was garbage-collected.
    pub(crate) collected: u32,
}

/// Scans the journal directory and reconciles every record found.
pub(crate) async fn recover(
    base: &Path,
    staging_root: &Path,
    journal: &JournalStore,
) -> RecoveryOutcome {
    let mut outcome = RecoveryOutcome::default();

    let ids = match journal.list_ids().await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(error = %e, "unable to enumerate journals; skipping recovery");
            return outcome;
        }
    };

    for id in ids {
        let staging = StagingArea::new(staging_root, &id);
        let record = match journal.read(&id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(tx_id = %id, error = %e, "failed to load journal; discarding");
                None
            }
        };

        match record {
            None => {
                collect(journal, &staging, &id).await;
                outcome.discarded += 1;
            }
            Some(record) => match record.status {
                TxStatus::InProgress => {
                    collect(journal, &staging, &id).await;
                    outcome.discarded += 1;
                }
                TxStatus::Prepared => {
                    roll_forward(base, &staging, &record).await;
                    collect(journal, &staging, &id).await;
                    outcome.rolled_forward += 1;
                }
                TxStatus::Committed | TxStatus::RolledBack => {
                    collect(journal, &staging, &id).await;
                    outcome.collected += 1;
                }
            },
        }
    }

    if outcome != RecoveryOutcome::default() {
        info!(
            discarded = outcome.discarded,
            rolled_forward = outcome.rolled_forward,
            collected = outcome.collected,
            "recovery reconciled leftover transactions"
        );
    }
    outcome
}

/// Replays a PREPARED record's operations in insertion order.
async fn roll_forward(base: &Path, staging: &StagingArea, record: &crate::journal::JournalRecord) {
    if let Err(e) =
        engine::apply_ops(base, staging, &record.id, &record.operations, true).await
    {
        warn!(
            tx_id = %record.id,
            error = %e,
            "roll-forward failed partway; abandoning remainder of this transaction"
        );
    }
}

/// Deletes a transaction's journal and staging tree, best-effort.
async fn collect(journal: &JournalStore, staging: &StagingArea, id: &str) {
    if let Err(e) = journal.delete(id).await {
        warn!(tx_id = %id, error = %e, "failed to delete journal during recovery");
    }
    if let Err(e) = staging.destroy().await {
        warn!(tx_id = %id, error = %e, "failed to remove staging during recovery");
    }
}
