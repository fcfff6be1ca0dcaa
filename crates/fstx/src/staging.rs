//! Per-transaction staging trees.
//!
//! A transaction mirrors every caller-relative path it writes into
//! `staging/<id>/`, and keeps pre-transaction backups of overwrite targets
//! under the reserved `staging/<id>/_snapshots/` subtree. The whole tree
//! is destroyed by cleanup on both commit and rollback; only the owning
//! transaction ever reads or writes it.

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::error::TxError;
use crate::fsops;

/// Reserved child of a staging tree holding snapshot backups.
pub(crate) const SNAPSHOT_DIR: &str = "_snapshots";

/// One transaction's scratch directory under the metadata root.
#[derive(Debug, Clone)]
pub(crate) struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub(crate) fn new(staging_root: &Path, tx_id: &str) -> Self {
        Self {
            root: staging_root.join(tx_id),
        }
    }

    /// Staged location of a base-relative path.
    pub(crate) fn path_for(&self, rel: &Path) -> PathBuf {
        self.root.join(rel)
    }

    /// Snapshot location of a base-relative overwrite target.
    pub(crate) fn snapshot_path_for(&self, rel: &Path) -> PathBuf {
        self.root.join(SNAPSHOT_DIR).join(rel)
    }

    pub(crate) async fn create(&self) -> Result<(), TxError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| TxError::io("create staging directory", e))
    }

    /// Removes the whole staging tree. Absence is not an error.
    pub(crate) async fn destroy(&self) -> Result<(), TxError> {
        fsops::remove_path(&self.root)
            .await
            .map_err(|e| TxError::io("remove staging directory", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn paths_mirror_the_relative_layout() {
        let staging = StagingArea::new(Path::new("/meta/staging"), "abc123");
        assert_eq!(
            staging.path_for(Path::new("a/b.txt")),
            PathBuf::from("/meta/staging/abc123/a/b.txt")
        );
        assert_eq!(
            staging.snapshot_path_for(Path::new("a/b.txt")),
            PathBuf::from("/meta/staging/abc123/_snapshots/a/b.txt")
        );
    }

    #[tokio::test]
    async fn create_and_destroy_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(dir.path(), "tx1");
        staging.create().await.unwrap();
        assert!(dir.path().join("tx1").is_dir());

        fs::write(staging.path_for(Path::new("f.txt")), b"x")
            .await
            .unwrap();
        staging.destroy().await.unwrap();
        assert!(!dir.path().join("tx1").exists());

        // Destroying an already-destroyed tree is fine.
        staging.destroy().await.unwrap();
    }
}
