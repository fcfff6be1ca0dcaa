//! The transaction manager: configuration, initialization, and scoped
//! execution with guaranteed commit-or-rollback.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use tokio::fs;
use tokio::sync::OnceCell;

use crate::engine;
use crate::error::TxError;
use crate::journal::JournalStore;
use crate::locks::LockManager;
use crate::paths::PathGuard;
use crate::recovery;
use crate::transaction::Transaction;

/// Default name of the metadata root under the base directory.
pub const DEFAULT_METADATA_DIR_NAME: &str = ".tx";

/// Default lock acquisition timeout.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const JOURNAL_DIR: &str = "journal";
const STAGING_DIR: &str = "staging";
const LOCKS_DIR: &str = "locks";

/// Configuration for a [`TxManager`].
#[derive(Debug, Clone)]
pub struct TxConfig {
    /// Root under which all caller paths resolve.
    pub base_directory: PathBuf,
    /// Name of the metadata directory created under the base.
    pub metadata_dir_name: String,
    /// How long lock acquisition may wait before failing.
    pub lock_timeout: Duration,
}

impl TxConfig {
    /// Configuration with the default metadata directory name and lock
    /// timeout.
    pub fn new(base_directory: impl Into<PathBuf>) -> Self {
        Self {
            base_directory: base_directory.into(),
            metadata_dir_name: DEFAULT_METADATA_DIR_NAME.to_string(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Overrides the metadata directory name.
    #[must_use]
    pub fn with_metadata_dir_name(mut self, name: impl Into<String>) -> Self {
        self.metadata_dir_name = name.into();
        self
    }

    /// Overrides the lock acquisition timeout.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }
}

/// Runs transactions against one base directory.
///
/// A manager must be initialized before use; initialization creates the
/// metadata layout and reconciles journals left behind by earlier runs.
/// Multiple managers — in this process or others — may serve the same
/// base directory concurrently; correctness rests on the path locks, not
/// on in-process coordination.
#[derive(Debug)]
pub struct TxManager {
    guard: PathGuard,
    meta_root: PathBuf,
    staging_root: PathBuf,
    journal: JournalStore,
    locks: LockManager,
    init: OnceCell<()>,
}

impl TxManager {
    /// Builds a manager from `config`. No filesystem access happens here;
    /// call [`TxManager::initialize`] before running transactions.
    #[must_use]
    pub fn new(config: TxConfig) -> Self {
        let meta_root = config.base_directory.join(&config.metadata_dir_name);
        let journal = JournalStore::new(meta_root.join(JOURNAL_DIR));
        let locks = LockManager::new(
            config.base_directory.clone(),
            meta_root.join(LOCKS_DIR),
            config.lock_timeout,
        );
        Self {
            guard: PathGuard::new(config.base_directory),
            staging_root: meta_root.join(STAGING_DIR),
            meta_root,
            journal,
            locks,
            init: OnceCell::new(),
        }
    }

    /// Creates the metadata layout and runs recovery. Idempotent: repeat
    /// calls (and losers of a concurrent race) return once the first
    /// initialization has completed.
    ///
    /// # Errors
    ///
    /// [`TxError::Io`] when the metadata directories cannot be created.
    pub async fn initialize(&self) -> Result<(), TxError> {
        self.init
            .get_or_try_init(|| async move {
                for dir in [
                    &self.meta_root,
                    &self.meta_root.join(JOURNAL_DIR),
                    &self.staging_root,
                    &self.meta_root.join(LOCKS_DIR),
                ] {
                    fs::create_dir_all(dir)
                        .await
                        .map_err(|e| TxError::io("create metadata directory", e))?;
                }
                recovery::recover(self.guard.base(), &self.staging_root, &self.journal).await;
                Ok(())
            })
            .await
            .copied()
    }

    /// Runs `scope` inside a fresh transaction.
    ///
    /// The scope receives a [`Transaction`] handle. If the scope future
    /// resolves `Ok`, the transaction commits and the value is returned;
    /// if it resolves `Err`, the transaction rolls back completely and the
    /// scope's error is returned unchanged. There is no third outcome.
    ///
    /// # Errors
    ///
    /// [`TxError::NotInitialized`] when called before
    /// [`TxManager::initialize`]; the scope's own error after rollback;
    /// or a commit failure (converted via `E: From<TxError>`).
    pub async fn run<T, E, F, Fut>(&self, scope: F) -> Result<T, E>
    where
        E: From<TxError>,
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.init.initialized() {
            return Err(E::from(TxError::NotInitialized));
        }

        let tx = engine::begin(
            self.guard.clone(),
            &self.staging_root,
            self.journal.clone(),
            self.locks.clone(),
        )
        .await
        .map_err(E::from)?;

        match scope(tx.clone()).await {
            Ok(value) => {
                engine::commit(&tx).await.map_err(E::from)?;
                Ok(value)
            }
            Err(scope_err) => {
                engine::rollback(&tx).await;
                Err(scope_err)
            }
        }
    }
}
