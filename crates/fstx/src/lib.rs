//! # fstx
//!
//! ACID transactions over a region of a host filesystem.
//!
//! A caller opens a transaction against a base directory, performs file
//! and directory mutations through a handle, and on scope exit the whole
//! batch either commits atomically or rolls back. Committed changes
//! survive process crashes; uncommitted changes leave the base directory
//! byte-identical to its pre-transaction state after recovery.
//!
//! # How it works
//!
//! ```text
//! begin ──> operations (staged + journaled) ──> PREPARED ──> execute ──> cleanup
//!                 │                       (durable barrier)
//!                 └──> rollback (restore snapshots, drop staging)
//! ```
//!
//! - Uncommitted writes land in a per-transaction **staging** tree under
//!   the metadata root, never in the base directory.
//! - Every operation appends to a per-transaction **journal**; the durable
//!   PREPARED write is the point of no return. Crashes before it roll
//!   back, crashes after it roll forward on the next initialization.
//! - Conflicting writers serialize on path-keyed advisory **locks** held
//!   to end of transaction (read-committed isolation).
//! - **Recovery** runs once at manager initialization and reconciles any
//!   journal left behind by a crashed process.
//!
//! # Example
//!
//! ```rust,no_run
//! use fstx::{TxConfig, TxError, TxManager};
//!
//! # async fn demo() -> Result<(), TxError> {
//! let manager = TxManager::new(TxConfig::new("/srv/app-data"));
//! manager.initialize().await?;
//!
//! manager
//!     .run(|tx| async move {
//!         tx.mkdir("reports", true).await?;
//!         tx.write("reports/latest.json", b"{\"ok\":true}").await?;
//!         tx.rename("reports/latest.json", "reports/current.json").await?;
//!         Ok::<_, TxError>(())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Scope
//!
//! Single-host filesystems only. No cross-filesystem atomic moves, no
//! snapshot or serializable isolation, and no undo of committed
//! transactions. Extended attributes, ACLs, and symbolic links are not
//! preserved across commit.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod journal;
pub mod manager;
pub mod transaction;

mod engine;
mod fsops;
mod locks;
mod paths;
mod recovery;
mod staging;

pub use error::TxError;
pub use journal::{JournalOp, JournalRecord, TxStatus};
pub use manager::{TxConfig, TxManager, DEFAULT_LOCK_TIMEOUT, DEFAULT_METADATA_DIR_NAME};
pub use transaction::Transaction;
