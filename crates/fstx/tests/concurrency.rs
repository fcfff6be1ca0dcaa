//! Concurrent transactions from one process: interleaving, lock
//! serialization, and contention timeouts.

mod common;

use std::time::Duration;

use fstx::{TxConfig, TxError, TxManager};
use tokio::sync::oneshot;

use common::{manager, read};

#[tokio::test]
async fn concurrent_transactions_on_distinct_files_both_commit() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path()).await;

    let (a, b) = tokio::join!(
        mgr.run(|tx| async move { tx.write("a.txt", b"alpha").await }),
        mgr.run(|tx| async move { tx.write("b.txt", b"beta").await }),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(read(dir.path(), "a.txt"), "alpha");
    assert_eq!(read(dir.path(), "b.txt"), "beta");
}

#[tokio::test]
async fn conflicting_writers_serialize_and_the_last_committer_wins() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path()).await;

    // The first transaction takes its lock, signals, then lingers long
    // enough for the second to block on the same resource; the second can
    // only proceed once the first has committed and released.
    let (started_tx, started_rx) = oneshot::channel::<()>();

    let first = mgr.run(|tx| async move {
        tx.write("c.txt", b"first committer").await?;
        let _ = started_tx.send(());
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok::<_, TxError>(())
    });
    let second = async {
        started_rx.await.unwrap();
        mgr.run(|tx| async move { tx.write("c.txt", b"second committer").await })
            .await
    };

    let (a, b) = tokio::join!(first, second);
    a.unwrap();
    b.unwrap();

    assert_eq!(read(dir.path(), "c.txt"), "second committer");
}

#[tokio::test]
async fn blocked_reader_observes_the_committed_value() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("shared.txt"), "before").unwrap();
    let mgr = manager(dir.path()).await;

    let (started_tx, started_rx) = oneshot::channel::<()>();

    let writer = mgr.run(|tx| async move {
        tx.write("shared.txt", b"after").await?;
        let _ = started_tx.send(());
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok::<_, TxError>(())
    });
    let reader = async {
        started_rx.await.unwrap();
        mgr.run(|tx| async move { tx.read("shared.txt").await }).await
    };

    let (w, r) = tokio::join!(writer, reader);
    w.unwrap();
    // Read-committed: the reader blocked on the exclusive lock and then
    // saw the writer's committed content.
    assert_eq!(r.unwrap(), b"after");
}

#[tokio::test]
async fn lock_contention_times_out_with_the_resource_named() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("hot.txt"), "x").unwrap();

    let patient = manager(dir.path()).await;
    let impatient = TxManager::new(
        TxConfig::new(dir.path()).with_lock_timeout(Duration::from_millis(300)),
    );
    impatient.initialize().await.unwrap();

    let result: Result<(), TxError> = patient
        .run(|tx| async move {
            tx.write("hot.txt", b"held").await?;

            let inner: Result<(), TxError> = impatient
                .run(|tx2| async move { tx2.write("hot.txt", b"contender").await })
                .await;
            match inner {
                Err(TxError::LockTimeout {
                    resource,
                    timeout_ms,
                }) => {
                    assert_eq!(resource.to_string_lossy(), "hot.txt");
                    assert_eq!(timeout_ms, 300);
                }
                other => panic!("expected LockTimeout, got: {other:?}"),
            }
            Ok(())
        })
        .await;
    result.unwrap();

    // The loser rolled back; the winner's content committed.
    assert_eq!(read(dir.path(), "hot.txt"), "held");
}

#[tokio::test]
async fn shared_readers_do_not_block_each_other() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("doc.txt"), "content").unwrap();

    let mgr = TxManager::new(
        TxConfig::new(dir.path()).with_lock_timeout(Duration::from_millis(500)),
    );
    mgr.initialize().await.unwrap();

    // Both scopes hold their shared lock while the other reads; with a
    // 500 ms timeout this only passes if shared locks are compatible.
    let (ready_a, wait_a) = oneshot::channel::<()>();
    let (ready_b, wait_b) = oneshot::channel::<()>();

    let first = mgr.run(|tx| async move {
        let content = tx.read("doc.txt").await?;
        let _ = ready_a.send(());
        let _ = wait_b.await;
        Ok::<_, TxError>(content)
    });
    let second = mgr.run(|tx| async move {
        let _ = wait_a.await;
        let content = tx.read("doc.txt").await?;
        let _ = ready_b.send(());
        Ok::<_, TxError>(content)
    });

    let (a, b) = tokio::join!(first, second);
    assert_eq!(a.unwrap(), b"content");
    assert_eq!(b.unwrap(), b"content");
}
