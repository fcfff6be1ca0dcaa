//! Crash recovery behavior: journals planted on disk before the manager
//! initializes stand in for transactions interrupted by a process crash.

mod common;

use std::path::Path;

use common::{manager, metadata_entries, read};

/// Plants a journal record and optional staging files as a crashed
/// process would have left them.
fn plant_journal(base: &Path, id: &str, json: &str, staged: &[(&str, &str)]) {
    let journal_dir = base.join(".tx/journal");
    std::fs::create_dir_all(&journal_dir).unwrap();
    std::fs::write(journal_dir.join(format!("{id}.json")), json).unwrap();

    let staging = base.join(".tx/staging").join(id);
    for (rel, content) in staged {
        let path = staging.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
}

#[tokio::test]
async fn prepared_journal_rolls_forward_on_initialize() {
    let dir = tempfile::tempdir().unwrap();
    let id = "11111111111111111111111111111111";
    plant_journal(
        dir.path(),
        id,
        &format!(
            r#"{{
  "id": "{id}",
  "status": "PREPARED",
  "operations": [
    {{ "op": "MKDIR", "path": "out" }},
    {{ "op": "WRITE", "path": "out/result.txt" }}
  ],
  "snapshots": {{}}
}}"#
        ),
        &[("out/result.txt", "rolled forward")],
    );

    manager(dir.path()).await;

    assert_eq!(read(dir.path(), "out/result.txt"), "rolled forward");
    assert_eq!(metadata_entries(dir.path(), "journal"), 0);
    assert_eq!(metadata_entries(dir.path(), "staging"), 0);
}

#[tokio::test]
async fn in_progress_journal_is_discarded_without_base_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let id = "22222222222222222222222222222222";
    plant_journal(
        dir.path(),
        id,
        &format!(
            r#"{{
  "id": "{id}",
  "status": "IN_PROGRESS",
  "operations": [ {{ "op": "WRITE", "path": "new.txt" }} ],
  "snapshots": {{}}
}}"#
        ),
        &[("new.txt", "should never land")],
    );

    manager(dir.path()).await;

    assert!(!dir.path().join("new.txt").exists());
    assert_eq!(metadata_entries(dir.path(), "journal"), 0);
    assert_eq!(metadata_entries(dir.path(), "staging"), 0);
}

#[tokio::test]
async fn prepared_replay_overwrites_an_existing_target() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.txt"), "old").unwrap();
    let id = "33333333333333333333333333333333";
    plant_journal(
        dir.path(),
        id,
        &format!(
            r#"{{
  "id": "{id}",
  "status": "PREPARED",
  "operations": [ {{ "op": "WRITE", "path": "config.txt" }} ],
  "snapshots": {{}}
}}"#
        ),
        &[("config.txt", "new")],
    );

    manager(dir.path()).await;
    assert_eq!(read(dir.path(), "config.txt"), "new");
}

#[tokio::test]
async fn prepared_replay_skips_operations_whose_staging_is_gone() {
    let dir = tempfile::tempdir().unwrap();
    let id = "44444444444444444444444444444444";
    // Two writes journaled, but the crash happened after the first was
    // already applied and its staging artifact consumed.
    std::fs::write(dir.path().join("first.txt"), "applied before crash").unwrap();
    plant_journal(
        dir.path(),
        id,
        &format!(
            r#"{{
  "id": "{id}",
  "status": "PREPARED",
  "operations": [
    {{ "op": "WRITE", "path": "first.txt" }},
    {{ "op": "WRITE", "path": "second.txt" }}
  ],
  "snapshots": {{}}
}}"#
        ),
        &[("second.txt", "applied by recovery")],
    );

    manager(dir.path()).await;

    assert_eq!(read(dir.path(), "first.txt"), "applied before crash");
    assert_eq!(read(dir.path(), "second.txt"), "applied by recovery");
    assert_eq!(metadata_entries(dir.path(), "journal"), 0);
}

#[tokio::test]
async fn prepared_rename_and_rm_replay_like_commit() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("old-name.txt"), "body").unwrap();
    std::fs::write(dir.path().join("obsolete.txt"), "x").unwrap();
    let id = "55555555555555555555555555555555";
    plant_journal(
        dir.path(),
        id,
        &format!(
            r#"{{
  "id": "{id}",
  "status": "PREPARED",
  "operations": [
    {{ "op": "RENAME", "from": "old-name.txt", "to": "new-name.txt" }},
    {{ "op": "RM", "path": "obsolete.txt" }}
  ],
  "snapshots": {{}}
}}"#
        ),
        &[("new-name.txt", "body")],
    );

    manager(dir.path()).await;

    assert!(!dir.path().join("old-name.txt").exists());
    assert!(!dir.path().join("obsolete.txt").exists());
    assert_eq!(read(dir.path(), "new-name.txt"), "body");
}

#[tokio::test]
async fn corrupt_journal_is_cleaned_up_and_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let id = "66666666666666666666666666666666";
    plant_journal(dir.path(), id, "{ this is not json", &[("junk.txt", "x")]);

    manager(dir.path()).await;

    assert!(!dir.path().join("junk.txt").exists());
    assert_eq!(metadata_entries(dir.path(), "journal"), 0);
    assert_eq!(metadata_entries(dir.path(), "staging"), 0);
}

#[tokio::test]
async fn terminal_journals_are_garbage_collected() {
    let dir = tempfile::tempdir().unwrap();
    for (id, status) in [
        ("77777777777777777777777777777777", "COMMITTED"),
        ("88888888888888888888888888888888", "ROLLED_BACK"),
    ] {
        plant_journal(
            dir.path(),
            id,
            &format!(
                r#"{{
  "id": "{id}",
  "status": "{status}",
  "operations": [],
  "snapshots": {{}}
}}"#
            ),
            &[("leftover.txt", "x")],
        );
    }

    manager(dir.path()).await;

    assert_eq!(metadata_entries(dir.path(), "journal"), 0);
    assert_eq!(metadata_entries(dir.path(), "staging"), 0);
}

#[tokio::test]
async fn initialize_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path()).await;
    mgr.initialize().await.unwrap();
    mgr.initialize().await.unwrap();

    mgr.run(|tx| async move { tx.write("a.txt", b"x").await })
        .await
        .unwrap();
    assert_eq!(read(dir.path(), "a.txt"), "x");
}

#[tokio::test]
async fn recovery_does_not_disturb_unrelated_content() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("untouched.txt"), "keep").unwrap();
    let id = "99999999999999999999999999999999";
    plant_journal(
        dir.path(),
        id,
        &format!(
            r#"{{
  "id": "{id}",
  "status": "IN_PROGRESS",
  "operations": [],
  "snapshots": {{}}
}}"#
        ),
        &[],
    );

    manager(dir.path()).await;
    assert_eq!(read(dir.path(), "untouched.txt"), "keep");
}
