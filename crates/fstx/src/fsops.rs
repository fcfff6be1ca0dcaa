//! Shared filesystem primitives for staging, commit, and rollback.
//!
//! Everything here operates on absolute paths and suspends on every
//! filesystem call. The move primitive prefers an atomic same-filesystem
//! rename and falls back to copy-then-delete when the rename is refused
//! (cross-device moves, platform permission quirks).

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;

/// Creates the parent directory of `path`, including intermediates.
pub(crate) async fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Removes a file or directory tree. Absence is not an error.
pub(crate) async fn remove_path(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Copies a file or directory tree from `src` onto `dst`, creating parent
/// directories as needed.
///
/// An existing destination of the same kind is overwritten in place
/// (directories are merged entry by entry); a destination of the opposite
/// kind is removed first.
pub(crate) async fn copy_path(src: &Path, dst: &Path) -> io::Result<()> {
    let src_meta = fs::metadata(src).await?;
    ensure_parent_dir(dst).await?;

    if let Ok(dst_meta) = fs::symlink_metadata(dst).await {
        if dst_meta.is_dir() != src_meta.is_dir() {
            remove_path(dst).await?;
        }
    }

    if !src_meta.is_dir() {
        fs::copy(src, dst).await?;
        return Ok(());
    }

    // Iterative pre-order walk; recursion depth is caller data.
    let mut pending: Vec<(PathBuf, PathBuf)> = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        fs::create_dir_all(&to).await?;
        let mut entries = fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let child_type = entry.file_type().await?;
            let from_child = entry.path();
            let to_child = to.join(entry.file_name());
            if child_type.is_dir() {
                pending.push((from_child, to_child));
            } else {
                if let Ok(meta) = fs::symlink_metadata(&to_child).await {
                    if meta.is_dir() {
                        remove_path(&to_child).await?;
                    }
                }
                fs::copy(&from_child, &to_child).await?;
            }
        }
    }
    Ok(())
}

/// Moves `src` to `dst`, replacing whatever is at the destination.
///
/// Strategy: attempt `rename` directly (atomic overwrite of files on the
/// same filesystem). If that is refused, clear a conflicting destination
/// and retry once. If the rename still fails — cross-device moves and
/// EPERM-style refusals — degrade to copy-then-delete.
pub(crate) async fn move_path(src: &Path, dst: &Path) -> io::Result<()> {
    ensure_parent_dir(dst).await?;

    if fs::rename(src, dst).await.is_ok() {
        return Ok(());
    }

    if fs::try_exists(dst).await.unwrap_or(false) {
        remove_path(dst).await?;
        if fs::rename(src, dst).await.is_ok() {
            return Ok(());
        }
    }

    copy_path(src, dst).await?;
    remove_path(src).await
}

/// Flushes a directory's entries to stable storage, committing renames.
pub(crate) fn fsync_dir(dir: &Path) -> io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn remove_path_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        remove_path(&dir.path().join("missing")).await.unwrap();
    }

    #[tokio::test]
    async fn remove_path_deletes_files_and_trees() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        fs::write(&file, b"x").await.unwrap();
        remove_path(&file).await.unwrap();
        assert!(!file.exists());

        let tree = dir.path().join("tree");
        fs::create_dir_all(tree.join("inner")).await.unwrap();
        fs::write(tree.join("inner/f.txt"), b"x").await.unwrap();
        remove_path(&tree).await.unwrap();
        assert!(!tree.exists());
    }

    #[tokio::test]
    async fn copy_path_copies_nested_tree() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("a/b")).await.unwrap();
        fs::write(src.join("top.txt"), b"top").await.unwrap();
        fs::write(src.join("a/b/deep.txt"), b"deep").await.unwrap();

        let dst = dir.path().join("out/dst");
        copy_path(&src, &dst).await.unwrap();

        assert_eq!(fs::read(dst.join("top.txt")).await.unwrap(), b"top");
        assert_eq!(fs::read(dst.join("a/b/deep.txt")).await.unwrap(), b"deep");
        // Source is left intact.
        assert!(src.join("top.txt").exists());
    }

    #[tokio::test]
    async fn copy_path_replaces_conflicting_kind() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        fs::write(&src, b"file content").await.unwrap();

        let dst = dir.path().join("dst");
        fs::create_dir_all(dst.join("stale")).await.unwrap();

        copy_path(&src, &dst).await.unwrap();
        assert_eq!(fs::read(&dst).await.unwrap(), b"file content");
    }

    #[tokio::test]
    async fn move_path_overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst.txt");
        fs::write(&src, b"new").await.unwrap();
        fs::write(&dst, b"old").await.unwrap();

        move_path(&src, &dst).await.unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(&dst).await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn move_path_replaces_directory_destination() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).await.unwrap();
        fs::write(src.join("f.txt"), b"payload").await.unwrap();

        let dst = dir.path().join("dst");
        fs::create_dir_all(dst.join("old")).await.unwrap();

        move_path(&src, &dst).await.unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(dst.join("f.txt")).await.unwrap(), b"payload");
        assert!(!dst.join("old").exists());
    }

    #[tokio::test]
    async fn move_path_creates_destination_parents() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        fs::write(&src, b"x").await.unwrap();

        let dst = dir.path().join("deep/nested/dst.txt");
        move_path(&src, &dst).await.unwrap();
        assert_eq!(fs::read(&dst).await.unwrap(), b"x");
    }
}
