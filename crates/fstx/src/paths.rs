//! Path confinement for caller-supplied paths.
//!
//! Every path that enters a transaction handle is interpreted relative to
//! the base directory and must resolve inside it. The guard normalizes the
//! path lexically (no filesystem access, the target may not exist yet) and
//! rejects anything rooted or escaping upward. Null bytes, control
//! characters, and reserved device names are not filtered here; the OS
//! rejects them at the actual I/O call.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use crate::error::TxError;

/// Normalizes caller paths and confines them to a base directory.
#[derive(Debug, Clone)]
pub(crate) struct PathGuard {
    base: PathBuf,
}

impl PathGuard {
    pub(crate) fn new(base: PathBuf) -> Self {
        Self { base }
    }

    /// The base directory all relative paths resolve under.
    pub(crate) fn base(&self) -> &Path {
        &self.base
    }

    /// Joins a normalized base-relative path back onto the base directory.
    pub(crate) fn absolute(&self, rel: &Path) -> PathBuf {
        self.base.join(rel)
    }

    /// Resolves a caller-supplied path to its normalized base-relative form.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::PathOutsideBase`] when the path is rooted (leading
    /// separator, drive letter, or UNC prefix) or when resolving its
    /// parent-directory segments would climb above the base directory.
    pub(crate) fn resolve(&self, raw: &Path) -> Result<PathBuf, TxError> {
        if is_rooted(raw) {
            return Err(TxError::PathOutsideBase {
                path: raw.to_path_buf(),
            });
        }

        let mut segments: Vec<OsString> = Vec::new();
        for component in raw.components() {
            match component {
                Component::Prefix(_) | Component::RootDir => {
                    return Err(TxError::PathOutsideBase {
                        path: raw.to_path_buf(),
                    });
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    // Embedded `..` is allowed as long as it never climbs
                    // above the base.
                    if segments.pop().is_none() {
                        return Err(TxError::PathOutsideBase {
                            path: raw.to_path_buf(),
                        });
                    }
                }
                Component::Normal(part) => segments.push(part.to_os_string()),
            }
        }

        let mut rel = PathBuf::new();
        for segment in segments {
            rel.push(segment);
        }
        Ok(rel)
    }
}

/// Detects rooted paths across platform conventions.
///
/// `Path::is_absolute` alone misses Windows-style roots when running on
/// Unix; the textual checks cover drive letters (`X:\`, `X:/`) and UNC or
/// POSIX double-separator prefixes (`\\server`, `//server`) regardless of
/// host platform.
fn is_rooted(path: &Path) -> bool {
    if path.is_absolute() {
        return true;
    }
    let text = path.to_string_lossy();
    let bytes = text.as_bytes();
    if bytes.first() == Some(&b'/') || bytes.first() == Some(&b'\\') {
        return true;
    }
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return true;
    }
    false
}

/// Stable string form of a normalized relative path, used as the journal
/// snapshot key and the lock digest input.
pub(crate) fn rel_key(rel: &Path) -> String {
    rel.to_string_lossy().into_owned()
}
