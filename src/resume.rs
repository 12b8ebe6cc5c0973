//! On-disk resume state
//!
//! Single files are received into a `<dest>.partial` sibling whose length is
//! the resume offset. Archives record the entry being received in a
//! `<identifier>.progress` marker next to the destination.

use log::{debug, warn};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{IoContext, Result, TransferError};
use crate::protocol::{PARTIAL_SUFFIX, PROGRESS_SUFFIX};
use crate::protocol_core::join_under_root;

const IDENTIFIER_MAX: usize = 50;
const IDENTIFIER_ELLIPSIS: &str = " (...)";

/// `<path>.partial`
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name: OsString = dest.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Length of an existing partial file, 0 when there is none.
pub fn partial_len(dest: &Path) -> u64 {
    match fs::symlink_metadata(partial_path(dest)) {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => 0,
    }
}

/// Last path component of a remote (slash separated) or local path.
pub fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches(|c| c == '/' || c == '\\');
    if trimmed.is_empty() {
        return path;
    }
    trimmed
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(trimmed)
}

/// Stable name for a set of sources, used for the `.progress` marker.
///
/// Basenames are joined with `__`; long results are cut to 50 characters
/// ending in ` (...)`.
pub fn create_identifier<S: AsRef<str>>(sources: &[S]) -> String {
    let joined = sources
        .iter()
        .map(|s| basename(s.as_ref()))
        .collect::<Vec<_>>()
        .join("__");
    if joined.chars().count() <= IDENTIFIER_MAX {
        return joined;
    }
    let keep = IDENTIFIER_MAX - IDENTIFIER_ELLIPSIS.len();
    let mut out: String = joined.chars().take(keep).collect();
    out.push_str(IDENTIFIER_ELLIPSIS);
    out
}

/// Sidecar file naming the archive entry currently being received.
#[derive(Debug, Clone)]
pub struct ProgressMarker {
    path: PathBuf,
}

impl ProgressMarker {
    pub fn new(dir: &Path, identifier: &str) -> Self {
        Self {
            path: dir.join(format!("{}{}", identifier, PROGRESS_SUFFIX)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Entry path recorded by an earlier run, if any.
    pub fn load(&self) -> Result<Option<PathBuf>> {
        match fs::read_to_string(&self.path) {
            Ok(s) => {
                let entry = s.trim_end_matches('\n');
                if entry.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(PathBuf::from(entry)))
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TransferError::io(
                format!("read resume marker {}", self.path.display()),
                e,
            )),
        }
    }

    /// Load the recorded entry and check it against the files under `root`.
    ///
    /// A marker whose entry is missing or not a regular file is reported as
    /// `ResumeStateInvalid`.
    pub fn check(&self, root: &Path) -> Result<Option<PathBuf>> {
        let entry = match self.load()? {
            Some(e) => e,
            None => return Ok(None),
        };
        let target = join_under_root(root, &entry).map_err(|e| TransferError::ResumeStateInvalid {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        match fs::symlink_metadata(&target) {
            Ok(meta) if meta.is_file() => Ok(Some(entry)),
            Ok(_) => Err(TransferError::ResumeStateInvalid {
                path: self.path.clone(),
                reason: format!("{} is not a regular file", target.display()),
            }),
            Err(_) => Err(TransferError::ResumeStateInvalid {
                path: self.path.clone(),
                reason: format!("{} does not exist", target.display()),
            }),
        }
    }

    /// Like [`check`](Self::check), but an invalid marker is logged and removed.
    pub fn resume_entry(&self, root: &Path) -> Option<PathBuf> {
        match self.check(root) {
            Ok(entry) => {
                if let Some(e) = &entry {
                    debug!("resuming archive at entry {}", e.display());
                }
                entry
            }
            Err(err) => {
                warn!("{}; starting over", err);
                self.clear();
                None
            }
        }
    }

    pub fn record(&self, entry: &Path) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_io_context(|| format!("create {}", parent.display()))?;
            }
        }
        fs::write(&self.path, entry.to_string_lossy().as_bytes())
            .with_io_context(|| format!("write resume marker {}", self.path.display()))
    }

    /// Best-effort removal; a failure is logged, never returned.
    pub fn clear(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("could not remove {}: {}", self.path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_sibling_name() {
        assert_eq!(
            partial_path(Path::new("dl/movie.mkv")),
            PathBuf::from("dl/movie.mkv.partial")
        );
    }

    #[test]
    fn basename_of_remote_paths() {
        assert_eq!(basename("/srv/data/"), "data");
        assert_eq!(basename("notes.txt"), "notes.txt");
        assert_eq!(basename("/"), "/");
    }

    #[test]
    fn identifier_joins_and_truncates() {
        assert_eq!(create_identifier(&["/a/one", "two/"]), "one__two");
        let long: Vec<String> = (0..20).map(|i| format!("/x/file{i}")).collect();
        let id = create_identifier(&long);
        assert_eq!(id.chars().count(), 50);
        assert!(id.ends_with(" (...)"));
    }

    #[test]
    fn marker_round_trip_and_clear() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("d/sub")).unwrap();
        fs::write(dir.path().join("d/sub/f.bin"), b"abc").unwrap();
        let marker = ProgressMarker::new(dir.path(), "d");
        assert_eq!(marker.load().unwrap(), None);
        marker.record(Path::new("sub/f.bin")).unwrap();
        assert_eq!(
            marker.check(&dir.path().join("d")).unwrap(),
            Some(PathBuf::from("sub/f.bin"))
        );
        marker.clear();
        assert!(!marker.exists());
        marker.clear();
    }

    #[test]
    fn marker_pointing_nowhere_is_invalid_and_discarded() {
        let dir = tempdir().unwrap();
        let marker = ProgressMarker::new(dir.path(), "batch");
        marker.record(Path::new("gone.txt")).unwrap();
        let err = marker.check(dir.path()).unwrap_err();
        assert!(matches!(err, TransferError::ResumeStateInvalid { .. }));
        assert_eq!(marker.resume_entry(dir.path()), None);
        assert!(!marker.exists());
    }

    #[test]
    fn partial_len_ignores_missing_file() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("x.bin");
        assert_eq!(partial_len(&dest), 0);
        fs::write(partial_path(&dest), vec![0u8; 17]).unwrap();
        assert_eq!(partial_len(&dest), 17);
    }
}
