//! Workspace disk usage.

use std::path::Path;

use anyhow::{Result, anyhow};
use tracing::{debug, warn};
use walkdir::WalkDir;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Apparent size of the regular files under a root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiskUsage {
    pub bytes: u64,
    /// Entries that could not be walked or stat'ed and were left out.
    pub unreadable: usize,
}

impl DiskUsage {
    /// Rounded down to whole megabytes.
    pub fn megabytes(&self) -> u64 {
        self.bytes / BYTES_PER_MB
    }
}

/// Sum regular files under `root` without following symlinks.
///
/// Only a missing or unreadable root is an error. Anything below it that
/// cannot be read is counted in [`DiskUsage::unreadable`] and skipped.
pub fn disk_usage(root: &Path) -> Result<DiskUsage> {
    let mut usage = DiskUsage::default();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => {
                return Err(anyhow!("walk {}: {err}", root.display()));
            }
            Err(err) => {
                warn!(err = %err, "skipping unreadable entry");
                usage.unreadable += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        match entry.metadata() {
            Ok(meta) => usage.bytes = usage.bytes.saturating_add(meta.len()),
            Err(err) => {
                warn!(path = %entry.path().display(), err = %err, "skipping unreadable file");
                usage.unreadable += 1;
            }
        }
    }
    debug!(
        root = %root.display(),
        bytes = usage.bytes,
        unreadable = usage.unreadable,
        "measured disk usage"
    );
    Ok(usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn sums_nested_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("a/b")).expect("mkdir");
        fs::write(temp.path().join("one.txt"), vec![0u8; 100]).expect("write");
        fs::write(temp.path().join("a/b/two.txt"), vec![0u8; 50]).expect("write");
        let usage = disk_usage(temp.path()).expect("usage");
        assert_eq!(usage, DiskUsage { bytes: 150, unreadable: 0 });
        assert_eq!(usage.megabytes(), 0);
    }

    #[test]
    fn missing_root_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(disk_usage(&temp.path().join("missing")).is_err());
    }

    #[test]
    fn unreadable_directory_is_skipped_not_fatal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sealed = temp.path().join("sealed");
        fs::create_dir_all(&sealed).expect("mkdir");
        fs::write(sealed.join("hidden.bin"), vec![0u8; 10]).expect("write");
        fs::write(temp.path().join("visible.txt"), vec![0u8; 7]).expect("write");
        fs::set_permissions(&sealed, fs::Permissions::from_mode(0o000)).expect("chmod");
        // Root ignores directory permissions.
        let privileged = fs::read_dir(&sealed).is_ok();

        let usage = disk_usage(temp.path());

        fs::set_permissions(&sealed, fs::Permissions::from_mode(0o755)).expect("chmod back");
        let usage = usage.expect("usage");
        if privileged {
            assert_eq!(usage, DiskUsage { bytes: 17, unreadable: 0 });
        } else {
            assert_eq!(usage, DiskUsage { bytes: 7, unreadable: 1 });
        }
    }
}
