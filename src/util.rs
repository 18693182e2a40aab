//! Shared utility functions for the foreman crate.

use std::io::Write;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

/// Write `contents` to `path` via a sibling temp file and a rename, so a
/// reader never observes a half-written file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let result = (|| -> Result<()> {
        let mut file = std::fs::File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(contents)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move {} into place", path.display()))?;
        Ok(())
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

static VOLATILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)0x[0-9a-f]+|\b[0-9a-f]{7,40}\b|\d+").expect("valid regex")
});

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Number of leading words that make up a failure signature.
const SIGNATURE_WORDS: usize = 6;

/// Normalize an error message to its leading text with numbers, hashes and
/// pids masked, so the same failure on different items compares equal.
pub fn error_signature(message: &str) -> String {
    let first_line = message.lines().next().unwrap_or("").trim();
    let masked = VOLATILE.replace_all(first_line, "#");
    let collapsed = WHITESPACE.replace_all(masked.trim(), " ");
    collapsed
        .split(' ')
        .take(SIGNATURE_WORDS)
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Make an item id safe to use as a file name.
pub fn file_safe(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_atomic_replaces_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/state.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_error_signature_masks_volatile_parts() {
        let a = error_signature("spawn failed: pid 4312 exited with code 127\nstack...");
        let b = error_signature("spawn failed: pid 99 exited with code 127");
        assert_eq!(a, b);
        assert_eq!(a, "spawn failed: pid # exited with");
    }

    #[test]
    fn test_error_signature_distinguishes_different_errors() {
        assert_ne!(
            error_signature("permission denied"),
            error_signature("no such file or directory")
        );
    }

    #[test]
    fn test_error_signature_masks_commit_hashes() {
        assert_eq!(
            error_signature("cannot push deadbeef1234"),
            error_signature("cannot push abcdef9876543")
        );
    }

    #[test]
    fn test_file_safe() {
        assert_eq!(file_safe("fm-12"), "fm-12");
        assert_eq!(file_safe("org/repo#4"), "org_repo_4");
    }
}
