//! Config-file tamper detection.
//!
//! A baseline digest of every watched file is taken at startup; the
//! scheduler re-hashes each tick. Any changed, appeared, or vanished file
//! is treated as tampering and the process exits with status 78.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::info;

/// SHA-256 truncated to 16 hex chars; None when the file is absent.
fn digest_of(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let digest = Sha256::digest(&bytes);
    Some(hex::encode(digest)[..16].to_string())
}

pub struct TamperCheck {
    baseline: std::sync::Mutex<BTreeMap<PathBuf, Option<String>>>,
}

impl TamperCheck {
    /// Snapshot the watched files. Absent files are recorded as absent;
    /// their later appearance is a finding too.
    pub fn new(files: impl IntoIterator<Item = PathBuf>) -> Self {
        let baseline: BTreeMap<PathBuf, Option<String>> = files
            .into_iter()
            .map(|path| {
                let digest = digest_of(&path);
                (path, digest)
            })
            .collect();
        info!(files = baseline.len(), "tamper baseline established");
        Self {
            baseline: std::sync::Mutex::new(baseline),
        }
    }

    /// Re-hash everything; returns a description per deviation. Empty means
    /// clean.
    pub fn check(&self) -> Vec<String> {
        let baseline = self.baseline.lock().unwrap();
        let mut findings = Vec::new();
        for (path, expected) in baseline.iter() {
            let current = digest_of(path);
            match (expected, &current) {
                (Some(a), Some(b)) if a != b => {
                    findings.push(format!("modified: {}", path.display()))
                }
                (Some(_), None) => findings.push(format!("vanished: {}", path.display())),
                (None, Some(_)) => findings.push(format!("appeared: {}", path.display())),
                _ => {}
            }
        }
        findings
    }

    /// Accept the current on-disk state of a watched file after the process
    /// itself legitimately rewrote it (policy save, key rotation). Paths
    /// outside the watch list are ignored.
    pub fn rebaseline(&self, path: &Path) {
        let mut baseline = self.baseline.lock().unwrap();
        if let Some(entry) = baseline.get_mut(&path.to_path_buf()) {
            *entry = digest_of(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_files_produce_no_findings() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("policy.json");
        std::fs::write(&file, b"{}").unwrap();
        let check = TamperCheck::new(vec![file]);
        assert!(check.check().is_empty());
    }

    #[test]
    fn modification_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("policy.json");
        std::fs::write(&file, b"{}").unwrap();
        let check = TamperCheck::new(vec![file.clone()]);
        std::fs::write(&file, b"{\"changed\":true}").unwrap();
        let findings = check.check();
        assert_eq!(findings.len(), 1);
        assert!(findings[0].starts_with("modified:"));
    }

    #[test]
    fn rebaseline_accepts_legitimate_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("policy.json");
        std::fs::write(&file, b"{}").unwrap();
        let check = TamperCheck::new(vec![file.clone()]);
        std::fs::write(&file, b"{\"v\":2}").unwrap();
        assert_eq!(check.check().len(), 1);
        check.rebaseline(&file);
        assert!(check.check().is_empty());
    }

    #[test]
    fn vanish_and_appearance_are_detected() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present.txt");
        let absent = dir.path().join("absent.txt");
        std::fs::write(&present, b"x").unwrap();

        let check = TamperCheck::new(vec![present.clone(), absent.clone()]);
        std::fs::remove_file(&present).unwrap();
        std::fs::write(&absent, b"now here").unwrap();

        let findings = check.check();
        assert_eq!(findings.len(), 2);
        assert!(findings.iter().any(|f| f.starts_with("vanished:")));
        assert!(findings.iter().any(|f| f.starts_with("appeared:")));
    }
}
