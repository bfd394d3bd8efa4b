//! Post-iteration violation scan.
//!
//! Three independent checks run on every pass and all findings are collected:
//! text patterns, protected-file permission drift, and model identity.

use std::fs;
use std::os::unix::fs::PermissionsExt;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::core::paths::ProtectedPaths;
use crate::core::patterns::PatternSet;
use crate::core::types::Violation;

/// Mode every protected file must carry.
pub const PROTECTED_MODE: u32 = 0o444;

pub struct ViolationScanner {
    patterns: PatternSet,
    protected: ProtectedPaths,
    allowed_model: String,
}

impl ViolationScanner {
    pub fn new(protected: ProtectedPaths, allowed_model: impl Into<String>) -> Result<Self> {
        Ok(Self {
            patterns: PatternSet::violations()?,
            protected,
            allowed_model: allowed_model.into(),
        })
    }

    /// Run every check. An empty result means the iteration is clean.
    ///
    /// `reported_model` is skipped when empty (no reply arrived).
    pub fn scan(&self, text: &str, reported_model: &str) -> Vec<Violation> {
        let mut violations = self.scan_text(text);
        violations.extend(self.check_permissions());
        if let Some(violation) = self.check_model(reported_model) {
            violations.push(violation);
        }
        for violation in &violations {
            error!(violation = %violation, "violation detected");
        }
        violations
    }

    pub fn scan_text(&self, text: &str) -> Vec<Violation> {
        self.patterns
            .matches(text)
            .into_iter()
            .map(|rule| {
                Violation::new(format!(
                    "{} pattern matched: {}",
                    rule.category, rule.pattern
                ))
            })
            .collect()
    }

    /// Compare each protected file's mode with [`PROTECTED_MODE`], healing drift.
    pub fn check_permissions(&self) -> Vec<Violation> {
        let mut violations = Vec::new();
        for path in self.protected.iter() {
            let meta = match fs::symlink_metadata(path) {
                Ok(meta) => meta,
                Err(err) => {
                    violations.push(Violation::new(format!(
                        "protected file {} is missing ({err})",
                        path.display()
                    )));
                    continue;
                }
            };
            if meta.file_type().is_symlink() {
                violations.push(Violation::new(format!(
                    "protected file {} was replaced by a symlink",
                    path.display()
                )));
                continue;
            }
            let mode = meta.permissions().mode() & 0o777;
            if mode == PROTECTED_MODE {
                continue;
            }
            violations.push(Violation::new(format!(
                "protected file {} has mode {mode:o}, expected {PROTECTED_MODE:o}",
                path.display()
            )));
            match fs::set_permissions(path, fs::Permissions::from_mode(PROTECTED_MODE)) {
                Ok(()) => info!(path = %path.display(), "restored protected file mode"),
                Err(err) => warn!(path = %path.display(), err = %err, "failed to restore protected file mode"),
            }
        }
        violations
    }

    pub fn check_model(&self, reported_model: &str) -> Option<Violation> {
        if reported_model.is_empty() || reported_model == self.allowed_model {
            return None;
        }
        Some(Violation::new(format!(
            "model {reported_model} used instead of allowed model {}",
            self.allowed_model
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const MODEL: &str = "claude-sonnet-4-20250514";

    fn protected_file(dir: &std::path::Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "print('supervise')\n").expect("write");
        fs::set_permissions(&path, fs::Permissions::from_mode(PROTECTED_MODE)).expect("chmod");
        path
    }

    fn mode(path: &std::path::Path) -> u32 {
        fs::metadata(path).expect("stat").permissions().mode() & 0o777
    }

    #[test]
    fn clean_iteration_has_no_violations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = protected_file(temp.path(), "supervisor.py");
        let scanner = ViolationScanner::new(ProtectedPaths::new([file]), MODEL).expect("scanner");
        assert!(scanner.scan("wrote a parser [SLEEP:30]", MODEL).is_empty());
    }

    #[test]
    fn permission_drift_is_detected_and_healed_in_one_pass() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = protected_file(temp.path(), "supervisor.py");
        fs::set_permissions(&file, fs::Permissions::from_mode(0o777)).expect("chmod");
        let scanner =
            ViolationScanner::new(ProtectedPaths::new([file.clone()]), MODEL).expect("scanner");

        let violations = scanner.check_permissions();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].description().contains("777"));
        assert_eq!(mode(&file), PROTECTED_MODE);
        assert!(scanner.check_permissions().is_empty());
    }

    #[test]
    fn missing_and_symlinked_protected_files_are_violations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let real = protected_file(temp.path(), "real.py");
        let link = temp.path().join("link.py");
        std::os::unix::fs::symlink(&real, &link).expect("symlink");
        let missing = temp.path().join("gone.py");
        let scanner =
            ViolationScanner::new(ProtectedPaths::new([link, missing]), MODEL).expect("scanner");

        let violations = scanner.check_permissions();
        assert_eq!(violations.len(), 2);
    }

    #[test]
    fn collects_every_check_without_short_circuit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = protected_file(temp.path(), "supervisor.py");
        fs::set_permissions(&file, fs::Permissions::from_mode(0o644)).expect("chmod");
        let scanner = ViolationScanner::new(ProtectedPaths::new([file]), MODEL).expect("scanner");

        let violations = scanner.scan("chmod 777 supervisor.py", "claude-opus-4-20250514");
        let text: Vec<&str> = violations.iter().map(Violation::description).collect();
        assert!(text.iter().any(|v| v.contains("protected-file tampering")));
        assert!(text.iter().any(|v| v.contains("644")));
        assert!(text.iter().any(|v| v.starts_with("model claude-opus")));
    }

    #[test]
    fn empty_model_is_not_checked() {
        let scanner =
            ViolationScanner::new(ProtectedPaths::new(Vec::<PathBuf>::new()), MODEL).expect("scanner");
        assert!(scanner.check_model("").is_none());
        assert!(scanner.check_model(MODEL).is_none());
    }
}
