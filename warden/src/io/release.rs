//! Promotion of workspace files onto the release branch.
//!
//! A release copies one file's current bytes onto the release branch and
//! commits it there. The working branch, its HEAD, and the working-tree copy of
//! the file are left as they were.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{error, info, instrument, warn};

use crate::core::paths::{is_within, resolve_path};
use crate::core::types::ReleaseRequest;
use crate::io::config::WardenConfig;
use crate::io::git::Git;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The file was committed on the release branch (`committed` is false when
    /// the branch already held identical bytes).
    Released { path: String, committed: bool },
    /// The request did not name a regular file inside the workspace.
    Rejected { source: String, reason: String },
    /// Git failed part-way; the original branch was restored.
    Failed { path: String, error: String },
}

impl ReleaseOutcome {
    pub fn is_released(&self) -> bool {
        matches!(self, ReleaseOutcome::Released { .. })
    }
}

pub struct ReleasePromoter {
    git: Git,
    workspace_root: PathBuf,
    branch: String,
}

impl ReleasePromoter {
    pub fn new(workspace_root: PathBuf, branch: impl Into<String>, git_timeout: Duration) -> Self {
        Self {
            git: Git::new(&workspace_root).with_timeout(git_timeout),
            workspace_root,
            branch: branch.into(),
        }
    }

    pub fn from_config(cfg: &WardenConfig) -> Self {
        Self::new(
            cfg.workspace_root.clone(),
            cfg.release.branch.clone(),
            Duration::from_secs(cfg.release.git_timeout_secs),
        )
    }

    /// Build one request per parsed `[RELEASE:<path>]` source.
    pub fn requests(&self, sources: &[String], iteration: u64) -> Vec<ReleaseRequest> {
        sources
            .iter()
            .map(|source| ReleaseRequest {
                source: source.clone(),
                target_branch: self.branch.clone(),
                iteration,
            })
            .collect()
    }

    /// Process every request in order; one failure never blocks the rest.
    pub fn promote_all(&self, requests: &[ReleaseRequest]) -> Vec<ReleaseOutcome> {
        requests.iter().map(|request| self.promote(request)).collect()
    }

    #[instrument(skip_all, fields(source = %request.source, iteration = request.iteration))]
    pub fn promote(&self, request: &ReleaseRequest) -> ReleaseOutcome {
        let rel = match self.validate_source(&request.source) {
            Ok(rel) => rel,
            Err(err) => {
                warn!(reason = %format!("{err:#}"), "release rejected");
                return ReleaseOutcome::Rejected {
                    source: request.source.clone(),
                    reason: format!("{err:#}"),
                };
            }
        };

        match self.promote_file(&rel, &request.target_branch, request.iteration) {
            Ok(committed) => {
                info!(path = %rel, branch = %request.target_branch, committed, "file released");
                ReleaseOutcome::Released {
                    path: rel,
                    committed,
                }
            }
            Err(err) => {
                error!(path = %rel, err = %format!("{err:#}"), "release failed");
                ReleaseOutcome::Failed {
                    path: rel,
                    error: format!("{err:#}"),
                }
            }
        }
    }

    /// Workspace-relative path of a regular file, or why it cannot be released.
    fn validate_source(&self, source: &str) -> Result<String> {
        let root = fs::canonicalize(&self.workspace_root)
            .with_context(|| format!("canonicalize {}", self.workspace_root.display()))?;
        let candidate = resolve_path(&root, Path::new(source));
        let canonical = fs::canonicalize(&candidate)
            .with_context(|| format!("{source} does not exist"))?;
        if !is_within(&canonical, &root) || canonical == root {
            return Err(anyhow!("{source} is outside the workspace"));
        }
        let rel = canonical
            .strip_prefix(&root)
            .with_context(|| format!("{source} is outside the workspace"))?;
        if rel.components().next().is_some_and(|c| c.as_os_str() == ".git") {
            return Err(anyhow!("{source} is inside .git"));
        }
        if !canonical.is_file() {
            return Err(anyhow!("{source} is not a regular file"));
        }
        Ok(rel.to_string_lossy().into_owned())
    }

    fn promote_file(&self, rel: &str, branch: &str, iteration: u64) -> Result<bool> {
        let path = self.workspace_root.join(rel);
        let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        let original = self.git.current_branch()?;
        if original == branch {
            return Err(anyhow!("workspace is already on the release branch"));
        }

        // An untracked copy would block checking out a branch that tracks it.
        if !self.git.is_tracked(rel)? {
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        }

        let result = self.commit_on_branch(rel, &bytes, branch, iteration);
        let restored = self.return_to(&original);
        let refreshed = restore_bytes(&path, &bytes);

        let committed = result?;
        restored?;
        refreshed?;
        Ok(committed)
    }

    fn commit_on_branch(&self, rel: &str, bytes: &[u8], branch: &str, iteration: u64) -> Result<bool> {
        if self.git.branch_exists(branch)? {
            self.git.checkout_branch(branch)?;
        } else {
            self.git.checkout_new_branch(branch)?;
        }
        let path = self.workspace_root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&path, bytes).with_context(|| format!("write {}", path.display()))?;
        self.git.add_paths(&[rel])?;
        self.git
            .commit_path(&format!("release: {rel} (iteration {iteration})"), rel)
    }

    fn return_to(&self, original: &str) -> Result<()> {
        match self.git.current_branch() {
            Ok(current) if current == original => return Ok(()),
            Ok(_) | Err(_) => {}
        }
        if let Err(err) = self.git.checkout_branch(original) {
            warn!(branch = original, err = %format!("{err:#}"), "checkout back failed, forcing");
            self.git.force_checkout(original)?;
        }
        Ok(())
    }
}

fn restore_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if fs::read(path).is_ok_and(|current| current == bytes) {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, bytes).with_context(|| format!("restore {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    fn promoter(repo: &TestRepo) -> ReleasePromoter {
        ReleasePromoter::new(repo.path().to_path_buf(), "release", Duration::from_secs(30))
    }

    fn request(source: &str) -> ReleaseRequest {
        ReleaseRequest {
            source: source.to_string(),
            target_branch: "release".to_string(),
            iteration: 7,
        }
    }

    #[test]
    fn releases_untracked_file_and_leaves_workspace_alone() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        let head_before = git.head_sha().expect("head");
        let branch_before = git.current_branch().expect("branch");
        fs::create_dir_all(repo.path().join("tools")).expect("mkdir");
        fs::write(repo.path().join("tools/stats.py"), "print(1)\n").expect("write");

        let outcome = promoter(&repo).promote(&request("tools/stats.py"));

        assert_eq!(
            outcome,
            ReleaseOutcome::Released {
                path: "tools/stats.py".to_string(),
                committed: true
            }
        );
        assert_eq!(
            git.show_file("release", "tools/stats.py").expect("show"),
            b"print(1)\n"
        );
        assert_eq!(git.head_sha().expect("head"), head_before);
        assert_eq!(git.current_branch().expect("branch"), branch_before);
        assert_eq!(
            fs::read_to_string(repo.path().join("tools/stats.py")).expect("read"),
            "print(1)\n"
        );
        let log = git.recent_log(5).expect("log");
        assert!(!log.iter().any(|line| line.contains("release:")));
    }

    #[test]
    fn second_release_updates_existing_branch() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        let promoter = promoter(&repo);
        fs::write(repo.path().join("notes.md"), "v1").expect("write");
        assert!(promoter.promote(&request("notes.md")).is_released());

        fs::write(repo.path().join("notes.md"), "v2").expect("write");
        let outcome = promoter.promote(&request("notes.md"));

        assert!(outcome.is_released());
        assert_eq!(git.show_file("release", "notes.md").expect("show"), b"v2");
        assert_eq!(fs::read_to_string(repo.path().join("notes.md")).expect("read"), "v2");
    }

    #[test]
    fn unchanged_release_is_not_committed() {
        let repo = TestRepo::new().expect("repo");
        let promoter = promoter(&repo);
        fs::write(repo.path().join("notes.md"), "same").expect("write");
        promoter.promote(&request("notes.md"));
        let outcome = promoter.promote(&request("notes.md"));
        assert_eq!(
            outcome,
            ReleaseOutcome::Released {
                path: "notes.md".to_string(),
                committed: false
            }
        );
    }

    #[test]
    fn rejects_sources_outside_workspace_or_missing() {
        let repo = TestRepo::new().expect("repo");
        let promoter = promoter(&repo);
        for source in ["/etc/hostname", "../escape.txt", "missing.txt", ".git/config", "."] {
            let outcome = promoter.promote(&request(source));
            assert!(
                matches!(outcome, ReleaseOutcome::Rejected { .. }),
                "expected rejection for {source}: {outcome:?}"
            );
        }
        assert!(!Git::new(repo.path()).branch_exists("release").expect("exists"));
    }

    #[test]
    fn failed_checkout_keeps_original_branch() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        let promoter = promoter(&repo);
        let original = git.current_branch().expect("branch");

        fs::write(repo.path().join("shared.txt"), "base").expect("write");
        git.add_paths(&["shared.txt"]).expect("add");
        git.commit_path("add shared", "shared.txt").expect("commit");
        git.checkout_new_branch("release").expect("branch");
        fs::write(repo.path().join("shared.txt"), "release copy").expect("write");
        git.add_paths(&["shared.txt"]).expect("add");
        git.commit_path("diverge", "shared.txt").expect("commit");
        git.checkout_branch(&original).expect("back");

        // Local edit to a file that differs between branches blocks checkout.
        fs::write(repo.path().join("shared.txt"), "local edit").expect("write");
        fs::write(repo.path().join("out.txt"), "artifact").expect("write");

        let outcome = promoter.promote(&request("out.txt"));

        assert!(matches!(outcome, ReleaseOutcome::Failed { .. }), "{outcome:?}");
        assert_eq!(git.current_branch().expect("branch"), original);
        assert_eq!(fs::read_to_string(repo.path().join("out.txt")).expect("read"), "artifact");
        assert_eq!(
            fs::read_to_string(repo.path().join("shared.txt")).expect("read"),
            "local edit"
        );
    }
}
