//! Git worktree management for task isolation.
//!
//! Each task runs in its own git worktree under
//! `<projectDir>/.arkaledge/worktrees/`, sharing the object store of the
//! project repository but with an independent working directory and index.
//!
//! Git does not support concurrent worktree operations on the same
//! repository (they contend on a lock file in the shared git dir), so every
//! mutating operation is serialised through an internal mutex.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Local identity used when the repository has none configured.
const BOT_NAME: &str = "Arkaledge Bot";
const BOT_EMAIL: &str = "arkaledge@local";

/// Identity applied when commit enforcement hits a missing-ident failure.
const ENGINEER_NAME: &str = "Arkaledge Engineer";
const ENGINEER_EMAIL: &str = "arkaledge@local";

/// Errors that can occur during git operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    /// A git command failed to execute at all.
    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A git command exited with a non-zero status.
    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },
}

/// Owns all git interactions under one project directory.
#[derive(Debug)]
pub struct WorktreeManager {
    project_dir: PathBuf,
    /// Serialises git operations to avoid lock-file contention.
    git_lock: Arc<Mutex<()>>,
}

impl Clone for WorktreeManager {
    fn clone(&self) -> Self {
        Self {
            project_dir: self.project_dir.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

impl WorktreeManager {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            git_lock: Arc::new(Mutex::new(())),
        }
    }

    /// The project repository path.
    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Base directory under which task worktrees are created.
    pub fn worktree_base(&self) -> PathBuf {
        self.project_dir.join(".arkaledge").join("worktrees")
    }

    /// Worktree path for a task id.
    pub fn worktree_path(&self, task_id: &str) -> PathBuf {
        self.worktree_base().join(sanitize_task_id(task_id))
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Create (or recreate) the worktree for a task on the given branch.
    ///
    /// Ensures the repository is ready first. If a worktree already exists
    /// at the task's path it is forcibly removed and replaced. If the
    /// branch already exists it is checked out; otherwise the branch is
    /// created from `main`.
    pub fn create_worktree(
        &self,
        task_id: &str,
        branch_name: &str,
    ) -> Result<PathBuf, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        self.ensure_repo_ready()?;

        let path = self.worktree_path(task_id);
        if path.exists() {
            self.force_remove_worktree(&path);
        }

        let base = self.worktree_base();
        if !base.exists() {
            std::fs::create_dir_all(&base).map_err(|source| WorktreeError::GitCommand {
                message: format!("failed to create worktree base {}", base.display()),
                source,
            })?;
        }

        let path_str = path.to_string_lossy().to_string();
        if self.branch_exists(branch_name)? {
            self.git(&["worktree", "add", &path_str, branch_name])?;
        } else {
            self.git(&["worktree", "add", "-b", branch_name, &path_str, "main"])?;
        }

        tracing::info!(
            task_id,
            branch = branch_name,
            path = %path.display(),
            "created worktree"
        );
        Ok(path)
    }

    /// Remove the worktree for a task and prune stale references.
    ///
    /// Idempotent: a missing worktree is not an error.
    pub fn remove_worktree(&self, task_id: &str) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.worktree_path(task_id);
        self.force_remove_worktree(&path);
        Ok(())
    }

    /// Merge a task branch into `main` with `--no-ff`.
    ///
    /// On failure the merge is aborted to restore a clean index and the
    /// error (carrying git's stderr) is propagated.
    pub fn merge_to_main(&self, branch_name: &str) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        self.ensure_repo_ready()?;

        let message = format!("Merge {branch_name} into main");
        match self.git(&["merge", "--no-ff", branch_name, "-m", &message]) {
            Ok(_) => Ok(()),
            Err(e) => {
                // Restore a clean index before surfacing the failure.
                let _ = self.git(&["merge", "--abort"]);
                Err(e)
            }
        }
    }

    /// Diff of a task branch against main: `git diff main...<branch>`.
    pub fn diff_against_main(&self, branch_name: &str) -> Result<String, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.git(&["diff", &format!("main...{branch_name}")])
    }

    /// Number of commits on a branch that are not on main.
    pub fn commits_ahead_of_main(&self, branch_name: &str) -> Result<u64, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let out = self.git(&["rev-list", "--count", &format!("main..{branch_name}")])?;
        Ok(out.trim().parse().unwrap_or(0))
    }

    /// Whether the working tree at `dir` has no pending changes.
    pub fn is_clean(&self, dir: &Path) -> Result<bool, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let out = self.git_in(dir, &["status", "--porcelain"])?;
        Ok(out.trim().is_empty())
    }

    /// Create an empty commit in `dir`.
    pub fn commit_empty(&self, dir: &Path, message: &str) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.commit_with_identity_retry(dir, &["commit", "--allow-empty", "-m", message])
    }

    /// Stage everything in `dir` and commit.
    pub fn commit_all(&self, dir: &Path, message: &str) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.git_in(dir, &["add", "-A"])?;
        self.commit_with_identity_retry(dir, &["commit", "-m", message])
    }

    /// Whether a branch exists in the repository.
    pub fn branch_exists(&self, branch_name: &str) -> Result<bool, WorktreeError> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify", "--quiet"])
            .arg(format!("refs/heads/{branch_name}"))
            .current_dir(&self.project_dir)
            .output()
            .map_err(|source| WorktreeError::GitCommand {
                message: "failed to run git rev-parse --verify".into(),
                source,
            })?;
        Ok(output.status.success())
    }

    // -----------------------------------------------------------------------
    // Repository readiness
    // -----------------------------------------------------------------------

    /// Make the project directory a usable repository with `main` checked
    /// out: init if needed, seed an initial commit if `HEAD` is unresolved,
    /// abort any pending merge/rebase, prune stale worktree registrations,
    /// and force-checkout `main`.
    fn ensure_repo_ready(&self) -> Result<(), WorktreeError> {
        if !self.is_git_repo() {
            self.git(&["init"])?;
            tracing::info!(dir = %self.project_dir.display(), "initialized git repository");
        }

        if !self.head_resolves() {
            self.ensure_identity(&self.project_dir, BOT_NAME, BOT_EMAIL)?;
            self.git(&["commit", "--allow-empty", "-m", "Initial commit"])?;
        }

        // A crashed run can leave merge/rebase state or stale worktree
        // registrations behind; clear both before switching branches.
        let _ = self.git(&["merge", "--abort"]);
        let _ = self.git(&["rebase", "--abort"]);
        let _ = self.git(&["worktree", "prune"]);

        if self.branch_exists("main")? {
            self.git(&["checkout", "-f", "main"])?;
        } else {
            self.git(&["checkout", "-b", "main"])?;
        }

        Ok(())
    }

    fn is_git_repo(&self) -> bool {
        Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&self.project_dir)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn head_resolves(&self) -> bool {
        Command::new("git")
            .args(["rev-parse", "--verify", "--quiet", "HEAD"])
            .current_dir(&self.project_dir)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Set a local identity if none is configured.
    fn ensure_identity(&self, dir: &Path, name: &str, email: &str) -> Result<(), WorktreeError> {
        let has_name = Command::new("git")
            .args(["config", "user.name"])
            .current_dir(dir)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if !has_name {
            self.git_in(dir, &["config", "user.name", name])?;
            self.git_in(dir, &["config", "user.email", email])?;
        }
        Ok(())
    }

    /// Run a commit; if it fails because no identity is configured, set the
    /// engineer identity locally and retry once.
    fn commit_with_identity_retry(&self, dir: &Path, args: &[&str]) -> Result<(), WorktreeError> {
        match self.git_in(dir, args) {
            Ok(_) => Ok(()),
            Err(WorktreeError::GitExit { stderr, .. })
                if stderr.contains("Please tell me who you are")
                    || stderr.contains("unable to auto-detect email") =>
            {
                self.git_in(dir, &["config", "user.name", ENGINEER_NAME])?;
                self.git_in(dir, &["config", "user.email", ENGINEER_EMAIL])?;
                self.git_in(dir, args)?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Forcibly remove a worktree, falling back to plain filesystem
    /// removal, then prune stale registrations.
    fn force_remove_worktree(&self, path: &Path) {
        let path_str = path.to_string_lossy().to_string();
        if let Err(e) = self.git(&["worktree", "remove", "--force", &path_str]) {
            tracing::debug!(path = %path.display(), error = %e, "git worktree remove failed, falling back to fs removal");
            if path.exists() {
                let _ = std::fs::remove_dir_all(path);
            }
        }
        let _ = self.git(&["worktree", "prune"]);
    }

    // -----------------------------------------------------------------------
    // Subprocess plumbing
    // -----------------------------------------------------------------------

    fn git(&self, args: &[&str]) -> Result<String, WorktreeError> {
        self.git_in(&self.project_dir, args)
    }

    fn git_in(&self, dir: &Path, args: &[&str]) -> Result<String, WorktreeError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|source| WorktreeError::GitCommand {
                message: format!("failed to run git {}", args.join(" ")),
                source,
            })?;

        if !output.status.success() {
            // Some git failures (merge conflicts) report on stdout only.
            let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.is_empty() {
                stderr = String::from_utf8_lossy(&output.stdout).trim().to_string();
            }
            return Err(WorktreeError::GitExit {
                command: args.join(" "),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Replace any character outside `[A-Za-z0-9_-]` with `-`.
pub fn sanitize_task_id(task_id: &str) -> String {
    task_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
