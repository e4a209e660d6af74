//! Git worktree management for agent isolation.
//!
//! Every agent that wants one gets an isolated checkout + branch pair:
//! worktrees share the object store of the main repository but have
//! independent working directories. Branches are named
//! `agent/<short-id>[-<slug>]`.
//!
//! Git does not support concurrent worktree operations on one repository
//! (a lock file guards the shared object store), so all mutating
//! operations here are serialized through an internal mutex.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Errors from worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    /// The main repository path does not exist or is not a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    /// A git command failed to execute.
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

    /// The worktree path exists but carries a different branch.
    #[error("worktree path exists with unexpected branch: expected {expected}, found {found}")]
    BranchMismatch { expected: String, found: String },

    /// Failed to parse porcelain output from `git worktree list`.
    #[error("failed to parse worktree list output: {0}")]
    ParseError(String),
}

/// Result of merging an agent branch back into the main branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    /// The merge conflicted and was aborted.
    Conflict { details: String },
}

/// One entry from `git worktree list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head_commit: String,
}

/// Reduce a task title to a short branch-safe slug.
pub fn slugify(title: &str, max_len: usize) -> String {
    let mut slug = String::new();
    for c in title.chars() {
        let mapped = if c.is_ascii_alphanumeric() {
            c.to_ascii_lowercase()
        } else if c.is_whitespace() || c == '-' || c == '_' {
            '-'
        } else {
            continue;
        };
        if mapped == '-' && slug.ends_with('-') {
            continue;
        }
        slug.push(mapped);
        if slug.len() >= max_len {
            break;
        }
    }
    slug.trim_matches('-').to_owned()
}

/// Conventional agent branch name: `agent/<short-id>` or
/// `agent/<short-id>-<slug>` when a task title is available.
pub fn agent_branch_name(agent_id: &str, task_title: Option<&str>) -> String {
    let short = agent_id.rsplit('_').next().unwrap_or(agent_id);
    let short = &short[..short.len().min(12)];
    match task_title.map(|t| slugify(t, 24)).filter(|s| !s.is_empty()) {
        Some(slug) => format!("agent/{short}-{slug}"),
        None => format!("agent/{short}"),
    }
}

/// Manages git worktrees for agent isolation.
#[derive(Debug)]
pub struct WorktreeManager {
    repo_path: PathBuf,
    worktree_base: PathBuf,
    git_lock: Arc<Mutex<()>>,
}

impl Clone for WorktreeManager {
    fn clone(&self) -> Self {
        Self {
            repo_path: self.repo_path.clone(),
            worktree_base: self.worktree_base.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

impl WorktreeManager {
    /// Create a manager for the repository at `repo_path`.
    ///
    /// Worktrees land under `worktree_base`, defaulting to a sibling
    /// directory named `<repo-name>-sibyl-worktrees`.
    pub fn new(
        repo_path: impl Into<PathBuf>,
        worktree_base: Option<PathBuf>,
    ) -> Result<Self, WorktreeError> {
        let repo_path = repo_path.into();

        let output = Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(WorktreeError::NotAGitRepo(repo_path));
        }

        let worktree_base = worktree_base.unwrap_or_else(|| {
            let repo_name = repo_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("repo");
            let base_name = format!("{repo_name}-sibyl-worktrees");
            repo_path
                .parent()
                .map(|p| p.join(&base_name))
                .unwrap_or_else(|| PathBuf::from(base_name))
        });

        Ok(Self {
            repo_path,
            worktree_base,
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn worktree_base(&self) -> &Path {
        &self.worktree_base
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// HEAD commit of the main repository, recorded as the worktree's base.
    pub fn head_commit(&self) -> Result<String, WorktreeError> {
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse HEAD".into(),
                source: e,
            })?;
        if !output.status.success() {
            return Err(WorktreeError::GitExit {
                command: "rev-parse HEAD".into(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    /// Create a worktree for the given branch.
    ///
    /// The directory is `worktree_base/<branch-with-slashes-as-dashes>`.
    /// Idempotent: an existing worktree on the same branch is returned
    /// as-is. Partial state from a failed creation is cleaned up
    /// best-effort.
    pub fn create_worktree(&self, branch_name: &str) -> Result<WorktreeInfo, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let dir_name = branch_name.replace('/', "--");
        let worktree_path = self.worktree_base.join(&dir_name);

        if let Ok(existing) = self.find_worktree_by_path(&worktree_path) {
            if let Some(ref branch) = existing.branch {
                if branch == branch_name {
                    tracing::info!(
                        path = %worktree_path.display(),
                        branch = branch_name,
                        "worktree already exists, returning existing"
                    );
                    return Ok(existing);
                }
                return Err(WorktreeError::BranchMismatch {
                    expected: branch_name.to_owned(),
                    found: branch.clone(),
                });
            }
            // Detached HEAD at the path; treat as existing.
            return Ok(existing);
        }

        if !self.worktree_base.exists() {
            std::fs::create_dir_all(&self.worktree_base).map_err(|e| {
                WorktreeError::GitCommand {
                    message: format!(
                        "failed to create worktree base directory: {}",
                        self.worktree_base.display()
                    ),
                    source: e,
                }
            })?;
        }

        // An existing branch is checked out; a new branch is created.
        let branch_exists = self.branch_exists(branch_name)?;
        let output = if branch_exists {
            Command::new("git")
                .args(["worktree", "add"])
                .arg(&worktree_path)
                .arg(branch_name)
                .current_dir(&self.repo_path)
                .output()
        } else {
            Command::new("git")
                .args(["worktree", "add", "-b"])
                .arg(branch_name)
                .arg(&worktree_path)
                .current_dir(&self.repo_path)
                .output()
        }
        .map_err(|e| WorktreeError::GitCommand {
            message: "failed to run git worktree add".into(),
            source: e,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            self.cleanup_partial(&worktree_path);
            return Err(WorktreeError::GitExit {
                command: "worktree add".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        self.find_worktree_by_path(&worktree_path)
    }

    /// Remove a worktree by path. Idempotent.
    pub fn remove_worktree(&self, path: &Path) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        if self.find_worktree_by_path(path).is_err() {
            if path.exists() {
                tracing::warn!(
                    path = %path.display(),
                    "directory exists but not registered as worktree, removing"
                );
                let _ = std::fs::remove_dir_all(path);
            }
            return Ok(());
        }

        let output = Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(path)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree remove".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("is not a working tree") {
                return Ok(());
            }
            return Err(WorktreeError::GitExit {
                command: "worktree remove".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    /// List all worktrees of the main repository.
    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let output = Command::new("git")
            .args(["worktree", "list", "--porcelain"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree list".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(WorktreeError::GitExit {
                command: "worktree list".into(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        parse_porcelain_output(&String::from_utf8_lossy(&output.stdout))
    }

    /// Prune references to worktrees whose directories were removed
    /// externally.
    pub fn prune_stale(&self) -> Result<(), WorktreeError> {
        let output = Command::new("git")
            .args(["worktree", "prune"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree prune".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(WorktreeError::GitExit {
                command: "worktree prune".into(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        Ok(())
    }

    /// Whether the working directory at `path` has uncommitted changes.
    pub fn has_uncommitted(&self, path: &Path) -> Result<bool, WorktreeError> {
        let output = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git status".into(),
                source: e,
            })?;
        Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }

    /// Merge an agent branch into the current branch with `--no-ff`.
    ///
    /// Conflicted merges are aborted automatically and reported as
    /// [`MergeOutcome::Conflict`].
    pub fn merge_branch(&self, branch_name: &str) -> Result<MergeOutcome, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let output = Command::new("git")
            .args(["merge", "--no-ff", branch_name])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git merge".into(),
                source: e,
            })?;

        if output.status.success() {
            return Ok(MergeOutcome::Merged);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();

        if stderr.contains("CONFLICT")
            || stdout.contains("CONFLICT")
            || stderr.contains("Automatic merge failed")
        {
            let _ = Command::new("git")
                .args(["merge", "--abort"])
                .current_dir(&self.repo_path)
                .output();

            return Ok(MergeOutcome::Conflict {
                details: format!("{stdout}\n{stderr}").trim().to_owned(),
            });
        }

        Err(WorktreeError::GitExit {
            command: "merge".into(),
            code: output.status.code().unwrap_or(-1),
            stderr,
        })
    }

    /// Whether a local branch exists.
    pub fn branch_exists(&self, branch_name: &str) -> Result<bool, WorktreeError> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify"])
            .arg(format!("refs/heads/{branch_name}"))
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse --verify".into(),
                source: e,
            })?;
        Ok(output.status.success())
    }

    fn find_worktree_by_path(&self, path: &Path) -> Result<WorktreeInfo, WorktreeError> {
        let worktrees = self.list_worktrees()?;
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        for wt in worktrees {
            let wt_canonical = wt.path.canonicalize().unwrap_or_else(|_| wt.path.clone());
            if wt_canonical == canonical {
                return Ok(wt);
            }
        }

        Err(WorktreeError::ParseError(format!(
            "worktree not found at path: {}",
            path.display()
        )))
    }

    fn cleanup_partial(&self, path: &Path) {
        if path.exists() {
            tracing::warn!(path = %path.display(), "cleaning up partial worktree directory");
            let _ = std::fs::remove_dir_all(path);
        }
        let _ = self.prune_stale();
    }
}

/// Parse `git worktree list --porcelain` output.
///
/// Blocks are separated by blank lines:
///
/// ```text
/// worktree <path>
/// HEAD <sha>
/// branch refs/heads/<name>
/// ```
///
/// The main worktree may show `bare`, and detached worktrees show
/// `detached`, instead of `branch`.
fn parse_porcelain_output(output: &str) -> Result<Vec<WorktreeInfo>, WorktreeError> {
    let mut worktrees = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_head: Option<String> = None;
    let mut current_branch: Option<String> = None;

    for line in output.lines() {
        if line.is_empty() {
            if let (Some(path), Some(head)) = (current_path.take(), current_head.take()) {
                worktrees.push(WorktreeInfo {
                    path,
                    branch: current_branch.take(),
                    head_commit: head,
                });
            } else {
                current_path = None;
                current_head = None;
                current_branch = None;
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("worktree ") {
            current_path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            current_head = Some(rest.to_owned());
        } else if let Some(rest) = line.strip_prefix("branch ") {
            current_branch = Some(rest.strip_prefix("refs/heads/").unwrap_or(rest).to_owned());
        }
        // `bare`, `detached`, `prunable` are ignored.
    }

    if let (Some(path), Some(head)) = (current_path, current_head) {
        worktrees.push(WorktreeInfo {
            path,
            branch: current_branch,
            head_commit: head,
        });
    }

    Ok(worktrees)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_temp_repo() -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("failed to create temp dir");
        let repo_path = dir.path().to_path_buf();

        let run = |args: &[&str]| {
            let output = Command::new("git")
                .args(args)
                .current_dir(&repo_path)
                .output()
                .unwrap_or_else(|e| panic!("git {} failed: {e}", args.join(" ")));
            assert!(
                output.status.success(),
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            );
        };

        run(&["init"]);
        run(&["config", "user.email", "test@sibyl.dev"]);
        run(&["config", "user.name", "Sibyl Test"]);
        std::fs::write(repo_path.join("README.md"), "# Test repo\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "Initial commit"]);

        (dir, repo_path)
    }

    #[test]
    fn slugify_basics() {
        assert_eq!(slugify("Fix the race condition!", 24), "fix-the-race-condition");
        assert_eq!(slugify("  multiple   spaces ", 24), "multiple-spaces");
        assert_eq!(slugify("ALLCAPS", 24), "allcaps");
        assert_eq!(slugify("", 24), "");
    }

    #[test]
    fn agent_branch_name_forms() {
        assert_eq!(agent_branch_name("agent_abc123def456", None), "agent/abc123def456");
        assert_eq!(
            agent_branch_name("agent_abc123def456", Some("Fix login bug")),
            "agent/abc123def456-fix-login-bug"
        );
        // Empty titles fall back to the bare form.
        assert_eq!(agent_branch_name("agent_xyz", Some("!!!")), "agent/xyz");
    }

    #[test]
    fn new_rejects_non_repo() {
        let dir = TempDir::new().unwrap();
        let result = WorktreeManager::new(dir.path(), None);
        assert!(matches!(result, Err(WorktreeError::NotAGitRepo(_))));
    }

    #[test]
    fn create_is_idempotent() {
        let (_dir, repo_path) = create_temp_repo();
        let base = TempDir::new().unwrap();
        let mgr = WorktreeManager::new(&repo_path, Some(base.path().to_path_buf())).unwrap();

        let branch = agent_branch_name("agent_1234567890ab", Some("idempotent"));
        let first = mgr.create_worktree(&branch).expect("first create failed");
        let second = mgr.create_worktree(&branch).expect("second create failed");

        assert_eq!(first.path, second.path);
        assert_eq!(first.branch.as_deref(), Some(branch.as_str()));
        assert!(first.path.exists());
    }

    #[test]
    fn remove_is_idempotent() {
        let (_dir, repo_path) = create_temp_repo();
        let base = TempDir::new().unwrap();
        let mgr = WorktreeManager::new(&repo_path, Some(base.path().to_path_buf())).unwrap();

        let info = mgr.create_worktree("agent/remove-me").expect("create failed");
        mgr.remove_worktree(&info.path).expect("remove failed");
        assert!(!info.path.exists());
        mgr.remove_worktree(&info.path).expect("second remove should not fail");
    }

    #[test]
    fn worktree_isolation_and_uncommitted_detection() {
        let (_dir, repo_path) = create_temp_repo();
        let base = TempDir::new().unwrap();
        let mgr = WorktreeManager::new(&repo_path, Some(base.path().to_path_buf())).unwrap();

        let info = mgr.create_worktree("agent/isolated").expect("create failed");
        assert!(!mgr.has_uncommitted(&info.path).unwrap());

        std::fs::write(info.path.join("work.txt"), "agent output\n").unwrap();
        assert!(mgr.has_uncommitted(&info.path).unwrap());
        // The file does not leak into the main repo.
        assert!(!repo_path.join("work.txt").exists());
    }

    #[test]
    fn merge_branch_brings_changes_back() {
        let (_dir, repo_path) = create_temp_repo();
        let base = TempDir::new().unwrap();
        let mgr = WorktreeManager::new(&repo_path, Some(base.path().to_path_buf())).unwrap();

        let branch = "agent/merge-me";
        let info = mgr.create_worktree(branch).expect("create failed");

        let run = |args: &[&str], dir: &Path| {
            let output = Command::new("git").args(args).current_dir(dir).output().unwrap();
            assert!(
                output.status.success(),
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            );
        };
        std::fs::write(info.path.join("feature.txt"), "new feature\n").unwrap();
        run(&["add", "feature.txt"], &info.path);
        run(&["commit", "-m", "Add feature"], &info.path);

        mgr.remove_worktree(&info.path).expect("remove failed");
        let outcome = mgr.merge_branch(branch).expect("merge failed");
        assert_eq!(outcome, MergeOutcome::Merged);
        assert!(repo_path.join("feature.txt").exists());
    }

    #[test]
    fn parse_porcelain_handles_detached_and_missing_trailing_newline() {
        let input = "\
worktree /home/user/project
HEAD abc123
branch refs/heads/main

worktree /home/user/wt/detached
HEAD 999888
detached

worktree /home/user/wt/agent
HEAD def456
branch refs/heads/agent/abc-fix";
        let result = parse_porcelain_output(input).unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result[0].branch.as_deref(), Some("main"));
        assert_eq!(result[1].branch, None);
        assert_eq!(result[2].branch.as_deref(), Some("agent/abc-fix"));
    }
}
