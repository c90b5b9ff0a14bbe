//! Workspace git state used to fill in trigger details for local runs.

use std::path::Path;
use std::process::Command;

use crate::domain::error::{JoblineError, Result};

fn git_stdout(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| JoblineError::GitError(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(JoblineError::GitError(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    let out = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if out.is_empty() {
        return Err(JoblineError::GitError(format!(
            "git {} returned empty output",
            args.join(" ")
        )));
    }
    Ok(out)
}

/// The commit SHA checked out in `repo_dir`.
pub fn capture_head_sha(repo_dir: &Path) -> Result<String> {
    git_stdout(repo_dir, &["rev-parse", "HEAD"])
}

/// The branch checked out in `repo_dir`.
///
/// A detached HEAD is an error; a push trigger needs a branch name.
pub fn current_branch(repo_dir: &Path) -> Result<String> {
    let name = git_stdout(repo_dir, &["rev-parse", "--abbrev-ref", "HEAD"])?;
    if name == "HEAD" {
        return Err(JoblineError::GitError("HEAD is detached".to_string()));
    }
    Ok(name)
}

pub fn is_git_repo(dir: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(dir)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_git(repo_dir: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(repo_dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn repo_on_branch(branch: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        run_git(dir.path(), &["init"]);
        let head = format!("refs/heads/{branch}");
        run_git(dir.path(), &["symbolic-ref", "HEAD", &head]);
        run_git(dir.path(), &["config", "user.name", "ci"]);
        run_git(dir.path(), &["config", "user.email", "ci@example.com"]);
        run_git(dir.path(), &["commit", "--allow-empty", "-m", "initial"]);
        dir
    }

    #[test]
    fn head_sha_is_40_hex_chars() {
        let repo = repo_on_branch("main");
        let sha = capture_head_sha(repo.path()).unwrap();
        assert_eq!(sha.len(), 40, "unexpected sha: {sha}");
        assert!(sha.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn current_branch_reports_checked_out_branch() {
        let repo = repo_on_branch("release-1");
        assert_eq!(current_branch(repo.path()).unwrap(), "release-1");
    }

    #[test]
    fn detached_head_is_an_error() {
        let repo = repo_on_branch("main");
        let sha = capture_head_sha(repo.path()).unwrap();
        run_git(repo.path(), &["checkout", "--detach", &sha]);
        assert!(current_branch(repo.path()).is_err());
    }

    #[test]
    fn non_repo_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_git_repo(dir.path()));
        assert!(capture_head_sha(dir.path()).is_err());
    }
}
