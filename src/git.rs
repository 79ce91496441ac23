use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::process::Command;

/// Client for the git CLI, scoped to one repository.
///
/// Failures carry git's own stderr verbatim; this layer never paraphrases
/// the tool's diagnostics.
pub struct GitClient {
    git_path: String,
    repo_dir: PathBuf,
}

impl GitClient {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            git_path: "git".to_string(),
            repo_dir: repo_dir.into(),
        }
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.git_path)
            .args(args)
            .current_dir(&self.repo_dir)
            .output()
            .await
            .with_context(|| format!("failed to execute git {}", args.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            anyhow::bail!(
                "git {} failed:\n{}{}",
                args.join(" "),
                stdout.trim_end(),
                stderr.trim_end()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Remote URL identifying this repository. Falls back to the worktree
    /// root path for repositories without an origin remote.
    pub async fn remote_url(&self) -> Result<String> {
        if let Ok(url) = self.run(&["remote", "get-url", "origin"]).await {
            if !url.is_empty() {
                return Ok(url);
            }
        }
        self.run(&["rev-parse", "--show-toplevel"]).await
    }

    /// The repository's default branch (what agent branches diverge from).
    pub async fn default_branch(&self) -> Result<String> {
        if let Ok(head) = self
            .run(&["symbolic-ref", "refs/remotes/origin/HEAD", "--short"])
            .await
        {
            if let Some(branch) = head.strip_prefix("origin/") {
                return Ok(branch.to_string());
            }
        }
        // No origin HEAD; use whatever is checked out.
        self.current_branch().await
    }

    pub async fn current_branch(&self) -> Result<String> {
        self.run(&["rev-parse", "--abbrev-ref", "HEAD"]).await
    }

    /// Create a worktree at `path` on a new branch forked from `base`.
    pub async fn add_worktree(&self, path: &Path, branch: &str, base: &str) -> Result<()> {
        let path_str = path.to_string_lossy();
        self.run(&["worktree", "add", "-b", branch, path_str.as_ref(), base])
            .await?;
        Ok(())
    }

    pub async fn remove_worktree(&self, path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy();
        self.run(&["worktree", "remove", "--force", path_str.as_ref()]).await?;
        Ok(())
    }

    pub async fn delete_branch(&self, branch: &str) -> Result<()> {
        self.run(&["branch", "-D", branch]).await?;
        Ok(())
    }

    pub async fn merge_base(&self, a: &str, b: &str) -> Result<String> {
        self.run(&["merge-base", a, b]).await
    }

    /// Number of commits reachable from `to` but not from `from`.
    pub async fn count_commits(&self, from: &str, to: &str) -> Result<u64> {
        let range = format!("{from}..{to}");
        let count = self.run(&["rev-list", "--count", &range]).await?;
        count
            .parse()
            .with_context(|| format!("unexpected rev-list output {count:?}"))
    }

    /// Rebase the current branch onto `branch`. Conflict output comes back
    /// verbatim in the error.
    pub async fn rebase(&self, branch: &str) -> Result<String> {
        self.run(&["rebase", branch]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    fn git(dir: &Path, args: &[&str]) {
        let status = StdCommand::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", "test")
            .env("GIT_AUTHOR_EMAIL", "test@example.com")
            .env("GIT_COMMITTER_NAME", "test")
            .env("GIT_COMMITTER_EMAIL", "test@example.com")
            .output()
            .unwrap()
            .status;
        assert!(status.success(), "git {args:?} failed");
    }

    fn init_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        git(dir.path(), &["init"]);
        git(dir.path(), &["symbolic-ref", "HEAD", "refs/heads/main"]);
        std::fs::write(dir.path().join("README.md"), "hello\n").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-m", "initial"]);
        dir
    }

    #[tokio::test]
    async fn counts_zero_commits_for_identical_branches() {
        let dir = init_repo();
        git(dir.path(), &["branch", "agent-work"]);

        let client = GitClient::new(dir.path());
        let base = client.merge_base("HEAD", "agent-work").await.unwrap();
        assert_eq!(client.count_commits(&base, "agent-work").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn counts_commits_ahead_of_merge_base() {
        let dir = init_repo();
        git(dir.path(), &["checkout", "-b", "agent-work"]);
        std::fs::write(dir.path().join("change.txt"), "x\n").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-m", "agent change"]);
        git(dir.path(), &["checkout", "main"]);

        let client = GitClient::new(dir.path());
        let base = client.merge_base("HEAD", "agent-work").await.unwrap();
        assert_eq!(client.count_commits(&base, "agent-work").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn worktree_add_and_remove_round_trip() {
        let dir = init_repo();
        let client = GitClient::new(dir.path());
        let wt = dir.path().join("wt-agent");

        client.add_worktree(&wt, "agent-wt", "main").await.unwrap();
        assert!(wt.join("README.md").exists());

        client.remove_worktree(&wt).await.unwrap();
        client.delete_branch("agent-wt").await.unwrap();
        assert!(!wt.exists());
    }

    #[tokio::test]
    async fn failure_preserves_git_stderr() {
        let dir = init_repo();
        let client = GitClient::new(dir.path());
        let err = client.merge_base("HEAD", "no-such-branch").await.unwrap_err();
        assert!(err.to_string().contains("no-such-branch"));
    }
}
