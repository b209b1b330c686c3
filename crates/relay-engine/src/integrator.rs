//! The integration seam of the merge queue.
//!
//! [`Integrator`] is what the queue drives for each entry: rebase, test,
//! fast-forward, delete. [`GitIntegrator`] does this with the `git` CLI and a
//! shell test command.

use std::path::PathBuf;
use std::process::Output;

use async_trait::async_trait;
use relay_types::{RelayError, Result};
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebaseOutcome {
    Clean,
    Conflict(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOutcome {
    pub passed: bool,
    pub summary: String,
}

#[async_trait]
pub trait Integrator: Send + Sync {
    /// Rebase `branch` onto `onto`, leaving the repository clean on conflict.
    async fn rebase(&self, branch: &str, onto: &str) -> Result<RebaseOutcome>;
    /// Run the test suite against `branch`.
    async fn run_tests(&self, branch: &str) -> Result<TestOutcome>;
    /// Advance `onto` to `branch`. Only fast-forwards are allowed.
    async fn fast_forward(&self, branch: &str, onto: &str) -> Result<()>;
    async fn delete_branch(&self, branch: &str) -> Result<()>;
}

/// Lines of test output kept in a failure summary.
const SUMMARY_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct GitIntegrator {
    repo_root: PathBuf,
    test_command: Option<String>,
}

impl GitIntegrator {
    pub fn new(repo_root: impl Into<PathBuf>, test_command: Option<String>) -> Self {
        Self {
            repo_root: repo_root.into(),
            test_command,
        }
    }

    async fn git(&self, args: &[&str]) -> Result<Output> {
        tracing::debug!(repo = %self.repo_root.display(), ?args, "git");
        Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .await
            .map_err(|e| RelayError::Git {
                command: args.join(" "),
                message: format!("failed to spawn git: {e}"),
            })
    }

    async fn git_ok(&self, args: &[&str]) -> Result<Output> {
        let output = self.git(args).await?;
        if !output.status.success() {
            return Err(RelayError::Git {
                command: args.join(" "),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    async fn conflicting_files(&self) -> Result<Vec<String>> {
        let output = self.git(&["diff", "--name-only", "--diff-filter=U"]).await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[async_trait]
impl Integrator for GitIntegrator {
    async fn rebase(&self, branch: &str, onto: &str) -> Result<RebaseOutcome> {
        self.git_ok(&["checkout", "--quiet", branch]).await?;
        let output = self.git(&["rebase", onto]).await?;
        if output.status.success() {
            return Ok(RebaseOutcome::Clean);
        }

        let files = self.conflicting_files().await?;
        if let Err(e) = self.git_ok(&["rebase", "--abort"]).await {
            tracing::warn!(%branch, error = %e, "git rebase --abort failed");
        }
        if files.is_empty() {
            return Err(RelayError::Git {
                command: format!("rebase {onto}"),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        tracing::warn!(%branch, %onto, files = ?files, "Rebase conflict");
        Ok(RebaseOutcome::Conflict(files))
    }

    async fn run_tests(&self, branch: &str) -> Result<TestOutcome> {
        let Some(command) = self.test_command.as_deref() else {
            return Ok(TestOutcome {
                passed: true,
                summary: "no test command configured".into(),
            });
        };
        self.git_ok(&["checkout", "--quiet", branch]).await?;
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.repo_root)
            .output()
            .await?;
        let passed = output.status.success();
        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        tracing::info!(
            %branch,
            exit_code = output.status.code().unwrap_or(-1),
            passed,
            "Test command completed"
        );
        Ok(TestOutcome {
            passed,
            summary: tail(&text, SUMMARY_TAIL_LINES),
        })
    }

    async fn fast_forward(&self, branch: &str, onto: &str) -> Result<()> {
        self.git_ok(&["checkout", "--quiet", onto]).await?;
        self.git_ok(&["merge", "--ff-only", branch]).await?;
        Ok(())
    }

    async fn delete_branch(&self, branch: &str) -> Result<()> {
        self.git_ok(&["branch", "-d", branch]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn sh(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(status.status.success(), "git {args:?}: {}", String::from_utf8_lossy(&status.stderr));
    }

    fn commit(dir: &Path, file: &str, content: &str, message: &str) {
        std::fs::write(dir.join(file), content).unwrap();
        sh(dir, &["add", file]);
        sh(dir, &["commit", "--quiet", "-m", message]);
    }

    fn init_repo(dir: &Path) {
        sh(dir, &["init", "--quiet"]);
        sh(dir, &["config", "user.name", "Relay Test"]);
        sh(dir, &["config", "user.email", "relay@example.com"]);
        sh(dir, &["config", "commit.gpgsign", "false"]);
        sh(dir, &["checkout", "--quiet", "-b", "main"]);
        commit(dir, "README", "base\n", "base");
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail("a\nb\nc\nd", 2), "c\nd");
        assert_eq!(tail("a", 5), "a");
    }

    #[tokio::test]
    async fn clean_rebase_test_and_fast_forward() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path();
        init_repo(repo);
        sh(repo, &["checkout", "--quiet", "-b", "feature"]);
        commit(repo, "feature.txt", "feature\n", "feature");
        sh(repo, &["checkout", "--quiet", "main"]);
        commit(repo, "other.txt", "other\n", "other");

        let git = GitIntegrator::new(repo, Some("test -f feature.txt".into()));
        assert_eq!(git.rebase("feature", "main").await.unwrap(), RebaseOutcome::Clean);
        assert!(git.run_tests("feature").await.unwrap().passed);
        git.fast_forward("feature", "main").await.unwrap();
        git.delete_branch("feature").await.unwrap();
        assert!(repo.join("feature.txt").exists());
        assert!(repo.join("other.txt").exists());
    }

    #[tokio::test]
    async fn conflicting_rebase_is_aborted_and_reported() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path();
        init_repo(repo);
        sh(repo, &["checkout", "--quiet", "-b", "feature"]);
        commit(repo, "README", "feature version\n", "feature");
        sh(repo, &["checkout", "--quiet", "main"]);
        commit(repo, "README", "main version\n", "main");

        let git = GitIntegrator::new(repo, None);
        let outcome = git.rebase("feature", "main").await.unwrap();
        assert_eq!(outcome, RebaseOutcome::Conflict(vec!["README".to_string()]));
        assert!(!repo.join(".git/rebase-merge").exists());
        assert!(!repo.join(".git/rebase-apply").exists());
    }

    #[tokio::test]
    async fn failing_tests_are_reported_not_raised() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let git = GitIntegrator::new(dir.path(), Some("echo broken >&2; exit 3".into()));
        let outcome = git.run_tests("main").await.unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.summary, "broken");
    }
}
