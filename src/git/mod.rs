//! Source control access. Network operations shell out to the `git` CLI;
//! local ref lookups go through libgit2.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Shallow, single-branch clone into `dest`, replacing anything there.
    async fn clone_repo(&self, url: &str, branch: &str, dest: &Path) -> Result<()>;
    /// Fetch `branch` and hard-reset the working tree to its tip. Returns
    /// the new HEAD commit hash.
    async fn pull(&self, repo: &Path, branch: &str) -> Result<String>;
    async fn head_commit(&self, repo: &Path) -> Result<String>;
    /// Fetch `branch` without touching the working tree and return the
    /// remote tip's commit hash.
    async fn remote_commit(&self, repo: &Path, branch: &str) -> Result<String>;
    async fn remove_tree(&self, path: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct GitCli;

impl GitCli {
    pub fn new() -> Self {
        Self
    }

    /// Whether a `git` binary is on PATH.
    pub async fn is_available(&self) -> bool {
        Command::new("git")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn run(&self, cwd: Option<&Path>, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            // Never block on a credential prompt
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to execute git {}", args[0]))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git {} failed: {}", args[0], stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn read_commit(repo: PathBuf, spec: Vec<String>) -> Result<String> {
    let repo = git2::Repository::open(&repo)
        .with_context(|| format!("Failed to open repository at {}", repo.display()))?;
    let mut last_err = None;
    for candidate in &spec {
        match repo
            .revparse_single(candidate)
            .and_then(|obj| obj.peel_to_commit())
        {
            Ok(commit) => return Ok(commit.id().to_string()),
            Err(e) => last_err = Some(e),
        }
    }
    match last_err {
        Some(e) => Err(anyhow::Error::new(e).context(format!("Failed to resolve {}", spec.join(" or ")))),
        None => anyhow::bail!("No revision given"),
    }
}

async fn resolve(repo: &Path, spec: &[&str]) -> Result<String> {
    let repo = repo.to_path_buf();
    let spec = spec.iter().map(|s| s.to_string()).collect();
    tokio::task::spawn_blocking(move || read_commit(repo, spec))
        .await
        .context("Commit lookup panicked")?
}

#[async_trait]
impl SourceControl for GitCli {
    async fn clone_repo(&self, url: &str, branch: &str, dest: &Path) -> Result<()> {
        self.remove_tree(dest).await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let dest_str = dest.to_string_lossy();
        self.run(
            None,
            &[
                "clone",
                "--depth",
                "1",
                "--single-branch",
                "--branch",
                branch,
                url,
                &dest_str,
            ],
        )
        .await?;
        Ok(())
    }

    async fn pull(&self, repo: &Path, branch: &str) -> Result<String> {
        self.run(Some(repo), &["fetch", "origin", branch]).await?;
        let target = format!("origin/{}", branch);
        self.run(Some(repo), &["reset", "--hard", &target]).await?;
        self.head_commit(repo).await
    }

    async fn head_commit(&self, repo: &Path) -> Result<String> {
        resolve(repo, &["HEAD"]).await
    }

    async fn remote_commit(&self, repo: &Path, branch: &str) -> Result<String> {
        self.run(Some(repo), &["fetch", "origin", branch]).await?;
        let tracking = format!("origin/{}", branch);
        resolve(repo, &[tracking.as_str(), "FETCH_HEAD"]).await
    }

    async fn remove_tree(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit_file(repo: &git2::Repository, name: &str, contents: &str) -> String {
        let root = repo.workdir().unwrap().to_path_buf();
        std::fs::write(root.join(name), contents).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(name)).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = git2::Signature::now("test", "test@example.com").unwrap();
        let parents: Vec<git2::Commit> = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .into_iter()
            .collect();
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, "update", &tree, &parent_refs)
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_head_commit_reads_repository() {
        let dir = tempfile::TempDir::new().unwrap();
        let repo = git2::Repository::init(dir.path()).unwrap();
        let first = commit_file(&repo, "Dockerfile", "FROM scratch");

        let git = GitCli::new();
        assert_eq!(git.head_commit(dir.path()).await.unwrap(), first);

        let second = commit_file(&repo, "README", "hi");
        assert_eq!(git.head_commit(dir.path()).await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_head_commit_errors_outside_repository() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(GitCli::new().head_commit(dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_tree_tolerates_missing_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let tree = dir.path().join("repos/app");
        std::fs::create_dir_all(tree.join("src")).unwrap();

        let git = GitCli::new();
        git.remove_tree(&tree).await.unwrap();
        assert!(!tree.exists());
        git.remove_tree(&tree).await.unwrap();
    }

    #[tokio::test]
    async fn test_clone_pull_and_remote_commit() {
        let git = GitCli::new();
        if !git.is_available().await {
            return;
        }

        let dir = tempfile::TempDir::new().unwrap();
        let origin_path = dir.path().join("origin");
        let origin = git2::Repository::init(&origin_path).unwrap();
        let first = commit_file(&origin, "Dockerfile", "FROM scratch");
        let branch = origin.head().unwrap().shorthand().unwrap().to_string();

        let url = format!("file://{}", origin_path.display());
        let clone = dir.path().join("repos/app");
        git.clone_repo(&url, &branch, &clone).await.unwrap();
        assert!(clone.join("Dockerfile").is_file());
        assert_eq!(git.head_commit(&clone).await.unwrap(), first);

        let second = commit_file(&origin, "Dockerfile", "FROM alpine");
        assert_eq!(git.remote_commit(&clone, &branch).await.unwrap(), second);
        assert_eq!(git.head_commit(&clone).await.unwrap(), first);

        assert_eq!(git.pull(&clone, &branch).await.unwrap(), second);
        assert_eq!(
            std::fs::read_to_string(clone.join("Dockerfile")).unwrap(),
            "FROM alpine"
        );
    }
}
