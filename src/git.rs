//! Git operations for app repositories
//!
//! Shells out to the `git` CLI. Each app has one local working clone; every
//! deploy fetches from `origin`, hard-resets to the remote default branch and
//! snapshots the working tree (minus `.git`) into a fresh instance directory.

use crate::error::AppError;
use crate::status::GitCommit;
use chrono::{TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

/// Upper bound for operations that talk to the remote
const REMOTE_GIT_TIMEOUT: Duration = Duration::from_secs(300);

/// A local working clone of an app's repository
#[derive(Debug, Clone)]
pub struct GitRepo {
    dir: PathBuf,
}

impl GitRepo {
    /// Open an existing clone at `dir`, or clone `git_url` into it
    pub async fn clone_or_open(git_url: &str, dir: &Path) -> Result<Self, AppError> {
        if dir.join(".git").is_dir() {
            let repo = Self { dir: dir.to_path_buf() };
            // Always point origin at the requested URL, the old remote may
            // be stale
            repo.set_origin(git_url).await?;
            return Ok(repo);
        }

        if let Some(parent) = dir.parent() {
            std::fs::create_dir_all(parent).map_err(AppError::Io)?;
        }
        info!(url = %git_url, dir = %dir.display(), "Cloning app repository");
        run_git(
            None,
            &["clone", git_url, &dir.to_string_lossy()],
            REMOTE_GIT_TIMEOUT,
        )
        .await?;
        Ok(Self { dir: dir.to_path_buf() })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rewrite the `origin` remote URL; takes effect on the next fetch
    pub async fn set_origin(&self, url: &str) -> Result<(), AppError> {
        let set = run_git(Some(&self.dir), &["remote", "set-url", "origin", url], REMOTE_GIT_TIMEOUT).await;
        if set.is_err() {
            // No origin yet on this clone
            run_git(Some(&self.dir), &["remote", "add", "origin", url], REMOTE_GIT_TIMEOUT).await?;
        }
        Ok(())
    }

    /// Fetch from origin and hard-reset the working tree to the remote
    /// default branch
    pub async fn fetch_and_reset(&self) -> Result<(), AppError> {
        run_git(Some(&self.dir), &["fetch", "origin"], REMOTE_GIT_TIMEOUT).await?;

        for target in ["origin/HEAD", "origin/main", "origin/master"] {
            let exists = run_git(
                Some(&self.dir),
                &["rev-parse", "--verify", "--quiet", target],
                REMOTE_GIT_TIMEOUT,
            )
            .await
            .is_ok();
            if exists {
                run_git(Some(&self.dir), &["reset", "--hard", target], REMOTE_GIT_TIMEOUT).await?;
                return Ok(());
            }
        }
        Err(AppError::Git(format!(
            "no default branch found on origin for {}",
            self.dir.display()
        )))
    }

    /// Commit info for HEAD, or None when the repo has no commits yet
    pub async fn head_commit(&self) -> Option<GitCommit> {
        let out = run_git(
            Some(&self.dir),
            &["log", "-1", "--format=%H%x1f%ct%x1f%an%x1f%B"],
            REMOTE_GIT_TIMEOUT,
        )
        .await;

        let out = match out {
            Ok(out) => out,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Could not read HEAD commit");
                return None;
            }
        };

        let mut parts = out.splitn(4, '\u{1f}');
        let id = parts.next()?.trim().to_string();
        let epoch: i64 = parts.next()?.trim().parse().ok()?;
        let author = parts.next()?.trim().to_string();
        let message = parts.next()?.trim().to_string();
        let date = Utc.timestamp_opt(epoch, 0).single()?;
        Some(GitCommit {
            id,
            date,
            author,
            message,
        })
    }

    /// Copy the working tree into `dest`, excluding version-control metadata
    pub async fn snapshot_to(&self, dest: &Path) -> Result<(), AppError> {
        let src = self.dir.clone();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || copy_dir_without_git(&src, &dest))
            .await
            .map_err(|e| AppError::Git(format!("snapshot task failed: {}", e)))?
            .map_err(AppError::Io)
    }
}

fn copy_dir_without_git(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == ".git" {
            continue;
        }
        let from = entry.path();
        let to = dest.join(&name);
        if entry.file_type()?.is_dir() {
            copy_dir_without_git(&from, &to)?;
        } else {
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

/// Run a git command, returning trimmed stdout or the stderr as a Git error
async fn run_git(dir: Option<&Path>, args: &[&str], timeout: Duration) -> Result<String, AppError> {
    let mut cmd = Command::new("git");
    cmd.args(args).kill_on_drop(true);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| AppError::Git(format!("git {} timed out", args.join(" "))))?
        .map_err(|e| AppError::Git(format!("failed to run git {}: {}", args.join(" "), e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(AppError::Git(if stderr.is_empty() {
            format!("git {} failed", args.join(" "))
        } else {
            stderr
        }));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a one-commit repository to act as an app's origin
    async fn seed_origin(dir: &Path) {
        for args in [
            vec!["init"],
            vec!["symbolic-ref", "HEAD", "refs/heads/main"],
            vec!["config", "user.email", "dev@example.com"],
            vec!["config", "user.name", "Dev Eloper"],
        ] {
            run_git(Some(dir), &args, REMOTE_GIT_TIMEOUT).await.unwrap();
        }
        std::fs::write(dir.join("README.md"), "hello\n").unwrap();
        run_git(Some(dir), &["add", "."], REMOTE_GIT_TIMEOUT).await.unwrap();
        run_git(Some(dir), &["-c", "commit.gpgsign=false", "commit", "-m", "first commit"], REMOTE_GIT_TIMEOUT)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_clone_fetch_and_head() {
        let tmp = tempfile::tempdir().unwrap();
        let origin = tmp.path().join("origin");
        std::fs::create_dir_all(&origin).unwrap();
        seed_origin(&origin).await;

        let clone_dir = tmp.path().join("clone");
        let url = origin.to_string_lossy().to_string();
        let repo = GitRepo::clone_or_open(&url, &clone_dir).await.unwrap();

        repo.fetch_and_reset().await.unwrap();
        let head = repo.head_commit().await.unwrap();
        assert_eq!(head.author, "Dev Eloper");
        assert_eq!(head.message, "first commit");
        assert_eq!(head.id.len(), 40);

        // Reopening an existing clone must not re-clone
        let reopened = GitRepo::clone_or_open(&url, &clone_dir).await.unwrap();
        assert_eq!(reopened.dir(), repo.dir());
    }

    #[tokio::test]
    async fn test_clone_bad_url_is_a_git_error() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("clone");
        let err = GitRepo::clone_or_open("/no/such/repo-path", &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Git(_)));
    }

    #[tokio::test]
    async fn test_snapshot_excludes_git_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let origin = tmp.path().join("origin");
        std::fs::create_dir_all(&origin).unwrap();
        seed_origin(&origin).await;
        std::fs::create_dir_all(origin.join("src")).unwrap();
        std::fs::write(origin.join("src/app.js"), "// app\n").unwrap();

        let repo = GitRepo::clone_or_open(&origin.to_string_lossy(), &origin)
            .await
            .unwrap();
        let dest = tmp.path().join("snapshot");
        repo.snapshot_to(&dest).await.unwrap();

        assert!(dest.join("README.md").is_file());
        assert!(dest.join("src/app.js").is_file());
        assert!(!dest.join(".git").exists());
    }
}
