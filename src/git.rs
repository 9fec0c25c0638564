//! Git integration: repo context discovery, branch lifecycle, diff
//! stats, and pull request creation.
//!
//! The engine depends only on the [`GitAdapter`] trait; [`GitCli`]
//! implements it by shelling out to `git` (and `gh` for PR creation).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::{GantryError, Result};

/// Where a workflow's repository lives and how it is addressed remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoContext {
    pub path: PathBuf,
    pub remote: String,
    pub remote_url: String,
    pub owner: String,
    pub name: String,
}

/// Per-file diff stat between two refs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub path: String,
    pub additions: u32,
    pub deletions: u32,
}

/// A created (or persisted) pull request reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
    pub state: String,
}

#[derive(Debug, Clone, Default)]
pub struct CreatePrArgs {
    pub owner: String,
    pub repo: String,
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
    pub draft: bool,
    pub labels: Vec<String>,
    pub assignees: Vec<String>,
    pub linked_issues: Vec<u64>,
}

/// Behavioral contract the engine drives the repository through.
#[async_trait]
pub trait GitAdapter: Send + Sync {
    /// Resolve the repository containing `cwd`, including a parseable
    /// `origin` remote. Fails outside a repo or without one.
    async fn resolve_repo_context(&self, cwd: &Path) -> Result<RepoContext>;

    async fn current_branch(&self, repo: &Path) -> Result<String>;

    /// Short SHAs of `base..head`, newest first. Empty when `head` does
    /// not exist yet.
    async fn commit_log(&self, repo: &Path, base: &str, head: &str) -> Result<Vec<String>>;

    async fn diff_stat(&self, repo: &Path, base: &str, head: &str) -> Result<Vec<FileChange>>;

    async fn push_branch(&self, repo: &Path, branch: &str) -> Result<()>;

    async fn create_pr(&self, args: &CreatePrArgs) -> Result<PullRequest>;
}

/// `git` / `gh` subprocess implementation.
pub struct GitCli;

impl GitCli {
    async fn run_git(&self, repo: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(repo)
            .output()
            .await
            .map_err(|e| GantryError::Git(format!("failed to run git {args:?}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GantryError::Git(format!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl GitAdapter for GitCli {
    async fn resolve_repo_context(&self, cwd: &Path) -> Result<RepoContext> {
        let toplevel = self
            .run_git(cwd, &["rev-parse", "--show-toplevel"])
            .await
            .map_err(|_| GantryError::Git(format!("{} is not inside a git repository", cwd.display())))?;
        let path = PathBuf::from(toplevel.trim());

        let remote_url = self
            .run_git(&path, &["remote", "get-url", "origin"])
            .await
            .map_err(|_| GantryError::Git("repository has no origin remote".into()))?;
        let remote_url = remote_url.trim().to_string();

        let (owner, name) = parse_remote_url(&remote_url).ok_or_else(|| {
            GantryError::Git(format!("cannot parse owner/name from remote url {remote_url}"))
        })?;

        Ok(RepoContext {
            path,
            remote: "origin".to_string(),
            remote_url,
            owner,
            name,
        })
    }

    async fn current_branch(&self, repo: &Path) -> Result<String> {
        let branch = self
            .run_git(repo, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        Ok(branch.trim().to_string())
    }

    async fn commit_log(&self, repo: &Path, base: &str, head: &str) -> Result<Vec<String>> {
        // A work branch that has no commits yet is not an error.
        if self
            .run_git(repo, &["rev-parse", "--verify", "--quiet", head])
            .await
            .is_err()
        {
            return Ok(Vec::new());
        }

        let range = format!("{base}..{head}");
        let output = self
            .run_git(repo, &["log", "--format=%h", &range])
            .await?;
        Ok(output.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }

    async fn diff_stat(&self, repo: &Path, base: &str, head: &str) -> Result<Vec<FileChange>> {
        if self
            .run_git(repo, &["rev-parse", "--verify", "--quiet", head])
            .await
            .is_err()
        {
            return Ok(Vec::new());
        }

        let range = format!("{base}...{head}");
        let output = self.run_git(repo, &["diff", "--numstat", &range]).await?;
        Ok(parse_numstat(&output))
    }

    async fn push_branch(&self, repo: &Path, branch: &str) -> Result<()> {
        self.run_git(repo, &["push", "--set-upstream", "origin", branch])
            .await?;
        tracing::info!(branch, "pushed branch to origin");
        Ok(())
    }

    async fn create_pr(&self, args: &CreatePrArgs) -> Result<PullRequest> {
        let repo_slug = format!("{}/{}", args.owner, args.repo);
        let mut gh_args: Vec<String> = vec![
            "pr".into(),
            "create".into(),
            "--repo".into(),
            repo_slug,
            "--title".into(),
            args.title.clone(),
            "--body".into(),
            args.body.clone(),
            "--head".into(),
            args.head.clone(),
            "--base".into(),
            args.base.clone(),
        ];
        if args.draft {
            gh_args.push("--draft".into());
        }
        for label in &args.labels {
            gh_args.push("--label".into());
            gh_args.push(label.clone());
        }
        for assignee in &args.assignees {
            gh_args.push("--assignee".into());
            gh_args.push(assignee.clone());
        }

        let output = Command::new("gh")
            .args(&gh_args)
            .output()
            .await
            .map_err(|e| GantryError::Git(format!("failed to run gh pr create: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GantryError::Git(format!("gh pr create failed: {}", stderr.trim())));
        }

        // gh prints the PR URL on success.
        let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let number = url
            .rsplit('/')
            .next()
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(|| GantryError::Git(format!("unexpected gh output: {url}")))?;

        Ok(PullRequest {
            number,
            url,
            state: "open".to_string(),
        })
    }
}

/// Parse `owner` and `name` out of ssh (`git@host:owner/name.git`) and
/// https (`https://host/owner/name.git`) remote URLs.
fn parse_remote_url(remote_url: &str) -> Option<(String, String)> {
    // ssh form has no scheme; the colon separates user@host from path.
    let ssh_path = remote_url.split_once(':').and_then(|(user_host, rest)| {
        (user_host.contains('@') && !user_host.contains("//")).then(|| rest.to_string())
    });
    let path = match ssh_path {
        Some(path) => path,
        None => {
            let parsed = url::Url::parse(remote_url).ok()?;
            parsed.path().trim_start_matches('/').to_string()
        }
    };

    let path = path.trim_end_matches('/').trim_end_matches(".git");
    let (owner, name) = path.rsplit_once('/')?;
    let owner = owner.rsplit('/').next().unwrap_or(owner);
    if owner.is_empty() || name.is_empty() {
        return None;
    }
    Some((owner.to_string(), name.to_string()))
}

fn parse_numstat(output: &str) -> Vec<FileChange> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split('\t');
            let additions = parts.next()?.trim();
            let deletions = parts.next()?.trim();
            let path = parts.next()?.trim();
            if path.is_empty() {
                return None;
            }
            Some(FileChange {
                path: path.to_string(),
                // Binary files report "-"; count them as zero.
                additions: additions.parse().unwrap_or(0),
                deletions: deletions.parse().unwrap_or(0),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ssh_remote() {
        assert_eq!(
            parse_remote_url("git@github.com:acme/widgets.git"),
            Some(("acme".into(), "widgets".into()))
        );
    }

    #[test]
    fn parses_https_remote() {
        assert_eq!(
            parse_remote_url("https://github.com/acme/widgets.git"),
            Some(("acme".into(), "widgets".into()))
        );
        assert_eq!(
            parse_remote_url("https://github.com/acme/widgets"),
            Some(("acme".into(), "widgets".into()))
        );
    }

    #[test]
    fn rejects_unparseable_remotes() {
        assert_eq!(parse_remote_url("not-a-remote"), None);
        assert_eq!(parse_remote_url("https://github.com/"), None);
    }

    #[test]
    fn parses_numstat_output() {
        let output = "12\t3\tsrc/lib.rs\n0\t7\tREADME.md\n-\t-\tassets/logo.png\n";
        let changes = parse_numstat(output);
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0], FileChange { path: "src/lib.rs".into(), additions: 12, deletions: 3 });
        assert_eq!(changes[2].additions, 0);
        assert_eq!(changes[2].deletions, 0);
    }

    #[test]
    fn numstat_ignores_blank_lines() {
        assert!(parse_numstat("\n\n").is_empty());
    }
}
