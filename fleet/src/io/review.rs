//! Review requests (pull requests) opened for surfaced and rescued work.
//!
//! [`ReviewRequests`] hides the hosting service. [`GhReviewRequests`] drives
//! the `gh` CLI from inside the repository; tests use a recording fake.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::io::process::run_command_with_timeout;

const SURFACE_TEMPLATE: &str = include_str!("templates/surface.md");
const RESCUE_TEMPLATE: &str = include_str!("templates/rescue.md");
const GH_OUTPUT_LIMIT: usize = 256 * 1024;

/// An open review request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRef {
    pub number: u64,
    pub title: String,
    #[serde(rename = "headRefName")]
    pub head: String,
}

/// Parameters for a new draft request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftRequest {
    pub head: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

/// Hosting-service operations the sweep and guardian need.
pub trait ReviewRequests: Send + Sync {
    /// Open requests whose head branch is `head`.
    fn find_open_by_head(&self, repo: &Path, head: &str) -> Result<Vec<ReviewRef>>;

    /// Open request with exactly this title, if any.
    fn find_open_by_title(&self, repo: &Path, title: &str) -> Result<Option<ReviewRef>>;

    /// Open requests whose head branch starts with `prefix`.
    fn list_open_with_head_prefix(&self, repo: &Path, prefix: &str) -> Result<Vec<ReviewRef>>;

    fn create_draft(&self, repo: &Path, request: &DraftRequest) -> Result<ReviewRef>;

    fn update_body(&self, repo: &Path, number: u64, body: &str) -> Result<()>;

    fn close(&self, repo: &Path, number: u64, comment: &str) -> Result<()>;
}

/// `gh pr ...` backed implementation.
#[derive(Debug, Clone)]
pub struct GhReviewRequests {
    timeout: Duration,
}

impl GhReviewRequests {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn gh(&self, repo: &Path, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("gh");
        cmd.args(args).current_dir(repo).env("GH_PROMPT_DISABLED", "1");
        let output = run_command_with_timeout(cmd, None, self.timeout, GH_OUTPUT_LIMIT)
            .with_context(|| format!("run gh {}", args.join(" ")))?;
        if output.timed_out {
            return Err(anyhow!("gh {} timed out", args.join(" ")));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "gh {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn list_open(&self, repo: &Path, extra: &[&str]) -> Result<Vec<ReviewRef>> {
        let mut args = vec![
            "pr",
            "list",
            "--state",
            "open",
            "--limit",
            "200",
            "--json",
            "number,title,headRefName",
        ];
        args.extend_from_slice(extra);
        let out = self.gh(repo, &args)?;
        serde_json::from_str(&out).context("parse gh pr list output")
    }
}

impl ReviewRequests for GhReviewRequests {
    fn find_open_by_head(&self, repo: &Path, head: &str) -> Result<Vec<ReviewRef>> {
        self.list_open(repo, &["--head", head])
    }

    fn find_open_by_title(&self, repo: &Path, title: &str) -> Result<Option<ReviewRef>> {
        let search = format!("in:title \"{title}\"");
        let found = self.list_open(repo, &["--search", &search])?;
        Ok(found.into_iter().find(|r| r.title == title))
    }

    fn list_open_with_head_prefix(&self, repo: &Path, prefix: &str) -> Result<Vec<ReviewRef>> {
        let all = self.list_open(repo, &[])?;
        Ok(all.into_iter().filter(|r| r.head.starts_with(prefix)).collect())
    }

    #[instrument(skip_all, fields(head = %request.head))]
    fn create_draft(&self, repo: &Path, request: &DraftRequest) -> Result<ReviewRef> {
        let out = self.gh(
            repo,
            &[
                "pr",
                "create",
                "--draft",
                "--head",
                &request.head,
                "--base",
                &request.base,
                "--title",
                &request.title,
                "--body",
                &request.body,
            ],
        )?;
        let url = out.trim();
        let number = url
            .rsplit('/')
            .next()
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| anyhow!("unexpected gh pr create output '{url}'"))?;
        info!(number, url, "review request created");
        Ok(ReviewRef {
            number,
            title: request.title.clone(),
            head: request.head.clone(),
        })
    }

    fn update_body(&self, repo: &Path, number: u64, body: &str) -> Result<()> {
        let number = number.to_string();
        self.gh(repo, &["pr", "edit", &number, "--body", body])?;
        debug!(number = %number, "review request updated");
        Ok(())
    }

    fn close(&self, repo: &Path, number: u64, comment: &str) -> Result<()> {
        let number = number.to_string();
        self.gh(repo, &["pr", "close", &number, "--comment", comment])?;
        info!(number = %number, "review request closed");
        Ok(())
    }
}

/// Request bodies rendered from the bundled templates.
pub struct ReviewBodies {
    env: Environment<'static>,
}

impl ReviewBodies {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("surface", SURFACE_TEMPLATE)
            .context("load surface template")?;
        env.add_template("rescue", RESCUE_TEMPLATE)
            .context("load rescue template")?;
        Ok(Self { env })
    }

    pub fn surface(&self, facts: &SurfaceContext<'_>) -> Result<String> {
        let template = self.env.get_template("surface")?;
        Ok(template.render(context! {
            repo => facts.repo,
            branch => facts.branch,
            worktree => facts.worktree,
            trunk => facts.trunk,
            commits_ahead => facts.commits_ahead,
            dirty => facts.dirty,
            host => facts.host,
        })?)
    }

    pub fn rescue(
        &self,
        repo: &str,
        host: &str,
        remote: &str,
        trunk: &str,
        branches: &[String],
    ) -> Result<String> {
        let template = self.env.get_template("rescue")?;
        Ok(template.render(context! {
            repo => repo,
            host => host,
            remote => remote,
            trunk => trunk,
            branches => branches,
        })?)
    }
}

/// Inputs for a surfaced-work request body.
#[derive(Debug, Clone)]
pub struct SurfaceContext<'a> {
    pub repo: &'a str,
    pub branch: &'a str,
    pub worktree: &'a str,
    pub trunk: &'a str,
    pub commits_ahead: u32,
    pub dirty: bool,
    pub host: &'a str,
}

/// Title of the single rolling rescue request for a host+repo pair.
pub fn rescue_title(host: &str, repo: &str) -> String {
    format!("fleet rescue: {host}/{repo}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_body_mentions_branch_and_commit_count() {
        let bodies = ReviewBodies::new().expect("templates");
        let body = bodies
            .surface(&SurfaceContext {
                repo: "app",
                branch: "feature/x",
                worktree: "/w/app/x",
                trunk: "main",
                commits_ahead: 2,
                dirty: true,
                host: "dev-1",
            })
            .expect("render");
        assert!(body.contains("`feature/x`"));
        assert!(body.contains("commits ahead of `main`: 2"));
        assert!(body.contains("uncommitted changes"));
    }

    #[test]
    fn rescue_body_lists_every_branch() {
        let bodies = ReviewBodies::new().expect("templates");
        let branches = vec![
            "rescue/dev-1/app/20260101_000000".to_string(),
            "rescue/dev-1/app/20260102_000000".to_string(),
        ];
        let body = bodies
            .rescue("app", "dev-1", "origin", "main", &branches)
            .expect("render");
        for branch in &branches {
            assert!(body.contains(branch.as_str()));
        }
        assert!(body.contains("origin/main"));
    }

    #[test]
    fn gh_list_output_parses() {
        let raw = r#"[{"number":12,"title":"t","headRefName":"rescue/h/r/1"}]"#;
        let parsed: Vec<ReviewRef> = serde_json::from_str(raw).expect("parse");
        assert_eq!(parsed[0].head, "rescue/h/r/1");
        assert_eq!(parsed[0].number, 12);
    }
}
