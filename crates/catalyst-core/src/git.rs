//! Git service (C10). A thin `std::process::Command`-based wrapper
//! around local git operations; remote publishing goes through the
//! `RemoteForge` trait so a concrete forge's API surface stays a
//! substitution point.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex, OnceLock};

/// Per-repo-path lock registry. Concurrent commits to the same project's
/// working tree would otherwise interleave `add`/`commit`; this keys a
/// lock per `repo_path` so unrelated projects never block each other.
fn repo_lock(repo_path: &str) -> Arc<Mutex<()>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<Mutex<()>>>>> = OnceLock::new();
    let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = registry.lock().unwrap();
    Arc::clone(map.entry(repo_path.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))))
}

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

pub struct Git {
    pub repo_path: String,
    pub author_name: String,
    pub author_email: String,
}

impl Git {
    pub fn new(repo_path: impl Into<String>, author_name: impl Into<String>, author_email: impl Into<String>) -> Self {
        Git {
            repo_path: repo_path.into(),
            author_name: author_name.into(),
            author_email: author_email.into(),
        }
    }

    pub fn branch_path(&self, branch: &str) -> String {
        let parent = Path::new(&self.repo_path).parent().unwrap_or(Path::new("/tmp"));
        parent.join("worktrees").join(branch).to_string_lossy().into_owned()
    }

    pub fn exec(&self, dir: &str, args: &[&str]) -> Result<ExecResult> {
        self.exec_env(dir, args, &[])
    }

    pub fn exec_env(&self, dir: &str, args: &[&str], env: &[(&str, &str)]) -> Result<ExecResult> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(dir);
        cmd.args(args);
        for (k, v) in env {
            cmd.env(k, v);
        }
        let output = cmd
            .output()
            .with_context(|| format!("failed to spawn git -C {dir} {}", args.join(" ")))?;
        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    pub fn init_repo(&self) -> Result<()> {
        if Path::new(&self.repo_path).join(".git").exists() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.repo_path)?;
        let result = self.exec(&self.repo_path, &["init"])?;
        if !result.success() {
            return Err(anyhow!("git init failed: {}", result.combined_output()));
        }
        self.set_author_config()?;
        Ok(())
    }

    pub fn set_author_config(&self) -> Result<()> {
        self.exec(&self.repo_path, &["config", "user.name", &self.author_name])?;
        self.exec(&self.repo_path, &["config", "user.email", &self.author_email])?;
        Ok(())
    }

    pub fn create_branch(&self, branch: &str) -> Result<()> {
        let result = self.exec(&self.repo_path, &["checkout", "-B", branch])?;
        if !result.success() {
            return Err(anyhow!("git checkout -B {branch} failed: {}", result.combined_output()));
        }
        Ok(())
    }

    pub fn current_branch(&self) -> Result<String> {
        let result = self.exec(&self.repo_path, &["rev-parse", "--abbrev-ref", "HEAD"])?;
        if !result.success() {
            return Err(anyhow!("git rev-parse --abbrev-ref HEAD failed: {}", result.combined_output()));
        }
        Ok(result.stdout.trim().to_string())
    }

    pub fn rev_parse_head(&self) -> Result<String> {
        self.rev_parse("HEAD")
    }

    pub fn rev_parse(&self, refname: &str) -> Result<String> {
        let result = self.exec(&self.repo_path, &["rev-parse", refname])?;
        if !result.success() {
            return Err(anyhow!("git rev-parse {refname} failed: {}", result.combined_output()));
        }
        Ok(result.stdout.trim().to_string())
    }

    pub fn ls_files(&self) -> Result<Vec<String>> {
        let result = self.exec(&self.repo_path, &["ls-files"])?;
        if !result.success() {
            return Err(anyhow!("git ls-files failed: {}", result.combined_output()));
        }
        Ok(result.stdout.lines().map(str::to_string).collect())
    }

    pub fn status_clean(&self) -> Result<bool> {
        let result = self.exec(&self.repo_path, &["status", "--porcelain"])?;
        Ok(result.stdout.trim().is_empty())
    }

    pub fn diff_name_only(&self, base: &str) -> Result<Vec<String>> {
        let result = self.exec(&self.repo_path, &["diff", "--name-only", base])?;
        Ok(result.stdout.lines().map(str::to_string).collect())
    }

    pub fn log_oneline(&self, limit: u32) -> Result<Vec<String>> {
        let n = limit.to_string();
        let result = self.exec(&self.repo_path, &["log", "--oneline", "-n", &n])?;
        Ok(result.stdout.lines().map(str::to_string).collect())
    }

    /// Writes `files` into the working tree and commits them with a
    /// message carrying the agent trailer. Returns `Ok(None)` if the
    /// working tree was already clean (no-op commit avoided).
    pub fn commit_files(
        &self,
        files: &std::collections::HashMap<String, String>,
        message: &str,
        agent: &str,
    ) -> Result<Option<String>> {
        let lock = repo_lock(&self.repo_path);
        let _guard = lock.lock().unwrap();

        for (path, contents) in files {
            let full = Path::new(&self.repo_path).join(path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&full, contents)?;
        }

        let add = self.exec(&self.repo_path, &["add", "-A"])?;
        if !add.success() {
            return Err(anyhow!("git add -A failed: {}", add.combined_output()));
        }

        if self.status_clean()? {
            return Ok(None);
        }

        let full_message = format!("{message}\n\n[{agent}-agent]");
        let commit = self.exec(&self.repo_path, &["commit", "-m", &full_message])?;
        if !commit.success() {
            return Err(anyhow!("git commit failed: {}", commit.combined_output()));
        }
        Ok(Some(self.rev_parse_head()?))
    }

    pub fn push_branch(&self, remote: &str, branch: &str) -> Result<()> {
        let result = self.exec(&self.repo_path, &["push", remote, branch])?;
        if !result.success() {
            return Err(anyhow!("git push {remote} {branch} failed: {}", result.combined_output()));
        }
        Ok(())
    }

    pub fn ensure_remote(&self, name: &str, url: &str) -> Result<()> {
        let result = self.exec(&self.repo_path, &["remote", "add", name, url]);
        // Adding an existing remote is not fatal; surfaced only as a log
        // line by the caller.
        let _ = result;
        Ok(())
    }
}

/// Outcome of attempting to publish a branch remotely and open a PR.
/// Push/PR failures never fail the pipeline; the caller records
/// `remote=skipped` in the event payload instead.
#[derive(Debug, Clone)]
pub struct RemotePublishOutcome {
    pub pushed: bool,
    pub pr_url: Option<String>,
    pub skip_reason: Option<String>,
}

/// Substitution point a concrete forge client implements (GitHub,
/// GitLab, Gitea, ...); PR creation is the only operation this crate
/// needs from a forge.
#[async_trait]
pub trait RemoteForge: Send + Sync {
    async fn open_pr(&self, project: &str, branch: &str, title: &str, body: &str) -> Result<String>;
}

pub struct NoRemoteForge;

#[async_trait]
impl RemoteForge for NoRemoteForge {
    async fn open_pr(&self, _project: &str, _branch: &str, _title: &str, _body: &str) -> Result<String> {
        Err(anyhow!("no remote forge configured"))
    }
}

pub async fn publish_remote(
    git: &Git,
    forge: &dyn RemoteForge,
    git_mode: &str,
    project: &str,
    branch: &str,
    title: &str,
    body: &str,
) -> RemotePublishOutcome {
    if git_mode == "local" {
        return RemotePublishOutcome { pushed: false, pr_url: None, skip_reason: Some("git_mode=local".into()) };
    }
    if let Err(e) = git.push_branch("origin", branch) {
        return RemotePublishOutcome { pushed: false, pr_url: None, skip_reason: Some(e.to_string()) };
    }
    match forge.open_pr(project, branch, title, body).await {
        Ok(url) => RemotePublishOutcome { pushed: true, pr_url: Some(url), skip_reason: None },
        Err(e) => RemotePublishOutcome { pushed: true, pr_url: None, skip_reason: Some(e.to_string()) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn init_temp_repo() -> (tempfile::TempDir, Git) {
        let dir = tempfile::tempdir().unwrap();
        let git = Git::new(dir.path().to_string_lossy().to_string(), "tester", "tester@catalyst.local");
        git.init_repo().unwrap();
        (dir, git)
    }

    #[test]
    fn commit_files_creates_commit_with_trailer() {
        let (_dir, git) = init_temp_repo();
        let mut files = HashMap::new();
        files.insert("README.md".to_string(), "hello".to_string());
        let sha = git.commit_files(&files, "feat: add readme", "coder").unwrap();
        assert!(sha.is_some());
        let log = git.log_oneline(5).unwrap();
        assert!(!log.is_empty());
        assert!(git.status_clean().unwrap());
    }

    #[test]
    fn commit_files_is_noop_when_nothing_changed() {
        let (_dir, git) = init_temp_repo();
        let mut files = HashMap::new();
        files.insert("a.txt".to_string(), "x".to_string());
        git.commit_files(&files, "first", "coder").unwrap();
        let second = git.commit_files(&files, "second", "coder").unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn publish_remote_skips_in_local_mode() {
        let (_dir, git) = init_temp_repo();
        let outcome =
            publish_remote(&git, &NoRemoteForge, "local", "proj", "feature/x", "t", "b").await;
        assert!(!outcome.pushed);
        assert_eq!(outcome.skip_reason.as_deref(), Some("git_mode=local"));
    }
}
