use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::FleetConfig;
use crate::error::FleetError;
use crate::git::GitClient;
use crate::names;
use crate::ports;
use crate::state::{data_root, SessionFields, StateStore};
use crate::tmux::TmuxClient;

/// Window name for the optional dev server.
const SERVER_WINDOW: &str = "server";

/// Composes the registry, port allocator, discovery, and git worktrees into
/// spawn / kill / checkpoint workflows.
pub struct LifecycleManager {
    store: Arc<StateStore>,
    tmux: Arc<TmuxClient>,
    git: GitClient,
    config: FleetConfig,
    worktrees_root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub prompt: String,
    pub model: String,
    pub count: usize,
}

#[derive(Debug, Clone)]
pub struct SpawnedSession {
    pub session_id: String,
    pub agent_name: String,
    pub branch_name: String,
    pub worktree_path: PathBuf,
    /// 0 when the workload declares no dev command.
    pub port: u16,
}

/// Result of one checkpoint attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// The agent branch has no commits past the merge base.
    NothingToCheckpoint,
    /// The current branch was rebased onto the agent branch.
    Rebased { commits: u64 },
}

/// Ordered record of a best-effort teardown: each step is tried regardless of
/// earlier failures, and the report distinguishes a full cleanup from one
/// with remaining manual steps.
#[derive(Debug)]
pub struct CleanupReport {
    pub session_id: String,
    completed: Vec<String>,
    failures: Vec<(String, String)>,
}

impl CleanupReport {
    fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            completed: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn ok(&mut self, step: &str) {
        self.completed.push(step.to_string());
    }

    fn fail(&mut self, step: &str, err: impl fmt::Display) {
        self.failures.push((step.to_string(), format!("{err:#}")));
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn completed(&self) -> &[String] {
        &self.completed
    }

    pub fn failures(&self) -> &[(String, String)] {
        &self.failures
    }
}

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            write!(f, "{}: fully cleaned up", self.session_id)
        } else {
            write!(
                f,
                "{}: cleaned up with remaining manual steps:",
                self.session_id
            )?;
            for (step, err) in &self.failures {
                write!(f, "\n  {step}: {err}")?;
            }
            Ok(())
        }
    }
}

#[derive(Debug)]
pub struct KillAllReport {
    pub killed: usize,
    pub reports: Vec<CleanupReport>,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<StateStore>,
        tmux: Arc<TmuxClient>,
        git: GitClient,
        config: FleetConfig,
    ) -> Self {
        Self {
            store,
            tmux,
            git,
            config,
            worktrees_root: data_root().join("worktrees"),
        }
    }

    // ── Spawn ────────────────────────────────────────────────

    /// Spawn `count` workers. Ports claimed within the batch are threaded
    /// through `claimed_ports` so concurrent spawns never collide before any
    /// dev server starts listening.
    pub async fn spawn(&self, request: &SpawnRequest) -> Result<Vec<SpawnedSession>> {
        let remote = self.git.remote_url().await?;
        let base = self.git.default_branch().await?;
        let project = project_slug(self.git.repo_dir());

        let records = self.store.list_all().await?;
        let mut names_in_use: HashSet<String> = records
            .keys()
            .filter_map(|id| agent_name_of(id))
            .map(str::to_string)
            .collect();
        let mut claimed_ports: HashSet<u16> =
            records.values().map(|r| r.port).filter(|p| *p != 0).collect();

        let mut spawned = Vec::new();
        for _ in 0..request.count.max(1) {
            let session = self
                .spawn_one(
                    &remote,
                    &base,
                    &project,
                    request,
                    &mut names_in_use,
                    &mut claimed_ports,
                )
                .await?;
            spawned.push(session);
        }
        Ok(spawned)
    }

    async fn spawn_one(
        &self,
        remote: &str,
        base: &str,
        project: &str,
        request: &SpawnRequest,
        names_in_use: &mut HashSet<String>,
        claimed_ports: &mut HashSet<u16>,
    ) -> Result<SpawnedSession> {
        let agent_name = names::pick_agent_name(names_in_use);
        names_in_use.insert(agent_name.clone());
        let session_id = format!("agent-{project}-{}-{agent_name}", names::session_hash());

        let port = match self.config.dev_command {
            Some(_) => {
                let (start, end) = self.config.port_range()?;
                let port = ports::find_available_port(start, end, claimed_ports)?;
                claimed_ports.insert(port);
                port
            }
            None => 0,
        };

        let worktree_path = self.worktrees_root.join(&session_id);
        tokio::fs::create_dir_all(&self.worktrees_root)
            .await
            .with_context(|| format!("failed to create {}", self.worktrees_root.display()))?;
        self.git
            .add_worktree(&worktree_path, &session_id, base)
            .await?;

        // From here on the worktree exists. A launch failure surfaces the
        // error and leaves the worktree in place for inspection; destroying a
        // partially-succeeded workspace risks losing diagnostic state.
        self.tmux
            .create_session(&session_id, &worktree_path)
            .await
            .with_context(|| {
                format!(
                    "session launch failed; worktree left at {} for inspection",
                    worktree_path.display()
                )
            })?;

        let agent_cmd = build_agent_command(&request.model, &request.prompt);
        self.tmux
            .send_keys(&session_id, &[&agent_cmd, "Enter"])
            .await
            .with_context(|| {
                format!(
                    "failed to start agent; worktree left at {} for inspection",
                    worktree_path.display()
                )
            })?;

        if let Some(dev_command) = &self.config.dev_command {
            let cmd = dev_command.replace("$PORT", &port.to_string());
            if let Err(e) = self
                .tmux
                .new_window(&session_id, SERVER_WINDOW, &worktree_path, &cmd)
                .await
            {
                warn!(session_id, "dev server window failed to start: {e:#}");
            }
        }

        self.store
            .save(
                &session_id,
                SessionFields {
                    repository_remote: remote.to_string(),
                    base_branch: base.to_string(),
                    branch_name: session_id.clone(),
                    prompt: request.prompt.clone(),
                    worktree_path: worktree_path.to_string_lossy().to_string(),
                    port,
                    model: request.model.clone(),
                },
            )
            .await?;

        info!(session_id, agent_name, port, "spawned worker");
        Ok(SpawnedSession {
            branch_name: session_id.clone(),
            session_id,
            agent_name,
            worktree_path,
            port,
        })
    }

    // ── Kill ─────────────────────────────────────────────────

    /// Tear down one worker, resolved by exact id or `-<agentName>` suffix.
    pub async fn kill(&self, target: &str) -> Result<CleanupReport> {
        let session_id = self.resolve_target(target).await?;
        Ok(self.teardown(&session_id).await)
    }

    /// Tear down every active worker for this repository, continuing past
    /// individual failures.
    pub async fn kill_all(&self) -> Result<KillAllReport> {
        let remote = self.git.remote_url().await?;
        let active = self
            .store
            .list_active_for_repository(&self.tmux, &remote)
            .await?;

        let mut reports = Vec::new();
        for session_id in active {
            let report = self.teardown(&session_id).await;
            if !report.is_clean() {
                warn!(%report, "partial teardown");
            }
            reports.push(report);
        }
        let killed = reports.iter().filter(|r| r.is_clean()).count();
        Ok(KillAllReport { killed, reports })
    }

    async fn resolve_target(&self, target: &str) -> Result<String> {
        let remote = self.git.remote_url().await?;
        let active = self
            .store
            .list_active_for_repository(&self.tmux, &remote)
            .await?;
        let mut candidates = match_target(active.iter(), target);

        if candidates.is_empty() {
            // The session may already be dead in tmux; fall back to every
            // record for this repository so stale entries stay killable.
            let records = self.store.list_all().await?;
            let repo_ids: Vec<String> = records
                .iter()
                .filter(|(_, r)| r.repository_remote == remote)
                .map(|(id, _)| id.clone())
                .collect();
            candidates = match_target(repo_ids.iter(), target);
        }

        match candidates.len() {
            0 => Err(FleetError::Input(format!("no session matches {target:?}")).into()),
            1 => Ok(candidates.remove(0)),
            _ => Err(FleetError::Input(format!(
                "ambiguous target {target:?}: matches {}",
                candidates.join(", ")
            ))
            .into()),
        }
    }

    /// Ordered best-effort teardown. The registry entry goes last so a crash
    /// mid-teardown leaves the record as evidence of incomplete cleanup.
    async fn teardown(&self, session_id: &str) -> CleanupReport {
        let mut report = CleanupReport::new(session_id);
        let record = match self.store.get(session_id).await {
            Ok(record) => record,
            Err(e) => {
                report.fail("read registry entry", e);
                None
            }
        };

        // 1. Multiplexer session. Absence is not an error.
        if self.tmux.has_session(session_id).await {
            match self.tmux.kill_session(session_id).await {
                Ok(()) => report.ok("tmux session killed"),
                Err(e) => report.fail("kill tmux session", e),
            }
        } else {
            report.ok("tmux session already gone");
        }

        // 2. Worktree and branch.
        if let Some(record) = &record {
            let worktree = PathBuf::from(&record.worktree_path);
            if worktree.exists() {
                match self.git.remove_worktree(&worktree).await {
                    Ok(()) => report.ok("worktree removed"),
                    Err(e) => {
                        report.fail("remove worktree", e);
                        // git refused; remove the directory directly.
                        match tokio::fs::remove_dir_all(&worktree).await {
                            Ok(()) => report.ok("worktree directory force-removed"),
                            Err(e) => report.fail("force-remove worktree directory", e),
                        }
                    }
                }
            } else {
                report.ok("worktree already gone");
            }
            match self.git.delete_branch(&record.branch_name).await {
                Ok(()) => report.ok("branch deleted"),
                Err(e) => report.fail("delete branch", e),
            }
        } else {
            // No record to consult; fall back to the conventional location.
            let fallback = self.worktrees_root.join(session_id);
            if fallback.exists() {
                match tokio::fs::remove_dir_all(&fallback).await {
                    Ok(()) => report.ok("worktree directory removed"),
                    Err(e) => report.fail("remove worktree directory", e),
                }
            }
        }

        // 3. Registry entry last.
        match self.store.remove(session_id).await {
            Ok(()) => report.ok("registry entry removed"),
            Err(e) => report.fail("remove registry entry", e),
        }

        info!(session_id, clean = report.is_clean(), "teardown finished");
        report
    }

    // ── Checkpoint ───────────────────────────────────────────

    /// Rebase the current branch onto an agent's branch if it has new
    /// commits. Conflicts come back verbatim from git.
    pub async fn checkpoint(&self, agent: &str) -> Result<CheckpointOutcome> {
        let remote = self.git.remote_url().await?;
        let records = self.store.list_all().await?;
        let repo_ids: Vec<String> = records
            .iter()
            .filter(|(_, r)| r.repository_remote == remote)
            .map(|(id, _)| id.clone())
            .collect();

        let mut candidates = match_target(repo_ids.iter(), agent);
        let session_id = match candidates.len() {
            0 => {
                return Err(FleetError::Input(format!("no session matches {agent:?}")).into());
            }
            1 => candidates.remove(0),
            _ => {
                return Err(FleetError::Input(format!(
                    "ambiguous target {agent:?}: matches {}",
                    candidates.join(", ")
                ))
                .into());
            }
        };
        let branch = &records[&session_id].branch_name;

        let base = self.git.merge_base("HEAD", branch).await?;
        let commits = self.git.count_commits(&base, branch).await?;
        if commits == 0 {
            return Ok(CheckpointOutcome::NothingToCheckpoint);
        }

        self.git.rebase(branch).await?;
        info!(session_id, commits, "checkpointed agent work");
        Ok(CheckpointOutcome::Rebased { commits })
    }
}

/// Match a kill/checkpoint target against session identifiers: an exact id
/// wins; otherwise ids ending in `-<target>` match. Ambiguity is the
/// caller's problem to report, never silently resolved.
fn match_target<'a>(ids: impl Iterator<Item = &'a String>, target: &str) -> Vec<String> {
    let suffix = format!("-{target}");
    let mut suffix_matches = Vec::new();
    for id in ids {
        if id == target {
            return vec![id.clone()];
        }
        if id.ends_with(&suffix) {
            suffix_matches.push(id.clone());
        }
    }
    suffix_matches
}

/// Final segment of a session identifier.
fn agent_name_of(session_id: &str) -> Option<&str> {
    session_id.rsplit('-').next()
}

/// Directory name of the repository, sanitized for use in session names.
fn project_slug(repo_dir: &Path) -> String {
    let name = repo_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "repo".to_string());
    let slug: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    slug.trim_matches('-').to_string()
}

fn build_agent_command(model: &str, prompt: &str) -> String {
    format!("{model} {}", shell_single_quote(prompt))
}

fn shell_single_quote(value: &str) -> String {
    let escaped = value.replace('\'', "'\"'\"'");
    format!("'{escaped}'")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn exact_id_match_wins() {
        let ids = ids(&["agent-proj-abc123-sam", "agent-proj-def456-mia"]);
        let matched = match_target(ids.iter(), "agent-proj-abc123-sam");
        assert_eq!(matched, vec!["agent-proj-abc123-sam"]);
    }

    #[test]
    fn unique_suffix_matches() {
        let ids = ids(&["agent-proj-abc123-sam", "agent-proj-def456-mia"]);
        assert_eq!(match_target(ids.iter(), "mia"), vec!["agent-proj-def456-mia"]);
    }

    #[test]
    fn ambiguous_suffix_returns_all_candidates() {
        let ids = ids(&["agent-proj-abc123-sam", "agent-other-def456-sam"]);
        let matched = match_target(ids.iter(), "sam");
        assert_eq!(matched.len(), 2);
    }

    #[test]
    fn absent_target_matches_nothing() {
        let ids = ids(&["agent-proj-abc123-sam"]);
        assert!(match_target(ids.iter(), "leo").is_empty());
    }

    #[test]
    fn cleanup_report_keeps_later_steps_after_a_failure() {
        let mut report = CleanupReport::new("agent-proj-abc123-sam");
        report.fail("kill tmux session", "no server running");
        report.ok("worktree removed");
        report.ok("registry entry removed");

        assert!(!report.is_clean());
        assert_eq!(report.completed().len(), 2);
        assert_eq!(report.failures().len(), 1);
        let text = report.to_string();
        assert!(text.contains("remaining manual steps"));
        assert!(text.contains("no server running"));
    }

    #[test]
    fn clean_report_says_so() {
        let mut report = CleanupReport::new("agent-proj-abc123-sam");
        report.ok("tmux session killed");
        assert!(report.is_clean());
        assert!(report.to_string().contains("fully cleaned up"));
    }

    #[test]
    fn project_slug_sanitizes() {
        assert_eq!(project_slug(Path::new("/home/me/My Proj")), "my-proj");
        assert_eq!(project_slug(Path::new("/srv/web.app")), "web-app");
    }

    #[test]
    fn agent_command_quotes_prompt() {
        assert_eq!(
            build_agent_command("claude", "fix the login bug"),
            "claude 'fix the login bug'"
        );
        assert_eq!(
            build_agent_command("claude", "don't break"),
            "claude 'don'\"'\"'t break'"
        );
    }

    #[test]
    fn agent_name_extraction() {
        assert_eq!(agent_name_of("agent-proj-abc123-sam"), Some("sam"));
    }

    mod teardown {
        use super::super::*;
        use std::os::unix::fs::PermissionsExt;
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

        /// A tmux stand-in that reports the session as present but refuses
        /// to kill it.
        fn tmux_stub_failing_kill(dir: &Path) -> String {
            let path = dir.join("tmux-stub");
            std::fs::write(
                &path,
                "#!/bin/sh\n\
                 case \"$1\" in\n\
                   has-session) exit 0 ;;\n\
                   kill-session) echo 'simulated kill failure' >&2; exit 1 ;;\n\
                 esac\n\
                 exit 0\n",
            )
            .unwrap();
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path.to_string_lossy().to_string()
        }

        #[tokio::test]
        async fn continues_past_multiplexer_kill_failure() {
            let repo = init_repo();
            let stub_dir = TempDir::new().unwrap();
            let state_dir = TempDir::new().unwrap();
            let session_id = "agent-proj-abc123-sam";

            let git_client = GitClient::new(repo.path());
            let worktree = repo.path().join(format!("wt-{session_id}"));
            git_client
                .add_worktree(&worktree, session_id, "main")
                .await
                .unwrap();

            let store = Arc::new(StateStore::new(state_dir.path().join("state.json")));
            store
                .save(
                    session_id,
                    SessionFields {
                        repository_remote: "local".to_string(),
                        base_branch: "main".to_string(),
                        branch_name: session_id.to_string(),
                        prompt: "task".to_string(),
                        worktree_path: worktree.to_string_lossy().to_string(),
                        port: 0,
                        model: "claude".to_string(),
                    },
                )
                .await
                .unwrap();

            let tmux = Arc::new(TmuxClient::with_path(tmux_stub_failing_kill(
                stub_dir.path(),
            )));
            let manager = LifecycleManager::new(
                Arc::clone(&store),
                tmux,
                GitClient::new(repo.path()),
                FleetConfig::default(),
            );

            let report = manager.teardown(session_id).await;

            // The tmux failure is reported separately...
            assert!(!report.is_clean());
            assert!(report
                .failures()
                .iter()
                .any(|(step, err)| step == "kill tmux session"
                    && err.contains("simulated kill failure")));

            // ...while the later steps still ran to completion.
            assert!(!worktree.exists());
            assert!(store.get(session_id).await.unwrap().is_none());
            assert!(report.completed().iter().any(|s| s == "worktree removed"));
            assert!(report.completed().iter().any(|s| s == "branch deleted"));
            assert!(report
                .completed()
                .iter()
                .any(|s| s == "registry entry removed"));
        }

        #[tokio::test]
        async fn without_record_still_reports_multiplexer_failure() {
            let stub_dir = TempDir::new().unwrap();
            let state_dir = TempDir::new().unwrap();

            let store = Arc::new(StateStore::new(state_dir.path().join("state.json")));
            let tmux = Arc::new(TmuxClient::with_path(tmux_stub_failing_kill(
                stub_dir.path(),
            )));
            let manager = LifecycleManager::new(
                store,
                tmux,
                GitClient::new(state_dir.path()),
                FleetConfig::default(),
            );

            let report = manager.teardown("agent-proj-abc123-mia").await;

            assert!(!report.is_clean());
            assert!(report
                .failures()
                .iter()
                .any(|(step, _)| step == "kill tmux session"));
            // Removing the absent registry entry is still a clean final step.
            assert!(report
                .completed()
                .iter()
                .any(|s| s == "registry entry removed"));
        }
    }
}
