use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

use super::heuristics;
use super::{AgentWindowStatus, MultiplexerSession, SessionActivity};

/// Window name hosting the agent process in every spawned session.
pub const AGENT_WINDOW: &str = "agent";

/// A detached session counts as active if tmux saw activity this recently.
const ACTIVE_WINDOW_SECS: u64 = 30;

/// How long a discovery snapshot stays valid before the next query refreshes it.
const CACHE_TTL: Duration = Duration::from_secs(2);

struct CachedSessions {
    taken_at: Instant,
    sessions: Vec<MultiplexerSession>,
}

/// Client for interacting with tmux via CLI.
///
/// Discovery queries are advisory: an unreachable tmux server yields an empty
/// session list, never an error. Mutating calls (create/kill/send) do fail.
pub struct TmuxClient {
    /// Path to tmux binary
    tmux_path: String,
    cache: Mutex<Option<CachedSessions>>,
    cache_ttl: Duration,
}

impl TmuxClient {
    pub fn new() -> Self {
        Self::with_path("tmux")
    }

    /// Use an alternate tmux binary. Tests point this at a stub.
    pub fn with_path(tmux_path: impl Into<String>) -> Self {
        Self {
            tmux_path: tmux_path.into(),
            cache: Mutex::new(None),
            cache_ttl: CACHE_TTL,
        }
    }

    /// Check if tmux server is running
    pub async fn is_server_running(&self) -> bool {
        Command::new(&self.tmux_path)
            .arg("list-sessions")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// List all tmux sessions, serving a cached snapshot when fresh enough.
    pub async fn list_sessions(&self) -> Vec<MultiplexerSession> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.taken_at.elapsed() < self.cache_ttl {
                return cached.sessions.clone();
            }
        }

        let sessions = self.query_sessions().await;
        *cache = Some(CachedSessions {
            taken_at: Instant::now(),
            sessions: sessions.clone(),
        });
        sessions
    }

    async fn query_sessions(&self) -> Vec<MultiplexerSession> {
        // Format: session_name|session_windows|session_attached|session_activity
        let output = match Command::new(&self.tmux_path)
            .args([
                "list-sessions",
                "-F",
                "#{session_name}|#{session_windows}|#{session_attached}|#{session_activity}",
            ])
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                debug!("tmux unavailable: {e}");
                return Vec::new();
            }
        };

        if !output.status.success() {
            // "no server running" / "no sessions" both mean an empty view.
            return Vec::new();
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut sessions = Vec::new();
        for line in stdout.lines() {
            if let Some(session) = self.parse_session_line(line).await {
                sessions.push(session);
            }
        }
        sessions
    }

    async fn parse_session_line(&self, line: &str) -> Option<MultiplexerSession> {
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() < 4 {
            return None;
        }

        let name = parts[0].to_string();
        let windows = parts[1].parse().unwrap_or(0);
        let attached = parts[2].parse::<usize>().unwrap_or(0) > 0;
        let last_activity: u64 = parts[3].parse().unwrap_or(0);
        let panes = self.count_panes(&name).await;

        let activity = if attached {
            SessionActivity::Attached
        } else if unix_now().saturating_sub(last_activity) <= ACTIVE_WINDOW_SECS {
            SessionActivity::Active
        } else {
            SessionActivity::Inactive
        };

        Some(MultiplexerSession {
            name,
            windows,
            panes,
            attached,
            activity,
            last_activity,
        })
    }

    async fn count_panes(&self, session: &str) -> usize {
        let target = format!("={session}");
        match Command::new(&self.tmux_path)
            .args(["list-panes", "-s", "-t", target.as_str(), "-F", "#{pane_id}"])
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).lines().count()
            }
            _ => 0,
        }
    }

    /// Check whether a session with exactly this name exists.
    pub async fn has_session(&self, name: &str) -> bool {
        let target = format!("={name}");
        Command::new(&self.tmux_path)
            .args(["has-session", "-t", target.as_str()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Whether this session belongs to the tool: its name has the
    /// `agent-<project>-<hash>-<agentName>` shape, or it carries an agent window.
    pub async fn is_agent_session(&self, name: &str) -> bool {
        if heuristics::is_agent_session_name(name) {
            return true;
        }
        self.window_names(name)
            .await
            .iter()
            .any(|w| w == AGENT_WINDOW)
    }

    async fn window_names(&self, session: &str) -> Vec<String> {
        let target = format!("={session}");
        match Command::new(&self.tmux_path)
            .args(["list-windows", "-t", target.as_str(), "-F", "#{window_name}"])
            .output()
            .await
        {
            Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Activity classification for one session; unknown sessions are inactive.
    pub async fn activity(&self, name: &str) -> SessionActivity {
        self.list_sessions()
            .await
            .into_iter()
            .find(|s| s.name == name)
            .map(|s| s.activity)
            .unwrap_or(SessionActivity::Inactive)
    }

    /// Inspect the agent window's pane to tell a working agent from an idle one.
    pub async fn agent_window_status(&self, name: &str) -> AgentWindowStatus {
        if !self.has_session(name).await {
            return AgentWindowStatus::NotFound;
        }
        if self.activity(name).await == SessionActivity::Attached {
            return AgentWindowStatus::Attached;
        }
        match self.capture_agent_pane(name).await {
            Ok(content) if heuristics::is_agent_working(&content) => AgentWindowStatus::Running,
            Ok(_) => AgentWindowStatus::Ready,
            Err(_) => AgentWindowStatus::NotFound,
        }
    }

    /// Capture the visible text of a session's agent window.
    pub async fn capture_agent_pane(&self, session: &str) -> Result<String> {
        let target = format!("{session}:{AGENT_WINDOW}");
        let output = Command::new(&self.tmux_path)
            .args(["capture-pane", "-p", "-t", target.as_str()])
            .output()
            .await
            .context("Failed to capture pane")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("tmux capture-pane failed: {}", stderr.trim_end());
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Send literal keys to a session's agent window.
    pub async fn send_keys(&self, session: &str, keys: &[&str]) -> Result<()> {
        let target = format!("{session}:{AGENT_WINDOW}");
        let mut args = vec!["send-keys", "-t", target.as_str()];
        args.extend_from_slice(keys);

        let output = Command::new(&self.tmux_path)
            .args(&args)
            .output()
            .await
            .context("Failed to send keys")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("tmux send-keys failed: {}", stderr.trim_end());
        }

        Ok(())
    }

    /// Create a detached session rooted in `cwd` with an agent window.
    pub async fn create_session(&self, name: &str, cwd: &Path) -> Result<()> {
        let cwd_str = cwd.to_string_lossy();
        let output = Command::new(&self.tmux_path)
            .args([
                "new-session",
                "-d",
                "-s",
                name,
                "-n",
                AGENT_WINDOW,
                "-c",
                cwd_str.as_ref(),
            ])
            .output()
            .await
            .context("Failed to create tmux session")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to create session: {}", stderr.trim_end());
        }

        self.invalidate_cache().await;
        Ok(())
    }

    /// Open an extra window in an existing session, running `command` in `cwd`.
    pub async fn new_window(
        &self,
        session: &str,
        window: &str,
        cwd: &Path,
        command: &str,
    ) -> Result<()> {
        let target = format!("={session}");
        let cwd_str = cwd.to_string_lossy();
        let output = Command::new(&self.tmux_path)
            .args([
                "new-window", "-d", "-t", target.as_str(), "-n", window, "-c", cwd_str.as_ref(), command,
            ])
            .output()
            .await
            .context("Failed to create tmux window")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to create window: {}", stderr.trim_end());
        }
        Ok(())
    }

    /// Kill a session
    pub async fn kill_session(&self, name: &str) -> Result<()> {
        let target = format!("={name}");
        let output = Command::new(&self.tmux_path)
            .args(["kill-session", "-t", target.as_str()])
            .output()
            .await
            .context("Failed to kill tmux session")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to kill session: {}", stderr.trim_end());
        }

        self.invalidate_cache().await;
        Ok(())
    }

    async fn invalidate_cache(&self) {
        *self.cache.lock().await = None;
    }
}

impl Default for TmuxClient {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
