mod client;
mod heuristics;

pub use client::TmuxClient;
pub use heuristics::{is_agent_session_name, is_agent_working, needs_confirmation};

use serde::Serialize;

/// Point-in-time activity classification for a tmux session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionActivity {
    /// A client is attached right now.
    Attached,
    /// Detached but showed activity recently.
    Active,
    /// Detached with no recent activity.
    Inactive,
}

/// Status of a session's agent window, derived from captured pane text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentWindowStatus {
    /// An operator is attached to the session.
    Attached,
    /// The agent is actively working.
    Running,
    /// The agent is idle, waiting for input.
    Ready,
    /// The session or its agent window does not exist.
    NotFound,
}

/// Snapshot of one live tmux session. Rebuilt from queries, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct MultiplexerSession {
    pub name: String,
    pub windows: usize,
    pub panes: usize,
    pub attached: bool,
    pub activity: SessionActivity,
    /// Unix timestamp of the session's last activity.
    pub last_activity: u64,
}
