use once_cell::sync::Lazy;
use regex::Regex;

/// Session names created by this tool: `agent-<project>-<hash>-<agentName>`.
static RE_SESSION_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^agent-.+-[0-9a-f]{6}-[A-Za-z0-9_]+$").unwrap());

/// Markers that show an agent is actively working in its pane.
static RE_WORKING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?mi)(esc to interrupt|Thinking|Working|Processing|⠋|⠙|⠹|⠸|⠼|⠴|⠦|⠧|⠇|⠏)")
        .unwrap()
});

/// Confirmation prompts an unattended agent can get stuck on.
static RE_CONFIRMATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?mi)(Do you trust the files in this folder|Press Enter to continue|Continue\?\s*\(Y/n\)|Do you want to|\[y/n\]|\(y/N\)|\(Y/n\))",
    )
    .unwrap()
});

pub fn is_agent_session_name(name: &str) -> bool {
    RE_SESSION_NAME.is_match(name)
}

/// Whether captured pane content shows the agent mid-task.
/// Only the most recent lines matter; old scrollback stays out of the vote.
pub fn is_agent_working(content: &str) -> bool {
    RE_WORKING.is_match(&recent_lines(content))
}

/// Whether captured pane content contains a prompt waiting on confirmation.
pub fn needs_confirmation(content: &str) -> bool {
    RE_CONFIRMATION.is_match(&recent_lines(content))
}

fn recent_lines(content: &str) -> String {
    let lines: Vec<&str> = content.lines().rev().take(20).collect();
    lines.into_iter().rev().collect::<Vec<_>>().join("\n")
}
