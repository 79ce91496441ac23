use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "fleet",
    version,
    about = "Orchestrate parallel AI coding agents in isolated git worktrees and tmux sessions"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Spawn one or more agent workers with a task prompt
    Spawn {
        /// Task text handed to each agent
        #[arg(short, long)]
        prompt: String,
        /// Agent command to run (defaults to fleet.yaml's defaultModel)
        #[arg(short, long)]
        model: Option<String>,
        /// Number of workers to spawn
        #[arg(short, long, default_value_t = 1)]
        count: usize,
    },
    /// List this repository's active sessions
    Ls {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Kill a worker by agent name or session id, or "all"
    Kill { target: String },
    /// Rebase the current branch onto an agent's branch
    Checkpoint { agent: String },
    /// Monitor active workers and auto-confirm blocking prompts
    Watch,
}
