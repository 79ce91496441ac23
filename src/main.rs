use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

mod cli;
mod config;
mod error;
mod git;
mod lifecycle;
mod names;
mod ports;
mod state;
mod tmux;
mod watcher;

use cli::{Cli, Command};
use config::FleetConfig;
use git::GitClient;
use lifecycle::{CheckpointOutcome, LifecycleManager, SpawnRequest};
use state::StateStore;
use tmux::{AgentWindowStatus, TmuxClient};
use watcher::Watcher;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = FleetConfig::load(Path::new("fleet.yaml"))?;
    let store = Arc::new(StateStore::at_default_path());
    let tmux = Arc::new(TmuxClient::new());
    let cwd = std::env::current_dir()?;

    match cli.command {
        Command::Spawn {
            prompt,
            model,
            count,
        } => {
            let manager = LifecycleManager::new(
                Arc::clone(&store),
                Arc::clone(&tmux),
                GitClient::new(&cwd),
                config.clone(),
            );
            let request = SpawnRequest {
                prompt,
                model: model.unwrap_or_else(|| config.default_model.clone()),
                count,
            };
            for session in manager.spawn(&request).await? {
                if session.port != 0 {
                    println!(
                        "spawned {} ({}, port {}) at {}",
                        session.agent_name,
                        session.session_id,
                        session.port,
                        session.worktree_path.display()
                    );
                } else {
                    println!(
                        "spawned {} ({}) at {}",
                        session.agent_name,
                        session.session_id,
                        session.worktree_path.display()
                    );
                }
            }
        }
        Command::Ls { json } => {
            list_sessions(&store, &tmux, &GitClient::new(&cwd), json).await?;
        }
        Command::Kill { target } => {
            let manager = LifecycleManager::new(
                Arc::clone(&store),
                Arc::clone(&tmux),
                GitClient::new(&cwd),
                config,
            );
            if target == "all" {
                let report = manager.kill_all().await?;
                for r in &report.reports {
                    println!("{r}");
                }
                println!("killed {} of {} sessions", report.killed, report.reports.len());
            } else {
                let report = manager.kill(&target).await?;
                println!("{report}");
            }
        }
        Command::Checkpoint { agent } => {
            let manager = LifecycleManager::new(
                Arc::clone(&store),
                Arc::clone(&tmux),
                GitClient::new(&cwd),
                config,
            );
            match manager.checkpoint(&agent).await? {
                CheckpointOutcome::NothingToCheckpoint => {
                    println!("nothing to checkpoint for {agent}");
                }
                CheckpointOutcome::Rebased { commits } => {
                    println!("rebased {commits} commit(s) from {agent}");
                }
            }
        }
        Command::Watch => {
            if !tmux.is_server_running().await {
                println!("tmux server not running; watcher will pick up sessions as they appear");
            }
            let remote = GitClient::new(&cwd).remote_url().await?;
            let shutdown = CancellationToken::new();
            let watcher = Watcher::new(
                Arc::clone(&store),
                Arc::clone(&tmux),
                remote,
                shutdown.clone(),
            );
            let handle = tokio::spawn(watcher.run());

            tokio::signal::ctrl_c().await?;
            shutdown.cancel();
            let _ = handle.await;
        }
    }

    Ok(())
}

#[derive(Serialize)]
struct SessionRow {
    session_id: String,
    agent_status: AgentWindowStatus,
    model: String,
    port: u16,
    branch: String,
    prompt: String,
}

/// Thin consumer of the registry + discovery snapshots.
async fn list_sessions(
    store: &StateStore,
    tmux: &TmuxClient,
    git: &GitClient,
    json: bool,
) -> Result<()> {
    let remote = git.remote_url().await?;
    let active = store.list_active_for_repository(tmux, &remote).await?;

    let mut rows = Vec::new();
    for session_id in active {
        let Some(record) = store.get(&session_id).await? else {
            continue;
        };
        let agent_status = tmux.agent_window_status(&session_id).await;
        rows.push(SessionRow {
            session_id,
            agent_status,
            model: record.model,
            port: record.port,
            branch: record.branch_name,
            prompt: record.prompt,
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("no active sessions");
        return Ok(());
    }
    for row in rows {
        let port = if row.port == 0 {
            "-".to_string()
        } else {
            row.port.to_string()
        };
        println!(
            "{:<40} {:<9} {:<10} {:>5}  {}",
            row.session_id,
            format!("{:?}", row.agent_status).to_lowercase(),
            row.model,
            port,
            row.prompt
        );
    }
    Ok(())
}
