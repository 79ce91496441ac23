use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::state::StateStore;
use crate::tmux::{needs_confirmation, TmuxClient};

/// How often each per-session monitor snapshots its pane.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How often the supervisor re-derives the active-session set.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Per-session monitoring state. Lives only in the monitor task; losing it
/// costs one re-baseline, nothing more.
pub struct WatcherEntry {
    session_id: String,
    baseline: Option<[u8; 32]>,
    last_change: Instant,
    /// Polls where the pane content differed from the baseline.
    pub updates: u64,
    /// Polls where the pane content was unchanged.
    pub no_updates: u64,
}

/// Outcome of one snapshot-and-compare step.
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub changed: bool,
    pub needs_confirmation: bool,
}

impl WatcherEntry {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            baseline: None,
            last_change: Instant::now(),
            updates: 0,
            no_updates: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Compare one captured snapshot against the baseline and scan it for
    /// confirmation prompts. The first observation only establishes the
    /// baseline; counters start moving from the second poll on.
    pub fn observe(&mut self, content: &str) -> Observation {
        let digest: [u8; 32] = Sha256::digest(content.as_bytes()).into();
        let needs_confirmation = needs_confirmation(content);

        let changed = match self.baseline {
            None => {
                self.baseline = Some(digest);
                false
            }
            Some(prev) if prev != digest => {
                self.baseline = Some(digest);
                self.last_change = Instant::now();
                self.updates += 1;
                true
            }
            Some(_) => {
                self.no_updates += 1;
                false
            }
        };

        Observation {
            changed,
            needs_confirmation,
        }
    }

    /// Time since the last observed content change.
    pub fn idle_for(&self) -> Duration {
        self.last_change.elapsed()
    }
}

struct MonitorHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Supervisor owning one monitor task per active session.
///
/// A reconciliation loop diffs the desired set (registry entries whose tmux
/// session is live) against the running monitors, starting and cancelling
/// them so every started monitor has exactly one stop path. A single
/// shutdown token fans out to every child at its next poll.
pub struct Watcher {
    store: Arc<StateStore>,
    tmux: Arc<TmuxClient>,
    repository_remote: String,
    shutdown: CancellationToken,
    monitors: HashMap<String, MonitorHandle>,
}

impl Watcher {
    pub fn new(
        store: Arc<StateStore>,
        tmux: Arc<TmuxClient>,
        repository_remote: String,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            tmux,
            repository_remote,
            shutdown,
            monitors: HashMap::new(),
        }
    }

    /// Run until the shutdown token fires, then stop every monitor and return.
    pub async fn run(mut self) {
        info!(repository = %self.repository_remote, "watcher started");
        loop {
            if let Err(e) = self.reconcile().await {
                warn!("reconciliation failed: {e:#}");
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(RECONCILE_INTERVAL) => {}
            }
        }

        for (session_id, handle) in self.monitors.drain() {
            handle.cancel.cancel();
            let _ = handle.join.await;
            debug!(session_id, "monitor stopped");
        }
        info!("watcher stopped");
    }

    async fn reconcile(&mut self) -> Result<()> {
        let mut desired: HashSet<String> = HashSet::new();
        for session_id in self
            .store
            .list_active_for_repository(&self.tmux, &self.repository_remote)
            .await?
        {
            // Only monitor sessions this tool owns.
            if self.tmux.is_agent_session(&session_id).await {
                desired.insert(session_id);
            }
        }

        let stale: Vec<String> = self
            .monitors
            .keys()
            .filter(|id| !desired.contains(*id))
            .cloned()
            .collect();
        for session_id in stale {
            if let Some(handle) = self.monitors.remove(&session_id) {
                handle.cancel.cancel();
                let _ = handle.join.await;
                info!(session_id, "stopped monitoring inactive session");
            }
        }

        for session_id in desired {
            if !self.monitors.contains_key(&session_id) {
                info!(session_id, "monitoring new session");
                let handle = self.spawn_monitor(session_id.clone());
                self.monitors.insert(session_id, handle);
            }
        }
        Ok(())
    }

    fn spawn_monitor(&self, session_id: String) -> MonitorHandle {
        let cancel = self.shutdown.child_token();
        let token = cancel.clone();
        let tmux = Arc::clone(&self.tmux);
        let join = tokio::spawn(monitor_session(session_id, tmux, token));
        MonitorHandle { cancel, join }
    }
}

/// One session's monitoring loop: snapshot, compare, auto-confirm.
///
/// Capture failures are transient; log and retry on the next poll. Repeated
/// confirmation keystrokes across polls are tolerated because the prompt
/// disappears once actually confirmed.
async fn monitor_session(session_id: String, tmux: Arc<TmuxClient>, cancel: CancellationToken) {
    let mut entry = WatcherEntry::new(session_id);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        let content = match tmux.capture_agent_pane(entry.session_id()).await {
            Ok(content) => content,
            Err(e) => {
                debug!(
                    session_id = entry.session_id(),
                    "pane capture failed, retrying next poll: {e:#}"
                );
                continue;
            }
        };

        let observation = entry.observe(&content);
        if observation.changed {
            debug!(
                session_id = entry.session_id(),
                updates = entry.updates,
                "pane content changed"
            );
        } else if entry.no_updates % 120 == 0 && entry.no_updates > 0 {
            debug!(
                session_id = entry.session_id(),
                idle_secs = entry.idle_for().as_secs(),
                "no pane changes"
            );
        }
        if observation.needs_confirmation {
            info!(
                session_id = entry.session_id(),
                "confirmation prompt detected, sending Enter"
            );
            if let Err(e) = tmux.send_keys(entry.session_id(), &["Enter"]).await {
                warn!(
                    session_id = entry.session_id(),
                    "failed to send confirmation: {e:#}"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_observation_only_sets_baseline() {
        let mut entry = WatcherEntry::new("agent-proj-abc123-sam");
        let obs = entry.observe("initial output");
        assert!(!obs.changed);
        assert_eq!(entry.updates, 0);
        assert_eq!(entry.no_updates, 0);
    }

    #[test]
    fn converges_after_single_change() {
        let mut entry = WatcherEntry::new("agent-proj-abc123-sam");
        entry.observe("initial output");

        // Content changes once, then stabilizes.
        assert!(entry.observe("new output").changed);
        for _ in 0..5 {
            assert!(!entry.observe("new output").changed);
        }

        assert_eq!(entry.updates, 1);
        assert_eq!(entry.no_updates, 5);
    }

    #[test]
    fn confirmation_detected_every_poll_it_is_present() {
        let mut entry = WatcherEntry::new("agent-proj-abc123-sam");
        assert!(entry.observe("Continue? (Y/n)").needs_confirmation);
        assert!(entry.observe("Continue? (Y/n)").needs_confirmation);
        assert!(!entry.observe("done, 3 files changed").needs_confirmation);
    }

    #[test]
    fn confirmation_is_independent_of_content_change() {
        let mut entry = WatcherEntry::new("agent-proj-abc123-sam");
        entry.observe("Press Enter to continue");
        // Same content again: unchanged but still confirmable.
        let obs = entry.observe("Press Enter to continue");
        assert!(!obs.changed);
        assert!(obs.needs_confirmation);
    }
}
