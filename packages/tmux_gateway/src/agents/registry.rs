//! The agent registry: scans the session list, classifies panes, and diffs
//! the result into lifecycle events.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tmux_control::{ControlError, Notification};

use super::{detect_runtime, Agent};
use crate::control::SessionQuery;

/// Event buffer size. Events beyond this are dropped with a log line; the
/// next scan re-emits a consistent delta, and `list-agents` always serves
/// the full state.
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Fallback rescan cadence; notifications are the primary trigger.
const RESCAN_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistryEventKind {
    Added,
    Removed,
    Updated,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RegistryEvent {
    pub kind: RegistryEventKind,
    pub agent: Agent,
}

/// Canonical set of live agents, diffed on every scan.
pub struct Registry<C: SessionQuery> {
    ctrl: Arc<C>,
    work_dir_filter: String,
    skip: HashSet<String>,
    agents: RwLock<HashMap<String, Agent>>,
    events_tx: mpsc::Sender<RegistryEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<RegistryEvent>>>,
    cancel: CancellationToken,
}

/// Trailing-slash-normalized prefix test: `/tmp/projects` admits `/tmp/projects` and
/// `/tmp/projects/work` but not `/tmp/projects-other`.
fn work_dir_allowed(filter: &str, dir: &str) -> bool {
    if filter.is_empty() {
        return true;
    }
    let filter = filter.trim_end_matches('/');
    if filter.is_empty() {
        return true;
    }
    dir == filter || dir.starts_with(&format!("{filter}/"))
}

impl<C: SessionQuery> Registry<C> {
    pub fn new(ctrl: Arc<C>, work_dir_filter: impl Into<String>, skip: Vec<String>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            ctrl,
            work_dir_filter: work_dir_filter.into(),
            skip: skip.into_iter().collect(),
            agents: RwLock::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            cancel: CancellationToken::new(),
        }
    }

    /// Take the event stream. Single consumer; subsequent calls get `None`.
    pub fn take_events(&self) -> Option<mpsc::Receiver<RegistryEvent>> {
        self.events_rx.lock().expect("events lock poisoned").take()
    }

    /// Perform the initial scan synchronously (failing fast when tmux is
    /// unreachable), then start the watch loop.
    pub async fn start(self: Arc<Self>) -> Result<(), ControlError> {
        self.scan().await?;
        tokio::spawn(async move { self.watch_loop().await });
        Ok(())
    }

    /// Stop the watch loop. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn agents(&self) -> Vec<Agent> {
        let mut list: Vec<Agent> = self
            .agents
            .read()
            .expect("agents lock poisoned")
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn agent(&self, name: &str) -> Option<Agent> {
        self.agents
            .read()
            .expect("agents lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.agents.read().expect("agents lock poisoned").len()
    }

    /// One scan: fetch sessions, classify panes, filter, diff, publish.
    async fn scan(&self) -> Result<(), ControlError> {
        let sessions = self.ctrl.list_sessions().await?;

        let mut next: HashMap<String, Agent> = HashMap::new();
        for session in sessions {
            if self.skip.contains(&session.name) {
                continue;
            }
            let pane = match self.ctrl.pane_info(&session.name).await {
                Ok(pane) => pane,
                Err(e) => {
                    // This session is invisible for this scan; the next
                    // scan retries.
                    debug!(session = %session.name, error = %e, "pane info failed");
                    continue;
                }
            };
            let runtime = detect_runtime(&pane).await;
            if runtime.is_empty() {
                continue;
            }
            if !work_dir_allowed(&self.work_dir_filter, &pane.work_dir) {
                continue;
            }
            next.insert(
                session.name.clone(),
                Agent {
                    name: session.name,
                    runtime,
                    work_dir: pane.work_dir,
                    attached: session.attached,
                },
            );
        }

        let prev = self
            .agents
            .read()
            .expect("agents lock poisoned")
            .clone();

        // Removed before added before updated, so no observer sees two
        // agents with the same identity transiently.
        for (name, agent) in &prev {
            if !next.contains_key(name) {
                self.emit(RegistryEventKind::Removed, agent.clone());
            }
        }
        for (name, agent) in &next {
            if !prev.contains_key(name) {
                self.emit(RegistryEventKind::Added, agent.clone());
            }
        }
        for (name, agent) in &next {
            if let Some(old) = prev.get(name) {
                if old != agent {
                    self.emit(RegistryEventKind::Updated, agent.clone());
                }
            }
        }

        *self.agents.write().expect("agents lock poisoned") = next;
        Ok(())
    }

    fn emit(&self, kind: RegistryEventKind, agent: Agent) {
        let event = RegistryEvent { kind, agent };
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events_tx.try_send(event) {
            warn!(agent = %event.agent.name, ?event.kind, "event buffer full, dropping");
        }
    }

    async fn watch_loop(&self) {
        let mut notifications = self.ctrl.notifications();
        let start = tokio::time::Instant::now() + RESCAN_INTERVAL;
        let mut tick = tokio::time::interval_at(start, RESCAN_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let triggered = tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tick.tick() => true,
                notification = notifications.recv() => match notification {
                    Ok(n) => {
                        if is_rescan_trigger(&n) {
                            // Coalesce: whatever queued up behind this
                            // notification is covered by the scan below.
                            while notifications.try_recv().is_ok() {}
                            true
                        } else {
                            false
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(missed = n, "notification stream lagged, rescanning");
                        true
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("notification stream closed, stopping watch loop");
                        return;
                    }
                },
            };

            if triggered {
                if let Err(e) = self.scan().await {
                    warn!(error = %e, "registry scan failed");
                }
            }
        }
    }
}

fn is_rescan_trigger(notification: &Notification) -> bool {
    matches!(
        notification,
        Notification::SessionsChanged | Notification::WindowRenamed { .. }
    )
}
