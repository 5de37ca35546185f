//! Gateway state shared across connections, and the lifecycle-event
//! fan-out from the registry to subscribed clients.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tmux_control::{ControlMode, PipePaneManager};

use super::client::ClientHandle;
use super::protocol::{agent_event, Response};
use crate::agents::{Registry, RegistryEvent, RegistryEventKind};
use crate::agentio::Prompter;

pub type GatewayRegistry = Registry<ControlMode>;
pub type GatewayPipes = PipePaneManager<ControlMode>;
pub type GatewayPrompter = Prompter<ControlMode>;

/// Everything one WebSocket connection needs to serve requests.
pub struct Gateway {
    pub ctrl: Arc<ControlMode>,
    pub registry: Arc<GatewayRegistry>,
    pub pipes: Arc<GatewayPipes>,
    pub prompter: Arc<GatewayPrompter>,
    pub auth_token: String,
    pub origin_patterns: Vec<String>,
    /// Set once the control channel has completed its first successful
    /// session listing; drives `/readyz`.
    pub ready: AtomicBool,
    /// Root of the cancellation tree: cancelling this broadcasts shutdown
    /// to every client and derived task.
    pub shutdown: CancellationToken,
    clients: Mutex<HashMap<u64, Arc<ClientHandle>>>,
    next_client_id: AtomicU64,
}

impl Gateway {
    pub fn new(
        ctrl: Arc<ControlMode>,
        registry: Arc<GatewayRegistry>,
        pipes: Arc<GatewayPipes>,
        prompter: Arc<GatewayPrompter>,
        auth_token: String,
        origin_patterns: Vec<String>,
    ) -> Self {
        Self {
            ctrl,
            registry,
            pipes,
            prompter,
            auth_token: auth_token.trim().to_string(),
            origin_patterns,
            ready: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            clients: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_client(&self, handle: Arc<ClientHandle>) -> usize {
        let mut clients = self.clients.lock().expect("client set lock poisoned");
        clients.insert(handle.id, handle);
        clients.len()
    }

    pub(crate) fn remove_client(&self, id: u64) -> usize {
        let mut clients = self.clients.lock().expect("client set lock poisoned");
        clients.remove(&id);
        clients.len()
    }

    fn clients_snapshot(&self) -> Vec<Arc<ClientHandle>> {
        self.clients
            .lock()
            .expect("client set lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Deliver registry events to subscribed clients, applying each
    /// client's session-name filter. Added/removed changes additionally
    /// fan out an unfiltered `agents-count` so dashboards can show totals.
    pub async fn run_event_fanout(self: Arc<Self>, mut events: mpsc::Receiver<RegistryEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => {
                        debug!("registry event stream ended");
                        return;
                    }
                },
            };

            let event_json = agent_event(&event).to_json();
            let count_json = if event.kind == RegistryEventKind::Updated {
                None
            } else {
                Some(Response::agents_count(self.registry.count()).to_json())
            };

            for client in self.clients_snapshot() {
                if !client.wants_agent_events() {
                    continue;
                }
                if let Some(count) = &count_json {
                    client.send_text(count.clone());
                }
                if client.passes_session_filter(&event.agent.name) {
                    client.send_text(event_json.clone());
                }
            }
        }
    }

    /// Broadcast shutdown and drop every client.
    pub fn close_all(&self) {
        let clients = self.clients_snapshot();
        info!(count = clients.len(), "closing all clients");
        for client in clients {
            client.cancel.cancel();
        }
    }
}
