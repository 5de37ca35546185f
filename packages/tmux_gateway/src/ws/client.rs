//! One WebSocket client: read/write pumps, request dispatch, and cascading
//! cleanup on disconnect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tmux_control::SubscriberId;

use super::envelope::{
    decode_frame, encode_frame, FRAME_FILE_UPLOAD, FRAME_KEYSTROKES, FRAME_OUTPUT, FRAME_RESIZE,
};
use super::protocol::{parse_request, RequestBody, Response};
use super::server::Gateway;
use crate::agentio::tmux_key_name;
use crate::wsbase::{compile_session_filters, filter_agents};

/// Outbound queue bound per client. A full queue drops the message rather
/// than blocking the core.
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Per-write deadline; a client that cannot take a frame within this is
/// closed.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) enum Outbound {
    Text(String),
    Binary(Vec<u8>),
}

struct OutputSub {
    id: SubscriberId,
    cancel: CancellationToken,
}

#[derive(Default)]
struct ClientState {
    agent_events: bool,
    include: Option<Regex>,
    exclude: Option<Regex>,
    output_subs: HashMap<String, OutputSub>,
}

/// Shared per-client state reachable from the server's fan-out.
pub(crate) struct ClientHandle {
    pub(crate) id: u64,
    pub(crate) cancel: CancellationToken,
    tx: mpsc::Sender<Outbound>,
    state: Mutex<ClientState>,
}

impl ClientHandle {
    fn new(id: u64, tx: mpsc::Sender<Outbound>, cancel: CancellationToken) -> Self {
        Self {
            id,
            cancel,
            tx,
            state: Mutex::new(ClientState::default()),
        }
    }

    pub(crate) fn send_text(&self, text: String) {
        if self.tx.try_send(Outbound::Text(text)).is_err() {
            warn!(client = self.id, "outbound queue full, dropping text message");
        }
    }

    pub(crate) fn send_binary(&self, data: Vec<u8>) {
        if self.tx.try_send(Outbound::Binary(data)).is_err() {
            warn!(client = self.id, "outbound queue full, dropping binary frame");
        }
    }

    pub(crate) fn wants_agent_events(&self) -> bool {
        self.state.lock().expect("client state lock poisoned").agent_events
    }

    pub(crate) fn passes_session_filter(&self, name: &str) -> bool {
        let state = self.state.lock().expect("client state lock poisoned");
        crate::wsbase::passes_filter(name, state.include.as_ref(), state.exclude.as_ref())
    }

    fn set_agent_subscription(&self, on: bool, include: Option<Regex>, exclude: Option<Regex>) {
        let mut state = self.state.lock().expect("client state lock poisoned");
        state.agent_events = on;
        state.include = include;
        state.exclude = exclude;
    }

    fn filtered<T, F: FnOnce(Option<&Regex>, Option<&Regex>) -> T>(&self, f: F) -> T {
        let state = self.state.lock().expect("client state lock poisoned");
        f(state.include.as_ref(), state.exclude.as_ref())
    }

    fn insert_output_sub(&self, agent: String, sub: OutputSub) -> Option<OutputSub> {
        self.state
            .lock()
            .expect("client state lock poisoned")
            .output_subs
            .insert(agent, sub)
    }

    fn remove_output_sub(&self, agent: &str) -> Option<OutputSub> {
        self.state
            .lock()
            .expect("client state lock poisoned")
            .output_subs
            .remove(agent)
    }

    fn drain_output_subs(&self) -> Vec<(String, OutputSub)> {
        self.state
            .lock()
            .expect("client state lock poisoned")
            .output_subs
            .drain()
            .collect()
    }
}

/// Run one client connection to completion.
pub(crate) async fn handle_socket(socket: WebSocket, gateway: Arc<Gateway>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let cancel = gateway.shutdown.child_token();
    let handle = Arc::new(ClientHandle::new(gateway.next_client_id(), tx, cancel.clone()));

    let total = gateway.register_client(handle.clone());
    info!(client = handle.id, total, "client connected");

    // Write pump: drains the bounded queue; a write error or timeout kills
    // the connection.
    let write_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = write_cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let frame = match msg {
                Outbound::Text(text) => Message::Text(text.into()),
                Outbound::Binary(data) => Message::Binary(data.into()),
            };
            match tokio::time::timeout(WRITE_TIMEOUT, sink.send(frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => {
                    write_cancel.cancel();
                    break;
                }
            }
        }
        let _ = sink.close().await;
    });

    // Read pump.
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = stream.next() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => {
                handle_text(&gateway, &handle, text.as_str()).await;
            }
            Some(Ok(Message::Binary(data))) => {
                handle_binary(&gateway, &handle, &data).await;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {} // ping/pong handled by the protocol stack
            Some(Err(e)) => {
                debug!(client = handle.id, error = %e, "read failed");
                break;
            }
        }
    }

    // Cascading cleanup: cancel derived work, release output subscriptions,
    // leave the client set.
    cancel.cancel();
    for (agent, sub) in handle.drain_output_subs() {
        sub.cancel.cancel();
        gateway.pipes.unsubscribe(&agent, sub.id).await;
    }
    let remaining = gateway.remove_client(handle.id);
    let _ = writer.await;
    info!(client = handle.id, remaining, "client disconnected");
}

async fn handle_text(gateway: &Arc<Gateway>, handle: &Arc<ClientHandle>, text: &str) {
    let (id, body) = parse_request(text);
    let body = match body {
        Ok(body) => body,
        Err(message) => {
            handle.send_text(Response::error(id, message).to_json());
            return;
        }
    };

    match body {
        RequestBody::ListAgents => {
            let agents = handle.filtered(|inc, exc| {
                filter_agents(gateway.registry.agents(), inc, exc)
            });
            handle.send_text(Response::agent_list(id, agents, None).to_json());
        }

        RequestBody::GetAgent { agent } => match gateway.registry.agent(&agent) {
            Some(agent) => handle.send_text(Response::single_agent(id, agent).to_json()),
            None => handle.send_text(Response::error(id, "agent not found").to_json()),
        },

        RequestBody::SubscribeAgents {
            include_session_filter,
            exclude_session_filter,
        } => {
            let filters = compile_session_filters(
                include_session_filter.as_deref(),
                exclude_session_filter.as_deref(),
            );
            let (include, exclude) = match filters {
                Ok(filters) => filters,
                Err(e) => {
                    handle.send_text(Response::error(id, e.to_string()).to_json());
                    return;
                }
            };
            let agents =
                filter_agents(gateway.registry.agents(), include.as_ref(), exclude.as_ref());
            handle.set_agent_subscription(true, include, exclude);
            let total = gateway.registry.count();
            handle.send_text(Response::agent_list(id, agents, Some(total)).to_json());
        }

        RequestBody::UnsubscribeAgents => {
            handle.set_agent_subscription(false, None, None);
            handle.send_text(Response::ack(id).to_json());
        }

        RequestBody::SubscribeOutput { agent, stream } => {
            subscribe_output(gateway, handle, id, agent, stream.unwrap_or(true)).await;
        }

        RequestBody::UnsubscribeOutput { agent } => {
            if let Some(sub) = handle.remove_output_sub(&agent) {
                sub.cancel.cancel();
                gateway.pipes.unsubscribe(&agent, sub.id).await;
            }
            handle.send_text(Response::ack(id).to_json());
        }

        RequestBody::SendPrompt { agent, prompt } | RequestBody::SendMessage { agent, prompt } => {
            // Detached so a slow keystroke dance never blocks the read pump.
            let gateway = gateway.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                let reply = match gateway.registry.agent(&agent) {
                    None => Response::error(id, "agent not found"),
                    Some(target) => match gateway
                        .prompter
                        .send_prompt(&target.name, &prompt, target.attached)
                        .await
                    {
                        Ok(()) => Response::ack(id),
                        Err(e) => Response::error(id, e.to_string()),
                    },
                };
                handle.send_text(reply.to_json());
            });
        }
    }
}

async fn subscribe_output(
    gateway: &Arc<Gateway>,
    handle: &Arc<ClientHandle>,
    id: Option<String>,
    agent: String,
    stream: bool,
) {
    if gateway.registry.agent(&agent).is_none() {
        handle.send_text(Response::error(id, "agent not found").to_json());
        return;
    }

    let (sub_id, mut updates, snapshot) = match gateway.pipes.subscribe(&agent).await {
        Ok(sub) => sub,
        Err(e) => {
            handle.send_text(Response::error(id, e.to_string()).to_json());
            return;
        }
    };

    let snapshot_frame = match serde_json::to_vec(&snapshot) {
        Ok(json) => encode_frame(FRAME_OUTPUT, &agent, &json),
        Err(e) => {
            gateway.pipes.unsubscribe(&agent, sub_id).await;
            handle.send_text(Response::error(id, e.to_string()).to_json());
            return;
        }
    };

    // Ack, then the snapshot, then (when streaming) the diffs — in order.
    handle.send_text(Response::ack(id).to_json());
    handle.send_binary(snapshot_frame);

    if !stream {
        gateway.pipes.unsubscribe(&agent, sub_id).await;
        return;
    }

    // Replace any previous subscription for this agent.
    if let Some(old) = handle.insert_output_sub(
        agent.clone(),
        OutputSub {
            id: sub_id,
            cancel: handle.cancel.child_token(),
        },
    ) {
        old.cancel.cancel();
        gateway.pipes.unsubscribe(&agent, old.id).await;
    }

    let sub_cancel = handle
        .state
        .lock()
        .expect("client state lock poisoned")
        .output_subs
        .get(&agent)
        .map(|s| s.cancel.clone());
    let Some(sub_cancel) = sub_cancel else { return };

    let forward_handle = handle.clone();
    let forward_agent = agent.clone();
    tokio::spawn(async move {
        loop {
            let update = tokio::select! {
                _ = sub_cancel.cancelled() => return,
                update = updates.recv() => match update {
                    Some(update) => update,
                    None => return,
                },
            };
            match serde_json::to_vec(&update) {
                Ok(json) => {
                    forward_handle.send_binary(encode_frame(FRAME_OUTPUT, &forward_agent, &json));
                }
                Err(e) => warn!(agent = %forward_agent, error = %e, "encode update failed"),
            }
        }
    });
}

async fn handle_binary(gateway: &Arc<Gateway>, handle: &Arc<ClientHandle>, data: &[u8]) {
    let frame = match decode_frame(data) {
        Ok(frame) => frame,
        Err(e) => {
            handle.send_text(Response::error(None, e.to_string()).to_json());
            return;
        }
    };

    match frame.frame_type {
        FRAME_KEYSTROKES => {
            // Keystrokes run inline: their relative order matters.
            // Sequences outside the key-name table go through hex mode,
            // which carries any byte sequence verbatim.
            let ctrl = &gateway.ctrl;
            let result = if let Some(key) = tmux_key_name(frame.payload) {
                ctrl.send_key(frame.agent, key).await
            } else {
                ctrl.send_raw_bytes(frame.agent, frame.payload).await
            };
            if let Err(e) = result {
                handle.send_text(Response::error(None, e.to_string()).to_json());
            }
        }

        FRAME_RESIZE => {
            let parsed = std::str::from_utf8(frame.payload)
                .ok()
                .and_then(|s| s.split_once(':'))
                .and_then(|(cols, rows)| {
                    Some((cols.parse::<u16>().ok()?, rows.parse::<u16>().ok()?))
                });
            match parsed {
                Some((cols, rows)) => {
                    if let Err(e) = gateway.ctrl.resize_window(frame.agent, cols, rows).await {
                        handle.send_text(Response::error(None, e.to_string()).to_json());
                    }
                }
                None => {
                    handle.send_text(
                        Response::error(None, "malformed resize payload, want \"cols:rows\"")
                            .to_json(),
                    );
                }
            }
        }

        FRAME_FILE_UPLOAD => {
            // Detached: saving and pasting can take a while.
            let gateway = gateway.clone();
            let handle = handle.clone();
            let agent = frame.agent.to_string();
            let payload = frame.payload.to_vec();
            tokio::spawn(async move {
                let Some(target) = gateway.registry.agent(&agent) else {
                    handle.send_text(Response::error(None, "agent not found").to_json());
                    return;
                };
                match gateway
                    .prompter
                    .send_file(&target.name, &target.work_dir, target.attached, &payload)
                    .await
                {
                    Ok(saved) => {
                        info!(agent = %target.name, path = %saved, "file upload staged")
                    }
                    Err(e) => handle.send_text(Response::error(None, e.to_string()).to_json()),
                }
            });
        }

        other => {
            handle.send_text(
                Response::error(None, format!("unexpected binary frame type 0x{other:02x}"))
                    .to_json(),
            );
        }
    }
}
