//! The control-mode channel: a single persistent conversation with tmux.
//!
//! All commands go through [`ControlMode::execute`], which serializes callers
//! and routes each framed reply (`%begin` … `%end`/`%error`) back to the
//! issuing command. Asynchronous `%`-prefixed notifications are published on
//! a broadcast channel the moment the reader recognizes them, independently
//! of any outstanding command.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ControlError;

/// Default deadline for cheap commands. Capture operations pass their own.
pub const DEFAULT_EXECUTE_TIMEOUT: Duration = Duration::from_millis(200);

/// Deadline for capture-pane style commands that can return screenfuls.
pub const CAPTURE_TIMEOUT: Duration = Duration::from_secs(2);

/// An asynchronous notification from tmux.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    SessionsChanged,
    WindowRenamed { window: String, name: String },
    UnlinkedWindowRenamed { window: String, name: String },
    /// Pane output notification; the core streams output via pipe-pane
    /// instead, so only the pane id is retained.
    Output { pane: String },
    Exit,
    Other { kind: String },
}

/// Parse a `%`-prefixed control-mode line into a notification.
pub(crate) fn parse_notification(line: &str) -> Notification {
    let rest = line.strip_prefix('%').unwrap_or(line);
    let mut parts = rest.splitn(3, ' ');
    let kind = parts.next().unwrap_or_default();
    match kind {
        "sessions-changed" => Notification::SessionsChanged,
        "window-renamed" => Notification::WindowRenamed {
            window: parts.next().unwrap_or_default().to_string(),
            name: parts.next().unwrap_or_default().to_string(),
        },
        "unlinked-window-renamed" => Notification::UnlinkedWindowRenamed {
            window: parts.next().unwrap_or_default().to_string(),
            name: parts.next().unwrap_or_default().to_string(),
        },
        "output" => Notification::Output {
            pane: parts.next().unwrap_or_default().to_string(),
        },
        "exit" => Notification::Exit,
        other => Notification::Other {
            kind: other.to_string(),
        },
    }
}

pub(crate) type CommandReply = Result<String, ControlError>;

struct CommandIo {
    stdin: Box<dyn AsyncWrite + Send + Unpin>,
    reply_rx: mpsc::Receiver<CommandReply>,
}

/// A live control-mode channel to tmux.
pub struct ControlMode {
    io: Mutex<CommandIo>,
    notif_tx: broadcast::Sender<Notification>,
    dead: CancellationToken,
    child: std::sync::Mutex<Option<Child>>,
}

impl ControlMode {
    /// Spawn `tmux -C attach-session` and start the reader task. Fails when
    /// no tmux server is running.
    pub async fn connect() -> Result<Self, ControlError> {
        let mut child = Command::new("tmux")
            .args(["-C", "attach-session"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ControlError::Spawn(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ControlError::Spawn("no stdin handle".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ControlError::Spawn("no stdout handle".into()))?;

        let cm = Self::from_transport(Box::new(stdin), BufReader::new(stdout), Some(child));
        Ok(cm)
    }

    /// Assemble a channel over an arbitrary transport. The reader half is
    /// consumed by the reader task; test code wires a duplex pipe in here.
    pub(crate) fn from_transport<R>(
        stdin: Box<dyn AsyncWrite + Send + Unpin>,
        reader: R,
        child: Option<Child>,
    ) -> Self
    where
        R: AsyncBufRead + Send + Unpin + 'static,
    {
        let (reply_tx, reply_rx) = mpsc::channel::<CommandReply>(1);
        let (notif_tx, _) = broadcast::channel(64);
        let dead = CancellationToken::new();

        tokio::spawn(read_loop(reader, reply_tx, notif_tx.clone(), dead.clone()));

        Self {
            io: Mutex::new(CommandIo { stdin, reply_rx }),
            notif_tx,
            dead,
            child: std::sync::Mutex::new(child),
        }
    }

    /// Subscribe to asynchronous notifications.
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notif_tx.subscribe()
    }

    /// Cancelled when the control-mode process ends. The channel is then
    /// permanently dead and the server should exit.
    pub fn closed(&self) -> CancellationToken {
        self.dead.clone()
    }

    /// Send one command line and wait for its framed reply.
    pub async fn execute(&self, command: &str) -> Result<String, ControlError> {
        self.execute_with_timeout(command, DEFAULT_EXECUTE_TIMEOUT).await
    }

    /// As [`execute`](Self::execute) with a caller-chosen deadline.
    pub async fn execute_with_timeout(
        &self,
        command: &str,
        deadline: Duration,
    ) -> Result<String, ControlError> {
        if self.dead.is_cancelled() {
            return Err(ControlError::Closed);
        }

        let mut io = self.io.lock().await;

        // Drop any stale reply (the implicit attach reply on connect, or a
        // reply that arrived after its command timed out).
        while let Ok(stale) = io.reply_rx.try_recv() {
            debug!(?stale, "discarding stale control-mode reply");
        }

        let line = format!("{command}\n");
        io.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ControlError::Io(e.to_string()))?;
        io.stdin
            .flush()
            .await
            .map_err(|e| ControlError::Io(e.to_string()))?;

        match tokio::time::timeout(deadline, io.reply_rx.recv()).await {
            Err(_) => Err(ControlError::Timeout(command.to_string())),
            Ok(None) => Err(ControlError::Closed),
            Ok(Some(reply)) => reply,
        }
    }

    /// Kill the control-mode child process. Used on shutdown; idempotent.
    pub async fn shutdown(&self) {
        let child = self.child.lock().expect("child lock poisoned").take();
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "failed to kill tmux control-mode process");
            }
        }
        self.dead.cancel();
    }
}

/// Reader task: demultiplexes the single control-mode line stream into
/// command replies and notifications.
async fn read_loop<R>(
    mut reader: R,
    reply_tx: mpsc::Sender<CommandReply>,
    notif_tx: broadcast::Sender<Notification>,
    dead: CancellationToken,
) where
    R: AsyncBufRead + Send + Unpin,
{
    let mut block: Option<Vec<String>> = None;
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "control-mode read failed");
                break;
            }
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);

        if let Some(rest) = trimmed.strip_prefix('%') {
            let kind = rest.split(' ').next().unwrap_or_default();
            match kind {
                "begin" => {
                    block = Some(Vec::new());
                    continue;
                }
                "end" | "error" => {
                    let lines = block.take().unwrap_or_default();
                    let body = lines.join("\n");
                    let reply = if kind == "end" {
                        Ok(body)
                    } else {
                        Err(ControlError::Command(body))
                    };
                    // try_send: replies are rendezvous'd with the single
                    // in-flight command; with no waiter the reply is stale.
                    if let Err(e) = reply_tx.try_send(reply) {
                        debug!(error = %e, "no waiter for control-mode reply");
                    }
                    continue;
                }
                _ if block.is_none() => {
                    let _ = notif_tx.send(parse_notification(trimmed));
                    continue;
                }
                _ => {}
            }
        }

        if let Some(lines) = block.as_mut() {
            lines.push(trimmed.to_string());
        }
        // Lines outside any block that carry no % prefix are noise; ignored.
    }

    dead.cancel();
}
