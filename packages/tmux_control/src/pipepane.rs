//! Pipe-pane output streaming, reference-counted per agent session.
//!
//! The first subscriber activates `pipe-pane` into a tail file and starts a
//! tailer plus a flusher task; the last one tears everything down and
//! removes the file. A second ref-count (`ensure_tailing`/`release_tailing`)
//! lets non-streaming collaborators keep the pipe alive without holding a
//! subscriber channel.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use vt_screen::{Screen, ScreenSnapshot, ScreenUpdate};

use crate::control::ControlMode;
use crate::error::ControlError;

/// Capacity of each subscriber channel. A subscriber that falls behind has
/// updates dropped (drop-newest) rather than blocking the stream.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

/// Flush cadence for fan-out (~30 Hz).
const FLUSH_INTERVAL: Duration = Duration::from_millis(33);

/// Poll interval when the tail file has no new bytes.
const TAIL_IDLE_POLL: Duration = Duration::from_millis(50);

const SCREEN_COLS: u16 = 80;
const SCREEN_ROWS: u16 = 24;

/// The control-mode operations the pipe manager needs. Seam for tests.
#[async_trait]
pub trait PipeControl: Send + Sync + 'static {
    async fn pipe_pane_start(&self, session: &str, shell_cmd: &str) -> Result<(), ControlError>;
    async fn pipe_pane_stop(&self, session: &str) -> Result<(), ControlError>;
    async fn capture_pane_visible(&self, session: &str) -> Result<String, ControlError>;
}

#[async_trait]
impl PipeControl for ControlMode {
    async fn pipe_pane_start(&self, session: &str, shell_cmd: &str) -> Result<(), ControlError> {
        ControlMode::pipe_pane_start(self, session, shell_cmd).await
    }

    async fn pipe_pane_stop(&self, session: &str) -> Result<(), ControlError> {
        ControlMode::pipe_pane_stop(self, session).await
    }

    async fn capture_pane_visible(&self, session: &str) -> Result<String, ControlError> {
        ControlMode::capture_pane_visible(self, session).await
    }
}

/// Handle identifying one subscriber of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

struct StreamState {
    subscribers: HashMap<SubscriberId, mpsc::Sender<ScreenUpdate>>,
    tail_refs: usize,
    pending: Option<ScreenUpdate>,
}

struct PipeStream {
    session: String,
    file_path: PathBuf,
    screen: Arc<Screen>,
    cancel: CancellationToken,
    state: std::sync::Mutex<StreamState>,
}

impl PipeStream {
    fn merge_pending(&self, update: ScreenUpdate) {
        let mut state = self.state.lock().expect("stream state lock poisoned");
        match state.pending.as_mut() {
            Some(pending) => pending.merge(update),
            None => state.pending = Some(update),
        }
    }

    fn take_pending(&self) -> Option<ScreenUpdate> {
        self.state.lock().expect("stream state lock poisoned").pending.take()
    }

    fn fan_out(&self, update: &ScreenUpdate) {
        let state = self.state.lock().expect("stream state lock poisoned");
        for tx in state.subscribers.values() {
            // Slow-consumer isolation: a full channel drops this update for
            // that subscriber only. The screen state itself is the truth, so
            // the next delivered diff supersedes anything missed.
            let _ = tx.try_send(update.clone());
        }
    }

    fn is_idle(&self) -> bool {
        let state = self.state.lock().expect("stream state lock poisoned");
        state.subscribers.is_empty() && state.tail_refs == 0
    }
}

/// Manages one live output stream per agent session.
pub struct PipePaneManager<C: PipeControl> {
    ctrl: Arc<C>,
    streams: Mutex<HashMap<String, Arc<PipeStream>>>,
    next_subscriber: AtomicU64,
}

impl<C: PipeControl> PipePaneManager<C> {
    pub fn new(ctrl: Arc<C>) -> Self {
        Self {
            ctrl,
            streams: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
        }
    }

    /// Tail file location for a session; stable so repeated activations of
    /// the same session reuse one path.
    pub fn tail_file_path(session: &str) -> PathBuf {
        let safe = session.replace(['/', '\\'], "_");
        std::env::temp_dir().join(format!("adapter-{safe}.pipe"))
    }

    /// Start streaming output for a session. The first subscriber activates
    /// pipe-pane; every subscriber receives a fresh snapshot reflecting the
    /// current screen.
    pub async fn subscribe(
        &self,
        session: &str,
    ) -> Result<(SubscriberId, mpsc::Receiver<ScreenUpdate>, ScreenSnapshot), ControlError> {
        let mut streams = self.streams.lock().await;

        let stream = match streams.get(session) {
            Some(stream) => stream.clone(),
            None => {
                let stream = self.activate(session).await?;
                streams.insert(session.to_string(), stream.clone());
                stream
            }
        };

        let id = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let snapshot = {
            let mut state = stream.state.lock().expect("stream state lock poisoned");
            state.subscribers.insert(id, tx);
            drop(state);
            stream.screen.snapshot()
        };

        Ok((id, rx, snapshot))
    }

    /// Remove a subscriber. The last departure (with no tailing refs left)
    /// deactivates pipe-pane and removes the tail file.
    pub async fn unsubscribe(&self, session: &str, id: SubscriberId) {
        let mut streams = self.streams.lock().await;
        let Some(stream) = streams.get(session).cloned() else {
            return;
        };
        stream
            .state
            .lock()
            .expect("stream state lock poisoned")
            .subscribers
            .remove(&id);
        if stream.is_idle() {
            streams.remove(session);
            drop(streams);
            self.stop_stream(&stream).await;
        }
    }

    /// Keep the pipe active without a subscriber channel. Used by the
    /// conversation-watcher collaborator.
    pub async fn ensure_tailing(&self, session: &str) -> Result<(), ControlError> {
        let mut streams = self.streams.lock().await;
        let stream = match streams.get(session) {
            Some(stream) => stream.clone(),
            None => {
                let stream = self.activate(session).await?;
                streams.insert(session.to_string(), stream.clone());
                stream
            }
        };
        stream.state.lock().expect("stream state lock poisoned").tail_refs += 1;
        Ok(())
    }

    /// Release one tailing ref; tears the stream down when it was the last
    /// ref and no subscribers remain.
    pub async fn release_tailing(&self, session: &str) {
        let mut streams = self.streams.lock().await;
        let Some(stream) = streams.get(session).cloned() else {
            return;
        };
        {
            let mut state = stream.state.lock().expect("stream state lock poisoned");
            state.tail_refs = state.tail_refs.saturating_sub(1);
        }
        if stream.is_idle() {
            streams.remove(session);
            drop(streams);
            self.stop_stream(&stream).await;
        }
    }

    /// Number of active streams.
    pub async fn active_streams(&self) -> usize {
        self.streams.lock().await.len()
    }

    /// Tear down every stream. Invoked on shutdown.
    pub async fn stop_all(&self) {
        let mut streams = self.streams.lock().await;
        let all: Vec<_> = streams.drain().map(|(_, s)| s).collect();
        drop(streams);
        for stream in all {
            self.stop_stream(&stream).await;
        }
    }

    /// Activate pipe-pane for a session and start the tailer + flusher.
    async fn activate(&self, session: &str) -> Result<Arc<PipeStream>, ControlError> {
        let file_path = Self::tail_file_path(session);

        // Touch the file up front; stale content is irrelevant because the
        // tailer seeks to the end before reading.
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_path)
            .map_err(|e| ControlError::Io(format!("create pipe file: {e}")))?;

        let shell_cmd = format!("cat >> {}", file_path.display());
        if let Err(e) = self.ctrl.pipe_pane_start(session, &shell_cmd).await {
            let _ = std::fs::remove_file(&file_path);
            return Err(e);
        }

        let screen = Arc::new(Screen::new(SCREEN_COLS, SCREEN_ROWS));

        // Prime with the currently visible pane content so the first
        // snapshot is not an empty grid. Capture output is \n separated.
        match self.ctrl.capture_pane_visible(session).await {
            Ok(content) if !content.is_empty() => {
                screen.write(content.replace('\n', "\r\n").as_bytes());
            }
            Ok(_) => {}
            Err(e) => debug!(session, error = %e, "visible capture for priming failed"),
        }

        let stream = Arc::new(PipeStream {
            session: session.to_string(),
            file_path,
            screen,
            cancel: CancellationToken::new(),
            state: std::sync::Mutex::new(StreamState {
                subscribers: HashMap::new(),
                tail_refs: 0,
                pending: None,
            }),
        });

        tokio::spawn(tail_file(stream.clone()));
        tokio::spawn(flush_updates(stream.clone()));

        Ok(stream)
    }

    async fn stop_stream(&self, stream: &PipeStream) {
        stream.cancel.cancel();
        if let Err(e) = self.ctrl.pipe_pane_stop(&stream.session).await {
            warn!(session = %stream.session, error = %e, "pipe-pane stop failed");
        }
        stream
            .state
            .lock()
            .expect("stream state lock poisoned")
            .subscribers
            .clear();
        if let Err(e) = std::fs::remove_file(&stream.file_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %stream.file_path.display(), error = %e, "remove pipe file failed");
            }
        }
    }
}

/// Tailer task: reads newly appended bytes and feeds them through the
/// screen, accumulating dirty rows for the flusher.
async fn tail_file(stream: Arc<PipeStream>) {
    let mut file = match tokio::fs::File::open(&stream.file_path).await {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %stream.file_path.display(), error = %e, "open pipe file failed");
            return;
        }
    };
    if let Err(e) = file.seek(SeekFrom::End(0)).await {
        warn!(error = %e, "seek pipe file failed");
        return;
    }

    let mut buf = [0u8; 4096];
    loop {
        if stream.cancel.is_cancelled() {
            return;
        }
        match file.read(&mut buf).await {
            Ok(n) if n > 0 => {
                if let Some(update) = stream.screen.write(&buf[..n]) {
                    stream.merge_pending(update);
                }
            }
            Ok(_) | Err(_) => {
                tokio::select! {
                    _ = stream.cancel.cancelled() => return,
                    _ = tokio::time::sleep(TAIL_IDLE_POLL) => {}
                }
            }
        }
    }
}

/// Flusher task: at a fixed cadence, takes the merged pending update and
/// fans it out non-blocking to every subscriber.
async fn flush_updates(stream: Arc<PipeStream>) {
    let mut tick = tokio::time::interval(FLUSH_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = stream.cancel.cancelled() => return,
            _ = tick.tick() => {
                if let Some(update) = stream.take_pending() {
                    stream.fan_out(&update);
                }
            }
        }
    }
}
