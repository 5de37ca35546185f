//! Prompt injection with per-agent serialization.
//!
//! Each prompt is a multi-step keystroke dance: paste the text literally,
//! give the agent UI a moment, Escape out of any modal editor state, then
//! Enter. Two prompts to the same agent never interleave; different agents
//! proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::fileupload::{
    build_paste_payload, build_server_paste_path, check_upload_size, parse_file_upload_payload,
    save_uploaded_file,
};
use crate::control::PaneInput;

const PASTE_SETTLE_DELAY: Duration = Duration::from_millis(500);
const ESCAPE_SETTLE_DELAY: Duration = Duration::from_millis(100);
const ENTER_RETRIES: u32 = 3;
const ENTER_RETRY_BACKOFF: Duration = Duration::from_millis(200);
const WAKE_DELAY: Duration = Duration::from_millis(50);

pub struct Prompter<C: PaneInput> {
    ctrl: Arc<C>,
    /// Ambient lock registry: one mutex per agent, created lazily, so hot
    /// agents never contend on a global.
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<C: PaneInput> Prompter<C> {
    pub fn new(ctrl: Arc<C>) -> Self {
        Self {
            ctrl,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, agent: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("prompter lock registry poisoned");
        locks.entry(agent.to_string()).or_default().clone()
    }

    /// Inject a prompt as if a human typed it. Holds the agent's lock for
    /// the entire sequence.
    pub async fn send_prompt(&self, agent: &str, prompt: &str, attached: bool) -> Result<()> {
        let lock = self.lock_for(agent);
        let _guard = lock.lock().await;

        self.ctrl
            .send_literal(agent, prompt)
            .await
            .context("send prompt text")?;
        self.submit(agent, attached).await
    }

    /// Stage an uploaded file and paste a reference (or the content) into
    /// the agent's input. Returns the saved path.
    pub async fn send_file(
        &self,
        agent: &str,
        work_dir: &str,
        attached: bool,
        payload: &[u8],
    ) -> Result<String> {
        check_upload_size(payload.len())?;
        let (file_name, mime_type, data) = parse_file_upload_payload(payload)?;

        let lock = self.lock_for(agent);
        let _guard = lock.lock().await;

        let saved = save_uploaded_file(work_dir, agent, &file_name, data)?;
        let rel = build_server_paste_path(work_dir, &saved);
        let paste_path = if rel.starts_with('/') {
            rel
        } else {
            format!("./{rel}")
        };
        let paste = build_paste_payload(&saved, &paste_path, &mime_type, data);

        self.ctrl
            .paste_payload(agent, &paste)
            .await
            .context("paste upload into pane")?;
        self.submit(agent, attached).await?;
        Ok(saved.display().to_string())
    }

    /// The Escape/Enter/wake suffix shared by prompts and uploads.
    async fn submit(&self, agent: &str, attached: bool) -> Result<()> {
        tokio::time::sleep(PASTE_SETTLE_DELAY).await;

        // Escape exits any modal editor mode; a no-op in the normal state.
        self.ctrl
            .send_key(agent, "Escape")
            .await
            .context("send Escape")?;
        tokio::time::sleep(ESCAPE_SETTLE_DELAY).await;

        let mut last_err = None;
        for attempt in 0..ENTER_RETRIES {
            match self.ctrl.send_key(agent, "Enter").await {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e) => {
                    debug!(agent, attempt, error = %e, "Enter failed");
                    last_err = Some(e);
                    tokio::time::sleep(ENTER_RETRY_BACKOFF).await;
                }
            }
        }
        if let Some(e) = last_err {
            return Err(e).context("send Enter");
        }

        if !attached {
            self.wake(agent).await;
        }
        Ok(())
    }

    /// The wake dance: shrink the pane by one row and restore it. The
    /// resize signal wakes event loops in agent TUI libraries that idle
    /// when no client is attached.
    async fn wake(&self, agent: &str) {
        let result = async {
            let rows = self.ctrl.pane_height(agent).await?;
            self.ctrl.resize_pane(agent, rows.saturating_sub(1).max(1)).await?;
            tokio::time::sleep(WAKE_DELAY).await;
            self.ctrl.resize_pane(agent, rows).await
        }
        .await;
        if let Err(e) = result {
            warn!(agent, error = %e, "wake dance failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;
    use tmux_control::ControlError;

    /// Records every control call, optionally failing the first N Enters.
    #[derive(Default)]
    struct RecordingControl {
        calls: StdMutex<Vec<String>>,
        fail_enters: AtomicU32,
    }

    impl RecordingControl {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl PaneInput for RecordingControl {
        async fn send_literal(&self, target: &str, text: &str) -> Result<(), ControlError> {
            self.record(format!("literal:{target}:{text}"));
            Ok(())
        }

        async fn send_key(&self, target: &str, name: &str) -> Result<(), ControlError> {
            if name == "Enter" && self.fail_enters.load(Ordering::SeqCst) > 0 {
                self.fail_enters.fetch_sub(1, Ordering::SeqCst);
                self.record(format!("key-failed:{target}:{name}"));
                return Err(ControlError::Io("write failed".into()));
            }
            self.record(format!("key:{target}:{name}"));
            Ok(())
        }

        async fn resize_pane(&self, target: &str, rows: u16) -> Result<(), ControlError> {
            self.record(format!("resize:{target}:{rows}"));
            Ok(())
        }

        async fn pane_height(&self, _target: &str) -> Result<u16, ControlError> {
            Ok(24)
        }

        async fn paste_payload(&self, target: &str, payload: &[u8]) -> Result<(), ControlError> {
            self.record(format!(
                "paste:{target}:{}",
                String::from_utf8_lossy(payload)
            ));
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn prompt_sequence_in_order() {
        let ctrl = Arc::new(RecordingControl::default());
        let prompter = Prompter::new(ctrl.clone());

        prompter.send_prompt("agent-x", "hello", true).await.unwrap();

        assert_eq!(
            ctrl.calls(),
            vec![
                "literal:agent-x:hello",
                "key:agent-x:Escape",
                "key:agent-x:Enter",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unattached_agent_gets_wake_dance() {
        let ctrl = Arc::new(RecordingControl::default());
        let prompter = Prompter::new(ctrl.clone());

        prompter.send_prompt("agent-x", "hello", false).await.unwrap();

        assert_eq!(
            ctrl.calls(),
            vec![
                "literal:agent-x:hello",
                "key:agent-x:Escape",
                "key:agent-x:Enter",
                "resize:agent-x:23",
                "resize:agent-x:24",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn enter_is_retried_on_transport_failure() {
        let ctrl = Arc::new(RecordingControl {
            fail_enters: AtomicU32::new(2),
            ..Default::default()
        });
        let prompter = Prompter::new(ctrl.clone());

        prompter.send_prompt("agent-x", "hi", true).await.unwrap();

        let enters: Vec<_> = ctrl
            .calls()
            .into_iter()
            .filter(|c| c.contains("Enter"))
            .collect();
        assert_eq!(
            enters,
            vec![
                "key-failed:agent-x:Enter",
                "key-failed:agent-x:Enter",
                "key:agent-x:Enter",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn enter_exhaustion_fails_the_prompt() {
        let ctrl = Arc::new(RecordingControl {
            fail_enters: AtomicU32::new(3),
            ..Default::default()
        });
        let prompter = Prompter::new(ctrl.clone());

        let err = prompter.send_prompt("agent-x", "hi", true).await.unwrap_err();
        assert!(err.to_string().contains("Enter"));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_prompts_to_one_agent_never_interleave() {
        let ctrl = Arc::new(RecordingControl::default());
        let prompter = Arc::new(Prompter::new(ctrl.clone()));

        let a = {
            let p = prompter.clone();
            tokio::spawn(async move { p.send_prompt("agent-x", "A", true).await })
        };
        let b = {
            let p = prompter.clone();
            tokio::spawn(async move { p.send_prompt("agent-x", "B", true).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let calls = ctrl.calls();
        assert_eq!(calls.len(), 6);
        // Each prompt's three calls must be contiguous.
        for chunk in calls.chunks(3) {
            let text = chunk[0].strip_prefix("literal:agent-x:").unwrap();
            assert!(text == "A" || text == "B");
            assert_eq!(chunk[1], "key:agent-x:Escape");
            assert_eq!(chunk[2], "key:agent-x:Enter");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn different_agents_use_different_locks() {
        let ctrl = Arc::new(RecordingControl::default());
        let prompter = Prompter::new(ctrl.clone());
        let lock_a = prompter.lock_for("agent-a");
        let lock_a2 = prompter.lock_for("agent-a");
        let lock_b = prompter.lock_for("agent-b");
        assert!(Arc::ptr_eq(&lock_a, &lock_a2));
        assert!(!Arc::ptr_eq(&lock_a, &lock_b));
    }

    #[tokio::test(start_paused = true)]
    async fn file_upload_pastes_text_inline() {
        let ctrl = Arc::new(RecordingControl::default());
        let prompter = Prompter::new(ctrl.clone());
        let work_dir = tempfile::tempdir().unwrap();

        let payload = b"notes.txt\x00text/plain\x00remember the milk";
        let saved = prompter
            .send_file("agent-x", work_dir.path().to_str().unwrap(), true, payload)
            .await
            .unwrap();
        assert!(saved.contains(".tmux-adapter"));

        let calls = ctrl.calls();
        assert_eq!(calls[0], "paste:agent-x:remember the milk");
        assert_eq!(calls[1], "key:agent-x:Escape");
        assert_eq!(calls[2], "key:agent-x:Enter");
    }

    #[tokio::test(start_paused = true)]
    async fn file_upload_pastes_relative_path_for_binary() {
        let ctrl = Arc::new(RecordingControl::default());
        let prompter = Prompter::new(ctrl.clone());
        let work_dir = tempfile::tempdir().unwrap();

        let mut payload = b"blob.bin\x00application/octet-stream\x00".to_vec();
        payload.extend_from_slice(&[0x00, 0x01, 0x02]);
        prompter
            .send_file("agent-x", work_dir.path().to_str().unwrap(), true, &payload)
            .await
            .unwrap();

        let calls = ctrl.calls();
        assert!(
            calls[0].starts_with("paste:agent-x:./.tmux-adapter/uploads/"),
            "got {:?}",
            calls[0]
        );
        assert!(calls[0].ends_with("blob.bin "));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_upload_is_rejected_without_side_effects() {
        let ctrl = Arc::new(RecordingControl::default());
        let prompter = Prompter::new(ctrl.clone());

        let mut payload = b"big.bin\x00application/octet-stream\x00".to_vec();
        payload.resize(super::super::MAX_FILE_UPLOAD_BYTES + 1, b'x');
        let err = prompter.send_file("agent-x", "", true, &payload).await.unwrap_err();
        assert!(err.to_string().contains("exceeds"));
        assert!(ctrl.calls().is_empty());
    }
}
