//! Convenience wrappers over [`ControlMode::execute`] for the tmux commands
//! the gateway issues. Soft errors ("no such session", "unknown variable",
//! "nothing to capture") are downgraded to empty results here; everything
//! else propagates.

use std::time::SystemTime;

use crate::control::{ControlMode, CAPTURE_TIMEOUT};
use crate::error::ControlError;

/// One multiplexer session as reported by `list-sessions`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionInfo {
    pub name: String,
    /// A client is currently viewing the session.
    pub attached: bool,
}

/// The active pane of a session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PaneInfo {
    /// Short name of the foreground process.
    pub command: String,
    pub pid: String,
    pub work_dir: String,
}

/// Quote an argument for the tmux command line. tmux accepts double-quoted
/// strings with backslash escapes; control-mode commands are line-framed so
/// the caller must never pass embedded newlines through this path.
fn quote(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('"');
    for ch in arg.chars() {
        if ch == '"' || ch == '\\' || ch == '$' || ch == '`' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

fn is_line_safe(text: &str) -> bool {
    text.bytes().all(|b| b >= 0x20 && b != 0x7f)
}

impl ControlMode {
    /// List all sessions with their attach state.
    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>, ControlError> {
        let out = self
            .execute("list-sessions -F \"#{session_name}\t#{session_attached}\"")
            .await;
        let out = match out {
            Ok(out) => out,
            // A server with zero sessions reports "no server running" or
            // an empty list depending on version; both mean no sessions.
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut sessions = Vec::new();
        for line in out.lines() {
            let mut parts = line.splitn(2, '\t');
            let name = parts.next().unwrap_or_default();
            if name.is_empty() {
                continue;
            }
            let attached = parts.next().unwrap_or("0") != "0";
            sessions.push(SessionInfo {
                name: name.to_string(),
                attached,
            });
        }
        Ok(sessions)
    }

    /// Fetch the active pane's command, pid and working directory.
    pub async fn pane_info(&self, session: &str) -> Result<PaneInfo, ControlError> {
        let cmd = format!(
            "display-message -p -t {} -F \"#{{pane_current_command}}\t#{{pane_pid}}\t#{{pane_current_path}}\"",
            quote(session)
        );
        let out = self.execute(&cmd).await?;
        let line = out.lines().next().unwrap_or_default();
        let mut parts = line.splitn(3, '\t');
        Ok(PaneInfo {
            command: parts.next().unwrap_or_default().to_string(),
            pid: parts.next().unwrap_or_default().to_string(),
            work_dir: parts.next().unwrap_or_default().to_string(),
        })
    }

    /// Whether a session exists. "can't find session" maps to `false`.
    pub async fn has_session(&self, session: &str) -> Result<bool, ControlError> {
        match self.execute(&format!("has-session -t {}", quote(session))).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Read one session environment variable. Unknown variables map to an
    /// empty string.
    pub async fn show_environment(&self, session: &str, key: &str) -> Result<String, ControlError> {
        let cmd = format!("show-environment -t {} {}", quote(session), quote(key));
        match self.execute(&cmd).await {
            Ok(out) => {
                let line = out.lines().next().unwrap_or_default();
                Ok(line
                    .strip_prefix(&format!("{key}="))
                    .unwrap_or(line)
                    .to_string())
            }
            Err(ControlError::Command(msg)) if msg.contains("unknown variable") => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    /// Capture the pane's full history. "nothing to capture" maps to empty.
    pub async fn capture_pane_history(&self, session: &str) -> Result<String, ControlError> {
        let cmd = format!("capture-pane -p -e -t {} -S -", quote(session));
        match self.execute_with_timeout(&cmd, CAPTURE_TIMEOUT).await {
            Ok(out) => Ok(out),
            Err(ControlError::Command(msg)) if msg.contains("nothing to capture") => {
                Ok(String::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Capture the currently visible screen. Tries the alternate-screen
    /// capture first and falls back when the pane has none.
    pub async fn capture_pane_visible(&self, session: &str) -> Result<String, ControlError> {
        let target = quote(session);
        match self
            .execute_with_timeout(&format!("capture-pane -p -e -a -t {target}"), CAPTURE_TIMEOUT)
            .await
        {
            Ok(out) => Ok(out),
            Err(ControlError::Command(_)) => {
                self.execute_with_timeout(&format!("capture-pane -p -e -t {target}"), CAPTURE_TIMEOUT)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Start teeing pane output into a shell command.
    pub async fn pipe_pane_start(&self, session: &str, shell_cmd: &str) -> Result<(), ControlError> {
        let cmd = format!("pipe-pane -o -t {} {}", quote(session), quote(shell_cmd));
        self.execute(&cmd).await.map(|_| ())
    }

    /// Stop an active pipe-pane.
    pub async fn pipe_pane_stop(&self, session: &str) -> Result<(), ControlError> {
        self.execute(&format!("pipe-pane -t {}", quote(session)))
            .await
            .map(|_| ())
    }

    /// Send text without key-name interpretation. Text containing control
    /// bytes cannot ride the line-framed command channel literally and is
    /// rerouted through the hex path.
    pub async fn send_literal(&self, target: &str, text: &str) -> Result<(), ControlError> {
        if text.is_empty() {
            return Ok(());
        }
        if !is_line_safe(text) {
            return self.send_raw_bytes(target, text.as_bytes()).await;
        }
        let cmd = format!("send-keys -t {} -l -- {}", quote(target), quote(text));
        self.execute(&cmd).await.map(|_| ())
    }

    /// Send a symbolic key name (Enter, Escape, Up, F5, …).
    pub async fn send_key(&self, target: &str, name: &str) -> Result<(), ControlError> {
        let cmd = format!("send-keys -t {} {}", quote(target), name);
        self.execute(&cmd).await.map(|_| ())
    }

    /// Send raw bytes via hex mode.
    pub async fn send_raw_bytes(&self, target: &str, bytes: &[u8]) -> Result<(), ControlError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let hex: Vec<String> = bytes.iter().map(|b| format!("0x{b:02x}")).collect();
        let cmd = format!("send-keys -t {} -H {}", quote(target), hex.join(" "));
        self.execute(&cmd).await.map(|_| ())
    }

    /// Resize a pane to an absolute row count.
    pub async fn resize_pane(&self, target: &str, rows: u16) -> Result<(), ControlError> {
        let cmd = format!("resize-pane -t {} -y {}", quote(target), rows);
        self.execute(&cmd).await.map(|_| ())
    }

    /// Resize the window holding the target pane.
    pub async fn resize_window(&self, target: &str, cols: u16, rows: u16) -> Result<(), ControlError> {
        let cmd = format!("resize-window -t {} -x {} -y {}", quote(target), cols, rows);
        self.execute(&cmd).await.map(|_| ())
    }

    /// Current height of the target pane in rows.
    pub async fn pane_height(&self, target: &str) -> Result<u16, ControlError> {
        let cmd = format!("display-message -p -t {} -F \"#{{pane_height}}\"", quote(target));
        let out = self.execute(&cmd).await?;
        out.trim()
            .parse::<u16>()
            .map_err(|_| ControlError::Command(format!("unparseable pane height: {out:?}")))
    }

    /// Load bytes into a paste buffer and paste them into the target pane.
    /// The payload is staged in a temp file so its bytes never appear on the
    /// command line.
    pub async fn paste_payload(&self, target: &str, payload: &[u8]) -> Result<(), ControlError> {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let buffer = format!("tmux-gateway-{nanos}");
        let staging = std::env::temp_dir().join(format!("{buffer}.buf"));

        tokio::fs::write(&staging, payload)
            .await
            .map_err(|e| ControlError::Io(e.to_string()))?;

        let load = format!(
            "load-buffer -b {} {}",
            quote(&buffer),
            quote(&staging.display().to_string())
        );
        let paste = format!("paste-buffer -d -p -b {} -t {}", quote(&buffer), quote(target));

        let result = async {
            self.execute(&load).await?;
            self.execute(&paste).await?;
            Ok(())
        }
        .await;

        let _ = tokio::fs::remove_file(&staging).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::tests_support::StubControl;
    use crate::control::Notification;

    #[tokio::test]
    async fn list_sessions_parses_names_and_attach_state() {
        let stub = StubControl::new(|cmd| {
            assert!(cmd.starts_with("list-sessions"));
            Ok("alpha\t1\nbeta\t0\n".to_string())
        });
        let sessions = stub.cm().list_sessions().await.unwrap();
        assert_eq!(
            sessions,
            vec![
                SessionInfo { name: "alpha".into(), attached: true },
                SessionInfo { name: "beta".into(), attached: false },
            ]
        );
    }

    #[tokio::test]
    async fn pane_info_parses_fields() {
        let stub = StubControl::new(|_| Ok("claude\t4242\t/home/user/project".to_string()));
        let pane = stub.cm().pane_info("alpha").await.unwrap();
        assert_eq!(pane.command, "claude");
        assert_eq!(pane.pid, "4242");
        assert_eq!(pane.work_dir, "/home/user/project");
    }

    #[tokio::test]
    async fn has_session_exists() {
        let stub = StubControl::new(|_| Ok(String::new()));
        assert!(stub.cm().has_session("my-session").await.unwrap());
    }

    #[tokio::test]
    async fn has_session_not_found_is_false() {
        let stub = StubControl::new(|_| Err("can't find session: my-session".to_string()));
        assert!(!stub.cm().has_session("my-session").await.unwrap());
    }

    #[tokio::test]
    async fn has_session_propagates_other_errors() {
        let stub = StubControl::new(|_| Err("server exited unexpectedly".to_string()));
        let err = stub.cm().has_session("my-session").await.unwrap_err();
        assert!(err.to_string().contains("server exited unexpectedly"));
    }

    #[tokio::test]
    async fn show_environment_found() {
        let stub = StubControl::new(|_| Ok("MY_VAR=hello-world".to_string()));
        let val = stub.cm().show_environment("s", "MY_VAR").await.unwrap();
        assert_eq!(val, "hello-world");
    }

    #[tokio::test]
    async fn show_environment_unknown_variable_is_empty() {
        let stub = StubControl::new(|_| Err("unknown variable: MY_VAR".to_string()));
        let val = stub.cm().show_environment("s", "MY_VAR").await.unwrap();
        assert_eq!(val, "");
    }

    #[tokio::test]
    async fn show_environment_propagates_other_errors() {
        let stub = StubControl::new(|_| Err("can't find session: s".to_string()));
        assert!(stub.cm().show_environment("s", "MY_VAR").await.is_err());
    }

    #[tokio::test]
    async fn capture_history_nothing_to_capture_is_empty() {
        let stub = StubControl::new(|_| Err("nothing to capture".to_string()));
        let out = stub.cm().capture_pane_history("s").await.unwrap();
        assert_eq!(out, "");
    }

    #[tokio::test]
    async fn capture_visible_falls_back_without_alternate_screen() {
        let stub = StubControl::new(|cmd| {
            if cmd.contains(" -a ") {
                Err("no alternate screen".to_string())
            } else {
                Ok("visible-screen".to_string())
            }
        });
        let out = stub.cm().capture_pane_visible("agent-a").await.unwrap();
        assert_eq!(out, "visible-screen");
        let executed = stub.commands();
        assert_eq!(executed.len(), 2);
        assert!(executed[0].contains("capture-pane -p -e -a "));
        assert!(!executed[1].contains(" -a "));
    }

    #[tokio::test]
    async fn send_literal_uses_hex_for_control_bytes() {
        let stub = StubControl::new(|_| Ok(String::new()));
        stub.cm().send_literal("s", "line1\nline2").await.unwrap();
        let executed = stub.commands();
        assert_eq!(executed.len(), 1);
        assert!(executed[0].contains("-H"), "expected hex mode: {:?}", executed[0]);
        assert!(executed[0].contains("0x0a"));
    }

    #[tokio::test]
    async fn send_literal_quotes_plain_text() {
        let stub = StubControl::new(|_| Ok(String::new()));
        stub.cm().send_literal("s", "fix the \"bug\"").await.unwrap();
        let executed = stub.commands();
        assert!(executed[0].contains("send-keys"));
        assert!(executed[0].contains("-l"));
        assert!(executed[0].contains("\\\"bug\\\""));
    }

    #[tokio::test]
    async fn notifications_pass_through_during_command() {
        let stub = StubControl::with_notification(
            |_| Ok("done".to_string()),
            "%sessions-changed",
        );
        let mut notifs = stub.cm().notifications();
        let out = stub.cm().execute("kill-time").await.unwrap();
        assert_eq!(out, "done");
        assert_eq!(notifs.recv().await.unwrap(), Notification::SessionsChanged);
    }

    #[test]
    fn quote_escapes_specials() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote("has space"), "\"has space\"");
        assert_eq!(quote("a\"b"), "\"a\\\"b\"");
        assert_eq!(quote("a\\b"), "\"a\\\\b\"");
        assert_eq!(quote("$HOME"), "\"\\$HOME\"");
    }
}
