//! Runtime detection for a pane's foreground process.
//!
//! Three tiers, in priority order: direct command-name match, descendant
//! walk for shell-wrapped agents, and a binary-name read for panes whose
//! process re-exec'd under a different argv[0].

use tmux_control::PaneInfo;
use tracing::debug;

/// Candidate process names per runtime, priority ordered. Ambiguous names
/// (a bare `node` can be claude or opencode) resolve to the first entry
/// that lists them.
const RUNTIMES: &[(&str, &[&str])] = &[
    ("claude", &["node", "claude"]),
    ("gemini", &["gemini"]),
    ("codex", &["codex"]),
    ("cursor", &["cursor-agent"]),
    ("auggie", &["auggie"]),
    ("amp", &["amp"]),
    ("opencode", &["opencode", "node", "bun"]),
];

const SHELLS: &[&str] = &["bash", "zsh", "sh", "fish", "tcsh", "ksh"];

/// Maximum process-tree depth for the descendant walk.
const MAX_WALK_DEPTH: usize = 10;

/// Tier-1 lookup: the runtime whose candidate list contains `command`.
pub fn runtime_for_command(command: &str) -> Option<&'static str> {
    if command.is_empty() {
        return None;
    }
    RUNTIMES
        .iter()
        .find(|(_, names)| names.contains(&command))
        .map(|(runtime, _)| *runtime)
}

pub fn is_shell(command: &str) -> bool {
    SHELLS.contains(&command)
}

/// Resolve the runtime for a pane, or an empty string when the pane does
/// not host a known agent.
pub async fn detect_runtime(pane: &PaneInfo) -> String {
    // Tier 1: the pane command itself is a known agent process.
    if let Some(runtime) = runtime_for_command(&pane.command) {
        return runtime.to_string();
    }

    // Tier 2: a shell wrapping the agent — walk descendants.
    if is_shell(&pane.command) {
        return walk_descendants(&pane.pid).await.unwrap_or_default();
    }

    if pane.command.is_empty() {
        return String::new();
    }

    // Tier 3: unknown pane command (e.g. an agent that re-exec'd with a
    // version string as argv[0]) — read the actual binary name, then fall
    // back to the descendant walk.
    if let Some(comm) = binary_name(&pane.pid).await {
        if let Some(runtime) = runtime_for_command(&comm) {
            return runtime.to_string();
        }
    }
    walk_descendants(&pane.pid).await.unwrap_or_default()
}

/// Breadth-first walk of the process tree below `pid`, one `ps` call per
/// level, matching each descendant's command against the runtime table.
async fn walk_descendants(pid: &str) -> Option<String> {
    if pid.is_empty() {
        return None;
    }
    let mut frontier = vec![pid.to_string()];
    for _ in 0..MAX_WALK_DEPTH {
        let children = children_of(&frontier).await;
        if children.is_empty() {
            return None;
        }
        for (_, comm) in &children {
            if let Some(runtime) = runtime_for_command(comm) {
                return Some(runtime.to_string());
            }
        }
        frontier = children.into_iter().map(|(pid, _)| pid).collect();
    }
    None
}

/// `(pid, comm)` for the direct children of the given pids.
async fn children_of(pids: &[String]) -> Vec<(String, String)> {
    let output = tokio::process::Command::new("ps")
        .args(["-o", "pid=,comm=", "--ppid", &pids.join(",")])
        .output()
        .await;
    let output = match output {
        Ok(out) => out,
        Err(e) => {
            debug!(error = %e, "ps invocation failed");
            return Vec::new();
        }
    };
    // ps exits non-zero when no processes match; that is just "no children".
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let pid = parts.next()?.to_string();
            let comm = parts.next()?.to_string();
            Some((pid, comm))
        })
        .collect()
}

/// The kernel's idea of the process name, which survives re-exec tricks.
async fn binary_name(pid: &str) -> Option<String> {
    if pid.is_empty() {
        return None;
    }
    let comm = tokio::fs::read_to_string(format!("/proc/{pid}/comm"))
        .await
        .ok()?;
    let comm = comm.trim();
    if comm.is_empty() {
        None
    } else {
        Some(comm.to_string())
    }
}
