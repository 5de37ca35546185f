use std::fmt;

/// Errors from the tmux control-mode channel.
#[derive(Debug, Clone)]
pub enum ControlError {
    /// Failed to spawn the tmux control-mode process
    Spawn(String),
    /// I/O failure on the control pipe — terminal, callers should exit
    Io(String),
    /// The control-mode process ended; the channel is dead
    Closed,
    /// Command did not complete within its deadline
    Timeout(String),
    /// tmux reported an error for the command
    Command(String),
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::Spawn(msg) => write!(f, "failed to start tmux control mode: {msg}"),
            ControlError::Io(msg) => write!(f, "control pipe I/O error: {msg}"),
            ControlError::Closed => write!(f, "tmux control channel closed"),
            ControlError::Timeout(cmd) => write!(f, "tmux command timed out: {cmd}"),
            ControlError::Command(msg) => write!(f, "tmux: {msg}"),
        }
    }
}

impl std::error::Error for ControlError {}

impl ControlError {
    /// True for "no such session / pane" style errors that wrappers
    /// downgrade to an empty result.
    pub fn is_not_found(&self) -> bool {
        match self {
            ControlError::Command(msg) => {
                msg.contains("can't find session")
                    || msg.contains("can't find pane")
                    || msg.contains("can't find window")
                    || msg.contains("no such session")
                    || msg.contains("session not found")
            }
            _ => false,
        }
    }

    /// True when the control channel itself is unusable and the caller
    /// should treat the failure as fatal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ControlError::Io(_) | ControlError::Closed | ControlError::Spawn(_))
    }
}
