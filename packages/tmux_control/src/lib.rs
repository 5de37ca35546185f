//! tmux control-mode plumbing: the single persistent command channel and
//! the ref-counted pipe-pane output streams built on top of it.

mod commands;
mod control;
mod error;
mod pipepane;

pub use commands::{PaneInfo, SessionInfo};
pub use control::{ControlMode, Notification, CAPTURE_TIMEOUT, DEFAULT_EXECUTE_TIMEOUT};
pub use error::ControlError;
pub use pipepane::{PipeControl, PipePaneManager, SubscriberId};
