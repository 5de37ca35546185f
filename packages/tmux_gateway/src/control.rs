//! Trait seams over the control-mode channel.
//!
//! The registry and the prompter depend on these rather than on
//! [`ControlMode`] directly so their logic is testable against mocks.

use async_trait::async_trait;
use tokio::sync::broadcast;

use tmux_control::{ControlError, ControlMode, Notification, PaneInfo, SessionInfo};

/// Read-only session state, as the registry consumes it.
#[async_trait]
pub trait SessionQuery: Send + Sync + 'static {
    async fn list_sessions(&self) -> Result<Vec<SessionInfo>, ControlError>;
    async fn pane_info(&self, session: &str) -> Result<PaneInfo, ControlError>;
    fn notifications(&self) -> broadcast::Receiver<Notification>;
}

/// Keystroke and paste injection into a pane, as the prompter consumes it.
#[async_trait]
pub trait PaneInput: Send + Sync + 'static {
    async fn send_literal(&self, target: &str, text: &str) -> Result<(), ControlError>;
    async fn send_key(&self, target: &str, name: &str) -> Result<(), ControlError>;
    async fn resize_pane(&self, target: &str, rows: u16) -> Result<(), ControlError>;
    async fn pane_height(&self, target: &str) -> Result<u16, ControlError>;
    async fn paste_payload(&self, target: &str, payload: &[u8]) -> Result<(), ControlError>;
}

#[async_trait]
impl SessionQuery for ControlMode {
    async fn list_sessions(&self) -> Result<Vec<SessionInfo>, ControlError> {
        ControlMode::list_sessions(self).await
    }

    async fn pane_info(&self, session: &str) -> Result<PaneInfo, ControlError> {
        ControlMode::pane_info(self, session).await
    }

    fn notifications(&self) -> broadcast::Receiver<Notification> {
        ControlMode::notifications(self)
    }
}

#[async_trait]
impl PaneInput for ControlMode {
    async fn send_literal(&self, target: &str, text: &str) -> Result<(), ControlError> {
        ControlMode::send_literal(self, target, text).await
    }

    async fn send_key(&self, target: &str, name: &str) -> Result<(), ControlError> {
        ControlMode::send_key(self, target, name).await
    }

    async fn resize_pane(&self, target: &str, rows: u16) -> Result<(), ControlError> {
        ControlMode::resize_pane(self, target, rows).await
    }

    async fn pane_height(&self, target: &str) -> Result<u16, ControlError> {
        ControlMode::pane_height(self, target).await
    }

    async fn paste_payload(&self, target: &str, payload: &[u8]) -> Result<(), ControlError> {
        ControlMode::paste_payload(self, target, payload).await
    }
}
