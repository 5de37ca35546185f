//! Agent discovery: runtime detection and the canonical registry.

mod detect;
mod registry;

use serde::Serialize;

pub use detect::detect_runtime;
pub use registry::{Registry, RegistryEvent, RegistryEventKind};

/// A live agent session as exposed to clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    /// The tmux session name; unique key.
    pub name: String,
    /// Detected runtime (`claude`, `gemini`, …); never empty for an agent
    /// in the registry.
    pub runtime: String,
    pub work_dir: String,
    pub attached: bool,
}
