//! Connection-gate plumbing shared by the WebSocket endpoint: token
//! verification, origin matching, and per-client session-name filters.

mod auth;
mod filters;

pub use auth::{is_authorized, origin_allowed, tokens_equal};
pub use filters::{compile_session_filters, filter_agents, passes_filter};
