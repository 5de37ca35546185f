//! Per-client include/exclude session-name filters.

use anyhow::{Context, Result};
use regex::Regex;

use crate::agents::Agent;

/// Compile optional include/exclude regex strings. Empty strings mean "no
/// filter on that side".
pub fn compile_session_filters(
    include: Option<&str>,
    exclude: Option<&str>,
) -> Result<(Option<Regex>, Option<Regex>)> {
    let include = match include.filter(|s| !s.is_empty()) {
        Some(s) => Some(Regex::new(s).context("invalid includeSessionFilter")?),
        None => None,
    };
    let exclude = match exclude.filter(|s| !s.is_empty()) {
        Some(s) => Some(Regex::new(s).context("invalid excludeSessionFilter")?),
        None => None,
    };
    Ok((include, exclude))
}

/// Whether a session name passes the filters.
pub fn passes_filter(name: &str, include: Option<&Regex>, exclude: Option<&Regex>) -> bool {
    if let Some(include) = include {
        if !include.is_match(name) {
            return false;
        }
    }
    if let Some(exclude) = exclude {
        if exclude.is_match(name) {
            return false;
        }
    }
    true
}

/// Filter an agent list by the client's filters, preserving order.
pub fn filter_agents(
    agents: Vec<Agent>,
    include: Option<&Regex>,
    exclude: Option<&Regex>,
) -> Vec<Agent> {
    agents
        .into_iter()
        .filter(|a| passes_filter(&a.name, include, exclude))
        .collect()
}
