use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::ClientTarget;
use crate::filter::{FilterState, SelectionSet};
use crate::roster::RosterEntry;

/// Which roster slice a command goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetMode {
    All,
    Filtered,
    Selected,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no clients match the requested target mode")]
    EmptyTargetSet,
    #[error("command payload is empty")]
    EmptyPayload,
}

/// A validated command send: who gets it and what they get.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchPlan {
    pub targets: Vec<ClientTarget>,
    pub payload: String,
}

/// Resolves the concrete target list for a mode, in roster order.
///
/// Placeholders and offline slots are never targets in any mode. Filtered
/// skips ghosted cards; Selected takes selected entries whether ghosted or
/// not (selection is independent of the filter).
pub fn resolve_targets(
    mode: TargetMode,
    entries: &[RosterEntry],
    selection: &SelectionSet,
    filter: &FilterState,
) -> Vec<ClientTarget> {
    entries
        .iter()
        .filter(|entry| match mode {
            TargetMode::All => true,
            TargetMode::Filtered => !filter.evaluate(entry).ghosted,
            TargetMode::Selected => selection.contains(&entry.entry_id()),
        })
        .filter_map(|entry| entry.record())
        .map(|rec| ClientTarget {
            name: rec.name.clone(),
            ip: sanitize_ip(&rec.ip),
        })
        .collect()
}

/// Builds the plan or rejects it before anything leaves the process.
pub fn plan_dispatch(
    mode: TargetMode,
    payload: &str,
    entries: &[RosterEntry],
    selection: &SelectionSet,
    filter: &FilterState,
) -> Result<DispatchPlan, DispatchError> {
    if payload.trim().is_empty() {
        return Err(DispatchError::EmptyPayload);
    }
    let targets = resolve_targets(mode, entries, selection, filter);
    if targets.is_empty() {
        return Err(DispatchError::EmptyTargetSet);
    }
    Ok(DispatchPlan {
        targets,
        payload: payload.to_string(),
    })
}

/// Addresses arrive from client reports with stray whitespace and port or
/// annotation junk; only digits and dots survive.
pub fn sanitize_ip(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect()
}
