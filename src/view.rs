use std::collections::HashMap;

use serde::Serialize;

use crate::filter::{CardFlags, FilterState, SelectionSet};
use crate::roster::{EntryId, RosterEntry, ROW_BAND};

/// One rendered card. `instance` is the node's creation stamp: it is
/// assigned the first time an id appears and never changes while the id
/// stays on the roster, so consumers can tell a refreshed card from a
/// rebuilt one.
#[derive(Debug, Clone, Serialize)]
pub struct CardView {
    pub id: EntryId,
    pub instance: u64,
    pub entry: RosterEntry,
    pub flags: CardFlags,
    pub checked: bool,
    pub band: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyStats {
    pub created: usize,
    pub refreshed: usize,
    pub dropped: usize,
}

/// Incremental card grid. Each poll applies the fresh entry list against
/// the per-id node map: known ids get their content replaced in place, new
/// ids get new nodes, ids missing from the list are dropped. The grid is
/// never cleared wholesale.
#[derive(Debug, Default)]
pub struct RosterView {
    entries: Vec<RosterEntry>,
    instances: HashMap<EntryId, u64>,
    next_instance: u64,
}

impl RosterView {
    pub fn apply(&mut self, entries: Vec<RosterEntry>) -> ApplyStats {
        let mut stats = ApplyStats::default();

        let mut fresh: HashMap<EntryId, u64> = HashMap::with_capacity(entries.len());
        for entry in &entries {
            let id = entry.entry_id();
            match self.instances.get(&id) {
                Some(&inst) => {
                    stats.refreshed += 1;
                    fresh.insert(id, inst);
                }
                None => {
                    stats.created += 1;
                    fresh.insert(id, self.next_instance);
                    self.next_instance += 1;
                }
            }
        }
        stats.dropped = self
            .instances
            .keys()
            .filter(|id| !fresh.contains_key(id))
            .count();

        self.instances = fresh;
        self.entries = entries;
        stats
    }

    pub fn entries(&self) -> &[RosterEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The full card list with filter flags and selection state folded in.
    pub fn render(&self, filter: &FilterState, selection: &SelectionSet) -> Vec<CardView> {
        self.entries
            .iter()
            .enumerate()
            .map(|(pos, entry)| {
                let id = entry.entry_id();
                CardView {
                    instance: self.instances.get(&id).copied().unwrap_or_default(),
                    flags: filter.evaluate(entry),
                    checked: selection.contains(&id),
                    entry: entry.clone(),
                    band: pos / ROW_BAND,
                    id,
                }
            })
            .collect()
    }
}
