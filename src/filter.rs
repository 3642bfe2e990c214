use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::roster::{EntryId, RosterEntry, ROW_BAND};

/// Active filter inputs. `min_value == 0` means "no lower bound" in single
/// mode; `max_value == None` means unbounded in range mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterState {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub min_value: i64,
    #[serde(default)]
    pub max_value: Option<i64>,
    #[serde(default)]
    pub range_mode: bool,
    #[serde(default)]
    pub server: Option<String>,
}

/// Per-entry filter verdict. Entries are never removed from layout (row
/// band positions must stay stable), so `visible` is always true and
/// failing the filter only ghosts the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CardFlags {
    pub visible: bool,
    pub ghosted: bool,
}

impl FilterState {
    pub fn evaluate(&self, entry: &RosterEntry) -> CardFlags {
        let ghosted = !(self.matches_text(entry)
            && self.matches_server(entry)
            && self.matches_value(entry));
        CardFlags {
            visible: true,
            ghosted,
        }
    }

    fn matches_text(&self, entry: &RosterEntry) -> bool {
        let needle = self.text.trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }
        haystack(entry).contains(&needle)
    }

    /// Placeholders and offline slots carry no server and always pass.
    fn matches_server(&self, entry: &RosterEntry) -> bool {
        let Some(server) = self.server.as_deref() else {
            return true;
        };
        match entry.record() {
            None => true,
            Some(rec) => rec.server == server,
        }
    }

    /// Entries without a live record are exempt from the value filter.
    /// Bounds are inclusive on both ends.
    fn matches_value(&self, entry: &RosterEntry) -> bool {
        let Some(rec) = entry.record() else {
            return true;
        };
        if self.range_mode {
            let lower_ok = self.min_value <= 0 || rec.dia >= self.min_value;
            let upper_ok = self.max_value.is_none_or(|max| rec.dia <= max);
            lower_ok && upper_ok
        } else {
            self.min_value <= 0 || rec.dia >= self.min_value
        }
    }
}

/// Everything the text search can match on, lowercased: the whole card
/// face, like the original full-text card match.
fn haystack(entry: &RosterEntry) -> String {
    match entry {
        RosterEntry::Real { name, record } => match record {
            Some(r) => format!(
                "{} {} {} {} {} {}",
                r.name, r.ip, r.game, r.server, r.dia, r.status
            )
            .to_lowercase(),
            None => name.to_lowercase(),
        },
        RosterEntry::Placeholder { id, note } => match note {
            Some(n) => format!("{id} {n}").to_lowercase(),
            None => id.to_lowercase(),
        },
    }
}

/// Selected roster identifiers. Selection is independent of filtering: a
/// ghosted card stays selected.
#[derive(Debug, Clone, Default)]
pub struct SelectionSet {
    ids: HashSet<EntryId>,
}

impl SelectionSet {
    pub fn contains(&self, id: &EntryId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Returns the new selected state of the id.
    pub fn toggle(&mut self, id: EntryId) -> bool {
        if self.ids.remove(&id) {
            false
        } else {
            self.ids.insert(id);
            true
        }
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    /// Selects every entry that passes the active filter.
    pub fn select_all_visible(&mut self, entries: &[RosterEntry], filter: &FilterState) {
        for entry in entries {
            if !filter.evaluate(entry).ghosted {
                self.ids.insert(entry.entry_id());
            }
        }
    }

    /// Row-band toggle, preserving the observed asymmetry: checking a band
    /// replaces the entire selection with that band's entries; unchecking
    /// drops only that band's entries and leaves the rest alone.
    pub fn toggle_row_band(&mut self, band: usize, checked: bool, entries: &[RosterEntry]) {
        let start = band * ROW_BAND;
        if start >= entries.len() {
            return;
        }
        let end = (start + ROW_BAND).min(entries.len());
        if checked {
            self.ids.clear();
            for entry in &entries[start..end] {
                self.ids.insert(entry.entry_id());
            }
        } else {
            for entry in &entries[start..end] {
                self.ids.remove(&entry.entry_id());
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntryId> {
        self.ids.iter()
    }
}
