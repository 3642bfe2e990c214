use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::ClientRecord;

/// Fixed size of one selectable/deletable row band in the card grid.
pub const ROW_BAND: usize = 20;

/// Persisted naming convention for user-created empty slots. Parsing the
/// prefix happens in exactly one place (`EntryId::parse`); everything past
/// that works on the tagged variant.
pub const PLACEHOLDER_PREFIX: &str = "empty-";

/// Typed roster identifier. `Client` holds the backend-reported name,
/// `Placeholder` holds the full `empty-<token>` id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntryId {
    Client(String),
    Placeholder(String),
}

impl EntryId {
    pub fn parse(raw: &str) -> Self {
        if raw.starts_with(PLACEHOLDER_PREFIX) {
            EntryId::Placeholder(raw.to_string())
        } else {
            EntryId::Client(raw.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EntryId::Client(s) | EntryId::Placeholder(s) => s,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, EntryId::Placeholder(_))
    }
}

impl From<String> for EntryId {
    fn from(raw: String) -> Self {
        EntryId::parse(&raw)
    }
}

impl From<EntryId> for String {
    fn from(id: EntryId) -> Self {
        id.as_str().to_string()
    }
}

/// One slot of the display roster. A `Real` entry keeps its slot even when
/// the client is missing from the latest poll (`record: None` = offline);
/// only placeholders are ever deletable.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RosterEntry {
    Real {
        name: String,
        record: Option<ClientRecord>,
    },
    Placeholder {
        id: String,
        note: Option<String>,
    },
}

impl RosterEntry {
    pub fn entry_id(&self) -> EntryId {
        match self {
            RosterEntry::Real { name, .. } => EntryId::Client(name.clone()),
            RosterEntry::Placeholder { id, .. } => EntryId::Placeholder(id.clone()),
        }
    }

    pub fn record(&self) -> Option<&ClientRecord> {
        match self {
            RosterEntry::Real { record, .. } => record.as_ref(),
            RosterEntry::Placeholder { .. } => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RosterError {
    /// Only placeholder slots may be removed; real clients keep their slot.
    #[error("{0} is a real client slot and cannot be removed")]
    ProtectedEntity(String),
    /// Band bulk-delete is all-or-nothing: one real client anywhere in the
    /// requested rows rejects the whole batch.
    #[error("rows {} contain real clients; nothing was deleted", fmt_rows(.0))]
    ProtectedRowContainsRealClient(Vec<usize>),
}

fn fmt_rows(rows: &[usize]) -> String {
    rows.iter()
        .map(|r| (r + 1).to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// The user-defined ordering of roster identifiers, real and placeholder.
/// Owned by the session and persisted through the store after every
/// mutation; all operations here are pure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterOrder(pub Vec<EntryId>);

impl RosterOrder {
    pub fn from_raw<I: IntoIterator<Item = String>>(raw: I) -> Self {
        Self(raw.into_iter().map(|s| EntryId::parse(&s)).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Pairwise swap of two slots (drag-swap). Returns false (and changes
    /// nothing) when the indices are equal or out of bounds.
    pub fn swap(&mut self, i: usize, j: usize) -> bool {
        if i == j || i >= self.0.len() || j >= self.0.len() {
            return false;
        }
        self.0.swap(i, j);
        true
    }

    /// Appends a new placeholder slot. When no token is supplied one is
    /// generated from the current unix-millis clock, uniquified against the
    /// existing order.
    pub fn append_placeholder(&mut self, token: Option<&str>) -> EntryId {
        let base = match token {
            Some(t) => format!("{PLACEHOLDER_PREFIX}{t}"),
            None => format!(
                "{PLACEHOLDER_PREFIX}{}",
                chrono::Utc::now().timestamp_millis()
            ),
        };
        let mut raw = base.clone();
        let mut n = 1;
        while self.0.iter().any(|id| id.as_str() == raw) {
            raw = format!("{base}-{n}");
            n += 1;
        }
        let id = EntryId::Placeholder(raw);
        self.0.push(id.clone());
        id
    }

    pub fn remove_placeholder(&mut self, id: &EntryId) -> Result<(), RosterError> {
        if !id.is_placeholder() {
            return Err(RosterError::ProtectedEntity(id.as_str().to_string()));
        }
        self.0.retain(|e| e != id);
        Ok(())
    }

    pub fn band_count(&self) -> usize {
        self.0.len().div_ceil(ROW_BAND)
    }

    /// Identifiers in one row band (positions `band*20 .. band*20+20`).
    pub fn band_slice(&self, band: usize) -> &[EntryId] {
        let start = band * ROW_BAND;
        if start >= self.0.len() {
            return &[];
        }
        let end = (start + ROW_BAND).min(self.0.len());
        &self.0[start..end]
    }

    /// Deletes every id in the requested bands in one go. Rejected wholesale
    /// when any of those slots holds a real client.
    pub fn bulk_remove_bands(&mut self, bands: &[usize]) -> Result<usize, RosterError> {
        let mut blocked: Vec<usize> = Vec::new();
        let mut doomed: HashSet<EntryId> = HashSet::new();
        for &band in bands {
            let slice = self.band_slice(band);
            if slice.iter().any(|id| !id.is_placeholder()) {
                blocked.push(band);
            } else {
                doomed.extend(slice.iter().cloned());
            }
        }
        if !blocked.is_empty() {
            blocked.sort_unstable();
            return Err(RosterError::ProtectedRowContainsRealClient(blocked));
        }
        let before = self.0.len();
        self.0.retain(|id| !doomed.contains(id));
        Ok(before - self.0.len())
    }
}

/// Result of merging a server snapshot into the stored order.
#[derive(Debug)]
pub struct Reconciled {
    pub entries: Vec<RosterEntry>,
    /// New canonical order (stored order plus newcomers); the caller
    /// persists it so newcomers keep their slot from first sight on.
    pub order: RosterOrder,
}

/// Merges the latest server snapshot with the persisted order.
///
/// Every id already in the order keeps its position: placeholders stay
/// placeholders, names with a lookup hit become live `Real` entries, names
/// without one become offline `Real` entries (their slot is retained).
/// Names the server reports that the order has never seen are appended in
/// the server's relative order. Duplicate names in the snapshot are a data
/// anomaly: first occurrence wins, logged, never fatal.
pub fn reconcile(
    records: &[ClientRecord],
    order: &RosterOrder,
    notes: &HashMap<String, String>,
) -> Reconciled {
    let mut lookup: HashMap<&str, &ClientRecord> = HashMap::with_capacity(records.len());
    for rec in records {
        if lookup.contains_key(rec.name.as_str()) {
            log::warn!("roster.duplicate_client name={} (keeping first)", rec.name);
            continue;
        }
        lookup.insert(rec.name.as_str(), rec);
    }

    let mut seen: HashSet<String> = order.0.iter().map(|id| id.as_str().to_string()).collect();
    let mut merged = order.clone();
    for rec in records {
        // Newcomers append in server-reported order; the duplicate anomaly
        // above also dedups here via `seen`.
        if seen.insert(rec.name.clone()) {
            merged.0.push(EntryId::Client(rec.name.clone()));
        }
    }

    let entries = merged
        .0
        .iter()
        .map(|id| match id {
            EntryId::Client(name) => RosterEntry::Real {
                name: name.clone(),
                record: lookup.get(name.as_str()).map(|r| (*r).clone()),
            },
            EntryId::Placeholder(raw) => RosterEntry::Placeholder {
                id: raw.clone(),
                note: notes.get(raw).cloned(),
            },
        })
        .collect();

    Reconciled {
        entries,
        order: merged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(name: &str, server: &str, dia: i64) -> ClientRecord {
        ClientRecord {
            name: name.into(),
            ip: "10.0.0.1".into(),
            game: "NC".into(),
            server: server.into(),
            dia,
            status: "running".into(),
            last_report: "2026-08-25 09:00:00".into(),
        }
    }

    fn order_of(ids: &[&str]) -> RosterOrder {
        RosterOrder::from_raw(ids.iter().map(|s| s.to_string()))
    }

    #[test]
    fn entry_id_parse_tags_placeholders() {
        assert!(EntryId::parse("empty-123").is_placeholder());
        assert!(!EntryId::parse("srv1-07").is_placeholder());
        assert_eq!(EntryId::parse("srv1-07").as_str(), "srv1-07");
    }

    #[test]
    fn reconcile_preserves_stored_order_and_appends_newcomers() {
        let order = order_of(&["b", "empty-1", "a"]);
        let records = vec![rec("a", "srv1", 10), rec("c", "srv1", 20), rec("b", "srv2", 5)];
        let out = reconcile(&records, &order, &HashMap::new());

        let ids: Vec<&str> = out.entries.iter().map(|e| match e {
            RosterEntry::Real { name, .. } => name.as_str(),
            RosterEntry::Placeholder { id, .. } => id.as_str(),
        })
        .collect();
        // Stored prefix untouched, newcomer "c" appended in server order.
        assert_eq!(ids, vec!["b", "empty-1", "a", "c"]);
        assert_eq!(out.order, order_of(&["b", "empty-1", "a", "c"]));
    }

    #[test]
    fn reconcile_keeps_offline_real_clients_in_place() {
        let order = order_of(&["gone", "here"]);
        let records = vec![rec("here", "srv1", 10)];
        let out = reconcile(&records, &order, &HashMap::new());

        assert_eq!(out.order, order);
        match &out.entries[0] {
            RosterEntry::Real { name, record } => {
                assert_eq!(name, "gone");
                assert!(record.is_none());
            }
            other => panic!("expected offline real entry, got {other:?}"),
        }
        assert!(out.entries[1].record().is_some());
    }

    #[test]
    fn reconcile_first_wins_on_duplicate_names() {
        let order = RosterOrder::default();
        let records = vec![rec("dup", "srv1", 1), rec("dup", "srv2", 2)];
        let out = reconcile(&records, &order, &HashMap::new());
        assert_eq!(out.entries.len(), 1);
        assert_eq!(out.entries[0].record().unwrap().server, "srv1");
    }

    #[test]
    fn reconcile_carries_placeholder_notes() {
        let order = order_of(&["empty-7"]);
        let notes = HashMap::from([("empty-7".to_string(), "reserved for srv3".to_string())]);
        let out = reconcile(&[], &order, &notes);
        match &out.entries[0] {
            RosterEntry::Placeholder { note, .. } => {
                assert_eq!(note.as_deref(), Some("reserved for srv3"));
            }
            other => panic!("expected placeholder, got {other:?}"),
        }
    }

    #[test]
    fn swap_is_an_involution() {
        let original = order_of(&["a", "b", "c", "d"]);
        let mut order = original.clone();
        assert!(order.swap(1, 3));
        assert_ne!(order, original);
        assert!(order.swap(1, 3));
        assert_eq!(order, original);
    }

    #[test]
    fn swap_ignores_equal_and_out_of_bounds_indices() {
        let original = order_of(&["a", "b"]);
        let mut order = original.clone();
        assert!(!order.swap(1, 1));
        assert!(!order.swap(0, 5));
        assert_eq!(order, original);
    }

    #[test]
    fn append_placeholder_uniquifies_generated_ids() {
        let mut order = RosterOrder::default();
        let a = order.append_placeholder(Some("x"));
        let b = order.append_placeholder(Some("x"));
        assert_eq!(a.as_str(), "empty-x");
        assert_eq!(b.as_str(), "empty-x-1");
        assert_eq!(order.len(), 2);
    }

    #[test]
    fn remove_placeholder_rejects_real_clients() {
        let mut order = order_of(&["srv1-07", "empty-1"]);
        let before = order.clone();
        let err = order
            .remove_placeholder(&EntryId::parse("srv1-07"))
            .unwrap_err();
        assert_eq!(err, RosterError::ProtectedEntity("srv1-07".into()));
        assert_eq!(order, before);

        order.remove_placeholder(&EntryId::parse("empty-1")).unwrap();
        assert_eq!(order, order_of(&["srv1-07"]));
    }

    #[test]
    fn bulk_remove_rejects_band_with_one_real_client() {
        // 19 placeholders plus one real client in band 0.
        let mut raw: Vec<String> = (0..19).map(|i| format!("empty-{i}")).collect();
        raw.insert(7, "srv1-07".to_string());
        let mut order = RosterOrder::from_raw(raw);
        let before = order.clone();

        let err = order.bulk_remove_bands(&[0]).unwrap_err();
        assert_eq!(err, RosterError::ProtectedRowContainsRealClient(vec![0]));
        assert_eq!(order, before);
    }

    #[test]
    fn bulk_remove_deletes_placeholder_only_bands() {
        let raw: Vec<String> = (0..40).map(|i| format!("empty-{i}")).collect();
        let mut order = RosterOrder::from_raw(raw);
        let removed = order.bulk_remove_bands(&[1]).unwrap();
        assert_eq!(removed, 20);
        assert_eq!(order.len(), 20);
        assert_eq!(order.0[0].as_str(), "empty-0");
        assert_eq!(order.0[19].as_str(), "empty-19");
    }

    #[test]
    fn band_slice_handles_partial_last_band() {
        let order = RosterOrder::from_raw((0..25).map(|i| format!("empty-{i}")));
        assert_eq!(order.band_count(), 2);
        assert_eq!(order.band_slice(1).len(), 5);
        assert!(order.band_slice(2).is_empty());
    }
}
