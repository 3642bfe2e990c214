use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use crate::api::{BackendClient, BackendStatus, ClientRecord, ClientTarget};
use crate::config::Settings;
use crate::dispatch::{self, DispatchError, DispatchPlan, TargetMode};
use crate::filter::{FilterState, SelectionSet};
use crate::history::{self, DiaHistory, DayView, NameFilter};
use crate::roster::{self, EntryId, RosterError, RosterOrder};
use crate::store::{SqliteStore, PREF_CONDENSED, PREF_FILTER_STATE, PREF_REFRESH_SECS};
use crate::view::{CardView, RosterView};

pub type SharedSession = Arc<Mutex<Session>>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Roster(#[from] RosterError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("unknown placeholder {0}")]
    UnknownPlaceholder(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl SessionError {
    /// Validation errors are the caller's fault; everything else is ours.
    pub fn is_validation(&self) -> bool {
        !matches!(self, SessionError::Storage(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub placeholders: usize,
    pub selected: usize,
    pub servers: Vec<String>,
    pub condensed: bool,
    pub refresh_secs: u64,
    pub paused: bool,
    pub progress: f64,
    pub last_poll: Option<String>,
    pub last_error: Option<String>,
    pub backend: Option<BackendStatus>,
}

/// All mutable dashboard state behind one lock: the poll loop and the HTTP
/// surface both go through here. No await happens while the lock is held.
pub struct Session {
    store: SqliteStore,
    order: RosterOrder,
    notes: HashMap<String, String>,
    view: RosterView,
    pub selection: SelectionSet,
    pub filter: FilterState,
    condensed: bool,
    history: DiaHistory,
    refresh_tx: watch::Sender<u64>,
    pub progress: f64,
    last_poll: Option<String>,
    last_error: Option<String>,
    backend_status: Option<BackendStatus>,
}

impl Session {
    /// Loads persisted state. A stored refresh preference overrides the
    /// configured startup interval.
    pub fn new(settings: &Settings, store: SqliteStore) -> Result<Self> {
        let order = store.load_order()?;
        let notes = store.load_notes()?;
        let history = store.load_history(0)?;

        let refresh_secs = match store.get_pref(PREF_REFRESH_SECS)? {
            Some(v) => v.parse::<u64>().unwrap_or(settings.refresh_secs),
            None => settings.refresh_secs,
        };
        let (refresh_tx, _) = watch::channel(refresh_secs);

        // Filter and display-mode preferences survive restarts; a pref
        // written by an older build that no longer parses falls back to
        // defaults rather than failing startup.
        let filter = match store.get_pref(PREF_FILTER_STATE)? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            None => FilterState::default(),
        };
        let condensed = matches!(store.get_pref(PREF_CONDENSED)?.as_deref(), Some("1"));

        let mut session = Self {
            store,
            order,
            notes,
            view: RosterView::default(),
            selection: SelectionSet::default(),
            filter,
            condensed,
            history,
            refresh_tx,
            progress: 0.0,
            last_poll: None,
            last_error: None,
            backend_status: None,
        };
        session.rebuild_view(&[]);
        Ok(session)
    }

    pub fn subscribe_refresh(&self) -> watch::Receiver<u64> {
        self.refresh_tx.subscribe()
    }

    pub fn refresh_secs(&self) -> u64 {
        *self.refresh_tx.borrow()
    }

    /// Changes the live poll interval (0 pauses) and persists it as the
    /// startup preference. The poll loop rebuilds its timer on the watch
    /// signal.
    pub fn set_refresh_secs(&mut self, secs: u64) -> Result<(), SessionError> {
        self.store
            .set_pref(PREF_REFRESH_SECS, &secs.to_string())
            .map_err(SessionError::Storage)?;
        let _ = self.refresh_tx.send(secs);
        Ok(())
    }

    fn rebuild_view(&mut self, records: &[ClientRecord]) {
        let reconciled = roster::reconcile(records, &self.order, &self.notes);
        self.order = reconciled.order;
        self.view.apply(reconciled.entries);
    }

    /// Folds one poll result into the session: merge against the stored
    /// order, persist any newcomers, refresh the card grid in place and
    /// record today's snapshot if this is the first sight of the day.
    pub fn apply_records(&mut self, records: &[ClientRecord]) -> Result<(), SessionError> {
        let today = chrono::Local::now().format("%Y-%m-%d").to_string();
        self.apply_records_at(records, &today)
    }

    fn apply_records_at(&mut self, records: &[ClientRecord], date: &str) -> Result<(), SessionError> {
        let before = self.order.clone();
        self.rebuild_view(records);
        if self.order != before {
            self.store.save_order(&self.order)?;
        }

        self.maybe_write_snapshot(records, date)?;
        self.last_poll = Some(chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string());
        self.last_error = None;
        Ok(())
    }

    fn maybe_write_snapshot(&mut self, records: &[ClientRecord], date: &str) -> Result<(), SessionError> {
        if self.history.0.contains_key(date) || self.store.has_day(date)? {
            return Ok(());
        }
        let yesterday = NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.pred_opt())
            .map(|d| d.format("%Y-%m-%d").to_string())
            .and_then(|d| self.history.0.get(&d));
        let bucket = history::snapshot_from_records(records, yesterday);
        if bucket.clients.is_empty() {
            return Ok(());
        }
        if self.store.write_day(date, &bucket)? {
            log::info!(
                "history.snapshot date={date} clients={} total={}",
                bucket.clients.len(),
                bucket.total
            );
            self.history.0.insert(date.to_string(), bucket);
        }
        Ok(())
    }

    /// Remembers that the last poll failed; the roster keeps showing the
    /// previous good state.
    pub fn poll_failed(&mut self, err: &anyhow::Error) {
        self.last_error = Some(format!("{err:#}"));
    }

    /// Replaces the active filter and persists it as a preference.
    pub fn set_filter(&mut self, filter: FilterState) -> Result<(), SessionError> {
        let raw = serde_json::to_string(&filter)
            .map_err(|e| SessionError::Storage(e.into()))?;
        self.store.set_pref(PREF_FILTER_STATE, &raw)?;
        self.filter = filter;
        Ok(())
    }

    pub fn condensed(&self) -> bool {
        self.condensed
    }

    pub fn set_condensed(&mut self, on: bool) -> Result<(), SessionError> {
        self.store.set_pref(PREF_CONDENSED, if on { "1" } else { "0" })?;
        self.condensed = on;
        Ok(())
    }

    pub fn dismiss_error(&mut self) {
        self.last_error = None;
    }

    pub fn set_backend_status(&mut self, status: Option<BackendStatus>) {
        self.backend_status = status;
    }

    // ---- roster mutations (each persists the new order) ----

    pub fn swap(&mut self, i: usize, j: usize) -> Result<bool, SessionError> {
        if !self.order.swap(i, j) {
            return Ok(false);
        }
        self.store.save_order(&self.order)?;
        self.refresh_entries();
        Ok(true)
    }

    pub fn add_placeholder(&mut self, note: Option<&str>) -> Result<EntryId, SessionError> {
        let id = self.order.append_placeholder(None);
        self.store.save_order(&self.order)?;
        if let Some(note) = note.filter(|n| !n.trim().is_empty()) {
            self.store.set_note(id.as_str(), note)?;
            self.notes.insert(id.as_str().to_string(), note.to_string());
        }
        self.refresh_entries();
        Ok(id)
    }

    pub fn remove_placeholder(&mut self, id: &EntryId) -> Result<(), SessionError> {
        self.order.remove_placeholder(id)?;
        self.store.save_order(&self.order)?;
        self.store.delete_note(id.as_str())?;
        self.notes.remove(id.as_str());
        self.refresh_entries();
        Ok(())
    }

    pub fn bulk_remove_bands(&mut self, bands: &[usize]) -> Result<usize, SessionError> {
        let removed = self.order.bulk_remove_bands(bands)?;
        self.store.save_order(&self.order)?;
        self.refresh_entries();
        Ok(removed)
    }

    pub fn set_note(&mut self, id: &EntryId, note: &str) -> Result<(), SessionError> {
        if !id.is_placeholder() || !self.order.0.contains(id) {
            return Err(SessionError::UnknownPlaceholder(id.as_str().to_string()));
        }
        if note.trim().is_empty() {
            self.store.delete_note(id.as_str())?;
            self.notes.remove(id.as_str());
        } else {
            self.store.set_note(id.as_str(), note)?;
            self.notes.insert(id.as_str().to_string(), note.to_string());
        }
        self.refresh_entries();
        Ok(())
    }

    /// Re-derives entries from the current order using the last known
    /// records, without touching snapshots or poll bookkeeping.
    fn refresh_entries(&mut self) {
        let records: Vec<ClientRecord> = self
            .view
            .entries()
            .iter()
            .filter_map(|e| e.record().cloned())
            .collect();
        let reconciled = roster::reconcile(&records, &self.order, &self.notes);
        self.order = reconciled.order;
        self.view.apply(reconciled.entries);
    }

    // ---- reads ----

    pub fn cards(&self) -> Vec<CardView> {
        self.view.render(&self.filter, &self.selection)
    }

    pub fn history(&self) -> &DiaHistory {
        &self.history
    }

    pub fn merge_history(&mut self, remote: DiaHistory) -> usize {
        self.history.merge_missing(remote)
    }

    pub fn day_view(
        &self,
        date: &str,
        server: Option<&str>,
        name: Option<&NameFilter>,
    ) -> DayView {
        self.history.build_day_view(date, server, name)
    }

    pub fn plan_dispatch(
        &self,
        mode: TargetMode,
        payload: &str,
    ) -> Result<DispatchPlan, SessionError> {
        Ok(dispatch::plan_dispatch(
            mode,
            payload,
            self.view.entries(),
            &self.selection,
            &self.filter,
        )?)
    }

    pub fn resolve_targets(&self, mode: TargetMode) -> Vec<ClientTarget> {
        dispatch::resolve_targets(mode, self.view.entries(), &self.selection, &self.filter)
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn summary(&self) -> Summary {
        let entries = self.view.entries();
        let online = entries.iter().filter(|e| e.record().is_some()).count();
        let placeholders = entries
            .iter()
            .filter(|e| e.entry_id().is_placeholder())
            .count();
        let mut servers: Vec<String> = entries
            .iter()
            .filter_map(|e| e.record())
            .map(|r| r.server.clone())
            .filter(|s| !s.is_empty())
            .collect();
        servers.sort();
        servers.dedup();

        let refresh_secs = self.refresh_secs();
        Summary {
            total: entries.len(),
            online,
            offline: entries.len() - online - placeholders,
            placeholders,
            selected: self.selection.len(),
            servers,
            condensed: self.condensed,
            refresh_secs,
            paused: refresh_secs == 0,
            progress: self.progress,
            last_poll: self.last_poll.clone(),
            last_error: self.last_error.clone(),
            backend: self.backend_status.clone(),
        }
    }
}

fn poll_interval(secs: u64) -> tokio::time::Interval {
    // 0 pauses polling: park the timer on a long period and skip its ticks.
    let period = Duration::from_secs(if secs == 0 { 3600 } else { secs });
    let mut iv = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    iv.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    iv
}

async fn poll_once(backend: &BackendClient, session: &SharedSession) {
    match backend.fetch_clients().await {
        Ok(records) => {
            let mut s = session.lock();
            match s.apply_records(&records) {
                Ok(()) => log::info!("poll.ok clients={}", records.len()),
                Err(e) => log::error!("poll.apply_error {e}"),
            }
        }
        Err(e) => {
            log::warn!("poll.error {e:#}");
            session.lock().poll_failed(&e);
        }
    }
}

/// Driver loop: client polling on the live interval, a 100ms progress
/// ticker for the refresh gauge and a backend status probe. Interval
/// changes arrive over the watch channel and rebuild the poll timer.
pub async fn run(settings: Settings, backend: BackendClient, session: SharedSession) -> Result<()> {
    let mut refresh_rx = {
        let s = session.lock();
        s.subscribe_refresh()
    };
    let mut refresh_secs = *refresh_rx.borrow();

    // Seed the history cache with whatever the backend already has.
    match backend.fetch_dia_history(settings.history_days).await {
        Ok(v) => {
            let remote = DiaHistory::from_json(&v);
            let added = session.lock().merge_history(remote);
            log::info!("history.seeded days_added={added}");
        }
        Err(e) => log::warn!("history.seed_error {e:#}"),
    }

    // First roster fetch happens immediately; the interval paces the rest.
    if refresh_secs > 0 {
        poll_once(&backend, &session).await;
    }

    let mut poll = poll_interval(refresh_secs);
    let mut poll_started = tokio::time::Instant::now();

    let mut progress_tick = tokio::time::interval(Duration::from_millis(100));
    progress_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut status_tick =
        tokio::time::interval(Duration::from_secs(settings.status_poll_secs));
    status_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = poll.tick() => {
                if refresh_secs == 0 {
                    continue;
                }
                poll_started = tokio::time::Instant::now();
                poll_once(&backend, &session).await;
            }
            _ = progress_tick.tick() => {
                let mut s = session.lock();
                s.progress = if refresh_secs == 0 {
                    0.0
                } else {
                    (poll_started.elapsed().as_secs_f64() / refresh_secs as f64).min(1.0)
                };
            }
            _ = status_tick.tick() => {
                match backend.server_status().await {
                    Ok(status) => session.lock().set_backend_status(Some(status)),
                    Err(e) => {
                        log::debug!("status.error {e:#}");
                        session.lock().set_backend_status(None);
                    }
                }
            }
            _ = refresh_rx.changed() => {
                refresh_secs = *refresh_rx.borrow();
                poll = poll_interval(refresh_secs);
                poll_started = tokio::time::Instant::now();
                log::info!("poll.interval_changed secs={refresh_secs}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static SEQ: AtomicU64 = AtomicU64::new(0);

    struct TempSession {
        session: Session,
        settings: Settings,
        path: std::path::PathBuf,
    }

    impl TempSession {
        fn new() -> Self {
            let path = std::env::temp_dir().join(format!(
                "fleetboard-session-test-{}-{}.sqlite",
                std::process::id(),
                SEQ.fetch_add(1, Ordering::SeqCst)
            ));
            let store = SqliteStore::new(path.to_str().unwrap()).unwrap();
            store.init_db().unwrap();
            let settings = Settings {
                backend_base_url: "http://127.0.0.1:1".into(),
                backend_timeout_secs: 1,
                refresh_secs: 60,
                status_poll_secs: 5,
                history_days: 7,
                sqlite_path: path.to_string_lossy().into_owned(),
                listen_host: "127.0.0.1".into(),
                listen_port: 0,
                cors_permissive: false,
            };
            let session = Session::new(&settings, store).unwrap();
            Self {
                session,
                settings,
                path,
            }
        }

        /// Fresh Session over the same database, as after a restart.
        fn reopen(&self) -> Session {
            let store = SqliteStore::new(self.path.to_str().unwrap()).unwrap();
            Session::new(&self.settings, store).unwrap()
        }
    }

    impl Drop for TempSession {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    fn rec(name: &str, server: &str, dia: i64) -> ClientRecord {
        ClientRecord {
            name: name.into(),
            ip: "10.0.0.1".into(),
            game: "NC".into(),
            server: server.into(),
            dia,
            status: "running".into(),
            last_report: String::new(),
        }
    }

    #[test]
    fn poll_persists_newcomers_and_clears_error_banner() {
        let mut t = TempSession::new();
        t.session.poll_failed(&anyhow::anyhow!("backend down"));
        assert!(t.session.summary().last_error.is_some());

        t.session
            .apply_records_at(&[rec("a", "srv1", 10), rec("b", "srv1", 20)], "2026-08-25")
            .unwrap();
        assert!(t.session.summary().last_error.is_none());

        let stored = t.session.store.load_order().unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored.0[0].as_str(), "a");
    }

    #[test]
    fn snapshot_writes_once_per_day() {
        let mut t = TempSession::new();
        t.session
            .apply_records_at(&[rec("a", "srv1", 100)], "2026-08-25")
            .unwrap();
        t.session
            .apply_records_at(&[rec("a", "srv1", 150)], "2026-08-25")
            .unwrap();

        let history = t.session.store.load_history(0).unwrap();
        assert_eq!(history.0["2026-08-25"].clients["a"].today, 100);

        // Next day records again, diffed against the cached yesterday.
        t.session
            .apply_records_at(&[rec("a", "srv1", 150)], "2026-08-26")
            .unwrap();
        let history = t.session.store.load_history(0).unwrap();
        assert_eq!(history.0["2026-08-26"].clients["a"].diff, 50);
    }

    #[test]
    fn placeholder_lifecycle_persists_order_and_note() {
        let mut t = TempSession::new();
        t.session.apply_records_at(&[rec("a", "srv1", 10)], "2026-08-25").unwrap();
        let id = t.session.add_placeholder(Some("spare slot")).unwrap();
        assert!(id.is_placeholder());
        assert_eq!(t.session.store.load_order().unwrap().len(), 2);
        assert_eq!(t.session.store.load_notes().unwrap()[id.as_str()], "spare slot");

        t.session.remove_placeholder(&id).unwrap();
        assert_eq!(t.session.store.load_order().unwrap().len(), 1);
        assert!(t.session.store.load_notes().unwrap().is_empty());

        let err = t
            .session
            .remove_placeholder(&EntryId::parse("a"))
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn swap_persists_and_survives_reload() {
        let mut t = TempSession::new();
        t.session
            .apply_records_at(&[rec("a", "srv1", 1), rec("b", "srv1", 2)], "2026-08-25")
            .unwrap();
        assert!(t.session.swap(0, 1).unwrap());
        assert!(!t.session.swap(0, 5).unwrap());

        let stored = t.session.store.load_order().unwrap();
        assert_eq!(stored.0[0].as_str(), "b");
        assert_eq!(stored.0[1].as_str(), "a");
    }

    #[test]
    fn note_rejects_unknown_or_real_targets() {
        let mut t = TempSession::new();
        t.session.apply_records_at(&[rec("a", "srv1", 1)], "2026-08-25").unwrap();

        let err = t.session.set_note(&EntryId::parse("a"), "x").unwrap_err();
        assert!(err.is_validation());
        let err = t
            .session
            .set_note(&EntryId::parse("empty-404"), "x")
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn filter_and_display_prefs_survive_restart() {
        let mut t = TempSession::new();
        t.session
            .set_filter(FilterState {
                text: "srv1".into(),
                min_value: 100,
                max_value: Some(5000),
                range_mode: true,
                server: Some("srv1".into()),
            })
            .unwrap();
        t.session.set_condensed(true).unwrap();

        let reborn = t.reopen();
        assert_eq!(reborn.filter.text, "srv1");
        assert_eq!(reborn.filter.min_value, 100);
        assert_eq!(reborn.filter.max_value, Some(5000));
        assert!(reborn.filter.range_mode);
        assert_eq!(reborn.filter.server.as_deref(), Some("srv1"));
        assert!(reborn.condensed());
        assert!(reborn.summary().condensed);
    }

    #[test]
    fn set_refresh_signals_watchers_and_persists() {
        let mut t = TempSession::new();
        let mut rx = t.session.subscribe_refresh();
        t.session.set_refresh_secs(0).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 0);
        assert_eq!(
            t.session.store.get_pref(PREF_REFRESH_SECS).unwrap().as_deref(),
            Some("0")
        );
        assert!(t.session.summary().paused);
    }
}
