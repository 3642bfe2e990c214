use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::history::{DayBucket, DayEntry, DiaHistory};
use crate::roster::RosterOrder;

pub const PREF_REFRESH_SECS: &str = "refresh_secs";
pub const PREF_FILTER_STATE: &str = "filter_state";
pub const PREF_CONDENSED: &str = "condensed";

#[derive(Clone)]
pub struct SqliteStore {
    path: String,
}

impl SqliteStore {
    pub fn new(path: &str) -> Result<Self> {
        if path.trim().is_empty() {
            anyhow::bail!("FLEET_SQLITE_PATH is empty");
        }
        if path != ":memory:" && !path.starts_with("file:") {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create sqlite parent dir for {path}"))?;
            }
        }

        // Note: rusqlite::Connection is not Send/Sync. We keep only a path
        // here and open short-lived connections per operation. WAL keeps
        // this fast enough for the dashboard's write pattern (one order
        // rewrite per user edit, one snapshot per day).
        Ok(Self {
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn open_conn(&self) -> Result<Connection> {
        let conn =
            Connection::open(&self.path).with_context(|| format!("open sqlite {}", self.path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Ok(conn)
    }

    pub fn init_db(&self) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS roster_order (
  position INTEGER PRIMARY KEY,
  entry_id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS placeholder_notes (
  entry_id TEXT PRIMARY KEY,
  note TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS command_templates (
  name TEXT PRIMARY KEY,
  body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS prefs (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS daily_dia (
  date TEXT NOT NULL,
  name TEXT NOT NULL,
  today INTEGER NOT NULL,
  diff INTEGER NOT NULL,
  server TEXT NOT NULL,
  game TEXT NOT NULL,
  PRIMARY KEY (date, name)
);

CREATE INDEX IF NOT EXISTS idx_daily_dia_date ON daily_dia(date);

CREATE TABLE IF NOT EXISTS daily_aggregates (
  date TEXT PRIMARY KEY,
  total INTEGER NOT NULL,
  server_sum_json TEXT NOT NULL,
  count_by_server_json TEXT NOT NULL
);
"#,
        )?;
        Ok(())
    }

    // ---- roster order ----

    pub fn load_order(&self) -> Result<RosterOrder> {
        let conn = self.open_conn()?;
        let mut stmt = conn.prepare("SELECT entry_id FROM roster_order ORDER BY position ASC")?;
        let mut rows = stmt.query([])?;
        let mut raw = Vec::new();
        while let Some(r) = rows.next()? {
            raw.push(r.get::<_, String>(0)?);
        }
        Ok(RosterOrder::from_raw(raw))
    }

    /// Full rewrite in one transaction so a crash never leaves a torn order.
    pub fn save_order(&self, order: &RosterOrder) -> Result<()> {
        let mut conn = self.open_conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM roster_order", [])?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO roster_order(position, entry_id) VALUES(?,?)")?;
            for (i, id) in order.0.iter().enumerate() {
                stmt.execute(params![i as i64, id.as_str()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // ---- placeholder notes ----

    pub fn load_notes(&self) -> Result<HashMap<String, String>> {
        let conn = self.open_conn()?;
        let mut stmt = conn.prepare("SELECT entry_id, note FROM placeholder_notes")?;
        let mut rows = stmt.query([])?;
        let mut out = HashMap::new();
        while let Some(r) = rows.next()? {
            out.insert(r.get::<_, String>(0)?, r.get::<_, String>(1)?);
        }
        Ok(out)
    }

    pub fn set_note(&self, entry_id: &str, note: &str) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute(
            r#"
INSERT INTO placeholder_notes(entry_id, note) VALUES(?,?)
ON CONFLICT(entry_id) DO UPDATE SET note=excluded.note
"#,
            params![entry_id, note],
        )?;
        Ok(())
    }

    pub fn delete_note(&self, entry_id: &str) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute(
            "DELETE FROM placeholder_notes WHERE entry_id=?",
            params![entry_id],
        )?;
        Ok(())
    }

    // ---- command templates ----

    pub fn list_templates(&self) -> Result<Vec<(String, String)>> {
        let conn = self.open_conn()?;
        let mut stmt = conn.prepare("SELECT name, body FROM command_templates ORDER BY name ASC")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            out.push((r.get::<_, String>(0)?, r.get::<_, String>(1)?));
        }
        Ok(out)
    }

    pub fn upsert_template(&self, name: &str, body: &str) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute(
            r#"
INSERT INTO command_templates(name, body) VALUES(?,?)
ON CONFLICT(name) DO UPDATE SET body=excluded.body
"#,
            params![name, body],
        )?;
        Ok(())
    }

    pub fn delete_template(&self, name: &str) -> Result<bool> {
        let conn = self.open_conn()?;
        let n = conn.execute("DELETE FROM command_templates WHERE name=?", params![name])?;
        Ok(n > 0)
    }

    // ---- prefs ----

    pub fn get_pref(&self, key: &str) -> Result<Option<String>> {
        let conn = self.open_conn()?;
        let v = conn
            .query_row("SELECT value FROM prefs WHERE key=?", params![key], |r| {
                r.get::<_, String>(0)
            })
            .optional()?;
        Ok(v)
    }

    pub fn set_pref(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute(
            r#"
INSERT INTO prefs(key, value) VALUES(?,?)
ON CONFLICT(key) DO UPDATE SET value=excluded.value
"#,
            params![key, value],
        )?;
        Ok(())
    }

    // ---- daily snapshots ----

    pub fn has_day(&self, date: &str) -> Result<bool> {
        let conn = self.open_conn()?;
        let v: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM daily_aggregates WHERE date=?",
                params![date],
                |r| r.get(0),
            )
            .optional()?;
        Ok(v.is_some())
    }

    /// Writes one day's snapshot. A day already present is immutable: the
    /// call returns Ok(false) and writes nothing. The aggregates row is the
    /// arbiter: `INSERT OR IGNORE` in an immediate transaction, so another
    /// process racing the same date loses quietly instead of erroring on
    /// the primary key.
    pub fn write_day(&self, date: &str, bucket: &DayBucket) -> Result<bool> {
        let mut conn = self.open_conn()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let claimed = tx.execute(
            r#"
INSERT OR IGNORE INTO daily_aggregates(date, total, server_sum_json, count_by_server_json)
VALUES(?,?,?,?)
"#,
            params![
                date,
                bucket.total,
                serde_json::to_string(&bucket.server_sum)?,
                serde_json::to_string(&bucket.count_by_server)?
            ],
        )?;
        if claimed == 0 {
            return Ok(false);
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO daily_dia(date, name, today, diff, server, game) VALUES(?,?,?,?,?,?)",
            )?;
            for (name, e) in &bucket.clients {
                stmt.execute(params![date, name, e.today, e.diff, e.server, e.game])?;
            }
        }
        tx.commit()?;
        Ok(true)
    }

    /// Loads the most recent `days` snapshot days (0 = everything),
    /// aggregates included.
    pub fn load_history(&self, days: u64) -> Result<DiaHistory> {
        let conn = self.open_conn()?;

        let mut history = DiaHistory::default();
        {
            let sql_all = "SELECT date, total, server_sum_json, count_by_server_json
                 FROM daily_aggregates ORDER BY date DESC";
            let sql_limited = "SELECT date, total, server_sum_json, count_by_server_json
                 FROM daily_aggregates ORDER BY date DESC LIMIT ?";
            let mut stmt = conn.prepare(if days == 0 { sql_all } else { sql_limited })?;
            let mut rows = if days == 0 {
                stmt.query([])?
            } else {
                stmt.query(params![days as i64])?
            };
            while let Some(r) = rows.next()? {
                let date: String = r.get(0)?;
                let server_sum_json: String = r.get(2)?;
                let count_json: String = r.get(3)?;
                let bucket = DayBucket {
                    clients: Default::default(),
                    total: r.get(1)?,
                    server_sum: serde_json::from_str(&server_sum_json).unwrap_or_default(),
                    count_by_server: serde_json::from_str(&count_json).unwrap_or_default(),
                };
                history.0.insert(date, bucket);
            }
        }

        if history.0.is_empty() {
            return Ok(history);
        }
        let oldest = history.0.keys().next().cloned().unwrap_or_default();

        let mut stmt = conn
            .prepare("SELECT date, name, today, diff, server, game FROM daily_dia WHERE date >= ?")?;
        let mut rows = stmt.query(params![oldest])?;
        while let Some(r) = rows.next()? {
            let date: String = r.get(0)?;
            let name: String = r.get(1)?;
            if let Some(bucket) = history.0.get_mut(&date) {
                bucket.clients.insert(
                    name,
                    DayEntry {
                        today: r.get(2)?,
                        diff: r.get(3)?,
                        server: r.get(4)?,
                        game: r.get(5)?,
                    },
                );
            }
        }

        Ok(history)
    }
}
