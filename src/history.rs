use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::api::ClientRecord;

/// Aggregate keys reserved inside a day bucket on the wire; they are never
/// client names and never iterate as clients.
pub const RESERVED_KEYS: [&str; 3] = ["TOTAL", "SERVER_SUM", "COUNT_BY_SERVER"];

/// Sparkline window length in day buckets.
pub const SPARK_WINDOW: usize = 14;

const SPARK_BLOCKS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

/// One client's recorded numbers for one day.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DayEntry {
    pub today: i64,
    pub diff: i64,
    pub server: String,
    pub game: String,
}

/// One calendar day: per-client entries plus the day aggregates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DayBucket {
    pub clients: BTreeMap<String, DayEntry>,
    pub total: i64,
    pub server_sum: BTreeMap<String, i64>,
    pub count_by_server: BTreeMap<String, i64>,
}

/// Day-keyed snapshot log. `YYYY-MM-DD` keys sort lexicographically, which
/// is chronological, so the BTreeMap iteration order is the timeline.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiaHistory(pub BTreeMap<String, DayBucket>);

/// How a day view matches client names: exact for drill-down, substring for
/// search boxes.
#[derive(Debug, Clone)]
pub enum NameFilter {
    Exact(String),
    Substring(String),
}

impl NameFilter {
    fn matches(&self, name: &str) -> bool {
        match self {
            NameFilter::Exact(n) => name == n,
            NameFilter::Substring(n) => name.to_lowercase().contains(&n.to_lowercase()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientLine {
    pub name: String,
    pub game: String,
    pub server: String,
    pub today: i64,
    pub diff: i64,
    pub sparkline: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DayView {
    pub date: String,
    pub sum: i64,
    pub lines: Vec<ClientLine>,
    pub top_gainers: Vec<ClientLine>,
    pub top_losers: Vec<ClientLine>,
}

impl DiaHistory {
    /// Decodes the backend history shape. Reserved keys move into the
    /// bucket aggregates; non-numeric values zero-substitute.
    pub fn from_json(value: &JsonValue) -> Self {
        let mut out = BTreeMap::new();
        let Some(days) = value.as_object() else {
            return Self(out);
        };
        for (date, day) in days {
            let Some(day) = day.as_object() else {
                continue;
            };
            let mut bucket = DayBucket::default();
            for (key, v) in day {
                match key.as_str() {
                    "TOTAL" => {
                        // Seen both as a bare number and as {today}.
                        bucket.total = v
                            .as_i64()
                            .or_else(|| v.get("today").and_then(JsonValue::as_i64))
                            .unwrap_or(0);
                    }
                    "SERVER_SUM" => bucket.server_sum = int_map(v),
                    "COUNT_BY_SERVER" => bucket.count_by_server = int_map(v),
                    _ => {
                        bucket.clients.insert(
                            key.clone(),
                            DayEntry {
                                today: v.get("today").and_then(JsonValue::as_i64).unwrap_or(0),
                                diff: v.get("diff").and_then(JsonValue::as_i64).unwrap_or(0),
                                server: str_field(v, "server"),
                                game: str_field(v, "game"),
                            },
                        );
                    }
                }
            }
            out.insert(date.clone(), bucket);
        }
        Self(out)
    }

    /// Inserts days missing locally; existing days are immutable and never
    /// overwritten.
    pub fn merge_missing(&mut self, other: DiaHistory) -> usize {
        let mut added = 0;
        for (date, bucket) in other.0 {
            if let std::collections::btree_map::Entry::Vacant(e) = self.0.entry(date) {
                e.insert(bucket);
                added += 1;
            }
        }
        added
    }

    /// The most recent `days` buckets (0 = everything).
    pub fn last_days(&self, days: usize) -> DiaHistory {
        if days == 0 || days >= self.0.len() {
            return self.clone();
        }
        let skip = self.0.len() - days;
        DiaHistory(
            self.0
                .iter()
                .skip(skip)
                .map(|(d, b)| (d.clone(), b.clone()))
                .collect(),
        )
    }

    pub fn build_day_view(
        &self,
        date: &str,
        server_filter: Option<&str>,
        name_filter: Option<&NameFilter>,
    ) -> DayView {
        let Some(bucket) = self.0.get(date) else {
            return DayView {
                date: date.to_string(),
                sum: 0,
                lines: Vec::new(),
                top_gainers: Vec::new(),
                top_losers: Vec::new(),
            };
        };

        let mut lines: Vec<ClientLine> = bucket
            .clients
            .iter()
            .filter(|(name, _)| match server_filter {
                Some(server) => name.starts_with(&format!("{server}-")),
                None => true,
            })
            .filter(|(name, _)| name_filter.is_none_or(|f| f.matches(name)))
            .map(|(name, entry)| ClientLine {
                name: name.clone(),
                game: entry.game.clone(),
                server: entry.server.clone(),
                today: entry.today,
                diff: entry.diff,
                sparkline: self.sparkline_for(name),
            })
            .collect();

        // Display order: smallest count first. Stable, so equal values keep
        // name order.
        lines.sort_by_key(|l| l.today);

        let mut top_gainers: Vec<ClientLine> =
            lines.iter().filter(|l| l.diff > 0).cloned().collect();
        top_gainers.sort_by_key(|l| std::cmp::Reverse(l.diff));
        top_gainers.truncate(3);

        let mut top_losers: Vec<ClientLine> =
            lines.iter().filter(|l| l.diff < 0).cloned().collect();
        top_losers.sort_by_key(|l| l.diff);
        top_losers.truncate(3);

        DayView {
            date: date.to_string(),
            sum: lines.iter().map(|l| l.today).sum(),
            lines,
            top_gainers,
            top_losers,
        }
    }

    /// The client's `today` values over the last 14 day buckets, oldest
    /// first; days where the client is absent count as zero.
    pub fn sparkline_values(&self, name: &str) -> Vec<i64> {
        let skip = self.0.len().saturating_sub(SPARK_WINDOW);
        self.0
            .values()
            .skip(skip)
            .map(|bucket| bucket.clients.get(name).map_or(0, |e| e.today))
            .collect()
    }

    pub fn sparkline_for(&self, name: &str) -> String {
        render_sparkline(&self.sparkline_values(name))
    }

    /// TOTAL per day, oldest first, for the trend chart.
    pub fn total_series(&self) -> Vec<(String, i64)> {
        self.0
            .iter()
            .map(|(date, bucket)| (date.clone(), bucket.total))
            .collect()
    }

    /// Per-server daily sums, oldest first. The stored server field wins;
    /// names fall back to their `<server>-` prefix.
    pub fn server_series(&self) -> BTreeMap<String, Vec<(String, i64)>> {
        let mut servers: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
        for bucket in self.0.values() {
            for (name, entry) in &bucket.clients {
                servers.insert(server_of(name, entry).to_string());
            }
        }

        let mut out = BTreeMap::new();
        for server in servers {
            let series = self
                .0
                .iter()
                .map(|(date, bucket)| {
                    let sum = bucket
                        .clients
                        .iter()
                        .filter(|(name, entry)| server_of(name, entry) == server)
                        .map(|(_, e)| e.today)
                        .sum();
                    (date.clone(), sum)
                })
                .collect();
            out.insert(server, series);
        }
        out
    }
}

fn server_of<'a>(name: &'a str, entry: &'a DayEntry) -> &'a str {
    if !entry.server.is_empty() {
        return &entry.server;
    }
    name.split('-').next().unwrap_or(name)
}

fn int_map(v: &JsonValue) -> BTreeMap<String, i64> {
    v.as_object()
        .map(|m| {
            m.iter()
                .map(|(k, v)| (k.clone(), v.as_i64().unwrap_or(0)))
                .collect()
        })
        .unwrap_or_default()
}

fn str_field(v: &JsonValue, key: &str) -> String {
    v.get(key)
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Renders a fixed-width sparkline. The positive values of the window are
/// right-aligned and left-padded with zeros to 14 slots; an all-zero window
/// renders as the empty string. Levels quantize the padded window's
/// min..max range onto 8 block glyphs.
pub fn render_sparkline(values: &[i64]) -> String {
    let actual: Vec<i64> = values.iter().copied().filter(|v| *v > 0).collect();
    if actual.is_empty() {
        return String::new();
    }
    let pad = SPARK_WINDOW.saturating_sub(actual.len());
    let padded: Vec<i64> = std::iter::repeat_n(0, pad).chain(actual).collect();

    let min = padded.iter().copied().min().unwrap_or(0);
    let max = padded.iter().copied().max().unwrap_or(0);
    let range = (max - min).max(1);

    padded
        .iter()
        .map(|v| {
            let level = ((v - min) * (SPARK_BLOCKS.len() as i64 - 1) / range) as usize;
            SPARK_BLOCKS[level.min(SPARK_BLOCKS.len() - 1)]
        })
        .collect()
}

/// Builds today's bucket from a live poll. Clients without a server or with
/// a zero count are not recorded (matching the producer the backend feeds);
/// diff is measured against yesterday's bucket when one exists.
pub fn snapshot_from_records(records: &[ClientRecord], yesterday: Option<&DayBucket>) -> DayBucket {
    let mut bucket = DayBucket::default();
    for rec in records {
        if rec.server.is_empty() || rec.dia == 0 {
            continue;
        }
        if bucket.clients.contains_key(&rec.name) {
            continue;
        }
        let prev = yesterday.and_then(|b| b.clients.get(&rec.name)).map(|e| e.today);
        bucket.clients.insert(
            rec.name.clone(),
            DayEntry {
                today: rec.dia,
                diff: rec.dia - prev.unwrap_or(0),
                server: rec.server.clone(),
                game: rec.game.clone(),
            },
        );
        bucket.total += rec.dia;
        *bucket.server_sum.entry(rec.server.clone()).or_insert(0) += rec.dia;
        *bucket.count_by_server.entry(rec.server.clone()).or_insert(0) += 1;
    }
    bucket
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(today: i64, diff: i64, server: &str) -> DayEntry {
        DayEntry {
            today,
            diff,
            server: server.into(),
            game: "NC".into(),
        }
    }

    fn history_one_day(entries: &[(&str, i64, i64)]) -> DiaHistory {
        let mut bucket = DayBucket::default();
        for (name, today, diff) in entries {
            bucket.clients.insert(name.to_string(), entry(*today, *diff, "srv1"));
        }
        DiaHistory(BTreeMap::from([("2026-08-25".to_string(), bucket)]))
    }

    #[test]
    fn from_json_splits_reserved_keys_from_clients() {
        let h = DiaHistory::from_json(&serde_json::json!({
            "2026-08-24": {
                "TOTAL": 300,
                "SERVER_SUM": {"srv1": 300},
                "COUNT_BY_SERVER": {"srv1": 2},
                "srv1-01": {"today": 100, "diff": 10, "server": "srv1", "game": "NC"},
                "srv1-02": {"today": 200, "diff": -5},
            }
        }));
        let bucket = &h.0["2026-08-24"];
        assert_eq!(bucket.total, 300);
        assert_eq!(bucket.clients.len(), 2);
        assert!(!bucket.clients.contains_key("TOTAL"));
        assert_eq!(bucket.server_sum["srv1"], 300);
        assert_eq!(bucket.clients["srv1-02"].server, "");
    }

    #[test]
    fn from_json_accepts_object_total_and_garbage_values() {
        let h = DiaHistory::from_json(&serde_json::json!({
            "2026-08-24": {
                "TOTAL": {"today": 42},
                "srv1-01": {"today": "broken", "diff": null},
            }
        }));
        let bucket = &h.0["2026-08-24"];
        assert_eq!(bucket.total, 42);
        assert_eq!(bucket.clients["srv1-01"].today, 0);
        assert_eq!(bucket.clients["srv1-01"].diff, 0);
    }

    #[test]
    fn day_view_sorts_ascending_by_today() {
        let h = history_one_day(&[("a", 300, 0), ("b", 100, 0), ("c", 200, 0)]);
        let view = h.build_day_view("2026-08-25", None, None);
        let names: Vec<&str> = view.lines.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c", "a"]);
        assert_eq!(view.sum, 600);
    }

    #[test]
    fn top_movers_rank_and_truncate() {
        let h = history_one_day(&[
            ("a", 1, 50),
            ("b", 2, 30),
            ("c", 3, 80),
            ("d", 4, -10),
            ("e", 5, -5),
            ("f", 6, -40),
            ("g", 7, 10),
        ]);
        let view = h.build_day_view("2026-08-25", None, None);

        let gains: Vec<i64> = view.top_gainers.iter().map(|l| l.diff).collect();
        assert_eq!(gains, vec![80, 50, 30]);

        let losses: Vec<i64> = view.top_losers.iter().map(|l| l.diff).collect();
        assert_eq!(losses, vec![-40, -10, -5]);
    }

    #[test]
    fn server_prefix_filter_and_name_filters() {
        let h = history_one_day(&[("srv1-01", 10, 0), ("srv2-01", 20, 0), ("srv1-02", 30, 0)]);
        let view = h.build_day_view("2026-08-25", Some("srv1"), None);
        assert_eq!(view.lines.len(), 2);

        let view = h.build_day_view(
            "2026-08-25",
            None,
            Some(&NameFilter::Exact("srv2-01".into())),
        );
        assert_eq!(view.lines.len(), 1);
        assert_eq!(view.lines[0].name, "srv2-01");

        let view = h.build_day_view(
            "2026-08-25",
            None,
            Some(&NameFilter::Substring("SRV1".into())),
        );
        assert_eq!(view.lines.len(), 2);
    }

    #[test]
    fn missing_day_yields_empty_view() {
        let h = DiaHistory::default();
        let view = h.build_day_view("2026-01-01", None, None);
        assert_eq!(view.sum, 0);
        assert!(view.lines.is_empty());
    }

    #[test]
    fn sparkline_all_zero_is_empty() {
        assert_eq!(render_sparkline(&[0, 0, 0]), "");
        assert_eq!(render_sparkline(&[]), "");
    }

    #[test]
    fn sparkline_quantizes_min_to_lowest_and_max_to_highest() {
        // A full window avoids zero padding, so min maps to the lowest
        // glyph and max to the highest.
        let values: Vec<i64> = (0..SPARK_WINDOW as i64).map(|i| 10 + i * 10).collect();
        let s = render_sparkline(&values);
        let chars: Vec<char> = s.chars().collect();
        assert_eq!(chars.len(), SPARK_WINDOW);
        assert_eq!(chars[0], '▁');
        assert_eq!(chars[SPARK_WINDOW - 1], '█');
    }

    #[test]
    fn sparkline_right_aligns_sparse_values() {
        let s = render_sparkline(&[0, 0, 10, 20]);
        let chars: Vec<char> = s.chars().collect();
        assert_eq!(chars.len(), SPARK_WINDOW);
        // 12 padded zeros, then the two recorded values.
        assert!(chars[..12].iter().all(|c| *c == '▁'));
        assert_eq!(chars[13], '█');
        assert!(chars[12] > chars[0]);
    }

    #[test]
    fn snapshot_skips_serverless_and_zero_counts() {
        let records = vec![
            crate::api::ClientRecord {
                name: "srv1-01".into(),
                ip: String::new(),
                game: "NC".into(),
                server: "srv1".into(),
                dia: 100,
                status: String::new(),
                last_report: String::new(),
            },
            crate::api::ClientRecord {
                name: "lost".into(),
                ip: String::new(),
                game: String::new(),
                server: String::new(),
                dia: 50,
                status: String::new(),
                last_report: String::new(),
            },
        ];
        let bucket = snapshot_from_records(&records, None);
        assert_eq!(bucket.clients.len(), 1);
        assert_eq!(bucket.total, 100);
        assert_eq!(bucket.count_by_server["srv1"], 1);
    }

    #[test]
    fn snapshot_diff_measures_against_yesterday() {
        let mut yesterday = DayBucket::default();
        yesterday.clients.insert("srv1-01".into(), entry(80, 0, "srv1"));

        let records = vec![crate::api::ClientRecord {
            name: "srv1-01".into(),
            ip: String::new(),
            game: "NC".into(),
            server: "srv1".into(),
            dia: 100,
            status: String::new(),
            last_report: String::new(),
        }];
        let bucket = snapshot_from_records(&records, Some(&yesterday));
        assert_eq!(bucket.clients["srv1-01"].diff, 20);

        let bucket = snapshot_from_records(&records, None);
        assert_eq!(bucket.clients["srv1-01"].diff, 100);
    }

    #[test]
    fn last_days_takes_the_most_recent_buckets() {
        let mut h = DiaHistory::default();
        for d in 1..=5 {
            h.0.insert(format!("2026-08-0{d}"), DayBucket::default());
        }
        let recent = h.last_days(2);
        let dates: Vec<&String> = recent.0.keys().collect();
        assert_eq!(dates, vec!["2026-08-04", "2026-08-05"]);
        assert_eq!(h.last_days(0).0.len(), 5);
    }
}
