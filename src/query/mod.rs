pub mod export;

use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::validate::{is_valid_session_id, is_valid_track_stem};
use crate::event::EventType;
use crate::store::{from_millis, EventStore, StoredEvent, EVENT_COLUMNS};

pub const DEFAULT_LIMIT: usize = 1000;
pub const MAX_LIMIT: usize = 10_000;
pub const MAX_FILTER_STEMS: usize = 100;
pub const DROPOUT_BINS: usize = 10;

/// Loosely-typed filter as supplied by callers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EventFilter {
    /// Inclusive lower bound on creation time.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on creation time.
    pub until: Option<DateTime<Utc>>,
    pub track_stems: Vec<String>,
    pub event_types: Vec<String>,
    pub limit: Option<usize>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("time range is empty: since must be before until")]
    EmptyRange,

    #[error("invalid track stem {0:?}")]
    InvalidTrackStem(String),

    #[error("{count} track stems given, limit is {limit}")]
    TooManyTrackStems { count: usize, limit: usize },

    #[error("unknown event type {0:?}")]
    UnknownEventType(String),
}

/// Validated filter with deduplicated stems and types and a clamped limit.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedFilter {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub track_stems: Vec<String>,
    pub event_types: Vec<EventType>,
    pub limit: usize,
}

impl Default for NormalizedFilter {
    fn default() -> Self {
        Self {
            since: None,
            until: None,
            track_stems: Vec::new(),
            event_types: Vec::new(),
            limit: DEFAULT_LIMIT,
        }
    }
}

impl EventFilter {
    pub fn normalize(&self) -> Result<NormalizedFilter, FilterError> {
        if let (Some(since), Some(until)) = (self.since, self.until) {
            if since >= until {
                return Err(FilterError::EmptyRange);
            }
        }

        let mut track_stems: Vec<String> = Vec::with_capacity(self.track_stems.len());
        for stem in &self.track_stems {
            if !is_valid_track_stem(stem) {
                return Err(FilterError::InvalidTrackStem(stem.clone()));
            }
            if !track_stems.contains(stem) {
                track_stems.push(stem.clone());
            }
        }
        if track_stems.len() > MAX_FILTER_STEMS {
            return Err(FilterError::TooManyTrackStems {
                count: track_stems.len(),
                limit: MAX_FILTER_STEMS,
            });
        }

        let mut event_types = Vec::with_capacity(self.event_types.len());
        for name in &self.event_types {
            let t = EventType::from_name(name)
                .ok_or_else(|| FilterError::UnknownEventType(name.clone()))?;
            if !event_types.contains(&t) {
                event_types.push(t);
            }
        }

        Ok(NormalizedFilter {
            since: self.since,
            until: self.until,
            track_stems,
            event_types,
            limit: self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
        })
    }
}

/// SQL fragment plus positional parameters.
#[derive(Clone)]
struct Clause {
    sql: String,
    params: Vec<SqlValue>,
}

impl Clause {
    fn new() -> Self {
        Self {
            sql: String::new(),
            params: Vec::new(),
        }
    }

    fn push(&mut self, condition: &str, values: impl IntoIterator<Item = SqlValue>) {
        self.sql.push_str(if self.sql.is_empty() { " WHERE " } else { " AND " });
        self.sql.push_str(condition);
        self.params.extend(values);
    }

    fn push_in(&mut self, column: &str, values: Vec<SqlValue>) {
        if values.is_empty() {
            return;
        }
        let placeholders = vec!["?"; values.len()].join(", ");
        self.push(&format!("{column} IN ({placeholders})"), values);
    }
}

impl NormalizedFilter {
    /// Conditions over raw event rows.
    fn event_clause(&self) -> Clause {
        let mut clause = Clause::new();
        if let Some(since) = self.since {
            clause.push(
                "created_at_ms >= ?",
                [SqlValue::Integer(since.timestamp_millis())],
            );
        }
        if let Some(until) = self.until {
            clause.push(
                "created_at_ms < ?",
                [SqlValue::Integer(until.timestamp_millis())],
            );
        }
        self.push_sets(&mut clause);
        clause
    }

    /// Conditions over rollup rows: a day matches when it overlaps the range.
    fn rollup_clause(&self) -> Clause {
        let mut clause = Clause::new();
        if let Some(since) = self.since {
            clause.push("day >= ?", [SqlValue::Text(day_label(since.date_naive()))]);
        }
        if let Some(until) = self.until {
            let last = (until - Duration::milliseconds(1)).date_naive();
            clause.push("day <= ?", [SqlValue::Text(day_label(last))]);
        }
        self.push_sets(&mut clause);
        clause
    }

    fn push_sets(&self, clause: &mut Clause) {
        clause.push_in(
            "track_stem",
            self.track_stems.iter().cloned().map(SqlValue::Text).collect(),
        );
        clause.push_in(
            "event_type",
            self.event_types
                .iter()
                .map(|t| SqlValue::Text(t.as_str().to_string()))
                .collect(),
        );
    }
}

fn day_label(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

/// Play and completion counts for one track.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackStats {
    pub track_stem: String,
    pub plays: u64,
    pub completions: u64,
    pub dropouts: u64,
    /// Completions per play; 0 when the track was never played.
    pub completion_rate: f64,
    /// Dropouts per play; 0 when the track was never played.
    pub dropout_rate: f64,
}

/// Per-track counts ordered by plays, then stem.
pub fn track_stats(store: &EventStore, filter: &NormalizedFilter) -> Result<Vec<TrackStats>> {
    let mut clause = filter.event_clause();
    clause.push("track_stem != ''", std::iter::empty());
    clause.params.push(SqlValue::Integer(filter.limit as i64));

    let sql = format!(
        "SELECT track_stem, \
                SUM(event_type = 'play'), \
                SUM(event_type = 'complete'), \
                SUM(event_type = 'dropout') \
         FROM events{} \
         GROUP BY track_stem \
         ORDER BY 2 DESC, track_stem \
         LIMIT ?",
        clause.sql
    );

    store.with_reader(|conn| {
        let mut stmt = conn.prepare(&sql).context("preparing track stats query")?;
        let rows = stmt
            .query_map(params_from_iter(clause.params.iter()), |row| {
                let plays: i64 = row.get(1)?;
                let completions: i64 = row.get(2)?;
                let dropouts: i64 = row.get(3)?;
                Ok(TrackStats {
                    track_stem: row.get(0)?,
                    plays: plays as u64,
                    completions: completions as u64,
                    dropouts: dropouts as u64,
                    completion_rate: ratio(completions, plays),
                    dropout_rate: ratio(dropouts, plays),
                })
            })
            .context("querying track stats")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("reading track stats")?;
        Ok(rows)
    })
}

fn ratio(n: i64, d: i64) -> f64 {
    if d <= 0 {
        0.0
    } else {
        n as f64 / d as f64
    }
}

/// Dropout positions for one track in ten equal bins of its played length.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DropoutHistogram {
    pub track_stem: String,
    /// Longest position observed for the track; the normalization base.
    pub max_position_seconds: f64,
    pub bins: [u64; DROPOUT_BINS],
    pub total: u64,
}

/// Histograms for every track with at least one dropout, ordered by stem.
///
/// Positions are normalized by the largest `position_seconds` seen for the
/// track among rows matching the filter.
pub fn dropout_histogram(
    store: &EventStore,
    filter: &NormalizedFilter,
) -> Result<Vec<DropoutHistogram>> {
    let mut lengths = filter.event_clause();
    let mut dropouts = lengths.clone();
    lengths.push("track_stem != ''", std::iter::empty());
    dropouts.push("event_type = 'dropout'", std::iter::empty());

    let lengths_sql = format!(
        "SELECT track_stem, MAX(position_seconds) FROM events{} GROUP BY track_stem",
        lengths.sql
    );
    let dropouts_sql = format!(
        "SELECT track_stem, position_seconds FROM events{} ORDER BY track_stem, id",
        dropouts.sql
    );

    store.with_reader(|conn| {
        let max_by_track: HashMap<String, f64> = collect_pairs(conn, &lengths_sql, &lengths.params)
            .context("querying track lengths")?;
        let dropouts: Vec<(String, f64)> = collect_pairs(conn, &dropouts_sql, &dropouts.params)
            .context("querying dropouts")?;

        let mut by_track: BTreeMap<String, DropoutHistogram> = BTreeMap::new();
        for (stem, position) in dropouts {
            if !by_track.contains_key(&stem) && by_track.len() >= filter.limit {
                continue;
            }
            let max = max_by_track.get(&stem).copied().unwrap_or(0.0);
            let entry = by_track
                .entry(stem.clone())
                .or_insert_with(|| DropoutHistogram {
                    track_stem: stem,
                    max_position_seconds: max,
                    bins: [0; DROPOUT_BINS],
                    total: 0,
                });
            entry.bins[dropout_bin(position, max)] += 1;
            entry.total += 1;
        }

        Ok(by_track.into_values().collect())
    })
}

/// Bin index for a position normalized against `max`.
pub fn dropout_bin(position: f64, max: f64) -> usize {
    if max <= 0.0 || !position.is_finite() {
        return 0;
    }
    let bin = (position / max * DROPOUT_BINS as f64).floor();
    if bin <= 0.0 {
        0
    } else {
        (bin as usize).min(DROPOUT_BINS - 1)
    }
}

fn collect_pairs<C: FromIterator<(String, f64)>>(
    conn: &Connection,
    sql: &str,
    params: &[SqlValue],
) -> Result<C> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params_from_iter(params.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<rusqlite::Result<C>>()?;
    Ok(rows)
}

/// Events for one session in creation order.
pub fn session_timeline(
    store: &EventStore,
    session_id: &str,
    filter: &NormalizedFilter,
) -> Result<Vec<StoredEvent>> {
    if !is_valid_session_id(session_id) {
        bail!("invalid session id");
    }
    let mut clause = filter.event_clause();
    clause.push("session_id = ?", [SqlValue::Text(session_id.to_string())]);
    select_events(store, clause, filter.limit)
}

/// Raw events matching the filter in creation order.
pub fn list_events(store: &EventStore, filter: &NormalizedFilter) -> Result<Vec<StoredEvent>> {
    select_events(store, filter.event_clause(), filter.limit)
}

fn select_events(store: &EventStore, mut clause: Clause, limit: usize) -> Result<Vec<StoredEvent>> {
    clause.params.push(SqlValue::Integer(limit as i64));
    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM events{} ORDER BY created_at_ms, id LIMIT ?",
        clause.sql
    );

    store.with_reader(|conn| {
        let mut stmt = conn.prepare(&sql).context("preparing event query")?;
        let rows = stmt
            .query_map(params_from_iter(clause.params.iter()), StoredEvent::from_row)
            .context("querying events")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("reading events")?;
        Ok(rows)
    })
}

/// Overall counts across the filtered rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub total_events: u64,
    pub sessions: u64,
    pub tracks: u64,
    pub by_type: BTreeMap<String, u64>,
    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    /// Completions per play across all tracks.
    pub completion_rate: f64,
}

pub fn summary(store: &EventStore, filter: &NormalizedFilter) -> Result<Summary> {
    let clause = filter.event_clause();
    let totals_sql = format!(
        "SELECT COUNT(*), COUNT(DISTINCT session_id), \
                COUNT(DISTINCT NULLIF(track_stem, '')), \
                MIN(created_at_ms), MAX(created_at_ms) \
         FROM events{}",
        clause.sql
    );
    let by_type_sql = format!(
        "SELECT event_type, COUNT(*) FROM events{} GROUP BY event_type",
        clause.sql
    );

    store.with_reader(|conn| {
        let (total, sessions, tracks, first, last): (i64, i64, i64, Option<i64>, Option<i64>) =
            conn.query_row(&totals_sql, params_from_iter(clause.params.iter()), |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })
            .context("querying summary totals")?;

        let mut stmt = conn.prepare(&by_type_sql).context("preparing type counts")?;
        let by_type = stmt
            .query_map(params_from_iter(clause.params.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })
            .context("querying type counts")?
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()
            .context("reading type counts")?;

        let plays = by_type.get(EventType::Play.as_str()).copied().unwrap_or(0);
        let completions = by_type.get(EventType::Complete.as_str()).copied().unwrap_or(0);

        Ok(Summary {
            total_events: total as u64,
            sessions: sessions as u64,
            tracks: tracks as u64,
            completion_rate: ratio(completions as i64, plays as i64),
            by_type,
            first_event_at: first.map(from_millis),
            last_event_at: last.map(from_millis),
        })
    })
}

/// One materialized rollup row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollupRow {
    pub day: NaiveDate,
    pub track_stem: String,
    pub event_type: String,
    pub total_count: u64,
}

/// Reads materialized rollups ordered by day, stem and type.
pub fn daily_rollups(store: &EventStore, filter: &NormalizedFilter) -> Result<Vec<RollupRow>> {
    let mut clause = filter.rollup_clause();
    clause.params.push(SqlValue::Integer(filter.limit as i64));
    let sql = format!(
        "SELECT day, track_stem, event_type, total_count FROM daily_rollups{} \
         ORDER BY day, track_stem, event_type LIMIT ?",
        clause.sql
    );

    store.with_reader(|conn| {
        let mut stmt = conn.prepare(&sql).context("preparing rollup query")?;
        let raw = stmt
            .query_map(params_from_iter(clause.params.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })
            .context("querying rollups")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("reading rollups")?;

        raw.into_iter()
            .map(|(day, track_stem, event_type, total)| {
                let day = NaiveDate::parse_from_str(&day, "%Y-%m-%d")
                    .with_context(|| format!("parsing rollup day {day:?}"))?;
                Ok(RollupRow {
                    day,
                    track_stem,
                    event_type,
                    total_count: total as u64,
                })
            })
            .collect()
    })
}
