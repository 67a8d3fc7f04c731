use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::store::{from_millis, EventStore};

/// Replaces the counts for one day; re-running a day yields the same rows.
const UPSERT_DAY_SQL: &str = "INSERT INTO daily_rollups (day, track_stem, event_type, total_count) \
     SELECT ?1, track_stem, event_type, COUNT(*) FROM events \
     WHERE created_at_ms >= ?2 AND created_at_ms < ?3 \
     GROUP BY track_stem, event_type \
     ON CONFLICT(day, track_stem, event_type) DO UPDATE SET total_count = excluded.total_count";

const DAY_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RollupReport {
    /// Days that had raw events and were materialized.
    pub days_processed: u32,
    /// Rollup rows inserted or updated.
    pub rows_affected: u64,
}

/// Materializes every complete UTC day before `now` from the rollup cursor
/// onward.
///
/// The cursor is the day after the newest rollup row, or the day of the
/// oldest raw event when no rollups exist. Days without raw events are
/// skipped. Each day commits in its own transaction.
pub fn materialize(store: &EventStore, now: DateTime<Utc>) -> Result<RollupReport> {
    let today = now.date_naive();
    let today_start = day_start_ms(today);

    store.with_writer(|conn| {
        let mut report = RollupReport::default();
        let Some(mut day) = cursor(conn)? else {
            return Ok(report);
        };

        while day < today {
            let Some(next) = next_event_day(conn, day, today_start)? else {
                break;
            };
            day = next;

            let start = day_start_ms(day);
            let end = day_start_ms(day.succ_opt().context("rollup day out of range")?);
            let label = day.format(DAY_FORMAT).to_string();

            let tx = conn.transaction().context("beginning rollup transaction")?;
            let rows = tx
                .execute(UPSERT_DAY_SQL, params![label, start, end])
                .with_context(|| format!("materializing rollups for {label}"))?;
            tx.commit()
                .with_context(|| format!("committing rollups for {label}"))?;

            tracing::debug!(day = %label, rows, "day materialized");
            report.days_processed += 1;
            report.rows_affected += rows as u64;

            day = day.succ_opt().context("rollup day out of range")?;
        }

        Ok(report)
    })
}

/// Next day requiring materialization, or `None` when there is nothing to do.
fn cursor(conn: &Connection) -> Result<Option<NaiveDate>> {
    let newest: Option<String> = conn
        .query_row("SELECT MAX(day) FROM daily_rollups", [], |row| row.get(0))
        .context("reading rollup cursor")?;

    if let Some(day) = newest {
        let day = NaiveDate::parse_from_str(&day, DAY_FORMAT)
            .with_context(|| format!("parsing rollup day {day:?}"))?;
        return day.succ_opt().context("rollup day out of range").map(Some);
    }

    let oldest: Option<i64> = conn
        .query_row("SELECT MIN(created_at_ms) FROM events", [], |row| row.get(0))
        .context("reading oldest event")?;
    Ok(oldest.map(|ms| from_millis(ms).date_naive()))
}

/// First day at or after `from` holding raw events created before
/// `before_ms`.
fn next_event_day(conn: &Connection, from: NaiveDate, before_ms: i64) -> Result<Option<NaiveDate>> {
    let next: Option<i64> = conn
        .query_row(
            "SELECT MIN(created_at_ms) FROM events WHERE created_at_ms >= ?1 AND created_at_ms < ?2",
            params![day_start_ms(from), before_ms],
            |row| row.get(0),
        )
        .context("finding next event day")?;
    Ok(next.map(|ms| from_millis(ms).date_naive()))
}

fn day_start_ms(day: NaiveDate) -> i64 {
    day.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}
