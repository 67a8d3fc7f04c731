use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;

use crate::store::EventStore;

/// Deletes raw events created more than `retention_days` before `now`.
///
/// A horizon of 0 disables pruning. Rollup state is not consulted.
pub fn prune(store: &EventStore, now: DateTime<Utc>, retention_days: u32) -> Result<u64> {
    if retention_days == 0 {
        return Ok(0);
    }

    let Some(cutoff) = now.checked_sub_signed(Duration::days(i64::from(retention_days))) else {
        return Ok(0);
    };
    let cutoff_ms = cutoff.timestamp_millis();

    let deleted = store.with_writer(|conn| {
        conn.execute(
            "DELETE FROM events WHERE created_at_ms < ?1",
            params![cutoff_ms],
        )
        .context("pruning expired events")
    })?;

    Ok(deleted as u64)
}
