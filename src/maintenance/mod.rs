pub mod retention;
pub mod rollup;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::store::EventStore;

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub rolled_days: u32,
    pub rollup_rows_affected: u64,
    pub pruned_rows: u64,
}

/// Materializes completed days, then prunes raw events past the horizon.
///
/// Rollup runs first so a day is counted before its raw rows can expire.
/// Errors from either step propagate to the caller.
pub fn run_maintenance(
    store: &EventStore,
    now: DateTime<Utc>,
    retention_days: u32,
) -> Result<MaintenanceReport> {
    let rollup = rollup::materialize(store, now).context("materializing daily rollups")?;
    let pruned_rows =
        retention::prune(store, now, retention_days).context("pruning expired events")?;

    let report = MaintenanceReport {
        rolled_days: rollup.days_processed,
        rollup_rows_affected: rollup.rows_affected,
        pruned_rows,
    };

    info!(
        rolled_days = report.rolled_days,
        rollup_rows = report.rollup_rows_affected,
        pruned_rows = report.pruned_rows,
        retention_days,
        "maintenance completed"
    );

    Ok(report)
}
