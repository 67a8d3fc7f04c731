use std::fmt;
use std::io::Write;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::{list_events, NormalizedFilter};
use crate::store::{EventStore, StoredEvent};

const CSV_HEADER: [&str; 7] = [
    "id",
    "session_id",
    "event_type",
    "track_stem",
    "position_seconds",
    "metadata",
    "created_at",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown export format {0:?}, expected json or csv")]
pub struct UnknownFormat(String);

impl FromStr for ExportFormat {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            _ => Err(UnknownFormat(s.to_string())),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Csv => "csv",
        })
    }
}

/// JSON shape of an exported row; metadata is embedded as an object.
#[derive(Serialize)]
struct JsonRow<'a> {
    id: i64,
    session_id: &'a str,
    event_type: &'a str,
    track_stem: &'a str,
    position_seconds: f64,
    metadata: Value,
    created_at: String,
}

impl<'a> From<&'a StoredEvent> for JsonRow<'a> {
    fn from(e: &'a StoredEvent) -> Self {
        Self {
            id: e.id,
            session_id: &e.session_id,
            event_type: &e.event_type,
            track_stem: &e.track_stem,
            position_seconds: e.position_seconds,
            // Stored metadata is always canonical JSON; keep the text if not.
            metadata: serde_json::from_str(&e.metadata)
                .unwrap_or_else(|_| Value::String(e.metadata.clone())),
            created_at: timestamp(e),
        }
    }
}

fn timestamp(e: &StoredEvent) -> String {
    e.created_at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Writes events matching `filter` to `out`. Returns the row count.
pub fn export_events<W: Write>(
    store: &EventStore,
    filter: &NormalizedFilter,
    format: ExportFormat,
    out: W,
) -> Result<usize> {
    let events = list_events(store, filter)?;
    write_events(&events, format, out)?;
    Ok(events.len())
}

pub fn write_events<W: Write>(events: &[StoredEvent], format: ExportFormat, out: W) -> Result<()> {
    match format {
        ExportFormat::Json => write_json(events, out),
        ExportFormat::Csv => write_csv(events, out),
    }
}

fn write_json<W: Write>(events: &[StoredEvent], mut out: W) -> Result<()> {
    let rows: Vec<JsonRow<'_>> = events.iter().map(JsonRow::from).collect();
    serde_json::to_writer_pretty(&mut out, &rows).context("writing JSON export")?;
    out.write_all(b"\n").context("writing JSON export")?;
    out.flush().context("flushing JSON export")
}

fn write_csv<W: Write>(events: &[StoredEvent], mut out: W) -> Result<()> {
    writeln!(out, "{}", CSV_HEADER.join(",")).context("writing CSV header")?;
    for e in events {
        let fields = [
            e.id.to_string(),
            e.session_id.clone(),
            e.event_type.clone(),
            e.track_stem.clone(),
            e.position_seconds.to_string(),
            e.metadata.clone(),
            timestamp(e),
        ];
        let line = fields
            .iter()
            .map(|f| csv_field(f))
            .collect::<Vec<_>>()
            .join(",");
        writeln!(out, "{line}").context("writing CSV row")?;
    }
    out.flush().context("flushing CSV export")
}

/// Quotes a field when it holds a delimiter, quote or line break.
fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
