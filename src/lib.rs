//! Playback telemetry ingestion for a self-hosted listening service.
//!
//! Client batches pass through the [`event::validate::Validator`] into a
//! bounded queue owned by the [`collector::Collector`]. A single writer task
//! commits them to the SQLite [`store::EventStore`]. [`maintenance`] folds
//! completed days into rollups and prunes aged raw events, and [`query`]
//! answers aggregate and export requests over both.

pub mod collector;
pub mod config;
pub mod event;
pub mod maintenance;
pub mod metrics;
pub mod query;
pub mod store;
