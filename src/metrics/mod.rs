//! Metrics module
//!
//! Rolling check history and the uptime/latency summaries derived from it.

pub mod history;

pub use history::{EndpointHistory, HistoryEntry, HistoryError, HistoryStore, Summary, SummaryWindow};
