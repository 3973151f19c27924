//! Rolling per-endpoint check history
//!
//! Each endpoint owns a bounded, strictly time-ordered window of entries:
//!
//! - append is O(1) amortized; the oldest entries are evicted first
//! - a size cap (`max_entries`) and an optional age cap (`max_age_days`)
//!   are applied after every append
//! - summaries are computed on demand by a linear scan of the window
//!
//! The whole store persists to a single JSON file and is reloaded at startup
//! to rehydrate the status trackers.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::HistoryConfig;
use crate::monitors::status::EndpointState;
use crate::monitors::{CheckOutcome, EndpointKey, VerdictKind};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HistoryError {
    #[error("entry at {at} is not newer than the last entry at {last}")]
    OutOfOrder {
        at: DateTime<Utc>,
        last: DateTime<Utc>,
    },
}

/// One recorded check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub verdict: VerdictKind,
    pub reason: String,
    pub latency_ms: u64,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    /// Debounced status after this entry was applied.
    pub status: EndpointState,
}

impl HistoryEntry {
    pub fn from_outcome(outcome: &CheckOutcome, status: EndpointState) -> Self {
        Self {
            timestamp: outcome.result.timestamp,
            verdict: outcome.verdict.kind,
            reason: outcome.verdict.reason.clone(),
            latency_ms: outcome.result.latency_ms(),
            status_code: outcome.result.status_code,
            error: outcome.result.error.as_ref().map(|e| e.to_string()),
            status,
        }
    }
}

/// Range of entries a summary covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryWindow {
    /// The most recent N entries.
    LastN(usize),
    /// Entries no older than this, measured back from `now`.
    Trailing(Duration),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub samples: usize,
    /// Share of Healthy and Degraded entries; `None` without samples.
    pub uptime_ratio: Option<f64>,
    /// Mean latency over entries that got a response.
    pub avg_latency_ms: Option<f64>,
    /// Verdicts in the window, oldest first.
    pub last_statuses: Vec<VerdictKind>,
}

/// Bounded window for one endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointHistory {
    entries: VecDeque<HistoryEntry>,
}

impl EndpointHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &HistoryEntry> + ExactSizeIterator {
        self.entries.iter()
    }

    /// Append, then evict from the front until `max_entries` holds.
    pub fn append(&mut self, entry: HistoryEntry, max_entries: usize) -> Result<(), HistoryError> {
        // Strictly increasing timestamps keep the front the oldest entry.
        if let Some(last) = self.entries.back() {
            if entry.timestamp <= last.timestamp {
                return Err(HistoryError::OutOfOrder {
                    at: entry.timestamp,
                    last: last.timestamp,
                });
            }
        }
        self.entries.push_back(entry);
        while self.entries.len() > max_entries.max(1) {
            self.entries.pop_front();
        }
        Ok(())
    }

    /// Drop entries older than `cutoff`. Returns how many were removed.
    pub fn prune_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        while matches!(self.entries.front(), Some(e) if e.timestamp < cutoff) {
            self.entries.pop_front();
        }
        before - self.entries.len()
    }

    pub fn summarize(&self, window: SummaryWindow, now: DateTime<Utc>) -> Summary {
        let selected: Vec<&HistoryEntry> = match window {
            SummaryWindow::LastN(n) => {
                let skip = self.entries.len().saturating_sub(n);
                self.entries.iter().skip(skip).collect()
            }
            SummaryWindow::Trailing(span) => match now.checked_sub_signed(span) {
                Some(cutoff) => self.entries.iter().filter(|e| e.timestamp >= cutoff).collect(),
                // Span reaches past the calendar: everything is inside it.
                None => self.entries.iter().collect(),
            },
        };

        let samples = selected.len();
        // Degraded still counts as up; only Down costs uptime.
        let up = selected
            .iter()
            .filter(|e| e.verdict != VerdictKind::Down)
            .count();
        // Transport failures have no meaningful latency.
        let latencies: Vec<u64> = selected
            .iter()
            .filter(|e| e.status_code.is_some())
            .map(|e| e.latency_ms)
            .collect();

        Summary {
            samples,
            uptime_ratio: (samples > 0).then(|| up as f64 / samples as f64),
            avg_latency_ms: (!latencies.is_empty())
                .then(|| latencies.iter().sum::<u64>() as f64 / latencies.len() as f64),
            last_statuses: selected.iter().map(|e| e.verdict).collect(),
        }
    }
}

/// On-disk shape: a list, since endpoint keys are structured.
#[derive(Serialize, Deserialize)]
struct PersistedHistory {
    saved_at: DateTime<Utc>,
    endpoints: Vec<PersistedEndpoint>,
}

#[derive(Serialize, Deserialize)]
struct PersistedEndpoint {
    service: String,
    endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    entries: Vec<HistoryEntry>,
}

/// History for every endpoint, keyed by endpoint identity.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    windows: BTreeMap<EndpointKey, EndpointHistory>,
    max_entries: usize,
    max_age: Option<Duration>,
}

impl HistoryStore {
    pub fn new(config: &HistoryConfig) -> Self {
        Self {
            windows: BTreeMap::new(),
            max_entries: config.max_entries.max(1),
            max_age: config
                .max_age_days
                .map(|days| Duration::days(i64::from(days))),
        }
    }

    pub fn get(&self, key: &EndpointKey) -> Option<&EndpointHistory> {
        self.windows.get(key)
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Append then prune (size cap, then age cap relative to the new entry).
    pub fn append(&mut self, key: &EndpointKey, entry: HistoryEntry) -> Result<(), HistoryError> {
        let newest = entry.timestamp;
        let window = self.windows.entry(key.clone()).or_default();
        window.append(entry, self.max_entries)?;
        if let Some(max_age) = self.max_age {
            // An age cap reaching past the earliest representable time prunes nothing.
            if let Some(cutoff) = newest.checked_sub_signed(max_age) {
                let removed = window.prune_older_than(cutoff);
                if removed > 0 {
                    debug!("History: pruned {} aged entries for {}", removed, key);
                }
            }
        }
        Ok(())
    }

    pub fn summarize(&self, key: &EndpointKey, window: SummaryWindow, now: DateTime<Utc>) -> Summary {
        self.windows
            .get(key)
            .map(|h| h.summarize(window, now))
            .unwrap_or_else(|| EndpointHistory::new().summarize(window, now))
    }

    /// Forget endpoints that are no longer configured.
    pub fn retain<F: FnMut(&EndpointKey) -> bool>(&mut self, mut keep: F) {
        self.windows.retain(|key, _| keep(key));
    }

    /// Save history to disk
    pub fn save_to_disk(&self, path: &Path) -> Result<()> {
        let persisted = PersistedHistory {
            saved_at: Utc::now(),
            endpoints: self
                .windows
                .iter()
                .map(|(key, window)| PersistedEndpoint {
                    service: key.service.clone(),
                    endpoint: key.endpoint.clone(),
                    port: key.port,
                    entries: window.entries().cloned().collect(),
                })
                .collect(),
        };

        let json_str =
            serde_json::to_string_pretty(&persisted).context("Failed to serialize history")?;
        crate::config::Config::ensure_parent_directory(path)
            .with_context(|| format!("Failed to create directory for {:?}", path))?;
        std::fs::write(path, json_str)
            .with_context(|| format!("Failed to write history file {:?}", path))?;
        debug!("History: saved {} endpoint(s) to {:?}", self.windows.len(), path);
        Ok(())
    }

    /// Load history from disk. A missing file yields an empty store.
    ///
    /// Entries are re-appended through the normal path, so caps from the
    /// current config apply and out-of-order entries are skipped.
    pub fn load_from_disk(path: &Path, config: &HistoryConfig) -> Result<Self> {
        let mut store = Self::new(config);
        if !path.exists() {
            return Ok(store);
        }

        let json_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read history file {:?}", path))?;
        let persisted: PersistedHistory = serde_json::from_str(&json_str)
            .with_context(|| format!("Failed to parse history file {:?}", path))?;

        // Endpoints no longer configured are dropped later by the state arena.
        let mut skipped = 0usize;
        for endpoint in persisted.endpoints {
            let key = EndpointKey::new(endpoint.service, endpoint.endpoint).with_port(endpoint.port);
            for entry in endpoint.entries {
                if store.append(&key, entry).is_err() {
                    skipped += 1;
                }
            }
        }
        if skipped > 0 {
            debug!("History: skipped {} out-of-order entries while loading", skipped);
        }
        info!("History: loaded {} endpoint(s) from {:?}", store.len(), path);
        Ok(store)
    }
}
