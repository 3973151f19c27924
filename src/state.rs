//! Monitor state management
//!
//! All per-endpoint mutable state (status trackers, latest outcome and the
//! rolling history) lives in one [`MonitorState`] arena, reachable only
//! through [`EndpointKey`] lookups. The cycle collector owns it and is the
//! only writer, so none of it needs a lock.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{DebounceConfig, MonitorConfig};
use crate::metrics::{HistoryEntry, HistoryStore, Summary, SummaryWindow};
use crate::monitors::status::{EndpointState, EndpointStatus, StatusTracker, Transition};
use crate::monitors::{CheckOutcome, EndpointKey};

/// Everything known about one endpoint.
#[derive(Debug, Clone)]
pub struct EndpointRecord {
    pub tracker: StatusTracker,
    pub latest: Option<CheckOutcome>,
}

/// What applying one outcome changed.
#[derive(Debug, Clone)]
pub struct Applied {
    pub entry: HistoryEntry,
    pub transition: Option<Transition>,
}

/// Report view of one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSnapshot {
    pub service: String,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub status: EndpointStatus,
    pub latest: Option<CheckOutcome>,
    /// Over the whole retained window.
    pub summary: Summary,
    pub summary_24h: Summary,
}

/// Report view of every configured endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub generated_at: DateTime<Utc>,
    pub endpoints: Vec<EndpointSnapshot>,
}

impl Snapshot {
    pub fn get(&self, key: &EndpointKey) -> Option<&EndpointSnapshot> {
        self.endpoints
            .iter()
            .find(|e| e.service == key.service && e.endpoint == key.endpoint && e.port == key.port)
    }

    pub fn count_in(&self, state: EndpointState) -> usize {
        self.endpoints.iter().filter(|e| e.status.state == state).count()
    }

    pub fn save_to_disk(&self, path: &Path) -> Result<()> {
        let json_str = serde_json::to_string_pretty(self).context("Failed to serialize snapshot")?;
        crate::config::Config::ensure_parent_directory(path)
            .with_context(|| format!("Failed to create directory for {:?}", path))?;
        std::fs::write(path, json_str)
            .with_context(|| format!("Failed to write snapshot {:?}", path))?;
        Ok(())
    }
}

/// Arena of per-endpoint state.
#[derive(Debug, Clone)]
pub struct MonitorState {
    records: BTreeMap<EndpointKey, EndpointRecord>,
    history: HistoryStore,
    debounce: DebounceConfig,
}

impl MonitorState {
    /// Create state for the configured endpoints, rehydrating status from
    /// `history`. History of endpoints no longer configured is dropped.
    pub fn new(config: &MonitorConfig, mut history: HistoryStore) -> Self {
        let keys: Vec<EndpointKey> = config
            .services
            .iter()
            .flat_map(|s| s.endpoints.iter().map(move |e| EndpointKey::of(s, e)))
            .collect();
        history.retain(|key| keys.contains(key));

        let mut records = BTreeMap::new();
        for key in keys {
            let tracker = match history.get(&key) {
                Some(window) if !window.is_empty() => {
                    let mut last_transition = None;
                    let mut previous = EndpointState::Unknown;
                    for entry in window.entries() {
                        if entry.status != previous {
                            last_transition = Some(entry.timestamp);
                            previous = entry.status;
                        }
                    }
                    debug!("State: rehydrated {} as {}", key, previous);
                    StatusTracker::rehydrate(
                        config.debounce,
                        window.entries().map(|e| (e.verdict, e.timestamp)),
                        Some((previous, last_transition)),
                    )
                }
                _ => StatusTracker::new(config.debounce),
            };
            records.insert(
                key,
                EndpointRecord {
                    tracker,
                    latest: None,
                },
            );
        }

        Self {
            records,
            history,
            debounce: config.debounce,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record(&self, key: &EndpointKey) -> Option<&EndpointRecord> {
        self.records.get(key)
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Feed one outcome through the status tracker and into history.
    pub fn apply(&mut self, outcome: CheckOutcome) -> Applied {
        let key = outcome.result.key.clone();
        let debounce = self.debounce;
        let record = self.records.entry(key.clone()).or_insert_with(|| EndpointRecord {
            tracker: StatusTracker::new(debounce),
            latest: None,
        });

        let transition = record
            .tracker
            .record(&outcome.verdict, outcome.result.timestamp);
        let entry = HistoryEntry::from_outcome(&outcome, record.tracker.state());
        record.latest = Some(outcome);

        if let Err(e) = self.history.append(&key, entry.clone()) {
            warn!("State: history entry for {} dropped: {}", key, e);
        }

        Applied { entry, transition }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> Snapshot {
        let endpoints = self
            .records
            .iter()
            .map(|(key, record)| EndpointSnapshot {
                service: key.service.clone(),
                endpoint: key.endpoint.clone(),
                port: key.port,
                status: record.tracker.status().clone(),
                latest: record.latest.clone(),
                summary: self
                    .history
                    .summarize(key, SummaryWindow::LastN(usize::MAX), now),
                summary_24h: self
                    .history
                    .summarize(key, SummaryWindow::Trailing(Duration::hours(24)), now),
            })
            .collect();

        Snapshot {
            generated_at: now,
            endpoints,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointSpec, HistoryConfig, ServiceSpec};
    use crate::monitors::{ProbeResult, Verdict, VerdictKind};
    use chrono::TimeZone;

    fn config() -> MonitorConfig {
        MonitorConfig {
            debounce: DebounceConfig {
                fail_after: 2,
                recover_after: 1,
            },
            services: vec![ServiceSpec {
                name: "api".to_string(),
                endpoints: vec![EndpointSpec::new("https://api.test/health")],
            }],
            ..MonitorConfig::default()
        }
    }

    fn key() -> EndpointKey {
        EndpointKey::new("api", "https://api.test/health")
    }

    fn outcome(minute: i64, verdict: Verdict) -> CheckOutcome {
        let at = Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap() + Duration::minutes(minute);
        let mut result = ProbeResult::failed(
            key(),
            at,
            crate::monitors::ProbeError::new(crate::monitors::ProbeErrorKind::Connect, "x"),
        );
        if verdict.is_healthy() {
            result.error = None;
            result.status_code = Some(200);
        }
        CheckOutcome { result, verdict }
    }

    #[test]
    fn test_apply_records_history_and_transitions() {
        let cfg = config();
        let mut state = MonitorState::new(&cfg, HistoryStore::new(&cfg.history));

        let first = state.apply(outcome(0, Verdict::healthy()));
        assert_eq!(first.entry.status, EndpointState::Up);
        assert!(!first.transition.unwrap().alertable);

        assert!(state.apply(outcome(1, Verdict::down("x"))).transition.is_none());
        let down = state.apply(outcome(2, Verdict::down("x"))).transition.unwrap();
        assert_eq!(down.to, EndpointState::Down);

        assert_eq!(state.history().get(&key()).unwrap().len(), 3);
        let snapshot = state.snapshot(Utc.with_ymd_and_hms(2025, 5, 1, 12, 5, 0).unwrap());
        let ep = snapshot.get(&key()).unwrap();
        assert_eq!(ep.status.state, EndpointState::Down);
        assert_eq!(ep.summary.samples, 3);
        assert_eq!(snapshot.count_in(EndpointState::Down), 1);
    }

    #[test]
    fn test_rehydration_from_history() {
        let cfg = config();
        let mut state = MonitorState::new(&cfg, HistoryStore::new(&cfg.history));
        state.apply(outcome(0, Verdict::healthy()));
        state.apply(outcome(1, Verdict::down("x")));
        state.apply(outcome(2, Verdict::down("x")));
        let history = state.history().clone();

        let mut restarted = MonitorState::new(&cfg, history);
        let record = restarted.record(&key()).unwrap();
        assert_eq!(record.tracker.state(), EndpointState::Down);
        assert_eq!(
            record.tracker.status().last_transition,
            Some(Utc.with_ymd_and_hms(2025, 5, 1, 12, 2, 0).unwrap())
        );

        // Still down: no second alert after restart.
        assert!(restarted.apply(outcome(3, Verdict::down("x"))).transition.is_none());
        let up = restarted.apply(outcome(4, Verdict::healthy())).transition.unwrap();
        assert_eq!(up.from, EndpointState::Down);
    }

    #[test]
    fn test_unconfigured_history_is_dropped() {
        let cfg = config();
        let mut history = HistoryStore::new(&HistoryConfig::default());
        let stale = EndpointKey::new("old", "https://old.test");
        history
            .append(
                &stale,
                HistoryEntry {
                    timestamp: Utc::now(),
                    verdict: VerdictKind::Healthy,
                    reason: "ok".to_string(),
                    latency_ms: 1,
                    status_code: Some(200),
                    error: None,
                    status: EndpointState::Up,
                },
            )
            .unwrap();
        let state = MonitorState::new(&cfg, history);
        assert!(state.history().get(&stale).is_none());
        assert_eq!(state.len(), 1);
        assert!(!state.is_empty());
    }

    #[test]
    fn test_port_override_is_a_separate_endpoint() {
        let mut alt = EndpointSpec::new("https://api.test/health");
        alt.port = Some(8443);
        let cfg = MonitorConfig {
            services: vec![ServiceSpec {
                name: "api".to_string(),
                endpoints: vec![EndpointSpec::new("https://api.test/health"), alt],
            }],
            ..MonitorConfig::default()
        };
        let state = MonitorState::new(&cfg, HistoryStore::new(&cfg.history));
        assert_eq!(state.len(), 2);

        let snapshot = state.snapshot(Utc::now());
        let alt_key = key().with_port(Some(8443));
        assert_eq!(snapshot.get(&alt_key).unwrap().port, Some(8443));
        assert_eq!(snapshot.get(&key()).unwrap().port, None);
    }
}
