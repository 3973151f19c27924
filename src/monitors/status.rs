//! Debounced status state machine
//!
//! A verdict only changes the visible status once it has repeated enough
//! times: `fail_after` consecutive matching non-healthy verdicts declare an
//! endpoint Down or Degraded, `recover_after` healthy verdicts bring it back
//! Up. Each status change is reported exactly once as a [`Transition`].
//!
//! Leaving `Unknown` is always recorded. Moving from `Unknown` to `Up` is
//! not alertable; moving from `Unknown` to `Down`/`Degraded` waits for the
//! normal debounce count and is alertable.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Verdict, VerdictKind};
use crate::config::DebounceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EndpointState {
    #[default]
    Unknown,
    Up,
    Down,
    Degraded,
}

impl EndpointState {
    fn for_failure(kind: VerdictKind) -> Self {
        match kind {
            VerdictKind::Healthy => EndpointState::Up,
            VerdictKind::Degraded => EndpointState::Degraded,
            VerdictKind::Down => EndpointState::Down,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointState::Unknown => "unknown",
            EndpointState::Up => "up",
            EndpointState::Down => "down",
            EndpointState::Degraded => "degraded",
        }
    }
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally visible status of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EndpointStatus {
    pub state: EndpointState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_transition: Option<DateTime<Utc>>,
    /// Kind of the failures currently being counted.
    #[serde(skip)]
    failing_kind: Option<VerdictKind>,
}

/// A status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: EndpointState,
    pub to: EndpointState,
    pub at: DateTime<Utc>,
    pub alertable: bool,
}

/// Tracks consecutive verdicts for a single endpoint.
#[derive(Debug, Clone)]
pub struct StatusTracker {
    status: EndpointStatus,
    policy: DebounceConfig,
}

impl StatusTracker {
    pub fn new(policy: DebounceConfig) -> Self {
        Self {
            status: EndpointStatus::default(),
            policy: DebounceConfig {
                fail_after: policy.fail_after.max(1),
                recover_after: policy.recover_after.max(1),
            },
        }
    }

    /// Rebuild a tracker from persisted history.
    ///
    /// `verdicts` are replayed oldest first to restore the counters, then the
    /// last persisted status (and its transition time) wins so a restart
    /// neither re-alerts nor forgets an outage.
    pub fn rehydrate<I>(
        policy: DebounceConfig,
        verdicts: I,
        persisted: Option<(EndpointState, Option<DateTime<Utc>>)>,
    ) -> Self
    where
        I: IntoIterator<Item = (VerdictKind, DateTime<Utc>)>,
    {
        let mut tracker = Self::new(policy);
        for (kind, at) in verdicts {
            let verdict = Verdict {
                kind,
                reason: String::new(),
            };
            tracker.apply(&verdict, at);
        }
        if let Some((state, last_transition)) = persisted {
            tracker.status.state = state;
            if last_transition.is_some() {
                tracker.status.last_transition = last_transition;
            }
        }
        tracker
    }

    pub fn status(&self) -> &EndpointStatus {
        &self.status
    }

    pub fn state(&self) -> EndpointState {
        self.status.state
    }

    /// Record a verdict and return the transition it caused, if any.
    pub fn record(&mut self, verdict: &Verdict, at: DateTime<Utc>) -> Option<Transition> {
        let transition = self.apply(verdict, at)?;
        if transition.to == EndpointState::Up {
            debug!(
                "Status: recovered {} -> {} after {} success(es)",
                transition.from, transition.to, self.status.consecutive_successes
            );
        } else {
            warn!(
                "Status: {} -> {} after {} failure(s): {}",
                transition.from, transition.to, self.status.consecutive_failures, verdict.reason
            );
        }
        Some(transition)
    }

    fn apply(&mut self, verdict: &Verdict, at: DateTime<Utc>) -> Option<Transition> {
        let status = &mut self.status;
        let target = match verdict.kind {
            VerdictKind::Healthy => {
                status.consecutive_failures = 0;
                status.failing_kind = None;
                status.consecutive_successes = status.consecutive_successes.saturating_add(1);
                (status.consecutive_successes >= self.policy.recover_after)
                    .then_some(EndpointState::Up)
            }
            kind => {
                status.consecutive_successes = 0;
                // A change of failure kind restarts the count.
                if status.failing_kind == Some(kind) {
                    status.consecutive_failures = status.consecutive_failures.saturating_add(1);
                } else {
                    status.failing_kind = Some(kind);
                    status.consecutive_failures = 1;
                }
                (status.consecutive_failures >= self.policy.fail_after)
                    .then(|| EndpointState::for_failure(kind))
            }
        }?;

        // Threshold met but already there: no transition.
        if target == status.state {
            return None;
        }

        let from = status.state;
        status.state = target;
        status.last_transition = Some(at);
        Some(Transition {
            from,
            to: target,
            at,
            // First sighting of a healthy endpoint is not news.
            alertable: !(from == EndpointState::Unknown && target == EndpointState::Up),
        })
    }
}
