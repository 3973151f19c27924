//! Check cycle engine and watch-mode scheduler.
//!
//! One cycle probes every configured endpoint exactly once:
//!
//! - a bounded pool of workers pulls jobs from a shared queue; each worker
//!   runs one probe (retries included) to completion before taking the next
//! - the cycle deadline cuts pending probes short; they are reported with a
//!   deadline-class error rather than dropped
//! - a single collector drains the completion queue and is the only writer
//!   of status and history, applying results in completion order
//! - endpoints whose worker died are filled in after the drain, so the cycle
//!   output always covers every endpoint
//!
//! Watch mode repeats cycles on a cron schedule or a fixed interval until
//! cancelled.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alerts::{AlertEvent, DispatchReport, Dispatcher};
use crate::config::{EndpointSpec, MonitorConfig};
use crate::metrics::{HistoryEntry, HistoryStore};
use crate::monitors::probe::{deadline_in, Prober};
use crate::monitors::status::EndpointState;
use crate::monitors::validate::validate;
use crate::monitors::{CheckOutcome, EndpointKey, ProbeError, ProbeErrorKind, ProbeResult};
use crate::state::{MonitorState, Snapshot};

/// Everything one cycle produced.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// One per configured endpoint, in completion order.
    pub outcomes: Vec<CheckOutcome>,
    pub history_updates: Vec<(EndpointKey, HistoryEntry)>,
    /// Every status transition of the cycle, notified or not.
    pub alerts: Vec<AlertEvent>,
    pub dispatches: Vec<DispatchReport>,
    pub snapshot: Snapshot,
}

impl CycleReport {
    pub fn outcome(&self, key: &EndpointKey) -> Option<&CheckOutcome> {
        self.outcomes.iter().find(|o| &o.result.key == key)
    }
}

type Job = (EndpointKey, EndpointSpec);

/// Runs check cycles and owns all monitor state between them.
pub struct Engine {
    config: Arc<MonitorConfig>,
    prober: Prober,
    dispatcher: Dispatcher,
    state: MonitorState,
}

impl Engine {
    pub fn new(config: MonitorConfig, history: HistoryStore, prober: Prober, dispatcher: Dispatcher) -> Self {
        let state = MonitorState::new(&config, history);
        Self {
            config: Arc::new(config),
            prober,
            dispatcher,
            state,
        }
    }

    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    pub fn history(&self) -> &HistoryStore {
        self.state.history()
    }

    fn jobs(&self) -> Vec<Job> {
        self.config
            .services
            .iter()
            .flat_map(|service| {
                service
                    .endpoints
                    .iter()
                    .map(move |endpoint| (EndpointKey::of(service, endpoint), endpoint.clone()))
            })
            .collect()
    }

    /// Probe every endpoint once, update state and dispatch alerts.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let started_at = Utc::now();
        let jobs = self.jobs();
        let expected: Vec<EndpointKey> = jobs.iter().map(|(key, _)| key.clone()).collect();
        let deadline = deadline_in(Duration::from_secs(self.config.run_deadline_secs.max(1)));
        let workers = self.config.concurrency.max(1).min(jobs.len().max(1));

        info!(
            "Scheduler: cycle started, {} endpoint(s), {} worker(s)",
            jobs.len(),
            workers
        );

        // Queue every job up front; workers stop when it runs dry.
        let (job_tx, job_rx) = mpsc::unbounded_channel::<Job>();
        for job in jobs {
            // Receiver is alive until the workers below finish.
            let _ = job_tx.send(job);
        }
        drop(job_tx);
        let job_rx = Arc::new(Mutex::new(job_rx));

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<CheckOutcome>();
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let job_rx = Arc::clone(&job_rx);
            let done_tx = done_tx.clone();
            let prober = self.prober.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let job = job_rx.lock().await.recv().await;
                    let Some((key, spec)) = job else { break };
                    let outcome = run_job(&prober, key, &spec, deadline).await;
                    if done_tx.send(outcome).is_err() {
                        break;
                    }
                }
                debug!("Scheduler: worker {} finished", worker);
            }));
        }
        drop(done_tx);

        // Single collector: the only writer of status and history.
        let mut outcomes = Vec::with_capacity(expected.len());
        let mut history_updates = Vec::with_capacity(expected.len());
        let mut alerts = Vec::new();
        let mut seen = HashSet::with_capacity(expected.len());

        while let Some(outcome) = done_rx.recv().await {
            seen.insert(outcome.result.key.clone());
            self.collect(outcome, &mut outcomes, &mut history_updates, &mut alerts);
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Scheduler: probe worker failed: {}", e);
            }
        }

        // A worker that panicked leaves its endpoint without a result.
        for key in expected.iter().filter(|key| !seen.contains(*key)) {
            warn!("Scheduler: no result for {}, reporting it as failed", key);
            let result = ProbeResult::failed(
                key.clone(),
                Utc::now(),
                ProbeError::new(ProbeErrorKind::Request, "probe task aborted"),
            );
            let spec = self.spec_for(key);
            let verdict = match spec {
                Some(ref spec) => validate(&result, spec),
                None => crate::monitors::Verdict::down("probe task aborted"),
            };
            self.collect(
                CheckOutcome { result, verdict },
                &mut outcomes,
                &mut history_updates,
                &mut alerts,
            );
        }

        let dispatches = self.dispatcher.dispatch_all(&alerts).await;

        let finished_at = Utc::now();
        let snapshot = self.state.snapshot(finished_at);
        info!(
            "Scheduler: cycle finished in {}ms: {} up, {} degraded, {} down, {} transition(s)",
            (finished_at - started_at).num_milliseconds(),
            snapshot.count_in(EndpointState::Up),
            snapshot.count_in(EndpointState::Degraded),
            snapshot.count_in(EndpointState::Down),
            alerts.len()
        );

        CycleReport {
            started_at,
            finished_at,
            outcomes,
            history_updates,
            alerts,
            dispatches,
            snapshot,
        }
    }

    fn spec_for(&self, key: &EndpointKey) -> Option<EndpointSpec> {
        self.config
            .services
            .iter()
            .filter(|s| s.name == key.service)
            .flat_map(|s| s.endpoints.iter())
            .find(|e| key.matches(e))
            .cloned()
    }

    fn collect(
        &mut self,
        outcome: CheckOutcome,
        outcomes: &mut Vec<CheckOutcome>,
        history_updates: &mut Vec<(EndpointKey, HistoryEntry)>,
        alerts: &mut Vec<AlertEvent>,
    ) {
        let key = outcome.result.key.clone();
        let applied = self.state.apply(outcome.clone());
        if let Some(ref transition) = applied.transition {
            alerts.push(AlertEvent::from_transition(&key, transition, &outcome.verdict));
        }
        history_updates.push((key, applied.entry));
        outcomes.push(outcome);
    }

    /// Run cycles until `shutdown` is cancelled, calling `after_cycle` after each.
    pub async fn run_forever<F>(&mut self, trigger: Trigger, shutdown: CancellationToken, mut after_cycle: F)
    where
        F: FnMut(&CycleReport, &MonitorState),
    {
        info!("Scheduler: watch mode started ({})", trigger.describe());
        loop {
            let report = tokio::select! {
                _ = shutdown.cancelled() => break,
                report = self.run_cycle() => report,
            };
            after_cycle(&report, &self.state);

            let wait = trigger.next_wait(Utc::now());
            debug!("Scheduler: next cycle in {:?}", wait);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!("Scheduler: watch mode stopped");
    }
}

async fn run_job(prober: &Prober, key: EndpointKey, spec: &EndpointSpec, deadline: Instant) -> CheckOutcome {
    let started = Utc::now();
    let deadline_error = || {
        ProbeError::new(
            ProbeErrorKind::Deadline,
            "cycle deadline reached before the probe finished",
        )
    };

    // Jobs dequeued after the deadline are not started at all.
    let result = if Instant::now() >= deadline {
        ProbeResult::failed(key, started, deadline_error())
    } else {
        match tokio::time::timeout_at(deadline, prober.probe(key.clone(), spec)).await {
            Ok(result) => result,
            Err(_) => ProbeResult::failed(key, started, deadline_error()),
        }
    };
    let verdict = validate(&result, spec);
    CheckOutcome { result, verdict }
}

/// When watch mode runs the next cycle.
#[derive(Debug, Clone)]
pub enum Trigger {
    Cron(Box<Schedule>),
    Interval(Duration),
}

impl Trigger {
    pub fn cron(expression: &str) -> Result<Self, cron::error::Error> {
        Schedule::from_str(expression).map(|s| Trigger::Cron(Box::new(s)))
    }

    /// Time to wait after `now` before the next cycle.
    pub fn next_wait(&self, now: DateTime<Utc>) -> Duration {
        match self {
            Trigger::Interval(interval) => *interval,
            Trigger::Cron(schedule) => schedule
                .after(&now)
                .next()
                .and_then(|next| (next - now).to_std().ok())
                .unwrap_or(Duration::from_secs(60)),
        }
    }

    fn describe(&self) -> String {
        match self {
            Trigger::Interval(interval) => format!("every {}s", interval.as_secs()),
            Trigger::Cron(schedule) => format!("cron {}", schedule),
        }
    }
}
