mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;

use ponghub::alerts::Dispatcher;
use ponghub::config::{EndpointSpec, MonitorConfig, ServiceSpec};
use ponghub::metrics::{HistoryStore, SummaryWindow};
use ponghub::monitors::status::EndpointState;
use ponghub::monitors::{EndpointKey, ProbeErrorKind, VerdictKind};
use ponghub::scheduler::Engine;
use ponghub::security::SharedEnv;

async fn target() -> std::net::SocketAddr {
    let app = Router::new()
        .route("/ok", get(|| async { "pong" }))
        .route("/fail", get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
    common::serve(app).await
}

/// Counts webhook deliveries.
async fn hook() -> (std::net::SocketAddr, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route(
            "/hook",
            post(|State(hits): State<Arc<AtomicUsize>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                StatusCode::OK
            }),
        )
        .with_state(Arc::clone(&hits));
    (common::serve(app).await, hits)
}

fn engine(config: MonitorConfig, history: HistoryStore, env: SharedEnv) -> Engine {
    let (dispatcher, _) = Dispatcher::from_config(&config.notifications, Arc::clone(&env)).unwrap();
    Engine::new(config, history, common::prober(env), dispatcher)
}

#[tokio::test]
async fn test_cycle_covers_every_endpoint_once() {
    let addr = target().await;
    let closed = common::closed_port().await;
    let (hook_addr, deliveries) = hook().await;
    let summary_dir = tempfile::tempdir().unwrap();
    let summary = summary_dir.path().join("summary.md");

    let toml = format!(
        r#"
retries = 0
concurrency = 2

[debounce]
fail_after = 1

[[services]]
name = "web"
[[services.endpoints]]
url = "http://{addr}/ok"

[[services]]
name = "broken"
[[services.endpoints]]
url = "http://{addr}/fail"
[[services.endpoints]]
url = "http://127.0.0.1:{closed}/"

[notifications.webhook]
url = "http://{hook_addr}/hook"

[notifications.ci]
summary_file = '{summary}'
"#,
        addr = addr,
        closed = closed,
        hook_addr = hook_addr,
        summary = summary.display()
    );
    let env = common::env(&[]);
    let config = MonitorConfig::from_toml_str(&toml, env.as_ref()).unwrap();
    let (dispatcher, ci_flag) = Dispatcher::from_config(&config.notifications, Arc::clone(&env)).unwrap();
    let history = HistoryStore::new(&config.history);
    let mut engine = Engine::new(config, history, common::prober(env), dispatcher);

    let report = engine.run_cycle().await;

    assert_eq!(report.outcomes.len(), 3);
    let keys: HashSet<&EndpointKey> = report.outcomes.iter().map(|o| &o.result.key).collect();
    assert_eq!(keys.len(), 3);
    assert_eq!(report.history_updates.len(), 3);

    let ok = EndpointKey::new("web", format!("http://{}/ok", addr));
    let unreachable = EndpointKey::new("broken", format!("http://127.0.0.1:{}/", closed));
    assert_eq!(report.outcome(&ok).unwrap().verdict.kind, VerdictKind::Healthy);
    let refused = report.outcome(&unreachable).unwrap();
    assert_eq!(refused.verdict.kind, VerdictKind::Down);
    assert_eq!(refused.result.error.as_ref().unwrap().kind, ProbeErrorKind::Connect);

    assert_eq!(report.snapshot.count_in(EndpointState::Up), 1);
    assert_eq!(report.snapshot.count_in(EndpointState::Down), 2);

    // First sighting of a healthy endpoint is recorded but not notified.
    assert_eq!(report.alerts.len(), 3);
    assert_eq!(report.dispatches.iter().filter(|d| d.suppressed).count(), 1);
    assert_eq!(deliveries.load(Ordering::SeqCst), 2);

    assert!(ci_flag.unwrap().load(Ordering::SeqCst));
    let written = std::fs::read_to_string(&summary).unwrap();
    assert_eq!(written.matches("### ").count(), 2);
}

#[tokio::test]
async fn test_run_deadline_bounds_the_cycle() {
    let addr = target().await;
    let toml = format!(
        r#"
retries = 0
timeout_secs = 30
run_deadline_secs = 1

[[services]]
name = "slow"
[[services.endpoints]]
url = "http://{addr}/slow"

[[services]]
name = "web"
[[services.endpoints]]
url = "http://{addr}/ok"
"#,
        addr = addr
    );
    let env = common::env(&[]);
    let config = MonitorConfig::from_toml_str(&toml, env.as_ref()).unwrap();
    let history = HistoryStore::new(&config.history);
    let mut engine = engine(config, history, env);

    let started = Instant::now();
    let report = engine.run_cycle().await;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(report.outcomes.len(), 2);
    let slow = report
        .outcome(&EndpointKey::new("slow", format!("http://{}/slow", addr)))
        .unwrap();
    assert_eq!(slow.result.error.as_ref().unwrap().kind, ProbeErrorKind::Deadline);
    assert_eq!(slow.verdict.kind, VerdictKind::Down);
    let web = report
        .outcome(&EndpointKey::new("web", format!("http://{}/ok", addr)))
        .unwrap();
    assert_eq!(web.verdict.kind, VerdictKind::Healthy);
}

#[tokio::test]
async fn test_debounce_across_cycles() {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route(
            "/flaky",
            get(|State(hits): State<Arc<AtomicUsize>>| async move {
                let statuses = [200u16, 500, 500, 200];
                let n = hits.fetch_add(1, Ordering::SeqCst);
                StatusCode::from_u16(statuses[n.min(statuses.len() - 1)]).unwrap()
            }),
        )
        .with_state(Arc::clone(&hits));
    let addr = common::serve(app).await;
    let toml = format!(
        r#"
retries = 0

[debounce]
fail_after = 2
recover_after = 1

[[services]]
name = "api"
[[services.endpoints]]
url = "http://{addr}/flaky"
"#,
        addr = addr
    );
    let env = common::env(&[]);
    let config = MonitorConfig::from_toml_str(&toml, env.as_ref()).unwrap();
    let history = HistoryStore::new(&config.history);
    let mut engine = engine(config, history, env);

    let states: Vec<(EndpointState, usize)> = {
        let mut out = Vec::new();
        for _ in 0..4 {
            let report = engine.run_cycle().await;
            out.push((report.snapshot.endpoints[0].status.state, report.alerts.len()));
        }
        out
    };

    assert_eq!(
        states,
        vec![
            (EndpointState::Up, 1),
            (EndpointState::Up, 0),
            (EndpointState::Down, 1),
            (EndpointState::Up, 1),
        ]
    );
}

#[tokio::test]
async fn test_history_survives_restart() {
    let addr = target().await;
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("history.json");
    let toml = format!(
        r#"
retries = 0

[debounce]
fail_after = 1

[history]
max_entries = 2

[[services]]
name = "api"
[[services.endpoints]]
url = "http://{addr}/fail"
"#,
        addr = addr
    );
    let env = common::env(&[]);
    let config = MonitorConfig::from_toml_str(&toml, env.as_ref()).unwrap();
    let key = EndpointKey::new("api", format!("http://{}/fail", addr));

    let mut first = engine(config.clone(), HistoryStore::new(&config.history), Arc::clone(&env));
    let report = first.run_cycle().await;
    assert_eq!(report.alerts.len(), 1);
    first.run_cycle().await;
    first.history().save_to_disk(&data).unwrap();

    let history = HistoryStore::load_from_disk(&data, &config.history).unwrap();
    assert_eq!(history.get(&key).unwrap().len(), 2);

    let mut second = engine(config.clone(), history, env);
    assert_eq!(
        second.state().record(&key).unwrap().tracker.state(),
        EndpointState::Down
    );
    let report = second.run_cycle().await;
    // Still down: the restart does not re-alert.
    assert!(report.alerts.is_empty());

    let window = second.history().get(&key).unwrap();
    assert_eq!(window.len(), 2);
    let summary = second
        .history()
        .summarize(&key, SummaryWindow::LastN(10), chrono::Utc::now());
    assert_eq!(summary.uptime_ratio, Some(0.0));
}

#[tokio::test]
async fn test_unbounded_run_deadline_does_not_overflow() {
    let addr = target().await;
    let mut endpoint = EndpointSpec::new(format!("http://{}/ok", addr));
    endpoint.retries = Some(0);
    let config = MonitorConfig {
        run_deadline_secs: u64::MAX,
        services: vec![ServiceSpec {
            name: "web".to_string(),
            endpoints: vec![endpoint],
        }],
        ..MonitorConfig::default()
    };
    let history = HistoryStore::new(&config.history);
    let mut engine = engine(config, history, common::env(&[]));

    let report = engine.run_cycle().await;

    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].verdict.kind, VerdictKind::Healthy);
}
