mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;

use ponghub::config::{BodyPattern, EndpointSpec};
use ponghub::monitors::validate::validate;
use ponghub::monitors::{EndpointKey, ProbeErrorKind, VerdictKind};

fn spec(url: String, retries: u32) -> EndpointSpec {
    let mut spec = EndpointSpec::new(url);
    spec.retries = Some(retries);
    spec.timeout_secs = Some(5);
    spec
}

/// Answers with the given statuses in order, then repeats the last one.
fn scripted(statuses: &'static [u16]) -> (Router, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route(
            "/health",
            get(move |State(hits): State<Arc<AtomicUsize>>| async move {
                let n = hits.fetch_add(1, Ordering::SeqCst);
                let code = statuses[n.min(statuses.len() - 1)];
                (StatusCode::from_u16(code).unwrap(), "pong")
            }),
        )
        .with_state(Arc::clone(&hits));
    (app, hits)
}

#[tokio::test]
async fn test_retries_until_success() {
    let (app, hits) = scripted(&[503, 503, 200]);
    let addr = common::serve(app).await;
    let prober = common::prober(common::env(&[]));
    let spec = spec(format!("http://{}/health", addr), 2);

    let result = prober.probe(EndpointKey::new("api", &spec.url), &spec).await;

    assert_eq!(result.attempts, 3);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(result.status_code, Some(200));
    assert!(result.error.is_none());
    assert_eq!(validate(&result, &spec).kind, VerdictKind::Healthy);
}

#[tokio::test]
async fn test_server_error_without_retries_is_one_attempt() {
    let (app, hits) = scripted(&[500]);
    let addr = common::serve(app).await;
    let prober = common::prober(common::env(&[]));
    let spec = spec(format!("http://{}/health", addr), 0);

    let result = prober.probe(EndpointKey::new("api", &spec.url), &spec).await;

    assert_eq!(result.attempts, 1);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(result.status_code, Some(500));
    let verdict = validate(&result, &spec);
    assert_eq!(verdict.kind, VerdictKind::Down);
    assert!(verdict.reason.contains("500"));
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let (app, hits) = scripted(&[404]);
    let addr = common::serve(app).await;
    let prober = common::prober(common::env(&[]));
    let spec = spec(format!("http://{}/health", addr), 3);

    let result = prober.probe(EndpointKey::new("api", &spec.url), &spec).await;

    assert_eq!(result.attempts, 1);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(validate(&result, &spec).kind, VerdictKind::Down);
}

#[tokio::test]
async fn test_expected_status_accepts_non_2xx() {
    let (app, _) = scripted(&[404]);
    let addr = common::serve(app).await;
    let prober = common::prober(common::env(&[]));
    let mut spec = spec(format!("http://{}/health", addr), 0);
    spec.expected_status = vec![404];

    let result = prober.probe(EndpointKey::new("api", &spec.url), &spec).await;
    assert_eq!(validate(&result, &spec).kind, VerdictKind::Healthy);
}

#[tokio::test]
async fn test_slow_endpoint_times_out() {
    let app = Router::new().route(
        "/slow",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            "late"
        }),
    );
    let addr = common::serve(app).await;
    let prober = common::prober(common::env(&[]));
    let mut spec = spec(format!("http://{}/slow", addr), 0);
    spec.timeout_secs = Some(1);

    let started = Instant::now();
    let result = prober.probe(EndpointKey::new("api", &spec.url), &spec).await;

    assert!(started.elapsed() < Duration::from_millis(2500));
    let error = result.error.as_ref().unwrap();
    assert_eq!(error.kind, ProbeErrorKind::Timeout);
    assert_eq!(validate(&result, &spec).kind, VerdictKind::Down);
}

#[tokio::test]
async fn test_retries_stay_within_timeout() {
    let (app, hits) = scripted(&[503]);
    let addr = common::serve(app).await;
    let prober = ponghub::monitors::probe::Prober::new(
        ponghub::monitors::probe::RetryPolicy {
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(5),
        },
        common::env(&[]),
    )
    .unwrap();
    let mut spec = spec(format!("http://{}/health", addr), 10);
    spec.timeout_secs = Some(1);

    let started = Instant::now();
    let result = prober.probe(EndpointKey::new("api", &spec.url), &spec).await;

    assert!(started.elapsed() < Duration::from_millis(1500));
    assert!(result.attempts >= 1 && result.attempts < 11);
    assert_eq!(hits.load(Ordering::SeqCst), result.attempts as usize);
    assert_eq!(result.status_code, Some(503));
}

#[tokio::test]
async fn test_connection_refused() {
    let port = common::closed_port().await;
    let prober = common::prober(common::env(&[]));
    let spec = spec(format!("http://127.0.0.1:{}/", port), 1);

    let result = prober.probe(EndpointKey::new("api", &spec.url), &spec).await;

    assert_eq!(result.error.as_ref().unwrap().kind, ProbeErrorKind::Connect);
    assert_eq!(result.attempts, 2);
    assert!(result.status_code.is_none());
}

#[tokio::test]
async fn test_tls_words_in_url_do_not_make_a_tls_error() {
    let port = common::closed_port().await;
    let prober = common::prober(common::env(&[]));
    let spec = spec(
        format!("http://127.0.0.1:{}/tls-handshake-ssl-certificate", port),
        2,
    );

    let result = prober.probe(EndpointKey::new("api", &spec.url), &spec).await;

    let error = result.error.unwrap();
    assert_eq!(error.kind, ProbeErrorKind::Connect, "{}", error);
    assert!(error.is_retryable());
    assert_eq!(result.attempts, 3);
}

#[tokio::test]
async fn test_unbounded_timeout_does_not_overflow() {
    let (app, _) = scripted(&[200]);
    let addr = common::serve(app).await;
    let prober = common::prober(common::env(&[]));
    let mut spec = spec(format!("http://{}/health", addr), 1);
    spec.timeout_secs = Some(u64::MAX);

    let result = prober.probe(EndpointKey::new("api", &spec.url), &spec).await;

    assert_eq!(result.status_code, Some(200));
    assert_eq!(result.attempts, 1);
}

#[tokio::test]
async fn test_placeholders_and_body_pattern() {
    let app = Router::new().route(
        "/echo",
        post(|headers: HeaderMap, body: String| async move {
            let token = headers
                .get("x-token")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            format!("token={} body={}", token, body)
        }),
    );
    let addr = common::serve(app).await;
    let prober = common::prober(common::env(&[("PONG_TOKEN", "s3cret")]));

    let mut spec = spec(format!("http://{}/echo", addr), 0);
    spec.method = "POST".to_string();
    spec.headers.insert("X-Token".to_string(), "{{env(PONG_TOKEN)}}".to_string());
    spec.body = Some("hello {{env(MISSING, world)}}".to_string());
    spec.body_pattern = Some(BodyPattern::new(r"^token=s3cret body=hello world$").unwrap());

    let result = prober.probe(EndpointKey::new("api", &spec.url), &spec).await;
    assert_eq!(result.body.as_deref(), Some("token=s3cret body=hello world"));
    assert_eq!(validate(&result, &spec).kind, VerdictKind::Healthy);

    spec.body_pattern = Some(BodyPattern::new("maintenance").unwrap());
    let result = prober.probe(EndpointKey::new("api", &spec.url), &spec).await;
    assert_eq!(validate(&result, &spec).kind, VerdictKind::Down);
}

#[tokio::test]
async fn test_port_override() {
    let (app, hits) = scripted(&[200]);
    let addr = common::serve(app).await;
    let prober = common::prober(common::env(&[]));
    let mut spec = spec("http://127.0.0.1:1/health".to_string(), 0);
    spec.port = Some(addr.port());

    let result = prober.probe(EndpointKey::new("api", &spec.url), &spec).await;
    assert_eq!(result.status_code, Some(200));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
