//! HTTP(S) probe executor
//!
//! One call to [`Prober::probe`] covers every attempt made for an endpoint.
//! The endpoint timeout is a deadline over the whole probe, so backoff
//! sleeps and retries all draw from the same budget; an attempt whose
//! backoff would end past the deadline is never started.

use std::error::Error as StdError;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use tokio::time::Instant;
use tracing::{debug, trace};
use url::Url;

use super::{EndpointKey, ProbeError, ProbeErrorKind, ProbeResult};
use crate::config::{Config, EndpointSpec};
use crate::logging::ellipse;
use crate::params::ParamResolver;
use crate::security::{mask_header_value, SharedEnv};

/// Bodies larger than this are cut before validation.
pub const MAX_BODY_BYTES: usize = 64 * 1024;
const SNIPPET_CHARS: usize = 200;
/// Stand-in for budgets too large for the monotonic clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + budget`, saturating instead of overflowing.
pub(crate) fn deadline_in(budget: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(budget)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given (zero-based) attempt: `base * 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Request with every placeholder already expanded.
#[derive(Debug, Clone)]
struct PreparedRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<String>,
    verify_tls: bool,
}

/// What one attempt produced.
#[derive(Debug, Default)]
struct Attempt {
    latency: Duration,
    status_code: Option<u16>,
    body: Option<String>,
    cert_expiry: Option<DateTime<Utc>>,
    error: Option<ProbeError>,
}

impl Attempt {
    fn from_error(error: ProbeError, latency: Duration) -> Self {
        Self {
            latency,
            error: Some(error),
            ..Default::default()
        }
    }

    /// 5xx and transport-class errors may be retried; anything else is final.
    fn is_retryable(&self) -> bool {
        match (&self.error, self.status_code) {
            (Some(e), _) => e.is_retryable(),
            (None, Some(code)) => code >= 500,
            (None, None) => false,
        }
    }

    fn is_success(&self) -> bool {
        self.error.is_none() && matches!(self.status_code, Some(code) if code < 400)
    }
}

/// Retry state machine driving a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryState {
    Attempting { attempt: u32 },
    RetryWait { next: u32, delay: Duration },
    Success,
    Failed,
}

/// Executes probes. Cheap to clone; clones share the connection pools.
#[derive(Clone)]
pub struct Prober {
    verifying: Client,
    lenient: Client,
    policy: RetryPolicy,
    env: SharedEnv,
}

impl Prober {
    pub fn new(policy: RetryPolicy, env: SharedEnv) -> anyhow::Result<Self> {
        Self::with_root_certificates(policy, env, &[])
    }

    /// Like [`Prober::new`], additionally trusting the given PEM root
    /// certificates when verifying endpoints.
    pub fn with_root_certificates(policy: RetryPolicy, env: SharedEnv, roots: &[Vec<u8>]) -> anyhow::Result<Self> {
        use anyhow::Context;

        let mut builder = Client::builder().user_agent(Config::user_agent()).tls_info(true);
        for (i, pem) in roots.iter().enumerate() {
            let cert = reqwest::Certificate::from_pem(pem)
                .with_context(|| format!("Invalid root certificate #{}", i + 1))?;
            builder = builder.add_root_certificate(cert);
        }
        if !roots.is_empty() {
            debug!("Monitor: trusting {} extra root certificate(s)", roots.len());
        }
        let verifying = builder.build().context("Failed to create HTTP client")?;
        // Certificate checks disabled: accept self-signed or expired certificates.
        let lenient = Client::builder()
            .user_agent(Config::user_agent())
            .danger_accept_invalid_certs(true)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            verifying,
            lenient,
            policy,
            env,
        })
    }

    /// Probe one endpoint. Never fails: every problem ends up in the result.
    pub async fn probe(&self, key: EndpointKey, spec: &EndpointSpec) -> ProbeResult {
        let started_at = Utc::now();
        let request = match self.prepare(spec, started_at) {
            Ok(request) => request,
            Err(error) => {
                debug!("Monitor: {} not probed: {}", key, error);
                return ProbeResult::failed(key, started_at, error);
            }
        };

        let timeout = spec.timeout();
        let retries = spec.retries();
        let deadline = deadline_in(timeout);

        let mut state = RetryState::Attempting { attempt: 0 };
        let mut attempts = 0u32;
        let mut last = Attempt::default();

        loop {
            state = match state {
                RetryState::Attempting { attempt } => {
                    attempts += 1;
                    trace!(
                        "Monitor: {} attempt {}/{}",
                        key,
                        attempt + 1,
                        retries + 1
                    );
                    last = self.attempt(&request, deadline, timeout).await;

                    if last.is_success() {
                        RetryState::Success
                    } else if !last.is_retryable() || attempt >= retries {
                        // 4xx, config-class errors or out of retries.
                        RetryState::Failed
                    } else {
                        let delay = self.policy.backoff(attempt);
                        // Don't start a wait that would end past the deadline.
                        let resume = Instant::now().checked_add(delay);
                        if resume.map_or(true, |at| at >= deadline) {
                            debug!(
                                "Monitor: {} retry budget exhausted after {} attempt(s)",
                                key, attempts
                            );
                            RetryState::Failed
                        } else {
                            RetryState::RetryWait {
                                next: attempt + 1,
                                delay,
                            }
                        }
                    }
                }
                RetryState::RetryWait { next, delay } => {
                    // The wait fits inside the deadline, checked above.
                    trace!("Monitor: {} backing off {:?}", key, delay);
                    tokio::time::sleep(delay).await;
                    RetryState::Attempting { attempt: next }
                }
                RetryState::Success | RetryState::Failed => break,
            };
        }

        match (&last.error, last.status_code) {
            (Some(e), _) => debug!("Monitor: {} failed after {} attempt(s): {}", key, attempts, e),
            (None, Some(code)) => debug!(
                "Monitor: {} -> {} in {}ms ({} attempt(s))",
                key,
                code,
                last.latency.as_millis(),
                attempts
            ),
            (None, None) => {}
        }

        let body_snippet = last
            .body
            .as_deref()
            .map(|b| ellipse(b.trim(), SNIPPET_CHARS));

        ProbeResult {
            key,
            timestamp: started_at,
            latency: last.latency,
            status_code: last.status_code,
            body: last.body,
            body_snippet,
            cert_expiry: last.cert_expiry,
            error: last.error,
            attempts,
        }
    }

    /// Expand placeholders once for the whole probe and build the request parts.
    fn prepare(&self, spec: &EndpointSpec, now: DateTime<Utc>) -> Result<PreparedRequest, ProbeError> {
        let mut resolver = ParamResolver::new(self.env.as_ref(), now);
        let resolve_err = |e: crate::params::ResolveError| ProbeError::new(ProbeErrorKind::Resolve, e.to_string());

        let raw_url = resolver.resolve(&spec.url).map_err(resolve_err)?;
        let mut url = Url::parse(&raw_url)
            .map_err(|e| ProbeError::new(ProbeErrorKind::InvalidUrl, format!("{}: {}", raw_url, e)))?;
        if let Some(port) = spec.port {
            url.set_port(Some(port)).map_err(|_| {
                ProbeError::new(ProbeErrorKind::InvalidUrl, format!("cannot set port on {}", raw_url))
            })?;
        }

        let method = Method::from_bytes(spec.method.trim().to_uppercase().as_bytes())
            .map_err(|e| ProbeError::new(ProbeErrorKind::InvalidUrl, format!("method {}: {}", spec.method, e)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &spec.headers {
            let value = resolver.resolve(value).map_err(resolve_err)?;
            trace!("Monitor: header {}: {}", name, mask_header_value(name, &value));
            let header_err = |e: &dyn std::fmt::Display| {
                ProbeError::new(ProbeErrorKind::Request, format!("header {}: {}", name, e))
            };
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| header_err(&e))?;
            let header_value = HeaderValue::from_str(&value).map_err(|e| header_err(&e))?;
            headers.insert(header_name, header_value);
        }

        let body = resolver.resolve_opt(spec.body.as_deref()).map_err(resolve_err)?;

        Ok(PreparedRequest {
            method,
            url,
            headers,
            body,
            verify_tls: spec.check_ssl(),
        })
    }

    async fn attempt(&self, request: &PreparedRequest, deadline: Instant, timeout: Duration) -> Attempt {
        let start = Instant::now();
        let remaining = deadline.saturating_duration_since(start);
        // Budget spent by earlier attempts and waits.
        if remaining.is_zero() {
            return Attempt::from_error(timeout_error(timeout), Duration::ZERO);
        }

        let client = if request.verify_tls {
            &self.verifying
        } else {
            &self.lenient
        };
        let mut builder = client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .timeout(remaining);
        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }

        let exchange = async {
            let mut resp = builder.send().await.map_err(classify_error)?;
            let status_code = resp.status().as_u16();
            let cert_expiry = if request.verify_tls && request.url.scheme() == "https" {
                leaf_certificate_expiry(&resp)
            } else {
                None
            };

            // Read at most MAX_BODY_BYTES, dropping the rest of the stream.
            let mut body = Vec::new();
            while let Some(chunk) = resp.chunk().await.map_err(classify_error)? {
                let room = MAX_BODY_BYTES.saturating_sub(body.len());
                body.extend_from_slice(&chunk[..chunk.len().min(room)]);
                if body.len() >= MAX_BODY_BYTES {
                    break;
                }
            }
            Ok::<_, ProbeError>((status_code, cert_expiry, String::from_utf8_lossy(&body).into_owned()))
        };

        match tokio::time::timeout_at(deadline, exchange).await {
            Ok(Ok((status_code, cert_expiry, body))) => Attempt {
                latency: start.elapsed(),
                status_code: Some(status_code),
                body: Some(body),
                cert_expiry,
                error: None,
            },
            Ok(Err(error)) => Attempt::from_error(error, start.elapsed()),
            Err(_) => Attempt::from_error(timeout_error(timeout), start.elapsed()),
        }
    }
}

fn timeout_error(timeout: Duration) -> ProbeError {
    ProbeError::new(
        ProbeErrorKind::Timeout,
        format!("no response within {}s", timeout.as_secs_f64()),
    )
}

/// Map a reqwest error onto a probe error class. TLS failures show up as
/// connect errors, so the causes are searched for them first. The top-level
/// message carries the request URL and is left out of that search.
fn classify_error(err: reqwest::Error) -> ProbeError {
    let causes = err.source().map(error_chain).unwrap_or_default().to_lowercase();
    let kind = if err.is_timeout() {
        ProbeErrorKind::Timeout
    } else if is_tls_failure(&causes) {
        ProbeErrorKind::Tls
    } else if err.is_connect() {
        ProbeErrorKind::Connect
    } else if err.is_body() || err.is_decode() {
        ProbeErrorKind::Body
    } else {
        ProbeErrorKind::Request
    };
    ProbeError::new(kind, error_chain(&err))
}

fn is_tls_failure(causes: &str) -> bool {
    ["certificate", "tls", "ssl", "handshake"]
        .iter()
        .any(|needle| causes.contains(needle))
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !parts.iter().any(|p| p.contains(&text)) {
            parts.push(text);
        }
        source = cause.source();
    }
    parts.join(": ")
}

/// Expiry (`notAfter`) of the server's leaf certificate, if the TLS
/// backend exposed it.
fn leaf_certificate_expiry(resp: &reqwest::Response) -> Option<DateTime<Utc>> {
    let info = resp.extensions().get::<reqwest::tls::TlsInfo>()?;
    let der = info.peer_certificate()?;
    match x509_parser::parse_x509_certificate(der) {
        Ok((_, cert)) => DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0),
        Err(e) => {
            debug!("Monitor: could not parse peer certificate: {}", e);
            None
        }
    }
}
