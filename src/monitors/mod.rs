//! Endpoint monitoring module
//!
//! - [`probe`]: issues the HTTP(S) request with retry, backoff and deadline
//! - [`validate`]: turns a probe result into a verdict
//! - [`status`]: debounced per-endpoint status state machine

pub mod probe;
pub mod status;
pub mod validate;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{EndpointSpec, ServiceSpec};

/// Identity of an endpoint: service name, URL template and port override.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointKey {
    pub service: String,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl EndpointKey {
    pub fn new(service: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            endpoint: endpoint.into(),
            port: None,
        }
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    pub fn of(service: &ServiceSpec, endpoint: &EndpointSpec) -> Self {
        Self::new(service.name.clone(), endpoint.url.clone()).with_port(endpoint.port)
    }

    /// Whether `endpoint` is the one this key names.
    pub fn matches(&self, endpoint: &EndpointSpec) -> bool {
        self.endpoint == endpoint.url && self.port == endpoint.port
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{} ({}, port {})", self.service, self.endpoint, port),
            None => write!(f, "{} ({})", self.service, self.endpoint),
        }
    }
}

/// Failure class of a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeErrorKind {
    /// Endpoint timeout elapsed (covers all attempts).
    Timeout,
    /// Connection refused, reset or DNS failure.
    Connect,
    /// Handshake or certificate verification failure.
    Tls,
    /// Any other request-level failure.
    Request,
    /// Response body could not be read.
    Body,
    /// URL did not parse after placeholder expansion.
    InvalidUrl,
    /// Placeholder expansion failed.
    Resolve,
    /// Cycle deadline hit before the probe finished.
    Deadline,
}

impl ProbeErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeErrorKind::Timeout => "timeout",
            ProbeErrorKind::Connect => "connection error",
            ProbeErrorKind::Tls => "tls error",
            ProbeErrorKind::Request => "request error",
            ProbeErrorKind::Body => "body read error",
            ProbeErrorKind::InvalidUrl => "invalid url",
            ProbeErrorKind::Resolve => "parameter error",
            ProbeErrorKind::Deadline => "run deadline exceeded",
        }
    }

    /// Transport-class failures are worth another attempt; TLS and
    /// configuration problems are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProbeErrorKind::Timeout
                | ProbeErrorKind::Connect
                | ProbeErrorKind::Request
                | ProbeErrorKind::Body
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{}: {message}", .kind.as_str())]
pub struct ProbeError {
    pub kind: ProbeErrorKind,
    pub message: String,
}

impl ProbeError {
    pub fn new(kind: ProbeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Outcome of probing one endpoint (all attempts included).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub key: EndpointKey,
    /// Start of the probe.
    pub timestamp: DateTime<Utc>,
    /// Latency of the last attempt.
    #[serde(with = "duration_ms")]
    pub latency: Duration,
    pub status_code: Option<u16>,
    /// Response body of the last attempt, capped.
    #[serde(default, skip_serializing)]
    pub body: Option<String>,
    /// Short version of the body for reports.
    pub body_snippet: Option<String>,
    pub cert_expiry: Option<DateTime<Utc>>,
    pub error: Option<ProbeError>,
    pub attempts: u32,
}

impl ProbeResult {
    /// A result for a probe that produced no response at all.
    pub fn failed(key: EndpointKey, timestamp: DateTime<Utc>, error: ProbeError) -> Self {
        Self {
            key,
            timestamp,
            latency: Duration::ZERO,
            status_code: None,
            body: None,
            body_snippet: None,
            cert_expiry: None,
            error: Some(error),
            attempts: 0,
        }
    }

    pub fn latency_ms(&self) -> u64 {
        self.latency.as_millis() as u64
    }
}

/// Immediate per-probe classification. Ordered so that the worst wins under `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    Healthy,
    Degraded,
    Down,
}

impl fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VerdictKind::Healthy => "healthy",
            VerdictKind::Degraded => "degraded",
            VerdictKind::Down => "down",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub kind: VerdictKind,
    pub reason: String,
}

impl Verdict {
    pub fn healthy() -> Self {
        Self {
            kind: VerdictKind::Healthy,
            reason: "ok".to_string(),
        }
    }

    pub fn degraded(reason: impl Into<String>) -> Self {
        Self {
            kind: VerdictKind::Degraded,
            reason: reason.into(),
        }
    }

    pub fn down(reason: impl Into<String>) -> Self {
        Self {
            kind: VerdictKind::Down,
            reason: reason.into(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.kind == VerdictKind::Healthy
    }
}

/// A probe result with its verdict attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub result: ProbeResult,
    pub verdict: Verdict,
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
