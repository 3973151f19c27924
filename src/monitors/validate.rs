//! Response validation
//!
//! [`validate`] is a pure function of the probe result and the endpoint
//! spec. Certificate age is measured against the probe's own timestamp, so
//! validating the same result twice always gives the same verdict.

use chrono::Duration;

use super::{ProbeResult, Verdict, VerdictKind};
use crate::config::EndpointSpec;

pub fn validate(result: &ProbeResult, spec: &EndpointSpec) -> Verdict {
    if let Some(ref error) = result.error {
        return Verdict::down(error.to_string());
    }

    let Some(status) = result.status_code else {
        return Verdict::down("no response");
    };
    if !spec.accepts_status(status) {
        let expected = if spec.expected_status.is_empty() {
            "2xx".to_string()
        } else {
            spec.expected_status
                .iter()
                .map(u16::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        return Verdict::down(format!("unexpected status {} (expected {})", status, expected));
    }

    // Certificate and body checks are independent; the worst one decides.
    let mut findings: Vec<(VerdictKind, String)> = Vec::new();

    if spec.check_ssl() {
        if let Some(expiry) = result.cert_expiry {
            let remaining = expiry - result.timestamp;
            if remaining <= Duration::zero() {
                findings.push((
                    VerdictKind::Down,
                    format!("certificate expired on {}", expiry.format("%Y-%m-%d")),
                ));
            } else if within_warning(remaining, spec.cert_warn_days()) {
                findings.push((
                    VerdictKind::Degraded,
                    format!(
                        "certificate expires in {} day(s) ({})",
                        remaining.num_days(),
                        expiry.format("%Y-%m-%d")
                    ),
                ));
            }
        }
    }

    if let Some(ref pattern) = spec.body_pattern {
        let body = result.body.as_deref().unwrap_or_default();
        if !pattern.is_match(body) {
            findings.push((
                VerdictKind::Down,
                format!("body does not match /{}/", pattern.as_str()),
            ));
        }
    }

    match findings.iter().map(|(kind, _)| *kind).max() {
        None => Verdict::healthy(),
        Some(kind) => Verdict {
            kind,
            reason: findings
                .into_iter()
                .map(|(_, reason)| reason)
                .collect::<Vec<_>>()
                .join("; "),
        },
    }
}

/// Windows past the range of `Duration` cover every future expiry, or none
/// when negative.
fn within_warning(remaining: Duration, warn_days: i64) -> bool {
    match Duration::try_days(warn_days) {
        Some(window) => remaining <= window,
        None => warn_days > 0,
    }
}
