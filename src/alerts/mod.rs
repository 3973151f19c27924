//! Alert system module
//!
//! Status transitions become [`AlertEvent`]s; the [`Dispatcher`] filters
//! them through the notification rules and fans each one out to every
//! enabled channel concurrently. A failing channel is logged and never
//! blocks or fails the others.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

pub mod channels;
pub mod rules;
pub mod webhook;

use crate::config::NotificationsConfig;
use crate::monitors::status::{EndpointState, Transition};
use crate::monitors::{EndpointKey, Verdict};
use crate::security::SharedEnv;
use channels::{AlertChannel, ChannelError, CiSignalChannel};
use rules::NotifyRules;
use webhook::WebhookChannel;

/// A status change, rendered for humans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub key: EndpointKey,
    pub previous: EndpointState,
    pub current: EndpointState,
    pub timestamp: DateTime<Utc>,
    /// False for the first observation of a healthy endpoint.
    pub alertable: bool,
    pub title: String,
    pub message: String,
}

impl AlertEvent {
    pub fn from_transition(key: &EndpointKey, transition: &Transition, verdict: &Verdict) -> Self {
        let (title, message) = render(key, transition, verdict);
        Self {
            key: key.clone(),
            previous: transition.from,
            current: transition.to,
            timestamp: transition.at,
            alertable: transition.alertable,
            title,
            message,
        }
    }

    pub fn transition(&self) -> Transition {
        Transition {
            from: self.previous,
            to: self.current,
            at: self.timestamp,
            alertable: self.alertable,
        }
    }
}

/// Title and message for a transition.
pub fn render(key: &EndpointKey, transition: &Transition, verdict: &Verdict) -> (String, String) {
    let marker = match transition.to {
        EndpointState::Up => "🟢",
        EndpointState::Degraded => "🟡",
        EndpointState::Down => "🔴",
        EndpointState::Unknown => "⚪",
    };
    let title = format!(
        "{} PongHub: {} is {}",
        marker,
        key.service,
        transition.to.as_str().to_uppercase()
    );
    let message = format!(
        "Endpoint: {}\nStatus: {} -> {}\nReason: {}\nAt: {}",
        key.endpoint,
        transition.from,
        transition.to,
        verdict.reason,
        transition.at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    (title, message)
}

/// Delivery result for one event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: Vec<String>,
    /// (channel name, error text)
    pub failed: Vec<(String, String)>,
    /// Set when rules or the alertable flag filtered the event out.
    pub suppressed: bool,
}

/// Fans alert events out to the registered channels.
pub struct Dispatcher {
    enabled: bool,
    rules: NotifyRules,
    channels: Vec<Arc<dyn AlertChannel>>,
}

impl Dispatcher {
    pub fn new(rules: NotifyRules) -> Self {
        Self {
            enabled: true,
            rules,
            channels: Vec::new(),
        }
    }

    /// Build the dispatcher and channels described by the config.
    ///
    /// Returns the CI failure flag when the CI channel is configured.
    pub fn from_config(
        config: &NotificationsConfig,
        env: SharedEnv,
    ) -> Result<(Self, Option<Arc<AtomicBool>>), ChannelError> {
        let mut dispatcher = Self::new(config.rules);
        dispatcher.enabled = config.enabled;

        if let Some(ref webhook) = config.webhook {
            dispatcher.register_channel(Arc::new(WebhookChannel::new(webhook, Arc::clone(&env))?));
        }

        let mut ci_flag = None;
        if let Some(ref ci) = config.ci {
            let channel = CiSignalChannel::new(ci, env.as_ref());
            ci_flag = Some(channel.flag());
            dispatcher.register_channel(Arc::new(channel));
        }

        info!(
            "Alerts: {} channel(s) registered, notifications {}",
            dispatcher.channels.len(),
            if dispatcher.enabled { "enabled" } else { "disabled" }
        );
        Ok((dispatcher, ci_flag))
    }

    pub fn register_channel(&mut self, channel: Arc<dyn AlertChannel>) {
        self.channels.push(channel);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn should_dispatch(&self, event: &AlertEvent) -> bool {
        self.enabled && self.rules.should_notify(&event.transition())
    }

    /// Send one event to every interested channel.
    pub async fn dispatch(&self, event: &AlertEvent) -> DispatchReport {
        if !self.should_dispatch(event) {
            debug!(
                "Alerts: {} {} -> {} recorded without notification",
                event.key, event.previous, event.current
            );
            return DispatchReport {
                suppressed: true,
                ..Default::default()
            };
        }

        let targets: Vec<&Arc<dyn AlertChannel>> = self
            .channels
            .iter()
            .filter(|c| c.is_enabled() && c.wants(event))
            .collect();

        let sends = targets.iter().map(|channel| async move {
            let result = channel.send(&event.title, &event.message).await;
            (channel.name().to_string(), result)
        });

        let mut report = DispatchReport::default();
        for (name, result) in join_all(sends).await {
            match result {
                Ok(()) => report.delivered.push(name),
                Err(e) => {
                    error!("Failed to send alert to channel {}: {}", name, e);
                    report.failed.push((name, e.to_string()));
                }
            }
        }
        report
    }

    /// Dispatch events in order, one at a time.
    pub async fn dispatch_all(&self, events: &[AlertEvent]) -> Vec<DispatchReport> {
        let mut reports = Vec::with_capacity(events.len());
        for event in events {
            reports.push(self.dispatch(event).await);
        }
        reports
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(NotifyRules::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recording {
        name: &'static str,
        fail: bool,
        sent: AtomicUsize,
    }

    #[async_trait]
    impl AlertChannel for Recording {
        fn name(&self) -> &str {
            self.name
        }

        async fn send(&self, _title: &str, _message: &str) -> Result<(), ChannelError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ChannelError::Config("boom".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn event(from: EndpointState, to: EndpointState, alertable: bool) -> AlertEvent {
        let key = EndpointKey::new("api", "https://api.test");
        let transition = Transition {
            from,
            to,
            at: Utc::now(),
            alertable,
        };
        AlertEvent::from_transition(&key, &transition, &Verdict::down("connection refused"))
    }

    #[tokio::test]
    async fn test_failing_channel_is_isolated() {
        let bad = Arc::new(Recording {
            name: "bad",
            fail: true,
            sent: AtomicUsize::new(0),
        });
        let good = Arc::new(Recording {
            name: "good",
            fail: false,
            sent: AtomicUsize::new(0),
        });
        let mut dispatcher = Dispatcher::default();
        dispatcher.register_channel(bad.clone());
        dispatcher.register_channel(good.clone());

        let report = dispatcher
            .dispatch(&event(EndpointState::Up, EndpointState::Down, true))
            .await;
        assert_eq!(report.delivered, vec!["good".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "bad");
        assert_eq!(good.sent.load(Ordering::SeqCst), 1);
        assert_eq!(bad.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_alertable_event_is_suppressed() {
        let channel = Arc::new(Recording {
            name: "rec",
            fail: false,
            sent: AtomicUsize::new(0),
        });
        let mut dispatcher = Dispatcher::default();
        dispatcher.register_channel(channel.clone());

        let report = dispatcher
            .dispatch(&event(EndpointState::Unknown, EndpointState::Up, false))
            .await;
        assert!(report.suppressed);
        assert_eq!(channel.sent.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_render_title_and_message() {
        let e = event(EndpointState::Up, EndpointState::Down, true);
        assert!(e.title.contains("api is DOWN"));
        assert!(e.message.contains("https://api.test"));
        assert!(e.message.contains("up -> down"));
        assert!(e.message.contains("connection refused"));
    }
}
