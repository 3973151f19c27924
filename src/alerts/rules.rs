//! Alert rule evaluation

use serde::{Deserialize, Serialize};

use crate::monitors::status::{EndpointState, Transition};

/// Which status transitions produce notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyRules {
    /// Endpoint became Down
    #[serde(default = "default_true")]
    pub on_down: bool,
    /// Endpoint became Degraded
    #[serde(default = "default_true")]
    pub on_degraded: bool,
    /// Endpoint came back Up from Down or Degraded
    #[serde(default = "default_true")]
    pub on_recovery: bool,
}

fn default_true() -> bool {
    true
}

impl Default for NotifyRules {
    fn default() -> Self {
        Self {
            on_down: true,
            on_degraded: true,
            on_recovery: true,
        }
    }
}

impl NotifyRules {
    /// Evaluate rules against a transition
    pub fn should_notify(&self, transition: &Transition) -> bool {
        if !transition.alertable {
            return false;
        }
        match transition.to {
            EndpointState::Down => self.on_down,
            EndpointState::Degraded => self.on_degraded,
            EndpointState::Up => self.on_recovery,
            EndpointState::Unknown => false,
        }
    }
}
