//! Alert channel implementations

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::webhook::WebhookError;
use super::AlertEvent;
use crate::config::CiConfig;
use crate::monitors::status::EndpointState;
use crate::security::EnvLookup;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error(transparent)]
    Webhook(#[from] WebhookError),

    #[error("channel misconfigured: {0}")]
    Config(String),

    #[error("payload error: {0}")]
    Payload(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Trait for alert channels
///
/// Implementations must tolerate concurrent `send` calls on one instance.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool {
        true
    }

    /// Whether this channel cares about the event at all.
    fn wants(&self, _event: &AlertEvent) -> bool {
        true
    }

    async fn send(&self, title: &str, message: &str) -> Result<(), ChannelError>;
}

/// Fails the surrounding CI job when an endpoint goes down or degraded.
///
/// Prints a GitHub Actions `::error` workflow command, appends to the step
/// summary file and trips a flag the entry point turns into exit status 1.
pub struct CiSignalChannel {
    enabled: bool,
    summary_file: Option<PathBuf>,
    tripped: Arc<AtomicBool>,
}

impl CiSignalChannel {
    pub fn new(config: &CiConfig, env: &dyn EnvLookup) -> Self {
        let summary_file = config
            .summary_file
            .clone()
            .or_else(|| env.get("GITHUB_STEP_SUMMARY").filter(|p| !p.is_empty()).map(PathBuf::from));
        Self {
            enabled: config.enabled,
            summary_file,
            tripped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag, set once any failure was signalled.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.tripped)
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AlertChannel for CiSignalChannel {
    fn name(&self) -> &str {
        "ci"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn wants(&self, event: &AlertEvent) -> bool {
        event.current != EndpointState::Up
    }

    async fn send(&self, title: &str, message: &str) -> Result<(), ChannelError> {
        self.tripped.store(true, Ordering::SeqCst);
        println!(
            "::error title={}::{}",
            escape_property(title),
            escape_data(message)
        );

        if let Some(ref path) = self.summary_file {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            let section = format!("### {}\n\n{}\n\n", title, message);
            file.write_all(section.as_bytes()).await?;
            file.flush().await?;
            debug!("Alerts: appended CI summary to {:?}", path);
        }
        Ok(())
    }
}

/// Workflow command data escaping.
fn escape_data(s: &str) -> String {
    s.replace('%', "%25").replace('\r', "%0D").replace('\n', "%0A")
}

fn escape_property(s: &str) -> String {
    escape_data(s).replace(':', "%3A").replace(',', "%2C")
}
