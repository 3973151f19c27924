//! Configuration management module
//!
//! Provides centralized configuration including:
//! - Well-known paths (log file, history data, report snapshot)
//! - The monitor configuration file (services, endpoints, notifications)
//!
//! The config file is TOML. Global settings act as defaults for every
//! endpoint; [`MonitorConfig::load`] parses, fills in those defaults and
//! validates, so anything returned from it is ready for the engine.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::alerts::rules::NotifyRules;
use crate::alerts::webhook::WebhookConfig;
use crate::params::ParamResolver;
use crate::security::EnvLookup;

/// Configuration manager
pub struct Config;

impl Config {
    fn base_dir() -> Option<PathBuf> {
        std::env::var("HOME")
            .ok()
            .map(|home| PathBuf::from(home).join(".ponghub"))
    }

    /// Get the log file path
    ///
    /// Returns `$HOME/.ponghub/ponghub.log`, or a file in the temp directory
    /// if HOME is not available.
    pub fn log_file_path() -> PathBuf {
        Self::base_dir()
            .map(|dir| dir.join("ponghub.log"))
            .unwrap_or_else(|| std::env::temp_dir().join("ponghub.log"))
    }

    /// Get the history data file path: `$HOME/.ponghub/data.json`
    pub fn data_file_path() -> PathBuf {
        Self::base_dir()
            .map(|dir| dir.join("data.json"))
            .unwrap_or_else(|| std::env::temp_dir().join("ponghub-data.json"))
    }

    /// Get the report snapshot path: `$HOME/.ponghub/snapshot.json`
    pub fn snapshot_file_path() -> PathBuf {
        Self::base_dir()
            .map(|dir| dir.join("snapshot.json"))
            .unwrap_or_else(|| std::env::temp_dir().join("ponghub-snapshot.json"))
    }

    /// Default config file, looked up in the working directory.
    pub fn default_config_path() -> PathBuf {
        PathBuf::from("config.toml")
    }

    /// Get the version string
    pub fn version() -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    /// User agent sent with probes and webhook calls.
    pub fn user_agent() -> String {
        format!("ponghub/{}", Self::version())
    }

    /// Create the directory containing `path` if it doesn't exist.
    pub fn ensure_parent_directory(path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

const DEFAULT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_RETRIES: u32 = 2;
const DEFAULT_CERT_WARN_DAYS: i64 = 7;

const MAX_TIMEOUT_SECS: u64 = 3_600;
const MAX_RETRIES: u32 = 100;
const MAX_RETRY_DELAY_MS: u64 = 600_000;
const MAX_CERT_WARN_DAYS: i64 = 3_650;
const MAX_RUN_DEADLINE_SECS: u64 = 86_400;
const MAX_HISTORY_AGE_DAYS: u32 = 36_500;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Regex the response body must match, compiled when the config is parsed.
#[derive(Clone)]
pub struct BodyPattern(Regex);

impl BodyPattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(Self)
    }

    pub fn is_match(&self, body: &str) -> bool {
        self.0.is_match(body)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for BodyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BodyPattern").field(&self.0.as_str()).finish()
    }
}

impl PartialEq for BodyPattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Serialize for BodyPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for BodyPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        BodyPattern::new(&raw)
            .map_err(|e| serde::de::Error::custom(format!("invalid body_pattern {:?}: {}", raw, e)))
    }
}

/// A single checkable URL belonging to a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointSpec {
    /// URL template, may contain `{{...}}` placeholders.
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    /// Accepted status codes; empty means any 2xx.
    #[serde(default, alias = "status_code")]
    pub expected_status: Vec<u16>,
    #[serde(default, alias = "response_regex")]
    pub body_pattern: Option<BodyPattern>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub check_ssl: Option<bool>,
    #[serde(default)]
    pub cert_warn_days: Option<i64>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl EndpointSpec {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            port: None,
            headers: BTreeMap::new(),
            body: None,
            expected_status: Vec::new(),
            body_pattern: None,
            timeout_secs: None,
            retries: None,
            check_ssl: None,
            cert_warn_days: None,
        }
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }

    pub fn retries(&self) -> u32 {
        self.retries.unwrap_or(DEFAULT_RETRIES)
    }

    pub fn check_ssl(&self) -> bool {
        self.check_ssl.unwrap_or(true)
    }

    pub fn cert_warn_days(&self) -> i64 {
        self.cert_warn_days.unwrap_or(DEFAULT_CERT_WARN_DAYS)
    }

    /// Whether `status` satisfies the expectation.
    pub fn accepts_status(&self, status: u16) -> bool {
        if self.expected_status.is_empty() {
            (200..300).contains(&status)
        } else {
            self.expected_status.contains(&status)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSpec {
    pub name: String,
    #[serde(default)]
    pub endpoints: Vec<EndpointSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default)]
    pub max_age_days: Option<u32>,
}

fn default_max_entries() -> usize {
    100
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            max_age_days: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DebounceConfig {
    /// Consecutive matching non-healthy verdicts before Down/Degraded.
    #[serde(default = "default_fail_after")]
    pub fail_after: u32,
    /// Consecutive healthy verdicts before Up.
    #[serde(default = "default_recover_after")]
    pub recover_after: u32,
}

fn default_fail_after() -> u32 {
    2
}

fn default_recover_after() -> u32 {
    1
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            fail_after: default_fail_after(),
            recover_after: default_recover_after(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Markdown summary file; falls back to `GITHUB_STEP_SUMMARY`.
    #[serde(default)]
    pub summary_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub rules: NotifyRules,
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
    #[serde(default)]
    pub ci: Option<CiConfig>,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rules: NotifyRules::default(),
            webhook: None,
            ci: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Top-level monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_true")]
    pub check_ssl: bool,
    #[serde(default = "default_cert_warn_days")]
    pub cert_warn_days: i64,
    /// Maximum number of probes in flight.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Hard deadline for a whole cycle.
    #[serde(default = "default_run_deadline_secs")]
    pub run_deadline_secs: u64,
    /// Cron expression (with seconds) driving watch mode.
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub debounce: DebounceConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    /// Extra PEM root certificates trusted when verifying endpoints.
    #[serde(default)]
    pub ca_certificates: Vec<PathBuf>,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
    /// Non-fatal problems found while loading.
    #[serde(skip)]
    pub warnings: Vec<String>,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    5_000
}

fn default_cert_warn_days() -> i64 {
    DEFAULT_CERT_WARN_DAYS
}

fn default_concurrency() -> usize {
    8
}

fn default_run_deadline_secs() -> u64 {
    120
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            retries: default_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            check_ssl: true,
            cert_warn_days: default_cert_warn_days(),
            concurrency: default_concurrency(),
            run_deadline_secs: default_run_deadline_secs(),
            schedule: None,
            history: HistoryConfig::default(),
            debounce: DebounceConfig::default(),
            notifications: NotificationsConfig::default(),
            ca_certificates: Vec::new(),
            services: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

impl MonitorConfig {
    /// Read, parse, default and validate a config file.
    pub fn load(path: &Path, env: &dyn EnvLookup) -> Result<Self, ConfigError> {
        info!("Config: loading {:?}", path);
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content, env)
    }

    /// Parse, default and validate config text.
    pub fn from_toml_str(content: &str, env: &dyn EnvLookup) -> Result<Self, ConfigError> {
        let mut config: MonitorConfig = toml::from_str(content)?;
        config.apply_defaults();
        config.warnings = config.validate(env)?;
        info!(
            "Config: {} services, {} endpoints, {} warning(s)",
            config.services.len(),
            config.endpoint_count(),
            config.warnings.len()
        );
        Ok(config)
    }

    /// Copy global settings into every endpoint that doesn't override them.
    pub fn apply_defaults(&mut self) {
        for service in &mut self.services {
            for endpoint in &mut service.endpoints {
                endpoint.timeout_secs.get_or_insert(self.timeout_secs);
                endpoint.retries.get_or_insert(self.retries);
                endpoint.check_ssl.get_or_insert(self.check_ssl);
                endpoint.cert_warn_days.get_or_insert(self.cert_warn_days);
                endpoint.method = endpoint.method.trim().to_uppercase();
            }
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.services.iter().map(|s| s.endpoints.len()).sum()
    }

    pub fn retry_policy(&self) -> crate::monitors::probe::RetryPolicy {
        crate::monitors::probe::RetryPolicy {
            base_delay: std::time::Duration::from_millis(self.retry_base_delay_ms),
            max_delay: std::time::Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    /// Check every rule and report all problems at once.
    ///
    /// On success returns the warnings, e.g. unknown placeholders that will
    /// be sent verbatim.
    pub fn validate(&self, env: &dyn EnvLookup) -> Result<Vec<String>, ConfigError> {
        let mut problems = Vec::new();
        let mut warnings = Vec::new();

        if !(1..=MAX_TIMEOUT_SECS).contains(&self.timeout_secs) {
            problems.push(format!("timeout_secs must be between 1 and {}", MAX_TIMEOUT_SECS));
        }
        if self.retries > MAX_RETRIES {
            problems.push(format!("retries must not exceed {}", MAX_RETRIES));
        }
        if self.retry_max_delay_ms > MAX_RETRY_DELAY_MS {
            problems.push(format!(
                "retry_max_delay_ms must not exceed {}",
                MAX_RETRY_DELAY_MS
            ));
        }
        if !(0..=MAX_CERT_WARN_DAYS).contains(&self.cert_warn_days) {
            problems.push(format!(
                "cert_warn_days must be between 0 and {}",
                MAX_CERT_WARN_DAYS
            ));
        }
        if !(1..=MAX_RUN_DEADLINE_SECS).contains(&self.run_deadline_secs) {
            problems.push(format!(
                "run_deadline_secs must be between 1 and {}",
                MAX_RUN_DEADLINE_SECS
            ));
        }
        if self.history.max_age_days.is_some_and(|days| days > MAX_HISTORY_AGE_DAYS) {
            problems.push(format!(
                "history.max_age_days must not exceed {}",
                MAX_HISTORY_AGE_DAYS
            ));
        }
        if self.concurrency == 0 {
            problems.push("concurrency must be at least 1".to_string());
        }
        if self.history.max_entries == 0 {
            problems.push("history.max_entries must be at least 1".to_string());
        }
        if self.debounce.fail_after == 0 || self.debounce.recover_after == 0 {
            problems.push("debounce thresholds must be at least 1".to_string());
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            problems.push("retry_base_delay_ms must not exceed retry_max_delay_ms".to_string());
        }
        if let Some(ref schedule) = self.schedule {
            if let Err(e) = cron::Schedule::from_str(schedule) {
                problems.push(format!("invalid schedule {:?}: {}", schedule, e));
            }
        }

        let mut service_names = HashSet::new();
        for service in &self.services {
            let name = service.name.trim();
            if name.is_empty() {
                problems.push("service with empty name".to_string());
                continue;
            }
            if !service_names.insert(name.to_string()) {
                problems.push(format!("duplicate service name {:?}", name));
            }
            if service.endpoints.is_empty() {
                problems.push(format!("service {:?} has no endpoints", name));
            }

            // Endpoints are identified by URL and port override together.
            let mut seen = HashSet::new();
            for endpoint in &service.endpoints {
                if !seen.insert((endpoint.url.as_str(), endpoint.port)) {
                    let port = endpoint
                        .port
                        .map(|p| format!(" on port {}", p))
                        .unwrap_or_default();
                    problems.push(format!(
                        "service {:?}: duplicate endpoint {:?}{}",
                        name, endpoint.url, port
                    ));
                }
                validate_endpoint(name, endpoint, env, &mut problems, &mut warnings);
            }
        }

        if let Some(ref webhook) = self.notifications.webhook {
            if let Err(e) = webhook.validate(env) {
                problems.push(format!("notifications.webhook: {}", e));
            }
        }

        if problems.is_empty() {
            debug!("Config: validation passed");
            Ok(warnings)
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

fn validate_endpoint(
    service: &str,
    endpoint: &EndpointSpec,
    env: &dyn EnvLookup,
    problems: &mut Vec<String>,
    warnings: &mut Vec<String>,
) {
    let ctx = format!("service {:?} endpoint {:?}", service, endpoint.url);

    if reqwest::Method::from_bytes(endpoint.method.trim().to_uppercase().as_bytes()).is_err() {
        problems.push(format!("{}: invalid method {:?}", ctx, endpoint.method));
    }
    for code in &endpoint.expected_status {
        if !(100..=599).contains(code) {
            problems.push(format!("{}: status code {} out of range", ctx, code));
        }
    }
    if let Some(secs) = endpoint.timeout_secs {
        if !(1..=MAX_TIMEOUT_SECS).contains(&secs) {
            problems.push(format!(
                "{}: timeout must be between 1 and {} seconds",
                ctx, MAX_TIMEOUT_SECS
            ));
        }
    }
    if endpoint.retries.is_some_and(|r| r > MAX_RETRIES) {
        problems.push(format!("{}: retries must not exceed {}", ctx, MAX_RETRIES));
    }
    if let Some(days) = endpoint.cert_warn_days {
        if !(0..=MAX_CERT_WARN_DAYS).contains(&days) {
            problems.push(format!(
                "{}: cert_warn_days must be between 0 and {}",
                ctx, MAX_CERT_WARN_DAYS
            ));
        }
    }

    // Dry-run resolution: random and time values don't matter here, missing
    // environment values and malformed URLs do.
    let mut resolver = ParamResolver::new(env, Utc::now());
    match resolver.resolve(&endpoint.url) {
        Ok(resolved) => match Url::parse(&resolved) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() => {}
            Ok(url) => problems.push(format!("{}: unsupported URL {:?}", ctx, url.as_str())),
            Err(e) => problems.push(format!("{}: invalid URL after expansion: {}", ctx, e)),
        },
        Err(e) => problems.push(format!("{}: {}", ctx, e)),
    }
    for (name, value) in &endpoint.headers {
        if let Err(e) = resolver.resolve(value) {
            problems.push(format!("{}: header {}: {}", ctx, name, e));
        }
    }
    if let Some(ref body) = endpoint.body {
        if let Err(e) = resolver.resolve(body) {
            problems.push(format!("{}: body: {}", ctx, e));
        }
    }
    warnings.extend(resolver.warnings().iter().map(|w| format!("{}: {}", ctx, w)));
}
