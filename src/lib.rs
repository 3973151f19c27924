//! PongHub Library
//!
//! Zero-intrusion availability monitoring for HTTP(S) services.
//!
//! ## Architecture
//!
//! The codebase is organized into modules:
//! - `config`: Configuration loading, defaults cascade and validation
//! - `params`: `{{...}}` placeholder resolution (env vars, dates, random values)
//! - `monitors`: Probe execution with retry/backoff, response validation, status tracking
//! - `metrics`: Rolling check history and uptime/latency summaries
//! - `alerts`: Alert events, notification rules, dispatcher, webhook and CI channels
//! - `state`: Per-endpoint state arena and report snapshots
//! - `scheduler`: Check cycle engine and watch mode
//! - `security`: Environment access and credential masking
//! - `logging`: Structured logging with tracing
//!
//! ## Main Entry Points
//!
//! - [`scheduler::Engine::run_cycle`]: probe every endpoint once
//! - [`scheduler::Engine::run_forever`]: repeat cycles until cancelled

pub mod alerts;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod monitors;
pub mod params;
pub mod scheduler;
pub mod security;
pub mod state;

pub use logging::init_tracing;
