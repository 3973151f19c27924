//! Structured logging module using tracing
//!
//! Console output goes to stderr so report output on stdout stays clean;
//! an optional log file receives the same events without ANSI colors.

use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Shorten `s` to at most `max_len` chars for log lines and reports,
/// keeping its head and tail around a `...` marker.
pub fn ellipse(s: &str, max_len: usize) -> String {
    const MARKER: &str = "...";
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= max_len {
        return s.to_string();
    }
    if max_len <= MARKER.len() {
        return chars.iter().take(max_len).collect();
    }
    let budget = max_len - MARKER.len();
    let head: String = chars.iter().take(budget / 2).collect();
    let tail: String = chars[chars.len() - (budget - budget / 2)..].iter().collect();
    format!("{}{}{}", head, MARKER, tail)
}

/// Map `-v` count to a tracing filter level.
pub fn filter_level(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

/// Initialize tracing with console and optional file output
///
/// Verbosity always comes from the command line; `RUST_LOG` is ignored.
/// Calling this twice is harmless (the second call is a no-op).
pub fn init_tracing(verbosity: u8, log_file_path: Option<PathBuf>) {
    let filter = EnvFilter::new(filter_level(verbosity));

    let registry = tracing_subscriber::registry().with(filter);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let file = log_file_path.and_then(|log_path| {
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .ok()
    });

    let result = if let Some(file) = file {
        let file_layer = fmt::layer()
            .with_writer(file)
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_ansi(false); // No ANSI in files

        registry.with(console_layer).with(file_layer).try_init()
    } else {
        registry.with(console_layer).try_init()
    };

    if let Err(e) = result {
        eprintln!("tracing already initialized: {}", e);
    }
}
