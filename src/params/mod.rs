//! Dynamic parameter expansion
//!
//! Endpoint URLs, headers and bodies (and webhook secrets) may contain
//! `{{ ... }}` placeholders that are expanded at check time:
//!
//! - `{{uuid}}` random v4 UUID
//! - `{{rand_int}}`, `{{rand_int(10, 99)}}` random integer
//! - `{{rand_str}}`, `{{rand_str(8)}}` random alphanumeric string
//! - `{{env(NAME)}}`, `{{env(NAME, fallback)}}` environment value
//! - `{{timestamp}}`, `{{timestamp_ms}}`, `{{now}}`, `{{date}}`
//! - `{{%Y-%m-%d %H:%M}}` any strftime pattern
//!
//! One [`ParamResolver`] is created per check. It reads the clock once and
//! caches every environment value it looks up, so the URL, headers and body
//! of a single check agree on `env` and time values while each random
//! placeholder still draws independently.

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, SecondsFormat, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use thiserror::Error;
use tracing::warn;

use crate::security::EnvLookup;

const DEFAULT_RAND_STR_LEN: usize = 16;
const MAX_RAND_STR_LEN: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("unresolved placeholder: environment variable {name} is not set")]
    UnresolvedPlaceholder { name: String },

    #[error("invalid placeholder {placeholder}: {reason}")]
    InvalidArguments { placeholder: String, reason: String },
}

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").expect("placeholder pattern is valid")
    })
}

fn call_regex() -> &'static Regex {
    static CALL: OnceLock<Regex> = OnceLock::new();
    CALL.get_or_init(|| {
        Regex::new(r"^([a-z_]+)\s*\((.*)\)$").expect("call pattern is valid")
    })
}

/// Per-check placeholder resolver.
pub struct ParamResolver<'a> {
    env: &'a dyn EnvLookup,
    now: DateTime<Utc>,
    env_cache: HashMap<String, Option<String>>,
    warnings: Vec<String>,
}

impl<'a> ParamResolver<'a> {
    pub fn new(env: &'a dyn EnvLookup, now: DateTime<Utc>) -> Self {
        Self {
            env,
            now,
            env_cache: HashMap::new(),
            warnings: Vec::new(),
        }
    }

    /// Clock reading shared by every placeholder of this check.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Non-fatal problems seen so far (unknown placeholder syntax).
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Expand every placeholder in `template`.
    ///
    /// Unknown placeholders are kept verbatim and recorded as warnings.
    pub fn resolve(&mut self, template: &str) -> Result<String, ResolveError> {
        if !template.contains("{{") {
            return Ok(template.to_string());
        }

        let mut out = String::with_capacity(template.len());
        let mut last = 0;
        for caps in placeholder_regex().captures_iter(template) {
            let Some(whole) = caps.get(0) else { continue };
            let expr = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            out.push_str(&template[last..whole.start()]);
            match self.expand(expr)? {
                Some(value) => out.push_str(&value),
                None => {
                    let message = format!("unknown placeholder {} left as-is", whole.as_str());
                    warn!("Params: {}", message);
                    self.warnings.push(message);
                    out.push_str(whole.as_str());
                }
            }
            last = whole.end();
        }
        out.push_str(&template[last..]);
        Ok(out)
    }

    /// Resolve an optional template, passing `None` through.
    pub fn resolve_opt(&mut self, template: Option<&str>) -> Result<Option<String>, ResolveError> {
        template.map(|t| self.resolve(t)).transpose()
    }

    /// Returns `Ok(None)` for syntax this resolver doesn't know.
    fn expand(&mut self, expr: &str) -> Result<Option<String>, ResolveError> {
        if expr.starts_with('%') {
            return Ok(self.format_time(expr));
        }

        match expr {
            "uuid" => return Ok(Some(uuid::Uuid::new_v4().to_string())),
            "rand_int" => {
                let n: i32 = rand::thread_rng().gen_range(0..=i32::MAX);
                return Ok(Some(n.to_string()));
            }
            "rand_str" => return Ok(Some(random_string(DEFAULT_RAND_STR_LEN))),
            "timestamp" => return Ok(Some(self.now.timestamp().to_string())),
            "timestamp_ms" => return Ok(Some(self.now.timestamp_millis().to_string())),
            "now" => return Ok(Some(self.now.to_rfc3339_opts(SecondsFormat::Secs, true))),
            "date" => return Ok(Some(self.now.format("%Y-%m-%d").to_string())),
            _ => {}
        }

        let Some(caps) = call_regex().captures(expr) else {
            return Ok(None);
        };
        let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let args: Vec<&str> = caps
            .get(2)
            .map(|m| m.as_str())
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .collect();

        match name {
            "env" => self.expand_env(expr, &args).map(Some),
            "rand_int" => expand_rand_int(expr, &args).map(Some),
            "rand_str" => expand_rand_str(expr, &args).map(Some),
            _ => Ok(None),
        }
    }

    fn expand_env(&mut self, expr: &str, args: &[&str]) -> Result<String, ResolveError> {
        let (name, fallback) = match args {
            [name] if !name.is_empty() => (*name, None),
            [name, fallback] if !name.is_empty() => (*name, Some(*fallback)),
            _ => {
                return Err(ResolveError::InvalidArguments {
                    placeholder: expr.to_string(),
                    reason: "expected env(NAME) or env(NAME, default)".to_string(),
                })
            }
        };

        let env = self.env;
        let value = self
            .env_cache
            .entry(name.to_string())
            .or_insert_with(|| env.get(name))
            .clone();

        match (value, fallback) {
            (Some(v), _) => Ok(v),
            (None, Some(fallback)) => Ok(fallback.to_string()),
            (None, None) => Err(ResolveError::UnresolvedPlaceholder {
                name: name.to_string(),
            }),
        }
    }

    fn format_time(&self, pattern: &str) -> Option<String> {
        let items: Vec<Item<'_>> = StrftimeItems::new(pattern).collect();
        if items.iter().any(|item| matches!(item, Item::Error)) {
            return None;
        }
        Some(self.now.format_with_items(items.into_iter()).to_string())
    }
}

fn expand_rand_int(expr: &str, args: &[&str]) -> Result<String, ResolveError> {
    let invalid = |reason: &str| ResolveError::InvalidArguments {
        placeholder: expr.to_string(),
        reason: reason.to_string(),
    };
    let [min, max] = args else {
        return Err(invalid("expected rand_int(min, max)"));
    };
    let min: i64 = min.parse().map_err(|_| invalid("min is not an integer"))?;
    let max: i64 = max.parse().map_err(|_| invalid("max is not an integer"))?;
    if min > max {
        return Err(invalid("min is greater than max"));
    }
    Ok(rand::thread_rng().gen_range(min..=max).to_string())
}

fn expand_rand_str(expr: &str, args: &[&str]) -> Result<String, ResolveError> {
    let invalid = |reason: &str| ResolveError::InvalidArguments {
        placeholder: expr.to_string(),
        reason: reason.to_string(),
    };
    let [len] = args else {
        return Err(invalid("expected rand_str(length)"));
    };
    let len: usize = len.parse().map_err(|_| invalid("length is not a number"))?;
    if len == 0 || len > MAX_RAND_STR_LEN {
        return Err(invalid("length out of range"));
    }
    Ok(random_string(len))
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
