//! Secret and environment access
//!
//! Secrets (webhook tokens, basic-auth passwords) never live in the config
//! file in clear when a deployment doesn't want them to: they are pulled from
//! the process environment through [`EnvLookup`] at the moment they are needed.
//! All secret values are masked before they reach a log line.

use std::collections::HashMap;
use std::sync::Arc;

/// Source of environment values.
///
/// The engine never calls `std::env::var` directly so tests (and embedders)
/// can hand it a fixed map instead of the process environment.
pub trait EnvLookup: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
}

/// Reads from the real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvLookup for ProcessEnv {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Fixed set of values, used by tests and by callers that pre-load secrets.
#[derive(Debug, Clone, Default)]
pub struct StaticEnv {
    values: HashMap<String, String>,
}

impl StaticEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

impl EnvLookup for StaticEnv {
    fn get(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

impl<T: EnvLookup + ?Sized> EnvLookup for Arc<T> {
    fn get(&self, name: &str) -> Option<String> {
        (**self).get(name)
    }
}

/// Shared handle used across the engine and channels.
pub type SharedEnv = Arc<dyn EnvLookup>;

/// Handle to the real process environment.
pub fn process_env() -> SharedEnv {
    Arc::new(ProcessEnv)
}

/// Mask a credential for logging (shows only first/last few characters)
pub fn mask_credential(credential: &str) -> String {
    let chars: Vec<char> = credential.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

/// Mask the value of a header when its name suggests it carries a secret.
pub fn mask_header_value(name: &str, value: &str) -> String {
    let lower = name.to_ascii_lowercase();
    let sensitive = lower == "authorization"
        || lower.contains("token")
        || lower.contains("api-key")
        || lower.contains("apikey")
        || lower.contains("secret");
    if sensitive {
        mask_credential(value)
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_credential() {
        assert_eq!(mask_credential("short"), "****");
        assert_eq!(mask_credential("verylongtoken12345"), "very...2345");
    }

    #[test]
    fn test_mask_credential_multibyte() {
        assert_eq!(mask_credential("ключ-секрет-длинный"), "ключ...нный");
    }

    #[test]
    fn test_mask_header_value() {
        assert_eq!(mask_header_value("Authorization", "Bearer abcdefghijkl"), "Bear...ijkl");
        assert_eq!(mask_header_value("X-API-Key", "abc"), "****");
        assert_eq!(mask_header_value("Accept", "application/json"), "application/json");
    }

    #[test]
    fn test_static_env() {
        let env = StaticEnv::new().with("TOKEN", "t1");
        assert_eq!(env.get("TOKEN").as_deref(), Some("t1"));
        assert_eq!(env.get("MISSING"), None);

        let shared: SharedEnv = Arc::new(env);
        assert_eq!(shared.get("TOKEN").as_deref(), Some("t1"));
    }
}
