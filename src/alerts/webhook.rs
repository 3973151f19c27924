//! Generic webhook channel
//!
//! Payload construction, highest precedence first:
//!
//! 1. `custom_payload`: base data merged with declared `fields`, optionally
//!    rendered through its own template and projected to `include`
//! 2. `template`: a raw template rendered with the base data
//! 3. `format`: a chat platform preset (slack, discord, teams, mattermost)
//! 4. the default `{"title", "message", "timestamp", "service"}` object
//!
//! Templates are Handlebars. Go-style references (`{{.Title}}`) are accepted
//! and rewritten to plain paths when the channel is built. When a template
//! produces JSON, interpolated values are JSON-escaped so a title with quotes
//! or a multi-line message still yields a valid document.

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{SecondsFormat, Utc};
use handlebars::{Context, Handlebars, Helper, HelperDef, HelperResult, Output, RenderContext};
use regex::{Captures, Regex};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use super::channels::{AlertChannel, ChannelError};
use crate::config::Config;
use crate::logging::ellipse;
use crate::params::ParamResolver;
use crate::security::{mask_credential, mask_header_value, EnvLookup, SharedEnv};

/// Value of the `service` field in every payload.
pub const SERVICE_NAME: &str = "ponghub";

const CUSTOM_TEMPLATE: &str = "custom";
const RAW_TEMPLATE: &str = "raw";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresetFormat {
    Slack,
    Discord,
    Teams,
    Mattermost,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WebhookAuth {
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
    #[serde(alias = "api_key")]
    ApiKey {
        token: String,
        /// Defaults to `X-API-Key`.
        #[serde(default)]
        header: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomPayloadConfig {
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    /// Extra static fields merged into the template data.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Also expose the title under this name.
    #[serde(default)]
    pub title_field: Option<String>,
    #[serde(default)]
    pub message_field: Option<String>,
    #[serde(default = "default_true")]
    pub include_title: bool,
    #[serde(default = "default_true")]
    pub include_message: bool,
    /// Top-level keys kept in a JSON document; empty keeps everything.
    #[serde(default)]
    pub include: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for CustomPayloadConfig {
    fn default() -> Self {
        Self {
            template: None,
            content_type: None,
            fields: BTreeMap::new(),
            title_field: None,
            message_field: None,
            include_title: true,
            include_message: true,
            include: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Falls back to the `WEBHOOK_URL` environment value.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub auth: Option<WebhookAuth>,
    #[serde(default)]
    pub format: Option<PresetFormat>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub custom_payload: Option<CustomPayloadConfig>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub skip_tls_verify: bool,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            method: None,
            headers: BTreeMap::new(),
            auth: None,
            format: None,
            template: None,
            content_type: None,
            custom_payload: None,
            timeout_secs: default_timeout_secs(),
            retries: 0,
            retry_delay_ms: default_retry_delay_ms(),
            skip_tls_verify: false,
        }
    }

    /// Check the URL, method and templates without building a client.
    pub fn validate(&self, env: &dyn EnvLookup) -> Result<(), ChannelError> {
        if !(1..=3_600).contains(&self.timeout_secs) {
            return Err(ChannelError::Config(
                "webhook timeout_secs must be between 1 and 3600".to_string(),
            ));
        }
        if self.retries > 100 || self.retry_delay_ms > 600_000 {
            return Err(ChannelError::Config(
                "webhook retries must not exceed 100 and retry_delay_ms 600000".to_string(),
            ));
        }
        self.target_url(env)?;
        self.method()?;
        PayloadBuilder::compile(self).map(|_| ())
    }

    fn target_url(&self, env: &dyn EnvLookup) -> Result<String, ChannelError> {
        let url = self
            .url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .or_else(|| env.get("WEBHOOK_URL").filter(|u| !u.trim().is_empty()))
            .ok_or_else(|| ChannelError::Config("webhook URL not configured".to_string()))?;
        let mut resolver = ParamResolver::new(env, Utc::now());
        let url = resolver
            .resolve(&url)
            .map_err(|e| ChannelError::Config(format!("webhook URL: {}", e)))?;
        url::Url::parse(&url)
            .map_err(|e| ChannelError::Config(format!("invalid webhook URL: {}", e)))?;
        Ok(url)
    }

    fn method(&self) -> Result<Method, ChannelError> {
        let method = self.method.as_deref().unwrap_or("POST").trim().to_uppercase();
        Method::from_bytes(method.as_bytes())
            .map_err(|_| ChannelError::Config(format!("invalid webhook method {:?}", method)))
    }

    /// Content type configured through a `Content-Type` header, if any.
    fn header_content_type(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.as_str())
    }
}

/// Error returned when every attempt failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("webhook failed after {attempts} attempt(s): {message}")]
pub struct WebhookError {
    /// Last HTTP status, `None` for transport failures.
    pub status: Option<u16>,
    /// Last response body, verbatim.
    pub body: String,
    pub retryable: bool,
    pub message: String,
    pub attempts: u32,
}

/// Serialized payload plus its content type.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadDocument {
    Json(Value),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPayload {
    pub document: PayloadDocument,
    pub content_type: String,
}

impl RenderedPayload {
    fn json(value: Value, content_type: Option<&str>) -> Self {
        Self {
            document: PayloadDocument::Json(value),
            content_type: content_type.unwrap_or("application/json").to_string(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ChannelError> {
        match self.document {
            PayloadDocument::Json(ref value) => {
                serde_json::to_vec(value).map_err(|e| ChannelError::Payload(e.to_string()))
            }
            PayloadDocument::Text(ref text) => Ok(text.clone().into_bytes()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct DefaultPayload<'a> {
    title: &'a str,
    message: &'a str,
    timestamp: &'a str,
    service: &'a str,
}

#[derive(Debug, Serialize)]
struct SlackPayload<'a> {
    text: String,
    attachments: Vec<SlackAttachment<'a>>,
}

#[derive(Debug, Serialize)]
struct SlackAttachment<'a> {
    color: &'a str,
    text: &'a str,
    timestamp: i64,
    fields: Vec<SlackField<'a>>,
}

#[derive(Debug, Serialize)]
struct SlackField<'a> {
    title: &'a str,
    value: &'a str,
    short: bool,
}

#[derive(Debug, Serialize)]
struct DiscordPayload<'a> {
    embeds: Vec<DiscordEmbed<'a>>,
}

#[derive(Debug, Serialize)]
struct DiscordEmbed<'a> {
    title: &'a str,
    description: &'a str,
    color: u32,
    timestamp: &'a str,
    fields: Vec<DiscordField<'a>>,
}

#[derive(Debug, Serialize)]
struct DiscordField<'a> {
    name: &'a str,
    value: &'a str,
    inline: bool,
}

#[derive(Debug, Serialize)]
struct TeamsPayload<'a> {
    #[serde(rename = "@type")]
    kind: &'a str,
    #[serde(rename = "@context")]
    context: &'a str,
    #[serde(rename = "themeColor")]
    theme_color: &'a str,
    summary: &'a str,
    sections: Vec<TeamsSection<'a>>,
}

#[derive(Debug, Serialize)]
struct TeamsSection<'a> {
    #[serde(rename = "activityTitle")]
    activity_title: &'a str,
    #[serde(rename = "activityText")]
    activity_text: &'a str,
    facts: Vec<TeamsFact<'a>>,
}

#[derive(Debug, Serialize)]
struct TeamsFact<'a> {
    name: &'a str,
    value: &'a str,
}

#[derive(Debug, Serialize)]
struct MattermostPayload {
    text: String,
}

/// Fields available to every payload strategy.
struct AlertData<'a> {
    title: &'a str,
    message: &'a str,
    timestamp: String,
    unix: i64,
}

impl AlertData<'_> {
    fn template_data(&self) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("title".into(), json!(self.title));
        data.insert("message".into(), json!(self.message));
        data.insert("Title".into(), json!(self.title));
        data.insert("Message".into(), json!(self.message));
        data.insert("timestamp".into(), json!(self.timestamp));
        data.insert("service".into(), json!(SERVICE_NAME));
        data
    }
}

/// Payload strategy, chosen once from the config.
#[derive(Debug, Clone)]
enum PayloadStrategy {
    Custom {
        has_template: bool,
        fields: BTreeMap<String, String>,
        title_field: Option<String>,
        message_field: Option<String>,
        include: Vec<String>,
        content_type: Option<String>,
    },
    RawTemplate {
        content_type: Option<String>,
    },
    Preset(PresetFormat),
    Default,
}

/// Builds payloads for one webhook config. Templates are compiled once.
pub struct PayloadBuilder {
    strategy: PayloadStrategy,
    registry: Handlebars<'static>,
}

impl PayloadBuilder {
    pub fn compile(config: &WebhookConfig) -> Result<Self, ChannelError> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(false);
        registry.register_helper("jsonEscape", Box::new(JsonEscapeHelper));

        let configured_type = config
            .content_type
            .as_deref()
            .or_else(|| config.header_content_type());

        let (strategy, template, content_type) = if let Some(ref custom) = config.custom_payload {
            let content_type = custom.content_type.clone().or(configured_type.map(str::to_string));
            let strategy = PayloadStrategy::Custom {
                has_template: custom.template.is_some(),
                fields: custom.fields.clone(),
                title_field: custom.title_field.clone().filter(|_| custom.include_title),
                message_field: custom.message_field.clone().filter(|_| custom.include_message),
                include: custom.include.clone(),
                content_type: content_type.clone(),
            };
            (strategy, custom.template.as_deref().map(|t| (CUSTOM_TEMPLATE, t)), content_type)
        } else if let Some(ref template) = config.template {
            let content_type = configured_type.map(str::to_string);
            (
                PayloadStrategy::RawTemplate {
                    content_type: content_type.clone(),
                },
                Some((RAW_TEMPLATE, template.as_str())),
                content_type,
            )
        } else if let Some(format) = config.format {
            (PayloadStrategy::Preset(format), None, None)
        } else {
            (PayloadStrategy::Default, None, None)
        };

        if let Some((name, source)) = template {
            let produces_json = content_type
                .as_deref()
                .map(|ct| ct.to_ascii_lowercase().contains("json"))
                .unwrap_or(false)
                || matches!(source.trim_start().chars().next(), Some('{') | Some('['));
            if produces_json {
                registry.register_escape_fn(json_escape);
            } else {
                registry.register_escape_fn(handlebars::no_escape);
            }
            registry
                .register_template_string(name, translate_go_template(source))
                .map_err(|e| ChannelError::Config(format!("invalid webhook template: {}", e)))?;
        }

        Ok(Self { strategy, registry })
    }

    /// Build the payload for one alert.
    pub fn build(&self, title: &str, message: &str) -> Result<RenderedPayload, ChannelError> {
        let now = Utc::now();
        let data = AlertData {
            title,
            message,
            timestamp: now.to_rfc3339_opts(SecondsFormat::Secs, true),
            unix: now.timestamp(),
        };

        match self.strategy {
            PayloadStrategy::Custom {
                has_template,
                ref fields,
                ref title_field,
                ref message_field,
                ref include,
                ref content_type,
            } => {
                let mut merged = data.template_data();
                for (key, value) in fields {
                    merged.insert(key.clone(), json!(value));
                }
                if let Some(field) = title_field {
                    merged.insert(field.clone(), json!(title));
                }
                if let Some(field) = message_field {
                    merged.insert(field.clone(), json!(message));
                }

                let payload = if has_template {
                    self.render(CUSTOM_TEMPLATE, &Value::Object(merged), content_type.as_deref())?
                } else {
                    RenderedPayload::json(Value::Object(merged), content_type.as_deref())
                };
                Ok(project(payload, include))
            }
            PayloadStrategy::RawTemplate { ref content_type } => self.render(
                RAW_TEMPLATE,
                &Value::Object(data.template_data()),
                content_type.as_deref(),
            ),
            PayloadStrategy::Preset(format) => {
                let value = preset_payload(format, &data)?;
                Ok(RenderedPayload::json(value, None))
            }
            PayloadStrategy::Default => {
                let value = serde_json::to_value(DefaultPayload {
                    title,
                    message,
                    timestamp: &data.timestamp,
                    service: SERVICE_NAME,
                })
                .map_err(|e| ChannelError::Payload(e.to_string()))?;
                Ok(RenderedPayload::json(value, None))
            }
        }
    }

    fn render(
        &self,
        name: &str,
        data: &Value,
        content_type: Option<&str>,
    ) -> Result<RenderedPayload, ChannelError> {
        let rendered = self
            .registry
            .render(name, data)
            .map_err(|e| ChannelError::Payload(format!("template render failed: {}", e)))?;

        match serde_json::from_str::<Value>(&rendered) {
            Ok(value) => Ok(RenderedPayload::json(value, content_type)),
            Err(_) => Ok(RenderedPayload {
                document: PayloadDocument::Text(rendered),
                content_type: content_type.unwrap_or("text/plain").to_string(),
            }),
        }
    }
}

/// Keep only the declared top-level keys of a JSON object.
fn project(payload: RenderedPayload, include: &[String]) -> RenderedPayload {
    if include.is_empty() {
        return payload;
    }
    match payload.document {
        PayloadDocument::Json(Value::Object(map)) => RenderedPayload {
            document: PayloadDocument::Json(Value::Object(
                map.into_iter().filter(|(key, _)| include.contains(key)).collect(),
            )),
            content_type: payload.content_type,
        },
        document => RenderedPayload {
            document,
            content_type: payload.content_type,
        },
    }
}

fn preset_payload(format: PresetFormat, data: &AlertData<'_>) -> Result<Value, ChannelError> {
    let value = match format {
        PresetFormat::Slack => serde_json::to_value(SlackPayload {
            text: format!("*{}*", data.title),
            attachments: vec![SlackAttachment {
                color: "danger",
                text: data.message,
                timestamp: data.unix,
                fields: vec![SlackField {
                    title: "Service",
                    value: SERVICE_NAME,
                    short: true,
                }],
            }],
        }),
        PresetFormat::Discord => serde_json::to_value(DiscordPayload {
            embeds: vec![DiscordEmbed {
                title: data.title,
                description: data.message,
                color: 0xFF0000,
                timestamp: &data.timestamp,
                fields: vec![DiscordField {
                    name: "Service",
                    value: SERVICE_NAME,
                    inline: true,
                }],
            }],
        }),
        PresetFormat::Teams => serde_json::to_value(TeamsPayload {
            kind: "MessageCard",
            context: "http://schema.org/extensions",
            theme_color: "FF0000",
            summary: data.title,
            sections: vec![TeamsSection {
                activity_title: data.title,
                activity_text: data.message,
                facts: vec![
                    TeamsFact {
                        name: "Service",
                        value: SERVICE_NAME,
                    },
                    TeamsFact {
                        name: "Timestamp",
                        value: &data.timestamp,
                    },
                ],
            }],
        }),
        PresetFormat::Mattermost => serde_json::to_value(MattermostPayload {
            text: format!(
                "## {}\n\n{}\n\n**Service:** {}\n**Time:** {}",
                data.title, data.message, SERVICE_NAME, data.timestamp
            ),
        }),
    };
    value.map_err(|e| ChannelError::Payload(e.to_string()))
}

/// Escape a string for use inside a JSON string literal.
fn json_escape(s: &str) -> String {
    let quoted = serde_json::to_string(s).unwrap_or_default();
    quoted
        .strip_prefix('"')
        .and_then(|q| q.strip_suffix('"'))
        .unwrap_or_default()
        .to_string()
}

/// `{{jsonEscape value}}`
struct JsonEscapeHelper;

impl HelperDef for JsonEscapeHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _r: &'reg Handlebars<'reg>,
        _ctx: &'rc Context,
        _rc: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let text = match h.param(0).map(|p| p.value()) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        out.write(&json_escape(&text))?;
        Ok(())
    }
}

fn mustache_regex() -> &'static Regex {
    static MUSTACHE: OnceLock<Regex> = OnceLock::new();
    MUSTACHE.get_or_init(|| Regex::new(r"\{\{(.*?)\}\}").expect("mustache pattern is valid"))
}

fn go_field_regex() -> &'static Regex {
    static FIELD: OnceLock<Regex> = OnceLock::new();
    FIELD.get_or_init(|| {
        Regex::new(r"(^|[\s({])\.([A-Za-z_][A-Za-z0-9_]*)").expect("field pattern is valid")
    })
}

/// Rewrite Go template field references (`{{.Title}}`, `{{jsonEscape .Message}}`)
/// into Handlebars paths. Plain Handlebars input passes through unchanged.
pub fn translate_go_template(template: &str) -> String {
    mustache_regex()
        .replace_all(template, |caps: &Captures<'_>| {
            let inner = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            format!("{{{{{}}}}}", go_field_regex().replace_all(inner, "${1}${2}"))
        })
        .into_owned()
}

/// Webhook notification channel.
pub struct WebhookChannel {
    name: String,
    url: String,
    method: Method,
    headers: BTreeMap<String, String>,
    auth: Option<WebhookAuth>,
    retries: u32,
    retry_delay: Duration,
    payload: PayloadBuilder,
    client: reqwest::Client,
    env: SharedEnv,
}

impl WebhookChannel {
    pub fn new(config: &WebhookConfig, env: SharedEnv) -> Result<Self, ChannelError> {
        let url = config.target_url(env.as_ref())?;
        let method = config.method()?;
        let payload = PayloadBuilder::compile(config)?;
        let client = reqwest::Client::builder()
            .user_agent(Config::user_agent())
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .danger_accept_invalid_certs(config.skip_tls_verify)
            .build()
            .map_err(|e| ChannelError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            name: "webhook".to_string(),
            url,
            method,
            headers: config.headers.clone(),
            auth: config.auth.clone(),
            retries: config.retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            payload,
            client,
            env,
        })
    }

    /// Payload this channel would send for the given alert.
    pub fn build_payload(&self, title: &str, message: &str) -> Result<RenderedPayload, ChannelError> {
        self.payload.build(title, message)
    }

    /// Content type first, then configured headers, then authentication.
    fn request_headers(&self, content_type: &str) -> Result<HeaderMap, ChannelError> {
        let mut resolver = ParamResolver::new(self.env.as_ref(), Utc::now());
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, header_value(content_type)?);

        for (name, value) in &self.headers {
            let value = resolver
                .resolve(value)
                .map_err(|e| ChannelError::Config(format!("header {}: {}", name, e)))?;
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ChannelError::Config(format!("header {}: {}", name, e)))?;
            debug!("Alerts: webhook header {}: {}", name, mask_header_value(name, &value));
            headers.insert(header_name, header_value(&value)?);
        }

        let mut secret = |raw: &str| {
            resolver
                .resolve(raw)
                .map_err(|e| ChannelError::Config(format!("webhook auth: {}", e)))
        };
        match self.auth {
            Some(WebhookAuth::Bearer { ref token }) => {
                let token = secret(token)?;
                debug!("Alerts: webhook bearer token {}", mask_credential(&token));
                headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", token))?);
            }
            Some(WebhookAuth::Basic {
                ref username,
                ref password,
            }) => {
                let username = secret(username)?;
                let password = secret(password)?;
                let credentials = format!("{}:{}", username, password);
                let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
                headers.insert(AUTHORIZATION, header_value(&format!("Basic {}", encoded))?);
            }
            Some(WebhookAuth::ApiKey {
                ref token,
                ref header,
            }) => {
                let name = header.as_deref().unwrap_or("X-API-Key");
                let header_name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| ChannelError::Config(format!("api key header {}: {}", name, e)))?;
                headers.insert(header_name, header_value(&secret(token)?)?);
            }
            None => {}
        }
        Ok(headers)
    }
}

fn header_value(value: &str) -> Result<HeaderValue, ChannelError> {
    HeaderValue::from_str(value).map_err(|e| ChannelError::Config(format!("invalid header value: {}", e)))
}

fn is_retryable_status(status: u16) -> bool {
    status >= 500 || status == 408 || status == 429
}

#[async_trait]
impl AlertChannel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, title: &str, message: &str) -> Result<(), ChannelError> {
        let payload = self.payload.build(title, message)?;
        let body = payload.to_bytes()?;
        let headers = self.request_headers(&payload.content_type)?;

        let mut last_error = WebhookError {
            status: None,
            body: String::new(),
            retryable: false,
            message: "no attempt made".to_string(),
            attempts: 0,
        };

        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }
            last_error.attempts = attempt + 1;

            let result = self
                .client
                .request(self.method.clone(), &self.url)
                .headers(headers.clone())
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    debug!(
                        "Alerts: webhook delivered ({} {}, attempt {})",
                        resp.status().as_u16(),
                        self.method,
                        attempt + 1
                    );
                    return Ok(());
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let body = resp.text().await.unwrap_or_default();
                    warn!(
                        "Alerts: webhook returned {} (attempt {}/{}): {}",
                        status,
                        attempt + 1,
                        self.retries + 1,
                        ellipse(&body, 200)
                    );
                    last_error.status = Some(status);
                    last_error.message = format!("HTTP {}", status);
                    last_error.body = body;
                    last_error.retryable = is_retryable_status(status);
                }
                Err(e) => {
                    warn!(
                        "Alerts: webhook request failed (attempt {}/{}): {}",
                        attempt + 1,
                        self.retries + 1,
                        e
                    );
                    last_error.status = None;
                    last_error.body = String::new();
                    last_error.message = e.to_string();
                    last_error.retryable = true;
                }
            }
        }

        Err(ChannelError::Webhook(last_error))
    }
}
