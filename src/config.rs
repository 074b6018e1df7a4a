//! Declarative fixtures and engine settings.
//!
//! Scopes and their interceptors can be declared in YAML and installed into
//! a [`Registry`] in one call.

use crate::header::HeaderSet;
use crate::interceptor::{Reply, ReplyBody};
use crate::matcher::{BodyMatcher, HeaderMatcher, PathMatcher, QueryMatcher};
use crate::registry::Registry;
use crate::request::Origin;
use crate::response::ReplyDate;
use crate::scope::Scope;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Fixture file: engine settings plus declared scopes.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct FixtureConfig {
    /// Scope declarations, installed in order
    #[serde(default)]
    pub scopes: Vec<ScopeFixture>,

    /// Engine settings
    #[serde(default)]
    pub settings: EngineSettings,
}

impl FixtureConfig {
    /// Load fixtures from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate fixtures from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the fixtures.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (i, scope) in self.scopes.iter().enumerate() {
            scope
                .validate()
                .map_err(|e| anyhow::anyhow!("Scope {} ({}): {}", i, scope.origin, e))?;
        }
        for origin in &self.settings.allowed_origins {
            Origin::parse(origin)?;
        }
        Ok(())
    }

    /// Number of declared interceptors across all scopes.
    pub fn interceptor_count(&self) -> usize {
        self.scopes.iter().map(|s| s.interceptors.len()).sum()
    }

    /// Apply the settings and register every scope with `registry`.
    pub fn install(&self, registry: &Registry) -> anyhow::Result<Vec<Scope>> {
        registry.set_settings(self.settings.clone());
        self.scopes.iter().map(|s| s.install(registry)).collect()
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    /// Log every served request
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log unmatched requests
    #[serde(default = "default_true")]
    pub log_unmatched: bool,

    /// Pass every unmatched request through to the network
    #[serde(default)]
    pub allow_unmatched: bool,

    /// Origins whose unmatched requests pass through
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            log_matches: true,
            log_unmatched: true,
            allow_unmatched: false,
            allowed_origins: Vec::new(),
        }
    }
}

impl EngineSettings {
    /// Whether an unmatched request to `origin` may reach the network.
    pub fn allows_passthrough(&self, origin: &Origin) -> bool {
        self.allow_unmatched
            || self
                .allowed_origins
                .iter()
                .filter_map(|o| Origin::parse(o).ok())
                .any(|o| &o == origin)
    }
}

fn default_true() -> bool {
    true
}

/// One declared scope.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScopeFixture {
    /// Scheme, host and optional port
    pub origin: String,

    /// Headers added to every reply
    #[serde(default)]
    pub default_headers: HeaderSet,

    /// Set Content-Length on every reply
    #[serde(default)]
    pub reply_content_length: bool,

    /// `live` or an RFC 3339 timestamp
    #[serde(default)]
    pub reply_date: Option<String>,

    /// Interceptors, in match priority order
    #[serde(default)]
    pub interceptors: Vec<InterceptorFixture>,
}

impl ScopeFixture {
    pub fn validate(&self) -> anyhow::Result<()> {
        Origin::parse(&self.origin)?;
        self.reply_date()?;
        for (i, interceptor) in self.interceptors.iter().enumerate() {
            interceptor
                .validate()
                .map_err(|e| anyhow::anyhow!("Interceptor {}: {}", i, e))?;
        }
        Ok(())
    }

    fn reply_date(&self) -> anyhow::Result<ReplyDate> {
        Ok(match self.reply_date.as_deref() {
            None => ReplyDate::Off,
            Some("live") => ReplyDate::Live,
            Some(ts) => ReplyDate::Fixed(
                chrono::DateTime::parse_from_rfc3339(ts)
                    .map_err(|e| anyhow::anyhow!("Invalid reply_date `{}`: {}", ts, e))?
                    .with_timezone(&chrono::Utc),
            ),
        })
    }

    fn install(&self, registry: &Registry) -> anyhow::Result<Scope> {
        let scope = registry.scope(&self.origin)?;
        scope.default_reply_headers(self.default_headers.clone());
        if self.reply_content_length {
            scope.reply_content_length();
        }
        match self.reply_date()? {
            ReplyDate::Off => {}
            ReplyDate::Fixed(at) => {
                scope.reply_date(Some(at));
            }
            ReplyDate::Live => {
                scope.reply_date(None);
            }
        }
        for interceptor in &self.interceptors {
            interceptor.install(&scope)?;
        }
        Ok(scope)
    }
}

/// One declared interceptor.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterceptorFixture {
    #[serde(default = "default_method")]
    pub method: String,

    pub path: PathRule,

    /// Query parameter rules
    #[serde(default)]
    pub query: HashMap<String, QueryRule>,

    /// Request header rules
    #[serde(default)]
    pub headers: HashMap<String, HeaderRule>,

    #[serde(default)]
    pub body: Option<BodyRule>,

    /// Number of requests to serve (default 1)
    #[serde(default)]
    pub times: Option<u32>,

    /// Never exhaust
    #[serde(default)]
    pub persist: bool,

    /// Do not block scope completion
    #[serde(default)]
    pub optional: bool,

    #[serde(default)]
    pub delay: Option<DelayConfig>,

    /// Fail matching requests with this message instead of replying
    #[serde(default)]
    pub error: Option<String>,

    #[serde(default)]
    pub response: ResponseDefinition,
}

fn default_method() -> String {
    "GET".to_string()
}

impl InterceptorFixture {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.method.is_empty() {
            anyhow::bail!("Method cannot be empty");
        }
        if self.times == Some(0) {
            anyhow::bail!("times must be at least 1");
        }
        if self.persist && self.times.is_some() {
            anyhow::bail!("persist and times are mutually exclusive");
        }
        self.path.compile()?;
        for rule in self.query.values() {
            rule.compile()?;
        }
        for rule in self.headers.values() {
            rule.compile()?;
        }
        if let Some(body) = &self.body {
            body.compile()?;
        }
        self.response.validate()?;
        Ok(())
    }

    fn install(&self, scope: &Scope) -> anyhow::Result<()> {
        let mut builder = scope
            .expect(&self.method, self.path.compile()?)
            .with_delay(self.delay.clone());
        for (name, rule) in &self.query {
            builder = builder.query(name.clone(), rule.compile()?);
        }
        for (name, rule) in &self.headers {
            builder = builder.match_header(name.clone(), rule.compile()?);
        }
        if let Some(body) = &self.body {
            builder = builder.body(body.compile()?);
        }
        if self.persist {
            builder = builder.persist();
        } else if let Some(times) = self.times {
            builder = builder.times(times);
        }
        if self.optional {
            builder = builder.optionally();
        }

        match &self.error {
            Some(message) => builder.reply_with_error(message.clone()),
            None => builder.reply(self.response.to_reply()?),
        };
        Ok(())
    }
}

/// Path matching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PathRule {
    /// Exact path (including any query string)
    Exact { value: String },
    /// Path prefix match
    Prefix { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// Glob pattern match
    Glob { pattern: String },
    /// Path with parameters (e.g., /users/{id})
    Template { template: String },
}

impl PathRule {
    pub fn compile(&self) -> Result<PathMatcher, crate::InterceptError> {
        Ok(match self {
            PathRule::Exact { value } => PathMatcher::exact(value.clone()),
            PathRule::Prefix { value } => PathMatcher::prefix(value.clone()),
            PathRule::Regex { pattern } => PathMatcher::regex(pattern)?,
            PathRule::Glob { pattern } => PathMatcher::glob(pattern)?,
            PathRule::Template { template } => PathMatcher::template(template),
        })
    }
}

/// Query parameter matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryRule {
    Exact { value: String },
    Regex { pattern: String },
    Present,
    Absent,
}

impl QueryRule {
    pub fn compile(&self) -> Result<QueryMatcher, crate::InterceptError> {
        Ok(match self {
            QueryRule::Exact { value } => QueryMatcher::Exact(value.clone()),
            QueryRule::Regex { pattern } => QueryMatcher::regex(pattern)?,
            QueryRule::Present => QueryMatcher::Present,
            QueryRule::Absent => QueryMatcher::Absent,
        })
    }
}

/// Request header matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HeaderRule {
    Exact { value: String },
    Regex { pattern: String },
    Present,
    Absent,
    Contains { value: String },
}

impl HeaderRule {
    pub fn compile(&self) -> Result<HeaderMatcher, crate::InterceptError> {
        Ok(match self {
            HeaderRule::Exact { value } => HeaderMatcher::Exact(value.clone()),
            HeaderRule::Regex { pattern } => HeaderMatcher::regex(pattern)?,
            HeaderRule::Present => HeaderMatcher::Present,
            HeaderRule::Absent => HeaderMatcher::Absent,
            HeaderRule::Contains { value } => HeaderMatcher::Contains(value.clone()),
        })
    }
}

/// Body matching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BodyRule {
    Exact { value: String },
    Regex { pattern: String },
    /// JSON path expressions and expected values
    JsonPath {
        expressions: HashMap<String, serde_json::Value>,
    },
    Contains { value: String },
    /// Body must be valid JSON (any structure)
    Json,
    /// Body must equal this JSON document structurally
    JsonEquals { content: serde_json::Value },
    Empty,
}

impl BodyRule {
    pub fn compile(&self) -> Result<BodyMatcher, crate::InterceptError> {
        Ok(match self {
            BodyRule::Exact { value } => BodyMatcher::Exact(value.clone()),
            BodyRule::Regex { pattern } => BodyMatcher::regex(pattern)?,
            BodyRule::JsonPath { expressions } => BodyMatcher::json_path(expressions.clone())?,
            BodyRule::Contains { value } => BodyMatcher::Contains(value.clone()),
            BodyRule::Json => BodyMatcher::IsJson,
            BodyRule::JsonEquals { content } => BodyMatcher::Json(content.clone()),
            BodyRule::Empty => BodyMatcher::Empty,
        })
    }
}

/// Response definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseDefinition {
    /// HTTP status code
    #[serde(default = "default_status")]
    pub status: u16,

    /// Response headers, in wire order
    #[serde(default)]
    pub headers: HeaderSet,

    /// Response body
    #[serde(default)]
    pub body: Option<ResponseBody>,

    /// Render text and JSON bodies as Handlebars templates
    #[serde(default)]
    pub template: bool,
}

impl Default for ResponseDefinition {
    fn default() -> Self {
        Self {
            status: default_status(),
            headers: HeaderSet::new(),
            body: None,
            template: false,
        }
    }
}

fn default_status() -> u16 {
    200
}

impl ResponseDefinition {
    /// Validate the response definition.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(100..=599).contains(&self.status) {
            anyhow::bail!("Invalid status code: {}", self.status);
        }
        Ok(())
    }

    /// Build the reply recipe. File and base64 bodies are read here, once.
    pub fn to_reply(&self) -> anyhow::Result<Reply> {
        let reply = Reply::new(self.status).headers(self.headers.clone());
        Ok(match &self.body {
            None => reply,
            Some(ResponseBody::Text { content }) if self.template => reply.template(content.clone()),
            Some(ResponseBody::Json { content }) if self.template => {
                reply.json_template(content.clone())
            }
            Some(body) => reply.body(body.to_reply_body()?),
        })
    }
}

/// Response body configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBody {
    /// Plain text body
    Text { content: String },
    /// JSON body
    Json { content: serde_json::Value },
    /// Base64 encoded binary
    Base64 { content: String },
    /// Load from file
    File { path: String },
}

impl ResponseBody {
    /// Convert into a literal reply body.
    pub fn to_reply_body(&self) -> anyhow::Result<ReplyBody> {
        match self {
            ResponseBody::Text { content } => Ok(ReplyBody::Text(content.clone())),
            ResponseBody::Json { content } => Ok(ReplyBody::Json(content.clone())),
            ResponseBody::Base64 { content } => {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD
                    .decode(content)
                    .map(ReplyBody::from)
                    .map_err(|e| anyhow::anyhow!("Invalid base64: {}", e))
            }
            ResponseBody::File { path } => std::fs::read(path)
                .map(ReplyBody::from)
                .map_err(|e| anyhow::anyhow!("Failed to read file {}: {}", path, e)),
        }
    }
}

/// Delay before a served response is delivered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DelayConfig {
    /// Fixed delay in milliseconds
    #[serde(default)]
    pub fixed_ms: u64,

    /// Minimum delay for random range (ms)
    #[serde(default)]
    pub min_ms: u64,

    /// Maximum delay for random range (ms)
    #[serde(default)]
    pub max_ms: u64,
}

impl DelayConfig {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            fixed_ms: delay.as_millis() as u64,
            ..Default::default()
        }
    }

    pub fn range(min: Duration, max: Duration) -> Self {
        Self {
            fixed_ms: 0,
            min_ms: min.as_millis() as u64,
            max_ms: max.as_millis() as u64,
        }
    }

    /// Calculate the actual delay to apply.
    pub fn calculate(&self) -> Duration {
        let ms = if self.fixed_ms > 0 {
            self.fixed_ms
        } else if self.max_ms > self.min_ms {
            use rand::Rng;
            rand::thread_rng().gen_range(self.min_ms..=self.max_ms)
        } else {
            self.min_ms
        };
        Duration::from_millis(ms)
    }
}
