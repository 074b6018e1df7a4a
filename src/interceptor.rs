//! Interceptors: one declared expectation each.
//!
//! An interceptor pairs a [`RequestMatcher`] with a reply recipe and a repeat
//! policy. Its consumption counter only moves forward, one unit per request
//! it serves.

use crate::clock::Clock;
use crate::config::DelayConfig;
use crate::error::{BoxError, InterceptError};
use crate::header::{HeaderSet, HeaderValue};
use crate::matcher::{BodyMatcher, HeaderMatcher, MatchContext, PathMatcher, QueryMatcher, RequestMatcher};
use crate::request::{InterceptedRequest, Origin};
use crate::scope::Scope;
use crate::template::TemplateEngine;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

static NEXT_INTERCEPTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Computes a status code per request.
pub type StatusProvider = Arc<dyn Fn(&InterceptedRequest) -> Result<u16, BoxError> + Send + Sync>;

/// Computes a body per request.
pub type BodyProvider =
    Arc<dyn Fn(&InterceptedRequest) -> Result<ReplyBody, BoxError> + Send + Sync>;

/// Reply status: literal or computed.
#[derive(Clone)]
pub enum StatusSource {
    Fixed(u16),
    Provider(StatusProvider),
}

impl StatusSource {
    pub(crate) fn resolve(&self, request: &InterceptedRequest) -> Result<u16, InterceptError> {
        match self {
            StatusSource::Fixed(status) => Ok(*status),
            StatusSource::Provider(f) => f(request).map_err(InterceptError::StatusProvider),
        }
    }
}

/// A literal reply body.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ReplyBody {
    #[default]
    Empty,
    Text(String),
    /// Serialized compactly
    Json(serde_json::Value),
    Bytes(Bytes),
}

impl ReplyBody {
    fn render(&self) -> Result<RenderedBody, InterceptError> {
        let (bytes, is_json) = match self {
            ReplyBody::Empty => (Bytes::new(), false),
            ReplyBody::Text(s) => (Bytes::from(s.clone()), false),
            ReplyBody::Json(v) => (Bytes::from(serde_json::to_vec(v)?), true),
            ReplyBody::Bytes(b) => (b.clone(), false),
        };
        Ok(RenderedBody { bytes, is_json })
    }
}

impl From<&str> for ReplyBody {
    fn from(s: &str) -> Self {
        ReplyBody::Text(s.to_string())
    }
}

impl From<String> for ReplyBody {
    fn from(s: String) -> Self {
        ReplyBody::Text(s)
    }
}

impl From<serde_json::Value> for ReplyBody {
    fn from(v: serde_json::Value) -> Self {
        ReplyBody::Json(v)
    }
}

impl From<Vec<u8>> for ReplyBody {
    fn from(v: Vec<u8>) -> Self {
        ReplyBody::Bytes(Bytes::from(v))
    }
}

impl From<Bytes> for ReplyBody {
    fn from(b: Bytes) -> Self {
        ReplyBody::Bytes(b)
    }
}

/// Reply body: literal, template, or computed.
#[derive(Clone)]
pub enum BodySource {
    Fixed(ReplyBody),
    /// Handlebars text template
    Template(String),
    /// JSON value whose string leaves are Handlebars templates
    JsonTemplate(serde_json::Value),
    Provider(BodyProvider),
}

pub(crate) struct RenderedBody {
    pub bytes: Bytes,
    pub is_json: bool,
}

impl BodySource {
    pub(crate) fn render(
        &self,
        request: &InterceptedRequest,
        context: &MatchContext,
        templates: &TemplateEngine,
        clock: &dyn Clock,
    ) -> Result<RenderedBody, InterceptError> {
        match self {
            BodySource::Fixed(body) => body.render(),
            BodySource::Template(template) => {
                let text = templates.render(template, context, request, clock.now())?;
                Ok(RenderedBody {
                    bytes: Bytes::from(text),
                    is_json: false,
                })
            }
            BodySource::JsonTemplate(value) => {
                let rendered = templates.render_json(value, context, request, clock.now())?;
                ReplyBody::Json(rendered).render()
            }
            BodySource::Provider(f) => f(request).map_err(InterceptError::BodyProvider)?.render(),
        }
    }
}

/// A reply recipe: status, body and declared headers.
#[derive(Clone)]
pub struct Reply {
    pub(crate) status: StatusSource,
    pub(crate) body: BodySource,
    pub(crate) headers: HeaderSet,
}

impl Reply {
    pub fn new(status: u16) -> Self {
        Self {
            status: StatusSource::Fixed(status),
            body: BodySource::Fixed(ReplyBody::Empty),
            headers: HeaderSet::new(),
        }
    }

    /// Compute the status from the request.
    pub fn with_status<F>(f: F) -> Self
    where
        F: Fn(&InterceptedRequest) -> Result<u16, BoxError> + Send + Sync + 'static,
    {
        Self {
            status: StatusSource::Provider(Arc::new(f)),
            ..Self::new(200)
        }
    }

    pub fn body(mut self, body: impl Into<ReplyBody>) -> Self {
        self.body = BodySource::Fixed(body.into());
        self
    }

    pub fn text(self, text: impl Into<String>) -> Self {
        self.body(ReplyBody::Text(text.into()))
    }

    pub fn json(self, value: serde_json::Value) -> Self {
        self.body(ReplyBody::Json(value))
    }

    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.body = BodySource::Template(template.into());
        self
    }

    pub fn json_template(mut self, value: serde_json::Value) -> Self {
        self.body = BodySource::JsonTemplate(value);
        self
    }

    /// Compute the body from the request.
    pub fn body_with<F, B>(mut self, f: F) -> Self
    where
        F: Fn(&InterceptedRequest) -> Result<B, BoxError> + Send + Sync + 'static,
        B: Into<ReplyBody>,
    {
        self.body = BodySource::Provider(Arc::new(
            move |req: &InterceptedRequest| -> Result<ReplyBody, BoxError> {
                f(req).map(Into::into)
            },
        ));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Overlay a whole header set onto the declared headers.
    pub fn headers(mut self, headers: HeaderSet) -> Self {
        self.headers = self.headers.merged(&headers);
        self
    }
}

impl From<u16> for Reply {
    fn from(status: u16) -> Self {
        Reply::new(status)
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match &self.status {
            StatusSource::Fixed(s) => s.to_string(),
            StatusSource::Provider(_) => "<provider>".to_string(),
        };
        f.debug_struct("Reply")
            .field("status", &status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// What a matched interceptor does.
#[derive(Debug, Clone)]
pub enum ReplyAction {
    Respond(Reply),
    /// Fail the request with this message
    Fail(String),
}

/// How many requests an interceptor may serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Times(u32),
    /// Never exhausts
    Persist,
}

/// Lifecycle state of an interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptorState {
    /// `None` remaining means unbounded (persisted)
    Pending { remaining: Option<u32> },
    Exhausted,
}

/// One declared expectation.
pub struct Interceptor {
    id: u64,
    origin: Origin,
    matcher: RequestMatcher,
    action: ReplyAction,
    repeat: Repeat,
    optional: bool,
    delay: Option<DelayConfig>,
    consumed: AtomicU32,
}

/// Shared reference to a registered interceptor.
pub type InterceptorHandle = Arc<Interceptor>;

impl Interceptor {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn matcher(&self) -> &RequestMatcher {
        &self.matcher
    }

    pub fn action(&self) -> &ReplyAction {
        &self.action
    }

    pub fn repeat(&self) -> Repeat {
        self.repeat
    }

    pub fn is_persisted(&self) -> bool {
        self.repeat == Repeat::Persist
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    pub fn delay(&self) -> Option<&DelayConfig> {
        self.delay.as_ref()
    }

    pub fn consumed_count(&self) -> u32 {
        self.consumed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> InterceptorState {
        match self.repeat {
            Repeat::Persist => InterceptorState::Pending { remaining: None },
            Repeat::Times(limit) => {
                let consumed = self.consumed_count();
                if consumed >= limit {
                    InterceptorState::Exhausted
                } else {
                    InterceptorState::Pending {
                        remaining: Some(limit - consumed),
                    }
                }
            }
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.state() == InterceptorState::Exhausted
    }

    /// Whether this interceptor no longer blocks its scope from being done.
    pub fn is_satisfied(&self) -> bool {
        self.optional || self.is_persisted() || self.is_exhausted()
    }

    /// Human-readable descriptor, e.g. `GET http://api.test:80/users`.
    pub fn describe(&self) -> String {
        format!("{} {}{}", self.matcher.method, self.origin, self.matcher.path)
    }

    /// Claim one unit of the repeat budget.
    ///
    /// Returns false once exhausted; concurrent callers never over-claim.
    pub(crate) fn try_consume(&self) -> bool {
        match self.repeat {
            Repeat::Persist => {
                // The count saturates; a persisted interceptor always serves
                let _ = self
                    .consumed
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |consumed| {
                        Some(consumed.saturating_add(1))
                    });
                true
            }
            Repeat::Times(limit) => self
                .consumed
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |consumed| {
                    (consumed < limit).then(|| consumed + 1)
                })
                .is_ok(),
        }
    }

    /// True if more requests were served than the repeat policy allows.
    pub(crate) fn is_over_consumed(&self) -> bool {
        matches!(self.repeat, Repeat::Times(limit) if self.consumed_count() > limit)
    }
}

impl fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptor")
            .field("id", &self.id)
            .field("describe", &self.describe())
            .field("repeat", &self.repeat)
            .field("consumed", &self.consumed_count())
            .finish_non_exhaustive()
    }
}

/// Fluent declaration of one expectation on a [`Scope`].
///
/// Nothing is registered until [`reply`](Self::reply) or
/// [`reply_with_error`](Self::reply_with_error) is called.
#[must_use = "an interceptor is only registered once a reply is declared"]
pub struct InterceptorBuilder<'s> {
    scope: &'s Scope,
    matcher: RequestMatcher,
    repeat: Repeat,
    optional: bool,
    delay: Option<DelayConfig>,
}

impl<'s> InterceptorBuilder<'s> {
    pub(crate) fn new(scope: &'s Scope, method: &str, path: PathMatcher) -> Self {
        Self {
            scope,
            matcher: RequestMatcher::new(method, path),
            repeat: Repeat::Times(1),
            optional: false,
            delay: None,
        }
    }

    /// Require a query parameter. Once any is declared the path matcher
    /// sees the path without its query string.
    pub fn query(mut self, name: impl Into<String>, matcher: impl Into<QueryMatcher>) -> Self {
        self.matcher.query.push((name.into(), matcher.into()));
        self
    }

    /// Require a request header (name compared case-insensitively).
    pub fn match_header(mut self, name: impl Into<String>, matcher: impl Into<HeaderMatcher>) -> Self {
        self.matcher.headers.push((name.into(), matcher.into()));
        self
    }

    pub fn body(mut self, matcher: impl Into<BodyMatcher>) -> Self {
        self.matcher.body = Some(matcher.into());
        self
    }

    /// Serve exactly `n` requests. Values below one are raised to one.
    pub fn times(mut self, n: u32) -> Self {
        if n < 1 {
            warn!(requested = n, "times() needs a positive count, using 1");
        }
        self.repeat = Repeat::Times(n.max(1));
        self
    }

    pub fn once(self) -> Self {
        self.times(1)
    }

    pub fn twice(self) -> Self {
        self.times(2)
    }

    pub fn thrice(self) -> Self {
        self.times(3)
    }

    /// Never exhaust.
    pub fn persist(mut self) -> Self {
        self.repeat = Repeat::Persist;
        self
    }

    /// Do not block `Scope::is_done`.
    pub fn optionally(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Hold the response for a fixed time before delivery.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(DelayConfig::fixed(delay));
        self
    }

    /// Hold the response for a random time in `[min, max]`.
    pub fn delay_between(mut self, min: Duration, max: Duration) -> Self {
        self.delay = Some(DelayConfig::range(min, max));
        self
    }

    pub(crate) fn with_delay(mut self, delay: Option<DelayConfig>) -> Self {
        self.delay = delay;
        self
    }

    /// Register the expectation with its reply recipe.
    pub fn reply(self, reply: impl Into<Reply>) -> InterceptorHandle {
        self.register(ReplyAction::Respond(reply.into()))
    }

    /// Register the expectation so that it fails matching requests.
    pub fn reply_with_error(self, message: impl Into<String>) -> InterceptorHandle {
        self.register(ReplyAction::Fail(message.into()))
    }

    fn register(self, action: ReplyAction) -> InterceptorHandle {
        let interceptor = Interceptor {
            id: NEXT_INTERCEPTOR_ID.fetch_add(1, Ordering::Relaxed),
            origin: self.scope.origin().clone(),
            matcher: self.matcher,
            action,
            repeat: self.repeat,
            optional: self.optional,
            delay: self.delay,
            consumed: AtomicU32::new(0),
        };
        self.scope.register(interceptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    fn scope() -> Scope {
        Registry::new().scope("http://api.test").unwrap()
    }

    #[test]
    fn test_times_exhausts() {
        let scope = scope();
        let handle = scope.expect("GET", "/items").times(2).reply(200);

        assert_eq!(handle.state(), InterceptorState::Pending { remaining: Some(2) });
        assert!(handle.try_consume());
        assert!(handle.try_consume());
        assert!(!handle.try_consume());
        assert_eq!(handle.consumed_count(), 2);
        assert_eq!(handle.state(), InterceptorState::Exhausted);
        assert!(!handle.is_over_consumed());
    }

    #[test]
    fn test_times_zero_is_clamped() {
        let scope = scope();
        let handle = scope.expect("GET", "/items").times(0).reply(200);
        assert_eq!(handle.repeat(), Repeat::Times(1));
    }

    #[test]
    fn test_persist_never_exhausts() {
        let scope = scope();
        let handle = scope.expect("GET", "/health").persist().reply(204);
        for _ in 0..100 {
            assert!(handle.try_consume());
        }
        assert_eq!(handle.state(), InterceptorState::Pending { remaining: None });
        assert!(handle.is_satisfied());
    }

    #[test]
    fn test_persist_serves_past_counter_limit() {
        let scope = scope();
        let handle = scope.expect("GET", "/health").persist().reply(204);
        handle.consumed.store(u32::MAX - 1, Ordering::SeqCst);

        for _ in 0..3 {
            assert!(handle.try_consume());
        }
        assert_eq!(handle.consumed_count(), u32::MAX);
        assert!(!handle.is_exhausted());
        assert!(!handle.is_over_consumed());
    }

    #[test]
    fn test_optional_is_satisfied_unconsumed() {
        let scope = scope();
        let handle = scope.expect("GET", "/maybe").optionally().reply(200);
        assert!(handle.is_satisfied());
        assert!(!handle.is_exhausted());
    }

    #[test]
    fn test_describe() {
        let scope = scope();
        let handle = scope.expect("post", "/users").reply(201);
        assert_eq!(handle.describe(), "POST http://api.test:80/users");
    }

    #[test]
    fn test_reply_body_rendering() {
        let body = ReplyBody::Json(serde_json::json!({"hello": "world"}))
            .render()
            .unwrap();
        assert!(body.is_json);
        assert_eq!(body.bytes.len(), 17);

        let body = ReplyBody::from(vec![0u8, 159, 146, 150]).render().unwrap();
        assert!(!body.is_json);
        assert_eq!(body.bytes.as_ref(), &[0u8, 159, 146, 150]);
    }

    #[test]
    fn test_status_provider() {
        let reply = Reply::with_status(|req| Ok(if req.query().is_some() { 400 } else { 200 }));
        let plain = InterceptedRequest::new("GET", "http://api.test/").unwrap();
        let queried = InterceptedRequest::new("GET", "http://api.test/?x").unwrap();
        assert_eq!(reply.status.resolve(&plain).unwrap(), 200);
        assert_eq!(reply.status.resolve(&queried).unwrap(), 400);
    }
}
