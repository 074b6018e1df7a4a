//! Scopes: ordered interceptors for one origin plus origin-level defaults.

use crate::clock::Clock;
use crate::error::InterceptError;
use crate::header::HeaderSet;
use crate::interceptor::{Interceptor, InterceptorBuilder, InterceptorHandle, ReplyAction};
use crate::matcher::PathMatcher;
use crate::request::{InterceptedRequest, Origin};
use crate::response::{ReplyDate, ReplyDefaults, ResponseBuilder, SynthesizedResponse};
use crate::template::TemplateEngine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A request served by an interceptor.
#[derive(Debug)]
pub struct Served {
    pub response: SynthesizedResponse,
    pub interceptor: InterceptorHandle,
    /// Delay to apply before delivering the response
    pub delay: Option<Duration>,
}

struct ScopeState {
    /// Every interceptor ever declared, in registration order
    declared: Vec<InterceptorHandle>,
    /// Candidates for matching; exhausted interceptors leave this pool
    active: Vec<InterceptorHandle>,
    defaults: ReplyDefaults,
    torn_down: bool,
}

struct ScopeInner {
    origin: Origin,
    state: Mutex<ScopeState>,
}

/// Expected requests and reply defaults for one origin.
///
/// Cloning yields another handle to the same scope.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    pub(crate) fn new(origin: Origin) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                origin,
                state: Mutex::new(ScopeState {
                    declared: Vec::new(),
                    active: Vec::new(),
                    defaults: ReplyDefaults::default(),
                    torn_down: false,
                }),
            }),
        }
    }

    pub fn origin(&self) -> &Origin {
        &self.inner.origin
    }

    /// Start declaring an expected request.
    pub fn expect(&self, method: &str, path: impl Into<PathMatcher>) -> InterceptorBuilder<'_> {
        InterceptorBuilder::new(self, method, path.into())
    }

    pub fn get(&self, path: impl Into<PathMatcher>) -> InterceptorBuilder<'_> {
        self.expect("GET", path)
    }

    pub fn post(&self, path: impl Into<PathMatcher>) -> InterceptorBuilder<'_> {
        self.expect("POST", path)
    }

    pub fn put(&self, path: impl Into<PathMatcher>) -> InterceptorBuilder<'_> {
        self.expect("PUT", path)
    }

    pub fn patch(&self, path: impl Into<PathMatcher>) -> InterceptorBuilder<'_> {
        self.expect("PATCH", path)
    }

    pub fn delete(&self, path: impl Into<PathMatcher>) -> InterceptorBuilder<'_> {
        self.expect("DELETE", path)
    }

    pub fn head(&self, path: impl Into<PathMatcher>) -> InterceptorBuilder<'_> {
        self.expect("HEAD", path)
    }

    pub fn options(&self, path: impl Into<PathMatcher>) -> InterceptorBuilder<'_> {
        self.expect("OPTIONS", path)
    }

    /// Headers added to every reply unless a reply declares the same name.
    pub fn default_reply_headers(&self, headers: HeaderSet) -> &Self {
        self.inner.state.lock().defaults.headers = headers;
        self
    }

    /// Set `Content-Length` on every reply from the serialized body.
    pub fn reply_content_length(&self) -> &Self {
        self.inner.state.lock().defaults.content_length = true;
        self
    }

    /// Set `Date` on every reply: to `date` if given, otherwise to the
    /// engine clock at build time.
    pub fn reply_date(&self, date: Option<DateTime<Utc>>) -> &Self {
        self.inner.state.lock().defaults.date = match date {
            Some(at) => ReplyDate::Fixed(at),
            None => ReplyDate::Live,
        };
        self
    }

    /// True once every interceptor that must be consumed has been.
    pub fn is_done(&self) -> bool {
        self.inner
            .state
            .lock()
            .declared
            .iter()
            .all(|i| i.is_satisfied())
    }

    /// Fail with every pending expectation if the scope is not done.
    pub fn done(&self) -> Result<(), InterceptError> {
        let pending: Vec<String> = self.pending_list().iter().collect();
        if pending.is_empty() {
            Ok(())
        } else {
            Err(InterceptError::PendingExpectations {
                origin: self.origin().to_string(),
                pending,
            })
        }
    }

    /// Panicking form of [`done`](Self::done) for test assertions.
    #[track_caller]
    pub fn assert_done(&self) {
        if let Err(err) = self.done() {
            panic!("{}", err);
        }
    }

    /// Descriptors of interceptors that still have required uses left.
    pub fn pending_list(&self) -> PendingList {
        PendingList {
            interceptors: self.inner.state.lock().declared.clone(),
        }
    }

    /// Every interceptor declared on this scope, in registration order.
    pub fn interceptors(&self) -> Vec<InterceptorHandle> {
        self.inner.state.lock().declared.clone()
    }

    /// Number of interceptors still eligible for matching.
    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active.len()
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.state.lock().torn_down
    }

    pub(crate) fn same_scope(&self, other: &Scope) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn register(&self, interceptor: Interceptor) -> InterceptorHandle {
        let handle = Arc::new(interceptor);
        let mut state = self.inner.state.lock();
        if state.torn_down {
            warn!(
                origin = %self.inner.origin,
                interceptor = %handle.describe(),
                "Declaring an interceptor on a torn-down scope; it will never match"
            );
        } else {
            state.active.push(handle.clone());
        }
        state.declared.push(handle.clone());
        handle
    }

    /// Drop every interceptor from the candidate pool.
    pub(crate) fn teardown(&self) {
        let mut state = self.inner.state.lock();
        state.active.clear();
        state.torn_down = true;
    }

    /// Match and consume under the scope lock, then build the response with
    /// the lock released so providers may call back into the engine.
    ///
    /// Returns `None` when no active interceptor accepts the request.
    pub(crate) fn serve(
        &self,
        request: &InterceptedRequest,
        clock: &dyn Clock,
        templates: &TemplateEngine,
    ) -> Option<Result<Served, InterceptError>> {
        let (interceptor, context, defaults) = {
            let mut state = self.inner.state.lock();

            let (idx, context) = state.active.iter().enumerate().find_map(|(idx, interceptor)| {
                let context = interceptor.matcher().matches(request)?;
                if interceptor.try_consume() {
                    Some((idx, context))
                } else {
                    debug!(interceptor = %interceptor.describe(), "Skipping exhausted interceptor");
                    None
                }
            })?;

            let interceptor = state.active[idx].clone();
            if interceptor.is_exhausted() {
                state.active.remove(idx);
            }
            (interceptor, context, state.defaults.clone())
        };

        assert!(
            !interceptor.is_over_consumed(),
            "interceptor {} served past its repeat limit",
            interceptor.describe()
        );

        let result = match interceptor.action() {
            ReplyAction::Respond(reply) => ResponseBuilder::new(&defaults, clock, templates)
                .build(reply, &context, request)
                .map(|response| Served {
                    response,
                    delay: interceptor.delay().map(|d| d.calculate()),
                    interceptor: interceptor.clone(),
                }),
            ReplyAction::Fail(message) => Err(InterceptError::Replied(message.clone())),
        };
        Some(result)
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Scope")
            .field("origin", &self.inner.origin.to_string())
            .field("declared", &state.declared.len())
            .field("active", &state.active.len())
            .finish()
    }
}

/// Lazily described pending expectations.
///
/// Iterating reads each interceptor's live consumption count, so a list kept
/// around shrinks as requests are served; it can be iterated any number of
/// times.
pub struct PendingList {
    interceptors: Vec<InterceptorHandle>,
}

impl PendingList {
    pub fn iter(&self) -> impl Iterator<Item = String> + '_ {
        self.interceptors
            .iter()
            .filter(|i| !i.is_satisfied())
            .map(|i| i.describe())
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

impl<'a> IntoIterator for &'a PendingList {
    type Item = String;
    type IntoIter = Box<dyn Iterator<Item = String> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::registry::Registry;

    fn serve(scope: &Scope, method: &str, path: &str) -> Option<Result<Served, InterceptError>> {
        let request =
            InterceptedRequest::new(method, &format!("{}{}", scope.origin(), path)).unwrap();
        scope.serve(&request, &SystemClock, &TemplateEngine::new())
    }

    #[test]
    fn test_registration_order_wins() {
        let registry = Registry::new();
        let scope = registry.scope("http://api.test").unwrap();
        let first = scope.get(PathMatcher::prefix("/users")).reply(200);
        let second = scope.get("/users/1").reply(404);

        let served = serve(&scope, "GET", "/users/1").unwrap().unwrap();
        assert_eq!(served.response.status, 200);
        assert_eq!(served.interceptor.id(), first.id());

        // The first is exhausted now, so the next request falls through
        let served = serve(&scope, "GET", "/users/1").unwrap().unwrap();
        assert_eq!(served.interceptor.id(), second.id());

        assert!(serve(&scope, "GET", "/users/1").is_none());
    }

    #[test]
    fn test_exhausted_leave_active_pool() {
        let registry = Registry::new();
        let scope = registry.scope("http://api.test").unwrap();
        scope.get("/a").reply(200);
        scope.get("/b").persist().reply(200);
        assert_eq!(scope.active_count(), 2);

        serve(&scope, "GET", "/a").unwrap().unwrap();
        serve(&scope, "GET", "/b").unwrap().unwrap();
        assert_eq!(scope.active_count(), 1);
        assert_eq!(scope.interceptors().len(), 2);
    }

    #[test]
    fn test_done_and_pending_list() {
        let registry = Registry::new();
        let scope = registry.scope("http://api.test").unwrap();
        scope.get("/twice").twice().reply(200);
        scope.post("/once").reply(201);
        scope.get("/forever").persist().reply(200);
        scope.get("/maybe").optionally().reply(200);

        assert!(!scope.is_done());
        let pending = scope.pending_list();
        let listed: Vec<_> = pending.iter().collect();
        assert_eq!(
            listed,
            vec!["GET http://api.test:80/twice", "POST http://api.test:80/once"]
        );

        let err = scope.done().unwrap_err();
        assert!(err.to_string().contains("POST http://api.test:80/once"));

        serve(&scope, "GET", "/twice").unwrap().unwrap();
        serve(&scope, "POST", "/once").unwrap().unwrap();
        // Same list, iterated again, reflects live counts
        let listed: Vec<_> = (&pending).into_iter().collect();
        assert_eq!(listed, vec!["GET http://api.test:80/twice"]);

        serve(&scope, "GET", "/twice").unwrap().unwrap();
        assert!(pending.is_empty());
        assert!(scope.is_done());
        scope.done().unwrap();
        scope.assert_done();
    }

    #[test]
    #[should_panic(expected = "pending expectations")]
    fn test_assert_done_panics() {
        let registry = Registry::new();
        let scope = registry.scope("http://api.test").unwrap();
        scope.get("/never").reply(200);
        scope.assert_done();
    }

    #[test]
    fn test_reply_with_error() {
        let registry = Registry::new();
        let scope = registry.scope("http://api.test").unwrap();
        let handle = scope.get("/reset").reply_with_error("connection reset");

        let err = serve(&scope, "GET", "/reset").unwrap().unwrap_err();
        assert_eq!(err.to_string(), "connection reset");
        assert_eq!(handle.consumed_count(), 1);
    }

    #[test]
    fn test_teardown_clears_pool() {
        let registry = Registry::new();
        let scope = registry.scope("http://api.test").unwrap();
        scope.get("/a").persist().reply(200);
        scope.teardown();

        assert!(scope.is_torn_down());
        assert!(serve(&scope, "GET", "/a").is_none());

        scope.get("/late").reply(200);
        assert_eq!(scope.active_count(), 0);
        assert!(!scope.is_done());
    }
}
