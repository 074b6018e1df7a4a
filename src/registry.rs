//! The registry of active scopes and the request dispatch path.
//!
//! A test harness owns a [`Registry`], calls [`Registry::init`] before each
//! test and [`Registry::teardown`] after it. Transport hooks feed requests in
//! through [`Registry::intercept`] or the async [`Transport`] boundary.

use crate::clock::{Clock, SystemClock};
use crate::config::EngineSettings;
use crate::error::InterceptError;
use crate::request::{InterceptedRequest, Origin};
use crate::scope::{Scope, Served};
use crate::template::TemplateEngine;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Outcome of dispatching a request.
#[derive(Debug)]
pub enum Dispatch {
    /// An interceptor served the request
    Mocked(Served),
    /// Nothing matched and network access is allowed for this origin
    Passthrough(InterceptedRequest),
}

impl Dispatch {
    /// The served response, if the request was mocked.
    pub fn into_served(self) -> Option<Served> {
        match self {
            Dispatch::Mocked(served) => Some(served),
            Dispatch::Passthrough(_) => None,
        }
    }
}

/// Boundary between a transport hook and the engine.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dispatch(&self, request: InterceptedRequest) -> Result<Dispatch, InterceptError>;
}

/// Table of active scopes keyed by origin.
pub struct Registry {
    /// Scopes per origin, in creation order
    scopes: RwLock<HashMap<Origin, Vec<Scope>>>,
    settings: RwLock<EngineSettings>,
    /// Settings restored by `init`
    initial_settings: EngineSettings,
    clock: RwLock<Arc<dyn Clock>>,
    templates: TemplateEngine,
    /// Total requests dispatched.
    requests_total: AtomicU64,
    /// Requests served by an interceptor.
    requests_matched: AtomicU64,
    /// Requests no interceptor accepted.
    requests_unmatched: AtomicU64,
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

impl Registry {
    pub fn new() -> Self {
        Self::with_settings(EngineSettings::default())
    }

    pub fn with_settings(settings: EngineSettings) -> Self {
        Self {
            scopes: RwLock::new(HashMap::new()),
            settings: RwLock::new(settings.clone()),
            initial_settings: settings,
            clock: RwLock::new(Arc::new(SystemClock)),
            templates: TemplateEngine::new(),
            requests_total: AtomicU64::new(0),
            requests_matched: AtomicU64::new(0),
            requests_unmatched: AtomicU64::new(0),
        }
    }

    /// A process-wide registry for harnesses that share one instance.
    pub fn global() -> &'static Registry {
        GLOBAL.get_or_init(Registry::new)
    }

    /// Start a test from a clean slate: no scopes, zeroed counters, the
    /// settings the registry was built with and the system clock.
    pub fn init(&self) {
        self.teardown();
        *self.settings.write() = self.initial_settings.clone();
        *self.clock.write() = Arc::new(SystemClock);
        self.requests_total.store(0, Ordering::Relaxed);
        self.requests_matched.store(0, Ordering::Relaxed);
        self.requests_unmatched.store(0, Ordering::Relaxed);
    }

    /// Remove every scope and its interceptors in one step.
    ///
    /// Requests already matching finish against the state they started with.
    pub fn teardown(&self) {
        let mut scopes = self.scopes.write();
        let removed: usize = scopes.values().map(Vec::len).sum();
        for scope in scopes.values().flatten() {
            scope.teardown();
        }
        scopes.clear();
        debug!(scopes = removed, "Registry torn down");
    }

    /// Create and register a scope for `origin`.
    pub fn scope(&self, origin: &str) -> Result<Scope, InterceptError> {
        let origin = Origin::parse(origin)?;
        let scope = Scope::new(origin.clone());
        self.scopes
            .write()
            .entry(origin)
            .or_default()
            .push(scope.clone());
        Ok(scope)
    }

    /// Tear down a single scope.
    pub fn remove_scope(&self, scope: &Scope) {
        let mut scopes = self.scopes.write();
        if let Some(list) = scopes.get_mut(scope.origin()) {
            list.retain(|s| !s.same_scope(scope));
            if list.is_empty() {
                scopes.remove(scope.origin());
            }
        }
        scope.teardown();
    }

    /// Every registered scope, grouped by origin.
    pub fn scopes(&self) -> Vec<Scope> {
        self.scopes.read().values().flatten().cloned().collect()
    }

    /// Route all time-stamping through `clock`.
    pub fn set_clock(&self, clock: Arc<dyn Clock>) {
        *self.clock.write() = clock;
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.read().clone()
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings.read().clone()
    }

    pub fn set_settings(&self, settings: EngineSettings) {
        *self.settings.write() = settings;
    }

    /// Let unmatched requests through to the network.
    pub fn enable_net_connect(&self) {
        self.settings.write().allow_unmatched = true;
    }

    /// Let unmatched requests to one origin through to the network.
    pub fn enable_net_connect_for(&self, origin: &str) -> Result<(), InterceptError> {
        let origin = Origin::parse(origin)?;
        self.settings
            .write()
            .allowed_origins
            .push(origin.to_string());
        Ok(())
    }

    /// Fail every unmatched request.
    pub fn disable_net_connect(&self) {
        let mut settings = self.settings.write();
        settings.allow_unmatched = false;
        settings.allowed_origins.clear();
    }

    /// Select, consume and build the response for one request.
    pub fn intercept(&self, request: &InterceptedRequest) -> Result<Dispatch, InterceptError> {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        let settings = self.settings();
        let clock = self.clock();

        // Providers run during serve and may call back into the registry
        let candidates = self
            .scopes
            .read()
            .get(request.origin())
            .cloned()
            .unwrap_or_default();
        let outcome = candidates
            .iter()
            .find_map(|scope| scope.serve(request, clock.as_ref(), &self.templates));

        match outcome {
            Some(result) => {
                self.requests_matched.fetch_add(1, Ordering::Relaxed);
                match result {
                    Ok(served) => {
                        if settings.log_matches {
                            info!(
                                interceptor = %served.interceptor.describe(),
                                method = %request.method(),
                                url = %request.url(),
                                status = served.response.status,
                                "Request intercepted"
                            );
                        }
                        Ok(Dispatch::Mocked(served))
                    }
                    Err(err) => {
                        warn!(
                            method = %request.method(),
                            url = %request.url(),
                            error = %err,
                            "Intercepted request failed"
                        );
                        Err(err)
                    }
                }
            }
            None => {
                self.requests_unmatched.fetch_add(1, Ordering::Relaxed);
                if settings.allows_passthrough(request.origin()) {
                    if settings.log_unmatched {
                        info!(
                            method = %request.method(),
                            url = %request.url(),
                            "No interceptor matched, passing through"
                        );
                    }
                    return Ok(Dispatch::Passthrough(request.clone()));
                }
                if settings.log_unmatched {
                    warn!(
                        method = %request.method(),
                        url = %request.url(),
                        "No interceptor matched"
                    );
                }
                Err(InterceptError::NoMatch {
                    method: request.method().to_string(),
                    url: request.url(),
                })
            }
        }
    }

    /// True when every registered scope is done.
    pub fn is_done(&self) -> bool {
        self.scopes().iter().all(Scope::is_done)
    }

    /// Pending expectations across all scopes.
    pub fn pending_mocks(&self) -> Vec<String> {
        self.scopes()
            .iter()
            .flat_map(|scope| scope.pending_list().iter().collect::<Vec<_>>())
            .collect()
    }

    /// Interceptors that can still match, across all scopes.
    pub fn active_mocks(&self) -> Vec<String> {
        self.scopes()
            .iter()
            .flat_map(Scope::interceptors)
            .filter(|i| !i.is_exhausted())
            .map(|i| i.describe())
            .collect()
    }

    pub fn total_requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn total_matched(&self) -> u64 {
        self.requests_matched.load(Ordering::Relaxed)
    }

    pub fn total_unmatched(&self) -> u64 {
        self.requests_unmatched.load(Ordering::Relaxed)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for Registry {
    async fn dispatch(&self, request: InterceptedRequest) -> Result<Dispatch, InterceptError> {
        let dispatch = self.intercept(&request)?;
        if let Dispatch::Mocked(served) = &dispatch {
            if let Some(delay) = served.delay.filter(|d| !d.is_zero()) {
                debug!(
                    interceptor = %served.interceptor.describe(),
                    delay_ms = delay.as_millis() as u64,
                    "Applying delay"
                );
                tokio::time::sleep(delay).await;
            }
        }
        Ok(dispatch)
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn dispatch(&self, request: InterceptedRequest) -> Result<Dispatch, InterceptError> {
        (**self).dispatch(request).await
    }
}
