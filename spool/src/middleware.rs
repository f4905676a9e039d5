//! Request/response lifecycle hooks.
//!
//! The host framework calls [`ProfilingMiddleware::request_started`] when a
//! request arrives and [`ProfilingMiddleware::response_produced`] once the
//! handler has a response. Between the two, the returned [`RequestContext`]
//! owns the request's [`Collector`]; entering it on the handling thread lets
//! traced connections and spans find it. Async handlers are wrapped with
//! [`RequestContext::instrument`] instead of holding the guard across awaits.
//!
//! ```ignore
//! let middleware = ProfilingMiddleware::builder(store).build()?;
//! let response = middleware.handle(&request, || app.dispatch(&request));
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use http::{HeaderMap, Method, Request, Response, Uri};
use rand::Rng;

use crate::capture::Capture;
use crate::collector::{Collector, Instrumented, ScopeGuard};
use crate::profiling::dynamic::DynamicProfiler;
use crate::profiling::mark_installed;
use crate::schema::RequestRecord;
use crate::sql::QueryInterceptor;
use crate::store::Store;
use crate::Result;

/// Attempts at persisting a request before giving up on it.
pub const DEFAULT_SAVE_ATTEMPTS: u32 = 2;

/// What an intercept predicate gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct RequestHead<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
}

impl<'a> RequestHead<'a> {
    pub fn of<B>(req: &'a Request<B>) -> Self {
        Self {
            method: req.method(),
            uri: req.uri(),
            headers: req.headers(),
        }
    }
}

/// Decides whether a request is profiled. Replaces percentage sampling.
pub type InterceptPredicate = Arc<dyn Fn(&RequestHead<'_>) -> bool + Send + Sync>;

/// Run `save` up to `attempts` times while it fails with a transient error.
///
/// Returns `None` when every attempt failed transiently; any other error is
/// returned at once.
fn save_with_retries<T>(attempts: u32, mut save: impl FnMut(u32) -> Result<T>) -> Result<Option<T>> {
    for attempt in 1..=attempts {
        match save(attempt) {
            Ok(saved) => return Ok(Some(saved)),
            Err(e) if e.is_transient() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

/// Builder for [`ProfilingMiddleware`].
pub struct ProfilingMiddlewareBuilder {
    store: Arc<Store>,
    predicate: Option<InterceptPredicate>,
    save_attempts: u32,
    capture_traceback: bool,
}

impl ProfilingMiddlewareBuilder {
    /// Use `predicate` instead of `intercept_percent`.
    pub fn intercept_with(
        mut self,
        predicate: impl Fn(&RequestHead<'_>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn save_attempts(mut self, attempts: u32) -> Self {
        self.save_attempts = attempts.max(1);
        self
    }

    /// Skip call-stack capture for recorded queries.
    pub fn without_traceback(mut self) -> Self {
        self.capture_traceback = false;
        self
    }

    /// Validate the configuration and build the middleware.
    ///
    /// Building marks profiling as installed for the process, so spans and
    /// profiled functions start recording.
    pub fn build(self) -> Result<ProfilingMiddleware> {
        let config = self.store.config();
        config.validate()?;
        let dynamic = DynamicProfiler::new(&config.dynamic_profiling)?;

        let mut interceptor = QueryInterceptor::new(config);
        if !self.capture_traceback {
            interceptor = interceptor.without_traceback();
        }
        let sampling_interval = config
            .sampling_profiler
            .then(|| Duration::from_micros(config.sampling_interval_us.max(1)));

        mark_installed();
        tracing::debug!(
            intercept_percent = config.intercept_percent,
            custom_predicate = self.predicate.is_some(),
            dynamic_entries = config.dynamic_profiling.len(),
            "profiling middleware installed"
        );

        Ok(ProfilingMiddleware {
            capture: Capture::new(config),
            interceptor,
            dynamic,
            sampling_interval,
            predicate: self.predicate,
            save_attempts: self.save_attempts,
            store: self.store,
        })
    }
}

/// The profiling layer as seen by a web framework.
pub struct ProfilingMiddleware {
    store: Arc<Store>,
    capture: Capture,
    interceptor: QueryInterceptor,
    dynamic: DynamicProfiler,
    sampling_interval: Option<Duration>,
    predicate: Option<InterceptPredicate>,
    save_attempts: u32,
}

impl fmt::Debug for ProfilingMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfilingMiddleware")
            .field("store", &self.store)
            .field("custom_predicate", &self.predicate.is_some())
            .field("save_attempts", &self.save_attempts)
            .finish()
    }
}

/// Per-request state between the two lifecycle hooks.
#[derive(Debug)]
pub struct RequestContext {
    collector: Collector,
    intercepted: bool,
    finalized: AtomicBool,
    /// Time spent in `request_started`.
    meta_elapsed: Duration,
}

impl RequestContext {
    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    pub fn is_intercepted(&self) -> bool {
        self.intercepted
    }

    /// Make this request's collector current on the calling thread.
    pub fn enter(&self) -> ScopeGuard {
        self.collector.enter()
    }

    /// Run an async handler with this request's collector current whenever
    /// it is polled.
    pub fn instrument<F: Future>(&self, fut: F) -> Instrumented<F> {
        self.collector.instrument(fut)
    }
}

impl ProfilingMiddleware {
    pub fn builder(store: Arc<Store>) -> ProfilingMiddlewareBuilder {
        ProfilingMiddlewareBuilder {
            store,
            predicate: None,
            save_attempts: DEFAULT_SAVE_ATTEMPTS,
            capture_traceback: true,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Interceptor configured from the store's config, for building traced
    /// connections.
    pub fn interceptor(&self) -> &QueryInterceptor {
        &self.interceptor
    }

    /// Configured call sites for [`DynamicProfiler::call_site`].
    pub fn dynamic(&self) -> &DynamicProfiler {
        &self.dynamic
    }

    /// Whether a request with this head should be profiled.
    ///
    /// The custom predicate (or percentage sampling when there is none) runs
    /// first; ignored paths are excluded afterwards.
    pub fn should_intercept(&self, head: &RequestHead<'_>) -> bool {
        let config = self.store.config();
        let sampled = match &self.predicate {
            Some(predicate) => predicate(head),
            None => {
                config.intercept_percent >= 100
                    || rand::thread_rng().gen_range(0..100) < config.intercept_percent
            }
        };
        sampled && !config.ignore_paths.iter().any(|p| p == head.uri.path())
    }

    /// Hook for an incoming request.
    ///
    /// The collector is always configured, so code that registers queries
    /// for a request that is not profiled still works; such a collector has
    /// no request and is never persisted.
    pub fn request_started<B: AsRef<[u8]>>(&self, req: &Request<B>) -> RequestContext {
        let started = Instant::now();
        let collector = match self.sampling_interval {
            Some(interval) => Collector::with_sampler(interval),
            None => Collector::new(),
        };

        let intercepted = self.should_intercept(&RequestHead::of(req));
        if intercepted {
            let record = self.capture.request(req);
            tracing::debug!(request_id = %record.id, path = %record.path, "intercepting request");
            collector.configure(Some(record), self.sampling_interval.is_some());
        } else {
            collector.configure(None, false);
        }

        RequestContext {
            collector,
            intercepted,
            finalized: AtomicBool::new(false),
            meta_elapsed: started.elapsed(),
        }
    }

    /// Hook for the response to a request.
    ///
    /// Persists the request, its response and everything the collector
    /// buffered. Transient storage errors are retried; when the attempts run
    /// out the request is dropped with a warning. A second call for the
    /// same context is logged and skipped.
    ///
    /// Returns the saved request, or `None` when nothing was saved.
    pub fn response_produced<B: AsRef<[u8]>>(
        &self,
        ctx: &RequestContext,
        resp: &Response<B>,
    ) -> Result<Option<RequestRecord>> {
        if !ctx.intercepted {
            return Ok(None);
        }
        if ctx.finalized.load(Ordering::Acquire) {
            tracing::debug!(
                request_id = ?ctx.collector.request_id(),
                "response already processed, skipping"
            );
            return Ok(None);
        }

        let started = Instant::now();
        let Some(request_id) = ctx.collector.request_id() else {
            tracing::error!(
                "No request model was available when processing response. \
                 Did something go wrong in request_started?"
            );
            return Ok(None);
        };

        let response = self.capture.response(request_id, resp);
        let meta = self.store.config().meta;
        let meta_ms = (ctx.meta_elapsed + started.elapsed()).as_secs_f64() * 1_000.0;
        ctx.collector.update_request(|request| {
            request.end_time = Some(Utc::now());
            if meta {
                request.meta_time = Some(meta_ms);
            }
        });

        let saved = save_with_retries(self.save_attempts, |attempt| {
            ctx.collector
                .finalize(&self.store, Some(&response))
                .inspect_err(|e| {
                    if e.is_transient() {
                        tracing::debug!(%request_id, attempt, error = %e, "transient failure saving request");
                    }
                })
        })?;
        match saved {
            Some(saved) => {
                ctx.finalized.store(true, Ordering::Release);
                Ok(Some(saved))
            }
            None => {
                tracing::warn!(
                    %request_id,
                    attempts = self.save_attempts,
                    "giving up on saving request"
                );
                Ok(None)
            }
        }
    }

    /// Run `handler` for `req` with the request's collector current on this
    /// thread, then process the response.
    ///
    /// Storage failures are logged and never change the handler's response.
    pub fn handle<B, R>(&self, req: &Request<B>, handler: impl FnOnce() -> Response<R>) -> Response<R>
    where
        B: AsRef<[u8]>,
        R: AsRef<[u8]>,
    {
        let ctx = self.request_started(req);
        let response = {
            let _scope = ctx.enter();
            handler()
        };
        if let Err(e) = self.response_produced(&ctx, &response) {
            tracing::error!(error = %e, path = %req.uri().path(), "failed to record request");
        }
        ctx.collector.clear();
        response
    }
}
