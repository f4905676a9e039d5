//! Profiling spans.
//!
//! A span times a region of code and records which queries ran inside it.
//! Two forms exist:
//!
//! - block form: [`Span::new`] then [`Span::enter`], or [`profile_block`]
//! - function form: [`profile`] wraps a callable in a [`Profiled`]
//!
//! A span snapshots the collector's query ids on entry and diffs them on exit.
//! The diff is taken against every query seen so far in the scope, so a query
//! run inside a nested span is attributed to both the inner and outer span.
//!
//! Spans do nothing until the middleware has been constructed in this process
//! ([`mark_installed`]), and do nothing outside a request.

pub mod dynamic;
pub mod sampler;

use std::collections::BTreeSet;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;

use crate::collector::Collector;
use crate::schema::ProfileRecord;
use crate::{Error, Result};

static INSTALLED: AtomicBool = AtomicBool::new(false);
static WARNED: AtomicBool = AtomicBool::new(false);

/// Mark profiling as installed for this process.
pub fn mark_installed() {
    INSTALLED.store(true, Ordering::Release);
}

pub fn is_installed() -> bool {
    INSTALLED.load(Ordering::Acquire)
}

fn warn_not_installed() {
    if !WARNED.swap(true, Ordering::AcqRel) {
        tracing::warn!("Cannot profile span: spool middleware is not installed");
    }
}

/// Last path segment of a function's type name, skipping closure markers.
fn function_name<F>() -> String {
    let full = std::any::type_name::<F>();
    full.split("::")
        .filter(|seg| !seg.starts_with("{{"))
        .last()
        .unwrap_or(full)
        .to_string()
}

/// An entered span's bookkeeping.
struct Pending {
    collector: Collector,
    before: BTreeSet<u64>,
    profile: ProfileRecord,
}

fn begin(
    collector: Option<Collector>,
    build: impl FnOnce() -> Result<ProfileRecord>,
) -> Result<Option<Pending>> {
    if !is_installed() {
        warn_not_installed();
        return Ok(None);
    }
    let Some(collector) = collector.or_else(Collector::current) else {
        return Ok(None);
    };
    let Some(request_id) = collector.request_id() else {
        return Ok(None);
    };

    let before = collector.query_ids()?;
    let mut profile = build()?;
    profile.request_id = Some(request_id);
    profile.start_time = Utc::now();
    collector.push_span(&profile.name);

    Ok(Some(Pending {
        collector,
        before,
        profile,
    }))
}

fn finish(pending: Pending, exception_raised: bool) -> Result<u64> {
    let Pending {
        collector,
        before,
        mut profile,
    } = pending;

    collector.pop_span();
    profile.end_time = Some(Utc::now());
    profile.exception_raised = exception_raised;
    let after = collector.query_ids()?;
    profile.queries = after.difference(&before).copied().collect();
    collector.register_profile(profile)
}

/// Combine a wrapped call's result with the outcome of recording it.
///
/// The call's own `Err` always wins; a bookkeeping failure only surfaces
/// when the call succeeded.
fn settle<T, E>(
    out: std::result::Result<T, E>,
    recorded: Result<()>,
    name: &str,
) -> std::result::Result<T, E>
where
    E: From<Error>,
{
    match (out, recorded) {
        (out, Ok(())) => out,
        (Err(e), Err(bookkeeping)) => {
            tracing::warn!(error = %bookkeeping, name, "failed to record span");
            Err(e)
        }
        (Ok(_), Err(bookkeeping)) => Err(bookkeeping.into()),
    }
}

/// A block-form span that has not been entered yet.
#[derive(Debug, Clone)]
pub struct Span {
    name: String,
    location: &'static Location<'static>,
    line_range: Option<(u32, u32)>,
    dynamic: bool,
    collector: Option<Collector>,
}

impl Span {
    /// A span named `name`, located at the caller.
    #[track_caller]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: Location::caller(),
            line_range: None,
            dynamic: false,
            collector: None,
        }
    }

    /// Record into `collector` instead of the thread's current one.
    pub fn with_collector(mut self, collector: &Collector) -> Self {
        self.collector = Some(collector.clone());
        self
    }

    /// Mark as configured at runtime, covering `start..=end` of the file.
    pub(crate) fn dynamic(mut self, start: u32, end: u32) -> Self {
        self.dynamic = true;
        self.line_range = Some((start, end));
        self
    }

    /// Start timing. Fails with [`Error::UnnamedSpan`] if the name is empty.
    pub fn enter(self) -> Result<ActiveSpan> {
        let Span {
            name,
            location,
            line_range,
            dynamic,
            collector,
        } = self;

        let pending = begin(collector, || {
            if name.trim().is_empty() {
                return Err(Error::UnnamedSpan);
            }
            let mut profile = ProfileRecord::new(name);
            profile.file_path = Some(location.file().to_string());
            match line_range {
                Some((start, end)) => {
                    profile.line_num = Some(start);
                    profile.end_line_num = Some(end);
                }
                None => profile.line_num = Some(location.line()),
            }
            profile.dynamic = dynamic;
            Ok(profile)
        })?;

        Ok(ActiveSpan { pending })
    }

    /// Enter, run `f`, exit. A panic in `f` is recorded before unwinding on.
    pub fn run<T>(self, f: impl FnOnce() -> T) -> Result<T> {
        let active = self.enter()?;
        let out = f();
        active.exit()?;
        Ok(out)
    }

    /// Like [`run`](Self::run) for fallible blocks; an `Err` marks the span
    /// as failed and is returned unchanged.
    pub fn try_run<T, E>(self, f: impl FnOnce() -> std::result::Result<T, E>) -> std::result::Result<T, E>
    where
        E: From<Error>,
    {
        let name = self.name.clone();
        let active = self.enter()?;
        let out = f();
        let recorded = active.finish(out.is_err());
        settle(out, recorded, &name)
    }
}

/// A span that is timing. Exits on [`exit`](Self::exit) or when dropped.
#[must_use = "the span exits as soon as it is dropped"]
pub struct ActiveSpan {
    pending: Option<Pending>,
}

impl ActiveSpan {
    /// Whether this span is actually recording.
    pub fn is_recording(&self) -> bool {
        self.pending.is_some()
    }

    /// Exit normally and register the profile.
    pub fn exit(self) -> Result<()> {
        self.finish(false)
    }

    /// Exit after the block failed.
    pub fn exit_with_error(self) -> Result<()> {
        self.finish(true)
    }

    fn finish(mut self, exception_raised: bool) -> Result<()> {
        match self.pending.take() {
            Some(pending) => finish(pending, exception_raised).map(|_| ()),
            None => Ok(()),
        }
    }
}

impl Drop for ActiveSpan {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            if let Err(e) = finish(pending, std::thread::panicking()) {
                tracing::warn!(error = %e, "failed to record span");
            }
        }
    }
}

/// Profile a block at the caller's location.
#[track_caller]
pub fn profile_block<T>(name: impl Into<String>, f: impl FnOnce() -> T) -> Result<T> {
    Span::new(name).run(f)
}

/// Wrap `f` so every call is profiled.
///
/// The profile's location is where `profile` was called, which is where the
/// wrapped function is declared for the usual `static`/field use.
#[track_caller]
pub fn profile<F>(f: F) -> Profiled<F> {
    let func_name = function_name::<F>();
    Profiled {
        f,
        name: None,
        func_name,
        location: Location::caller(),
        dynamic: false,
    }
}

/// A function-form span. Arguments are passed as one value; use a tuple for
/// several.
#[derive(Clone)]
pub struct Profiled<F> {
    f: F,
    name: Option<String>,
    func_name: String,
    location: &'static Location<'static>,
    dynamic: bool,
}

impl<F> std::fmt::Debug for Profiled<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Profiled")
            .field("name", &self.name())
            .field("func_name", &self.func_name)
            .field("location", &self.location)
            .finish()
    }
}

impl<F> Profiled<F> {
    /// Profile under `name` instead of the function name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Override the inferred function name.
    pub fn func_name(mut self, func_name: impl Into<String>) -> Self {
        self.func_name = func_name.into();
        self
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.func_name)
    }

    fn begin(&self) -> Option<Pending> {
        let started = begin(None, || {
            let mut profile = ProfileRecord::new(self.name());
            profile.func_name = Some(self.func_name.clone());
            profile.file_path = Some(self.location.file().to_string());
            profile.line_num = Some(self.location.line());
            profile.dynamic = self.dynamic;
            Ok(profile)
        });
        match started {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!(error = %e, name = self.name(), "failed to start profile");
                None
            }
        }
    }

    /// Call the wrapped function. A panic is recorded before unwinding on.
    pub fn call<A, T>(&self, args: A) -> T
    where
        F: Fn(A) -> T,
    {
        self.call_once(|| (self.f)(args))
    }

    /// Profile one run of `body` under this wrapper's name and location.
    pub(crate) fn call_once<T>(&self, body: impl FnOnce() -> T) -> T {
        let active = ActiveSpan {
            pending: self.begin(),
        };
        let out = body();
        if let Err(e) = active.exit() {
            tracing::warn!(error = %e, name = self.name(), "failed to record profile");
        }
        out
    }

    /// Call a fallible wrapped function; an `Err` marks the profile as failed
    /// and is returned unchanged.
    pub fn try_call<A, T, E>(&self, args: A) -> std::result::Result<T, E>
    where
        F: Fn(A) -> std::result::Result<T, E>,
        E: From<Error>,
    {
        let active = ActiveSpan {
            pending: self.begin(),
        };
        let out = (self.f)(args);
        let recorded = active.finish(out.is_err());
        settle(out, recorded, self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{QueryRecord, RequestRecord};

    fn scoped() -> Collector {
        mark_installed();
        let collector = Collector::new();
        collector.configure(Some(RequestRecord::new("GET", "/")), false);
        collector
    }

    fn run_queries(collector: &Collector, n: usize) {
        for i in 0..n {
            collector
                .register_query(QueryRecord::new(format!("SELECT {}", i)))
                .unwrap();
        }
    }

    fn checkout_total(items: u32) -> u32 {
        items * 3
    }

    #[test]
    fn test_block_span_records_queries_inside() {
        let collector = scoped();
        let _guard = collector.enter();
        run_queries(&collector, 2);

        let span = Span::new("checkout").enter().unwrap();
        assert!(span.is_recording());
        run_queries(&collector, 3);
        span.exit().unwrap();

        let profiles = collector.profiles().unwrap();
        assert_eq!(profiles.len(), 1);
        let profile = profiles.values().next().unwrap();
        assert_eq!(profile.name, "checkout");
        assert_eq!(profile.queries.len(), 3);
        assert_eq!(profile.request_id, collector.request_id());
        assert!(profile.file_path.as_deref().unwrap().ends_with("mod.rs"));
        assert!(profile.line_num.is_some());
        assert!(profile.is_context_profile());
        assert!(!profile.exception_raised);
    }

    #[test]
    fn test_unnamed_block_span_fails() {
        let collector = scoped();
        let _guard = collector.enter();
        assert!(matches!(Span::new("").enter(), Err(Error::UnnamedSpan)));
    }

    #[test]
    fn test_span_without_request_is_noop() {
        mark_installed();
        let collector = Collector::new();
        collector.configure(None, false);
        let _guard = collector.enter();

        let span = Span::new("idle").enter().unwrap();
        assert!(!span.is_recording());
        span.exit().unwrap();
        assert!(collector.profiles().unwrap().is_empty());
    }

    #[test]
    fn test_span_without_collector_is_noop() {
        mark_installed();
        let out = profile_block("detached", || 5).unwrap();
        assert_eq!(out, 5);
    }

    #[test]
    fn test_nested_spans_double_count() {
        let collector = scoped();
        let _guard = collector.enter();

        let outer = Span::new("outer").enter().unwrap();
        run_queries(&collector, 1);
        profile_block("inner", || run_queries(&collector, 2)).unwrap();
        outer.exit().unwrap();

        let profiles = collector.profiles().unwrap();
        let by_name = |n: &str| profiles.values().find(|p| p.name == n).unwrap().clone();
        assert_eq!(by_name("inner").queries.len(), 2);
        assert_eq!(by_name("outer").queries.len(), 3);
    }

    #[test]
    fn test_try_run_marks_error() {
        let collector = scoped();
        let _guard = collector.enter();

        let result: Result<()> = Span::new("failing").try_run(|| {
            run_queries(&collector, 1);
            Err(Error::Storage("boom".to_string()))
        });
        assert!(matches!(result, Err(Error::Storage(_))));

        let profile = collector.profiles().unwrap().into_values().next().unwrap();
        assert!(profile.exception_raised);
        assert_eq!(profile.queries.len(), 1);
    }

    #[test]
    fn test_try_run_keeps_own_error_over_bookkeeping() {
        let collector = scoped();
        let _guard = collector.enter();

        let result: Result<()> = Span::new("cleared").try_run(|| {
            collector.clear();
            Err(Error::Storage("app failure".to_string()))
        });
        assert!(matches!(result, Err(Error::Storage(msg)) if msg == "app failure"));
    }

    #[test]
    fn test_try_run_surfaces_bookkeeping_error_on_success() {
        let collector = scoped();
        let _guard = collector.enter();

        let result: Result<u8> = Span::new("cleared").try_run(|| {
            collector.clear();
            Ok(1)
        });
        assert!(matches!(result, Err(Error::NotConfigured(_))));
    }

    #[test]
    fn test_try_call_keeps_own_error_over_bookkeeping() {
        let collector = scoped();
        let _guard = collector.enter();

        let inner = collector.clone();
        let profiled = profile(move |fail: bool| -> Result<u8> {
            inner.clear();
            if fail {
                Err(Error::Storage("app failure".to_string()))
            } else {
                Ok(1)
            }
        })
        .named("clears");
        assert!(matches!(profiled.try_call(true), Err(Error::Storage(msg)) if msg == "app failure"));

        collector.configure(Some(RequestRecord::new("GET", "/")), false);
        assert!(matches!(profiled.try_call(false), Err(Error::NotConfigured(_))));
    }

    #[test]
    fn test_panic_inside_span_is_recorded() {
        let collector = scoped();
        let inner = collector.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            inner.in_scope(|| {
                let _span = Span::new("explodes").enter().unwrap();
                panic!("handler failed");
            })
        }));
        assert!(result.is_err());

        let profile = collector.profiles().unwrap().into_values().next().unwrap();
        assert_eq!(profile.name, "explodes");
        assert!(profile.exception_raised);
        assert!(profile.end_time.is_some());
    }

    #[test]
    fn test_function_profile_infers_name() {
        let collector = scoped();
        let _guard = collector.enter();

        let profiled = profile(checkout_total);
        assert_eq!(profiled.call(4), 12);
        assert_eq!(profiled.call(1), 3);

        let profiles = collector.profiles().unwrap();
        assert_eq!(profiles.len(), 2);
        for profile in profiles.values() {
            assert_eq!(profile.name, "checkout_total");
            assert_eq!(profile.func_name.as_deref(), Some("checkout_total"));
            assert!(profile.is_function_profile());
        }
    }

    #[test]
    fn test_function_profile_location_is_declaration_site() {
        let collector = scoped();
        let _guard = collector.enter();

        let declared_line = line!() + 1;
        let profiled = profile(|n: u32| n + 1).named("increment");
        let call = || profiled.call(1);
        assert_eq!(call(), 2);

        let profile = collector.profiles().unwrap().into_values().next().unwrap();
        assert_eq!(profile.name, "increment");
        assert_eq!(profile.line_num, Some(declared_line));
    }

    #[test]
    fn test_try_call_marks_error() {
        let collector = scoped();
        let _guard = collector.enter();

        let profiled = profile(|fail: bool| -> Result<u8> {
            if fail {
                Err(Error::Storage("nope".to_string()))
            } else {
                Ok(1)
            }
        })
        .named("maybe");
        assert!(profiled.try_call(false).is_ok());
        assert!(profiled.try_call(true).is_err());

        let flags: Vec<bool> = collector
            .profiles()
            .unwrap()
            .values()
            .map(|p| p.exception_raised)
            .collect();
        assert_eq!(flags, vec![false, true]);
    }

    #[test]
    fn test_function_name_strips_closures() {
        fn outer() -> String {
            let f = || ();
            fn name_of<F>(_: &F) -> String {
                function_name::<F>()
            }
            name_of(&f)
        }
        assert_eq!(outer(), "outer");
    }
}
