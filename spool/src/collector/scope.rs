//! Ambient "current collector" for the running thread.
//!
//! The SQL shim and profiling spans find the request they belong to through
//! [`Collector::current`]. [`Collector::enter`] installs a collector and the
//! returned guard uninstalls exactly that entry when dropped, so guards
//! dropped out of order never leave the wrong request current.
//!
//! The guard is `!Send`. Async code should not hold it across an `.await`
//! at all: wrap the future with [`Collector::instrument`] instead, which
//! installs the collector only for the duration of each poll. Two requests
//! interleaved on one worker thread then never see each other's collector.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use super::Collector;

thread_local! {
    static CURRENT: RefCell<Vec<(u64, Collector)>> = const { RefCell::new(Vec::new()) };
    static NEXT_ENTRY: Cell<u64> = const { Cell::new(0) };
}

/// Keeps a collector installed as current until dropped.
#[must_use = "the collector is uninstalled as soon as the guard is dropped"]
pub struct ScopeGuard {
    entry: u64,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        CURRENT.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|(entry, _)| *entry == self.entry) {
                stack.remove(pos);
            }
        });
    }
}

/// A future that runs with a collector installed during every poll.
///
/// Created by [`Collector::instrument`].
#[must_use = "futures do nothing unless polled"]
pub struct Instrumented<F> {
    inner: Pin<Box<F>>,
    collector: Collector,
}

impl<F> Instrumented<F> {
    pub fn collector(&self) -> &Collector {
        &self.collector
    }
}

impl<F: Future> Future for Instrumented<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let _guard = this.collector.enter();
        this.inner.as_mut().poll(cx)
    }
}

impl Collector {
    /// Install this collector as the thread's current one.
    pub fn enter(&self) -> ScopeGuard {
        let entry = NEXT_ENTRY.with(|next| {
            let entry = next.get();
            next.set(entry.wrapping_add(1));
            entry
        });
        CURRENT.with(|stack| stack.borrow_mut().push((entry, self.clone())));
        ScopeGuard {
            entry,
            _not_send: PhantomData,
        }
    }

    /// Run `f` with this collector installed.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.enter();
        f()
    }

    /// Wrap `fut` so this collector is current whenever it is polled, and
    /// only then.
    pub fn instrument<F: Future>(&self, fut: F) -> Instrumented<F> {
        Instrumented {
            inner: Box::pin(fut),
            collector: self.clone(),
        }
    }

    /// The innermost installed collector, if any.
    pub fn current() -> Option<Collector> {
        CURRENT.with(|stack| stack.borrow().last().map(|(_, c)| c.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{QueryRecord, RequestRecord};
    use std::task::Waker;

    fn configured(path: &str) -> Collector {
        let collector = Collector::new();
        collector.configure(Some(RequestRecord::new("GET", path)), false);
        collector
    }

    /// Returns `Pending` once, then completes.
    struct YieldOnce(bool);

    impl Future for YieldOnce {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.0 {
                Poll::Ready(())
            } else {
                self.0 = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    async fn record_after_yield(sql: &'static str) {
        YieldOnce(false).await;
        Collector::current()
            .unwrap()
            .register_query(QueryRecord::new(sql))
            .unwrap();
    }

    fn sql_of(collector: &Collector) -> Vec<String> {
        collector
            .queries()
            .unwrap()
            .into_values()
            .map(|q| q.query)
            .collect()
    }

    #[test]
    fn test_no_current_outside_scope() {
        assert!(Collector::current().is_none());
    }

    #[test]
    fn test_enter_and_drop() {
        let collector = configured("/");
        {
            let _guard = collector.enter();
            let current = Collector::current().unwrap();
            current.register_query(QueryRecord::new("SELECT 1")).unwrap();
        }
        assert!(Collector::current().is_none());
        assert_eq!(collector.queries().unwrap().len(), 1);
    }

    #[test]
    fn test_nested_scopes_restore_outer() {
        let outer = configured("/outer");
        let inner = configured("/inner");

        outer.in_scope(|| {
            inner.in_scope(|| {
                let id = Collector::current().unwrap().request_id();
                assert_eq!(id, inner.request_id());
            });
            let id = Collector::current().unwrap().request_id();
            assert_eq!(id, outer.request_id());
        });
    }

    #[test]
    fn test_out_of_order_drop_keeps_live_guard_current() {
        let a = configured("/a");
        let b = configured("/b");

        let guard_a = a.enter();
        let guard_b = b.enter();
        drop(guard_a);
        assert_eq!(Collector::current().unwrap().request_id(), b.request_id());

        drop(guard_b);
        assert!(Collector::current().is_none());
    }

    #[test]
    fn test_same_collector_entered_twice() {
        let a = configured("/a");
        let first = a.enter();
        let second = a.enter();
        drop(first);
        assert_eq!(Collector::current().unwrap().request_id(), a.request_id());
        drop(second);
        assert!(Collector::current().is_none());
    }

    #[test]
    fn test_interleaved_tasks_on_one_thread_are_isolated() {
        let a = configured("/a");
        let b = configured("/b");
        let mut task_a = a.instrument(record_after_yield("SELECT 'a'"));
        let mut task_b = b.instrument(record_after_yield("SELECT 'b'"));

        let mut cx = Context::from_waker(Waker::noop());
        assert!(Pin::new(&mut task_a).poll(&mut cx).is_pending());
        assert!(Pin::new(&mut task_b).poll(&mut cx).is_pending());
        assert!(Collector::current().is_none());
        assert!(Pin::new(&mut task_a).poll(&mut cx).is_ready());
        assert!(Pin::new(&mut task_b).poll(&mut cx).is_ready());

        assert_eq!(sql_of(&a), vec!["SELECT 'a'"]);
        assert_eq!(sql_of(&b), vec!["SELECT 'b'"]);
        assert!(Collector::current().is_none());
    }

    #[test]
    fn test_scope_is_per_thread() {
        let collector = Collector::new();
        collector.configure(None, false);
        let _guard = collector.enter();

        let seen_elsewhere = std::thread::spawn(|| Collector::current().is_some())
            .join()
            .unwrap();
        assert!(!seen_elsewhere);
        assert!(Collector::current().is_some());
    }
}
