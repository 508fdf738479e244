//! Ambient task context for diagnostics
//!
//! Every worker runs many transactions through one cooperative event
//! loop. The task context is the per-worker "what is the code working
//! on" slot: error reporters and log lines read it to tag their output
//! with the originating transaction instead of the service that happened
//! to be executing. Callback boundaries swap the slot and restore it on
//! exit, including unwinds.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// A description of the transaction the current code works on.
///
/// Implementors provide two rendering modes: a compact tag for log lines
/// and a multi-line annotation for error pages and level-3 reports.
pub trait TaskContext: Send + Sync + 'static {
    /// Compact single-line tag, suitable for prefixing log lines.
    fn brief(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;

    /// Multi-line annotation with everything worth reporting.
    ///
    /// Defaults to the brief rendering.
    fn detail(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.brief(f)
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<dyn TaskContext>>> = const { RefCell::new(None) };
}

/// The context of the code currently running on this worker, if known.
pub fn current() -> Option<Arc<dyn TaskContext>> {
    CURRENT.with(|slot| slot.borrow().clone())
}

/// Switches to a known context; the directional twin of [`leaving`].
fn entering(ctx: Arc<dyn TaskContext>) {
    CURRENT.with(|slot| *slot.borrow_mut() = Some(ctx));
    trace!(context = %CurrentBrief, "entering");
}

/// Forgets the current context.
fn leaving() {
    if current().is_some() {
        trace!(context = %CurrentBrief, "leaving");
        CURRENT.with(|slot| *slot.borrow_mut() = None);
    }
}

/// Replaces the current context.
///
/// A no-op when the replacement is the context already installed.
pub fn reset(ctx: Option<Arc<dyn TaskContext>>) {
    match ctx {
        None => leaving(),
        Some(new) => {
            let unchanged = CURRENT
                .with(|slot| matches!(&*slot.borrow(), Some(cur) if Arc::ptr_eq(cur, &new)));
            if !unchanged {
                entering(new);
            }
        }
    }
}

/// Renders the brief tag of the current context (or nothing).
pub struct CurrentBrief;

impl fmt::Display for CurrentBrief {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match current() {
            Some(ctx) => ctx.brief(f),
            None => Ok(()),
        }
    }
}

/// Renders the detailed annotation of the current context (or nothing).
pub struct CurrentDetail;

impl fmt::Display for CurrentDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match current() {
            Some(ctx) => ctx.detail(f),
            None => Ok(()),
        }
    }
}

/// Scoped context switch: captures the current context at construction
/// and restores it when dropped, on normal and unwinding exits alike.
///
/// Asynchronous continuations must create one of these before touching
/// transaction state so their diagnostics name the right transaction.
pub struct ContextGuard {
    saved: Option<Arc<dyn TaskContext>>,
}

impl ContextGuard {
    /// Installs `ctx` and remembers the previously current context.
    pub fn enter(ctx: Option<Arc<dyn TaskContext>>) -> Self {
        let saved = current();
        reset(ctx);
        Self { saved }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        reset(self.saved.take());
    }
}

/// Runs `f` with `ctx` installed, restoring the outer context on return
/// or unwind.
pub fn run_in<R>(ctx: Arc<dyn TaskContext>, f: impl FnOnce() -> R) -> R {
    let _guard = ContextGuard::enter(Some(ctx));
    f()
}

/// Runs an application callback with the *callback's* context installed.
///
/// A service invoking application code must not let failures inside the
/// callback get tagged with the service's own context; this helper makes
/// the swap explicit at the boundary.
pub fn call_service_back<R>(
    callback_context: Option<Arc<dyn TaskContext>>,
    f: impl FnOnce() -> R,
) -> R {
    let _guard = ContextGuard::enter(callback_context);
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    struct Tag(&'static str);

    impl TaskContext for Tag {
        fn brief(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    fn brief_of(ctx: &Arc<dyn TaskContext>) -> String {
        struct Render<'a>(&'a dyn TaskContext);
        impl fmt::Display for Render<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.brief(f)
            }
        }
        Render(ctx.as_ref()).to_string()
    }

    #[test]
    fn test_reset_replaces_current() {
        reset(None);
        assert!(current().is_none());

        let ctx: Arc<dyn TaskContext> = Arc::new(Tag("tx1"));
        reset(Some(ctx));
        assert_eq!(brief_of(&current().unwrap()), "tx1");

        reset(None);
        assert!(current().is_none());
    }

    #[test]
    fn test_guard_restores_on_return() {
        reset(None);
        let outer: Arc<dyn TaskContext> = Arc::new(Tag("outer"));
        reset(Some(outer.clone()));

        {
            let _guard = ContextGuard::enter(Some(Arc::new(Tag("inner"))));
            assert_eq!(brief_of(&current().unwrap()), "inner");
        }

        assert!(Arc::ptr_eq(&current().unwrap(), &outer));
        reset(None);
    }

    #[test]
    fn test_guard_restores_on_unwind() {
        reset(None);
        let outer: Arc<dyn TaskContext> = Arc::new(Tag("outer"));
        reset(Some(outer.clone()));

        let result = catch_unwind(AssertUnwindSafe(|| {
            run_in(Arc::new(Tag("doomed")), || panic!("boom"));
        }));
        assert!(result.is_err());

        assert!(Arc::ptr_eq(&current().unwrap(), &outer));
        reset(None);
    }

    #[test]
    fn test_run_in_returns_value() {
        reset(None);
        let answer = run_in(Arc::new(Tag("tx")), || {
            assert_eq!(brief_of(&current().unwrap()), "tx");
            42
        });
        assert_eq!(answer, 42);
        assert!(current().is_none());
    }

    #[test]
    fn test_service_callback_installs_callback_context() {
        reset(None);
        let service: Arc<dyn TaskContext> = Arc::new(Tag("service"));
        reset(Some(service.clone()));

        let cb_ctx: Arc<dyn TaskContext> = Arc::new(Tag("client-tx"));
        call_service_back(Some(cb_ctx), || {
            assert_eq!(brief_of(&current().unwrap()), "client-tx");
        });

        assert!(Arc::ptr_eq(&current().unwrap(), &service));
        reset(None);
    }

    #[test]
    fn test_service_callback_with_no_context() {
        reset(None);
        let service: Arc<dyn TaskContext> = Arc::new(Tag("service"));
        reset(Some(service));

        call_service_back(None, || {
            assert!(current().is_none());
        });

        assert!(current().is_some());
        reset(None);
    }
}
