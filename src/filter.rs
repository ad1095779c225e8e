//! FilterChain (spec §4.2): ordered before/after interceptors wrapping
//! each handler invocation.

use crate::context::{Outcome, RequestContext};
use std::sync::Arc;

/// A single interceptor. `on_request` runs before the handler; exactly one
/// of `on_response`/`on_error` runs after, in reverse registration order.
///
/// `on_request` returning `Err` aborts the chain: the handler is skipped,
/// and `on_error` runs for every filter that already entered (spec §4.2).
pub trait Filter: Send + Sync {
    fn on_request(&self, ctx: &RequestContext) -> Result<(), String> {
        let _ = ctx;
        Ok(())
    }

    fn on_response(&self, ctx: &RequestContext, outcome: &Outcome) {
        let _ = (ctx, outcome);
    }

    fn on_error(&self, ctx: &RequestContext, error: &str) {
        let _ = (ctx, error);
    }
}

/// The decision from running the `on_request` half of the chain.
pub enum Admission {
    Proceed,
    Abort { aborted_at: usize, reason: String },
}

/// An ordered, append-only list of filters. Built once, then shared
/// read-only across connections (spec §5: "copy-on-write whole-structure
/// replacement" for read-mostly server state).
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Arc<Vec<Arc<dyn Filter>>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Arc<dyn Filter>>) -> Self {
        Self {
            filters: Arc::new(filters),
        }
    }

    /// Returns a new chain with `extra` appended after the existing
    /// filters, without mutating `self` — callers swap the whole chain in,
    /// matching `MessageExecutor::addFilters`'s append semantics.
    pub fn appended(&self, extra: impl IntoIterator<Item = Arc<dyn Filter>>) -> Self {
        let mut filters = (*self.filters).clone();
        filters.extend(extra);
        Self::new(filters)
    }

    /// Runs `on_request` for each filter in order. On the first abort,
    /// `on_error` is invoked for every filter that already ran, in reverse
    /// order, and `Admission::Abort` is returned.
    pub fn enter(&self, ctx: &RequestContext) -> Admission {
        for (i, filter) in self.filters.iter().enumerate() {
            if let Err(reason) = filter.on_request(ctx) {
                for prior in self.filters[..=i].iter().rev() {
                    prior.on_error(ctx, &reason);
                }
                return Admission::Abort { aborted_at: i, reason };
            }
        }
        Admission::Proceed
    }

    /// Runs `on_response` for every filter in reverse registration order.
    /// Called after a successful handler invocation (not after an abort,
    /// which instead goes through `on_error` inside `enter`).
    pub fn leave_ok(&self, ctx: &RequestContext, outcome: &Outcome) {
        for filter in self.filters.iter().rev() {
            filter.on_response(ctx, outcome);
        }
    }

    /// Runs `on_error` for every filter in reverse order, for failures that
    /// occur after the chain was fully entered (handler error, timeout).
    pub fn leave_err(&self, ctx: &RequestContext, error: &str) {
        for filter in self.filters.iter().rev() {
            filter.on_error(ctx, error);
        }
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, RequestId};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn ctx() -> RequestContext {
        RequestContext::new(
            Envelope::request(RequestId::new(0, 0), "m", Bytes::new()),
            Duration::from_secs(1),
            None,
        )
    }

    struct Recorder(Arc<Mutex<Vec<&'static str>>>, &'static str);
    impl Filter for Recorder {
        fn on_request(&self, _ctx: &RequestContext) -> Result<(), String> {
            self.0.lock().push(self.1);
            Ok(())
        }
        fn on_response(&self, _ctx: &RequestContext, _outcome: &Outcome) {
            self.0.lock().push(self.1);
        }
    }

    struct Aborting;
    impl Filter for Aborting {
        fn on_request(&self, _ctx: &RequestContext) -> Result<(), String> {
            Err("nope".into())
        }
    }

    #[test]
    fn request_then_response_run_in_mirrored_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = FilterChain::new(vec![
            Arc::new(Recorder(log.clone(), "a")),
            Arc::new(Recorder(log.clone(), "b")),
        ]);
        let ctx = ctx();
        assert!(matches!(chain.enter(&ctx), Admission::Proceed));
        chain.leave_ok(&ctx, &Outcome::Response(Bytes::new()));
        assert_eq!(*log.lock(), vec!["a", "b", "b", "a"]);
    }

    #[test]
    fn abort_runs_on_error_for_entered_filters_only() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = FilterChain::new(vec![
            Arc::new(Recorder(log.clone(), "a")),
            Arc::new(Aborting),
            Arc::new(Recorder(log.clone(), "c")),
        ]);
        let ctx = ctx();
        let admission = chain.enter(&ctx);
        assert!(matches!(admission, Admission::Abort { aborted_at: 1, .. }));
        // "c" never entered, so it never sees on_error either.
        assert_eq!(*log.lock(), vec!["a"]);
    }

    #[test]
    fn appended_does_not_mutate_original() {
        let chain = FilterChain::new(vec![]);
        let extended = chain.appended(vec![Arc::new(Aborting) as Arc<dyn Filter>]);
        assert_eq!(chain.len(), 0);
        assert_eq!(extended.len(), 1);
    }
}
