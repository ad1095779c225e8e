//! MessageExecutor (spec §4.4): a bounded worker pool with an admission
//! queue and per-request queue/service deadlines.
//!
//! Built on tokio tasks rather than OS threads, the way the retrieved
//! `doorway` worker pool bounds concurrency with a `Semaphore` plus a
//! bounded `mpsc` channel and a set of long-lived worker tasks. Here the
//! admission policy additionally reproduces `ThreadPoolExecutor`'s
//! core/max/queue staging: `corePoolSize` workers are started up front and
//! never exit; once the queue is also full, up to `maxPoolSize -
//! corePoolSize` ephemeral workers are spawned on demand and exit after
//! `keepAliveSeconds` idle.

use crate::context::{Outcome, RequestContext};
use crate::filter::FilterChain;
use crate::registry::HandlerRegistry;
use crate::stats::RequestStatistics;
use arc_swap::{ArcSwap, ArcSwapOption};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Callback invoked exactly once per submitted request (spec §8 invariant 1).
pub type OnComplete = Box<dyn FnOnce(Outcome) + Send>;

struct Task {
    ctx: Arc<RequestContext>,
    on_complete: OnComplete,
}

pub struct ExecutorConfig {
    pub core_pool_size: usize,
    pub max_pool_size: usize,
    pub keep_alive: Duration,
    pub queue_capacity: usize,
    pub avoid_payload_copy: bool,
}

impl From<&crate::config::Config> for ExecutorConfig {
    fn from(cfg: &crate::config::Config) -> Self {
        Self {
            core_pool_size: cfg.request_thread_core_pool_size,
            max_pool_size: cfg.request_thread_max_pool_size,
            keep_alive: Duration::from_secs(cfg.request_thread_keep_alive_sec),
            queue_capacity: cfg.thread_pool_queue_size,
            avoid_payload_copy: cfg.avoid_payload_copy,
        }
    }
}

/// Shared state read by every worker task and by `submit`'s admission check.
struct Shared {
    registry: HandlerRegistry,
    stats: Arc<RequestStatistics>,
    filters: ArcSwap<FilterChain>,
    request_timeout: ArcSwap<Duration>,
    /// Count of currently-live *extra* workers (spawned past `core_pool_size`).
    active: AtomicUsize,
    /// `max_pool_size - core_pool_size`: the extra-worker budget. The
    /// `core_pool_size` workers themselves are always running and are not
    /// counted against this budget.
    max_extra_workers: usize,
    keep_alive: Duration,
    avoid_payload_copy: bool,
    shutting_down: AtomicBool,
    /// `None` once `shutdown` has been called; dropping the last sender
    /// closes the channel so queued workers observe it and exit.
    sender: ArcSwapOption<mpsc::Sender<Task>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
}

/// Bounded request dispatcher. Cloning shares the same pool and queue.
#[derive(Clone)]
pub struct MessageExecutor {
    shared: Arc<Shared>,
}

impl MessageExecutor {
    pub fn new(
        config: ExecutorConfig,
        registry: HandlerRegistry,
        filters: FilterChain,
        stats: Arc<RequestStatistics>,
        request_timeout: Duration,
    ) -> Self {
        let core_pool_size = config.core_pool_size.max(1);
        let max_pool_size = config.max_pool_size.max(core_pool_size);

        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let shared = Arc::new(Shared {
            registry,
            stats,
            filters: ArcSwap::from_pointee(filters),
            request_timeout: ArcSwap::from_pointee(request_timeout),
            active: AtomicUsize::new(0),
            max_extra_workers: max_pool_size.saturating_sub(core_pool_size),
            keep_alive: config.keep_alive,
            avoid_payload_copy: config.avoid_payload_copy,
            shutting_down: AtomicBool::new(false),
            sender: ArcSwapOption::from_pointee(sender),
            receiver,
        });

        for id in 0..core_pool_size {
            spawn_core_worker(id, shared.clone());
        }

        Self { shared }
    }

    /// Admits `ctx` for execution. Never blocks the caller (spec §4.4: the
    /// rejection path must not back up the I/O dispatch thread). Handler
    /// lookup happens at dequeue time, not here, so a handler registered
    /// after submission but before dequeue is still found.
    pub fn submit(&self, ctx: Arc<RequestContext>, on_complete: OnComplete) {
        let task = Task { ctx, on_complete };

        let Some(sender) = self.shared.sender.load_full() else {
            (task.on_complete)(Outcome::Rejected);
            return;
        };

        match sender.try_send(task) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(task)) => {
                if self.shared.active.load(Ordering::Acquire) < self.shared.max_extra_workers {
                    spawn_extra_worker(self.shared.clone(), task);
                } else {
                    (task.on_complete)(Outcome::Rejected);
                }
            }
            Err(mpsc::error::TrySendError::Closed(task)) => {
                (task.on_complete)(Outcome::Rejected);
            }
        }
    }

    pub fn set_request_timeout(&self, timeout: Duration) {
        self.shared.request_timeout.store(Arc::new(timeout));
    }

    pub fn add_filters(&self, extra: impl IntoIterator<Item = Arc<dyn crate::filter::Filter>>) {
        let appended = self.shared.filters.load().appended(extra);
        self.shared.filters.store(Arc::new(appended));
    }

    /// Closes the submission channel so no further task is admitted, then
    /// lets every worker drain what's left: anything still sitting in the
    /// queue is completed with `Outcome::Rejected` instead of being run
    /// (spec §5 cancellation scope is queued work only). In-flight handlers
    /// are not touched and run to their own completion.
    pub fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::Release);
        self.shared.sender.store(None);
    }
}

/// Runs `task` normally, unless shutdown has been requested, in which case
/// it is completed with `Outcome::Rejected` without ever reaching a handler.
async fn dispatch(shared: &Arc<Shared>, task: Task) {
    if shared.shutting_down.load(Ordering::Acquire) {
        (task.on_complete)(Outcome::Rejected);
    } else {
        run_task(shared, task).await;
    }
}

/// A long-lived worker. Exits once the channel closes and drains, which
/// happens when `shutdown` drops the last sender.
fn spawn_core_worker(id: usize, shared: Arc<Shared>) {
    tokio::spawn(async move {
        tracing::debug!(worker = id, "core worker started");
        loop {
            let task = {
                let mut guard = shared.receiver.lock().await;
                guard.recv().await
            };
            match task {
                Some(task) => dispatch(&shared, task).await,
                None => break,
            }
        }
        tracing::debug!(worker = id, "core worker exiting: channel closed");
    });
}

/// An ephemeral worker spawned past `core_pool_size` (spec §4.4 admission
/// step 3), counted against `max_extra_workers`. Runs the task handed to it
/// directly, then keeps competing for further tasks off the shared queue
/// until idle for `keepAliveSeconds` or the channel closes, then exits.
fn spawn_extra_worker(shared: Arc<Shared>, first: Task) {
    shared.active.fetch_add(1, Ordering::AcqRel);
    tokio::spawn(async move {
        dispatch(&shared, first).await;
        loop {
            let next = {
                let mut guard = shared.receiver.lock().await;
                tokio::time::timeout(shared.keep_alive, guard.recv()).await
            };
            match next {
                Ok(Some(task)) => dispatch(&shared, task).await,
                Ok(None) | Err(_) => break,
            }
        }
        shared.active.fetch_sub(1, Ordering::AcqRel);
    });
}

async fn run_task(shared: &Arc<Shared>, task: Task) {
    let Task { ctx, on_complete } = task;
    let dequeued_at = Instant::now();

    if dequeued_at >= ctx.queue_deadline {
        record(shared, &ctx, dequeued_at, dequeued_at, Outcome::Timeout);
        on_complete(Outcome::Timeout);
        return;
    }

    let filters = shared.filters.load_full();
    if let crate::filter::Admission::Abort { reason, .. } = filters.enter(&ctx) {
        record(shared, &ctx, dequeued_at, Instant::now(), Outcome::HandlerError(reason.clone()));
        on_complete(Outcome::HandlerError(reason));
        return;
    }

    let Some(entry) = shared.registry.lookup(ctx.message_name()) else {
        filters.leave_err(&ctx, "no handler");
        record(shared, &ctx, dequeued_at, Instant::now(), Outcome::NoHandler);
        on_complete(Outcome::NoHandler);
        return;
    };

    let payload = if shared.avoid_payload_copy {
        ctx.envelope.payload.clone()
    } else {
        Bytes::copy_from_slice(&ctx.envelope.payload)
    };

    // Spawned as its own task so a service-deadline timeout below never
    // forcibly cancels the handler mid-execution: only the *result* is
    // allowed to be dropped late, the handler itself always runs to
    // completion on its own, per spec.
    let mut handler_task = tokio::spawn((entry.handler)(ctx.clone(), payload));

    let outcome = match ctx.service_deadline {
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, &mut handler_task).await {
                Ok(Ok(Ok(bytes))) => Outcome::Response(bytes),
                Ok(Ok(Err(msg))) => Outcome::HandlerError(msg),
                Ok(Err(_join_err)) => Outcome::HandlerError("handler panicked".to_string()),
                Err(_elapsed) => Outcome::Timeout,
            }
        }
        None => match handler_task.await {
            Ok(Ok(bytes)) => Outcome::Response(bytes),
            Ok(Err(msg)) => Outcome::HandlerError(msg),
            Err(_join_err) => Outcome::HandlerError("handler panicked".to_string()),
        },
    };

    match &outcome {
        Outcome::Response(_) => filters.leave_ok(&ctx, &outcome),
        Outcome::HandlerError(msg) => filters.leave_err(&ctx, msg),
        Outcome::Timeout => filters.leave_err(&ctx, "service deadline exceeded"),
        Outcome::Rejected | Outcome::NoHandler => {}
    }

    record(shared, &ctx, dequeued_at, Instant::now(), clone_outcome(&outcome));
    on_complete(outcome);
}

fn clone_outcome(outcome: &Outcome) -> Outcome {
    match outcome {
        Outcome::Response(b) => Outcome::Response(b.clone()),
        Outcome::Timeout => Outcome::Timeout,
        Outcome::HandlerError(s) => Outcome::HandlerError(s.clone()),
        Outcome::Rejected => Outcome::Rejected,
        Outcome::NoHandler => Outcome::NoHandler,
    }
}

fn record(shared: &Arc<Shared>, ctx: &RequestContext, dequeued_at: Instant, completed_at: Instant, outcome: Outcome) {
    let queue_wait = dequeued_at.saturating_duration_since(ctx.received_at);
    let service = completed_at.saturating_duration_since(dequeued_at);
    let name = ctx.message_name();
    match outcome {
        Outcome::Response(_) => shared.stats.record_ok(name, queue_wait, service),
        Outcome::Timeout => shared.stats.record_timeout(name, queue_wait, service),
        Outcome::HandlerError(_) => shared.stats.record_handler_error(name, queue_wait, service),
        Outcome::Rejected | Outcome::NoHandler => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, RequestId};
    use crate::filter::FilterChain;
    use bytes::Bytes;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::oneshot;

    fn executor(registry: HandlerRegistry, request_timeout: Duration, service_timeout: Option<Duration>) -> (MessageExecutor, Duration, Option<Duration>) {
        let exec = MessageExecutor::new(
            ExecutorConfig {
                core_pool_size: 1,
                max_pool_size: 2,
                keep_alive: Duration::from_secs(1),
                queue_capacity: 4,
                avoid_payload_copy: false,
            },
            registry,
            FilterChain::new(vec![]),
            Arc::new(RequestStatistics::with_shards(60_000, 1)),
            request_timeout,
        );
        (exec, request_timeout, service_timeout)
    }

    fn ctx(request_timeout: Duration, service_timeout: Option<Duration>, name: &str) -> Arc<RequestContext> {
        Arc::new(RequestContext::new(
            Envelope::request(RequestId::new(0, 1), name, Bytes::from_static(b"hi")),
            request_timeout,
            service_timeout,
        ))
    }

    #[tokio::test]
    async fn echo_handler_completes_exactly_once() {
        let registry = HandlerRegistry::new();
        registry.register("echo", "bytes", "bytes", Arc::new(|_ctx, payload| Box::pin(async move { Ok(payload) })));
        let (exec, rt, st) = executor(registry, Duration::from_secs(5), None);

        let (tx, rx) = oneshot::channel();
        exec.submit(
            ctx(rt, st, "echo"),
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );
        let outcome = rx.await.unwrap();
        match outcome {
            Outcome::Response(b) => assert_eq!(b, Bytes::from_static(b"hi")),
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unregistered_message_name_yields_no_handler() {
        let registry = HandlerRegistry::new();
        let (exec, rt, st) = executor(registry, Duration::from_secs(5), None);

        let (tx, rx) = oneshot::channel();
        exec.submit(
            ctx(rt, st, "unknown"),
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );
        assert!(matches!(rx.await.unwrap(), Outcome::NoHandler));
    }

    #[tokio::test]
    async fn service_deadline_converts_slow_handler_into_timeout() {
        let registry = HandlerRegistry::new();
        let handler_finished = Arc::new(StdMutex::new(false));
        let handler_finished2 = handler_finished.clone();
        registry.register(
            "slow",
            "bytes",
            "bytes",
            Arc::new(move |_ctx, _payload| {
                let handler_finished = handler_finished2.clone();
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    *handler_finished.lock().unwrap() = true;
                    Ok(Bytes::from_static(b"too-late"))
                })
            }),
        );
        let (exec, rt, _) = executor(registry, Duration::from_secs(5), Some(Duration::from_millis(50)));

        let (tx, rx) = oneshot::channel();
        let calls = Arc::new(StdMutex::new(0u32));
        let calls2 = calls.clone();
        exec.submit(
            ctx(rt, Some(Duration::from_millis(50)), "slow"),
            Box::new(move |outcome| {
                *calls2.lock().unwrap() += 1;
                let _ = tx.send(outcome);
            }),
        );
        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, Outcome::Timeout));
        // The abandoned handler keeps running in the background and must
        // reach completion; its late result must not trigger a second
        // on_complete call.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(*handler_finished.lock().unwrap(), "handler was cancelled instead of left to finish");
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn expired_queue_deadline_is_rejected_before_handler_runs() {
        let registry = HandlerRegistry::new();
        let ran = Arc::new(StdMutex::new(false));
        let ran2 = ran.clone();
        registry.register(
            "echo",
            "bytes",
            "bytes",
            Arc::new(move |_ctx, payload| {
                let ran = ran2.clone();
                Box::pin(async move {
                    *ran.lock().unwrap() = true;
                    Ok(payload)
                })
            }),
        );
        let (exec, _, _) = executor(registry, Duration::from_millis(1), None);
        let request_ctx = ctx(Duration::from_millis(1), None, "echo");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (tx, rx) = oneshot::channel();
        exec.submit(
            request_ctx,
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );
        assert!(matches!(rx.await.unwrap(), Outcome::Timeout));
        assert!(!*ran.lock().unwrap());
    }

    #[tokio::test]
    async fn admission_never_exceeds_core_plus_max_extra_workers() {
        // core_pool_size=1, max_pool_size=2, queue_capacity=1: one task can
        // sit in the queue, one more can run on a single extra worker, and
        // everything past that must be rejected outright. Submitted
        // back-to-back with no intervening `.await`, so all six `submit`
        // calls resolve before any worker task gets a chance to run.
        let registry = HandlerRegistry::new();
        registry.register(
            "slow",
            "bytes",
            "bytes",
            Arc::new(|_ctx, payload| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(payload)
                })
            }),
        );
        let exec = MessageExecutor::new(
            ExecutorConfig {
                core_pool_size: 1,
                max_pool_size: 2,
                keep_alive: Duration::from_secs(1),
                queue_capacity: 1,
                avoid_payload_copy: false,
            },
            registry,
            FilterChain::new(vec![]),
            Arc::new(RequestStatistics::with_shards(60_000, 1)),
            Duration::from_secs(5),
        );

        let mut receivers = Vec::new();
        for _ in 0..6 {
            let (tx, rx) = oneshot::channel();
            exec.submit(
                ctx(Duration::from_secs(5), None, "slow"),
                Box::new(move |outcome| {
                    let _ = tx.send(outcome);
                }),
            );
            receivers.push(rx);
        }

        let mut accepted = 0;
        let mut rejected = 0;
        for rx in receivers {
            match rx.await.unwrap() {
                Outcome::Response(_) => accepted += 1,
                Outcome::Rejected => rejected += 1,
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(accepted, 2, "queue slot (1) + one extra worker (1)");
        assert_eq!(rejected, 4);
    }

    #[tokio::test]
    async fn shutdown_rejects_queued_task_without_running_handler() {
        let registry = HandlerRegistry::new();
        let ran = Arc::new(StdMutex::new(false));
        let ran2 = ran.clone();
        registry.register(
            "echo",
            "bytes",
            "bytes",
            Arc::new(move |_ctx, payload| {
                let ran = ran2.clone();
                Box::pin(async move {
                    *ran.lock().unwrap() = true;
                    Ok(payload)
                })
            }),
        );
        let (exec, rt, st) = executor(registry, Duration::from_secs(5), None);
        exec.shutdown();

        let (tx, rx) = oneshot::channel();
        exec.submit(
            ctx(rt, st, "echo"),
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );
        assert!(matches!(rx.await.unwrap(), Outcome::Rejected));
        assert!(!*ran.lock().unwrap());
    }
}
