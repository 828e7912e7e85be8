//! # Request Gate
//!
//! Serializes outbound calls to one external source so that no more than `limit` calls go
//! out per trailing window. Excess calls wait in a FIFO queue and are released by a single
//! drain loop as slots free up.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle --enqueue--> Draining --queue empty--> Idle
//!                   Draining --window full--> Waiting --oldest ages out--> Draining
//! ```
//!
//! The drain loop is the only task that pops the queue or records dispatches. The guard
//! flag (the gate's phase) lives under the same lock as the queue, so an `enqueue` racing
//! with the loop going idle either sees the loop still running or starts a new one, never
//! both and never neither.
//!
//! ## Failure semantics
//! An operation's error (or its timeout) settles that operation's handle only. The loop
//! moves on to the next request. Nothing is retried.

use super::window::RateWindow;
use super::{GateState, GateStats, RateLimitPolicy, Ticket};
use crate::core::error::{MarketDataError, MarketDataResult};
use crate::observability::metrics::{
    GATE_CANCELLED_TOTAL, GATE_DISPATCHED_TOTAL, GATE_ENQUEUED_TOTAL, GATE_FAILED_TOTAL,
    GATE_QUEUE_WAIT_SECONDS, GATE_TIMEOUTS_TOTAL,
};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

/// How a dispatched operation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

/// Type-erased deferred operation plus the channel its caller awaits
#[async_trait]
trait Dispatch: Send {
    /// The caller dropped its handle before dispatch
    fn is_abandoned(&self) -> bool;

    /// Settle the handle without running the operation
    fn settle(self: Box<Self>, error: MarketDataError);

    /// Run the operation under its deadline and settle the handle with the outcome
    async fn run(self: Box<Self>, deadline: Duration, label: String) -> DispatchOutcome;
}

struct PendingOperation<T, F> {
    operation: F,
    result_tx: oneshot::Sender<MarketDataResult<T>>,
}

#[async_trait]
impl<T, F, Fut> Dispatch for PendingOperation<T, F>
where
    T: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = MarketDataResult<T>> + Send + 'static,
{
    fn is_abandoned(&self) -> bool {
        self.result_tx.is_closed()
    }

    fn settle(self: Box<Self>, error: MarketDataError) {
        let _ = self.result_tx.send(Err(error));
    }

    async fn run(self: Box<Self>, deadline: Duration, label: String) -> DispatchOutcome {
        let PendingOperation {
            operation,
            result_tx,
        } = *self;

        // Building the future runs caller code too, so it happens under the unwind guard
        let guarded =
            AssertUnwindSafe(async move { timeout(deadline, operation()).await }).catch_unwind();
        let (result, outcome) = match guarded.await {
            Ok(Ok(Ok(value))) => (Ok(value), DispatchOutcome::Succeeded),
            Ok(Ok(Err(error))) => (Err(error), DispatchOutcome::Failed),
            Ok(Err(_elapsed)) => (
                Err(MarketDataError::timeout(label, deadline.as_millis() as u64)),
                DispatchOutcome::TimedOut,
            ),
            Err(_panic) => (
                Err(MarketDataError::transient(label, "operation panicked")),
                DispatchOutcome::Failed,
            ),
        };

        // The caller may have stopped waiting; the dispatch still counted
        let _ = result_tx.send(result);
        outcome
    }
}

/// A request waiting for a slot
struct QueuedRequest {
    ticket: Ticket,
    enqueued_at: Instant,
    deadline: Duration,
    dispatch: Box<dyn Dispatch>,
}

/// State guarded by the gate lock
struct GateShared {
    queue: VecDeque<QueuedRequest>,
    window: RateWindow,
    phase: GateState,
    accepting: bool,
}

#[derive(Debug, Default)]
struct GateCounters {
    enqueued: AtomicU64,
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    abandoned: AtomicU64,
}

struct GateInner {
    name: String,
    policy: RateLimitPolicy,
    shared: Mutex<GateShared>,
    next_ticket: AtomicU64,
    counters: GateCounters,
}

enum Step {
    Wait(Duration),
    Dispatch(QueuedRequest),
}

/// Keeps the gate usable if the drain loop ends without reaching an empty queue.
///
/// After an unwind the loop is restarted for whatever is still queued. When the task is
/// dropped instead (the runtime is shutting down) the queued requests are settled with
/// `GateClosed`.
struct DrainGuard {
    inner: Arc<GateInner>,
    finished: bool,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let mut shared = self.inner.shared.lock();
        shared.phase = GateState::Idle;
        if shared.queue.is_empty() {
            return;
        }

        if std::thread::panicking() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                shared.phase = GateState::Draining;
                drop(shared);
                error!(source = %self.inner.name, "Drain loop unwound, restarting it");
                runtime.spawn(RequestGate::drain(self.inner.clone()));
                return;
            }
        }

        let stranded: Vec<QueuedRequest> = shared.queue.drain(..).collect();
        drop(shared);
        warn!(
            source = %self.inner.name,
            stranded = stranded.len(),
            "Drain loop stopped with requests still queued"
        );
        for request in stranded {
            request
                .dispatch
                .settle(MarketDataError::gate_closed(self.inner.name.clone()));
        }
    }
}

/// Rate-limited FIFO gate for one external source.
///
/// Cloning is cheap and yields another handle onto the same queue and window.
#[derive(Clone)]
pub struct RequestGate {
    inner: Arc<GateInner>,
}

impl RequestGate {
    /// Create a gate for the named source
    pub fn new<S: Into<String>>(name: S, policy: RateLimitPolicy) -> Self {
        let window = RateWindow::new(policy.limit, policy.window);

        Self {
            inner: Arc::new(GateInner {
                name: name.into(),
                policy,
                shared: Mutex::new(GateShared {
                    queue: VecDeque::new(),
                    window,
                    phase: GateState::Idle,
                    accepting: true,
                }),
                next_ticket: AtomicU64::new(1),
                counters: GateCounters::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.inner.policy
    }

    /// Queue an operation under the policy's default deadline.
    ///
    /// Must be called from within a tokio runtime: the first enqueue on an idle gate
    /// spawns its drain loop.
    pub fn enqueue<T, F, Fut>(&self, operation: F) -> GateHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = MarketDataResult<T>> + Send + 'static,
    {
        self.enqueue_with_timeout(operation, self.inner.policy.operation_timeout)
    }

    /// Queue an operation with an explicit deadline.
    ///
    /// The deadline covers the operation's execution, not its time in the queue.
    pub fn enqueue_with_timeout<T, F, Fut>(&self, operation: F, deadline: Duration) -> GateHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = MarketDataResult<T>> + Send + 'static,
    {
        let ticket = Ticket(self.inner.next_ticket.fetch_add(1, Ordering::Relaxed));
        let (result_tx, result_rx) = oneshot::channel();
        let handle = GateHandle {
            ticket,
            result_rx,
            gate: self.clone(),
        };

        let dispatch = Box::new(PendingOperation {
            operation,
            result_tx,
        });

        let start_drain = {
            let mut shared = self.inner.shared.lock();

            if !shared.accepting {
                drop(shared);
                warn!(source = %self.inner.name, %ticket, "Gate closed, rejecting request");
                dispatch.settle(MarketDataError::gate_closed(self.inner.name.clone()));
                return handle;
            }

            shared.queue.push_back(QueuedRequest {
                ticket,
                enqueued_at: Instant::now(),
                deadline,
                dispatch,
            });

            debug!(
                source = %self.inner.name,
                %ticket,
                queue_depth = shared.queue.len(),
                "Request queued"
            );

            let idle = shared.phase == GateState::Idle;
            if idle {
                shared.phase = GateState::Draining;
            }
            idle
        };

        self.inner.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(GATE_ENQUEUED_TOTAL, "source" => self.inner.name.clone()).increment(1);

        if start_drain {
            tokio::spawn(Self::drain(self.inner.clone()));
        }

        handle
    }

    /// Remove a request that has not been dispatched yet.
    ///
    /// Its handle resolves to `MarketDataError::Cancelled`. Returns `false` when the
    /// request already left the queue.
    pub fn cancel(&self, ticket: Ticket) -> bool {
        let removed = {
            let mut shared = self.inner.shared.lock();
            shared
                .queue
                .iter()
                .position(|request| request.ticket == ticket)
                .and_then(|index| shared.queue.remove(index))
        };

        match removed {
            Some(request) => {
                request
                    .dispatch
                    .settle(MarketDataError::Cancelled { ticket: ticket.value() });
                self.inner.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(GATE_CANCELLED_TOTAL, "source" => self.inner.name.clone())
                    .increment(1);
                debug!(source = %self.inner.name, %ticket, "Queued request cancelled");
                true
            }
            None => false,
        }
    }

    /// The single drain loop. Exits when the queue is empty, leaving the gate idle.
    async fn drain(inner: Arc<GateInner>) {
        let mut guard = DrainGuard {
            inner,
            finished: false,
        };
        let inner = guard.inner.clone();

        loop {
            let step = {
                let mut shared = inner.shared.lock();

                // Requests whose callers went away never consume a slot
                while shared
                    .queue
                    .front()
                    .map_or(false, |request| request.dispatch.is_abandoned())
                {
                    if let Some(request) = shared.queue.pop_front() {
                        inner.counters.abandoned.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!(GATE_CANCELLED_TOTAL, "source" => inner.name.clone())
                            .increment(1);
                        debug!(source = %inner.name, ticket = %request.ticket, "Skipping abandoned request");
                    }
                }

                let now = Instant::now();
                if !shared.window.has_capacity(now) && !shared.queue.is_empty() {
                    shared.phase = GateState::Waiting;
                    Step::Wait(shared.window.wait_time(now))
                } else {
                    match shared.queue.pop_front() {
                        Some(request) => {
                            shared.window.record(now);
                            shared.phase = GateState::Draining;
                            Step::Dispatch(request)
                        }
                        None => {
                            shared.phase = GateState::Idle;
                            guard.finished = true;
                            return;
                        }
                    }
                }
            };

            match step {
                Step::Wait(wait) => {
                    info!(
                        source = %inner.name,
                        wait_ms = wait.as_millis() as u64,
                        "Rate limit reached, waiting for the window to open"
                    );
                    sleep(wait).await;
                }
                Step::Dispatch(request) => {
                    Self::dispatch(&inner, request).await;

                    let delay = inner.policy.inter_request_delay;
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                }
            }
        }
    }

    async fn dispatch(inner: &GateInner, request: QueuedRequest) {
        let QueuedRequest {
            ticket,
            enqueued_at,
            deadline,
            dispatch,
        } = request;

        let queue_wait = enqueued_at.elapsed();
        inner.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(GATE_DISPATCHED_TOTAL, "source" => inner.name.clone()).increment(1);
        metrics::histogram!(GATE_QUEUE_WAIT_SECONDS, "source" => inner.name.clone())
            .record(queue_wait.as_secs_f64());

        debug!(
            source = %inner.name,
            %ticket,
            wait_ms = queue_wait.as_millis() as u64,
            "Dispatching request"
        );

        let label = format!("{}#{}", inner.name, ticket);
        match dispatch.run(deadline, label).await {
            DispatchOutcome::Succeeded => {
                inner.counters.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            DispatchOutcome::Failed => {
                inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(GATE_FAILED_TOTAL, "source" => inner.name.clone()).increment(1);
                debug!(source = %inner.name, %ticket, "Request failed");
            }
            DispatchOutcome::TimedOut => {
                inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                inner.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(GATE_FAILED_TOTAL, "source" => inner.name.clone()).increment(1);
                metrics::counter!(GATE_TIMEOUTS_TOTAL, "source" => inner.name.clone()).increment(1);
                warn!(
                    source = %inner.name,
                    %ticket,
                    deadline_ms = deadline.as_millis() as u64,
                    "Request timed out"
                );
            }
        }
    }

    /// Requests waiting for dispatch
    pub fn queue_depth(&self) -> usize {
        self.inner.shared.lock().queue.len()
    }

    /// Dispatches inside the trailing window right now
    pub fn in_window(&self) -> usize {
        self.inner.shared.lock().window.in_window(Instant::now())
    }

    /// Dispatch timestamps retained by the window, oldest first
    pub fn dispatch_history(&self) -> Vec<Instant> {
        self.inner.shared.lock().window.history().collect()
    }

    pub fn state(&self) -> GateState {
        self.inner.shared.lock().phase
    }

    pub fn stats(&self) -> GateStats {
        let counters = &self.inner.counters;
        GateStats {
            enqueued: counters.enqueued.load(Ordering::Relaxed),
            dispatched: counters.dispatched.load(Ordering::Relaxed),
            succeeded: counters.succeeded.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            timed_out: counters.timed_out.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
            abandoned: counters.abandoned.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting new requests. Queued requests still drain.
    pub fn start_shutdown(&self) {
        self.inner.shared.lock().accepting = false;
        info!(source = %self.inner.name, "Request gate shutdown initiated");
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.shared.lock().accepting
    }

    /// Wait until the queue is empty and the drain loop has gone idle
    pub async fn wait_for_empty(&self, timeout_duration: Duration) -> MarketDataResult<()> {
        let start = Instant::now();

        while start.elapsed() < timeout_duration {
            {
                let shared = self.inner.shared.lock();
                if shared.queue.is_empty() && shared.phase == GateState::Idle {
                    debug!(source = %self.inner.name, "Request gate is empty");
                    return Ok(());
                }
            }

            sleep(Duration::from_millis(50)).await;
        }

        warn!(
            source = %self.inner.name,
            remaining = self.queue_depth(),
            "Timeout waiting for request gate to empty"
        );
        Err(MarketDataError::timeout(
            format!("{} shutdown", self.inner.name),
            timeout_duration.as_millis() as u64,
        ))
    }
}

impl std::fmt::Debug for RequestGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGate")
            .field("name", &self.inner.name)
            .field("policy", &self.inner.policy)
            .field("queue_depth", &self.queue_depth())
            .field("state", &self.state())
            .finish()
    }
}

/// Awaitable result of an enqueued operation.
///
/// Dropping the handle before dispatch abandons the request.
pub struct GateHandle<T> {
    ticket: Ticket,
    result_rx: oneshot::Receiver<MarketDataResult<T>>,
    gate: RequestGate,
}

impl<T> GateHandle<T> {
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// Cancel the request if it is still queued
    pub fn cancel(&self) -> bool {
        self.gate.cancel(self.ticket)
    }
}

impl<T> Future for GateHandle<T> {
    type Output = MarketDataResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.result_rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The request was dropped unsettled: the runtime is going away
            Poll::Ready(Err(_)) => {
                Poll::Ready(Err(MarketDataError::gate_closed(this.gate.name().to_string())))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
