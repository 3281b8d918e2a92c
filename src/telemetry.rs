//! Retry telemetry.
//!
//! The orchestrator emits a [`RetryEvent`] at each transition of a message's lifecycle. Events
//! flow through [`TelemetrySink`] implementations, which are plain `tower::Service`s so they
//! compose with standard tower combinators.
//!
//! Emission is best-effort: a sink that is not ready or fails drops the event and the retry
//! outcome is unaffected.
//!
//! ```rust
//! use requeue::telemetry::RetryEvent;
//! use std::time::Duration;
//!
//! let scheduled = RetryEvent::RetryScheduled {
//!     destination: "orders".into(),
//!     attempt: 1,
//!     delay: Duration::from_millis(100),
//! };
//! assert_eq!(scheduled.to_string(), "RetryScheduled(orders, #1, delay=100ms)");
//! ```

use serde_json::json;
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

/// Events emitted while handling a failed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    /// The user handler failed.
    HandlerFailed {
        destination: String,
        /// The attempt that failed (1-indexed)
        attempt: u32,
        max_attempts: u32,
    },
    /// A clone was scheduled for redelivery.
    RetryScheduled { destination: String, attempt: u32, delay: Duration },
    /// The message was moved to the dead-letter queue.
    DeadLettered { destination: String, attempts: u32 },
    /// Moving the message to the dead-letter queue failed.
    DeadLetterFailed { destination: String, attempts: u32 },
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryEvent::HandlerFailed { destination, attempt, max_attempts } => {
                write!(f, "HandlerFailed({}, {}/{})", destination, attempt, max_attempts)
            }
            RetryEvent::RetryScheduled { destination, attempt, delay } => {
                write!(f, "RetryScheduled({}, #{}, delay={:?})", destination, attempt, delay)
            }
            RetryEvent::DeadLettered { destination, attempts } => {
                write!(f, "DeadLettered({}, attempts={})", destination, attempts)
            }
            RetryEvent::DeadLetterFailed { destination, attempts } => {
                write!(f, "DeadLetterFailed({}, attempts={})", destination, attempts)
            }
        }
    }
}

#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert a RetryEvent into a JSON value for external sinks.
pub fn event_to_json(event: &RetryEvent) -> serde_json::Value {
    match event {
        RetryEvent::HandlerFailed { destination, attempt, max_attempts } => json!({
            "kind": "handler_failed",
            "destination": destination,
            "attempt": attempt,
            "max_attempts": max_attempts,
        }),
        RetryEvent::RetryScheduled { destination, attempt, delay } => json!({
            "kind": "retry_scheduled",
            "destination": destination,
            "attempt": attempt,
            "delay_ms": clamp_u64(delay.as_millis()),
        }),
        RetryEvent::DeadLettered { destination, attempts } => json!({
            "kind": "dead_lettered",
            "destination": destination,
            "attempts": attempts,
        }),
        RetryEvent::DeadLetterFailed { destination, attempts } => json!({
            "kind": "dead_letter_failed",
            "destination": destination,
            "attempts": attempts,
        }),
    }
}

/// A telemetry sink that consumes retry events.
pub trait TelemetrySink:
    tower::Service<RetryEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: RetryEvent)
where
    S: tower::Service<RetryEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

type SinkFuture<E> = Pin<Box<dyn std::future::Future<Output = Result<(), E>> + Send>>;

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<RetryEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: RetryEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events using the `tracing` crate.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<RetryEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RetryEvent) -> Self::Future {
        tracing::info!(target: "requeue::telemetry", event = %event, "retry_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that stores events in memory, evicting the oldest beyond capacity.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<RetryEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<RetryEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<RetryEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RetryEvent) -> Self::Future {
        let mut guard = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}
