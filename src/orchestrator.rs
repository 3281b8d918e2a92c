//! Retry orchestrator: the state machine that decides a message's fate after its handler fails.
//!
//! ```text
//! Delivered --handler ok--------------------------> Done
//! Delivered --handler err, budget left------------> Scheduled(delay) --broker--> Delivered(clone)
//! Delivered --handler err, budget spent-----------> DeadLettered
//! ```
//!
//! Semantics:
//! - A successful handler is left alone; acknowledging success is the receiver's business.
//! - On failure the original is completed *before* the clone is scheduled, so the original and
//!   its clone are never deliverable at the same time.
//! - Delays are delegated to the broker's scheduled delivery; nothing here sleeps or spawns.
//! - Only a failed dead-letter settlement (and broker failures on the retry path) escape the
//!   wrapped handler; every handler error is otherwise absorbed.

use crate::broker::{DeadLetterOptions, MessageHandler, MessageReceiver};
use crate::clock::{Clock, SystemClock};
use crate::codec::MetadataCodec;
use crate::error::{HandlerError, RequeueError};
use crate::message::ReceivedMessage;
use crate::policy::{RetryDecision, RetryPolicy};
use crate::registry::SenderRegistry;
use crate::telemetry::{emit_best_effort, NullSink, RetryEvent, TelemetrySink};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Dead-letter reason code attached to exhausted messages.
pub const DEAD_LETTER_REASON: &str = "MaxCustomRetryAttemptsExceeded";

/// Result of handling one failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Original completed, clone scheduled with the broker.
    Scheduled {
        /// The attempt that failed; also the attempt count carried by the clone.
        attempt: u32,
        delay: Duration,
        enqueue_at: DateTime<Utc>,
    },
    /// Original moved to the dead-letter queue.
    DeadLettered { attempt: u32 },
}

/// Wraps message handlers with broker-delegated retry and dead-lettering.
#[derive(Clone, Debug)]
pub struct RetryOrchestrator<S = NullSink> {
    registry: Arc<dyn SenderRegistry>,
    codec: MetadataCodec,
    clock: Arc<dyn Clock>,
    sink: S,
}

impl RetryOrchestrator<NullSink> {
    pub fn new(registry: Arc<dyn SenderRegistry>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self { registry, codec: MetadataCodec::new(clock.clone()), clock, sink: NullSink }
    }
}

impl<S> RetryOrchestrator<S> {
    /// Use `clock` for metadata timestamps and enqueue times.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.codec = MetadataCodec::new(clock.clone());
        self.clock = clock;
        self
    }

    /// Emit retry events to `sink`.
    pub fn with_sink<T>(self, sink: T) -> RetryOrchestrator<T> {
        RetryOrchestrator { registry: self.registry, codec: self.codec, clock: self.clock, sink }
    }

    pub fn registry(&self) -> &Arc<dyn SenderRegistry> {
        &self.registry
    }

    pub fn codec(&self) -> &MetadataCodec {
        &self.codec
    }
}

impl<S> RetryOrchestrator<S>
where
    S: TelemetrySink + Sync,
    S::Future: Send + 'static,
{
    /// Return a handler with the same signature as `handler` that routes failures through the
    /// retry state machine for `destination`.
    pub fn wrap(
        &self,
        handler: MessageHandler,
        destination: impl Into<String>,
        policy: RetryPolicy,
        receiver: Arc<dyn MessageReceiver>,
    ) -> MessageHandler {
        let this = self.clone();
        let destination: Arc<str> = Arc::from(destination.into());
        let policy = Arc::new(policy);
        Arc::new(move |message: ReceivedMessage| -> BoxFuture<'static, Result<(), HandlerError>> {
            let this = this.clone();
            let handler = handler.clone();
            let destination = destination.clone();
            let policy = policy.clone();
            let receiver = receiver.clone();
            Box::pin(async move {
                let err = match handler(message.clone()).await {
                    Ok(()) => return Ok(()),
                    Err(err) => err,
                };
                this.handle_failure(&message, &destination, &policy, &*err, receiver.as_ref())
                    .await
                    .map(|_| ())
                    .map_err(|e| Box::new(e) as HandlerError)
            })
        })
    }

    /// Decide and perform retry or dead-letter for a message whose handler failed with `error`.
    pub async fn handle_failure(
        &self,
        message: &ReceivedMessage,
        destination: &str,
        policy: &RetryPolicy,
        error: &(dyn std::error::Error + Send + Sync + 'static),
        receiver: &dyn MessageReceiver,
    ) -> Result<FailureOutcome, RequeueError> {
        let metadata = self.codec.extract(message, policy);
        let decision = policy.decide(metadata.attempt_count);
        let attempt = match decision {
            RetryDecision::Retry { attempt, .. } | RetryDecision::DeadLetter { attempt } => attempt,
        };

        warn!(
            target: "requeue::orchestrator",
            message_id = %message.display_id(),
            destination = %destination,
            attempt,
            max_attempts = policy.max_attempts(),
            error = %error,
            "message handler failed"
        );
        self.emit(RetryEvent::HandlerFailed {
            destination: destination.to_string(),
            attempt,
            max_attempts: policy.max_attempts(),
        })
        .await;

        match decision {
            RetryDecision::DeadLetter { attempt } => {
                error!(
                    target: "requeue::orchestrator",
                    message_id = %message.display_id(),
                    destination = %destination,
                    attempt,
                    "retry attempts exhausted; moving message to dead-letter queue"
                );
                self.dead_letter(message, destination, attempt, error, receiver).await?;
                Ok(FailureOutcome::DeadLettered { attempt })
            }
            RetryDecision::Retry { attempt, delay } => {
                // Resolved before settling so a wiring mistake leaves the message locked.
                let sender = self.registry.get(destination).ok_or_else(|| {
                    RequeueError::SenderNotRegistered { destination: destination.to_string() }
                })?;

                receiver.complete_message(message).await?;
                let clone = self.codec.embed(&metadata, attempt, message);
                let enqueue_at = enqueue_time(self.clock.now(), delay);
                sender.schedule_message(clone, enqueue_at).await?;

                debug!(
                    target: "requeue::orchestrator",
                    message_id = %message.display_id(),
                    original_id = %metadata.original_message_id,
                    destination = %destination,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "retry scheduled"
                );
                self.emit(RetryEvent::RetryScheduled {
                    destination: destination.to_string(),
                    attempt,
                    delay,
                })
                .await;
                Ok(FailureOutcome::Scheduled { attempt, delay, enqueue_at })
            }
        }
    }

    async fn dead_letter(
        &self,
        message: &ReceivedMessage,
        destination: &str,
        attempt: u32,
        original: &(dyn std::error::Error + Send + Sync + 'static),
        receiver: &dyn MessageReceiver,
    ) -> Result<(), RequeueError> {
        let options = DeadLetterOptions {
            reason: DEAD_LETTER_REASON.to_string(),
            description: format!("Custom retry exhausted. Original error: {}", original),
        };
        match receiver.dead_letter_message(message, options).await {
            Ok(()) => {
                self.emit(RetryEvent::DeadLettered {
                    destination: destination.to_string(),
                    attempts: attempt,
                })
                .await;
                Ok(())
            }
            Err(dead_letter_error) => {
                error!(
                    target: "requeue::orchestrator",
                    message_id = %message.display_id(),
                    destination = %destination,
                    error = %dead_letter_error,
                    "failed to dead-letter message"
                );
                self.emit(RetryEvent::DeadLetterFailed {
                    destination: destination.to_string(),
                    attempts: attempt,
                })
                .await;
                Err(RequeueError::DeadLetterFailed {
                    dead_letter_error,
                    original_error: original.to_string(),
                })
            }
        }
    }

    async fn emit(&self, event: RetryEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }
}

fn enqueue_time(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
