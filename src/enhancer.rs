//! Retry-aware receiver.
//!
//! [`EnhancedReceiver`] implements [`MessageReceiver`] itself, so it drops in wherever a raw
//! receiver is expected. Only `subscribe` changes behavior: the message handler is routed
//! through the [`RetryOrchestrator`] for the receiver's destination. Every other method
//! forwards to the wrapped receiver.

use crate::broker::{
    DeadLetterOptions, ErrorHandler, MessageReceiver, ProcessErrorArgs, SubscribeOptions,
    SubscriptionHandlers,
};
use crate::error::{BrokerError, RequeueError};
use crate::message::ReceivedMessage;
use crate::orchestrator::RetryOrchestrator;
use crate::policy::RetryPolicy;
use crate::telemetry::{NullSink, TelemetrySink};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::debug;

/// A receiver whose subscriptions retry failed messages through the broker.
#[derive(Debug, Clone)]
pub struct EnhancedReceiver<S = NullSink> {
    inner: Arc<dyn MessageReceiver>,
    orchestrator: RetryOrchestrator<S>,
    destination: String,
    policy: RetryPolicy,
}

impl<S> EnhancedReceiver<S> {
    /// Wrap `inner`; retries for its messages are scheduled on `destination`.
    pub fn new(
        inner: Arc<dyn MessageReceiver>,
        orchestrator: RetryOrchestrator<S>,
        destination: impl Into<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self { inner, orchestrator, destination: destination.into(), policy }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// The wrapped receiver, for callers that need the raw handle.
    pub fn inner(&self) -> &Arc<dyn MessageReceiver> {
        &self.inner
    }
}

fn forward_errors(target: Option<ErrorHandler>) -> ErrorHandler {
    Arc::new(move |args: ProcessErrorArgs| -> BoxFuture<'static, ()> {
        let target = target.clone();
        Box::pin(async move {
            if let Some(target) = target {
                target(args).await;
            }
        })
    })
}

#[async_trait]
impl<S> MessageReceiver for EnhancedReceiver<S>
where
    S: TelemetrySink + Sync + std::fmt::Debug,
    S::Future: Send + 'static,
{
    fn entity_path(&self) -> &str {
        self.inner.entity_path()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn subscribe(
        &self,
        handlers: SubscriptionHandlers,
        options: SubscribeOptions,
    ) -> Result<(), RequeueError> {
        let process_message =
            handlers.process_message.ok_or(RequeueError::MissingMessageHandler)?;

        let wrapped = SubscriptionHandlers {
            process_message: Some(self.orchestrator.wrap(
                process_message,
                self.destination.clone(),
                self.policy.clone(),
                self.inner.clone(),
            )),
            process_error: Some(forward_errors(handlers.process_error)),
        };
        debug!(
            target: "requeue::enhancer",
            entity_path = %self.inner.entity_path(),
            destination = %self.destination,
            max_attempts = self.policy.max_attempts(),
            "subscribing with retry"
        );
        self.inner.subscribe(wrapped, options)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        debug!(
            target: "requeue::enhancer",
            entity_path = %self.inner.entity_path(),
            "closing receiver"
        );
        self.inner.close().await
    }

    async fn complete_message(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        self.inner.complete_message(message).await
    }

    async fn dead_letter_message(
        &self,
        message: &ReceivedMessage,
        options: DeadLetterOptions,
    ) -> Result<(), BrokerError> {
        self.inner.dead_letter_message(message, options).await
    }
}
