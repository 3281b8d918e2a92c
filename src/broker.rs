//! Broker collaborators.
//!
//! The broker provides transport, persistence and scheduled delivery. This crate only needs
//! the slice described by these traits: opening senders and receivers, scheduling a message
//! for later, and settling a received message. Implementations wrap a real client (Service
//! Bus, SQS, ...) or the in-memory broker in [`crate::memory`].

use crate::error::{BrokerError, HandlerError, RequeueError};
use crate::message::{OutboundMessage, ReceivedMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

/// Async message-processing callback.
pub type MessageHandler =
    Arc<dyn Fn(ReceivedMessage) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Async callback for transport-level errors.
pub type ErrorHandler = Arc<dyn Fn(ProcessErrorArgs) -> BoxFuture<'static, ()> + Send + Sync>;

/// Adapt an async closure into a [`MessageHandler`].
pub fn message_handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(ReceivedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |message| -> BoxFuture<'static, Result<(), HandlerError>> {
        Box::pin(f(message))
    })
}

/// Adapt an async closure into an [`ErrorHandler`].
pub fn error_handler<F, Fut>(f: F) -> ErrorHandler
where
    F: Fn(ProcessErrorArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |args| -> BoxFuture<'static, ()> { Box::pin(f(args)) })
}

/// Where a reported error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    /// Pulling messages off the entity.
    Receive,
    /// Completing or dead-lettering a message.
    Settle,
    /// The subscribed message handler returned an error.
    ProcessMessage,
}

/// Arguments passed to an [`ErrorHandler`].
#[derive(Debug, Clone)]
pub struct ProcessErrorArgs {
    pub entity_path: String,
    pub error_source: ErrorSource,
    pub error: Arc<HandlerError>,
}

/// Handlers for a subscription. `process_message` is mandatory at subscribe time; it is an
/// `Option` so that its absence can be reported instead of being unrepresentable.
#[derive(Clone, Default)]
pub struct SubscriptionHandlers {
    pub process_message: Option<MessageHandler>,
    pub process_error: Option<ErrorHandler>,
}

impl SubscriptionHandlers {
    pub fn new(process_message: MessageHandler) -> Self {
        Self { process_message: Some(process_message), process_error: None }
    }

    pub fn with_error_handler(mut self, process_error: ErrorHandler) -> Self {
        self.process_error = Some(process_error);
        self
    }
}

impl std::fmt::Debug for SubscriptionHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandlers")
            .field("process_message", &self.process_message.as_ref().map(|_| "<handler>"))
            .field("process_error", &self.process_error.as_ref().map(|_| "<handler>"))
            .finish()
    }
}

/// Options forwarded verbatim to the underlying subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscribeOptions {
    pub max_concurrent_calls: usize,
    /// Complete a message after its handler returns `Ok`, unless it was already settled.
    pub auto_complete_messages: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self { max_concurrent_calls: 1, auto_complete_messages: true }
    }
}

/// Settlement mode of a receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReceiveMode {
    /// Messages stay locked until settled; required for retry orchestration.
    #[default]
    PeekLock,
    ReceiveAndDelete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceiverOptions {
    pub receive_mode: ReceiveMode,
}

/// Reason and description attached to a dead-lettered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterOptions {
    pub reason: String,
    pub description: String,
}

/// Factory for senders and receivers.
pub trait BrokerClient: Send + Sync + std::fmt::Debug {
    /// Open a sender for `destination`. Opening is lazy; failures surface on first send.
    fn create_sender(&self, destination: &str) -> Arc<dyn MessageSender>;

    fn create_receiver(
        &self,
        destination: &str,
        options: ReceiverOptions,
    ) -> Result<Arc<dyn MessageReceiver>, BrokerError>;
}

/// Outbound channel to one destination.
#[async_trait]
pub trait MessageSender: Send + Sync + std::fmt::Debug {
    fn destination(&self) -> &str;

    /// Enqueue `message` now, visible to consumers only from `enqueue_at`.
    ///
    /// Returns the broker's sequence number for the scheduled message.
    async fn schedule_message(
        &self,
        message: OutboundMessage,
        enqueue_at: DateTime<Utc>,
    ) -> Result<i64, BrokerError>;
}

/// Consumer handle for one entity.
#[async_trait]
pub trait MessageReceiver: Send + Sync + std::fmt::Debug {
    /// Queue or subscription path this receiver consumes.
    fn entity_path(&self) -> &str;

    fn is_closed(&self) -> bool;

    /// Start push-based delivery to `handlers`.
    fn subscribe(
        &self,
        handlers: SubscriptionHandlers,
        options: SubscribeOptions,
    ) -> Result<(), RequeueError>;

    /// Stop new deliveries. Messages already scheduled with the broker are unaffected.
    async fn close(&self) -> Result<(), BrokerError>;

    async fn complete_message(&self, message: &ReceivedMessage) -> Result<(), BrokerError>;

    async fn dead_letter_message(
        &self,
        message: &ReceivedMessage,
        options: DeadLetterOptions,
    ) -> Result<(), BrokerError>;
}
