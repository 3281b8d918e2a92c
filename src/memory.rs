//! In-memory broker for tests and local runs.
//!
//! Implements the collaborator traits of [`crate::broker`] without any transport:
//! - senders record scheduled messages together with their enqueue time,
//! - receivers record settlements and push messages through the subscribed handler,
//! - [`InMemoryBroker::deliver_due`] plays the broker's scheduled delivery, handing due
//!   messages to the receiver of their destination.

use crate::broker::{
    BrokerClient, DeadLetterOptions, ErrorSource, MessageReceiver, MessageSender,
    ProcessErrorArgs, ReceiveMode, ReceiverOptions, SubscribeOptions, SubscriptionHandlers,
};
use crate::error::{BrokerError, HandlerError, RequeueError};
use crate::message::{OutboundMessage, ReceivedMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A message accepted by a sender for later delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledMessage {
    pub sequence_number: i64,
    pub destination: String,
    pub message: OutboundMessage,
    pub enqueue_at: DateTime<Utc>,
}

/// A settlement performed on a receiver, labelled by message id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Completed(String),
    DeadLettered { message_id: String, reason: String, description: String },
}

impl Settlement {
    fn message_id(&self) -> &str {
        match self {
            Settlement::Completed(id) => id,
            Settlement::DeadLettered { message_id, .. } => message_id,
        }
    }
}

/// Identity of a locked delivery. Messages settled outside `deliver` carry no token and
/// fall back to their id.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LockKey {
    Token(u64),
    Id(String),
}

impl LockKey {
    fn of(message: &ReceivedMessage) -> Self {
        match message.lock_token {
            Some(token) => LockKey::Token(token),
            None => LockKey::Id(message.display_id().to_string()),
        }
    }
}

/// Why [`InMemoryReceiver::deliver`] did not run a handler to success.
#[derive(thiserror::Error, Debug, Clone)]
pub enum DeliveryError {
    #[error("receiver has no active subscription")]
    NotSubscribed,
    #[error("receiver is closed")]
    Closed,
    /// The subscribed handler failed; the error handler has already seen it.
    #[error("{0}")]
    Handler(Arc<HandlerError>),
    /// Auto-completion after a successful handler failed.
    #[error(transparent)]
    Settle(#[from] BrokerError),
}

#[derive(Debug, Default)]
struct BrokerState {
    senders_created: HashMap<String, usize>,
    receivers: HashMap<String, Arc<InMemoryReceiver>>,
    pending: Vec<ScheduledMessage>,
    scheduled_total: usize,
    next_sequence: i64,
}

/// Broker double shared by clones.
#[derive(Clone, Debug, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Receiver for `destination`, created on first use. Every call returns the same receiver.
    pub fn receiver(&self, destination: &str) -> Arc<InMemoryReceiver> {
        self.lock()
            .receivers
            .entry(destination.to_string())
            .or_insert_with(|| Arc::new(InMemoryReceiver::new(destination)))
            .clone()
    }

    /// Number of `create_sender` calls seen for `destination`.
    pub fn senders_created(&self, destination: &str) -> usize {
        self.lock().senders_created.get(destination).copied().unwrap_or(0)
    }

    /// Scheduled messages not yet delivered, in scheduling order.
    pub fn scheduled(&self) -> Vec<ScheduledMessage> {
        self.lock().pending.clone()
    }

    /// Messages ever scheduled, delivered or not.
    pub fn scheduled_total(&self) -> usize {
        self.lock().scheduled_total
    }

    /// Deliver every pending message whose enqueue time is at or before `now`.
    ///
    /// Messages whose receiver is closed or not subscribed stay pending. Returns how many
    /// messages reached a handler.
    pub async fn deliver_due(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<ScheduledMessage> = {
            let mut state = self.lock();
            let (due, pending): (Vec<_>, Vec<_>) =
                std::mem::take(&mut state.pending).into_iter().partition(|m| m.enqueue_at <= now);
            state.pending = pending;
            due
        };

        let mut delivered = 0;
        for item in due {
            let receiver = self.receiver(&item.destination);
            match receiver.deliver(item.message.clone().into_received()).await {
                Err(DeliveryError::NotSubscribed) | Err(DeliveryError::Closed) => {
                    self.lock().pending.push(item);
                }
                _ => delivered += 1,
            }
        }
        delivered
    }
}

impl BrokerClient for InMemoryBroker {
    fn create_sender(&self, destination: &str) -> Arc<dyn MessageSender> {
        *self.lock().senders_created.entry(destination.to_string()).or_insert(0) += 1;
        Arc::new(InMemorySender { destination: destination.to_string(), broker: self.clone() })
    }

    fn create_receiver(
        &self,
        destination: &str,
        options: ReceiverOptions,
    ) -> Result<Arc<dyn MessageReceiver>, BrokerError> {
        if options.receive_mode != ReceiveMode::PeekLock {
            return Err(BrokerError::Transport(
                "in-memory broker only supports peek-lock receivers".into(),
            ));
        }
        let receiver: Arc<dyn MessageReceiver> = self.receiver(destination);
        Ok(receiver)
    }
}

/// Sender that appends to the broker's pending list.
#[derive(Debug)]
pub struct InMemorySender {
    destination: String,
    broker: InMemoryBroker,
}

#[async_trait]
impl MessageSender for InMemorySender {
    fn destination(&self) -> &str {
        &self.destination
    }

    async fn schedule_message(
        &self,
        message: OutboundMessage,
        enqueue_at: DateTime<Utc>,
    ) -> Result<i64, BrokerError> {
        let mut state = self.broker.lock();
        state.next_sequence += 1;
        let sequence_number = state.next_sequence;
        state.pending.push(ScheduledMessage {
            sequence_number,
            destination: self.destination.clone(),
            message,
            enqueue_at,
        });
        state.scheduled_total += 1;
        Ok(sequence_number)
    }
}

/// Receiver that records settlements and runs the subscribed handler on demand.
#[derive(Debug)]
pub struct InMemoryReceiver {
    entity_path: String,
    subscription: Mutex<Option<(SubscriptionHandlers, SubscribeOptions)>>,
    settlements: Mutex<Vec<(LockKey, Settlement)>>,
    next_lock_token: AtomicU64,
    dead_letter_failure: Mutex<Option<String>>,
    subscribe_calls: AtomicUsize,
    closed: AtomicBool,
}

impl InMemoryReceiver {
    pub fn new(entity_path: impl Into<String>) -> Self {
        Self {
            entity_path: entity_path.into(),
            subscription: Mutex::new(None),
            settlements: Mutex::new(Vec::new()),
            next_lock_token: AtomicU64::new(1),
            dead_letter_failure: Mutex::new(None),
            subscribe_calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.settlements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, settlement)| settlement.clone())
            .collect()
    }

    /// Number of `subscribe` calls that reached this receiver, accepted or not.
    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    pub fn subscribe_options(&self) -> Option<SubscribeOptions> {
        self.subscription.lock().unwrap_or_else(PoisonError::into_inner).as_ref().map(|(_, o)| *o)
    }

    /// Make every following dead-letter settlement fail with `reason`.
    pub fn fail_dead_letters_with(&self, reason: impl Into<String>) {
        *self.dead_letter_failure.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(reason.into());
    }

    /// Report a transport-level failure to the subscribed error handler.
    pub async fn report_error(&self, error: HandlerError) -> Result<(), DeliveryError> {
        let handlers = self.current_handlers()?.0;
        if let Some(on_error) = handlers.process_error {
            on_error(ProcessErrorArgs {
                entity_path: self.entity_path.clone(),
                error_source: ErrorSource::Receive,
                error: Arc::new(error),
            })
            .await;
        }
        Ok(())
    }

    /// Push `message` through the subscribed handler under a fresh lock token.
    ///
    /// Handler failures are forwarded to the error handler and returned; successes are
    /// auto-completed when the subscription asked for it and nothing settled the message yet.
    pub async fn deliver(&self, mut message: ReceivedMessage) -> Result<(), DeliveryError> {
        let (handlers, options) = self.current_handlers()?;
        message.lock_token = Some(self.next_lock_token.fetch_add(1, Ordering::SeqCst));
        let Some(process_message) = handlers.process_message else {
            return Err(DeliveryError::NotSubscribed);
        };

        match process_message(message.clone()).await {
            Ok(()) => {
                if options.auto_complete_messages && !self.is_settled(&LockKey::of(&message)) {
                    self.complete_message(&message).await?;
                }
                Ok(())
            }
            Err(err) => {
                let err = Arc::new(err);
                if let Some(on_error) = handlers.process_error {
                    on_error(ProcessErrorArgs {
                        entity_path: self.entity_path.clone(),
                        error_source: ErrorSource::ProcessMessage,
                        error: err.clone(),
                    })
                    .await;
                }
                Err(DeliveryError::Handler(err))
            }
        }
    }

    fn current_handlers(&self) -> Result<(SubscriptionHandlers, SubscribeOptions), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(DeliveryError::NotSubscribed)
    }

    fn is_settled(&self, key: &LockKey) -> bool {
        self.settlements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|(settled, _)| settled == key)
    }

    fn settle(&self, message: &ReceivedMessage, settlement: Settlement) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed { entity: self.entity_path.clone() });
        }
        let key = LockKey::of(message);
        let mut settlements = self.settlements.lock().unwrap_or_else(PoisonError::into_inner);
        if settlements.iter().any(|(settled, _)| *settled == key) {
            return Err(BrokerError::AlreadySettled {
                message_id: settlement.message_id().to_string(),
            });
        }
        settlements.push((key, settlement));
        Ok(())
    }
}

#[async_trait]
impl MessageReceiver for InMemoryReceiver {
    fn entity_path(&self) -> &str {
        &self.entity_path
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn subscribe(
        &self,
        handlers: SubscriptionHandlers,
        options: SubscribeOptions,
    ) -> Result<(), RequeueError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            return Err(BrokerError::Closed { entity: self.entity_path.clone() }.into());
        }
        if handlers.process_message.is_none() {
            return Err(RequeueError::MissingMessageHandler);
        }
        let mut subscription = self.subscription.lock().unwrap_or_else(PoisonError::into_inner);
        if subscription.is_some() {
            return Err(BrokerError::Transport(format!(
                "receiver for '{}' is already subscribed",
                self.entity_path
            ))
            .into());
        }
        *subscription = Some((handlers, options));
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        self.subscription.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }

    async fn complete_message(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        self.settle(message, Settlement::Completed(message.display_id().to_string()))
    }

    async fn dead_letter_message(
        &self,
        message: &ReceivedMessage,
        options: DeadLetterOptions,
    ) -> Result<(), BrokerError> {
        if let Some(reason) =
            self.dead_letter_failure.lock().unwrap_or_else(PoisonError::into_inner).clone()
        {
            return Err(BrokerError::Transport(reason));
        }
        self.settle(
            message,
            Settlement::DeadLettered {
                message_id: message.display_id().to_string(),
                reason: options.reason,
                description: options.description,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{error_handler, message_handler};
    use chrono::TimeZone;

    fn ok_handlers() -> SubscriptionHandlers {
        SubscriptionHandlers::new(message_handler(|_| async { Ok::<(), HandlerError>(()) }))
    }

    #[tokio::test]
    async fn deliver_auto_completes_success() {
        let broker = InMemoryBroker::new();
        let receiver = broker.receiver("q");
        receiver.subscribe(ok_handlers(), SubscribeOptions::default()).unwrap();

        receiver.deliver(ReceivedMessage::new(vec![]).with_id("m1")).await.unwrap();
        assert_eq!(receiver.settlements(), vec![Settlement::Completed("m1".into())]);
    }

    #[tokio::test]
    async fn each_delivery_settles_under_its_own_lock() {
        let broker = InMemoryBroker::new();
        let receiver = broker.receiver("q");
        receiver.subscribe(ok_handlers(), SubscribeOptions::default()).unwrap();

        receiver.deliver(ReceivedMessage::new(b"a".to_vec())).await.unwrap();
        receiver.deliver(ReceivedMessage::new(b"b".to_vec())).await.unwrap();

        assert_eq!(
            receiver.settlements(),
            vec![Settlement::Completed("<none>".into()), Settlement::Completed("<none>".into())]
        );
    }

    #[tokio::test]
    async fn deliver_without_subscription_is_rejected() {
        let receiver = InMemoryReceiver::new("q");
        let err = receiver.deliver(ReceivedMessage::new(vec![])).await.unwrap_err();
        assert!(matches!(err, DeliveryError::NotSubscribed));
    }

    #[tokio::test]
    async fn handler_errors_reach_error_handler() {
        let receiver = InMemoryReceiver::new("q");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handlers = SubscriptionHandlers::new(message_handler(|_| async {
            Err::<(), HandlerError>("nope".into())
        }))
        .with_error_handler(error_handler(move |args: ProcessErrorArgs| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push((args.error_source, args.error.to_string()));
            }
        }));
        receiver.subscribe(handlers, SubscribeOptions::default()).unwrap();

        let err = receiver.deliver(ReceivedMessage::new(vec![]).with_id("m")).await.unwrap_err();
        assert_eq!(err.to_string(), "nope");
        assert_eq!(*seen.lock().unwrap(), vec![(ErrorSource::ProcessMessage, "nope".to_string())]);
        assert!(receiver.settlements().is_empty());
    }

    #[tokio::test]
    async fn double_settlement_is_rejected() {
        let receiver = InMemoryReceiver::new("q");
        let message = ReceivedMessage::new(vec![]).with_id("m");
        receiver.complete_message(&message).await.unwrap();
        let err = receiver.complete_message(&message).await.unwrap_err();
        assert_eq!(err, BrokerError::AlreadySettled { message_id: "m".into() });
    }

    #[tokio::test]
    async fn closed_receiver_rejects_everything() {
        let receiver = InMemoryReceiver::new("q");
        receiver.close().await.unwrap();
        assert!(receiver.is_closed());
        assert!(receiver.subscribe(ok_handlers(), SubscribeOptions::default()).is_err());
        let err = receiver.complete_message(&ReceivedMessage::new(vec![])).await.unwrap_err();
        assert_eq!(err, BrokerError::Closed { entity: "q".into() });
    }

    #[tokio::test]
    async fn deliver_due_respects_enqueue_time() {
        let broker = InMemoryBroker::new();
        let receiver = broker.receiver("q");
        receiver.subscribe(ok_handlers(), SubscribeOptions::default()).unwrap();
        let sender = broker.create_sender("q");
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let message = OutboundMessage { message_id: Some("later".into()), ..Default::default() };
        sender.schedule_message(message, t0 + chrono::Duration::seconds(5)).await.unwrap();

        assert_eq!(broker.deliver_due(t0).await, 0);
        assert_eq!(broker.scheduled().len(), 1);
        assert_eq!(broker.deliver_due(t0 + chrono::Duration::seconds(5)).await, 1);
        assert!(broker.scheduled().is_empty());
        assert_eq!(broker.scheduled_total(), 1);
        assert_eq!(receiver.settlements(), vec![Settlement::Completed("later".into())]);
    }

    #[test]
    fn receive_and_delete_is_unsupported() {
        let broker = InMemoryBroker::new();
        let options = ReceiverOptions { receive_mode: ReceiveMode::ReceiveAndDelete };
        assert!(broker.create_receiver("q", options).is_err());
    }
}
