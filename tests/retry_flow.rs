mod common;

use common::{flaky, ms, policy_3, start_clock, SharedWriter};
use requeue::codec::{RETRY_ATTEMPT, RETRY_MAX_ATTEMPTS, RETRY_ORIGINAL_ID};
use requeue::memory::{DeliveryError, InMemoryReceiver};
use requeue::prelude::*;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::writer::BoxMakeWriter;

struct Harness {
    broker: InMemoryBroker,
    clock: ManualClock,
    sink: MemorySink,
    receiver: EnhancedReceiver<MemorySink>,
    raw: Arc<InMemoryReceiver>,
}

fn harness(policy: RetryPolicy) -> Harness {
    let broker = InMemoryBroker::new();
    let clock = start_clock();
    let sink = MemorySink::new();
    let service = RetryService::new(Arc::new(broker.clone()))
        .with_clock(Arc::new(clock.clone()))
        .with_sink(sink.clone());
    let receiver = service.enhanced_receiver("orders", policy).expect("receiver");
    let raw = broker.receiver("orders");
    Harness { broker, clock, sink, receiver, raw }
}

impl Harness {
    fn subscribe(&self, handler: requeue::MessageHandler) {
        self.receiver
            .subscribe(SubscriptionHandlers::new(handler), SubscribeOptions::default())
            .expect("subscribe");
    }

    async fn advance_and_deliver(&self, millis: u64) -> usize {
        self.clock.advance(ms(millis));
        self.broker.deliver_due(self.clock.now()).await
    }
}

fn order() -> ReceivedMessage {
    ReceivedMessage::new(br#"{"sku":"A-1"}"#.to_vec())
        .with_id("order-1")
        .with_content_type("application/json")
        .with_property("tenant", "acme")
}

#[tokio::test]
async fn first_failure_schedules_clone_after_first_delay() {
    let h = harness(policy_3());
    let (handler, _) = flaky(1);
    h.subscribe(handler);
    let start = h.clock.now();

    h.raw.deliver(order()).await.expect("failure is absorbed");

    assert_eq!(h.raw.settlements(), vec![Settlement::Completed("order-1".into())]);
    let scheduled = h.broker.scheduled();
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].destination, "orders");
    assert_eq!(scheduled[0].enqueue_at, start + chrono::Duration::milliseconds(100));
    let clone = &scheduled[0].message;
    assert_eq!(clone.message_id.as_deref(), Some("order-1-retry-1"));
    assert_eq!(clone.properties[RETRY_ATTEMPT], json!(1));
    assert_eq!(clone.properties[RETRY_ORIGINAL_ID], json!("order-1"));
    assert_eq!(clone.properties["tenant"], json!("acme"));
    assert_eq!(clone.body, order().body);
}

#[tokio::test]
async fn persistent_failure_is_dead_lettered_on_last_attempt() {
    let h = harness(policy_3());
    let (handler, calls) = flaky(usize::MAX);
    h.subscribe(handler);

    h.raw.deliver(order()).await.unwrap();
    assert_eq!(h.broker.scheduled()[0].message.properties[RETRY_ORIGINAL_ID], json!("order-1"));

    // Not due yet.
    assert_eq!(h.advance_and_deliver(99).await, 0);
    assert_eq!(h.advance_and_deliver(1).await, 1);

    let second = h.broker.scheduled();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].message.message_id.as_deref(), Some("order-1-retry-2"));
    assert_eq!(second[0].message.properties[RETRY_ATTEMPT], json!(2));
    assert_eq!(second[0].message.properties[RETRY_ORIGINAL_ID], json!("order-1"));
    assert_eq!(second[0].enqueue_at, h.clock.now() + chrono::Duration::milliseconds(200));

    assert_eq!(h.advance_and_deliver(200).await, 1);

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(h.broker.scheduled().is_empty());
    assert_eq!(h.broker.scheduled_total(), 2, "never scheduled a fourth attempt");
    let settlements = h.raw.settlements();
    assert_eq!(settlements.len(), 3);
    assert_eq!(settlements[0], Settlement::Completed("order-1".into()));
    assert_eq!(settlements[1], Settlement::Completed("order-1-retry-1".into()));
    match &settlements[2] {
        Settlement::DeadLettered { message_id, reason, description } => {
            assert_eq!(message_id, "order-1-retry-2");
            assert_eq!(reason, DEAD_LETTER_REASON);
            assert_eq!(description, "Custom retry exhausted. Original error: handler failure #3");
        }
        other => panic!("expected dead-letter, got {:?}", other),
    }

    let events = h.sink.events();
    let failed = events.iter().filter(|e| matches!(e, RetryEvent::HandlerFailed { .. })).count();
    let scheduled =
        events.iter().filter(|e| matches!(e, RetryEvent::RetryScheduled { .. })).count();
    assert_eq!((failed, scheduled), (3, 2));
    assert_eq!(
        events.last(),
        Some(&RetryEvent::DeadLettered { destination: "orders".into(), attempts: 3 })
    );
}

#[tokio::test]
async fn recovery_on_retry_is_completed_by_receiver() {
    let h = harness(policy_3());
    let (handler, calls) = flaky(1);
    h.subscribe(handler);

    h.raw.deliver(order()).await.unwrap();
    assert_eq!(h.advance_and_deliver(100).await, 1);

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(h.broker.scheduled().is_empty());
    assert_eq!(
        h.raw.settlements(),
        vec![
            Settlement::Completed("order-1".into()),
            Settlement::Completed("order-1-retry-1".into()),
        ]
    );
}

#[tokio::test]
async fn message_at_budget_is_dead_lettered_without_scheduling() {
    let h = harness(policy_3());
    let (handler, _) = flaky(usize::MAX);
    h.subscribe(handler);
    let message =
        order().with_property(RETRY_ORIGINAL_ID, "order-0").with_property(RETRY_ATTEMPT, 3);

    h.raw.deliver(message).await.unwrap();

    assert_eq!(h.broker.scheduled_total(), 0);
    assert!(matches!(
        &h.raw.settlements()[..],
        [Settlement::DeadLettered { reason, .. }] if reason == DEAD_LETTER_REASON
    ));
}

#[tokio::test]
async fn subscribe_without_message_handler_never_reaches_receiver() {
    let h = harness(policy_3());
    let handlers = SubscriptionHandlers {
        process_message: None,
        process_error: Some(error_handler(|_| async {})),
    };

    let err = h.receiver.subscribe(handlers, SubscribeOptions::default()).unwrap_err();

    assert!(err.is_configuration());
    assert_eq!(err.to_string(), "subscribe requires a message handler");
    assert_eq!(h.raw.subscribe_calls(), 0);
    assert!(!h.raw.is_subscribed());
}

#[tokio::test]
async fn dead_letter_failure_reports_both_errors() {
    let h = harness(policy_3());
    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = reported.clone();
    let (handler, _) = flaky(usize::MAX);
    h.receiver
        .subscribe(
            SubscriptionHandlers::new(handler).with_error_handler(error_handler(
                move |args: ProcessErrorArgs| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().unwrap().push((args.error_source, args.error.to_string()));
                    }
                },
            )),
            SubscribeOptions::default(),
        )
        .unwrap();
    h.raw.fail_dead_letters_with("lock lost");
    let message =
        order().with_property(RETRY_ORIGINAL_ID, "order-1").with_property(RETRY_ATTEMPT, 2);

    let err = h.raw.deliver(message).await.unwrap_err();

    let text = err.to_string();
    assert!(matches!(err, DeliveryError::Handler(_)));
    assert!(text.contains("lock lost"), "{text}");
    assert!(text.contains("handler failure #1"), "{text}");
    let reported = reported.lock().unwrap();
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].0, ErrorSource::ProcessMessage);
    assert_eq!(reported[0].1, text);
    assert!(h.sink.events().contains(&RetryEvent::DeadLetterFailed {
        destination: "orders".into(),
        attempts: 3,
    }));
}

#[tokio::test]
async fn message_without_id_gets_generated_original_id() {
    let h = harness(policy_3());
    let (handler, _) = flaky(1);
    h.subscribe(handler);
    let millis = h.clock.now().timestamp_millis();

    h.raw.deliver(ReceivedMessage::new(b"anonymous".to_vec())).await.unwrap();

    let clone = &h.broker.scheduled()[0].message;
    let original = format!("msg-{}", millis);
    assert_eq!(clone.properties[RETRY_ORIGINAL_ID], json!(original));
    assert_eq!(clone.message_id, Some(format!("{}-retry-1", original)));
}

#[tokio::test]
async fn anonymous_messages_retry_independently() {
    let h = harness(policy_3());
    let (handler, _) = flaky(usize::MAX);
    h.subscribe(handler);

    h.raw.deliver(ReceivedMessage::new(b"first".to_vec())).await.expect("first retried");
    h.clock.advance(ms(1));
    h.raw.deliver(ReceivedMessage::new(b"second".to_vec())).await.expect("second retried");

    let scheduled = h.broker.scheduled();
    assert_eq!(scheduled.len(), 2);
    assert_eq!(scheduled[0].message.body, b"first".to_vec());
    assert_eq!(scheduled[1].message.body, b"second".to_vec());
    assert_ne!(scheduled[0].message.message_id, scheduled[1].message.message_id);
    assert_eq!(
        h.raw.settlements(),
        vec![Settlement::Completed("<none>".into()), Settlement::Completed("<none>".into())]
    );
}

#[tokio::test]
async fn frozen_budget_travels_with_clone() {
    let h = harness(RetryPolicy::builder().max_attempts(5).delays_ms([10]).build().unwrap());
    let (handler, _) = flaky(usize::MAX);
    h.subscribe(handler);

    h.raw.deliver(order()).await.unwrap();
    h.advance_and_deliver(10).await;

    let latest = h.broker.scheduled();
    assert_eq!(latest[0].message.properties[RETRY_MAX_ATTEMPTS], json!(5));
    assert_eq!(latest[0].message.properties[RETRY_ATTEMPT], json!(2));
    assert_eq!(latest[0].enqueue_at, h.clock.now() + chrono::Duration::milliseconds(10));
}

#[tokio::test]
async fn lifecycle_is_logged_with_structured_fields() {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(BoxMakeWriter::new(writer.clone()))
        .with_max_level(tracing::Level::DEBUG)
        .with_target(true)
        .with_ansi(false)
        .without_time()
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let h = harness(RetryPolicy::builder().max_attempts(2).delays_ms([5]).build().unwrap());
    let (handler, _) = flaky(usize::MAX);
    h.subscribe(handler);
    h.raw.deliver(order()).await.unwrap();
    h.advance_and_deliver(5).await;

    let logs = writer.contents();
    assert!(logs.contains("requeue::orchestrator"), "{logs}");
    assert!(logs.contains("message handler failed"));
    assert!(logs.contains("retry scheduled"));
    assert!(logs.contains("retry attempts exhausted"));
    assert!(logs.contains("WARN"));
    assert!(logs.contains("ERROR"));
    assert!(logs.contains("message_id=order-1"));
    assert!(logs.contains("requeue::registry"));
}
