//! Compile-time prelude coverage test.
use requeue::prelude::*;
use std::sync::Arc;

#[tokio::test]
async fn prelude_reexports_core_types() {
    let broker = InMemoryBroker::new();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
    let service = RetryService::new(Arc::new(broker.clone())).with_clock(clock).with_sink(LogSink);
    let policy: RetryPolicy = RetryConfig::default().try_into().expect("default policy");

    let receiver = service.enhanced_receiver("q", policy).expect("receiver");
    receiver
        .subscribe(
            SubscriptionHandlers::new(message_handler(|_| async { Ok::<(), HandlerError>(()) })),
            SubscribeOptions::default(),
        )
        .expect("subscribe");

    broker.receiver("q").deliver(ReceivedMessage::new(b"ok".to_vec()).with_id("m")).await.unwrap();
    assert_eq!(broker.receiver("q").settlements(), vec![Settlement::Completed("m".into())]);
}
