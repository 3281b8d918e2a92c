//! Convenient re-exports for common requeue types.
pub use crate::{
    broker::{
        error_handler, message_handler, BrokerClient, DeadLetterOptions, ErrorSource,
        MessageReceiver, MessageSender, ProcessErrorArgs, ReceiveMode, ReceiverOptions,
        SubscribeOptions, SubscriptionHandlers,
    },
    clock::{Clock, ManualClock, SystemClock},
    codec::{MetadataCodec, RetryMetadata},
    config::{ConfigError, ConsumerConfig, RetryConfig},
    enhancer::EnhancedReceiver,
    error::{BrokerError, HandlerError, RequeueError},
    memory::{InMemoryBroker, Settlement},
    message::{OutboundMessage, ReceivedMessage},
    orchestrator::{FailureOutcome, RetryOrchestrator, DEAD_LETTER_REASON},
    policy::{BuildError, RetryDecision, RetryPolicy, RetryPolicyBuilder},
    registry::{InMemorySenderRegistry, SenderRegistry},
    service::RetryService,
    telemetry::{LogSink, MemorySink, NullSink, RetryEvent, TelemetrySink},
};
