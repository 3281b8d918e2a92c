#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # requeue
//!
//! Broker-delegated retry and dead-letter handling for message-queue consumers.
//!
//! When a handler fails, the original message is completed and a clone carrying retry
//! metadata is scheduled with the broker for later delivery. Once the attempt budget is
//! spent the message is dead-lettered instead. The consumer never sleeps and never holds a
//! message lock across the delay; durability of the retry state belongs to the broker.
//!
//! ## Features
//!
//! - **Retry policies** with a per-attempt delay schedule
//! - **Metadata codec** for the `x-retry-*` application properties
//! - **Sender registry** with one sender per destination
//! - **Enhanced receivers** that drop in for raw receivers
//! - **Telemetry** through tower-based sinks
//!
//! ## Quick Start
//!
//! ```rust
//! use requeue::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let broker = InMemoryBroker::new();
//!     let service = RetryService::new(Arc::new(broker.clone()));
//!     let policy =
//!         RetryPolicy::builder().max_attempts(3).delays_ms([1_000, 5_000]).build().unwrap();
//!
//!     let receiver = service.enhanced_receiver("orders", policy).unwrap();
//!     receiver
//!         .subscribe(
//!             SubscriptionHandlers::new(message_handler(|_message| async {
//!                 Err::<(), HandlerError>("downstream unavailable".into())
//!             })),
//!             SubscribeOptions::default(),
//!         )
//!         .unwrap();
//!
//!     let message = ReceivedMessage::new(b"{}".to_vec()).with_id("order-1");
//!     broker.receiver("orders").deliver(message).await.unwrap();
//!     assert_eq!(broker.scheduled()[0].message.message_id.as_deref(), Some("order-1-retry-1"));
//! }
//! ```

pub mod broker;
pub mod clock;
pub mod codec;
pub mod config;
pub mod enhancer;
pub mod error;
pub mod memory;
pub mod message;
pub mod orchestrator;
pub mod policy;
pub mod prelude;
pub mod registry;
pub mod service;
pub mod telemetry;

// Re-exports
pub use broker::{
    error_handler, message_handler, BrokerClient, MessageHandler, MessageReceiver, MessageSender,
    SubscribeOptions, SubscriptionHandlers,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{MetadataCodec, RetryMetadata};
pub use config::{ConfigError, ConsumerConfig, ReceiverConfig, RetryConfig};
pub use enhancer::EnhancedReceiver;
pub use error::{BrokerError, HandlerError, RequeueError};
pub use message::{OutboundMessage, ReceivedMessage};
pub use orchestrator::{FailureOutcome, RetryOrchestrator};
pub use policy::{RetryDecision, RetryPolicy, RetryPolicyBuilder};
pub use registry::{InMemorySenderRegistry, SenderRegistry};
pub use service::RetryService;
