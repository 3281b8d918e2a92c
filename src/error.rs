//! Error types for the retry pipeline.
//!
//! Three kinds of failure exist:
//! - configuration errors ([`RequeueError::MissingMessageHandler`],
//!   [`RequeueError::SenderNotRegistered`]) that are never retried,
//! - broker failures ([`BrokerError`]) reported by the collaborators in [`crate::broker`],
//! - the composite [`RequeueError::DeadLetterFailed`], the only retry-path failure that becomes
//!   visible to the subscription's error handler.
//!
//! User handler failures are not represented here; they travel as [`HandlerError`] and are
//! consumed by the orchestrator's state machine.

/// Error returned by user message handlers (and by wrapped handlers).
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure reported by a broker collaborator (sender, receiver, client).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The sender or receiver was already closed.
    #[error("entity '{entity}' is closed")]
    Closed {
        /// Queue or topic path of the closed entity.
        entity: String,
    },
    /// The message was already completed or dead-lettered.
    #[error("message '{message_id}' is already settled")]
    AlreadySettled {
        /// Id of the message that was settled twice.
        message_id: String,
    },
    /// Any other transport-level failure.
    #[error("{0}")]
    Transport(String),
}

/// Errors raised by the retry pipeline itself.
#[derive(thiserror::Error, Debug)]
pub enum RequeueError {
    /// `subscribe` was called without a message handler.
    #[error("subscribe requires a message handler")]
    MissingMessageHandler,
    /// A retry had to be scheduled for a destination whose sender was never registered.
    #[error("no sender registered for destination '{destination}'")]
    SenderNotRegistered {
        /// Destination the retry was meant for.
        destination: String,
    },
    /// The retry budget was exhausted and moving the message to the dead-letter queue failed.
    #[error("failed to dead-letter message: {dead_letter_error}. Original error: {original_error}")]
    DeadLetterFailed {
        /// Failure returned by the dead-letter settlement.
        #[source]
        dead_letter_error: BrokerError,
        /// Display text of the handler error that exhausted the budget.
        original_error: String,
    },
    /// Settling or scheduling on the retry path failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl RequeueError {
    /// True for errors caused by wiring mistakes rather than runtime faults.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::MissingMessageHandler | Self::SenderNotRegistered { .. })
    }

    /// True when dead-lettering an exhausted message failed.
    pub fn is_dead_letter_failure(&self) -> bool {
        matches!(self, Self::DeadLetterFailed { .. })
    }
}
