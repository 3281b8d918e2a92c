//! Consumer-side service that owns the sender registry.
//!
//! One [`RetryService`] is built at startup per broker client. It holds the only
//! [`InMemorySenderRegistry`] for that client and hands the same orchestrator to every
//! receiver it enhances, so all retries for a destination go through one sender.

use crate::broker::{BrokerClient, MessageReceiver, ReceiveMode, ReceiverOptions};
use crate::clock::Clock;
use crate::config::{ConfigError, ConsumerConfig};
use crate::enhancer::EnhancedReceiver;
use crate::error::BrokerError;
use crate::orchestrator::RetryOrchestrator;
use crate::policy::RetryPolicy;
use crate::registry::{InMemorySenderRegistry, SenderRegistry};
use crate::telemetry::NullSink;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone)]
pub struct RetryService<S = NullSink> {
    client: Arc<dyn BrokerClient>,
    registry: Arc<InMemorySenderRegistry>,
    orchestrator: RetryOrchestrator<S>,
}

impl RetryService<NullSink> {
    pub fn new(client: Arc<dyn BrokerClient>) -> Self {
        let registry = Arc::new(InMemorySenderRegistry::new(client.clone()));
        let orchestrator = RetryOrchestrator::new(registry.clone());
        Self { client, registry, orchestrator }
    }

    /// Build a service and the enhanced receivers described by `config`.
    pub fn from_config(
        client: Arc<dyn BrokerClient>,
        config: &ConsumerConfig,
    ) -> Result<(Self, Vec<EnhancedReceiver>), ConfigError> {
        let service = Self::new(client);
        let receivers = service.apply_config(config)?;
        Ok((service, receivers))
    }
}

impl<S> RetryService<S> {
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.orchestrator = self.orchestrator.with_clock(clock);
        self
    }

    pub fn with_sink<T>(self, sink: T) -> RetryService<T> {
        RetryService {
            client: self.client,
            registry: self.registry,
            orchestrator: self.orchestrator.with_sink(sink),
        }
    }

    pub fn registry(&self) -> &Arc<InMemorySenderRegistry> {
        &self.registry
    }

    pub fn orchestrator(&self) -> &RetryOrchestrator<S> {
        &self.orchestrator
    }

    /// Open a sender for `destination` ahead of the first retry. Idempotent.
    pub fn register_sender(&self, destination: &str) {
        self.registry.register(destination);
    }
}

impl<S: Clone> RetryService<S> {
    /// Wrap an already opened receiver; retries are scheduled on `destination`.
    pub fn enhance(
        &self,
        receiver: Arc<dyn MessageReceiver>,
        destination: &str,
        policy: RetryPolicy,
    ) -> EnhancedReceiver<S> {
        self.registry.register(destination);
        EnhancedReceiver::new(receiver, self.orchestrator.clone(), destination, policy)
    }

    /// Open a peek-lock receiver for `destination` and enhance it.
    pub fn enhanced_receiver(
        &self,
        destination: &str,
        policy: RetryPolicy,
    ) -> Result<EnhancedReceiver<S>, BrokerError> {
        let receiver = self
            .client
            .create_receiver(destination, ReceiverOptions { receive_mode: ReceiveMode::PeekLock })?;
        info!(
            target: "requeue::service",
            destination = %destination,
            max_attempts = policy.max_attempts(),
            "retry-enabled receiver created"
        );
        Ok(self.enhance(receiver, destination, policy))
    }

    /// Register every configured sender and enhance every configured receiver.
    ///
    /// Policies are validated before anything is opened.
    pub fn apply_config(
        &self,
        config: &ConsumerConfig,
    ) -> Result<Vec<EnhancedReceiver<S>>, ConfigError> {
        let policies = config
            .receivers
            .iter()
            .map(|receiver| config.policy_for(receiver))
            .collect::<Result<Vec<_>, _>>()?;

        for sender in &config.senders {
            self.register_sender(sender);
        }
        config
            .receivers
            .iter()
            .zip(policies)
            .map(|(receiver, policy)| {
                self.enhanced_receiver(&receiver.name, policy).map_err(|source| {
                    ConfigError::Receiver { destination: receiver.name.clone(), source }
                })
            })
            .collect()
    }
}
