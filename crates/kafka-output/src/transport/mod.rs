// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Broker transport.
//!
//! [`AsyncProducer`] is the capability the output publishes through.
//! [`KafkaProducer`] implements it over the Kafka wire protocol, with optional
//! SASL authentication and TLS.

pub mod broker;
pub mod producer;
pub mod protocol;
pub mod sasl;
pub mod scram;
pub mod tls;
pub mod version;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::errors::TransportError;

pub use broker::ConnectionSettings;
pub use producer::KafkaProducer;
pub use sasl::{SaslConversation, SaslSettings, SaslStrategy};
pub use scram::{ScramAlgorithm, ScramClient};
pub use version::KafkaVersion;

pub const CLIENT_ID: &str = "kafka-output";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerMessage {
    pub topic: String,
    pub value: String,
}

/// A message the producer could not deliver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to deliver message to topic {}: {error}", .message.topic)]
pub struct ProducerError {
    pub message: ProducerMessage,
    pub error: TransportError,
}

/// Asynchronous publisher with an input channel and an error channel.
#[async_trait]
pub trait AsyncProducer: Send {
    /// Sending waits while the producer is saturated.
    fn input(&self) -> mpsc::Sender<ProducerMessage>;

    /// Delivery failures, handed out once. `None` when errors are not
    /// returned. The receiver must be drained or the producer stalls once it
    /// fills up.
    fn take_errors(&mut self) -> Option<mpsc::Receiver<ProducerError>>;

    /// Delivers what was accepted so far, then releases connections and ends
    /// the error stream.
    async fn close(self: Box<Self>) -> Result<(), TransportError>;
}

/// Everything [`KafkaProducer`] needs, derived from a resolved [`Config`].
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub brokers: Vec<String>,
    pub connection: ConnectionSettings,
    pub return_errors: bool,
    pub channel_buffer_size: usize,
    pub max_batch_messages: usize,
    pub metadata_retries: usize,
    pub metadata_retry_backoff: Duration,
}

impl ProducerConfig {
    pub fn from_config(config: &Config) -> Result<Self, TransportError> {
        let version = config.version.parse::<KafkaVersion>()?.ensure_supported()?;

        let sasl = SaslStrategy::from_mechanism(config.auth_mechanism).map(|strategy| SaslSettings {
            strategy,
            user: config.user.clone().unwrap_or_default(),
            password: config.password.clone().unwrap_or_default(),
        });
        if sasl.is_some() && !version.supports_sasl() {
            return Err(TransportError::SaslUnsupported(version));
        }

        let tls = if config.tls_enabled() {
            Some(tls::client_config(config.insecure_skip_tls_verify)?)
        } else {
            None
        };

        Ok(ProducerConfig {
            brokers: config.brokers.clone(),
            connection: ConnectionSettings {
                client_id: CLIENT_ID.to_string(),
                version,
                tls,
                sasl,
                timeout: Duration::from_secs(10),
            },
            return_errors: config.log_error,
            channel_buffer_size: 256,
            max_batch_messages: 1000,
            metadata_retries: 3,
            metadata_retry_backoff: Duration::from_millis(250),
        })
    }
}

/// Builds and connects the producer for `config`. Nothing is returned unless
/// a bootstrap broker answered and authentication succeeded.
pub async fn build_transport(config: &Config) -> Result<KafkaProducer, TransportError> {
    KafkaProducer::connect(ProducerConfig::from_config(config)?).await
}
