// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types, one enum per concern. Everything converts into [`OutputError`].

use crate::transport::version::KafkaVersion;

/// Configuration failed to resolve. Always fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{origin} configuration: invalid syntax: {reason}")]
    Syntax { origin: &'static str, reason: String },
    #[error("{origin} configuration: malformed value for '{key}': {reason}")]
    Malformed {
        origin: &'static str,
        key: String,
        reason: String,
    },
    #[error("Unknown or unparsed options '{}'", .0.join(","))]
    UnknownOptions(Vec<String>),
    #[error("{}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<ConfigError>),
    #[error("user and password are required when auth mechanism is provided")]
    CredentialsRequired,
    #[error("at least one broker address is required")]
    NoBrokers,
    #[error("a topic is required")]
    NoTopic,
}

/// A batch of samples could not be serialized.
#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("metric {metric} has a non-finite value {value}")]
    NonFiniteValue { metric: String, value: f64 },
    #[error("failed to encode sample as JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid tagsAsFields entry '{spec}': {reason}")]
    FieldKind { spec: String, reason: String },
}

/// Failures of the broker transport.
///
/// Reasons are carried as strings so the error can be cloned onto every
/// message of a failed batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("invalid Kafka version '{0}'")]
    InvalidVersion(String),
    #[error("Kafka version {0} is not supported, expected 0.8.2.0 or later and below 5.0.0")]
    UnsupportedVersion(KafkaVersion),
    #[error("no broker reachable: {0}")]
    NoBrokerAvailable(String),
    #[error("failed to connect to {broker}: {reason}")]
    Connect { broker: String, reason: String },
    #[error("tls: {0}")]
    Tls(String),
    #[error("sasl authentication failed: {0}")]
    Sasl(String),
    #[error("sasl is not supported by Kafka version {0}")]
    SaslUnsupported(KafkaVersion),
    #[error("io: {0}")]
    Io(String),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("broker returned error {code} ({name})")]
    Broker { code: i16, name: &'static str },
    #[error("topic {0} is unknown to the cluster")]
    UnknownTopic(String),
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("producer is closed")]
    Closed,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Errors surfaced by the output lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Serialize(#[from] SerializeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("flush period must be greater than zero")]
    InvalidFlushPeriod,
    #[error("output already started")]
    AlreadyStarted,
    #[error("output not started")]
    NotStarted,
    #[error("background task failed: {0}")]
    Task(String),
}
