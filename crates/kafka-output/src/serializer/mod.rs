// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns samples into wire messages.
//!
//! Only allow-listed metrics are serialized, the rest are dropped silently.
//! The format is picked once from the configuration.

pub mod influxdb;
pub mod json;

use crate::config::{Config, Format};
use crate::errors::SerializeError;
use crate::metric::Sample;

use influxdb::InfluxDbFormatter;

/// Metrics forwarded to Kafka.
pub const ALLOWED_METRICS: [&str; 5] = [
    "http_reqs",
    "http_req_duration",
    "data_sent",
    "data_received",
    "vus",
];

#[must_use]
pub fn is_allowed_metric(name: &str) -> bool {
    ALLOWED_METRICS.contains(&name)
}

#[must_use]
pub fn filter_allowed(samples: &[Sample]) -> Vec<&Sample> {
    samples
        .iter()
        .filter(|sample| is_allowed_metric(&sample.metric.name))
        .collect()
}

#[derive(Debug, Clone)]
pub enum Serializer {
    Json,
    InfluxDb(InfluxDbFormatter),
}

impl Serializer {
    /// Builds the serializer for the configured format. `tagsAsFields`
    /// entries are parsed here so a bad entry fails before any flush.
    pub fn new(config: &Config) -> Result<Self, SerializeError> {
        match config.format {
            Format::Json => Ok(Serializer::Json),
            Format::InfluxDb => Ok(Serializer::InfluxDb(InfluxDbFormatter::new(
                &config.influxdb.tags_as_fields,
            )?)),
        }
    }

    /// Filters `samples` through the allow-list and encodes what is left.
    pub fn serialize(&self, samples: &[Sample]) -> Result<Vec<String>, SerializeError> {
        self.encode(&filter_allowed(samples))
    }

    /// Encodes samples as they are, without the allow-list.
    pub fn encode(&self, samples: &[&Sample]) -> Result<Vec<String>, SerializeError> {
        match self {
            Serializer::Json => json::encode(samples),
            Serializer::InfluxDb(formatter) => formatter.encode(samples),
        }
    }
}

/// One-shot form of [`Serializer::serialize`].
pub fn serialize(samples: &[Sample], config: &Config) -> Result<Vec<String>, SerializeError> {
    Serializer::new(config)?.serialize(samples)
}
