// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Samples produced by the load-testing engine.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Counter,
    Gauge,
    Rate,
    Trend,
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
            MetricType::Rate => "rate",
            MetricType::Trend => "trend",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metric {
    pub name: String,
    pub metric_type: MetricType,
}

impl Metric {
    #[must_use]
    pub fn new(name: impl Into<String>, metric_type: MetricType) -> Arc<Self> {
        Arc::new(Metric {
            name: name.into(),
            metric_type,
        })
    }
}

/// Tag set of a sample, iterated in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Tags(BTreeMap<String, String>);

impl Tags {
    #[must_use]
    pub fn new() -> Self {
        Tags::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Tags {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Tags(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub metric: Arc<Metric>,
    pub tags: Tags,
    /// `None` when the engine did not stamp the sample.
    pub time: Option<DateTime<Utc>>,
    pub value: f64,
}

impl Sample {
    #[must_use]
    pub fn new(metric: Arc<Metric>, tags: Tags, value: f64) -> Self {
        Sample {
            metric,
            tags,
            time: None,
            value,
        }
    }

    #[must_use]
    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }
}

/// A group of samples deposited together by the engine.
pub trait SampleContainer: fmt::Debug + Send + Sync {
    fn samples(&self) -> &[Sample];
}

impl SampleContainer for Sample {
    fn samples(&self) -> &[Sample] {
        std::slice::from_ref(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Samples(pub Vec<Sample>);

impl SampleContainer for Samples {
    fn samples(&self) -> &[Sample] {
        &self.0
    }
}

/// Samples emitted by one operation, sharing its time and tags.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectedSamples {
    pub samples: Vec<Sample>,
    pub tags: Tags,
    pub time: DateTime<Utc>,
}

impl SampleContainer for ConnectedSamples {
    fn samples(&self) -> &[Sample] {
        &self.samples
    }
}
