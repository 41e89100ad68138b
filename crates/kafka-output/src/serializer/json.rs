// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Timelike, Utc};
use serde::ser::Error as _;
use serde::{Serialize, Serializer};
use serde_json::value::RawValue;

use crate::errors::SerializeError;
use crate::metric::{MetricType, Sample, Tags};

/// Rendered for samples the engine did not stamp.
pub const ZERO_TIME: &str = "0001-01-01T00:00:00Z";

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(rename = "type")]
    metric_type: MetricType,
    metric: &'a str,
    data: Data<'a>,
}

#[derive(Serialize)]
struct Data<'a> {
    #[serde(serialize_with = "serialize_time")]
    time: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_value")]
    value: f64,
    tags: &'a Tags,
}

fn serialize_time<S: Serializer>(
    time: &Option<DateTime<Utc>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match time {
        Some(time) => serializer.serialize_str(&format_time(time)),
        None => serializer.serialize_str(ZERO_TIME),
    }
}

/// RFC 3339 in UTC with as many fractional digits as the time needs, none
/// for whole seconds.
#[must_use]
pub fn format_time(time: &DateTime<Utc>) -> String {
    let mut rendered = time.format("%Y-%m-%dT%H:%M:%S").to_string();
    let nanos = time.nanosecond() % 1_000_000_000;
    if nanos > 0 {
        let fraction = format!("{nanos:09}");
        rendered.push('.');
        rendered.push_str(fraction.trim_end_matches('0'));
    }
    rendered.push('Z');
    rendered
}

fn serialize_value<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    RawValue::from_string(format_value(*value))
        .map_err(S::Error::custom)?
        .serialize(serializer)
}

/// Shortest decimal form, switching to an exponent with an explicit sign
/// below 1e-6 and from 1e21 up. Whole numbers carry no fraction.
#[must_use]
pub fn format_value(value: f64) -> String {
    let magnitude = value.abs();
    if magnitude != 0.0 && !(1e-6..1e21).contains(&magnitude) {
        let rendered = format!("{value:e}");
        return match rendered.split_once('e') {
            Some((mantissa, exponent)) if !exponent.starts_with('-') => {
                format!("{mantissa}e+{exponent}")
            }
            _ => rendered,
        };
    }
    value.to_string()
}

/// One envelope per sample. A single non-finite value rejects the batch.
pub fn encode(samples: &[&Sample]) -> Result<Vec<String>, SerializeError> {
    samples.iter().map(|sample| encode_sample(sample)).collect()
}

pub fn encode_sample(sample: &Sample) -> Result<String, SerializeError> {
    if !sample.value.is_finite() {
        return Err(SerializeError::NonFiniteValue {
            metric: sample.metric.name.clone(),
            value: sample.value,
        });
    }
    let envelope = Envelope {
        metric_type: sample.metric.metric_type,
        metric: &sample.metric.name,
        data: Data {
            time: sample.time,
            value: sample.value,
            tags: &sample.tags,
        },
    };
    Ok(serde_json::to_string(&envelope)?)
}
