// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! InfluxDB line protocol (v1).
//!
//! ```text
//! http_req_duration,method=GET,status=200 value=12.5,vu=3i 1700000000000000000
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::str::FromStr;

use tracing::warn;

use crate::errors::SerializeError;
use crate::metric::Sample;

/// Type a tag value is converted to when it is emitted as a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Int,
    Float,
    Bool,
}

impl FromStr for FieldKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(FieldKind::String),
            "int" => Ok(FieldKind::Int),
            "float" => Ok(FieldKind::Float),
            "bool" => Ok(FieldKind::Bool),
            other => Err(format!(
                "unknown field kind '{other}', expected string, int, float or bool"
            )),
        }
    }
}

impl FieldKind {
    /// Renders `raw` as a field value, `None` if it does not parse.
    fn encode(self, raw: &str) -> Option<String> {
        match self {
            FieldKind::String => Some(format!("\"{}\"", escape_string_field(raw))),
            FieldKind::Int => raw.parse::<i64>().ok().map(|n| format!("{n}i")),
            FieldKind::Float => raw
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(|f| f.to_string()),
            FieldKind::Bool => match raw {
                "1" | "t" | "T" | "true" | "TRUE" | "True" => Some("true".to_string()),
                "0" | "f" | "F" | "false" | "FALSE" | "False" => Some("false".to_string()),
                _ => None,
            },
        }
    }
}

/// Parses `name[:kind]` entries. Names must be unique.
pub fn parse_field_kinds(specs: &[String]) -> Result<BTreeMap<String, FieldKind>, SerializeError> {
    let mut kinds = BTreeMap::new();
    for spec in specs {
        let invalid = |reason: String| SerializeError::FieldKind {
            spec: spec.clone(),
            reason,
        };
        let (name, kind) = match spec.split_once(':') {
            Some((name, kind)) => (name, kind.parse().map_err(invalid)?),
            None => (spec.as_str(), FieldKind::String),
        };
        if name.is_empty() {
            return Err(invalid("empty tag name".to_string()));
        }
        if kinds.insert(name.to_string(), kind).is_some() {
            return Err(invalid(format!("tag {name} is listed more than once")));
        }
    }
    Ok(kinds)
}

#[derive(Debug, Clone, Default)]
pub struct InfluxDbFormatter {
    field_kinds: BTreeMap<String, FieldKind>,
}

impl InfluxDbFormatter {
    pub fn new(tags_as_fields: &[String]) -> Result<Self, SerializeError> {
        Ok(InfluxDbFormatter {
            field_kinds: parse_field_kinds(tags_as_fields)?,
        })
    }

    /// One line per sample, grouped by metric name in order of first
    /// appearance.
    pub fn encode(&self, samples: &[&Sample]) -> Result<Vec<String>, SerializeError> {
        if let Some(sample) = samples.iter().find(|s| !s.value.is_finite()) {
            return Err(SerializeError::NonFiniteValue {
                metric: sample.metric.name.clone(),
                value: sample.value,
            });
        }

        let mut groups: Vec<Vec<&Sample>> = Vec::new();
        let mut positions: HashMap<&str, usize> = HashMap::new();
        for &sample in samples {
            let position = *positions
                .entry(sample.metric.name.as_str())
                .or_insert_with(|| {
                    groups.push(Vec::new());
                    groups.len() - 1
                });
            groups[position].push(sample);
        }

        Ok(groups
            .into_iter()
            .flatten()
            .map(|sample| self.encode_line(sample))
            .collect())
    }

    fn encode_line(&self, sample: &Sample) -> String {
        let mut line = escape(&sample.metric.name, &[',', ' ']);
        let mut fields: BTreeMap<&str, String> = BTreeMap::new();

        for (key, value) in sample.tags.iter() {
            if let Some(kind) = self.field_kinds.get(key) {
                match kind.encode(value) {
                    Some(encoded) => {
                        fields.insert(key, encoded);
                    }
                    None => warn!(
                        "Dropping tag {key}={value} from {}: not a valid {kind:?} field",
                        sample.metric.name
                    ),
                }
            } else if !value.is_empty() {
                let _ = write!(
                    line,
                    ",{}={}",
                    escape(key, &[',', '=', ' ']),
                    escape(value, &[',', '=', ' '])
                );
            }
        }
        fields.insert("value", sample.value.to_string());

        line.push(' ');
        let rendered: Vec<String> = fields
            .iter()
            .map(|(key, value)| format!("{}={value}", escape(key, &[',', '=', ' '])))
            .collect();
        line.push_str(&rendered.join(","));

        if let Some(time) = sample.time {
            match time.timestamp_nanos_opt() {
                Some(nanos) => {
                    let _ = write!(line, " {nanos}");
                }
                None => warn!("Timestamp {time} of {} is out of range", sample.metric.name),
            }
        }
        line
    }
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '\n' {
            escaped.push_str("\\n");
            continue;
        }
        if special.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn escape_string_field(raw: &str) -> String {
    escape(raw, &['"', '\\'])
}
