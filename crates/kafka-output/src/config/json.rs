// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde_json::{Map, Value};
use tracing::debug;

use crate::config::{
    collect_errors,
    schema::{self, RawValue},
    Config, ConfigError, ConfigSource, PartialConfig,
};

const ORIGIN: &str = "json";

/// Reads the output's section of the host JSON configuration.
///
/// Nested objects are addressed with dotted keys, so
/// `{"influxdb":{"tagsAsFields":["vu"]}}` sets `influxdb.tagsAsFields`.
#[allow(clippy::module_name_repetitions)]
pub struct JsonConfigSource<'a> {
    raw: &'a [u8],
}

impl<'a> JsonConfigSource<'a> {
    #[must_use]
    pub fn new(raw: &'a [u8]) -> Self {
        JsonConfigSource { raw }
    }
}

impl ConfigSource for JsonConfigSource<'_> {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        parse(self.raw)?.merge_into(config);
        Ok(())
    }
}

pub fn parse(raw: &[u8]) -> Result<PartialConfig, ConfigError> {
    let document: Value = serde_json::from_slice(raw).map_err(|e| ConfigError::Syntax {
        origin: ORIGIN,
        reason: e.to_string(),
    })?;
    let object = match document {
        Value::Null => return Ok(PartialConfig::default()),
        Value::Object(object) => object,
        other => {
            return Err(ConfigError::Syntax {
                origin: ORIGIN,
                reason: format!("expected an object, got {other}"),
            })
        }
    };

    let mut partial = PartialConfig::default();
    let mut errors = Vec::new();
    for (key, value) in flatten(object) {
        let Some(option) = schema::lookup(&key) else {
            debug!("Ignoring unknown JSON configuration key {key}");
            continue;
        };
        let result = to_raw(value).and_then(|raw| match raw {
            Some(raw) => (option.apply)(&mut partial, raw),
            None => Ok(()),
        });
        if let Err(reason) = result {
            errors.push(ConfigError::Malformed {
                origin: ORIGIN,
                key,
                reason,
            });
        }
    }
    collect_errors(errors)?;
    Ok(partial)
}

fn flatten(object: Map<String, Value>) -> Vec<(String, Value)> {
    let mut entries = Vec::with_capacity(object.len());
    for (key, value) in object {
        match value {
            Value::Object(nested) => {
                entries.extend(
                    nested
                        .into_iter()
                        .map(|(inner, value)| (format!("{key}.{inner}"), value)),
                );
            }
            value => entries.push((key, value)),
        }
    }
    entries
}

fn to_raw(value: Value) -> Result<Option<RawValue>, String> {
    match value {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(RawValue::Bool(b))),
        Value::Number(n) => Ok(Some(RawValue::Number(n))),
        Value::String(s) => Ok(Some(RawValue::Text(s))),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(format!("expected a list of strings, found {other}")),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(|items| Some(RawValue::List(items))),
        Value::Object(_) => Err("unexpected nested object".to_string()),
    }
}
