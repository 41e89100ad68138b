// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The inline argument string: `brokers={a:9092,b:9092},topic=k6,influxdb.tagsAsFields={vu:int}`.

use std::collections::BTreeSet;

use crate::config::{
    collect_errors,
    schema::{self, RawValue},
    Config, ConfigError, ConfigSource, PartialConfig,
};

const ORIGIN: &str = "argument";

#[allow(clippy::module_name_repetitions)]
pub struct ArgConfigSource<'a> {
    arg: &'a str,
}

impl<'a> ArgConfigSource<'a> {
    #[must_use]
    pub fn new(arg: &'a str) -> Self {
        ArgConfigSource { arg }
    }
}

impl ConfigSource for ArgConfigSource<'_> {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        parse(self.arg)?.merge_into(config);
        Ok(())
    }
}

/// Parses the argument string in one pass over the option table.
///
/// Every malformed value and every unknown key is reported, unknown keys are
/// grouped into a single sorted [`ConfigError::UnknownOptions`].
pub fn parse(arg: &str) -> Result<PartialConfig, ConfigError> {
    let mut partial = PartialConfig::default();
    let mut errors = Vec::new();
    let mut unknown = BTreeSet::new();

    for (key, raw) in tokenize(arg)? {
        match schema::lookup(&key) {
            Some(option) => {
                if let Err(reason) = (option.apply)(&mut partial, raw) {
                    errors.push(ConfigError::Malformed {
                        origin: ORIGIN,
                        key,
                        reason,
                    });
                }
            }
            None => {
                unknown.insert(key);
            }
        }
    }
    if !unknown.is_empty() {
        errors.push(ConfigError::UnknownOptions(unknown.into_iter().collect()));
    }
    collect_errors(errors)?;
    Ok(partial)
}

fn syntax(reason: String) -> ConfigError {
    ConfigError::Syntax {
        origin: ORIGIN,
        reason,
    }
}

fn tokenize(arg: &str) -> Result<Vec<(String, RawValue)>, ConfigError> {
    let mut pairs = Vec::new();
    for segment in split_top_level(arg)? {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let Some((key, value)) = segment.split_once('=') else {
            return Err(syntax(format!("'{segment}' is not a key=value pair")));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(syntax(format!("missing key in '{segment}'")));
        }
        let value = value.trim();
        let raw = match value.strip_prefix('{') {
            Some(inner) => {
                let Some(inner) = inner.strip_suffix('}') else {
                    return Err(syntax(format!("unbalanced braces in '{segment}'")));
                };
                if inner.contains(['{', '}']) {
                    return Err(syntax(format!("nested lists are not supported in '{segment}'")));
                }
                RawValue::List(
                    inner
                        .split(',')
                        .map(str::trim)
                        .filter(|item| !item.is_empty())
                        .map(str::to_string)
                        .collect(),
                )
            }
            None if value.contains(['{', '}']) => {
                return Err(syntax(format!("unbalanced braces in '{segment}'")));
            }
            None => RawValue::Text(value.to_string()),
        };
        pairs.push((key.to_string(), raw));
    }
    Ok(pairs)
}

/// Splits on commas that are not inside a `{...}` list.
fn split_top_level(arg: &str) -> Result<Vec<&str>, ConfigError> {
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (index, c) in arg.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| syntax(format!("unexpected '}}' at offset {index}")))?;
            }
            ',' if depth == 0 => {
                segments.push(&arg[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(syntax("unclosed '{'".to_string()));
    }
    segments.push(&arg[start..]);
    Ok(segments)
}
