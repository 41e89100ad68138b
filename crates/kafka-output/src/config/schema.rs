// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The declared option table shared by every configuration source.
//!
//! Each entry names the canonical key, its accepted aliases, the environment
//! variable it is read from and a setter that converts a raw value into the
//! typed field of a [`PartialConfig`].

use std::str::FromStr;
use std::time::Duration;

use crate::config::{duration::parse_duration, PartialConfig};

/// A value as it comes out of a source, before it is checked against the
/// option it targets.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RawValue {
    Text(String),
    List(Vec<String>),
    Bool(bool),
    Number(serde_json::Number),
}

pub(crate) struct OptionSpec {
    pub key: &'static str,
    pub aliases: &'static [&'static str],
    pub env: Option<&'static str>,
    pub apply: fn(&mut PartialConfig, RawValue) -> Result<(), String>,
}

impl OptionSpec {
    fn matches(&self, key: &str) -> bool {
        self.key == key || self.aliases.contains(&key)
    }
}

pub(crate) static OPTIONS: &[OptionSpec] = &[
    OptionSpec {
        key: "brokers",
        aliases: &[],
        env: Some("K6_KAFKA_BROKERS"),
        apply: |config, raw| {
            if let Some(values) = list(raw)? {
                config.brokers = Some(values);
            }
            Ok(())
        },
    },
    OptionSpec {
        key: "topic",
        aliases: &[],
        env: Some("K6_KAFKA_TOPIC"),
        apply: |config, raw| {
            config.topic = Some(text(raw)?);
            Ok(())
        },
    },
    OptionSpec {
        key: "user",
        aliases: &[],
        env: Some("K6_KAFKA_SASL_USER"),
        apply: |config, raw| {
            config.user = Some(text(raw)?);
            Ok(())
        },
    },
    OptionSpec {
        key: "password",
        aliases: &[],
        env: Some("K6_KAFKA_SASL_PASSWORD"),
        apply: |config, raw| {
            config.password = Some(text(raw)?);
            Ok(())
        },
    },
    OptionSpec {
        key: "authMechanism",
        aliases: &["auth_mechanism"],
        env: Some("K6_KAFKA_AUTH_MECHANISM"),
        apply: |config, raw| {
            config.auth_mechanism = Some(parsed(raw)?);
            Ok(())
        },
    },
    OptionSpec {
        key: "format",
        aliases: &[],
        env: Some("K6_KAFKA_FORMAT"),
        apply: |config, raw| {
            config.format = Some(parsed(raw)?);
            Ok(())
        },
    },
    OptionSpec {
        key: "pushInterval",
        aliases: &["push_interval"],
        env: Some("K6_KAFKA_PUSH_INTERVAL"),
        apply: |config, raw| {
            config.push_interval = Some(duration(raw)?);
            Ok(())
        },
    },
    OptionSpec {
        key: "version",
        aliases: &[],
        env: Some("K6_KAFKA_VERSION"),
        apply: |config, raw| {
            config.version = Some(text(raw)?);
            Ok(())
        },
    },
    OptionSpec {
        key: "ssl",
        aliases: &[],
        env: Some("K6_KAFKA_SSL"),
        apply: |config, raw| {
            config.ssl = Some(boolean(raw)?);
            Ok(())
        },
    },
    OptionSpec {
        key: "insecureSkipTLSVerify",
        aliases: &["insecure_skip_tls_verify"],
        env: Some("K6_KAFKA_INSECURE_SKIP_TLS_VERIFY"),
        apply: |config, raw| {
            config.insecure_skip_tls_verify = Some(boolean(raw)?);
            Ok(())
        },
    },
    OptionSpec {
        key: "logError",
        aliases: &["log_error"],
        env: Some("K6_KAFKA_LOG_ERROR"),
        apply: |config, raw| {
            config.log_error = Some(boolean(raw)?);
            Ok(())
        },
    },
    OptionSpec {
        key: "influxdb.tagsAsFields",
        aliases: &["influxdb.tags_as_fields"],
        env: Some("K6_KAFKA_INFLUXDB_TAGS_AS_FIELDS"),
        apply: |config, raw| {
            if let Some(values) = list(raw)? {
                config.influxdb.tags_as_fields = Some(values);
            }
            Ok(())
        },
    },
];

pub(crate) fn lookup(key: &str) -> Option<&'static OptionSpec> {
    OPTIONS.iter().find(|option| option.matches(key))
}

fn text(raw: RawValue) -> Result<String, String> {
    match raw {
        RawValue::Text(value) => Ok(value),
        other => Err(format!("expected a string, got {}", describe(&other))),
    }
}

/// Splits and trims a list value. A list with no non-blank items leaves the
/// option unset so it cannot clear a value from an earlier source.
fn list(raw: RawValue) -> Result<Option<Vec<String>>, String> {
    let items: Vec<String> = match raw {
        RawValue::Text(value) => value.split(',').map(str::to_string).collect(),
        RawValue::List(values) => values,
        other => return Err(format!("expected a list, got {}", describe(&other))),
    };
    let items: Vec<String> = items
        .iter()
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect();
    Ok((!items.is_empty()).then_some(items))
}

fn boolean(raw: RawValue) -> Result<bool, String> {
    match raw {
        RawValue::Bool(value) => Ok(value),
        RawValue::Text(value) if value.eq_ignore_ascii_case("true") => Ok(true),
        RawValue::Text(value) if value.eq_ignore_ascii_case("false") => Ok(false),
        RawValue::Text(value) => Err(format!("expected true or false, got '{value}'")),
        other => Err(format!("expected true or false, got {}", describe(&other))),
    }
}

fn duration(raw: RawValue) -> Result<Duration, String> {
    match raw {
        RawValue::Text(value) => parse_duration(&value),
        // JSON numbers are milliseconds and may carry a fraction.
        RawValue::Number(number) => match (number.as_u64(), number.as_f64()) {
            (Some(millis), _) => Ok(Duration::from_millis(millis)),
            (None, Some(millis)) if millis.is_finite() && millis >= 0.0 => {
                let nanos = (millis * 1_000_000.0).round();
                if nanos < u64::MAX as f64 {
                    Ok(Duration::from_nanos(nanos as u64))
                } else {
                    Err(format!("{number} milliseconds is out of range"))
                }
            }
            _ => Err(format!(
                "expected a non-negative number of milliseconds, got {number}"
            )),
        },
        other => Err(format!("expected a duration, got {}", describe(&other))),
    }
}

fn parsed<T: FromStr<Err = String>>(raw: RawValue) -> Result<T, String> {
    text(raw)?.parse()
}

fn describe(raw: &RawValue) -> String {
    match raw {
        RawValue::Text(value) => format!("'{value}'"),
        RawValue::List(values) => format!("a list of {} items", values.len()),
        RawValue::Bool(value) => format!("boolean {value}"),
        RawValue::Number(number) => format!("number {number}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthMechanism, Format};

    #[test]
    fn lookup_accepts_aliases() {
        assert_eq!(lookup("authMechanism").map(|o| o.key), Some("authMechanism"));
        assert_eq!(lookup("auth_mechanism").map(|o| o.key), Some("authMechanism"));
        assert_eq!(
            lookup("influxdb.tags_as_fields").map(|o| o.key),
            Some("influxdb.tagsAsFields")
        );
        assert!(lookup("authmechanism").is_none());
    }

    #[test]
    fn every_option_has_a_distinct_environment_variable() {
        let mut names: Vec<_> = OPTIONS.iter().filter_map(|o| o.env).collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
        assert_eq!(total, OPTIONS.len());
    }

    #[test]
    fn setters_convert_values() {
        let mut partial = PartialConfig::default();
        let apply = |partial: &mut PartialConfig, key: &str, raw: RawValue| {
            lookup(key).map(|option| (option.apply)(partial, raw))
        };

        assert_eq!(
            apply(&mut partial, "brokers", RawValue::Text("a:1, b:2".to_string())),
            Some(Ok(()))
        );
        assert_eq!(
            apply(&mut partial, "format", RawValue::Text("influxdb".to_string())),
            Some(Ok(()))
        );
        assert_eq!(
            apply(&mut partial, "auth_mechanism", RawValue::Text("plain".to_string())),
            Some(Ok(()))
        );
        assert_eq!(
            apply(&mut partial, "pushInterval", RawValue::Number(250u64.into())),
            Some(Ok(()))
        );
        assert_eq!(
            apply(&mut partial, "ssl", RawValue::Text("true".to_string())),
            Some(Ok(()))
        );

        assert_eq!(
            partial.brokers,
            Some(vec!["a:1".to_string(), "b:2".to_string()])
        );
        assert_eq!(partial.format, Some(Format::InfluxDb));
        assert_eq!(partial.auth_mechanism, Some(AuthMechanism::Plain));
        assert_eq!(partial.push_interval, Some(Duration::from_millis(250)));
        assert_eq!(partial.ssl, Some(true));
    }

    #[test]
    fn blank_lists_leave_the_option_unset() {
        let brokers = lookup("brokers").map(|o| o.apply).unwrap();
        let mut partial = PartialConfig::default();
        brokers(&mut partial, RawValue::Text(" , ,".to_string())).unwrap();
        brokers(&mut partial, RawValue::List(vec![])).unwrap();
        brokers(&mut partial, RawValue::List(vec![" ".to_string()])).unwrap();
        assert_eq!(partial.brokers, None);

        brokers(&mut partial, RawValue::List(vec![" a:1 ".to_string(), String::new()])).unwrap();
        assert_eq!(partial.brokers, Some(vec!["a:1".to_string()]));
    }

    #[test]
    fn push_interval_accepts_fractional_milliseconds() {
        let push_interval = lookup("pushInterval").map(|o| o.apply).unwrap();
        let mut partial = PartialConfig::default();
        let number = |value: f64| RawValue::Number(serde_json::Number::from_f64(value).unwrap());

        push_interval(&mut partial, number(1500.5)).unwrap();
        assert_eq!(partial.push_interval, Some(Duration::from_micros(1_500_500)));

        assert!(push_interval(&mut partial, number(-1.0)).is_err());
        assert!(push_interval(&mut partial, RawValue::Number((-5i64).into())).is_err());
        assert_eq!(partial.push_interval, Some(Duration::from_micros(1_500_500)));
    }

    #[test]
    fn setters_reject_wrong_kinds() {
        let mut partial = PartialConfig::default();
        let ssl = lookup("ssl").map(|o| o.apply);
        let topic = lookup("topic").map(|o| o.apply);
        assert!(ssl.is_some_and(|f| f(&mut partial, RawValue::Text("yes".to_string())).is_err()));
        assert!(topic.is_some_and(|f| f(&mut partial, RawValue::Bool(true)).is_err()));
        assert_eq!(partial, PartialConfig::default());
    }
}
