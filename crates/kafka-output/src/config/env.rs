// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use crate::config::{
    collect_errors,
    schema::{RawValue, OPTIONS},
    Config, ConfigError, ConfigSource, PartialConfig,
};

const ORIGIN: &str = "environment";

/// Reads `K6_KAFKA_*` variables from the environment snapshot handed over by
/// the host. The live process environment is never consulted.
#[allow(clippy::module_name_repetitions)]
pub struct EnvConfigSource<'a> {
    vars: &'a HashMap<String, String>,
}

impl<'a> EnvConfigSource<'a> {
    #[must_use]
    pub fn new(vars: &'a HashMap<String, String>) -> Self {
        EnvConfigSource { vars }
    }
}

impl ConfigSource for EnvConfigSource<'_> {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        parse(self.vars)?.merge_into(config);
        Ok(())
    }
}

pub fn parse(vars: &HashMap<String, String>) -> Result<PartialConfig, ConfigError> {
    let mut partial = PartialConfig::default();
    let mut errors = Vec::new();
    for option in OPTIONS {
        let Some(name) = option.env else {
            continue;
        };
        let Some(value) = vars.get(name).map(|v| v.trim()).filter(|v| !v.is_empty()) else {
            continue;
        };
        if let Err(reason) = (option.apply)(&mut partial, RawValue::Text(value.to_string())) {
            errors.push(ConfigError::Malformed {
                origin: ORIGIN,
                key: name.to_string(),
                reason,
            });
        }
    }
    collect_errors(errors)?;
    Ok(partial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthMechanism;
    use std::time::Duration;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn reads_kafka_variables() {
        let partial = parse(&vars(&[
            ("K6_KAFKA_BROKERS", "a:9092,b:9092"),
            ("K6_KAFKA_TOPIC", "k6"),
            ("K6_KAFKA_SASL_USER", "u"),
            ("K6_KAFKA_SASL_PASSWORD", "p"),
            ("K6_KAFKA_AUTH_MECHANISM", "plain"),
            ("K6_KAFKA_PUSH_INTERVAL", "250ms"),
            ("K6_KAFKA_INSECURE_SKIP_TLS_VERIFY", "true"),
            ("K6_KAFKA_INFLUXDB_TAGS_AS_FIELDS", "vu:int,iter:int"),
        ]))
        .expect("parses");

        assert_eq!(
            partial.brokers,
            Some(vec!["a:9092".to_string(), "b:9092".to_string()])
        );
        assert_eq!(partial.topic.as_deref(), Some("k6"));
        assert_eq!(partial.user.as_deref(), Some("u"));
        assert_eq!(partial.password.as_deref(), Some("p"));
        assert_eq!(partial.auth_mechanism, Some(AuthMechanism::Plain));
        assert_eq!(partial.push_interval, Some(Duration::from_millis(250)));
        assert_eq!(partial.insecure_skip_tls_verify, Some(true));
        assert_eq!(
            partial.influxdb.tags_as_fields,
            Some(vec!["vu:int".to_string(), "iter:int".to_string()])
        );
    }

    #[test]
    fn ignores_unrelated_and_empty_variables() {
        let partial = parse(&vars(&[
            ("HOME", "/root"),
            ("K6_KAFKA_TOPIC", ""),
            ("K6_KAFKA_SSL", "  "),
        ]))
        .expect("parses");
        assert_eq!(partial, PartialConfig::default());
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = parse(&vars(&[("K6_KAFKA_LOG_ERROR", "1")])).expect_err("not a bool");
        assert_eq!(
            err,
            ConfigError::Malformed {
                origin: "environment",
                key: "K6_KAFKA_LOG_ERROR".to_string(),
                reason: "expected true or false, got '1'".to_string(),
            }
        );
    }
}
