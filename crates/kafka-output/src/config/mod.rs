// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Configuration Module
//!
//! The output is configured from four layers, applied in this order (later
//! layers override earlier ones, field by field):
//!
//! 1. **Defaults** - [`Config::default`]
//! 2. **JSON** - the output's section of the host's JSON configuration
//! 3. **Environment** - `K6_KAFKA_*` variables from the host's snapshot
//! 4. **Argument** - the inline `key=value,...` string
//!
//! A field left unset by a layer never clears what an earlier layer set. Every
//! source is described by the same option table (see `schema`), so a key means
//! the same thing wherever it appears.
//!
//! ## Edge Cases and Behaviors
//!
//! - **Unknown JSON keys**: ignored, the JSON blob can be shared with other outputs
//! - **Unknown argument keys**: rejected, all of them are reported at once
//! - **Empty environment values**: treated as unset
//! - **Credentials**: required as soon as the auth mechanism is not `none`,
//!   checked after every layer is merged

pub mod arg;
pub mod auth_mechanism;
pub mod duration;
pub mod env;
pub mod format;
pub mod json;
pub(crate) mod schema;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

pub use crate::config::{auth_mechanism::AuthMechanism, format::Format};
use crate::config::{arg::ArgConfigSource, env::EnvConfigSource, json::JsonConfigSource};
pub use crate::errors::ConfigError;

/// Helper macro to merge Option<T> fields where T implements Clone
macro_rules! merge_option {
    ($config:expr, $source:expr, $field:ident) => {
        if $source.$field.is_some() {
            $config.$field.clone_from(&$source.$field);
        }
    };
}

/// Helper macro to merge Option<T> fields to T fields when Option<T> is Some
macro_rules! merge_option_to_value {
    ($config:expr, $source:expr, $field:ident) => {
        if let Some(value) = &$source.$field {
            $config.$field = value.clone();
        }
    };
}

pub const DEFAULT_VERSION: &str = "1.0.0";
pub const DEFAULT_PUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Fully resolved configuration of the output.
#[derive(Clone, PartialEq)]
pub struct Config {
    /// Bootstrap brokers as `host:port`.
    pub brokers: Vec<String>,
    pub topic: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub auth_mechanism: AuthMechanism,
    pub format: Format,
    pub push_interval: Duration,
    /// Kafka protocol version, `0.10.2.0` or `2.1.0` style.
    pub version: String,
    pub ssl: bool,
    pub insecure_skip_tls_verify: bool,
    pub log_error: bool,
    pub influxdb: InfluxDbConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfluxDbConfig {
    /// Tag keys emitted as fields, each `name` or `name:kind`.
    pub tags_as_fields: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            brokers: Vec::new(),
            topic: String::new(),
            user: None,
            password: None,
            auth_mechanism: AuthMechanism::None,
            format: Format::Json,
            push_interval: DEFAULT_PUSH_INTERVAL,
            version: DEFAULT_VERSION.to_string(),
            ssl: false,
            insecure_skip_tls_verify: false,
            log_error: true,
            influxdb: InfluxDbConfig::default(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("brokers", &self.brokers)
            .field("topic", &self.topic)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("auth_mechanism", &self.auth_mechanism)
            .field("format", &self.format)
            .field("push_interval", &self.push_interval)
            .field("version", &self.version)
            .field("ssl", &self.ssl)
            .field("insecure_skip_tls_verify", &self.insecure_skip_tls_verify)
            .field("log_error", &self.log_error)
            .field("influxdb", &self.influxdb)
            .finish()
    }
}

impl Config {
    /// Checks the invariants that only hold once every layer is merged.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth_mechanism.requires_credentials()
            && (self.user.is_none() || self.password.is_none())
        {
            return Err(ConfigError::CredentialsRequired);
        }
        if self.brokers.is_empty() {
            return Err(ConfigError::NoBrokers);
        }
        if self.topic.is_empty() {
            return Err(ConfigError::NoTopic);
        }
        Ok(())
    }

    /// TLS is only negotiated on authenticated connections.
    #[must_use]
    pub fn tls_enabled(&self) -> bool {
        self.auth_mechanism != AuthMechanism::None && self.ssl
    }
}

/// One layer's contribution. `None` means the layer did not set the field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialConfig {
    pub brokers: Option<Vec<String>>,
    pub topic: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub auth_mechanism: Option<AuthMechanism>,
    pub format: Option<Format>,
    pub push_interval: Option<Duration>,
    pub version: Option<String>,
    pub ssl: Option<bool>,
    pub insecure_skip_tls_verify: Option<bool>,
    pub log_error: Option<bool>,
    pub influxdb: PartialInfluxDbConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialInfluxDbConfig {
    pub tags_as_fields: Option<Vec<String>>,
}

impl PartialConfig {
    pub fn merge_into(&self, config: &mut Config) {
        merge_option_to_value!(config, self, brokers);
        merge_option_to_value!(config, self, topic);
        merge_option!(config, self, user);
        merge_option!(config, self, password);
        merge_option_to_value!(config, self, auth_mechanism);
        merge_option_to_value!(config, self, format);
        merge_option_to_value!(config, self, push_interval);
        merge_option_to_value!(config, self, version);
        merge_option_to_value!(config, self, ssl);
        merge_option_to_value!(config, self, insecure_skip_tls_verify);
        merge_option_to_value!(config, self, log_error);
        merge_option_to_value!(config.influxdb, self.influxdb, tags_as_fields);
    }
}

#[allow(clippy::module_name_repetitions)]
pub trait ConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError>;
}

#[derive(Default)]
#[allow(clippy::module_name_repetitions)]
pub struct ConfigBuilder<'a> {
    sources: Vec<Box<dyn ConfigSource + 'a>>,
    config: Config,
}

#[allow(clippy::module_name_repetitions)]
impl<'a> ConfigBuilder<'a> {
    #[must_use]
    pub fn add_source(mut self, source: Box<dyn ConfigSource + 'a>) -> Self {
        self.sources.push(source);
        self
    }

    /// Loads every source in registration order. The first failing source
    /// aborts the build.
    pub fn build(mut self) -> Result<Config, ConfigError> {
        for source in &self.sources {
            source.load(&mut self.config)?;
        }
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Resolves the configuration from defaults, an optional JSON document, the
/// environment snapshot and the inline argument string.
pub fn resolve(
    json: Option<&[u8]>,
    env: &HashMap<String, String>,
    arg: &str,
) -> Result<Config, ConfigError> {
    let mut builder = ConfigBuilder::default();
    if let Some(raw) = json {
        builder = builder.add_source(Box::new(JsonConfigSource::new(raw)));
    }
    builder = builder.add_source(Box::new(EnvConfigSource::new(env)));
    if !arg.trim().is_empty() {
        builder = builder.add_source(Box::new(ArgConfigSource::new(arg)));
    }
    builder.build()
}

/// Folds the problems found by one source into a single error.
pub(crate) fn collect_errors(mut errors: Vec<ConfigError>) -> Result<(), ConfigError> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(ConfigError::Multiple(errors)),
    }
}
