// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::str::FromStr;

/// SASL mechanism used to authenticate against the brokers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AuthMechanism {
    #[default]
    None,
    Plain,
    ScramSha256,
    ScramSha512,
}

impl AuthMechanism {
    /// Every mechanism except `none` needs a user and a password.
    #[must_use]
    pub fn requires_credentials(self) -> bool {
        self != AuthMechanism::None
    }
}

impl FromStr for AuthMechanism {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(AuthMechanism::None),
            "plain" => Ok(AuthMechanism::Plain),
            "scram-sha-256" => Ok(AuthMechanism::ScramSha256),
            "scram-sha-512" => Ok(AuthMechanism::ScramSha512),
            other => Err(format!(
                "unknown auth mechanism '{other}', expected one of none, plain, scram-sha-256, scram-sha-512"
            )),
        }
    }
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthMechanism::None => "none",
            AuthMechanism::Plain => "plain",
            AuthMechanism::ScramSha256 => "scram-sha-256",
            AuthMechanism::ScramSha512 => "scram-sha-512",
        };
        f.write_str(name)
    }
}
