// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::str::FromStr;

use crate::errors::TransportError;

/// Kafka release the cluster runs, used to pick wire API versions.
///
/// Releases before 1.0 have four components (`0.10.2.1`), later ones three
/// (`2.1.0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KafkaVersion([u16; 4]);

impl KafkaVersion {
    pub const V0_8_2_0: KafkaVersion = KafkaVersion::new(0, 8, 2, 0);
    pub const V0_10_0_0: KafkaVersion = KafkaVersion::new(0, 10, 0, 0);
    pub const V0_11_0_0: KafkaVersion = KafkaVersion::new(0, 11, 0, 0);
    pub const V1_0_0_0: KafkaVersion = KafkaVersion::new(1, 0, 0, 0);
    /// First release line whose wire versions are not known to this client.
    pub const V5_0_0_0: KafkaVersion = KafkaVersion::new(5, 0, 0, 0);

    #[must_use]
    pub const fn new(major: u16, minor: u16, very_minor: u16, patch: u16) -> Self {
        KafkaVersion([major, minor, very_minor, patch])
    }

    /// Rejects releases the producer cannot talk to: anything before 0.8.2
    /// and release lines newer than 4.x.
    pub fn ensure_supported(self) -> Result<Self, TransportError> {
        if self < Self::V0_8_2_0 || self >= Self::V5_0_0_0 {
            return Err(TransportError::UnsupportedVersion(self));
        }
        Ok(self)
    }

    /// Produce request version. v3 carries record batches (message format
    /// v2), v2 carries message format v1 with timestamps.
    #[must_use]
    pub fn produce_api_version(self) -> i16 {
        if self >= Self::V0_11_0_0 {
            3
        } else if self >= Self::V0_10_0_0 {
            2
        } else {
            0
        }
    }

    #[must_use]
    pub fn message_magic(self) -> i8 {
        if self >= Self::V0_11_0_0 {
            2
        } else if self >= Self::V0_10_0_0 {
            1
        } else {
            0
        }
    }

    /// Metadata request version. v1 turns a null topic list into "all
    /// topics", v4 adds the auto-creation flag.
    #[must_use]
    pub fn metadata_api_version(self) -> i16 {
        if self >= Self::V1_0_0_0 {
            4
        } else if self >= Self::V0_10_0_0 {
            1
        } else {
            0
        }
    }

    /// Whether SASL tokens travel in `SaslAuthenticate` requests (v1
    /// handshake) rather than as raw size-prefixed frames (v0 handshake).
    #[must_use]
    pub fn supports_sasl_authenticate(self) -> bool {
        self >= Self::V1_0_0_0
    }

    #[must_use]
    pub fn supports_sasl(self) -> bool {
        self >= Self::V0_10_0_0
    }
}

impl Default for KafkaVersion {
    fn default() -> Self {
        Self::V1_0_0_0
    }
}

impl FromStr for KafkaVersion {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::InvalidVersion(s.to_string());
        let parts = s
            .split('.')
            .map(|part| {
                if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid());
                }
                part.parse::<u16>().map_err(|_| invalid())
            })
            .collect::<Result<Vec<_>, _>>()?;

        match parts.as_slice() {
            [0, minor, very_minor, patch] => Ok(KafkaVersion::new(0, *minor, *very_minor, *patch)),
            [major, minor, patch] if *major >= 1 => Ok(KafkaVersion::new(*major, *minor, *patch, 0)),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for KafkaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [major, minor, very_minor, patch] = self.0;
        if major == 0 {
            write!(f, "{major}.{minor}.{very_minor}.{patch}")
        } else {
            write!(f, "{major}.{minor}.{very_minor}")
        }
    }
}
