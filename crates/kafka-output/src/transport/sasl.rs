// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! SASL mechanisms and the client side of their conversations.

use crate::config::AuthMechanism;
use crate::errors::TransportError;
use crate::transport::scram::{ScramAlgorithm, ScramClient};

/// Client half of a challenge/response exchange.
///
/// `begin` is called once with the credentials, then `step` is fed the
/// server's last message (empty for the first step) until `done` returns true.
pub trait SaslConversation: Send {
    fn begin(&mut self, user: &str, password: &str, authz_id: &str) -> Result<(), TransportError>;
    fn step(&mut self, challenge: &[u8]) -> Result<Vec<u8>, TransportError>;
    fn done(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslStrategy {
    Plain,
    Scram(ScramAlgorithm),
}

impl SaslStrategy {
    /// `None` when the mechanism does not authenticate.
    #[must_use]
    pub fn from_mechanism(mechanism: AuthMechanism) -> Option<Self> {
        match mechanism {
            AuthMechanism::None => None,
            AuthMechanism::Plain => Some(SaslStrategy::Plain),
            AuthMechanism::ScramSha256 => Some(SaslStrategy::Scram(ScramAlgorithm::Sha256)),
            AuthMechanism::ScramSha512 => Some(SaslStrategy::Scram(ScramAlgorithm::Sha512)),
        }
    }

    /// Mechanism name sent in the SASL handshake.
    #[must_use]
    pub fn mechanism_name(self) -> &'static str {
        match self {
            SaslStrategy::Plain => "PLAIN",
            SaslStrategy::Scram(algorithm) => algorithm.mechanism_name(),
        }
    }

    /// A fresh conversation, one per connection.
    #[must_use]
    pub fn conversation(self) -> Box<dyn SaslConversation> {
        match self {
            SaslStrategy::Plain => Box::new(PlainConversation::default()),
            SaslStrategy::Scram(algorithm) => Box::new(ScramClient::new(algorithm)),
        }
    }
}

/// Credentials and strategy shared by every broker connection.
#[derive(Clone, PartialEq, Eq)]
pub struct SaslSettings {
    pub strategy: SaslStrategy,
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for SaslSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaslSettings")
            .field("strategy", &self.strategy)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// RFC 4616: a single `authzid NUL authcid NUL passwd` message.
#[derive(Debug, Default)]
pub struct PlainConversation {
    token: Option<Vec<u8>>,
    done: bool,
}

impl SaslConversation for PlainConversation {
    fn begin(&mut self, user: &str, password: &str, authz_id: &str) -> Result<(), TransportError> {
        let mut token = Vec::with_capacity(authz_id.len() + user.len() + password.len() + 2);
        token.extend_from_slice(authz_id.as_bytes());
        token.push(0);
        token.extend_from_slice(user.as_bytes());
        token.push(0);
        token.extend_from_slice(password.as_bytes());
        self.token = Some(token);
        Ok(())
    }

    fn step(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, TransportError> {
        let token = self
            .token
            .take()
            .ok_or_else(|| TransportError::Sasl("PLAIN conversation not started".to_string()))?;
        self.done = true;
        Ok(token)
    }

    fn done(&self) -> bool {
        self.done
    }
}
