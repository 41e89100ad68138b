// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! SCRAM client (RFC 5802, RFC 7677) without channel binding.

use std::num::NonZeroU32;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ring::rand::{SecureRandom, SystemRandom};
use ring::{digest, hmac, pbkdf2};

use crate::errors::TransportError;
use crate::transport::sasl::SaslConversation;

const NONCE_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScramAlgorithm {
    Sha256,
    Sha512,
}

impl ScramAlgorithm {
    #[must_use]
    pub fn mechanism_name(self) -> &'static str {
        match self {
            ScramAlgorithm::Sha256 => "SCRAM-SHA-256",
            ScramAlgorithm::Sha512 => "SCRAM-SHA-512",
        }
    }

    fn digest(self) -> &'static digest::Algorithm {
        match self {
            ScramAlgorithm::Sha256 => &digest::SHA256,
            ScramAlgorithm::Sha512 => &digest::SHA512,
        }
    }

    fn hmac(self) -> hmac::Algorithm {
        match self {
            ScramAlgorithm::Sha256 => hmac::HMAC_SHA256,
            ScramAlgorithm::Sha512 => hmac::HMAC_SHA512,
        }
    }

    fn pbkdf2(self) -> pbkdf2::Algorithm {
        match self {
            ScramAlgorithm::Sha256 => pbkdf2::PBKDF2_HMAC_SHA256,
            ScramAlgorithm::Sha512 => pbkdf2::PBKDF2_HMAC_SHA512,
        }
    }

    fn output_len(self) -> usize {
        self.digest().output_len()
    }
}

enum State {
    Initial,
    Started {
        username: String,
        password: String,
        gs2_header: String,
    },
    ClientFirstSent {
        password: String,
        gs2_header: String,
        client_first_bare: String,
        client_nonce: String,
    },
    ClientFinalSent {
        server_key: hmac::Key,
        auth_message: String,
    },
    Done,
}

pub struct ScramClient {
    algorithm: ScramAlgorithm,
    state: State,
    fixed_nonce: Option<String>,
}

impl ScramClient {
    #[must_use]
    pub fn new(algorithm: ScramAlgorithm) -> Self {
        ScramClient {
            algorithm,
            state: State::Initial,
            fixed_nonce: None,
        }
    }

    #[cfg(test)]
    fn with_nonce(algorithm: ScramAlgorithm, nonce: &str) -> Self {
        ScramClient {
            fixed_nonce: Some(nonce.to_string()),
            ..ScramClient::new(algorithm)
        }
    }

    fn nonce(&self) -> Result<String, TransportError> {
        if let Some(nonce) = &self.fixed_nonce {
            return Ok(nonce.clone());
        }
        let mut bytes = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| TransportError::Sasl("failed to generate a nonce".to_string()))?;
        Ok(STANDARD.encode(bytes))
    }

    fn client_first(&mut self, username: &str, gs2_header: &str, password: String) -> Result<Vec<u8>, TransportError> {
        let client_nonce = self.nonce()?;
        let client_first_bare = format!("n={},r={client_nonce}", escape_name(username));
        let message = format!("{gs2_header}{client_first_bare}");
        self.state = State::ClientFirstSent {
            password,
            gs2_header: gs2_header.to_string(),
            client_first_bare,
            client_nonce,
        };
        Ok(message.into_bytes())
    }

    fn client_final(
        &mut self,
        server_first: &[u8],
        password: &str,
        gs2_header: &str,
        client_first_bare: &str,
        client_nonce: &str,
    ) -> Result<Vec<u8>, TransportError> {
        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| sasl_error("server-first-message is not UTF-8"))?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for attribute in server_first.split(',') {
            match attribute.split_once('=') {
                Some(("r", value)) => nonce = Some(value),
                Some(("s", value)) => {
                    salt = Some(
                        STANDARD
                            .decode(value)
                            .map_err(|_| sasl_error("salt is not valid base64"))?,
                    );
                }
                Some(("i", value)) => {
                    iterations = value.parse::<u32>().ok().and_then(NonZeroU32::new);
                }
                Some(("m", _)) => return Err(sasl_error("mandatory extensions are not supported")),
                Some(("e", value)) => return Err(sasl_error(&format!("server error: {value}"))),
                _ => {}
            }
        }
        let nonce = nonce.ok_or_else(|| sasl_error("server-first-message has no nonce"))?;
        let salt = salt.ok_or_else(|| sasl_error("server-first-message has no salt"))?;
        let iterations =
            iterations.ok_or_else(|| sasl_error("server-first-message has no valid iteration count"))?;
        if !nonce.starts_with(client_nonce) || nonce.len() == client_nonce.len() {
            return Err(sasl_error("server nonce does not extend the client nonce"));
        }

        let mut salted_password = vec![0u8; self.algorithm.output_len()];
        pbkdf2::derive(
            self.algorithm.pbkdf2(),
            iterations,
            &salt,
            password.as_bytes(),
            &mut salted_password,
        );
        let salted_key = hmac::Key::new(self.algorithm.hmac(), &salted_password);
        let client_key = hmac::sign(&salted_key, b"Client Key");
        let stored_key = digest::digest(self.algorithm.digest(), client_key.as_ref());

        let client_final_without_proof = format!("c={},r={nonce}", STANDARD.encode(gs2_header));
        let auth_message = format!("{client_first_bare},{server_first},{client_final_without_proof}");

        let stored_key = hmac::Key::new(self.algorithm.hmac(), stored_key.as_ref());
        let client_signature = hmac::sign(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .as_ref()
            .iter()
            .zip(client_signature.as_ref())
            .map(|(key, signature)| key ^ signature)
            .collect();

        let server_key = hmac::sign(&salted_key, b"Server Key");
        self.state = State::ClientFinalSent {
            server_key: hmac::Key::new(self.algorithm.hmac(), server_key.as_ref()),
            auth_message,
        };
        Ok(format!("{client_final_without_proof},p={}", STANDARD.encode(proof)).into_bytes())
    }

    fn verify_server_final(
        server_final: &[u8],
        server_key: &hmac::Key,
        auth_message: &str,
    ) -> Result<(), TransportError> {
        let server_final = std::str::from_utf8(server_final)
            .map_err(|_| sasl_error("server-final-message is not UTF-8"))?;
        match server_final.split(',').next().and_then(|a| a.split_once('=')) {
            Some(("v", signature)) => {
                let signature = STANDARD
                    .decode(signature)
                    .map_err(|_| sasl_error("server signature is not valid base64"))?;
                hmac::verify(server_key, auth_message.as_bytes(), &signature)
                    .map_err(|_| sasl_error("server signature mismatch"))
            }
            Some(("e", reason)) => Err(sasl_error(&format!("server error: {reason}"))),
            _ => Err(sasl_error("malformed server-final-message")),
        }
    }
}

impl SaslConversation for ScramClient {
    fn begin(&mut self, user: &str, password: &str, authz_id: &str) -> Result<(), TransportError> {
        let gs2_header = if authz_id.is_empty() {
            "n,,".to_string()
        } else {
            format!("n,a={},", escape_name(authz_id))
        };
        self.state = State::Started {
            username: user.to_string(),
            password: password.to_string(),
            gs2_header,
        };
        Ok(())
    }

    fn step(&mut self, challenge: &[u8]) -> Result<Vec<u8>, TransportError> {
        match std::mem::replace(&mut self.state, State::Initial) {
            State::Initial => Err(sasl_error("conversation not started")),
            State::Started {
                username,
                password,
                gs2_header,
            } => self.client_first(&username, &gs2_header, password),
            State::ClientFirstSent {
                password,
                gs2_header,
                client_first_bare,
                client_nonce,
            } => self.client_final(
                challenge,
                &password,
                &gs2_header,
                &client_first_bare,
                &client_nonce,
            ),
            State::ClientFinalSent {
                server_key,
                auth_message,
            } => {
                Self::verify_server_final(challenge, &server_key, &auth_message)?;
                self.state = State::Done;
                Ok(Vec::new())
            }
            State::Done => {
                self.state = State::Done;
                Err(sasl_error("conversation already complete"))
            }
        }
    }

    fn done(&self) -> bool {
        matches!(self.state, State::Done)
    }
}

/// `saslname` escaping from RFC 5802 section 5.1.
fn escape_name(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

fn sasl_error(reason: &str) -> TransportError {
    TransportError::Sasl(reason.to_string())
}
