// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A single authenticated connection to one broker.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::errors::TransportError;
use crate::transport::protocol::{self, Decoder, KafkaCode, MetadataResponse, PartitionResult, TopicBatch};
use crate::transport::sasl::SaslSettings;
use crate::transport::tls;
use crate::transport::version::KafkaVersion;

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// Settings shared by every connection a producer opens.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub client_id: String,
    pub version: KafkaVersion,
    pub tls: Option<Arc<ClientConfig>>,
    pub sasl: Option<SaslSettings>,
    /// Bound on connecting and on each request round trip.
    pub timeout: Duration,
}

pub struct BrokerConnection {
    address: String,
    stream: Box<dyn Stream>,
    correlation_id: i32,
    settings: Arc<ConnectionSettings>,
}

impl BrokerConnection {
    /// Connects, negotiates TLS if configured and authenticates.
    pub async fn open(address: &str, settings: Arc<ConnectionSettings>) -> Result<Self, TransportError> {
        let connect_error = |reason: String| TransportError::Connect {
            broker: address.to_string(),
            reason,
        };
        let tcp = tokio::time::timeout(settings.timeout, TcpStream::connect(address))
            .await
            .map_err(|_| connect_error(format!("timed out after {:?}", settings.timeout)))?
            .map_err(|e| connect_error(e.to_string()))?;
        note_socket_option(address, "TCP_NODELAY", tcp.set_nodelay(true));

        let stream: Box<dyn Stream> = match &settings.tls {
            Some(tls_config) => {
                let server_name = tls::server_name(address)?;
                let connector = TlsConnector::from(Arc::clone(tls_config));
                let tls_stream = tokio::time::timeout(settings.timeout, connector.connect(server_name, tcp))
                    .await
                    .map_err(|_| TransportError::Tls(format!("handshake with {address} timed out")))?
                    .map_err(|e| TransportError::Tls(format!("handshake with {address} failed: {e}")))?;
                Box::new(tls_stream)
            }
            None => Box::new(tcp),
        };

        let mut connection = BrokerConnection {
            address: address.to_string(),
            stream,
            correlation_id: 0,
            settings,
        };
        if let Some(sasl) = connection.settings.sasl.clone() {
            connection.authenticate(&sasl).await?;
        }
        debug!("Connected to broker {address}");
        Ok(connection)
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn metadata(&mut self, topics: &[String]) -> Result<MetadataResponse, TransportError> {
        let api_version = self.settings.version.metadata_api_version();
        let body = protocol::encode_metadata_request(api_version, topics);
        let response = self.request(protocol::METADATA, api_version, &body).await?;
        protocol::decode_metadata_response(response, api_version)
    }

    /// Sends one produce request with `acks=1` and returns the per-partition
    /// outcome.
    pub async fn produce(&mut self, topics: &[TopicBatch]) -> Result<Vec<PartitionResult>, TransportError> {
        let api_version = self.settings.version.produce_api_version();
        let timeout_ms = i32::try_from(self.settings.timeout.as_millis()).unwrap_or(i32::MAX);
        let body = protocol::encode_produce_request(api_version, 1, timeout_ms, topics);
        let response = self.request(protocol::PRODUCE, api_version, &body).await?;
        protocol::decode_produce_response(response, api_version)
    }

    async fn request(&mut self, api_key: i16, api_version: i16, body: &[u8]) -> Result<Bytes, TransportError> {
        self.correlation_id = self.correlation_id.wrapping_add(1);
        let correlation_id = self.correlation_id;
        let frame = protocol::encode_request(
            api_key,
            api_version,
            correlation_id,
            &self.settings.client_id,
            body,
        );

        let timeout = self.settings.timeout;
        let response = tokio::time::timeout(timeout, self.round_trip(&frame))
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;

        let mut decoder = Decoder::new(response);
        let received = decoder.i32()?;
        if received != correlation_id {
            return Err(TransportError::Protocol(format!(
                "correlation id mismatch: sent {correlation_id}, received {received}"
            )));
        }
        let remaining = decoder.remaining();
        decoder.take(remaining, "response body")
    }

    async fn round_trip(&mut self, frame: &[u8]) -> Result<Bytes, TransportError> {
        self.stream.write_all(frame).await?;
        self.stream.flush().await?;
        self.read_frame().await
    }

    async fn read_frame(&mut self) -> Result<Bytes, TransportError> {
        let size = self.stream.read_i32().await?;
        let size = usize::try_from(size)
            .ok()
            .filter(|size| *size <= protocol::MAX_FRAME_SIZE)
            .ok_or_else(|| TransportError::Protocol(format!("invalid frame size {size}")))?;
        let mut buf = BytesMut::zeroed(size);
        self.stream.read_exact(&mut buf).await?;
        Ok(buf.freeze())
    }

    /// Raw size-prefixed token exchange used after a v0 handshake.
    async fn exchange_raw(&mut self, token: &[u8]) -> Result<Bytes, TransportError> {
        let mut frame = BytesMut::with_capacity(4 + token.len());
        frame.extend_from_slice(&(token.len() as i32).to_be_bytes());
        frame.extend_from_slice(token);
        let timeout = self.settings.timeout;
        tokio::time::timeout(timeout, self.round_trip(&frame))
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
    }

    async fn authenticate(&mut self, sasl: &SaslSettings) -> Result<(), TransportError> {
        let version = self.settings.version;
        if !version.supports_sasl() {
            return Err(TransportError::SaslUnsupported(version));
        }
        let mechanism = sasl.strategy.mechanism_name();
        let handshake_version = i16::from(version.supports_sasl_authenticate());

        let mut body = BytesMut::new();
        protocol::put_string(&mut body, mechanism);
        let response = self
            .request(protocol::SASL_HANDSHAKE, handshake_version, &body)
            .await?;
        let (error, enabled) = protocol::decode_sasl_handshake_response(response)?;
        if !error.is_ok() {
            return Err(if error == KafkaCode::UNSUPPORTED_SASL_MECHANISM {
                TransportError::Sasl(format!(
                    "broker does not enable {mechanism}, enabled mechanisms: {}",
                    enabled.join(", ")
                ))
            } else {
                error.into_error()
            });
        }

        let mut conversation = sasl.strategy.conversation();
        conversation.begin(&sasl.user, &sasl.password, "")?;
        let mut token = conversation.step(&[])?;
        loop {
            let challenge = if version.supports_sasl_authenticate() {
                self.sasl_authenticate(&token).await?
            } else {
                self.exchange_raw(&token).await?
            };
            if conversation.done() {
                break;
            }
            token = conversation.step(&challenge)?;
            if conversation.done() {
                break;
            }
        }
        debug!("Authenticated to {} with {mechanism}", self.address);
        Ok(())
    }

    async fn sasl_authenticate(&mut self, token: &[u8]) -> Result<Bytes, TransportError> {
        let mut body = BytesMut::new();
        protocol::put_bytes(&mut body, Some(token));
        let response = self.request(protocol::SASL_AUTHENTICATE, 0, &body).await?;
        let response = protocol::decode_sasl_authenticate_response(response)?;
        if !response.error.is_ok() {
            return Err(TransportError::Sasl(response.error_message.unwrap_or_else(|| {
                response.error.name().to_string()
            })));
        }
        Ok(response.auth_bytes)
    }
}

/// Logs a socket option the OS refused. The connection stays usable.
fn note_socket_option(address: &str, option: &str, result: std::io::Result<()>) {
    if let Err(e) = result {
        debug!("Could not set {option} on the connection to {address}: {e}");
    }
}
