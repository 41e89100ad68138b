// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Encoding and decoding of the Kafka requests the producer needs.
//!
//! All integers are big-endian. Strings carry an `i16` length and byte arrays
//! an `i32` length, `-1` standing for null.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::TransportError;

pub const PRODUCE: i16 = 0;
pub const METADATA: i16 = 3;
pub const SASL_HANDSHAKE: i16 = 17;
pub const SASL_AUTHENTICATE: i16 = 36;

/// Frames larger than this are treated as a corrupt stream.
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Broker error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KafkaCode(pub i16);

impl KafkaCode {
    pub const NONE: KafkaCode = KafkaCode(0);
    pub const UNKNOWN_TOPIC_OR_PARTITION: KafkaCode = KafkaCode(3);
    pub const LEADER_NOT_AVAILABLE: KafkaCode = KafkaCode(5);
    pub const NOT_LEADER_FOR_PARTITION: KafkaCode = KafkaCode(6);
    pub const UNSUPPORTED_SASL_MECHANISM: KafkaCode = KafkaCode(33);

    #[must_use]
    pub fn is_ok(self) -> bool {
        self == KafkaCode::NONE
    }

    /// Codes after which the cached metadata is stale.
    #[must_use]
    pub fn invalidates_metadata(self) -> bool {
        matches!(self.0, 3 | 5 | 6)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self.0 {
            -1 => "UNKNOWN_SERVER_ERROR",
            0 => "NONE",
            1 => "OFFSET_OUT_OF_RANGE",
            2 => "CORRUPT_MESSAGE",
            3 => "UNKNOWN_TOPIC_OR_PARTITION",
            4 => "INVALID_FETCH_SIZE",
            5 => "LEADER_NOT_AVAILABLE",
            6 => "NOT_LEADER_FOR_PARTITION",
            7 => "REQUEST_TIMED_OUT",
            8 => "BROKER_NOT_AVAILABLE",
            9 => "REPLICA_NOT_AVAILABLE",
            10 => "MESSAGE_TOO_LARGE",
            17 => "INVALID_TOPIC_EXCEPTION",
            18 => "RECORD_LIST_TOO_LARGE",
            19 => "NOT_ENOUGH_REPLICAS",
            20 => "NOT_ENOUGH_REPLICAS_AFTER_APPEND",
            29 => "TOPIC_AUTHORIZATION_FAILED",
            33 => "UNSUPPORTED_SASL_MECHANISM",
            34 => "ILLEGAL_SASL_STATE",
            35 => "UNSUPPORTED_VERSION",
            58 => "SASL_AUTHENTICATION_FAILED",
            _ => "UNKNOWN",
        }
    }

    #[must_use]
    pub fn into_error(self) -> TransportError {
        TransportError::Broker {
            code: self.0,
            name: self.name(),
        }
    }
}

pub fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_i16(value.len() as i16);
    buf.put_slice(value.as_bytes());
}

pub fn put_bytes(buf: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        Some(value) => {
            buf.put_i32(value.len() as i32);
            buf.put_slice(value);
        }
        None => buf.put_i32(-1),
    }
}

/// Size-prefixed request frame with the v1 request header.
#[must_use]
pub fn encode_request(
    api_key: i16,
    api_version: i16,
    correlation_id: i32,
    client_id: &str,
    body: &[u8],
) -> Bytes {
    let mut frame = BytesMut::with_capacity(4 + 10 + client_id.len() + body.len());
    frame.put_i32(0);
    frame.put_i16(api_key);
    frame.put_i16(api_version);
    frame.put_i32(correlation_id);
    put_string(&mut frame, client_id);
    frame.put_slice(body);
    let size = (frame.len() - 4) as i32;
    frame[..4].copy_from_slice(&size.to_be_bytes());
    frame.freeze()
}

/// Bounds-checked reader over a response body.
pub struct Decoder {
    buf: Bytes,
}

impl Decoder {
    #[must_use]
    pub fn new(buf: Bytes) -> Self {
        Decoder { buf }
    }

    fn need(&self, len: usize, what: &str) -> Result<(), TransportError> {
        if self.buf.remaining() < len {
            return Err(TransportError::Protocol(format!(
                "response truncated while reading {what}"
            )));
        }
        Ok(())
    }

    pub fn i8(&mut self) -> Result<i8, TransportError> {
        self.need(1, "int8")?;
        Ok(self.buf.get_i8())
    }

    pub fn i16(&mut self) -> Result<i16, TransportError> {
        self.need(2, "int16")?;
        Ok(self.buf.get_i16())
    }

    pub fn i32(&mut self) -> Result<i32, TransportError> {
        self.need(4, "int32")?;
        Ok(self.buf.get_i32())
    }

    pub fn i64(&mut self) -> Result<i64, TransportError> {
        self.need(8, "int64")?;
        Ok(self.buf.get_i64())
    }

    pub fn u32(&mut self) -> Result<u32, TransportError> {
        self.need(4, "uint32")?;
        Ok(self.buf.get_u32())
    }

    pub fn string(&mut self) -> Result<String, TransportError> {
        self.nullable_string()?
            .ok_or_else(|| TransportError::Protocol("unexpected null string".to_string()))
    }

    pub fn nullable_string(&mut self) -> Result<Option<String>, TransportError> {
        let len = self.i16()?;
        if len < 0 {
            return Ok(None);
        }
        let raw = self.take(len as usize, "string")?;
        String::from_utf8(raw.to_vec())
            .map(Some)
            .map_err(|_| TransportError::Protocol("string is not UTF-8".to_string()))
    }

    pub fn bytes(&mut self) -> Result<Option<Bytes>, TransportError> {
        let len = self.i32()?;
        if len < 0 {
            return Ok(None);
        }
        self.take(len as usize, "bytes").map(Some)
    }

    pub fn take(&mut self, len: usize, what: &str) -> Result<Bytes, TransportError> {
        self.need(len, what)?;
        Ok(self.buf.split_to(len))
    }

    /// Array length; null arrays read as empty.
    pub fn array_len(&mut self) -> Result<usize, TransportError> {
        let len = self.i32()?;
        let len = usize::try_from(len).unwrap_or(0);
        // Each element takes at least one byte.
        if len > self.buf.remaining() {
            return Err(TransportError::Protocol(format!(
                "array length {len} exceeds the response size"
            )));
        }
        Ok(len)
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMetadata {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
}

impl BrokerMetadata {
    #[must_use]
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMetadata {
    pub error: KafkaCode,
    pub id: i32,
    pub leader: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMetadata {
    pub error: KafkaCode,
    pub name: String,
    pub partitions: Vec<PartitionMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataResponse {
    pub brokers: Vec<BrokerMetadata>,
    pub topics: Vec<TopicMetadata>,
}

/// Metadata request. An empty topic list asks for every topic: an empty
/// array in v0, a null array from v1 on.
#[must_use]
pub fn encode_metadata_request(api_version: i16, topics: &[String]) -> BytesMut {
    let mut body = BytesMut::new();
    if topics.is_empty() && api_version >= 1 {
        body.put_i32(-1);
    } else {
        body.put_i32(topics.len() as i32);
        for topic in topics {
            put_string(&mut body, topic);
        }
    }
    if api_version >= 4 {
        body.put_i8(1); // allow_auto_topic_creation
    }
    body
}

pub fn decode_metadata_response(
    body: Bytes,
    api_version: i16,
) -> Result<MetadataResponse, TransportError> {
    let mut decoder = Decoder::new(body);
    if api_version >= 3 {
        decoder.i32()?; // throttle time
    }

    let broker_count = decoder.array_len()?;
    let mut brokers = Vec::with_capacity(broker_count);
    for _ in 0..broker_count {
        let node_id = decoder.i32()?;
        let host = decoder.string()?;
        let port = decoder.i32()?;
        if api_version >= 1 {
            decoder.nullable_string()?; // rack
        }
        brokers.push(BrokerMetadata {
            node_id,
            host,
            port,
        });
    }
    if api_version >= 2 {
        decoder.nullable_string()?; // cluster id
    }
    if api_version >= 1 {
        decoder.i32()?; // controller id
    }

    let topic_count = decoder.array_len()?;
    let mut topics = Vec::with_capacity(topic_count);
    for _ in 0..topic_count {
        let error = KafkaCode(decoder.i16()?);
        let name = decoder.string()?;
        if api_version >= 1 {
            decoder.i8()?; // is internal
        }
        let partition_count = decoder.array_len()?;
        let mut partitions = Vec::with_capacity(partition_count);
        for _ in 0..partition_count {
            let error = KafkaCode(decoder.i16()?);
            let id = decoder.i32()?;
            let leader = decoder.i32()?;
            for _ in 0..decoder.array_len()? {
                decoder.i32()?; // replica
            }
            for _ in 0..decoder.array_len()? {
                decoder.i32()?; // in-sync replica
            }
            partitions.push(PartitionMetadata { error, id, leader });
        }
        topics.push(TopicMetadata {
            error,
            name,
            partitions,
        });
    }
    Ok(MetadataResponse { brokers, topics })
}

/// Zigzag varint as used inside record batches.
pub fn put_varint(buf: &mut BytesMut, value: i64) {
    let mut zigzag = ((value << 1) ^ (value >> 63)) as u64;
    while zigzag >= 0x80 {
        buf.put_u8((zigzag as u8) | 0x80);
        zigzag >>= 7;
    }
    buf.put_u8(zigzag as u8);
}

/// Appends `values` in the encoding `magic` selects: one record batch for
/// magic 2, one legacy message each otherwise.
pub fn put_records(set: &mut BytesMut, magic: i8, timestamp_ms: i64, values: &[&[u8]]) {
    if magic >= 2 {
        put_record_batch(set, timestamp_ms, values);
    } else {
        for value in values {
            put_message(set, magic, timestamp_ms, value);
        }
    }
}

/// Appends an uncompressed, non-transactional record batch (magic 2). All
/// records share `timestamp_ms`.
pub fn put_record_batch(set: &mut BytesMut, timestamp_ms: i64, values: &[&[u8]]) {
    let mut records = BytesMut::new();
    let mut record = BytesMut::new();
    for (offset_delta, value) in values.iter().enumerate() {
        record.clear();
        record.put_i8(0); // attributes
        put_varint(&mut record, 0); // timestamp delta
        put_varint(&mut record, offset_delta as i64);
        put_varint(&mut record, -1); // null key
        put_varint(&mut record, value.len() as i64);
        record.put_slice(value);
        put_varint(&mut record, 0); // headers
        put_varint(&mut records, record.len() as i64);
        records.put_slice(&record);
    }

    // The CRC covers everything from the attributes on.
    let mut body = BytesMut::with_capacity(40 + records.len());
    body.put_i16(0); // attributes: no compression
    body.put_i32(values.len().saturating_sub(1) as i32); // last offset delta
    body.put_i64(timestamp_ms); // first timestamp
    body.put_i64(timestamp_ms); // max timestamp
    body.put_i64(-1); // producer id
    body.put_i16(-1); // producer epoch
    body.put_i32(-1); // base sequence
    body.put_i32(values.len() as i32);
    body.put_slice(&records);
    let crc = crc32c::crc32c(&body);

    set.put_i64(0); // base offset, assigned by the broker
    set.put_i32((4 + 1 + 4 + body.len()) as i32);
    set.put_i32(-1); // partition leader epoch
    set.put_i8(2);
    set.put_u32(crc);
    set.put_slice(&body);
}

/// Appends one message to a legacy message set (magic 0 or 1).
pub fn put_message(set: &mut BytesMut, magic: i8, timestamp_ms: i64, value: &[u8]) {
    let mut message = BytesMut::new();
    message.put_i8(magic);
    message.put_i8(0); // attributes: no compression
    if magic >= 1 {
        message.put_i64(timestamp_ms);
    }
    put_bytes(&mut message, None); // key
    put_bytes(&mut message, Some(value));
    let crc = crc32fast::hash(&message);

    set.put_i64(0); // offset, assigned by the broker
    set.put_i32(message.len() as i32 + 4);
    set.put_u32(crc);
    set.put_slice(&message);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionBatch {
    pub partition: i32,
    /// Message set or record batch, as [`put_records`] wrote it.
    pub records: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBatch {
    pub topic: String,
    pub partitions: Vec<PartitionBatch>,
}

/// Produce request body. v3 adds the transactional id in front.
#[must_use]
pub fn encode_produce_request(
    api_version: i16,
    acks: i16,
    timeout_ms: i32,
    topics: &[TopicBatch],
) -> BytesMut {
    let mut body = BytesMut::new();
    if api_version >= 3 {
        body.put_i16(-1); // transactional id
    }
    body.put_i16(acks);
    body.put_i32(timeout_ms);
    body.put_i32(topics.len() as i32);
    for topic in topics {
        put_string(&mut body, &topic.topic);
        body.put_i32(topic.partitions.len() as i32);
        for partition in &topic.partitions {
            body.put_i32(partition.partition);
            body.put_i32(partition.records.len() as i32);
            body.put_slice(&partition.records);
        }
    }
    body
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionResult {
    pub topic: String,
    pub partition: i32,
    pub error: KafkaCode,
}

pub fn decode_produce_response(
    body: Bytes,
    api_version: i16,
) -> Result<Vec<PartitionResult>, TransportError> {
    let mut decoder = Decoder::new(body);
    let mut results = Vec::new();
    for _ in 0..decoder.array_len()? {
        let topic = decoder.string()?;
        for _ in 0..decoder.array_len()? {
            let partition = decoder.i32()?;
            let error = KafkaCode(decoder.i16()?);
            decoder.i64()?; // base offset
            if api_version >= 2 {
                decoder.i64()?; // log append time
            }
            results.push(PartitionResult {
                topic: topic.clone(),
                partition,
                error,
            });
        }
    }
    Ok(results)
}

/// SaslHandshake response: error code and the mechanisms the broker enables.
pub fn decode_sasl_handshake_response(
    body: Bytes,
) -> Result<(KafkaCode, Vec<String>), TransportError> {
    let mut decoder = Decoder::new(body);
    let error = KafkaCode(decoder.i16()?);
    let count = decoder.array_len()?;
    let mut mechanisms = Vec::with_capacity(count);
    for _ in 0..count {
        mechanisms.push(decoder.string()?);
    }
    Ok((error, mechanisms))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslAuthenticateResponse {
    pub error: KafkaCode,
    pub error_message: Option<String>,
    pub auth_bytes: Bytes,
}

pub fn decode_sasl_authenticate_response(
    body: Bytes,
) -> Result<SaslAuthenticateResponse, TransportError> {
    let mut decoder = Decoder::new(body);
    Ok(SaslAuthenticateResponse {
        error: KafkaCode(decoder.i16()?),
        error_message: decoder.nullable_string()?,
        auth_bytes: decoder.bytes()?.unwrap_or_default(),
    })
}
