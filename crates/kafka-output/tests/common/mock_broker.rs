// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A single-node Kafka broker speaking just enough of the protocol for the
//! producer: Metadata v0/v1/v4, Produce v0/v2/v3, SaslHandshake v0/v1 and
//! SaslAuthenticate v0.

use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};
use kafka_output::transport::protocol::{self, Decoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct MockBrokerOptions {
    pub topic: String,
    pub partitions: i32,
    pub enabled_mechanisms: Vec<String>,
    /// Credentials accepted by PLAIN authentication.
    pub plain_credentials: Option<(String, String)>,
    /// Error code returned for every produced partition.
    pub produce_error: i16,
}

impl Default for MockBrokerOptions {
    fn default() -> Self {
        MockBrokerOptions {
            topic: "k6".to_string(),
            partitions: 1,
            enabled_mechanisms: vec!["PLAIN".to_string()],
            plain_credentials: None,
            produce_error: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct Recorded {
    /// `(partition, value)` for every message appended.
    pub produced: Vec<(i32, String)>,
    pub handshakes: Vec<String>,
    pub authenticated: usize,
    /// `(api_key, api_version)` of every request.
    pub requests: Vec<(i16, i16)>,
}

pub struct MockBroker {
    pub address: String,
    recorded: Arc<Mutex<Recorded>>,
    handle: JoinHandle<()>,
}

impl MockBroker {
    pub async fn start(options: MockBrokerOptions) -> MockBroker {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let options = Arc::new(options);

        let state = Arc::clone(&recorded);
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&state);
                let options = Arc::clone(&options);
                tokio::spawn(serve(stream, address.port(), options, state));
            }
        });

        MockBroker {
            address: address.to_string(),
            recorded,
            handle,
        }
    }

    pub fn produced_values(&self) -> Vec<String> {
        let recorded = self.recorded.lock().unwrap();
        recorded.produced.iter().map(|(_, value)| value.clone()).collect()
    }

    pub fn produced_partitions(&self) -> Vec<i32> {
        let recorded = self.recorded.lock().unwrap();
        recorded.produced.iter().map(|(partition, _)| *partition).collect()
    }

    pub fn handshakes(&self) -> Vec<String> {
        self.recorded.lock().unwrap().handshakes.clone()
    }

    pub fn authenticated(&self) -> usize {
        self.recorded.lock().unwrap().authenticated
    }

    pub fn requests(&self) -> Vec<(i16, i16)> {
        self.recorded.lock().unwrap().requests.clone()
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(
    mut stream: TcpStream,
    port: u16,
    options: Arc<MockBrokerOptions>,
    recorded: Arc<Mutex<Recorded>>,
) {
    loop {
        let Ok(size) = stream.read_i32().await else {
            return;
        };
        let mut frame = vec![0; size as usize];
        if stream.read_exact(&mut frame).await.is_err() {
            return;
        }

        let mut request = Decoder::new(Bytes::from(frame));
        let api_key = request.i16().unwrap();
        let api_version = request.i16().unwrap();
        let correlation_id = request.i32().unwrap();
        let _client_id = request.string().unwrap();
        recorded.lock().unwrap().requests.push((api_key, api_version));

        let body = match api_key {
            protocol::METADATA => metadata(&mut request, api_version, port, &options),
            protocol::PRODUCE => produce(&mut request, api_version, &options, &recorded),
            protocol::SASL_HANDSHAKE => handshake(&mut request, &options, &recorded),
            protocol::SASL_AUTHENTICATE => authenticate(&mut request, &options, &recorded),
            _ => return,
        };

        let mut response = BytesMut::new();
        response.put_i32(body.len() as i32 + 4);
        response.put_i32(correlation_id);
        response.put_slice(&body);
        if stream.write_all(&response).await.is_err() {
            return;
        }
    }
}

fn metadata(request: &mut Decoder, api_version: i16, port: u16, options: &MockBrokerOptions) -> BytesMut {
    // A null array (v1+) reads as empty, the same as "all topics" in v0.
    let mut requested = Vec::new();
    for _ in 0..request.array_len().unwrap() {
        requested.push(request.string().unwrap());
    }
    if api_version >= 4 {
        assert_eq!(request.i8().unwrap(), 1, "auto topic creation flag");
    }
    assert_eq!(request.remaining(), 0);
    if requested.is_empty() {
        requested.push(options.topic.clone());
    }

    let mut body = BytesMut::new();
    if api_version >= 3 {
        body.put_i32(0); // throttle time
    }
    body.put_i32(1);
    body.put_i32(0);
    protocol::put_string(&mut body, "127.0.0.1");
    body.put_i32(i32::from(port));
    if api_version >= 1 {
        body.put_i16(-1); // rack
    }
    if api_version >= 2 {
        protocol::put_string(&mut body, "mock-cluster");
    }
    if api_version >= 1 {
        body.put_i32(0); // controller
    }

    body.put_i32(requested.len() as i32);
    for topic in requested {
        if topic != options.topic {
            body.put_i16(3); // UNKNOWN_TOPIC_OR_PARTITION
            protocol::put_string(&mut body, &topic);
            if api_version >= 1 {
                body.put_i8(0);
            }
            body.put_i32(0);
            continue;
        }
        body.put_i16(0);
        protocol::put_string(&mut body, &topic);
        if api_version >= 1 {
            body.put_i8(0); // not internal
        }
        body.put_i32(options.partitions);
        for id in 0..options.partitions {
            body.put_i16(0);
            body.put_i32(id);
            body.put_i32(0); // leader
            body.put_i32(1); // replicas
            body.put_i32(0);
            body.put_i32(1); // isr
            body.put_i32(0);
        }
    }
    body
}

fn produce(
    request: &mut Decoder,
    api_version: i16,
    options: &MockBrokerOptions,
    recorded: &Mutex<Recorded>,
) -> BytesMut {
    if api_version >= 3 {
        assert_eq!(request.nullable_string().unwrap(), None, "transactional id");
    }
    let _acks = request.i16().unwrap();
    let _timeout = request.i32().unwrap();

    let mut results = Vec::new();
    for _ in 0..request.array_len().unwrap() {
        let topic = request.string().unwrap();
        let mut partitions = Vec::new();
        for _ in 0..request.array_len().unwrap() {
            let partition = request.i32().unwrap();
            let set_size = request.i32().unwrap() as usize;
            let set = request.take(set_size, "message set").unwrap();
            let values = if api_version >= 3 {
                record_batch_values(set)
            } else {
                message_set_values(set)
            };
            if options.produce_error == 0 {
                let mut recorded = recorded.lock().unwrap();
                for value in values {
                    recorded.produced.push((partition, value));
                }
            }
            partitions.push(partition);
        }
        results.push((topic, partitions));
    }

    let mut body = BytesMut::new();
    body.put_i32(results.len() as i32);
    for (topic, partitions) in results {
        protocol::put_string(&mut body, &topic);
        body.put_i32(partitions.len() as i32);
        for partition in partitions {
            body.put_i32(partition);
            body.put_i16(options.produce_error);
            body.put_i64(0); // base offset
            if api_version >= 2 {
                body.put_i64(-1); // log append time
            }
        }
    }
    if api_version >= 1 {
        body.put_i32(0); // throttle time
    }
    body
}

fn message_set_values(set: Bytes) -> Vec<String> {
    let mut set = Decoder::new(set);
    let mut values = Vec::new();
    while set.remaining() > 0 {
        let _offset = set.i64().unwrap();
        let size = set.i32().unwrap() as usize;
        let message = set.take(size, "message").unwrap();
        let expected_crc = crc32fast::hash(&message[4..]);
        let mut message = Decoder::new(message);
        assert_eq!(message.u32().unwrap(), expected_crc, "bad message crc");
        let magic = message.i8().unwrap();
        assert!(magic <= 1, "legacy message with magic {magic}");
        let _attributes = message.i8().unwrap();
        if magic >= 1 {
            let _timestamp = message.i64().unwrap();
        }
        assert_eq!(message.bytes().unwrap(), None, "messages carry no key");
        let value = message.bytes().unwrap().unwrap();
        values.push(String::from_utf8(value.to_vec()).unwrap());
    }
    values
}

fn record_batch_values(set: Bytes) -> Vec<String> {
    let mut set = Decoder::new(set);
    let mut values = Vec::new();
    while set.remaining() > 0 {
        let _base_offset = set.i64().unwrap();
        let length = set.i32().unwrap() as usize;
        let mut batch = Decoder::new(set.take(length, "record batch").unwrap());
        let _leader_epoch = batch.i32().unwrap();
        assert_eq!(batch.i8().unwrap(), 2, "record batch magic");
        let crc = batch.u32().unwrap();
        let remaining = batch.remaining();
        let checked = batch.take(remaining, "record batch body").unwrap();
        assert_eq!(crc, crc32c::crc32c(&checked), "bad record batch crc");

        let mut batch = Decoder::new(checked);
        assert_eq!(batch.i16().unwrap(), 0, "uncompressed batch");
        let last_offset_delta = batch.i32().unwrap();
        let _first_timestamp = batch.i64().unwrap();
        let _max_timestamp = batch.i64().unwrap();
        let _producer_id = batch.i64().unwrap();
        let _producer_epoch = batch.i16().unwrap();
        let _base_sequence = batch.i32().unwrap();
        let count = batch.i32().unwrap();
        assert_eq!(last_offset_delta, count - 1);
        for offset_delta in 0..i64::from(count) {
            let length = varint(&mut batch) as usize;
            let mut record = Decoder::new(batch.take(length, "record").unwrap());
            let _attributes = record.i8().unwrap();
            let _timestamp_delta = varint(&mut record);
            assert_eq!(varint(&mut record), offset_delta);
            assert_eq!(varint(&mut record), -1, "records carry no key");
            let value_length = varint(&mut record) as usize;
            let value = record.take(value_length, "value").unwrap();
            assert_eq!(varint(&mut record), 0, "records carry no headers");
            values.push(String::from_utf8(value.to_vec()).unwrap());
        }
        assert_eq!(batch.remaining(), 0);
    }
    values
}

fn varint(decoder: &mut Decoder) -> i64 {
    let mut raw = 0u64;
    for shift in (0..64).step_by(7) {
        let byte = decoder.i8().unwrap() as u8;
        raw |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
    }
    (raw >> 1) as i64 ^ -((raw & 1) as i64)
}

fn handshake(request: &mut Decoder, options: &MockBrokerOptions, recorded: &Mutex<Recorded>) -> BytesMut {
    let mechanism = request.string().unwrap();
    let enabled = options.enabled_mechanisms.contains(&mechanism);
    recorded.lock().unwrap().handshakes.push(mechanism);

    let mut body = BytesMut::new();
    body.put_i16(if enabled { 0 } else { 33 }); // UNSUPPORTED_SASL_MECHANISM
    body.put_i32(options.enabled_mechanisms.len() as i32);
    for mechanism in &options.enabled_mechanisms {
        protocol::put_string(&mut body, mechanism);
    }
    body
}

fn authenticate(request: &mut Decoder, options: &MockBrokerOptions, recorded: &Mutex<Recorded>) -> BytesMut {
    let token = request.bytes().unwrap().unwrap_or_default();
    let accepted = options.plain_credentials.as_ref().is_some_and(|(user, password)| {
        token.as_ref() == format!("\0{user}\0{password}").as_bytes()
    });

    let mut body = BytesMut::new();
    if accepted {
        recorded.lock().unwrap().authenticated += 1;
        body.put_i16(0);
        body.put_i16(-1); // no error message
    } else {
        body.put_i16(58); // SASL_AUTHENTICATION_FAILED
        protocol::put_string(&mut body, "Authentication failed: Invalid username or password");
    }
    protocol::put_bytes(&mut body, Some(&[]));
    body
}
