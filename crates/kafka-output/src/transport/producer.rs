// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Asynchronous Kafka producer.
//!
//! Messages sent on the input channel are picked up by a dispatcher task,
//! batched, spread round-robin over the topic's partitions and written to the
//! partition leaders with `acks=1`. Failures are reported per message on the
//! error channel when the producer was configured to return them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::TransportError;
use crate::transport::broker::{BrokerConnection, ConnectionSettings};
use crate::transport::protocol::{self, MetadataResponse, PartitionBatch, PartitionMetadata, TopicBatch};
use crate::transport::{AsyncProducer, ProducerConfig, ProducerError, ProducerMessage};

pub struct KafkaProducer {
    input: mpsc::Sender<ProducerMessage>,
    errors: Option<mpsc::Receiver<ProducerError>>,
    close_token: CancellationToken,
    dispatcher: Option<JoinHandle<()>>,
}

impl KafkaProducer {
    /// Fetches cluster metadata from the first reachable bootstrap broker and
    /// starts the dispatcher. Must be called within a tokio runtime.
    pub async fn connect(config: ProducerConfig) -> Result<Self, TransportError> {
        let mut cluster = Cluster::new(&config);
        cluster.refresh_metadata(&[]).await?;
        debug!(
            "Kafka producer connected, {} brokers and {} topics known",
            cluster.brokers.len(),
            cluster.topics.len()
        );

        let (input_tx, input_rx) = mpsc::channel(config.channel_buffer_size);
        let (errors_tx, errors_rx) = if config.return_errors {
            let (tx, rx) = mpsc::channel(config.channel_buffer_size);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let close_token = CancellationToken::new();
        let dispatcher = Dispatcher {
            cluster,
            input: input_rx,
            errors: errors_tx,
            close_token: close_token.clone(),
            max_batch_messages: config.max_batch_messages.max(1),
            next_partition: HashMap::new(),
        };

        Ok(KafkaProducer {
            input: input_tx,
            errors: errors_rx,
            close_token,
            dispatcher: Some(tokio::spawn(dispatcher.run())),
        })
    }
}

#[async_trait]
impl AsyncProducer for KafkaProducer {
    fn input(&self) -> mpsc::Sender<ProducerMessage> {
        self.input.clone()
    }

    fn take_errors(&mut self) -> Option<mpsc::Receiver<ProducerError>> {
        self.errors.take()
    }

    async fn close(mut self: Box<Self>) -> Result<(), TransportError> {
        self.close_token.cancel();
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher
                .await
                .map_err(|e| TransportError::Protocol(format!("producer dispatcher failed: {e}")))?;
        }
        Ok(())
    }
}

impl Drop for KafkaProducer {
    fn drop(&mut self) {
        self.close_token.cancel();
    }
}

struct Dispatcher {
    cluster: Cluster,
    input: mpsc::Receiver<ProducerMessage>,
    errors: Option<mpsc::Sender<ProducerError>>,
    close_token: CancellationToken,
    max_batch_messages: usize,
    next_partition: HashMap<String, usize>,
}

impl Dispatcher {
    async fn run(mut self) {
        loop {
            let first = tokio::select! {
                biased;
                message = self.input.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
                () = self.close_token.cancelled() => break,
            };
            let mut batch = vec![first];
            self.fill_batch(&mut batch);
            self.dispatch(batch).await;
        }

        // Deliver whatever was accepted before the close.
        self.input.close();
        loop {
            let mut batch = Vec::new();
            self.fill_batch(&mut batch);
            if batch.is_empty() {
                break;
            }
            self.dispatch(batch).await;
        }
        debug!("Kafka producer dispatcher stopped");
    }

    fn fill_batch(&mut self, batch: &mut Vec<ProducerMessage>) {
        while batch.len() < self.max_batch_messages {
            match self.input.try_recv() {
                Ok(message) => batch.push(message),
                Err(_) => break,
            }
        }
    }

    async fn dispatch(&mut self, batch: Vec<ProducerMessage>) {
        let mut by_topic: Vec<(String, Vec<ProducerMessage>)> = Vec::new();
        for message in batch {
            match by_topic.iter_mut().find(|(topic, _)| *topic == message.topic) {
                Some((_, messages)) => messages.push(message),
                None => by_topic.push((message.topic.clone(), vec![message])),
            }
        }

        for (topic, messages) in by_topic {
            let partitions = match self.cluster.partitions_for(&topic).await {
                Ok(partitions) => partitions,
                Err(e) => {
                    self.fail(messages, &e).await;
                    continue;
                }
            };

            let counter = self.next_partition.entry(topic.clone()).or_default();
            let mut by_leader: BTreeMap<i32, BTreeMap<i32, Vec<ProducerMessage>>> = BTreeMap::new();
            for message in messages {
                let partition = round_robin(counter, &partitions);
                by_leader
                    .entry(partition.leader)
                    .or_default()
                    .entry(partition.id)
                    .or_default()
                    .push(message);
            }

            for (leader, partitions) in by_leader {
                self.send_to_leader(&topic, leader, partitions).await;
            }
        }
    }

    async fn send_to_leader(
        &mut self,
        topic: &str,
        leader: i32,
        mut partitions: BTreeMap<i32, Vec<ProducerMessage>>,
    ) {
        let magic = self.cluster.settings.version.message_magic();
        let timestamp_ms = Utc::now().timestamp_millis();
        let request = [TopicBatch {
            topic: topic.to_string(),
            partitions: partitions
                .iter()
                .map(|(id, messages)| {
                    let values: Vec<&[u8]> = messages.iter().map(|m| m.value.as_bytes()).collect();
                    let mut records = BytesMut::new();
                    protocol::put_records(&mut records, magic, timestamp_ms, &values);
                    PartitionBatch {
                        partition: *id,
                        records: records.freeze(),
                    }
                })
                .collect(),
        }];

        let result = match self.cluster.leader_connection(leader).await {
            Ok(connection) => connection.produce(&request).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(results) => {
                for result in results {
                    let Some(messages) = partitions.remove(&result.partition) else {
                        continue;
                    };
                    if result.error.is_ok() {
                        continue;
                    }
                    if result.error.invalidates_metadata() {
                        self.cluster.invalidate_topic(topic);
                    }
                    self.fail(messages, &result.error.into_error()).await;
                }
                for (id, messages) in partitions {
                    let error = TransportError::Protocol(format!("no produce result for {topic}/{id}"));
                    self.fail(messages, &error).await;
                }
            }
            Err(e) => {
                debug!("Produce to broker {leader} failed: {e}");
                self.cluster.drop_connection(leader);
                self.cluster.invalidate_topic(topic);
                for messages in partitions.into_values() {
                    self.fail(messages, &e).await;
                }
            }
        }
    }

    async fn fail(&mut self, messages: Vec<ProducerMessage>, error: &TransportError) {
        match &self.errors {
            Some(errors) => {
                for message in messages {
                    let failure = ProducerError {
                        message,
                        error: error.clone(),
                    };
                    if errors.send(failure).await.is_err() {
                        break;
                    }
                }
            }
            None => debug!("Dropped {} messages: {error}", messages.len()),
        }
    }
}

fn round_robin<'a>(counter: &mut usize, partitions: &'a [PartitionMetadata]) -> &'a PartitionMetadata {
    let partition = &partitions[*counter % partitions.len()];
    *counter = counter.wrapping_add(1);
    partition
}

/// Cached cluster view and the connections opened so far.
struct Cluster {
    bootstrap: Vec<String>,
    settings: Arc<ConnectionSettings>,
    brokers: HashMap<i32, String>,
    /// Only partitions with an available leader.
    topics: HashMap<String, Vec<PartitionMetadata>>,
    connections: HashMap<i32, BrokerConnection>,
    metadata_connection: Option<BrokerConnection>,
    retries: usize,
    retry_backoff: std::time::Duration,
}

impl Cluster {
    fn new(config: &ProducerConfig) -> Self {
        Cluster {
            bootstrap: config.brokers.clone(),
            settings: Arc::new(config.connection.clone()),
            brokers: HashMap::new(),
            topics: HashMap::new(),
            connections: HashMap::new(),
            metadata_connection: None,
            retries: config.metadata_retries,
            retry_backoff: config.metadata_retry_backoff,
        }
    }

    /// Empty `topics` fetches every topic.
    async fn refresh_metadata(&mut self, topics: &[String]) -> Result<(), TransportError> {
        let metadata = self.fetch_metadata(topics).await?;
        self.apply(metadata);
        Ok(())
    }

    async fn fetch_metadata(&mut self, topics: &[String]) -> Result<MetadataResponse, TransportError> {
        if let Some(connection) = self.metadata_connection.as_mut() {
            match connection.metadata(topics).await {
                Ok(metadata) => return Ok(metadata),
                Err(e) => {
                    debug!("Metadata request to {} failed: {e}", connection.address());
                    self.metadata_connection = None;
                }
            }
        }

        let mut candidates = self.bootstrap.clone();
        for address in self.brokers.values() {
            if !candidates.contains(address) {
                candidates.push(address.clone());
            }
        }

        let mut last_error = None;
        for address in candidates {
            let attempt = match BrokerConnection::open(&address, Arc::clone(&self.settings)).await {
                Ok(mut connection) => connection
                    .metadata(topics)
                    .await
                    .map(|metadata| (connection, metadata)),
                Err(e) => Err(e),
            };
            match attempt {
                Ok((connection, metadata)) => {
                    self.metadata_connection = Some(connection);
                    return Ok(metadata);
                }
                Err(e) => {
                    warn!("Kafka broker {address} unavailable: {e}");
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            // Authentication and TLS failures are reported as they are.
            Some(e @ (TransportError::Sasl(_) | TransportError::SaslUnsupported(_) | TransportError::Tls(_))) => e,
            Some(e) => TransportError::NoBrokerAvailable(e.to_string()),
            None => TransportError::NoBrokerAvailable("no broker addresses configured".to_string()),
        })
    }

    fn apply(&mut self, metadata: MetadataResponse) {
        for broker in metadata.brokers {
            let address = broker.address();
            if self.brokers.get(&broker.node_id) != Some(&address) {
                self.connections.remove(&broker.node_id);
                self.brokers.insert(broker.node_id, address);
            }
        }
        for topic in metadata.topics {
            if !topic.error.is_ok() {
                self.topics.remove(&topic.name);
                continue;
            }
            let mut partitions: Vec<PartitionMetadata> = topic
                .partitions
                .into_iter()
                .filter(|partition| partition.leader >= 0)
                .collect();
            partitions.sort_by_key(|partition| partition.id);
            self.topics.insert(topic.name, partitions);
        }
    }

    /// Writable partitions of `topic`, refreshing metadata while the topic is
    /// unknown or leaderless.
    async fn partitions_for(&mut self, topic: &str) -> Result<Vec<PartitionMetadata>, TransportError> {
        let mut last_code = None;
        for attempt in 0..=self.retries {
            if let Some(partitions) = self.topics.get(topic).filter(|p| !p.is_empty()) {
                return Ok(partitions.clone());
            }
            if attempt > 0 {
                tokio::time::sleep(self.retry_backoff).await;
            }
            let metadata = self.fetch_metadata(&[topic.to_string()]).await?;
            let code = metadata
                .topics
                .iter()
                .find(|candidate| candidate.name == topic)
                .map(|candidate| candidate.error);
            self.apply(metadata);
            if let Some(code) = code {
                if !code.is_ok() && !code.invalidates_metadata() {
                    return Err(code.into_error());
                }
                last_code = Some(code);
            }
        }
        match self.topics.get(topic).filter(|p| !p.is_empty()) {
            Some(partitions) => Ok(partitions.clone()),
            None => match last_code {
                Some(code) if !code.is_ok() && code != protocol::KafkaCode::UNKNOWN_TOPIC_OR_PARTITION => {
                    Err(code.into_error())
                }
                _ => Err(TransportError::UnknownTopic(topic.to_string())),
            },
        }
    }

    async fn leader_connection(&mut self, leader: i32) -> Result<&mut BrokerConnection, TransportError> {
        if !self.connections.contains_key(&leader) {
            let address = self
                .brokers
                .get(&leader)
                .cloned()
                .ok_or_else(|| TransportError::Protocol(format!("unknown leader broker {leader}")))?;
            let connection = BrokerConnection::open(&address, Arc::clone(&self.settings)).await?;
            self.connections.insert(leader, connection);
        }
        self.connections
            .get_mut(&leader)
            .ok_or_else(|| TransportError::Protocol(format!("no connection to broker {leader}")))
    }

    fn drop_connection(&mut self, leader: i32) {
        self.connections.remove(&leader);
    }

    fn invalidate_topic(&mut self, topic: &str) {
        self.topics.remove(topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::protocol::KafkaCode;
    use crate::transport::version::KafkaVersion;
    use std::time::Duration;

    fn partition(id: i32, leader: i32) -> PartitionMetadata {
        PartitionMetadata {
            error: KafkaCode::NONE,
            id,
            leader,
        }
    }

    fn producer_config(brokers: Vec<String>) -> ProducerConfig {
        ProducerConfig {
            brokers,
            connection: ConnectionSettings {
                client_id: "test".to_string(),
                version: KafkaVersion::default(),
                tls: None,
                sasl: None,
                timeout: Duration::from_secs(1),
            },
            return_errors: true,
            channel_buffer_size: 8,
            max_batch_messages: 10,
            metadata_retries: 0,
            metadata_retry_backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn round_robin_cycles_partitions() {
        let partitions = vec![partition(0, 1), partition(1, 2), partition(2, 1)];
        let mut counter = 0;
        let ids: Vec<i32> = (0..5).map(|_| round_robin(&mut counter, &partitions).id).collect();
        assert_eq!(ids, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn metadata_keeps_only_led_partitions() {
        let mut cluster = Cluster::new(&producer_config(vec![]));
        cluster.apply(MetadataResponse {
            brokers: vec![protocol::BrokerMetadata {
                node_id: 1,
                host: "kafka-1".to_string(),
                port: 9092,
            }],
            topics: vec![
                protocol::TopicMetadata {
                    error: KafkaCode::NONE,
                    name: "k6".to_string(),
                    partitions: vec![partition(1, 1), partition(0, -1)],
                },
                protocol::TopicMetadata {
                    error: KafkaCode::LEADER_NOT_AVAILABLE,
                    name: "pending".to_string(),
                    partitions: vec![],
                },
            ],
        });

        assert_eq!(cluster.brokers.get(&1).map(String::as_str), Some("kafka-1:9092"));
        assert_eq!(cluster.topics.get("k6"), Some(&vec![partition(1, 1)]));
        assert!(!cluster.topics.contains_key("pending"));
    }

    #[tokio::test]
    async fn connect_without_reachable_broker_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = KafkaProducer::connect(producer_config(vec![address]))
            .await
            .err()
            .expect("no broker listening");
        assert!(matches!(err, TransportError::NoBrokerAvailable(_)), "{err}");
    }

    #[tokio::test]
    async fn connect_without_brokers_fails() {
        let err = KafkaProducer::connect(producer_config(vec![]))
            .await
            .err()
            .expect("no broker configured");
        assert_eq!(
            err,
            TransportError::NoBrokerAvailable("no broker addresses configured".to_string())
        );
    }
}
