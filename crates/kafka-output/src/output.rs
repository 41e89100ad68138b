// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::buffer::SampleBuffer;
use crate::config::{self, Config};
use crate::errors::OutputError;
use crate::flusher::PeriodicFlusher;
use crate::metric::SampleContainer;
use crate::serializer::Serializer;
use crate::transport::{self, AsyncProducer, ProducerError, ProducerMessage};

/// What the engine hands to the output at construction.
#[derive(Debug, Clone, Default)]
pub struct OutputParams {
    /// Raw JSON configuration blob, if any.
    pub json_config: Option<Vec<u8>>,
    pub environment: HashMap<String, String>,
    /// Inline argument following the output name, e.g. `brokers=b:9092,topic=k6`.
    pub config_argument: String,
}

/// Lifecycle of an [`Output`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStatus {
    /// Configured, nothing running yet.
    Created,
    /// Flusher armed and producer connected.
    Started,
    /// Final flush and producer close in progress.
    Stopping,
    /// Every task has exited.
    Stopped,
}

/// Streams buffered samples to a Kafka topic.
///
/// Samples are appended with [`Output::add_metric_samples`] from any thread.
/// Once started, a periodic flusher serializes the buffered samples every
/// `push_interval` and hands the messages to the producer.
pub struct Output {
    config: Config,
    serializer: Arc<Serializer>,
    buffer: Arc<SampleBuffer>,
    producer: Option<Box<dyn AsyncProducer>>,
    flusher: Option<PeriodicFlusher>,
    error_drain: Option<JoinHandle<()>>,
    status: OutputStatus,
}

impl Output {
    /// Resolves the configuration. The transport is only built by
    /// [`Output::start`].
    pub fn new(params: OutputParams) -> Result<Self, OutputError> {
        let config = config::resolve(
            params.json_config.as_deref(),
            &params.environment,
            &params.config_argument,
        )?;
        Self::build(config, None)
    }

    /// Uses `producer` instead of connecting to the configured brokers.
    pub fn with_producer(config: Config, producer: Box<dyn AsyncProducer>) -> Result<Self, OutputError> {
        Self::build(config, Some(producer))
    }

    fn build(config: Config, producer: Option<Box<dyn AsyncProducer>>) -> Result<Self, OutputError> {
        let serializer = Serializer::new(&config)?;
        Ok(Output {
            config,
            serializer: Arc::new(serializer),
            buffer: Arc::new(SampleBuffer::new()),
            producer,
            flusher: None,
            error_drain: None,
            status: OutputStatus::Created,
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn description(&self) -> String {
        format!("kafka-output: Kafka Async output on topic {}", self.config.topic)
    }

    #[must_use]
    pub fn status(&self) -> OutputStatus {
        self.status
    }

    /// Shared handle for engines that push samples from their own tasks.
    #[must_use]
    pub fn buffer(&self) -> Arc<SampleBuffer> {
        Arc::clone(&self.buffer)
    }

    pub fn add_metric_samples(&self, containers: Vec<Box<dyn SampleContainer>>) {
        self.buffer.add_metric_samples(containers);
    }

    pub async fn start(&mut self) -> Result<(), OutputError> {
        if self.status != OutputStatus::Created {
            return Err(OutputError::AlreadyStarted);
        }
        debug!("Kafka: Starting...");

        let mut producer: Box<dyn AsyncProducer> = match self.producer.take() {
            Some(producer) => producer,
            None => Box::new(transport::build_transport(&self.config).await?),
        };

        let context = Arc::new(FlushContext {
            buffer: Arc::clone(&self.buffer),
            serializer: Arc::clone(&self.serializer),
            input: producer.input(),
            topic: self.config.topic.clone(),
        });
        let flusher = PeriodicFlusher::new(self.config.push_interval, move || {
            let context = Arc::clone(&context);
            async move { context.flush_metrics().await }
        });
        let flusher = match flusher {
            Ok(flusher) => flusher,
            Err(e) => {
                if let Err(close_err) = producer.close().await {
                    warn!("Kafka: failed to close producer after start failure: {close_err}");
                }
                return Err(e);
            }
        };

        // The error stream must be drained or the producer stalls once it fills up.
        if let Some(errors) = producer.take_errors() {
            self.error_drain = Some(tokio::spawn(drain_errors(errors, self.config.log_error)));
        }

        self.flusher = Some(flusher);
        self.producer = Some(producer);
        self.status = OutputStatus::Started;
        debug!("Kafka: Started");
        Ok(())
    }

    /// Stops the flusher (running one last flush), closes the producer and
    /// waits for the error stream to end.
    pub async fn stop(&mut self) -> Result<(), OutputError> {
        if self.status != OutputStatus::Started {
            return Err(OutputError::NotStarted);
        }
        self.status = OutputStatus::Stopping;
        debug!("Kafka: Stopping...");

        let mut result = Ok(());
        if let Some(mut flusher) = self.flusher.take() {
            result = flusher.stop().await;
        }
        if let Some(producer) = self.producer.take() {
            if let Err(e) = producer.close().await {
                error!("Kafka: failed to close producer: {e}");
                result = result.and(Err(e.into()));
            }
        }
        if let Some(error_drain) = self.error_drain.take() {
            if let Err(e) = error_drain.await {
                result = result.and(Err(OutputError::Task(e.to_string())));
            }
        }

        self.status = OutputStatus::Stopped;
        debug!("Kafka: Stopped!");
        result
    }
}

struct FlushContext {
    buffer: Arc<SampleBuffer>,
    serializer: Arc<Serializer>,
    input: mpsc::Sender<ProducerMessage>,
    topic: String,
}

impl FlushContext {
    async fn flush_metrics(&self) {
        let containers = self.buffer.get_buffered_samples();

        debug!("Kafka: Converting the samples to messages...");
        // One bad sample drops the whole flush, never a partial one.
        let messages = match containers
            .iter()
            .map(|container| self.serializer.serialize(container.samples()))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(batches) => batches.into_iter().flatten().collect::<Vec<_>>(),
            Err(e) => {
                error!("Kafka: Error getting the messages: {e}");
                return;
            }
        };

        let start = Instant::now();
        debug!("Kafka: Delivering...");
        let mut delivered = 0;
        for value in messages {
            let message = ProducerMessage {
                topic: self.topic.clone(),
                value,
            };
            if self.input.send(message).await.is_err() {
                error!("Kafka: producer is closed, dropping the rest of the flush");
                break;
            }
            delivered += 1;
        }
        debug!(t = ?start.elapsed(), messages = delivered, "Kafka: Delivered!");
    }
}

async fn drain_errors(mut errors: mpsc::Receiver<ProducerError>, log_error: bool) {
    while let Some(err) = errors.recv().await {
        if log_error {
            error!("Kafka: failed to send message. {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Format;
    use crate::errors::TransportError;
    use crate::metric::{Metric, MetricType, Sample, Samples, Tags};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tracing_test::traced_test;

    /// Producer that records every message it receives.
    struct ChannelProducer {
        input: mpsc::Sender<ProducerMessage>,
        errors: Option<mpsc::Receiver<ProducerError>>,
        collector: JoinHandle<()>,
    }

    impl ChannelProducer {
        fn new(received: Arc<Mutex<Vec<ProducerMessage>>>, capacity: usize) -> Self {
            let (input, mut rx) = mpsc::channel(capacity);
            let collector = tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    received.lock().unwrap().push(message);
                }
            });
            ChannelProducer {
                input,
                errors: None,
                collector,
            }
        }
    }

    #[async_trait]
    impl AsyncProducer for ChannelProducer {
        fn input(&self) -> mpsc::Sender<ProducerMessage> {
            self.input.clone()
        }

        fn take_errors(&mut self) -> Option<mpsc::Receiver<ProducerError>> {
            self.errors.take()
        }

        async fn close(self: Box<Self>) -> Result<(), TransportError> {
            let ChannelProducer { input, collector, .. } = *self;
            drop(input);
            collector.await.map_err(|e| TransportError::Protocol(e.to_string()))
        }
    }

    fn config(format: Format) -> Config {
        Config {
            brokers: vec!["localhost:9092".to_string()],
            topic: "k6".to_string(),
            format,
            push_interval: Duration::from_millis(20),
            ..Config::default()
        }
    }

    fn vus(value: f64) -> Box<dyn SampleContainer> {
        Box::new(Sample::new(
            Metric::new("vus", MetricType::Gauge),
            Tags::new().with("a", "1"),
            value,
        ))
    }

    #[test]
    fn new_rejects_bad_config_before_any_transport() {
        let params = OutputParams {
            config_argument: "brokers=b:9092,topic=t,bogus=1".to_string(),
            ..OutputParams::default()
        };
        assert!(matches!(Output::new(params), Err(OutputError::Config(_))));
    }

    #[test]
    fn description_names_the_topic() {
        let params = OutputParams {
            config_argument: "brokers=b:9092,topic=loadtest".to_string(),
            ..OutputParams::default()
        };
        let output = Output::new(params).unwrap();
        assert_eq!(
            output.description(),
            "kafka-output: Kafka Async output on topic loadtest"
        );
        assert_eq!(output.status(), OutputStatus::Created);
    }

    #[tokio::test]
    async fn lifecycle_misuse_is_reported() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let producer = Box::new(ChannelProducer::new(Arc::clone(&received), 8));
        let mut output = Output::with_producer(config(Format::Json), producer).unwrap();

        assert!(matches!(output.stop().await, Err(OutputError::NotStarted)));
        output.start().await.unwrap();
        assert!(matches!(output.start().await, Err(OutputError::AlreadyStarted)));
        output.stop().await.unwrap();
        assert_eq!(output.status(), OutputStatus::Stopped);
        assert!(matches!(output.stop().await, Err(OutputError::NotStarted)));
    }

    #[tokio::test]
    async fn zero_push_interval_fails_start() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let producer = Box::new(ChannelProducer::new(received, 8));
        let mut config = config(Format::Json);
        config.push_interval = Duration::ZERO;
        let mut output = Output::with_producer(config, producer).unwrap();

        assert!(matches!(output.start().await, Err(OutputError::InvalidFlushPeriod)));
        assert_eq!(output.status(), OutputStatus::Created);
    }

    #[tokio::test]
    async fn samples_added_before_stop_are_published() {
        let received = Arc::new(Mutex::new(Vec::new()));
        // Capacity 1 forces the flush to wait on the consumer.
        let producer = Box::new(ChannelProducer::new(Arc::clone(&received), 1));
        let mut output = Output::with_producer(config(Format::InfluxDb), producer).unwrap();
        output.start().await.unwrap();

        for i in 0..50 {
            output.add_metric_samples(vec![vus(f64::from(i))]);
            if i % 10 == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        output.stop().await.unwrap();

        let received = received.lock().unwrap();
        let values: Vec<&str> = received.iter().map(|m| m.value.as_str()).collect();
        let expected: Vec<String> = (0..50).map(|i| format!("vus,a=1 value={i}")).collect();
        assert_eq!(values, expected);
        assert!(received.iter().all(|m| m.topic == "k6"));
    }

    #[tokio::test]
    #[traced_test]
    async fn flush_publishes_allowed_metrics_in_order() {
        let (input, mut rx) = mpsc::channel(16);
        let config = config(Format::Json);
        let context = FlushContext {
            buffer: Arc::new(SampleBuffer::new()),
            serializer: Arc::new(Serializer::new(&config).unwrap()),
            input,
            topic: config.topic.clone(),
        };
        context.buffer.add_metric_samples(vec![
            Box::new(Samples(vec![
                Sample::new(Metric::new("http_reqs", MetricType::Counter), Tags::new(), 1.0),
                Sample::new(Metric::new("iterations", MetricType::Counter), Tags::new(), 1.0),
            ])),
            vus(3.0),
        ]);

        context.flush_metrics().await;
        drop(context);

        let mut metrics = Vec::new();
        while let Some(message) = rx.recv().await {
            let value: serde_json::Value = serde_json::from_str(&message.value).unwrap();
            metrics.push(value["metric"].as_str().unwrap().to_string());
        }
        assert_eq!(metrics, vec!["http_reqs", "vus"]);
        assert!(logs_contain("Kafka: Converting the samples to messages..."));
        assert!(logs_contain("Kafka: Delivered!"));
    }

    #[tokio::test]
    #[traced_test]
    async fn serialization_failure_drops_the_whole_flush() {
        let (input, mut rx) = mpsc::channel(16);
        let config = config(Format::InfluxDb);
        let context = FlushContext {
            buffer: Arc::new(SampleBuffer::new()),
            serializer: Arc::new(Serializer::new(&config).unwrap()),
            input,
            topic: config.topic.clone(),
        };
        context
            .buffer
            .add_metric_samples(vec![vus(1.0), vus(f64::NAN), vus(3.0)]);
        context.flush_metrics().await;
        assert!(rx.try_recv().is_err());
        assert!(logs_contain("Kafka: Error getting the messages"));

        // The next flush is unaffected.
        context.buffer.add_metric_samples(vec![vus(4.0)]);
        context.flush_metrics().await;
        drop(context);

        let mut values = Vec::new();
        while let Some(message) = rx.recv().await {
            values.push(message.value);
        }
        assert_eq!(values, vec!["vus,a=1 value=4".to_string()]);
    }

    #[tokio::test]
    #[traced_test]
    async fn delivery_errors_are_logged_until_the_stream_ends() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(ProducerError {
            message: ProducerMessage {
                topic: "k6".to_string(),
                value: "{}".to_string(),
            },
            error: TransportError::Broker {
                code: 10,
                name: "MESSAGE_TOO_LARGE",
            },
        })
        .await
        .unwrap();
        drop(tx);
        drain_errors(rx, true).await;
        assert!(logs_contain("Kafka: failed to send message."));
        assert!(logs_contain("MESSAGE_TOO_LARGE"));
    }
}
