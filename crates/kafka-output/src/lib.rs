// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Kafka output for load-test metrics.
//!
//! Samples deposited by the engine are buffered, serialized on a fixed cadence
//! as JSON envelopes or InfluxDB line protocol, and published asynchronously to
//! a Kafka topic.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod buffer;
pub mod config;
pub mod errors;
pub mod flusher;
pub mod logger;
pub mod metric;
pub mod output;
pub mod serializer;
pub mod transport;

pub use output::{Output, OutputParams, OutputStatus};
