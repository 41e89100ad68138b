// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::OutputError;

/// Runs a flush callback on a fixed period from a background task.
///
/// Flushes never overlap: each tick awaits the callback before the next one is
/// considered, and ticks missed while a flush was running are delayed rather
/// than replayed. Stopping runs one last flush.
pub struct PeriodicFlusher {
    period: Duration,
    cancel_token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicFlusher {
    /// Spawns the flush task on the current tokio runtime.
    pub fn new<F, Fut>(period: Duration, mut flush: F) -> Result<Self, OutputError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if period.is_zero() {
            return Err(OutputError::InvalidFlushPeriod);
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| OutputError::Task(e.to_string()))?;

        let cancel_token = CancellationToken::new();
        let shutdown_token = cancel_token.clone();
        let handle = runtime.spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = shutdown_token.cancelled() => {
                        debug!("Performing final flush");
                        flush().await;
                        break;
                    }
                    _ = interval.tick() => {
                        flush().await;
                    }
                }
            }
        });

        Ok(PeriodicFlusher {
            period,
            cancel_token,
            handle: Some(handle),
        })
    }

    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Stops ticking and waits for the final flush. An in-flight flush is
    /// allowed to finish first. Calling it again is a no-op.
    pub async fn stop(&mut self) -> Result<(), OutputError> {
        self.cancel_token.cancel();
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|e| OutputError::Task(format!("flush task: {e}")))?;
        }
        Ok(())
    }
}

impl Drop for PeriodicFlusher {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
