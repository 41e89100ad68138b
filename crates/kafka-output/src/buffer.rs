// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::metric::SampleContainer;

/// Queue of sample containers waiting for the next flush.
///
/// Appends and the flush-time swap take the same lock, so an append lands
/// entirely before or entirely after a swap.
#[derive(Debug, Default)]
pub struct SampleBuffer {
    buffered: Mutex<Vec<Box<dyn SampleContainer>>>,
}

impl SampleBuffer {
    #[must_use]
    pub fn new() -> Self {
        SampleBuffer::default()
    }

    pub fn add_metric_samples(&self, containers: Vec<Box<dyn SampleContainer>>) {
        if containers.is_empty() {
            return;
        }
        self.lock().extend(containers);
    }

    /// Takes everything buffered so far and leaves the buffer empty.
    pub fn get_buffered_samples(&self) -> Vec<Box<dyn SampleContainer>> {
        std::mem::take(&mut *self.lock())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // A panic while holding the lock cannot leave the vector half-written.
    fn lock(&self) -> MutexGuard<'_, Vec<Box<dyn SampleContainer>>> {
        self.buffered.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
