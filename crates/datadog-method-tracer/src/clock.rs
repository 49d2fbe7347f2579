// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Monotonic time source shared by advice execution and the schedulers.
//!
//! Trace offsets, durations and scheduler thresholds are all computed from a [`Ticker`]
//! so that tests can drive time explicitly with [`ManualTicker`].

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A monotonic nanosecond counter with an arbitrary origin.
pub trait Ticker: Send + Sync + Debug {
    fn read(&self) -> u64;
}

/// Ticker backed by [`Instant`], anchored at construction.
#[derive(Debug)]
pub struct SystemTicker {
    origin: Instant,
}

impl SystemTicker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTicker {
    fn default() -> Self {
        Self::new()
    }
}

impl Ticker for SystemTicker {
    fn read(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Ticker that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualTicker {
    nanos: AtomicU64,
}

impl ManualTicker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_add(nanos, Ordering::AcqRel);
    }
}

impl Ticker for ManualTicker {
    fn read(&self) -> u64 {
        self.nanos.load(Ordering::Acquire)
    }
}

/// Elapsed time between two ticker readings, saturating at zero.
#[must_use]
pub fn elapsed(start: u64, end: u64) -> Duration {
    Duration::from_nanos(end.saturating_sub(start))
}
