// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Ticker;
use crate::config::service::ConfigService;
use crate::trace::model::StackSample;
use crate::trace::registry::TraceRegistry;
use crate::trace::sampler::{log_sampling_failure, StackSampler};
use crate::trace::scheduler::PeriodicTask;

/// Samples every trace that has been running longer than the coarse initial delay, at the
/// coarse interval, until it has been profiled for the coarse total.
#[derive(Debug)]
pub struct CoarseProfiler {
    registry: Arc<TraceRegistry>,
    sampler: Arc<dyn StackSampler>,
    ticker: Arc<dyn Ticker>,
    config: Arc<dyn ConfigService>,
    cycle: AtomicU64,
}

impl CoarseProfiler {
    #[must_use]
    pub fn new(
        registry: Arc<TraceRegistry>,
        sampler: Arc<dyn StackSampler>,
        ticker: Arc<dyn Ticker>,
        config: Arc<dyn ConfigService>,
    ) -> Self {
        Self {
            registry,
            sampler,
            ticker,
            config,
            cycle: AtomicU64::new(0),
        }
    }

    /// Samples eligible traces once. Returns how many samples were taken.
    pub fn sample(&self) -> usize {
        let config = self.config.config();
        if !config.coarse_profiling_enabled {
            return 0;
        }
        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed);
        let _span = tracing::debug_span!("coarse_profiler", cycle).entered();

        let now = self.ticker.read();
        let stop_at = config.coarse_initial_delay.saturating_add(config.coarse_total);
        let mut taken = 0;
        for trace in self.registry.active() {
            let age = trace.elapsed(now);
            if age < config.coarse_initial_delay || age >= stop_at {
                continue;
            }
            match self.sampler.sample(&trace) {
                Ok(frames) => {
                    trace.add_coarse_sample(StackSample {
                        offset_nanos: u64::try_from(age.as_nanos()).unwrap_or(u64::MAX),
                        frames,
                    });
                    taken += 1;
                }
                Err(e) => log_sampling_failure(trace.id(), &e),
            }
        }
        taken
    }
}

impl PeriodicTask for CoarseProfiler {
    fn name(&self) -> &'static str {
        "coarse profiler"
    }

    fn period(&self) -> Duration {
        self.config.config().coarse_interval
    }

    fn run_cycle(&self) {
        self.sample();
    }
}
