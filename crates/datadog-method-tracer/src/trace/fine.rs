// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fine-grained profiling of a random subset of traces.
//!
//! Enrollment is decided once, when a trace starts, so aggregate sampling overhead tracks
//! the configured probability instead of the number of slow traces.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::clock::Ticker;
use crate::config::service::ConfigService;
use crate::trace::model::StackSample;
use crate::trace::registry::TraceRegistry;
use crate::trace::sampler::{log_sampling_failure, StackSampler};
use crate::trace::scheduler::PeriodicTask;

#[derive(Debug)]
pub struct FineProfilingSelector {
    rng: Mutex<StdRng>,
}

impl FineProfilingSelector {
    /// Reproducible selection for tests.
    #[must_use]
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    #[must_use]
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Draws once. Probabilities outside `[0, 1]` are clamped.
    pub fn select(&self, probability: f64) -> bool {
        if probability.is_nan() || probability <= 0.0 {
            return false;
        }
        if probability >= 1.0 {
            return true;
        }
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_bool(probability)
    }
}

impl Default for FineProfilingSelector {
    fn default() -> Self {
        Self::from_entropy()
    }
}

/// Samples enrolled traces at the fine interval until they complete or reach the fine
/// total.
#[derive(Debug)]
pub struct FineProfileScheduler {
    registry: Arc<TraceRegistry>,
    sampler: Arc<dyn StackSampler>,
    ticker: Arc<dyn Ticker>,
    config: Arc<dyn ConfigService>,
    cycle: AtomicU64,
}

impl FineProfileScheduler {
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

    /// Samples enrolled traces once. Returns how many samples were taken.
    pub fn sample(&self) -> usize {
        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed);
        let _span = tracing::trace_span!("fine_profiler", cycle).entered();

        let fine_total = self.config.config().fine_total;
        let now = self.ticker.read();
        let mut taken = 0;
        for trace in self.registry.active() {
            if !trace.is_fine_profiled() {
                continue;
            }
            let age = trace.elapsed(now);
            if age >= fine_total {
                continue;
            }
            match self.sampler.sample(&trace) {
                Ok(frames) => {
                    trace.add_fine_sample(StackSample {
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

impl PeriodicTask for FineProfileScheduler {
    fn name(&self) -> &'static str {
        "fine profile scheduler"
    }

    fn period(&self) -> Duration {
        self.config.config().fine_interval
    }

    fn run_cycle(&self) {
        self.sample();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTicker;
    use crate::config::service::LocalConfigService;
    use crate::config::Config;
    use crate::trace::model::Trace;
    use crate::trace::sampler::LogicalStackSampler;

    #[test]
    fn test_selection_is_reproducible_under_a_seed() {
        let draws = |seed| {
            let selector = FineProfilingSelector::from_seed(seed);
            (0..64).map(|_| selector.select(0.3)).collect::<Vec<_>>()
        };
        assert_eq!(draws(42), draws(42));
        let selected = draws(42).into_iter().filter(|s| *s).count();
        assert!(selected > 0 && selected < 64);
    }

    #[test]
    fn test_selection_bounds() {
        let selector = FineProfilingSelector::from_seed(1);
        assert!((0..100).all(|_| !selector.select(0.0)));
        assert!((0..100).all(|_| selector.select(1.0)));
        assert!(!selector.select(f64::NAN));
        assert!(selector.select(7.0));
    }

    #[test]
    fn test_only_enrolled_traces_are_sampled_until_fine_total() {
        let registry = Arc::new(TraceRegistry::new());
        let ticker = Arc::new(ManualTicker::new());
        let config = Arc::new(LocalConfigService::new(Config {
            fine_total: Duration::from_millis(100),
            ..Config::default()
        }));
        let scheduler = FineProfileScheduler::new(
            Arc::clone(&registry),
            Arc::new(LogicalStackSampler),
            ticker.clone(),
            config,
        );

        let other = Arc::new(Trace::new(1, ticker.read(), false));
        other.push_span("root".to_string(), ticker.read());
        registry.register(Arc::clone(&other));
        ticker.advance(Duration::from_millis(10));
        assert_eq!(scheduler.sample(), 0);

        let enrolled = Arc::new(Trace::new(2, ticker.read(), true));
        enrolled.push_span("root".to_string(), ticker.read());
        registry.register(Arc::clone(&enrolled));

        ticker.advance(Duration::from_millis(50));
        assert_eq!(scheduler.sample(), 1);
        ticker.advance(Duration::from_millis(50));
        assert_eq!(scheduler.sample(), 0);

        assert_eq!(enrolled.fine_sample_count(), 1);
        assert_eq!(other.fine_sample_count(), 0);
    }
}
