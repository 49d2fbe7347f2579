// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::clock::Ticker;
use crate::config::service::ConfigService;
use crate::trace::registry::TraceRegistry;
use crate::trace::scheduler::PeriodicTask;
use crate::trace::sink::TraceSink;

/// Flags active traces that outlive the stuck threshold and reports each one once.
#[derive(Debug)]
pub struct StuckTraceCollector {
    registry: Arc<TraceRegistry>,
    sink: Arc<dyn TraceSink>,
    ticker: Arc<dyn Ticker>,
    config: Arc<dyn ConfigService>,
}

impl StuckTraceCollector {
    #[must_use]
    pub fn new(
        registry: Arc<TraceRegistry>,
        sink: Arc<dyn TraceSink>,
        ticker: Arc<dyn Ticker>,
        config: Arc<dyn ConfigService>,
    ) -> Self {
        Self {
            registry,
            sink,
            ticker,
            config,
        }
    }

    /// Scans the registry once. Returns how many traces were newly flagged.
    pub fn collect(&self) -> usize {
        let threshold = self.config.config().stuck_threshold;
        let now = self.ticker.read();
        let mut flagged = 0;

        for trace in self.registry.active() {
            if trace.is_complete() || trace.elapsed(now) < threshold {
                continue;
            }
            if !trace.mark_stuck() {
                continue;
            }
            flagged += 1;
            info!(
                trace_id = trace.id(),
                "Trace stuck for {:?}",
                trace.elapsed(now)
            );
            if let Err(e) = self.sink.on_trace_stuck(Arc::clone(&trace)) {
                warn!("Failed to report stuck trace: {}", e);
            }
        }
        flagged
    }
}

impl PeriodicTask for StuckTraceCollector {
    fn name(&self) -> &'static str {
        "stuck trace collector"
    }

    fn period(&self) -> Duration {
        self.config.config().stuck_check_interval
    }

    fn run_cycle(&self) {
        let _span = tracing::debug_span!("stuck_trace_collector").entered();
        self.collect();
    }
}
