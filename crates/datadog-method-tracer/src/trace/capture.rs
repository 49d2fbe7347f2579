// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Advice execution: turning method entries and exits into spans and metrics.
//!
//! Entry opens the span first, creating and registering a trace if the thread has none,
//! then starts the metric. Exit runs in reverse. Closing the root span completes the
//! trace, which is forwarded to the sink if it ran at least the store threshold or was
//! flagged stuck, and removed from the registry either way.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::clock::Ticker;
use crate::config::service::ConfigService;
use crate::trace::fine::FineProfilingSelector;
use crate::trace::metric::{MetricName, MetricRegistry};
use crate::trace::model::Trace;
use crate::trace::registry::TraceRegistry;
use crate::trace::sink::TraceSink;
use crate::weaving::advice::Advice;
use crate::weaving::value::Value;

/// An open span.
#[derive(Debug)]
#[must_use]
pub struct SpanHandle {
    trace: Arc<Trace>,
    index: usize,
}

impl SpanHandle {
    #[must_use]
    pub fn trace(&self) -> &Arc<Trace> {
        &self.trace
    }
}

/// A running metric timer.
#[derive(Debug)]
#[must_use]
pub struct MetricHandle {
    trace: Arc<Trace>,
    name: MetricName,
}

/// How an advised method finished.
#[derive(Clone, Copy)]
pub enum Outcome<'a> {
    Returned(&'a Value),
    Failed(&'a dyn fmt::Display),
}

impl Outcome<'_> {
    fn as_display(&self) -> &dyn fmt::Display {
        match self {
            Outcome::Returned(value) => *value,
            Outcome::Failed(error) => *error,
        }
    }

    fn is_error(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }
}

/// State carried from an advised method's entry to its exit.
#[derive(Debug)]
pub(crate) struct AdviceFrame {
    advice: Arc<Advice>,
    span: Option<SpanHandle>,
    metric: Option<MetricHandle>,
}

#[derive(Debug)]
pub struct TraceCapture {
    ticker: Arc<dyn Ticker>,
    config: Arc<dyn ConfigService>,
    registry: Arc<TraceRegistry>,
    metrics: Arc<MetricRegistry>,
    sink: Arc<dyn TraceSink>,
    selector: Arc<FineProfilingSelector>,
    next_trace_id: AtomicU64,
}

impl TraceCapture {
    #[must_use]
    pub fn new(
        ticker: Arc<dyn Ticker>,
        config: Arc<dyn ConfigService>,
        registry: Arc<TraceRegistry>,
        metrics: Arc<MetricRegistry>,
        sink: Arc<dyn TraceSink>,
        selector: Arc<FineProfilingSelector>,
    ) -> Self {
        Self {
            ticker,
            config,
            registry,
            metrics,
            sink,
            selector,
            next_trace_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.config().enabled
    }

    #[must_use]
    pub fn ticker(&self) -> &Arc<dyn Ticker> {
        &self.ticker
    }

    #[must_use]
    pub fn metric_registry(&self) -> &Arc<MetricRegistry> {
        &self.metrics
    }

    #[must_use]
    pub fn current_trace(&self) -> Option<Arc<Trace>> {
        self.registry.current()
    }

    /// Opens a span under the innermost open span of the calling thread's trace, starting
    /// a trace if there is none.
    pub fn start_span(&self, label: String) -> SpanHandle {
        let now = self.ticker.read();
        let trace = match self.registry.current() {
            Some(trace) => trace,
            None => {
                let id = self.next_trace_id.fetch_add(1, Ordering::Relaxed);
                let probability = self.config.config().fine_profiling_probability;
                let trace = Arc::new(Trace::new(id, now, self.selector.select(probability)));
                trace!(trace_id = id, "Starting trace at {}", label);
                self.registry.register(Arc::clone(&trace));
                trace
            }
        };
        let index = trace.push_span(label, now);
        SpanHandle { trace, index }
    }

    /// Closes the span. Closing a root span completes its trace.
    pub fn end_span(&self, span: SpanHandle, message: String, error: bool) {
        let now = self.ticker.read();
        if span.trace.pop_span(span.index, message, now, error) {
            self.complete(&span.trace, now);
        }
    }

    /// Starts timing `name` in the calling thread's trace. Without an active trace there is
    /// nothing to attribute the time to, so nothing is recorded.
    pub fn start_metric(&self, name: MetricName) -> Option<MetricHandle> {
        let trace = self.registry.current()?;
        trace.start_metric(name, self.ticker.read());
        Some(MetricHandle { trace, name })
    }

    pub fn stop_metric(&self, metric: MetricHandle) {
        metric.trace.stop_metric(metric.name, self.ticker.read());
    }

    /// Adds a closed error span to the calling thread's trace, if any.
    pub fn add_error_span(&self, message: String) -> bool {
        match self.registry.current() {
            Some(trace) => {
                trace.add_error_span(message, self.ticker.read());
                true
            }
            None => false,
        }
    }

    pub(crate) fn enter(&self, advice: &Arc<Advice>) -> AdviceFrame {
        let span = advice
            .template()
            .map(|_| self.start_span(advice.label().to_string()));
        let metric = advice
            .metric_name()
            .and_then(|name| self.start_metric(self.metrics.intern(name)));
        AdviceFrame {
            advice: Arc::clone(advice),
            span,
            metric,
        }
    }

    pub(crate) fn exit(&self, frame: AdviceFrame, args: &[Value], outcome: Outcome<'_>) {
        if let Some(metric) = frame.metric {
            self.stop_metric(metric);
        }
        if let (Some(span), Some(template)) = (frame.span, frame.advice.template()) {
            let message = template.render(args, Some(outcome.as_display()));
            self.end_span(span, message, outcome.is_error());
        }
    }

    fn complete(&self, trace: &Arc<Trace>, now: u64) {
        let duration = trace.finish(now);
        self.registry.remove(trace);

        let store_threshold = self.config.config().store_threshold;
        if duration < store_threshold && !trace.is_stuck() {
            trace!(trace_id = trace.id(), "Discarding trace of {:?}", duration);
            return;
        }
        debug!(trace_id = trace.id(), "Storing trace of {:?}", duration);
        if let Err(e) = self.sink.on_trace_completed(Arc::clone(trace)) {
            warn!("Dropping completed trace: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTicker;
    use crate::config::service::LocalConfigService;
    use crate::config::Config;
    use crate::trace::sink::CollectingTraceSink;
    use std::time::Duration;
    use ustr::Ustr;

    struct Fixture {
        capture: TraceCapture,
        ticker: Arc<ManualTicker>,
        config: Arc<LocalConfigService>,
        sink: Arc<CollectingTraceSink>,
        registry: Arc<TraceRegistry>,
    }

    fn fixture(store_threshold: Duration) -> Fixture {
        let ticker = Arc::new(ManualTicker::new());
        let config = Arc::new(LocalConfigService::new(Config {
            store_threshold,
            ..Config::default()
        }));
        let sink = Arc::new(CollectingTraceSink::new());
        let registry = Arc::new(TraceRegistry::new());
        let capture = TraceCapture::new(
            ticker.clone(),
            config.clone(),
            Arc::clone(&registry),
            Arc::new(MetricRegistry::new()),
            sink.clone(),
            Arc::new(FineProfilingSelector::from_seed(0)),
        );
        Fixture {
            capture,
            ticker,
            config,
            sink,
            registry,
        }
    }

    #[test]
    fn test_root_span_completes_trace() {
        let f = fixture(Duration::ZERO);
        let root = f.capture.start_span("root".to_string());
        let child = f.capture.start_span("child".to_string());
        assert_eq!(child.trace().id(), root.trace().id());
        f.capture.end_span(child, "child done".to_string(), false);
        assert!(f.sink.last_trace().is_none());
        f.capture.end_span(root, "root done".to_string(), false);

        assert!(f.registry.is_empty());
        let spans = f.sink.spans();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].message, "child done");
    }

    #[test]
    fn test_store_threshold() {
        let f = fixture(Duration::from_millis(100));
        let root = f.capture.start_span("fast".to_string());
        f.ticker.advance(Duration::from_millis(99));
        f.capture.end_span(root, "fast".to_string(), false);
        assert_eq!(f.sink.completed_count(), 0);
        assert!(f.registry.is_empty());

        let root = f.capture.start_span("slow".to_string());
        f.ticker.advance(Duration::from_millis(100));
        f.capture.end_span(root, "slow".to_string(), false);
        assert_eq!(f.sink.completed_count(), 1);

        f.config.set_store_threshold(Duration::ZERO);
        let root = f.capture.start_span("instant".to_string());
        f.capture.end_span(root, "instant".to_string(), false);
        assert_eq!(f.sink.completed_count(), 2);
    }

    #[test]
    fn test_stuck_trace_is_stored_below_threshold() {
        let f = fixture(Duration::from_secs(60));
        let root = f.capture.start_span("root".to_string());
        assert!(root.trace().mark_stuck());
        f.capture.end_span(root, "root".to_string(), false);
        assert_eq!(f.sink.last_trace().map(|t| t.stuck), Some(true));
    }

    #[test]
    fn test_metric_without_trace_records_nothing() {
        let f = fixture(Duration::ZERO);
        let name = f.capture.metric_registry().intern(Ustr::from("orphan"));
        assert!(f.capture.start_metric(name).is_none());
        assert!(f.registry.is_empty());
    }

    #[test]
    fn test_metric_accumulates_into_trace() {
        let f = fixture(Duration::ZERO);
        let name = f.capture.metric_registry().intern(Ustr::from("db query"));
        let root = f.capture.start_span("root".to_string());
        for _ in 0..3 {
            let metric = f.capture.start_metric(name).unwrap();
            f.ticker.advance(Duration::from_millis(2));
            f.capture.stop_metric(metric);
        }
        f.capture.end_span(root, "root".to_string(), false);

        let trace = f.sink.last_trace().unwrap();
        assert_eq!(trace.metrics[0].count, 3);
        assert_eq!(trace.metrics[0].total_nanos, 6_000_000);
    }
}
