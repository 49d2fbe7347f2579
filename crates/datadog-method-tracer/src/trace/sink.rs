// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Destinations for completed and stuck traces.
//!
//! Sinks are called from the thread that completed the trace, or from the stuck trace
//! collector, so an implementation must not block.

use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::errors::SinkFailure;
use crate::trace::model::{SpanSnapshot, Trace, TraceSnapshot};

pub trait TraceSink: Send + Sync + Debug {
    fn on_trace_completed(&self, trace: Arc<Trace>) -> Result<(), SinkFailure>;

    /// Partial report for a trace that is still running past the stuck threshold.
    fn on_trace_stuck(&self, trace: Arc<Trace>) -> Result<(), SinkFailure>;
}

#[derive(Debug, Default)]
struct Collected {
    last_trace: Option<TraceSnapshot>,
    completed: usize,
    stuck_trace_ids: Vec<u64>,
}

/// Keeps the most recent completed trace for inspection.
#[derive(Debug, Default)]
pub struct CollectingTraceSink {
    collected: Mutex<Collected>,
}

impl CollectingTraceSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn collected(&self) -> MutexGuard<'_, Collected> {
        self.collected.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn last_trace(&self) -> Option<TraceSnapshot> {
        self.collected().last_trace.clone()
    }

    /// Spans of the last completed trace, depth-first.
    #[must_use]
    pub fn spans(&self) -> Vec<SpanSnapshot> {
        self.collected()
            .last_trace
            .as_ref()
            .map(|trace| trace.spans.clone())
            .unwrap_or_default()
    }

    /// Distinct metric names of the last completed trace, in first-use order.
    #[must_use]
    pub fn metric_names(&self) -> Vec<String> {
        self.collected()
            .last_trace
            .as_ref()
            .map(|trace| trace.metrics.iter().map(|m| m.name.clone()).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.collected().completed
    }

    #[must_use]
    pub fn stuck_trace_ids(&self) -> Vec<u64> {
        self.collected().stuck_trace_ids.clone()
    }

    pub fn reset(&self) {
        *self.collected() = Collected::default();
    }
}

impl TraceSink for CollectingTraceSink {
    fn on_trace_completed(&self, trace: Arc<Trace>) -> Result<(), SinkFailure> {
        let snapshot = trace.snapshot();
        let mut collected = self.collected();
        collected.last_trace = Some(snapshot);
        collected.completed += 1;
        Ok(())
    }

    fn on_trace_stuck(&self, trace: Arc<Trace>) -> Result<(), SinkFailure> {
        self.collected().stuck_trace_ids.push(trace.id());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    Completed(TraceSnapshot),
    Stuck(TraceSnapshot),
}

/// Hands snapshots to a consumer over a bounded channel, dropping them when it is full.
#[derive(Debug, Clone)]
pub struct ChannelTraceSink {
    tx: mpsc::Sender<TraceEvent>,
}

impl ChannelTraceSink {
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TraceEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    fn send(&self, trace_id: u64, event: TraceEvent) -> Result<(), SinkFailure> {
        self.tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => SinkFailure::Full(trace_id),
            TrySendError::Closed(_) => SinkFailure::Closed(trace_id),
        })
    }
}

impl TraceSink for ChannelTraceSink {
    fn on_trace_completed(&self, trace: Arc<Trace>) -> Result<(), SinkFailure> {
        self.send(trace.id(), TraceEvent::Completed(trace.snapshot()))
    }

    fn on_trace_stuck(&self, trace: Arc<Trace>) -> Result<(), SinkFailure> {
        self.send(trace.id(), TraceEvent::Stuck(trace.snapshot()))
    }
}
