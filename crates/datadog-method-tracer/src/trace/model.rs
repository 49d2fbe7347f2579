// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Traces and their span trees.
//!
//! Spans live in a per-trace arena and refer to each other by index. Only the owning
//! thread pushes and pops spans; schedulers read the open stack, set the stuck flag and
//! append samples.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::clock;
use crate::trace::metric::MetricName;

#[derive(Debug)]
struct Span {
    label: String,
    message: Option<String>,
    start_offset: u64,
    end_offset: Option<u64>,
    parent: Option<usize>,
    children: Vec<usize>,
    error: bool,
}

#[derive(Debug)]
struct MetricEntry {
    name: MetricName,
    total_nanos: u64,
    count: u64,
    // Re-entrant timing of the same metric only counts the outermost call.
    nesting: u32,
    started_at: u64,
}

#[derive(Debug, Default)]
struct TraceState {
    spans: Vec<Span>,
    open: Vec<usize>,
    metrics: Vec<MetricEntry>,
    attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackSample {
    /// Offset from trace start.
    pub offset_nanos: u64,
    /// Outermost frame first.
    pub frames: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanSnapshot {
    pub index: usize,
    pub parent: Option<usize>,
    pub depth: usize,
    pub start_offset_nanos: u64,
    pub end_offset_nanos: Option<u64>,
    /// Rendered message, or the span label while the span is still open.
    pub message: String,
    pub error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub name: String,
    pub total_nanos: u64,
    pub count: u64,
}

/// Point-in-time copy of a trace, detached from the live trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSnapshot {
    pub id: u64,
    pub thread_name: Option<String>,
    pub start_time_unix_nanos: u64,
    /// Absent while the trace is still active.
    pub duration_nanos: Option<u64>,
    pub stuck: bool,
    pub error: bool,
    pub fine_profiled: bool,
    /// Depth-first, root first.
    pub spans: Vec<SpanSnapshot>,
    pub metrics: Vec<MetricSnapshot>,
    pub attributes: BTreeMap<String, String>,
    pub coarse_samples: Vec<StackSample>,
    pub fine_samples: Vec<StackSample>,
}

impl TraceSnapshot {
    #[must_use]
    pub fn metric_names(&self) -> Vec<&str> {
        self.metrics.iter().map(|metric| metric.name.as_str()).collect()
    }

    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug)]
pub struct Trace {
    id: u64,
    thread_id: ThreadId,
    thread_name: Option<String>,
    start_time: SystemTime,
    start_tick: u64,
    duration: OnceLock<u64>,
    stuck: AtomicBool,
    error: AtomicBool,
    fine_profiled: bool,
    state: Mutex<TraceState>,
    coarse_samples: Mutex<Vec<StackSample>>,
    fine_samples: Mutex<Vec<StackSample>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Trace {
    /// Creates a trace owned by the calling thread.
    pub(crate) fn new(id: u64, start_tick: u64, fine_profiled: bool) -> Self {
        let current = thread::current();
        Self {
            id,
            thread_id: current.id(),
            thread_name: current.name().map(ToString::to_string),
            start_time: SystemTime::now(),
            start_tick,
            duration: OnceLock::new(),
            stuck: AtomicBool::new(false),
            error: AtomicBool::new(false),
            fine_profiled,
            state: Mutex::new(TraceState::default()),
            coarse_samples: Mutex::new(Vec::new()),
            fine_samples: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    #[must_use]
    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    #[must_use]
    pub fn start_tick(&self) -> u64 {
        self.start_tick
    }

    /// Time since the trace started, or its final duration once complete.
    #[must_use]
    pub fn elapsed(&self, now: u64) -> Duration {
        match self.duration.get() {
            Some(nanos) => Duration::from_nanos(*nanos),
            None => clock::elapsed(self.start_tick, now),
        }
    }

    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.duration.get().map(|nanos| Duration::from_nanos(*nanos))
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.duration.get().is_some()
    }

    /// Sets the stuck flag. Returns `false` if it was already set.
    pub fn mark_stuck(&self) -> bool {
        self.stuck
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[must_use]
    pub fn is_stuck(&self) -> bool {
        self.stuck.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn has_error(&self) -> bool {
        self.error.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_fine_profiled(&self) -> bool {
        self.fine_profiled
    }

    pub fn set_attribute(&self, name: &str, value: &str) {
        lock(&self.state)
            .attributes
            .insert(name.to_string(), value.to_string());
    }

    /// Opens a span as a child of the innermost open span and returns its index.
    pub(crate) fn push_span(&self, label: String, now: u64) -> usize {
        let offset = now.saturating_sub(self.start_tick);
        let mut state = lock(&self.state);
        let index = state.spans.len();
        let parent = state.open.last().copied();
        state.spans.push(Span {
            label,
            message: None,
            start_offset: offset,
            end_offset: None,
            parent,
            children: Vec::new(),
            error: false,
        });
        if let Some(parent) = parent {
            state.spans[parent].children.push(index);
        }
        state.open.push(index);
        index
    }

    /// Closes the span at `index` and any spans opened inside it that were left open.
    /// Returns `true` when the root span was closed.
    pub(crate) fn pop_span(&self, index: usize, message: String, now: u64, error: bool) -> bool {
        let offset = now.saturating_sub(self.start_tick);
        let mut state = lock(&self.state);
        let Some(position) = state.open.iter().rposition(|open| *open == index) else {
            return false;
        };
        for abandoned in state.open.split_off(position + 1) {
            let span = &mut state.spans[abandoned];
            span.end_offset = Some(offset.max(span.start_offset));
        }
        state.open.pop();

        let span = &mut state.spans[index];
        span.end_offset = Some(offset.max(span.start_offset));
        span.message = Some(message);
        span.error = error;
        if error {
            self.error.store(true, Ordering::Release);
        }
        span.parent.is_none()
    }

    /// Adds an already-closed error span under the innermost open span.
    pub(crate) fn add_error_span(&self, message: String, now: u64) {
        let index = self.push_span(message.clone(), now);
        self.pop_span(index, message, now, true);
    }

    pub(crate) fn start_metric(&self, name: MetricName, now: u64) {
        let mut state = lock(&self.state);
        match state.metrics.iter_mut().find(|entry| entry.name == name) {
            Some(entry) => {
                if entry.nesting == 0 {
                    entry.started_at = now;
                }
                entry.nesting += 1;
            }
            None => state.metrics.push(MetricEntry {
                name,
                total_nanos: 0,
                count: 0,
                nesting: 1,
                started_at: now,
            }),
        }
    }

    pub(crate) fn stop_metric(&self, name: MetricName, now: u64) {
        let mut state = lock(&self.state);
        if let Some(entry) = state.metrics.iter_mut().find(|entry| entry.name == name) {
            if entry.nesting == 0 {
                return;
            }
            entry.nesting -= 1;
            entry.count += 1;
            if entry.nesting == 0 {
                entry.total_nanos += now.saturating_sub(entry.started_at);
            }
        }
    }

    /// Records the final duration. Later calls keep the first value.
    pub(crate) fn finish(&self, now: u64) -> Duration {
        let nanos = *self.duration.get_or_init(|| now.saturating_sub(self.start_tick));
        Duration::from_nanos(nanos)
    }

    /// Labels of the open spans, outermost first.
    #[must_use]
    pub fn open_stack(&self) -> Vec<String> {
        let state = lock(&self.state);
        state
            .open
            .iter()
            .map(|index| state.spans[*index].label.clone())
            .collect()
    }

    pub(crate) fn add_coarse_sample(&self, sample: StackSample) {
        lock(&self.coarse_samples).push(sample);
    }

    pub(crate) fn add_fine_sample(&self, sample: StackSample) {
        lock(&self.fine_samples).push(sample);
    }

    #[must_use]
    pub fn coarse_sample_count(&self) -> usize {
        lock(&self.coarse_samples).len()
    }

    #[must_use]
    pub fn fine_sample_count(&self) -> usize {
        lock(&self.fine_samples).len()
    }

    #[must_use]
    pub fn span_count(&self) -> usize {
        lock(&self.state).spans.len()
    }

    #[must_use]
    pub fn metric_names(&self) -> Vec<&'static str> {
        lock(&self.state)
            .metrics
            .iter()
            .map(|entry| entry.name.as_str())
            .collect()
    }

    #[must_use]
    pub fn snapshot(&self) -> TraceSnapshot {
        let state = lock(&self.state);

        let mut spans = Vec::with_capacity(state.spans.len());
        let roots = state
            .spans
            .iter()
            .enumerate()
            .filter(|(_, span)| span.parent.is_none())
            .map(|(index, _)| (index, 0));
        let mut pending: Vec<(usize, usize)> = roots.collect();
        pending.reverse();
        while let Some((index, depth)) = pending.pop() {
            let span = &state.spans[index];
            spans.push(SpanSnapshot {
                index,
                parent: span.parent,
                depth,
                start_offset_nanos: span.start_offset,
                end_offset_nanos: span.end_offset,
                message: span.message.clone().unwrap_or_else(|| span.label.clone()),
                error: span.error,
            });
            pending.extend(span.children.iter().rev().map(|child| (*child, depth + 1)));
        }

        let metrics = state
            .metrics
            .iter()
            .map(|entry| MetricSnapshot {
                name: entry.name.as_str().to_string(),
                total_nanos: entry.total_nanos,
                count: entry.count,
            })
            .collect();
        let attributes = state.attributes.clone();
        drop(state);

        TraceSnapshot {
            id: self.id,
            thread_name: self.thread_name.clone(),
            start_time_unix_nanos: self
                .start_time
                .duration_since(UNIX_EPOCH)
                .map_or(0, |since| u64::try_from(since.as_nanos()).unwrap_or(u64::MAX)),
            duration_nanos: self.duration.get().copied(),
            stuck: self.is_stuck(),
            error: self.has_error(),
            fine_profiled: self.fine_profiled,
            spans,
            metrics,
            attributes,
            coarse_samples: lock(&self.coarse_samples).clone(),
            fine_samples: lock(&self.fine_samples).clone(),
        }
    }
}
