// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace capture and the background work driven off active traces.

pub mod capture;
pub mod coarse;
pub mod fine;
pub mod metric;
pub mod model;
pub mod registry;
pub mod sampler;
pub mod scheduler;
pub mod sink;
pub mod stuck;

pub use capture::{MetricHandle, Outcome, SpanHandle, TraceCapture};
pub use metric::{MetricName, MetricRegistry};
pub use model::{SpanSnapshot, StackSample, Trace, TraceSnapshot};
pub use registry::TraceRegistry;
pub use sink::{ChannelTraceSink, CollectingTraceSink, TraceEvent, TraceSink};
