// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Debug;

use tracing::{debug, warn};

use crate::errors::SamplingFailure;
use crate::trace::model::Trace;

/// Captures the call stack of the thread that owns a trace.
pub trait StackSampler: Send + Sync + Debug {
    /// Frames, outermost first.
    fn sample(&self, trace: &Trace) -> Result<Vec<String>, SamplingFailure>;
}

/// A trace finishing between the registry scan and the sample is routine.
pub(crate) fn log_sampling_failure(trace_id: u64, failure: &SamplingFailure) {
    match failure {
        SamplingFailure::TraceCompleted(_) => debug!(trace_id, "Sampling skipped: {}", failure),
        _ => warn!(trace_id, "Sampling failed: {}", failure),
    }
}

/// Samples the chain of open spans. Needs no cooperation from the owning thread, at the
/// cost of only seeing instrumented frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogicalStackSampler;

impl StackSampler for LogicalStackSampler {
    fn sample(&self, trace: &Trace) -> Result<Vec<String>, SamplingFailure> {
        if trace.is_complete() {
            return Err(SamplingFailure::TraceCompleted(trace.id()));
        }
        let frames = trace.open_stack();
        if frames.is_empty() {
            return Err(SamplingFailure::StackUnreadable {
                trace_id: trace.id(),
                reason: "no open spans".to_string(),
            });
        }
        Ok(frames)
    }
}
