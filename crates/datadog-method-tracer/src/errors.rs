// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for instrumentation.
//!
//! Only [`MalformedPointcutError`] is ever returned to a caller. The other classes are
//! produced internally, logged, and dropped at the interception or scheduling boundary.

use thiserror::Error;

/// A pointcut descriptor failed validation and was not compiled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedPointcutError {
    #[error("pointcut type name is empty")]
    EmptyTypeName,

    #[error("pointcut method name is empty")]
    EmptyMethodName,

    #[error("pointcut for {0} has no capture items")]
    NoCaptureItems(String),

    #[error("pointcut for {0} captures METRIC but has no metric name")]
    MissingMetricName(String),

    #[error("pointcut for {0} captures SPAN but has no span template")]
    MissingSpanTemplate(String),

    #[error("pointcut for {method} has an empty argument type at position {position}")]
    EmptyArgType { method: String, position: usize },

    #[error("pointcut for {method} combines contradictory modifiers {first} and {second}")]
    ContradictoryModifiers {
        method: String,
        first: &'static str,
        second: &'static str,
    },

    #[error("pointcut for {method} requires the {modifier} modifier, which has no body to intercept")]
    NotInterceptable {
        method: String,
        modifier: &'static str,
    },

    #[error("span template of {method} refers to argument {index}, but the method takes {declared}")]
    ArgumentOutOfRange {
        method: String,
        index: usize,
        declared: usize,
    },

    #[error("span template {template:?} is invalid: {reason}")]
    InvalidTemplate { template: String, reason: String },
}

/// A method matched a pointcut but no hook could be attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unable to instrument {type_name}.{method_name}: {reason}")]
pub struct MatchFailure {
    pub type_name: String,
    pub method_name: String,
    pub reason: String,
}

/// A scheduler could not sample a trace during one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SamplingFailure {
    #[error("trace {0} completed before it could be sampled")]
    TraceCompleted(u64),

    #[error("thread owning trace {0} no longer exists")]
    ThreadGone(u64),

    #[error("stack of trace {trace_id} unreadable: {reason}")]
    StackUnreadable { trace_id: u64, reason: String },
}

/// The trace sink did not accept a trace.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkFailure {
    #[error("trace sink rejected trace {trace_id}: {reason}")]
    Rejected { trace_id: u64, reason: String },

    #[error("trace sink is full, dropping trace {0}")]
    Full(u64),

    #[error("trace sink is closed, dropping trace {0}")]
    Closed(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = MalformedPointcutError::ContradictoryModifiers {
            method: "execute1".to_string(),
            first: "static",
            second: "abstract",
        };
        assert_eq!(
            err.to_string(),
            "pointcut for execute1 combines contradictory modifiers static and abstract"
        );

        let failure = MatchFailure {
            type_name: "Misc".to_string(),
            method_name: "execute1".to_string(),
            reason: "method has no body".to_string(),
        };
        assert_eq!(
            failure.to_string(),
            "unable to instrument Misc.execute1: method has no body"
        );
    }
}
