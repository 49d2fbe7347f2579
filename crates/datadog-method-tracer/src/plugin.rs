// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The API instrumentation code calls into.
//!
//! One [`PluginServices`] exists per plugin id. Spans and metrics are returned as guards
//! that close themselves when dropped, so an early return in plugin code cannot leave a
//! span open.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;
use ustr::Ustr;

use crate::config::service::ConfigService;
use crate::config::Config;
use crate::errors::MalformedPointcutError;
use crate::trace::capture::{MetricHandle, SpanHandle, TraceCapture};
use crate::trace::metric::MetricName;
use crate::trace::model::Trace;
use crate::weaving::advice::MessageTemplate;
use crate::weaving::value::Value;

#[derive(Debug)]
pub struct PluginServices {
    plugin_id: String,
    capture: Arc<TraceCapture>,
    config: Arc<dyn ConfigService>,
}

impl PluginServices {
    fn new(plugin_id: &str, capture: Arc<TraceCapture>, config: Arc<dyn ConfigService>) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            capture,
            config,
        }
    }

    #[must_use]
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Live configuration, including sampling thresholds.
    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        self.config.config()
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.config().enabled
    }

    pub fn metric_name(&self, name: &str) -> MetricName {
        self.capture.metric_registry().intern(Ustr::from(name))
    }

    pub fn template(&self, template: &str) -> Result<MessageTemplate, MalformedPointcutError> {
        MessageTemplate::parse(template)
    }

    /// Times `name` until the returned timer is stopped or dropped. Records nothing when
    /// the calling thread has no active trace.
    pub fn start_metric(&self, name: MetricName) -> MetricTimer<'_> {
        let handle = if self.is_enabled() {
            self.capture.start_metric(name)
        } else {
            None
        };
        MetricTimer {
            capture: &self.capture,
            handle,
        }
    }

    /// Opens a span, starting a trace if the calling thread has none. `message` stands as
    /// the span's message unless the guard is ended with another one.
    pub fn start_span(&self, message: impl Into<String>) -> SpanGuard<'_> {
        let message = message.into();
        let handle = if self.is_enabled() {
            Some(self.capture.start_span(message.clone()))
        } else {
            None
        };
        SpanGuard {
            capture: &self.capture,
            handle,
            message,
        }
    }

    #[must_use]
    pub fn current_trace(&self) -> Option<Arc<Trace>> {
        self.capture.current_trace()
    }

    /// Returns `false` when the calling thread has no active trace.
    pub fn set_trace_attribute(&self, name: &str, value: &str) -> bool {
        match self.capture.current_trace() {
            Some(trace) => {
                trace.set_attribute(name, value);
                true
            }
            None => false,
        }
    }

    /// Records an error as a closed span in the current trace, marking the trace as failed.
    pub fn add_error_span(&self, error: &dyn fmt::Display) -> bool {
        self.capture.add_error_span(error.to_string())
    }
}

#[must_use]
pub struct MetricTimer<'a> {
    capture: &'a TraceCapture,
    handle: Option<MetricHandle>,
}

impl MetricTimer<'_> {
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.handle.is_some()
    }

    pub fn stop(self) {}
}

impl Drop for MetricTimer<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.capture.stop_metric(handle);
        }
    }
}

#[must_use]
pub struct SpanGuard<'a> {
    capture: &'a TraceCapture,
    handle: Option<SpanHandle>,
    message: String,
}

impl SpanGuard<'_> {
    #[must_use]
    pub fn trace(&self) -> Option<&Arc<Trace>> {
        self.handle.as_ref().map(SpanHandle::trace)
    }

    pub fn end(self) {}

    pub fn end_with_message(mut self, message: String) {
        self.finish(message, false);
    }

    /// Ends the span with `template` rendered against the call's arguments and result.
    pub fn end_with_return(mut self, template: &MessageTemplate, args: &[Value], returned: &Value) {
        let message = template.render(args, Some(returned));
        self.finish(message, false);
    }

    pub fn end_with_error(mut self, error: &dyn fmt::Display) {
        let message = format!("{}: {error}", self.message);
        self.finish(message, true);
    }

    fn finish(&mut self, message: String, error: bool) {
        if let Some(handle) = self.handle.take() {
            self.capture.end_span(handle, message, error);
        }
    }
}

impl Drop for SpanGuard<'_> {
    fn drop(&mut self) {
        let message = std::mem::take(&mut self.message);
        self.finish(message, false);
    }
}

/// One [`PluginServices`] per plugin id, created on first request.
#[derive(Debug)]
pub struct PluginServicesCache {
    capture: Arc<TraceCapture>,
    config: Arc<dyn ConfigService>,
    services: Mutex<HashMap<String, Arc<PluginServices>>>,
}

impl PluginServicesCache {
    #[must_use]
    pub fn new(capture: Arc<TraceCapture>, config: Arc<dyn ConfigService>) -> Self {
        Self {
            capture,
            config,
            services: Mutex::new(HashMap::new()),
        }
    }

    /// Construction happens under the lock, so concurrent first requests for the same id
    /// all receive the same instance.
    pub fn get(&self, plugin_id: &str) -> Arc<PluginServices> {
        let mut services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = services.get(plugin_id) {
            return Arc::clone(existing);
        }
        debug!("Creating plugin services for {}", plugin_id);
        let created = Arc::new(PluginServices::new(
            plugin_id,
            Arc::clone(&self.capture),
            Arc::clone(&self.config),
        ));
        services.insert(plugin_id.to_string(), Arc::clone(&created));
        created
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.services.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
