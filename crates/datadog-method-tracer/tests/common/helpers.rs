// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Harness wiring a trace module to a collecting sink and a manual clock

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use datadog_method_tracer::clock::ManualTicker;
use datadog_method_tracer::config::pointcut::{CaptureItem, MethodModifier, PointcutConfig};
use datadog_method_tracer::config::service::LocalConfigService;
use datadog_method_tracer::config::Config;
use datadog_method_tracer::trace::fine::FineProfilingSelector;
use datadog_method_tracer::trace::sampler::LogicalStackSampler;
use datadog_method_tracer::trace::sink::{CollectingTraceSink, TraceSink};
use datadog_method_tracer::weaving::{
    LoadingUnit, MethodDescriptor, TypeDescriptor, WovenType,
};
use datadog_method_tracer::TraceModule;

pub const MISC: &str = "app.DynamicAdvice$Misc";
pub const BASIC_MISC: &str = "app.DynamicAdvice$BasicMisc";
pub const TRACE_MARKER: &str = "mock trace marker";

pub struct Harness {
    pub module: TraceModule,
    pub config: Arc<LocalConfigService>,
    pub ticker: Arc<ManualTicker>,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        Self::with_sink(config, Arc::new(CollectingTraceSink::new()))
    }

    pub fn with_sink(config: Config, sink: Arc<dyn TraceSink>) -> Self {
        let config = Arc::new(LocalConfigService::new(config));
        let ticker = Arc::new(ManualTicker::new());
        let module = TraceModule::with_parts(
            ticker.clone(),
            config.clone(),
            sink,
            Arc::new(LogicalStackSampler),
            FineProfilingSelector::from_seed(7),
        );
        Self {
            module,
            config,
            ticker,
        }
    }

    /// Defines `Misc` and `BasicMisc` in a fresh loading unit.
    pub fn load_basic_misc(&self) -> (Arc<LoadingUnit>, Arc<WovenType>) {
        let engine = self.module.engine();
        let unit = engine.type_cache().new_unit(None);
        engine.define_type(&unit, misc_interface());
        let basic_misc = engine.define_type(&unit, basic_misc());
        (unit, basic_misc)
    }

    /// Runs `app` inside a root span and metric, like a plugin-provided trace marker.
    pub fn trace_marker<F: FnOnce()>(&self, app: F) {
        let services = self.module.plugin_services("mock-trace-marker");
        let span = services.start_span(TRACE_MARKER);
        let timer = services.start_metric(services.metric_name(TRACE_MARKER));
        app();
        timer.stop();
        span.end();
    }
}

pub fn misc_interface() -> TypeDescriptor {
    let public = [MethodModifier::Public, MethodModifier::Abstract];
    TypeDescriptor::new(MISC)
        .method(MethodDescriptor::new("execute1", &[], "void").with_modifiers(&public))
        .method(
            MethodDescriptor::new("executeWithReturn", &[], "java.lang.CharSequence")
                .with_modifiers(&public),
        )
        .method(
            MethodDescriptor::new("executeWithArgs", &["java.lang.String", "int"], "void")
                .with_modifiers(&public),
        )
}

pub fn basic_misc() -> TypeDescriptor {
    let public = [MethodModifier::Public];
    TypeDescriptor::new(BASIC_MISC)
        .extends(MISC)
        .method(MethodDescriptor::new("execute1", &[], "void").with_modifiers(&public))
        .method(
            MethodDescriptor::new("executeWithReturn", &[], "java.lang.String")
                .with_modifiers(&public),
        )
        .method(
            MethodDescriptor::new("executeWithArgs", &["java.lang.String", "int"], "void")
                .with_modifiers(&public),
        )
}

fn pointcut(method: &str, args: &[&str], return_type: &str) -> PointcutConfig {
    PointcutConfig {
        capture_items: [CaptureItem::Metric, CaptureItem::Span].into(),
        type_name: MISC.to_string(),
        method_name: method.to_string(),
        method_arg_type_names: args.iter().map(ToString::to_string).collect(),
        method_return_type_name: return_type.to_string(),
        method_modifiers: [MethodModifier::Public].into(),
        ..PointcutConfig::default()
    }
}

pub fn execute1_pointcut() -> PointcutConfig {
    PointcutConfig {
        metric_name: Some("execute one".to_string()),
        span_template: Some("execute1() => {{ret}}".to_string()),
        ..pointcut("execute1", &[], "")
    }
}

pub fn execute1_metric_only_pointcut() -> PointcutConfig {
    PointcutConfig {
        capture_items: [CaptureItem::Metric].into(),
        metric_name: Some("execute one metric only".to_string()),
        ..pointcut("execute1", &[], "")
    }
}

pub fn execute_with_return_pointcut() -> PointcutConfig {
    PointcutConfig {
        metric_name: Some("execute with return".to_string()),
        span_template: Some("executeWithReturn() => {{ret}}".to_string()),
        ..pointcut("executeWithReturn", &[], "")
    }
}

pub fn execute_with_args_pointcut() -> PointcutConfig {
    PointcutConfig {
        metric_name: Some("execute with args".to_string()),
        span_template: Some("executeWithArgs(): {{0}}, {{1}}".to_string()),
        ..pointcut("executeWithArgs", &["java.lang.String", "int"], "void")
    }
}

pub fn config_with_store_threshold(store_threshold: Duration) -> Config {
    Config {
        store_threshold,
        ..Config::default()
    }
}
