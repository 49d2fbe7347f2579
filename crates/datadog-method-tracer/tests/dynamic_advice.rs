// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::convert::Infallible;
use std::time::Duration;

use datadog_method_tracer::config::pointcut::PointcutConfig;
use datadog_method_tracer::config::RetransformPolicy;
use datadog_method_tracer::trace::sink::CollectingTraceSink;
use datadog_method_tracer::weaving::Value;

mod common;

use common::helpers::{
    config_with_store_threshold, execute1_metric_only_pointcut, execute1_pointcut,
    execute_with_args_pointcut, execute_with_return_pointcut, Harness, TRACE_MARKER,
};

fn harness_with(pointcuts: &[PointcutConfig]) -> (Harness, std::sync::Arc<CollectingTraceSink>) {
    let sink = std::sync::Arc::new(CollectingTraceSink::new());
    let harness = Harness::with_sink(config_with_store_threshold(Duration::ZERO), sink.clone());
    for pointcut in pointcuts {
        assert_eq!(harness.config.add_pointcut_config(pointcut.clone()), Ok(true));
    }
    harness.module.refresh_advice();
    (harness, sink)
}

fn void() -> Result<Value, Infallible> {
    Ok(Value::Void)
}

#[test]
fn test_span_and_metrics_with_void_return() {
    let (harness, sink) = harness_with(&[execute1_pointcut(), execute1_metric_only_pointcut()]);
    let (_unit, basic_misc) = harness.load_basic_misc();
    let execute1 = basic_misc.method("execute1", &[]).unwrap();
    assert_eq!(execute1.advice_count(), 2);

    harness.trace_marker(|| {
        execute1.invoke(&[], void).unwrap();
    });

    let trace = sink.last_trace().unwrap();
    assert_eq!(trace.spans.len(), 2);
    assert_eq!(trace.spans[0].message, TRACE_MARKER);
    assert_eq!(trace.spans[1].message, "execute1() => void");
    assert_eq!(trace.spans[1].parent, Some(0));
    let mut metric_names = trace.metric_names();
    metric_names.sort_unstable();
    assert_eq!(
        metric_names,
        vec!["execute one", "execute one metric only", TRACE_MARKER]
    );
}

#[test]
fn test_span_message_renders_return_value() {
    let (harness, sink) = harness_with(&[execute_with_return_pointcut()]);
    let (_unit, basic_misc) = harness.load_basic_misc();
    let method = basic_misc.method("executeWithReturn", &[]).unwrap();

    harness.trace_marker(|| {
        let returned = method
            .invoke(&[], || Ok::<_, Infallible>(Value::from("xyz")))
            .unwrap();
        assert_eq!(returned, Value::from("xyz"));
    });

    let trace = sink.last_trace().unwrap();
    assert_eq!(trace.spans.len(), 2);
    assert_eq!(trace.spans[1].message, "executeWithReturn() => xyz");
    assert_eq!(trace.metrics.len(), 2);
}

#[test]
fn test_span_message_renders_arguments() {
    let (harness, sink) = harness_with(&[execute_with_args_pointcut()]);
    let (_unit, basic_misc) = harness.load_basic_misc();
    let method = basic_misc
        .method("executeWithArgs", &["java.lang.String", "int"])
        .unwrap();

    harness.trace_marker(|| {
        method
            .invoke(&[Value::from("abc"), Value::from(123)], void)
            .unwrap();
    });

    let trace = sink.last_trace().unwrap();
    assert_eq!(trace.spans.len(), 2);
    assert_eq!(trace.spans[1].message, "executeWithArgs(): abc, 123");
    assert_eq!(trace.metrics.len(), 2);
}

#[test]
fn test_failing_body_marks_span_as_error() {
    let (harness, sink) = harness_with(&[execute_with_return_pointcut()]);
    let (_unit, basic_misc) = harness.load_basic_misc();
    let method = basic_misc.method("executeWithReturn", &[]).unwrap();

    harness.trace_marker(|| {
        let result = method.invoke(&[], || Err::<Value, _>("disk full"));
        assert_eq!(result, Err("disk full"));
    });

    let trace = sink.last_trace().unwrap();
    assert!(trace.error);
    assert!(trace.spans[1].error);
    assert_eq!(trace.spans[1].message, "executeWithReturn() => disk full");
}

#[test]
fn test_duplicate_pointcut_is_registered_once() {
    let (harness, _) = harness_with(&[execute1_pointcut()]);
    assert_eq!(harness.config.add_pointcut_config(execute1_pointcut()), Ok(false));
    assert!(!harness.module.refresh_advice());

    let (_unit, basic_misc) = harness.load_basic_misc();
    assert_eq!(basic_misc.method("execute1", &[]).unwrap().advice_count(), 1);
}

#[test]
fn test_interface_methods_are_never_woven() {
    let (harness, _) = harness_with(&[execute1_pointcut()]);
    let (unit, basic_misc) = harness.load_basic_misc();
    let misc = harness
        .module
        .engine()
        .type_cache()
        .resolve(&unit, common::helpers::MISC)
        .unwrap();
    assert_eq!(misc.name(), common::helpers::MISC);
    assert_eq!(basic_misc.advised_methods(), vec!["execute1"]);
}

#[test]
fn test_later_pointcut_applies_to_future_loads_only() {
    let (harness, sink) = harness_with(&[]);
    let (_old_unit, old_type) = harness.load_basic_misc();

    assert_eq!(harness.config.add_pointcut_config(execute1_pointcut()), Ok(true));
    assert!(harness.module.refresh_advice());

    let old_method = old_type.method("execute1", &[]).unwrap();
    assert_eq!(old_method.advice_count(), 0);

    let (_new_unit, new_type) = harness.load_basic_misc();
    let new_method = new_type.method("execute1", &[]).unwrap();
    assert_eq!(new_method.advice_count(), 1);

    harness.trace_marker(|| {
        old_method.invoke(&[], void).unwrap();
        new_method.invoke(&[], void).unwrap();
    });
    assert_eq!(sink.last_trace().unwrap().spans.len(), 2);
}

#[test]
fn test_retransform_policy_rewires_loaded_types() {
    let (harness, _) = harness_with(&[]);
    harness
        .config
        .update(|config| config.retransform_policy = RetransformPolicy::Retransform);
    let (_unit, basic_misc) = harness.load_basic_misc();

    harness.config.add_pointcut_config(execute1_pointcut()).unwrap();
    assert!(harness.module.refresh_advice());
    assert_eq!(basic_misc.method("execute1", &[]).unwrap().advice_count(), 1);

    assert!(harness.config.remove_pointcut_config(&execute1_pointcut()));
    assert!(harness.module.refresh_advice());
    assert_eq!(basic_misc.method("execute1", &[]).unwrap().advice_count(), 0);
}

#[test]
fn test_store_threshold_filters_fast_traces() {
    let (harness, sink) = harness_with(&[execute1_pointcut()]);
    harness.config.set_store_threshold(Duration::from_millis(50));
    let (_unit, basic_misc) = harness.load_basic_misc();
    let execute1 = basic_misc.method("execute1", &[]).unwrap();

    harness.trace_marker(|| {
        execute1.invoke(&[], void).unwrap();
    });
    assert_eq!(sink.completed_count(), 0);

    harness.trace_marker(|| {
        execute1
            .invoke(&[], || {
                harness.ticker.advance(Duration::from_millis(50));
                void()
            })
            .unwrap();
    });
    assert_eq!(sink.completed_count(), 1);
    assert!(harness.module.registry().is_empty());
}
