// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use datadog_method_tracer::weaving::{MethodDescriptor, TypeDescriptor};

mod common;

use common::helpers::{config_with_store_threshold, execute1_pointcut, Harness};

const TRANSIENT_UNITS: usize = 50_000;

#[test]
fn test_transient_units_are_released() {
    let harness = Harness::new(config_with_store_threshold(Duration::ZERO));
    harness.config.add_pointcut_config(execute1_pointcut()).unwrap();
    harness.module.refresh_advice();
    let engine = harness.module.engine();

    for i in 0..TRANSIENT_UNITS {
        let unit = engine.type_cache().new_unit(None);
        let generated = TypeDescriptor::new(&format!("app.Generated{i}"))
            .method(MethodDescriptor::new("run", &[], "void"));
        let woven = engine.define_type(&unit, generated);
        assert_eq!(woven.unit().id(), unit.id());
    }

    // Dead entries are purged as new ones are tracked, so bookkeeping stays bounded
    // without explicit maintenance.
    assert!(engine.type_cache().tracked_units() < 2048);
    assert!(engine.tracked_types() < 2048);

    engine.maintain();
    assert_eq!(engine.type_cache().live_units(), 0);
    assert_eq!(engine.type_cache().tracked_units(), 0);
    assert_eq!(engine.tracked_types(), 0);
}

#[test]
fn test_woven_type_keeps_its_unit_alive() {
    let harness = Harness::new(config_with_store_threshold(Duration::ZERO));
    harness.config.add_pointcut_config(execute1_pointcut()).unwrap();
    harness.module.refresh_advice();
    let engine = Arc::clone(harness.module.engine());

    let (unit, basic_misc) = harness.load_basic_misc();
    let unit_id = unit.id();
    drop(unit);
    engine.maintain();
    assert_eq!(engine.type_cache().live_units(), 1);
    assert_eq!(basic_misc.unit().id(), unit_id);
    assert_eq!(basic_misc.advised_methods(), vec!["execute1"]);

    drop(basic_misc);
    engine.maintain();
    assert_eq!(engine.type_cache().live_units(), 0);
    assert_eq!(engine.tracked_types(), 0);
}
