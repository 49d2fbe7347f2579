// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The instrumentation engine.
//!
//! Types are woven when they are defined: each method is matched against the current
//! advice snapshot and keeps the matching advice as its hooks. Hooks are held per method
//! behind an atomic pointer so a retransform can swap them while calls are in flight.
//!
//! When several advice match one method, the first registered is innermost: its entry
//! hook runs last and its exit hook first.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use arc_swap::ArcSwap;
use tracing::{debug, warn};

use crate::config::RetransformPolicy;
use crate::errors::MatchFailure;
use crate::trace::capture::{AdviceFrame, Outcome, TraceCapture};
use crate::weaving::advice::Advice;
use crate::weaving::advice_cache::{AdviceCache, AdviceSnapshot};
use crate::weaving::type_cache::{
    LoadingUnit, MethodDescriptor, ResolvedType, TypeCache, TypeDescriptor,
};
use crate::weaving::value::Value;

/// Dead woven type entries are dropped after this many definitions.
const PURGE_EVERY: usize = 1024;

type Hooks = Vec<Arc<Advice>>;

#[derive(Debug)]
struct MethodSlot {
    descriptor: MethodDescriptor,
    hooks: ArcSwap<Hooks>,
}

/// A defined type with its methods' hooks attached.
#[derive(Debug)]
pub struct WovenType {
    unit: Arc<LoadingUnit>,
    resolved: Arc<ResolvedType>,
    capture: Arc<TraceCapture>,
    methods: Vec<MethodSlot>,
}

impl WovenType {
    #[must_use]
    pub fn name(&self) -> &str {
        self.resolved.name()
    }

    #[must_use]
    pub fn unit(&self) -> &Arc<LoadingUnit> {
        &self.unit
    }

    /// Looks up a method by name and exact argument types.
    #[must_use]
    pub fn method(self: &Arc<Self>, name: &str, arg_type_names: &[&str]) -> Option<WovenMethod> {
        let index = self.methods.iter().position(|slot| {
            slot.descriptor.name == name
                && slot.descriptor.arg_type_names.len() == arg_type_names.len()
                && slot
                    .descriptor
                    .arg_type_names
                    .iter()
                    .zip(arg_type_names)
                    .all(|(declared, wanted)| declared == wanted)
        })?;
        Some(WovenMethod {
            owner: Arc::clone(self),
            index,
        })
    }

    /// Names of methods that currently carry hooks.
    #[must_use]
    pub fn advised_methods(&self) -> Vec<&str> {
        self.methods
            .iter()
            .filter(|slot| !slot.hooks.load().is_empty())
            .map(|slot| slot.descriptor.name.as_str())
            .collect()
    }
}

/// Call site of one woven method.
#[derive(Debug, Clone)]
pub struct WovenMethod {
    owner: Arc<WovenType>,
    index: usize,
}

impl WovenMethod {
    fn slot(&self) -> &MethodSlot {
        &self.owner.methods[self.index]
    }

    #[must_use]
    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.slot().descriptor
    }

    #[must_use]
    pub fn advice_count(&self) -> usize {
        self.slot().hooks.load().len()
    }

    /// Runs `body` between the method's entry and exit hooks.
    ///
    /// The body's result is returned untouched. An `Err` is rendered with `Display` as the
    /// `{{ret}}` of span messages and marks the span as an error.
    pub fn invoke<F, E>(&self, args: &[Value], body: F) -> Result<Value, E>
    where
        F: FnOnce() -> Result<Value, E>,
        E: fmt::Display,
    {
        let hooks = self.slot().hooks.load_full();
        let capture = &self.owner.capture;
        if hooks.is_empty() || !capture.is_enabled() {
            return body();
        }

        let mut guard = ExitGuard {
            capture,
            args,
            frames: hooks.iter().rev().map(|advice| capture.enter(advice)).collect(),
        };
        let result = body();
        let outcome = match &result {
            Ok(value) => Outcome::Returned(value),
            Err(e) => Outcome::Failed(e),
        };
        let mut frames = mem::take(&mut guard.frames);
        while let Some(frame) = frames.pop() {
            capture.exit(frame, args, outcome);
        }
        result
    }
}

/// Closes frames left open when the body unwinds.
struct ExitGuard<'a> {
    capture: &'a TraceCapture,
    args: &'a [Value],
    frames: Vec<AdviceFrame>,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        while let Some(frame) = self.frames.pop() {
            self.capture
                .exit(frame, self.args, Outcome::Failed(&"method panicked"));
        }
    }
}

#[derive(Debug)]
pub struct InstrumentationEngine {
    type_cache: Arc<TypeCache>,
    advice_cache: Arc<AdviceCache>,
    capture: Arc<TraceCapture>,
    woven: Mutex<Vec<Weak<WovenType>>>,
    definitions: AtomicUsize,
}

impl InstrumentationEngine {
    #[must_use]
    pub fn new(
        type_cache: Arc<TypeCache>,
        advice_cache: Arc<AdviceCache>,
        capture: Arc<TraceCapture>,
    ) -> Self {
        Self {
            type_cache,
            advice_cache,
            capture,
            woven: Mutex::new(Vec::new()),
            definitions: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn type_cache(&self) -> &Arc<TypeCache> {
        &self.type_cache
    }

    /// The advice snapshot new definitions are woven against.
    #[must_use]
    pub fn current_advice(&self) -> Arc<AdviceSnapshot> {
        self.advice_cache.snapshot()
    }

    /// Registers `descriptor` in `unit` and weaves it against the current advice.
    pub fn define_type(&self, unit: &Arc<LoadingUnit>, descriptor: TypeDescriptor) -> Arc<WovenType> {
        let resolved = self.type_cache.register(unit, descriptor);
        let snapshot = self.advice_cache.snapshot();
        let methods = resolved
            .descriptor()
            .methods
            .iter()
            .map(|method| MethodSlot {
                descriptor: method.clone(),
                hooks: ArcSwap::from_pointee(self.match_method(unit, &resolved, method, &snapshot)),
            })
            .collect();

        let woven = Arc::new(WovenType {
            unit: Arc::clone(unit),
            resolved,
            capture: Arc::clone(&self.capture),
            methods,
        });
        let advised = woven.advised_methods();
        if !advised.is_empty() {
            debug!("Wove {} methods of {}", advised.len(), woven.name());
        }

        self.woven
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&woven));
        if self.definitions.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            self.purge_woven();
        }
        woven
    }

    fn match_method(
        &self,
        unit: &LoadingUnit,
        resolved: &ResolvedType,
        method: &MethodDescriptor,
        snapshot: &AdviceSnapshot,
    ) -> Hooks {
        if snapshot.is_empty() {
            return Vec::new();
        }
        let ancestors = self.type_cache.ancestors(unit, resolved);
        let matched: Hooks = snapshot
            .advice()
            .iter()
            .filter(|advice| {
                advice.matches_type(resolved.name(), &ancestors) && advice.matches_method(method)
            })
            .cloned()
            .collect();

        if !matched.is_empty() && method.is_bodyless() {
            let modifiers: Vec<&str> = method
                .modifiers
                .iter()
                .filter(|modifier| modifier.is_bodyless())
                .map(|modifier| modifier.as_str())
                .collect();
            let failure = MatchFailure {
                type_name: resolved.name().to_string(),
                method_name: method.name.clone(),
                reason: format!("{} method has no body", modifiers.join(" ")),
            };
            warn!("{}", failure);
            return Vec::new();
        }
        matched
    }

    /// Applies a change of the advice snapshot to types that are already woven, if the
    /// policy allows it. Returns how many types had their hooks changed.
    pub fn apply_advice_change(&self, policy: RetransformPolicy) -> usize {
        if policy == RetransformPolicy::FutureLoadsOnly {
            return 0;
        }
        let snapshot = self.advice_cache.snapshot();
        let live: Vec<Arc<WovenType>> = {
            let mut woven = self.woven.lock().unwrap_or_else(PoisonError::into_inner);
            woven.retain(|entry| entry.strong_count() > 0);
            woven.iter().filter_map(Weak::upgrade).collect()
        };

        let mut retransformed = 0;
        for woven in live {
            let mut changed = false;
            for slot in &woven.methods {
                let hooks = self.match_method(&woven.unit, &woven.resolved, &slot.descriptor, &snapshot);
                let current = slot.hooks.load();
                let same = current.len() == hooks.len()
                    && current.iter().zip(&hooks).all(|(a, b)| Arc::ptr_eq(a, b));
                if !same {
                    slot.hooks.store(Arc::new(hooks));
                    changed = true;
                }
            }
            if changed {
                retransformed += 1;
            }
        }
        if retransformed > 0 {
            debug!(
                version = snapshot.version(),
                "Retransformed {} types", retransformed
            );
        }
        retransformed
    }

    fn purge_woven(&self) -> usize {
        let mut woven = self.woven.lock().unwrap_or_else(PoisonError::into_inner);
        let before = woven.len();
        woven.retain(|entry| entry.strong_count() > 0);
        before - woven.len()
    }

    /// Drops bookkeeping for types and units that are no longer reachable.
    pub fn maintain(&self) -> usize {
        self.purge_woven() + self.type_cache.purge()
    }

    /// Woven types tracked for retransformation, live or not yet purged.
    #[must_use]
    pub fn tracked_types(&self) -> usize {
        self.woven.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTicker;
    use crate::config::pointcut::{CaptureItem, MethodModifier, PointcutConfig};
    use crate::config::service::LocalConfigService;
    use crate::config::Config;
    use crate::trace::fine::FineProfilingSelector;
    use crate::trace::metric::MetricRegistry;
    use crate::trace::registry::TraceRegistry;
    use crate::trace::sink::CollectingTraceSink;
    use std::time::Duration;
    use tracing_test::traced_test;

    struct Fixture {
        engine: InstrumentationEngine,
        advice: Arc<AdviceCache>,
        sink: Arc<CollectingTraceSink>,
        registry: Arc<TraceRegistry>,
    }

    fn fixture() -> Fixture {
        let config = Arc::new(LocalConfigService::new(Config {
            store_threshold: Duration::ZERO,
            ..Config::default()
        }));
        let sink = Arc::new(CollectingTraceSink::new());
        let registry = Arc::new(TraceRegistry::new());
        let capture = Arc::new(TraceCapture::new(
            Arc::new(ManualTicker::new()),
            config,
            Arc::clone(&registry),
            Arc::new(MetricRegistry::new()),
            sink.clone(),
            Arc::new(FineProfilingSelector::from_seed(0)),
        ));
        let advice = Arc::new(AdviceCache::new());
        let engine = InstrumentationEngine::new(
            Arc::new(TypeCache::new()),
            Arc::clone(&advice),
            capture,
        );
        Fixture {
            engine,
            advice,
            sink,
            registry,
        }
    }

    fn span_pointcut(method: &str, template: &str) -> PointcutConfig {
        PointcutConfig {
            capture_items: [CaptureItem::Span].into(),
            type_name: "app.Misc".to_string(),
            method_name: method.to_string(),
            span_template: Some(template.to_string()),
            ..PointcutConfig::default()
        }
    }

    fn misc_type(name: &str) -> TypeDescriptor {
        TypeDescriptor::new(name)
            .extends("app.Misc")
            .method(MethodDescriptor::new("execute1", &[], "void"))
            .method(
                MethodDescriptor::new("execute1", &["int"], "void")
                    .with_modifiers(&[MethodModifier::Public]),
            )
    }

    #[test]
    fn test_unadvised_method_runs_body_only() {
        let f = fixture();
        let unit = f.engine.type_cache().new_unit(None);
        let woven = f.engine.define_type(&unit, misc_type("app.BasicMisc"));
        let method = woven.method("execute1", &[]).unwrap();
        assert_eq!(method.advice_count(), 0);
        let result: Result<Value, String> = method.invoke(&[], || Ok(Value::Int(1)));
        assert_eq!(result, Ok(Value::Int(1)));
        assert!(f.registry.is_empty());
        assert!(f.sink.last_trace().is_none());
    }

    #[test]
    fn test_overloads_are_matched_by_argument_types() {
        let f = fixture();
        f.advice.refresh(&[PointcutConfig {
            method_arg_type_names: vec!["int".to_string()],
            ..span_pointcut("execute1", "execute1({{0}})")
        }]);
        let unit = f.engine.type_cache().new_unit(None);
        let woven = f.engine.define_type(&unit, misc_type("app.BasicMisc"));
        assert_eq!(woven.method("execute1", &[]).unwrap().advice_count(), 0);
        let method = woven.method("execute1", &["int"]).unwrap();
        assert_eq!(method.advice_count(), 1);

        let _: Result<Value, String> = method.invoke(&[Value::Int(5)], || Ok(Value::Void));
        assert_eq!(f.sink.spans()[0].message, "execute1(5)");
    }

    #[test]
    fn test_first_registered_advice_is_innermost() {
        let f = fixture();
        f.advice.refresh(&[
            span_pointcut("execute1", "first"),
            span_pointcut("execute1", "second"),
        ]);
        let unit = f.engine.type_cache().new_unit(None);
        let woven = f.engine.define_type(&unit, misc_type("app.BasicMisc"));
        let _: Result<Value, String> = woven
            .method("execute1", &[])
            .unwrap()
            .invoke(&[], || Ok(Value::Void));

        let messages: Vec<_> = f.sink.spans().into_iter().map(|s| (s.message, s.depth)).collect();
        assert_eq!(
            messages,
            vec![("second".to_string(), 0), ("first".to_string(), 1)]
        );
    }

    #[test]
    fn test_error_is_rendered_and_flagged() {
        let f = fixture();
        f.advice.refresh(&[span_pointcut("execute1", "execute1() => {{ret}}")]);
        let unit = f.engine.type_cache().new_unit(None);
        let woven = f.engine.define_type(&unit, misc_type("app.BasicMisc"));
        let result: Result<Value, String> = woven
            .method("execute1", &[])
            .unwrap()
            .invoke(&[], || Err("boom".to_string()));

        assert_eq!(result, Err("boom".to_string()));
        let trace = f.sink.last_trace().unwrap();
        assert!(trace.error);
        assert_eq!(trace.spans[0].message, "execute1() => boom");
    }

    #[test]
    fn test_panicking_body_still_closes_the_trace() {
        let f = fixture();
        f.advice.refresh(&[span_pointcut("execute1", "execute1() => {{ret}}")]);
        let unit = f.engine.type_cache().new_unit(None);
        let method = f
            .engine
            .define_type(&unit, misc_type("app.BasicMisc"))
            .method("execute1", &[])
            .unwrap();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Result<Value, String> = method.invoke(&[], || panic!("bug in application"));
        }));
        assert!(outcome.is_err());
        assert!(f.registry.is_empty());
        assert_eq!(
            f.sink.spans()[0].message,
            "execute1() => method panicked"
        );
    }

    #[test]
    #[traced_test]
    fn test_abstract_method_is_left_unwoven() {
        let f = fixture();
        f.advice.refresh(&[span_pointcut("run", "run()")]);
        let unit = f.engine.type_cache().new_unit(None);
        let woven = f.engine.define_type(
            &unit,
            TypeDescriptor::new("app.AbstractMisc")
                .extends("app.Misc")
                .method(
                    MethodDescriptor::new("run", &[], "void")
                        .with_modifiers(&[MethodModifier::Abstract]),
                )
                .method(MethodDescriptor::new("execute1", &[], "void")),
        );
        assert_eq!(woven.method("run", &[]).unwrap().advice_count(), 0);
        assert!(woven.method("execute1", &[]).is_some());
        assert!(logs_contain(
            "unable to instrument app.AbstractMisc.run: abstract method has no body"
        ));
    }

    #[test]
    fn test_retransform_policy() {
        let f = fixture();
        let unit = f.engine.type_cache().new_unit(None);
        let woven = f.engine.define_type(&unit, misc_type("app.BasicMisc"));
        let method = woven.method("execute1", &[]).unwrap();

        f.advice.refresh(&[span_pointcut("execute1", "execute1()")]);
        assert_eq!(f.engine.apply_advice_change(RetransformPolicy::FutureLoadsOnly), 0);
        assert_eq!(method.advice_count(), 0);

        let reloaded = f.engine.define_type(&unit, misc_type("app.BasicMisc"));
        assert_eq!(reloaded.method("execute1", &[]).unwrap().advice_count(), 1);

        assert_eq!(f.engine.apply_advice_change(RetransformPolicy::Retransform), 1);
        assert_eq!(method.advice_count(), 1);

        f.advice.refresh(&[]);
        assert_eq!(f.engine.apply_advice_change(RetransformPolicy::Retransform), 2);
        assert_eq!(method.advice_count(), 0);
    }

    #[test]
    fn test_dropped_types_are_purged() {
        let f = fixture();
        for _ in 0..10 {
            let unit = f.engine.type_cache().new_unit(None);
            f.engine.define_type(&unit, misc_type("app.Temp"));
        }
        assert_eq!(f.engine.tracked_types(), 10);
        assert_eq!(f.engine.maintain(), 20);
        assert_eq!(f.engine.tracked_types(), 0);
        assert_eq!(f.engine.type_cache().tracked_units(), 0);
    }
}
