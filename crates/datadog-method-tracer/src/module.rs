// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wiring of caches, registries, schedulers and the plugin facade.
//!
//! [`TraceModule::new`] only builds state. Background work starts with
//! [`TraceModule::start`], which must run inside a tokio runtime, and ends with
//! [`TraceModule::shutdown`], which waits for every task to finish its current cycle.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::clock::Ticker;
use crate::config::service::ConfigService;
use crate::plugin::{PluginServices, PluginServicesCache};
use crate::trace::capture::TraceCapture;
use crate::trace::coarse::CoarseProfiler;
use crate::trace::fine::{FineProfileScheduler, FineProfilingSelector};
use crate::trace::metric::MetricRegistry;
use crate::trace::registry::TraceRegistry;
use crate::trace::sampler::{LogicalStackSampler, StackSampler};
use crate::trace::scheduler::{spawn_periodic, PeriodicTask};
use crate::trace::sink::TraceSink;
use crate::trace::stuck::StuckTraceCollector;
use crate::weaving::advice_cache::AdviceCache;
use crate::weaving::type_cache::TypeCache;
use crate::weaving::weaver::InstrumentationEngine;

/// Purges unreachable loading units and woven types.
#[derive(Debug)]
struct CacheMaintenance {
    engine: Arc<InstrumentationEngine>,
    registry: Arc<TraceRegistry>,
    config: Arc<dyn ConfigService>,
}

impl PeriodicTask for CacheMaintenance {
    fn name(&self) -> &'static str {
        "cache maintenance"
    }

    fn period(&self) -> Duration {
        self.config.config().type_cache_maintenance_interval
    }

    fn run_cycle(&self) {
        let purged = self.engine.maintain();
        let active = self.registry.sweep();
        debug!(purged, active, "Cache maintenance done");
    }
}

#[derive(Debug)]
pub struct TraceModule {
    config: Arc<dyn ConfigService>,
    registry: Arc<TraceRegistry>,
    advice_cache: Arc<AdviceCache>,
    engine: Arc<InstrumentationEngine>,
    stuck_trace_collector: Arc<StuckTraceCollector>,
    coarse_profiler: Arc<CoarseProfiler>,
    fine_profile_scheduler: Arc<FineProfileScheduler>,
    plugin_services: PluginServicesCache,
    cancel_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TraceModule {
    #[must_use]
    pub fn new(
        ticker: Arc<dyn Ticker>,
        config: Arc<dyn ConfigService>,
        sink: Arc<dyn TraceSink>,
    ) -> Self {
        Self::with_parts(
            ticker,
            config,
            sink,
            Arc::new(LogicalStackSampler),
            FineProfilingSelector::from_entropy(),
        )
    }

    /// Like [`TraceModule::new`] with an explicit stack sampler and fine profiling
    /// selector, for hosts that can read native stacks and for reproducible tests.
    #[must_use]
    pub fn with_parts(
        ticker: Arc<dyn Ticker>,
        config: Arc<dyn ConfigService>,
        sink: Arc<dyn TraceSink>,
        sampler: Arc<dyn StackSampler>,
        selector: FineProfilingSelector,
    ) -> Self {
        let registry = Arc::new(TraceRegistry::new());
        let capture = Arc::new(TraceCapture::new(
            Arc::clone(&ticker),
            Arc::clone(&config),
            Arc::clone(&registry),
            Arc::new(MetricRegistry::new()),
            Arc::clone(&sink),
            Arc::new(selector),
        ));

        let advice_cache = Arc::new(AdviceCache::new());
        advice_cache.refresh(&config.pointcut_configs());
        let engine = Arc::new(InstrumentationEngine::new(
            Arc::new(TypeCache::new()),
            Arc::clone(&advice_cache),
            Arc::clone(&capture),
        ));

        let stuck_trace_collector = Arc::new(StuckTraceCollector::new(
            Arc::clone(&registry),
            sink,
            Arc::clone(&ticker),
            Arc::clone(&config),
        ));
        let coarse_profiler = Arc::new(CoarseProfiler::new(
            Arc::clone(&registry),
            Arc::clone(&sampler),
            Arc::clone(&ticker),
            Arc::clone(&config),
        ));
        let fine_profile_scheduler = Arc::new(FineProfileScheduler::new(
            Arc::clone(&registry),
            sampler,
            ticker,
            Arc::clone(&config),
        ));

        Self {
            plugin_services: PluginServicesCache::new(capture, Arc::clone(&config)),
            config,
            registry,
            advice_cache,
            engine,
            stuck_trace_collector,
            coarse_profiler,
            fine_profile_scheduler,
            cancel_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<InstrumentationEngine> {
        &self.engine
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<TraceRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn stuck_trace_collector(&self) -> &Arc<StuckTraceCollector> {
        &self.stuck_trace_collector
    }

    #[must_use]
    pub fn coarse_profiler(&self) -> &Arc<CoarseProfiler> {
        &self.coarse_profiler
    }

    #[must_use]
    pub fn fine_profile_scheduler(&self) -> &Arc<FineProfileScheduler> {
        &self.fine_profile_scheduler
    }

    pub fn plugin_services(&self, plugin_id: &str) -> Arc<PluginServices> {
        self.plugin_services.get(plugin_id)
    }

    /// Recompiles advice from the config service and applies the retransform policy.
    /// Returns `true` if the advice set changed.
    pub fn refresh_advice(&self) -> bool {
        refresh_advice(&self.config, &self.advice_cache, &self.engine)
    }

    /// Spawns the schedulers, cache maintenance and the advice refresh task.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            debug!("Trace module already started");
            return;
        }

        let periodic: [Arc<dyn PeriodicTask>; 4] = [
            Arc::clone(&self.stuck_trace_collector) as Arc<dyn PeriodicTask>,
            Arc::clone(&self.coarse_profiler) as Arc<dyn PeriodicTask>,
            Arc::clone(&self.fine_profile_scheduler) as Arc<dyn PeriodicTask>,
            Arc::new(CacheMaintenance {
                engine: Arc::clone(&self.engine),
                registry: Arc::clone(&self.registry),
                config: Arc::clone(&self.config),
            }),
        ];
        for task in periodic {
            tasks.push(spawn_periodic(task, self.cancel_token.child_token()));
        }

        let config = Arc::clone(&self.config);
        let advice_cache = Arc::clone(&self.advice_cache);
        let engine = Arc::clone(&self.engine);
        let cancel_token = self.cancel_token.child_token();
        tasks.push(tokio::spawn(async move {
            let mut versions = config.subscribe();
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => break,
                    changed = versions.changed() => {
                        if changed.is_err() {
                            debug!("Config service dropped, stopping advice refresh");
                            break;
                        }
                        refresh_advice(&config, &advice_cache, &engine);
                    }
                }
            }
        }));
    }

    /// Cancels all background tasks and waits for them to finish.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                error!("Background task failed: {}", e);
            }
        }
    }
}

fn refresh_advice(
    config: &Arc<dyn ConfigService>,
    advice_cache: &AdviceCache,
    engine: &InstrumentationEngine,
) -> bool {
    let snapshot = config.config();
    if !advice_cache.refresh(&snapshot.pointcuts) {
        return false;
    }
    engine.apply_advice_change(snapshot.retransform_policy);
    true
}
