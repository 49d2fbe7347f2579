// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Live configuration.
//!
//! Readers take an `Arc<Config>` snapshot and never block writers. Every change bumps a
//! version published on a `watch` channel, which is how the advice refresh task learns
//! that pointcuts changed.

use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tracing::debug;

use crate::config::pointcut::PointcutConfig;
use crate::config::Config;
use crate::errors::MalformedPointcutError;
use crate::weaving::advice::AdviceCompiler;

pub trait ConfigService: Send + Sync + Debug {
    fn config(&self) -> Arc<Config>;

    fn pointcut_configs(&self) -> Vec<PointcutConfig> {
        self.config().pointcuts.clone()
    }

    /// Receiver of the configuration version, bumped on every change.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// In-process [`ConfigService`] that also serves as the pointcut submission API.
#[derive(Debug)]
pub struct LocalConfigService {
    current: ArcSwap<Config>,
    version: watch::Sender<u64>,
    // Serializes read-modify-write cycles; readers never take it.
    write_lock: Mutex<()>,
}

impl LocalConfigService {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            current: ArcSwap::from_pointee(config),
            version,
            write_lock: Mutex::new(()),
        }
    }

    /// Applies `f` to a copy of the current configuration and publishes the result.
    /// Invalid profiling settings are replaced as in [`Config::sanitize`] before publishing.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut Config),
    {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = Config::clone(&self.current.load());
        f(&mut next);
        next.sanitize();
        self.current.store(Arc::new(next));
        self.version.send_modify(|version| *version += 1);
    }

    /// Validates and adds a pointcut. Returns `Ok(false)` when an identical pointcut is
    /// already present, in which case nothing changes.
    pub fn add_pointcut_config(
        &self,
        pointcut: PointcutConfig,
    ) -> Result<bool, MalformedPointcutError> {
        AdviceCompiler::validate(&pointcut)?;
        if self.current.load().pointcuts.contains(&pointcut) {
            debug!("Pointcut {} already registered", pointcut.method_label());
            return Ok(false);
        }
        let mut added = false;
        self.update(|config| {
            // Re-checked under the write lock against a concurrent identical submission.
            if !config.pointcuts.contains(&pointcut) {
                config.pointcuts.push(pointcut);
                added = true;
            }
        });
        Ok(added)
    }

    pub fn remove_pointcut_config(&self, pointcut: &PointcutConfig) -> bool {
        if !self.current.load().pointcuts.contains(pointcut) {
            return false;
        }
        let mut removed = false;
        self.update(|config| {
            let before = config.pointcuts.len();
            config.pointcuts.retain(|existing| existing != pointcut);
            removed = config.pointcuts.len() != before;
        });
        removed
    }

    pub fn set_store_threshold(&self, threshold: Duration) {
        self.update(|config| config.store_threshold = threshold);
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }
}

impl Default for LocalConfigService {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl ConfigService for LocalConfigService {
    fn config(&self) -> Arc<Config> {
        self.current.load_full()
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}
