// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The active advice set.
//!
//! Readers load the current [`AdviceSnapshot`] without locking. A refresh compiles the new
//! descriptor list off to the side and publishes it with a single pointer swap, so a
//! reader sees either the old set or the new one and never a mix.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use tracing::{debug, warn};

use crate::config::pointcut::PointcutConfig;
use crate::weaving::advice::{Advice, AdviceCompiler};

#[derive(Debug, Default)]
pub struct AdviceSnapshot {
    version: u64,
    advice: Vec<Arc<Advice>>,
}

impl AdviceSnapshot {
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Advice in registration order.
    #[must_use]
    pub fn advice(&self) -> &[Arc<Advice>] {
        &self.advice
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.advice.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct AdviceCache {
    current: ArcSwap<AdviceSnapshot>,
    // Compiled advice by descriptor, so resubmitting a descriptor reuses its advice.
    compiled: Mutex<HashMap<PointcutConfig, Arc<Advice>>>,
}

impl AdviceCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<AdviceSnapshot> {
        self.current.load_full()
    }

    /// Recompiles the advice set from `pointcuts`. Identical descriptors collapse into one
    /// advice and malformed ones are logged and left out.
    ///
    /// Returns `true` if a new snapshot was published.
    pub fn refresh(&self, pointcuts: &[PointcutConfig]) -> bool {
        let mut compiled = self.compiled.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next_compiled = HashMap::with_capacity(pointcuts.len());
        let mut advice = Vec::with_capacity(pointcuts.len());

        for pointcut in pointcuts {
            if next_compiled.contains_key(pointcut) {
                debug!("Ignoring duplicate pointcut {}", pointcut.method_label());
                continue;
            }
            let entry = match compiled.remove(pointcut) {
                Some(existing) => existing,
                None => match AdviceCompiler::compile(pointcut) {
                    Ok(new) => Arc::new(new),
                    Err(e) => {
                        warn!("Skipping pointcut {}: {}", pointcut.method_label(), e);
                        continue;
                    }
                },
            };
            advice.push(Arc::clone(&entry));
            next_compiled.insert(pointcut.clone(), entry);
        }
        *compiled = next_compiled;

        let current = self.current.load();
        let unchanged = current.advice.len() == advice.len()
            && current
                .advice
                .iter()
                .zip(&advice)
                .all(|(old, new)| Arc::ptr_eq(old, new));
        if unchanged {
            return false;
        }

        let version = current.version + 1;
        debug!(version, "Publishing {} advice", advice.len());
        self.current.store(Arc::new(AdviceSnapshot { version, advice }));
        true
    }
}
