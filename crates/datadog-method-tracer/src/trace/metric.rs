// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metric name interning.
//!
//! Names are interned with `ustr` and given a process-stable numeric id on first use.
//! Lookups read a published map without locking; only the first registration of a name
//! takes the writer lock and republishes the map.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use fnv::FnvHashMap;
use ustr::Ustr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetricName {
    name: Ustr,
    id: u32,
}

impl MetricName {
    #[must_use]
    pub fn name(&self) -> Ustr {
        self.name
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        self.name.as_str()
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
pub struct MetricRegistry {
    names: ArcSwap<FnvHashMap<Ustr, MetricName>>,
    write_lock: Mutex<()>,
}

impl MetricRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the name's identity, allocating one the first time the name is seen.
    pub fn intern(&self, name: Ustr) -> MetricName {
        if let Some(existing) = self.names.load().get(&name) {
            return *existing;
        }

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.names.load_full();
        if let Some(existing) = current.get(&name) {
            return *existing;
        }
        let mut next = FnvHashMap::clone(&current);
        let metric = MetricName {
            name,
            id: u32::try_from(next.len()).unwrap_or(u32::MAX),
        };
        next.insert(name, metric);
        self.names.store(Arc::new(next));
        metric
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<MetricName> {
        let key = Ustr::from_existing(name)?;
        self.names.load().get(&key).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
