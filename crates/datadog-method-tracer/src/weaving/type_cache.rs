// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Type metadata as seen at definition time.
//!
//! A [`LoadingUnit`] owns every type defined through it. The [`TypeCache`] only ever holds
//! units weakly, so dropping the last handle to a unit releases its types, their memoized
//! ancestor sets, and anything woven from them.

use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::pointcut::MethodModifier;

/// Dead unit entries are dropped after this many registrations.
const PURGE_EVERY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodDescriptor {
    pub name: String,
    pub arg_type_names: Vec<String>,
    pub return_type_name: String,
    pub modifiers: BTreeSet<MethodModifier>,
}

impl MethodDescriptor {
    #[must_use]
    pub fn new(name: &str, arg_type_names: &[&str], return_type_name: &str) -> Self {
        Self {
            name: name.to_string(),
            arg_type_names: arg_type_names.iter().map(ToString::to_string).collect(),
            return_type_name: return_type_name.to_string(),
            modifiers: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_modifiers(mut self, modifiers: &[MethodModifier]) -> Self {
        self.modifiers.extend(modifiers.iter().copied());
        self
    }

    #[must_use]
    pub fn is_bodyless(&self) -> bool {
        self.modifiers.iter().any(|modifier| modifier.is_bodyless())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeDescriptor {
    pub name: String,
    /// Direct super class and implemented interfaces.
    pub super_type_names: Vec<String>,
    pub methods: Vec<MethodDescriptor>,
}

impl TypeDescriptor {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn extends(mut self, super_type_name: &str) -> Self {
        self.super_type_names.push(super_type_name.to_string());
        self
    }

    #[must_use]
    pub fn method(mut self, method: MethodDescriptor) -> Self {
        self.methods.push(method);
        self
    }
}

/// A type registered in a [`LoadingUnit`], with its ancestor set resolved on first use.
#[derive(Debug)]
pub struct ResolvedType {
    descriptor: TypeDescriptor,
    ancestors: OnceLock<BTreeSet<String>>,
}

impl ResolvedType {
    #[must_use]
    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

/// The unit of type definition and release, analogous to a class loader.
#[derive(Debug)]
pub struct LoadingUnit {
    id: u64,
    parent: Option<Arc<LoadingUnit>>,
    types: RwLock<HashMap<String, Arc<ResolvedType>>>,
}

impl LoadingUnit {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn parent(&self) -> Option<&Arc<LoadingUnit>> {
        self.parent.as_ref()
    }

    /// Looks the name up in this unit only.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<ResolvedType>> {
        self.types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    #[must_use]
    pub fn type_count(&self) -> usize {
        self.types.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[derive(Debug)]
pub struct TypeCache {
    bootstrap: Arc<LoadingUnit>,
    units: Mutex<Vec<Weak<LoadingUnit>>>,
    next_unit_id: AtomicU64,
    registrations: AtomicUsize,
}

impl Default for TypeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            bootstrap: Arc::new(LoadingUnit {
                id: 0,
                parent: None,
                types: RwLock::new(HashMap::new()),
            }),
            units: Mutex::new(Vec::new()),
            next_unit_id: AtomicU64::new(1),
            registrations: AtomicUsize::new(0),
        }
    }

    /// The shared scope every unit falls back to.
    #[must_use]
    pub fn bootstrap(&self) -> &Arc<LoadingUnit> {
        &self.bootstrap
    }

    #[must_use]
    pub fn new_unit(&self, parent: Option<&Arc<LoadingUnit>>) -> Arc<LoadingUnit> {
        let unit = Arc::new(LoadingUnit {
            id: self.next_unit_id.fetch_add(1, Ordering::Relaxed),
            parent: parent.cloned(),
            types: RwLock::new(HashMap::new()),
        });
        self.units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&unit));
        if self.registrations.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            self.purge();
        }
        unit
    }

    /// Defines `descriptor` in `unit`, replacing any earlier definition of the same name.
    pub fn register(&self, unit: &Arc<LoadingUnit>, descriptor: TypeDescriptor) -> Arc<ResolvedType> {
        let resolved = Arc::new(ResolvedType {
            descriptor,
            ancestors: OnceLock::new(),
        });
        let previous = unit
            .types
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(resolved.name().to_string(), Arc::clone(&resolved));
        if previous.is_some() {
            debug!(unit = unit.id, "Redefined type {}", resolved.name());
        }
        resolved
    }

    /// Resolves `name` in `unit`, then its parents, then the bootstrap scope.
    #[must_use]
    pub fn resolve(&self, unit: &LoadingUnit, name: &str) -> Option<Arc<ResolvedType>> {
        let mut current = Some(unit);
        while let Some(scope) = current {
            if let Some(found) = scope.get(name) {
                return Some(found);
            }
            current = scope.parent.as_deref();
        }
        self.bootstrap.get(name)
    }

    /// Names of `resolved` and of every type it transitively extends.
    ///
    /// Super types that cannot be resolved yet still contribute their own name, but the
    /// walk stops there. Only complete sets are memoized, so a super type defined later
    /// is picked up by the next lookup.
    pub fn ancestors<'a>(
        &self,
        unit: &LoadingUnit,
        resolved: &'a ResolvedType,
    ) -> Cow<'a, BTreeSet<String>> {
        if let Some(memoized) = resolved.ancestors.get() {
            return Cow::Borrowed(memoized);
        }
        let mut names = BTreeSet::new();
        names.insert(resolved.name().to_string());
        let mut complete = true;
        let mut pending: Vec<String> = resolved.descriptor.super_type_names.clone();
        while let Some(name) = pending.pop() {
            if !names.insert(name.clone()) {
                continue;
            }
            match self.resolve(unit, &name) {
                Some(super_type) => match super_type.ancestors.get() {
                    Some(memoized) => names.extend(memoized.iter().cloned()),
                    None => pending.extend(super_type.descriptor.super_type_names.iter().cloned()),
                },
                None => complete = false,
            }
        }
        if !complete {
            return Cow::Owned(names);
        }
        Cow::Borrowed(resolved.ancestors.get_or_init(|| names))
    }

    /// Drops entries for units that are no longer reachable. Returns how many were dropped.
    pub fn purge(&self) -> usize {
        let mut units = self.units.lock().unwrap_or_else(PoisonError::into_inner);
        let before = units.len();
        units.retain(|unit| unit.strong_count() > 0);
        let purged = before - units.len();
        if purged > 0 {
            debug!("Purged {} unreachable loading units", purged);
        }
        purged
    }

    /// Entries currently tracked, live or not yet purged.
    #[must_use]
    pub fn tracked_units(&self) -> usize {
        self.units.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn live_units(&self) -> usize {
        self.units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|unit| unit.strong_count() > 0)
            .count()
    }
}
