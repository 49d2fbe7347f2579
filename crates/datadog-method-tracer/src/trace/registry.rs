// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Active traces, at most one per thread.
//!
//! Each entry remembers a weak handle to a token owned by its thread's thread-local
//! storage. When the thread exits the token is dropped, which is how a sweep tells that a
//! trace was abandoned.
//!
//! The owning thread also caches its trace in a thread-local slot so the advised hot path
//! does not touch the shared lock. Only the owning thread registers or completes a trace,
//! which keeps the slot in step with the map.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::thread::{self, ThreadId};

use tracing::debug;

use crate::errors::SamplingFailure;
use crate::trace::model::Trace;

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: Arc<()> = Arc::new(());
    static CURRENT: RefCell<Option<(u64, Weak<Trace>)>> = const { RefCell::new(None) };
}

fn current_thread_token() -> Weak<()> {
    THREAD_TOKEN
        .try_with(Arc::downgrade)
        .unwrap_or_else(|_| Weak::new())
}

#[derive(Debug)]
struct Entry {
    trace: Arc<Trace>,
    owner: Weak<()>,
}

#[derive(Debug)]
pub struct TraceRegistry {
    id: u64,
    traces: RwLock<HashMap<ThreadId, Entry>>,
}

impl Default for TraceRegistry {
    fn default() -> Self {
        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            traces: RwLock::default(),
        }
    }
}

impl TraceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The trace active on the calling thread.
    #[must_use]
    pub fn current(&self) -> Option<Arc<Trace>> {
        if let Some(trace) = self.cached() {
            return Some(trace);
        }
        let trace = self
            .traces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&thread::current().id())
            .map(|entry| Arc::clone(&entry.trace))?;
        self.cache(&trace);
        Some(trace)
    }

    fn cached(&self) -> Option<Arc<Trace>> {
        CURRENT
            .try_with(|slot| match &*slot.borrow() {
                Some((id, trace)) if *id == self.id => trace.upgrade(),
                _ => None,
            })
            .ok()
            .flatten()
            .filter(|trace| !trace.is_complete())
    }

    fn cache(&self, trace: &Arc<Trace>) {
        let _ = CURRENT.try_with(|slot| {
            *slot.borrow_mut() = Some((self.id, Arc::downgrade(trace)));
        });
    }

    fn uncache(&self, trace: &Trace) {
        let _ = CURRENT.try_with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot
                .as_ref()
                .and_then(|(id, cached)| (*id == self.id).then(|| cached.upgrade()))
                .flatten()
                .is_some_and(|cached| cached.id() == trace.id())
            {
                *slot = None;
            }
        });
    }

    /// Registers `trace` for the calling thread, replacing any trace left behind there.
    pub(crate) fn register(&self, trace: Arc<Trace>) {
        self.cache(&trace);
        let entry = Entry {
            trace,
            owner: current_thread_token(),
        };
        let replaced = self
            .traces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(thread::current().id(), entry);
        if let Some(replaced) = replaced {
            debug!("Replaced unfinished trace {}", replaced.trace.id());
        }
    }

    /// Removes `trace` if it is still the one registered for its thread.
    pub(crate) fn remove(&self, trace: &Trace) -> bool {
        if trace.thread_id() == thread::current().id() {
            self.uncache(trace);
        }
        let mut traces = self.traces.write().unwrap_or_else(PoisonError::into_inner);
        match traces.get(&trace.thread_id()) {
            Some(entry) if entry.trace.id() == trace.id() => {
                traces.remove(&trace.thread_id());
                true
            }
            _ => false,
        }
    }

    /// Traces whose owning thread is still alive. Abandoned traces are swept on the way.
    #[must_use]
    pub fn active(&self) -> Vec<Arc<Trace>> {
        let mut active = Vec::new();
        let mut abandoned = Vec::new();
        {
            let traces = self.traces.read().unwrap_or_else(PoisonError::into_inner);
            for (thread_id, entry) in traces.iter() {
                if entry.owner.strong_count() > 0 {
                    active.push(Arc::clone(&entry.trace));
                } else {
                    abandoned.push((*thread_id, entry.trace.id()));
                }
            }
        }
        if !abandoned.is_empty() {
            let mut traces = self.traces.write().unwrap_or_else(PoisonError::into_inner);
            for (thread_id, trace_id) in abandoned {
                if traces
                    .get(&thread_id)
                    .is_some_and(|entry| entry.trace.id() == trace_id && entry.owner.strong_count() == 0)
                {
                    traces.remove(&thread_id);
                    debug!("{}", SamplingFailure::ThreadGone(trace_id));
                }
            }
        }
        active
    }

    /// Drops abandoned traces. Returns how many remain active.
    pub fn sweep(&self) -> usize {
        self.active().len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.traces.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
