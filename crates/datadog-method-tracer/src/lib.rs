// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Datadog Method Tracer
//!
//! In-process instrumentation core: compiles pointcut descriptors into advice, weaves that
//! advice into matching methods as types are defined, assembles the resulting measurements
//! into span trees and metrics, and escalates long-running traces to stack sampling.
//!
//! ## Architecture
//!
//! - [`weaving`]: type metadata cache, advice compilation and the instrumentation engine
//! - [`trace`]: trace/span/metric model, the active trace registry, sinks and schedulers
//! - [`plugin`]: the per-plugin facade used by instrumentation code
//! - [`module`]: wiring of all of the above plus background task lifecycle
//! - [`config`]: layered configuration and the live `ConfigService`
//!
//! ```text
//! ConfigService ──> AdviceCache ──> InstrumentationEngine ──> WovenMethod::invoke
//!                                                                  │
//!                         TraceRegistry <── TraceCapture <─────────┘
//!                              │                 │
//!                   schedulers ┘                 └──> TraceSink
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod clock;
pub mod config;
pub mod errors;
pub mod logger;
pub mod module;
pub mod plugin;
pub mod trace;
pub mod weaving;

pub use module::TraceModule;
pub use plugin::PluginServices;
