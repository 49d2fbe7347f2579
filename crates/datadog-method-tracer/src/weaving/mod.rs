// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Matching pointcuts against types as they are defined and attaching hooks to the
//! matching methods.

pub mod advice;
pub mod advice_cache;
pub mod type_cache;
pub mod value;
pub mod weaver;

pub use advice::{Advice, AdviceCompiler, MessageTemplate};
pub use advice_cache::{AdviceCache, AdviceSnapshot};
pub use type_cache::{LoadingUnit, MethodDescriptor, TypeCache, TypeDescriptor};
pub use value::Value;
pub use weaver::{InstrumentationEngine, WovenMethod, WovenType};
