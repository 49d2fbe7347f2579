// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pointcut descriptors as submitted by operators.
//!
//! A descriptor is plain data. Validation and compilation into executable advice happen in
//! [`crate::weaving::advice`]. Two descriptors with equal fields are the same pointcut,
//! which is what makes repeated submission idempotent.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// What a pointcut records for each matched invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureItem {
    Metric,
    Span,
}

/// Method modifiers a pointcut can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodModifier {
    Public,
    Protected,
    Private,
    Static,
    Final,
    Synchronized,
    Abstract,
    Native,
}

impl MethodModifier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MethodModifier::Public => "public",
            MethodModifier::Protected => "protected",
            MethodModifier::Private => "private",
            MethodModifier::Static => "static",
            MethodModifier::Final => "final",
            MethodModifier::Synchronized => "synchronized",
            MethodModifier::Abstract => "abstract",
            MethodModifier::Native => "native",
        }
    }

    /// Modifiers that leave nothing to intercept.
    #[must_use]
    pub fn is_bodyless(self) -> bool {
        matches!(self, MethodModifier::Abstract | MethodModifier::Native)
    }
}

impl fmt::Display for MethodModifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct PointcutConfig {
    pub capture_items: BTreeSet<CaptureItem>,
    pub type_name: String,
    /// When set, a type also matches if any of its ancestors is named `type_name`.
    pub match_subtypes: bool,
    pub method_name: String,
    /// Ordered argument type names. Matching is exact and order-sensitive.
    pub method_arg_type_names: Vec<String>,
    /// Empty matches any return type.
    pub method_return_type_name: String,
    /// Modifiers the method must carry. Extra modifiers on the method are allowed.
    pub method_modifiers: BTreeSet<MethodModifier>,
    pub metric_name: Option<String>,
    pub span_template: Option<String>,
}

impl Default for PointcutConfig {
    fn default() -> Self {
        Self {
            capture_items: BTreeSet::new(),
            type_name: String::new(),
            match_subtypes: true,
            method_name: String::new(),
            method_arg_type_names: Vec::new(),
            method_return_type_name: String::new(),
            method_modifiers: BTreeSet::new(),
            metric_name: None,
            span_template: None,
        }
    }
}

impl PointcutConfig {
    #[must_use]
    pub fn captures(&self, item: CaptureItem) -> bool {
        self.capture_items.contains(&item)
    }

    /// `Type.method` label used in logs and errors.
    #[must_use]
    pub fn method_label(&self) -> String {
        format!("{}.{}", self.type_name, self.method_name)
    }
}
