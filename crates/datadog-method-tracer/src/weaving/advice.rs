// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Compilation of pointcut descriptors into [`Advice`].
//!
//! Compilation validates the descriptor, pre-parses the span template and interns the
//! metric name. It has no other effect; publishing the result is the advice cache's job.

use std::collections::BTreeSet;
use std::fmt::{self, Write};
use std::sync::OnceLock;

use regex::Regex;
use ustr::Ustr;

use crate::config::pointcut::{CaptureItem, MethodModifier, PointcutConfig};
use crate::errors::MalformedPointcutError;
use crate::weaving::type_cache::MethodDescriptor;
use crate::weaving::value::Value;

const CONTRADICTORY_MODIFIERS: [(MethodModifier, MethodModifier); 6] = [
    (MethodModifier::Public, MethodModifier::Private),
    (MethodModifier::Public, MethodModifier::Protected),
    (MethodModifier::Protected, MethodModifier::Private),
    (MethodModifier::Static, MethodModifier::Abstract),
    (MethodModifier::Final, MethodModifier::Abstract),
    (MethodModifier::Native, MethodModifier::Abstract),
];

#[allow(clippy::expect_used)]
fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").expect("failed creating regex")
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Ret,
    Arg(usize),
}

/// A span message template split into literal text and placeholders.
///
/// `{{ret}}` is the return value or the error description, `{{N}}` the Nth argument.
/// Placeholders with no corresponding value render as nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTemplate {
    segments: Vec<Segment>,
}

impl MessageTemplate {
    pub fn parse(template: &str) -> Result<Self, MalformedPointcutError> {
        let mut segments = Vec::new();
        let mut last = 0;
        for captures in placeholder_regex().captures_iter(template) {
            let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            if whole.start() > last {
                segments.push(Segment::Literal(template[last..whole.start()].to_string()));
            }
            let name = name.as_str();
            let segment = if name == "ret" {
                Segment::Ret
            } else if !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()) {
                let index = name.parse().map_err(|_| MalformedPointcutError::InvalidTemplate {
                    template: template.to_string(),
                    reason: format!("argument index {name} is out of range"),
                })?;
                Segment::Arg(index)
            } else {
                return Err(MalformedPointcutError::InvalidTemplate {
                    template: template.to_string(),
                    reason: format!("unknown placeholder {{{{{name}}}}}"),
                });
            };
            segments.push(segment);
            last = whole.end();
        }
        if last < template.len() {
            segments.push(Segment::Literal(template[last..].to_string()));
        }
        Ok(Self { segments })
    }

    /// Highest `{{N}}` index the template refers to.
    #[must_use]
    pub fn max_arg_index(&self) -> Option<usize> {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Arg(index) => Some(*index),
                _ => None,
            })
            .max()
    }

    #[must_use]
    pub fn render(&self, args: &[Value], returned: Option<&dyn fmt::Display>) -> String {
        let mut message = String::new();
        for segment in &self.segments {
            // Writing to a String cannot fail.
            let _ = match segment {
                Segment::Literal(text) => {
                    message.push_str(text);
                    Ok(())
                }
                Segment::Ret => match returned {
                    Some(value) => write!(message, "{value}"),
                    None => Ok(()),
                },
                Segment::Arg(index) => match args.get(*index) {
                    Some(value) => write!(message, "{value}"),
                    None => Ok(()),
                },
            };
        }
        message
    }
}

/// Executable form of one pointcut.
#[derive(Debug)]
pub struct Advice {
    pointcut: PointcutConfig,
    label: String,
    metric_name: Option<Ustr>,
    template: Option<MessageTemplate>,
}

impl Advice {
    #[must_use]
    pub fn pointcut(&self) -> &PointcutConfig {
        &self.pointcut
    }

    /// `Type.method`, used for open spans and logs.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn metric_name(&self) -> Option<Ustr> {
        self.metric_name
    }

    #[must_use]
    pub fn template(&self) -> Option<&MessageTemplate> {
        self.template.as_ref()
    }

    /// `ancestors` is the type's own name plus every type it extends.
    #[must_use]
    pub fn matches_type(&self, type_name: &str, ancestors: &BTreeSet<String>) -> bool {
        if self.pointcut.match_subtypes {
            ancestors.contains(&self.pointcut.type_name)
        } else {
            type_name == self.pointcut.type_name
        }
    }

    #[must_use]
    pub fn matches_method(&self, method: &MethodDescriptor) -> bool {
        let pointcut = &self.pointcut;
        method.name == pointcut.method_name
            && method.arg_type_names == pointcut.method_arg_type_names
            && (pointcut.method_return_type_name.is_empty()
                || method.return_type_name == pointcut.method_return_type_name)
            && pointcut.method_modifiers.is_subset(&method.modifiers)
    }
}

pub struct AdviceCompiler;

impl AdviceCompiler {
    pub fn validate(pointcut: &PointcutConfig) -> Result<(), MalformedPointcutError> {
        if pointcut.type_name.trim().is_empty() {
            return Err(MalformedPointcutError::EmptyTypeName);
        }
        if pointcut.method_name.trim().is_empty() {
            return Err(MalformedPointcutError::EmptyMethodName);
        }
        let method = pointcut.method_label();
        if pointcut.capture_items.is_empty() {
            return Err(MalformedPointcutError::NoCaptureItems(method));
        }
        if pointcut.captures(CaptureItem::Metric)
            && pointcut.metric_name.as_deref().map_or(true, |name| name.trim().is_empty())
        {
            return Err(MalformedPointcutError::MissingMetricName(method));
        }
        if pointcut.captures(CaptureItem::Span) {
            let template = match pointcut.span_template.as_deref() {
                Some(template) if !template.is_empty() => MessageTemplate::parse(template)?,
                _ => return Err(MalformedPointcutError::MissingSpanTemplate(method)),
            };
            let declared = pointcut.method_arg_type_names.len();
            if let Some(index) = template.max_arg_index().filter(|index| *index >= declared) {
                return Err(MalformedPointcutError::ArgumentOutOfRange {
                    method,
                    index,
                    declared,
                });
            }
        }
        if let Some(position) = pointcut
            .method_arg_type_names
            .iter()
            .position(|arg| arg.trim().is_empty())
        {
            return Err(MalformedPointcutError::EmptyArgType { method, position });
        }
        for (first, second) in CONTRADICTORY_MODIFIERS {
            if pointcut.method_modifiers.contains(&first)
                && pointcut.method_modifiers.contains(&second)
            {
                return Err(MalformedPointcutError::ContradictoryModifiers {
                    method,
                    first: first.as_str(),
                    second: second.as_str(),
                });
            }
        }
        if let Some(modifier) = pointcut.method_modifiers.iter().find(|m| m.is_bodyless()) {
            return Err(MalformedPointcutError::NotInterceptable {
                method,
                modifier: modifier.as_str(),
            });
        }
        Ok(())
    }

    pub fn compile(pointcut: &PointcutConfig) -> Result<Advice, MalformedPointcutError> {
        Self::validate(pointcut)?;

        let metric_name = if pointcut.captures(CaptureItem::Metric) {
            pointcut.metric_name.as_deref().map(Ustr::from)
        } else {
            None
        };
        let template = match (&pointcut.span_template, pointcut.captures(CaptureItem::Span)) {
            (Some(template), true) => Some(MessageTemplate::parse(template)?),
            _ => None,
        };

        Ok(Advice {
            pointcut: pointcut.clone(),
            label: pointcut.method_label(),
            metric_name,
            template,
        })
    }
}
