// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// An argument or return value as seen by advice.
///
/// Values are only ever stringified for span messages, so anything without a natural
/// variant is carried as [`Value::Other`] holding its rendered form.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Return value of a method declared to return nothing.
    Void,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Other(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => f.write_str("void"),
            Value::Null => f.write_str("null"),
            Value::Bool(value) => write!(f, "{value}"),
            Value::Int(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value}"),
            Value::Str(value) | Value::Other(value) => f.write_str(value),
        }
    }
}

impl From<()> for Value {
    fn from((): ()) -> Self {
        Value::Void
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Value::from(()).to_string(), "void");
        assert_eq!(Value::from(None::<i32>).to_string(), "null");
        assert_eq!(Value::from(123).to_string(), "123");
        assert_eq!(Value::from("abc").to_string(), "abc");
        assert_eq!(Value::from(1.5).to_string(), "1.5");
        assert_eq!(Value::Other("Misc@1f".to_string()).to_string(), "Misc@1f");
    }
}
