//! Quoting and escaping of template variable values for Trino SQL.
//!
//! Dashboard variables are spliced into raw SQL text before it is sent to Trino.
//! Single-valued variables are expected to sit inside quotes already supplied by
//! the query author (e.g. `WHERE region = '$region'`), so only escaping is applied.
//! Multi-valued variables, or variables with an "All" option, are expected to be
//! used inside an `IN (...)` list, so each value is quoted individually.
use std::fmt;

use itertools::Itertools;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Errors that can occur when interpolating a variable value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterpolateError {
    /// A variable that accepts a single value received a list of values.
    #[error("variable is neither multi-valued nor includes 'All', but received {len} values")]
    UnexpectedList {
        /// The number of values received.
        len: usize,
    },
}

/// The value of a template variable, as resolved by the templating service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableValue {
    /// A single value.
    Scalar(String),
    /// An ordered list of selected values.
    List(Vec<String>),
}

impl VariableValue {
    /// Create a value from the JSON representation used by Grafana.
    ///
    /// Strings are taken verbatim, numbers and booleans use their text form, and
    /// arrays become a [`VariableValue::List`] of their elements' text. `null`
    /// becomes the text `null`.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Array(values) => Self::List(values.iter().map(json_text).collect()),
            other => Self::Scalar(json_text(other)),
        }
    }

    /// The value as plain text, without quoting. Lists are joined with `,`.
    pub fn raw(&self) -> String {
        match self {
            Self::Scalar(v) => v.clone(),
            Self::List(values) => values.join(","),
        }
    }
}

impl From<&str> for VariableValue {
    fn from(value: &str) -> Self {
        Self::Scalar(value.to_string())
    }
}

impl From<String> for VariableValue {
    fn from(value: String) -> Self {
        Self::Scalar(value)
    }
}

impl<T: Into<String>> From<Vec<T>> for VariableValue {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

impl<'de> Deserialize<'de> for VariableValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Value::deserialize(deserializer).map(|v| Self::from_json(&v))
    }
}

/// Largest magnitude below which every integral `f64` is exact as an `i64`.
const EXACT_INTEGER_LIMIT: f64 = 9_007_199_254_740_992.0;

fn json_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        // Integral floats print without a fractional part, e.g. `1.0` as `1`.
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < EXACT_INTEGER_LIMIT => {
                format!("{}", f as i64)
            }
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

/// How a template variable is configured on the dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableOptions {
    /// Whether multiple values can be selected at once.
    #[serde(default)]
    pub multi: bool,
    /// Whether the "All" meta-value can be selected.
    #[serde(default)]
    pub include_all: bool,
}

impl VariableOptions {
    /// Options for a variable that only accepts a single value.
    pub const SINGLE: Self = Self {
        multi: false,
        include_all: false,
    };

    /// Options for a multi-valued variable.
    pub const MULTI: Self = Self {
        multi: true,
        include_all: false,
    };

    fn quotes_each_value(&self) -> bool {
        self.multi || self.include_all
    }
}

/// Escape a value for use inside an existing SQL string literal.
///
/// Every `'` is doubled. No enclosing quotes are added.
pub fn escape_literal(value: impl fmt::Display) -> String {
    value.to_string().replace('\'', "''")
}

/// Quote a value as a complete SQL string literal.
///
/// ```
/// use grafana_trino::interpolate::quote_literal;
///
/// assert_eq!(quote_literal("it's"), "'it''s'");
/// ```
pub fn quote_literal(value: impl fmt::Display) -> String {
    format!("'{}'", escape_literal(value))
}

/// Quote a value as a complete SQL delimited identifier.
///
/// ```
/// use grafana_trino::interpolate::quote_identifier;
///
/// assert_eq!(quote_identifier(r#"a"b"#), r#""a""b""#);
/// ```
pub fn quote_identifier(value: impl fmt::Display) -> String {
    format!("\"{}\"", value.to_string().replace('"', "\"\""))
}

/// Convert a variable value into SQL text to splice into a raw query.
///
/// Variables that accept a single value are only escaped, since the query is
/// expected to supply the quotes. Multi-valued variables and variables with an
/// "All" option produce a comma separated list of quoted literals, suitable for
/// use inside `IN (...)`.
///
/// # Errors
///
/// Returns [`InterpolateError::UnexpectedList`] if a single-valued variable
/// receives a list, since there is no safe way to quote it.
pub fn interpolate(
    value: &VariableValue,
    options: &VariableOptions,
) -> Result<String, InterpolateError> {
    match (value, options.quotes_each_value()) {
        (VariableValue::Scalar(v), false) => Ok(escape_literal(v)),
        (VariableValue::List(values), false) => {
            Err(InterpolateError::UnexpectedList { len: values.len() })
        }
        (VariableValue::Scalar(v), true) => Ok(quote_literal(v)),
        (VariableValue::List(values), true) => Ok(values.iter().map(quote_literal).join(",")),
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    const INCLUDE_ALL: VariableOptions = VariableOptions {
        multi: false,
        include_all: true,
    };

    #[test]
    fn escape_doubles_single_quotes_without_wrapping() {
        assert_eq!(escape_literal("O'Brien"), "O''Brien");
        assert_eq!(escape_literal("''"), "''''");
        assert_eq!(escape_literal(42), "42");
    }

    #[test]
    fn quote_literal_wraps() {
        assert_eq!(quote_literal("abc"), "'abc'");
        assert_eq!(quote_literal("a'b"), "'a''b'");
        assert_eq!(quote_literal(""), "''");
    }

    #[test]
    fn quote_identifier_doubles_double_quotes() {
        assert_eq!(quote_identifier(r#"a"b"#), r#""a""b""#);
        assert_eq!(quote_identifier("it's"), r#""it's""#);
    }

    #[test]
    fn single_value_is_escaped_only() {
        let value = VariableValue::from("eu'west");
        assert_eq!(
            interpolate(&value, &VariableOptions::SINGLE).unwrap(),
            escape_literal("eu'west")
        );
        assert_eq!(
            interpolate(&value, &VariableOptions::SINGLE).unwrap(),
            "eu''west"
        );
    }

    #[test]
    fn multi_or_all_scalar_is_quoted() {
        let value = VariableValue::from("a'b");
        for options in [VariableOptions::MULTI, INCLUDE_ALL] {
            assert_eq!(interpolate(&value, &options).unwrap(), "'a''b'");
        }
    }

    #[test]
    fn multi_list_is_quoted_and_joined() {
        let value = VariableValue::from(vec!["a", "b'c", "d"]);
        assert_eq!(
            interpolate(&value, &VariableOptions::MULTI).unwrap(),
            "'a','b''c','d'"
        );
        assert_eq!(
            interpolate(&VariableValue::List(vec![]), &INCLUDE_ALL).unwrap(),
            ""
        );
    }

    #[test]
    fn single_valued_variable_rejects_list() {
        let value = VariableValue::from(vec!["a", "b"]);
        assert_eq!(
            interpolate(&value, &VariableOptions::SINGLE),
            Err(InterpolateError::UnexpectedList { len: 2 })
        );
    }

    #[test]
    fn json_values_are_coerced_to_text() {
        assert_eq!(
            VariableValue::from_json(&json!(null)),
            VariableValue::from("null")
        );
        assert_eq!(VariableValue::from_json(&json!(1.5)), VariableValue::from("1.5"));
        assert_eq!(
            VariableValue::from_json(&json!(["x", 2, true])),
            VariableValue::from(vec!["x", "2", "true"])
        );
    }

    #[test]
    fn integral_floats_drop_fraction() {
        assert_eq!(VariableValue::from_json(&json!(1.0)), VariableValue::from("1"));
        assert_eq!(VariableValue::from_json(&json!(-20.0)), VariableValue::from("-20"));
        assert_eq!(VariableValue::from_json(&json!(0.25)), VariableValue::from("0.25"));
        assert_eq!(
            VariableValue::from_json(&json!([3.0, 3.5])),
            VariableValue::from(vec!["3", "3.5"])
        );
        assert_eq!(VariableValue::from("x").raw(), "x");
        assert_eq!(VariableValue::from(vec!["a", "b"]).raw(), "a,b");
    }

    #[test]
    fn same_input_same_output() {
        let first = quote_literal("x'y");
        let second = quote_literal("x'y");
        assert_eq!(first, second);
        assert_eq!(escape_literal("x'y"), escape_literal("x'y"));
    }
}
