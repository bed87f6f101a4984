//! Template variable substitution in raw SQL text.
use std::collections::HashMap;

use serde::Deserialize;

use crate::interpolate::{InterpolateError, VariableOptions, VariableValue};

/// Formats a single variable occurrence into SQL text.
pub type Formatter<'a> =
    &'a dyn Fn(&VariableValue, &VariableOptions) -> Result<String, InterpolateError>;

/// A service which replaces template variable occurrences in a string.
///
/// Implementations find each variable occurrence in `target` and splice in
/// the text returned by `format` for that variable's value.
pub trait TemplateSrv {
    /// Replace all known variables in `target`.
    fn replace(&self, target: &str, format: Formatter<'_>) -> Result<String, InterpolateError>;
}

/// A template variable, together with its current value.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TemplateVariable {
    /// The currently selected value(s).
    pub value: VariableValue,
    /// How the variable is configured.
    #[serde(flatten)]
    pub options: VariableOptions,
}

impl TemplateVariable {
    /// Create a new variable.
    pub fn new(value: impl Into<VariableValue>, options: VariableOptions) -> Self {
        Self {
            value: value.into(),
            options,
        }
    }
}

/// A set of named template variables.
///
/// Variables may be referenced as `$name`, `${name}` or `[[name]]`. Occurrences
/// of names that are not in the set are left untouched.
///
/// `${name:raw}` and `[[name:raw]]` splice the value in without escaping, with
/// list values joined by `,`. Any other format suffix is ignored and the value
/// goes through the formatter like an unformatted reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct TemplateVariables(HashMap<String, TemplateVariable>);

impl TemplateVariables {
    /// Create an empty set of variables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a variable, returning the updated set.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, variable: TemplateVariable) -> Self {
        self.0.insert(name.into(), variable);
        self
    }

    /// Whether there are no variables in the set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, TemplateVariable)> for TemplateVariables {
    fn from_iter<T: IntoIterator<Item = (String, TemplateVariable)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// A variable reference found in a string.
struct Occurrence<'a> {
    name: &'a str,
    format: Option<&'a str>,
    len: usize,
}

impl<'a> Occurrence<'a> {
    /// Parse the inside of `${...}` or `[[...]]`, i.e. `name` or `name:format`.
    fn braced(inner: &'a str, len: usize) -> Option<Self> {
        let (name, format) = match inner.split_once(':') {
            Some((name, format)) => (name, Some(format)),
            None => (inner, None),
        };
        (!name.is_empty() && name.chars().all(is_name_char)).then_some(Self { name, format, len })
    }

    fn is_raw(&self) -> bool {
        self.format == Some("raw")
    }
}

/// Parse a variable reference at the start of `s`, if there is one.
fn parse_occurrence(s: &str) -> Option<Occurrence<'_>> {
    if let Some(rest) = s.strip_prefix("${") {
        let end = rest.find('}')?;
        Occurrence::braced(&rest[..end], end + 3)
    } else if let Some(rest) = s.strip_prefix("[[") {
        let end = rest.find("]]")?;
        Occurrence::braced(&rest[..end], end + 4)
    } else if let Some(rest) = s.strip_prefix('$') {
        let end = rest.find(|c: char| !is_name_char(c)).unwrap_or(rest.len());
        (end > 0).then_some(Occurrence {
            name: &rest[..end],
            format: None,
            len: end + 1,
        })
    } else {
        None
    }
}

impl TemplateSrv for TemplateVariables {
    fn replace(&self, target: &str, format: Formatter<'_>) -> Result<String, InterpolateError> {
        let mut out = String::with_capacity(target.len());
        let mut rest = target;
        while let Some(idx) = rest.find(['$', '[']) {
            out.push_str(&rest[..idx]);
            rest = &rest[idx..];
            match parse_occurrence(rest) {
                Some(occ) => {
                    match self.0.get(occ.name) {
                        Some(var) if occ.is_raw() => out.push_str(&var.value.raw()),
                        Some(var) => out.push_str(&format(&var.value, &var.options)?),
                        None => out.push_str(&rest[..occ.len]),
                    }
                    rest = &rest[occ.len..];
                }
                None => {
                    // Not a reference; keep the character and move on.
                    let c = rest.chars().next().map_or(1, char::len_utf8);
                    out.push_str(&rest[..c]);
                    rest = &rest[c..];
                }
            }
        }
        out.push_str(rest);
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::interpolate::interpolate;

    fn vars() -> TemplateVariables {
        TemplateVariables::new()
            .with(
                "region",
                TemplateVariable::new("eu'west", VariableOptions::SINGLE),
            )
            .with(
                "hosts",
                TemplateVariable::new(vec!["a", "b"], VariableOptions::MULTI),
            )
    }

    #[test]
    fn replaces_all_syntaxes() {
        let sql = "SELECT * FROM t WHERE r = '$region' AND h IN (${hosts}) AND x = '[[region]]'";
        assert_eq!(
            vars().replace(sql, &interpolate).unwrap(),
            "SELECT * FROM t WHERE r = 'eu''west' AND h IN ('a','b') AND x = 'eu''west'"
        );
    }

    #[test]
    fn unknown_variables_and_macros_are_left_alone() {
        let sql = "SELECT $__timeFrom(), $missing, ${other:csv}, arr[1], $ FROM t";
        assert_eq!(vars().replace(sql, &interpolate).unwrap(), sql);
    }

    #[test]
    fn format_suffix_is_ignored_for_lookup() {
        assert_eq!(
            vars().replace("${hosts:csv}", &interpolate).unwrap(),
            "'a','b'"
        );
    }

    #[test]
    fn raw_format_skips_escaping() {
        assert_eq!(
            vars().replace("${region:raw} [[region:raw]] ${hosts:raw}", &interpolate).unwrap(),
            "eu'west eu'west a,b"
        );
        assert_eq!(vars().replace("[[hosts:csv]]", &interpolate).unwrap(), "'a','b'");
    }

    #[test]
    fn raw_format_accepts_lists_for_single_value_variables() {
        let vars = TemplateVariables::new().with(
            "cols",
            TemplateVariable::new(vec!["a", "b"], VariableOptions::SINGLE),
        );
        assert_eq!(vars.replace("SELECT ${cols:raw}", &interpolate).unwrap(), "SELECT a,b");
        assert!(vars.replace("SELECT ${cols}", &interpolate).is_err());
    }

    #[test]
    fn errors_propagate() {
        let vars = TemplateVariables::new().with(
            "bad",
            TemplateVariable::new(vec!["a"], VariableOptions::SINGLE),
        );
        assert!(vars.replace("$bad", &interpolate).is_err());
    }

    #[test]
    fn deserializes_scoped_vars() {
        let vars: TemplateVariables = serde_json::from_value(json!({
            "env": {"text": "prod", "value": "prod"},
            "dc": {"value": ["x", "y"], "multi": true},
        }))
        .unwrap();
        assert_eq!(
            vars.replace("$env/$dc", &interpolate).unwrap(),
            "prod/'x','y'"
        );
    }
}
