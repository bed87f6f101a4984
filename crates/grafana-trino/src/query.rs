//! The query model sent by the query editor.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::template::TemplateVariables;

/// The shape in which query results should be returned.
///
/// Serialized as the integer code used by the query editor. The string forms
/// `time_series`, `table` and `logs` are also accepted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Format {
    /// One or more time series, keyed by a time column.
    TimeSeries,
    /// A plain table.
    #[default]
    Table,
    /// Log lines.
    Logs,
}

impl Format {
    /// The integer code for this format.
    pub fn code(self) -> u8 {
        match self {
            Self::TimeSeries => 0,
            Self::Table => 1,
            Self::Logs => 2,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimeSeries => f.write_str("time_series"),
            Self::Table => f.write_str("table"),
            Self::Logs => f.write_str("logs"),
        }
    }
}

/// Error returned when a format code or name is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown format: {0}")]
pub struct UnknownFormat(String);

impl TryFrom<u64> for Format {
    type Error = UnknownFormat;
    fn try_from(code: u64) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::TimeSeries),
            1 => Ok(Self::Table),
            2 => Ok(Self::Logs),
            other => Err(UnknownFormat(other.to_string())),
        }
    }
}

impl std::str::FromStr for Format {
    type Err = UnknownFormat;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "time_series" => Ok(Self::TimeSeries),
            "table" => Ok(Self::Table),
            "logs" => Ok(Self::Logs),
            other => Err(UnknownFormat(other.to_string())),
        }
    }
}

impl Serialize for Format {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for Format {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Code(u64),
            Name(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Code(code) => Format::try_from(code),
            Repr::Name(name) => name.parse::<Format>(),
        }
        .map_err(serde::de::Error::custom)
    }
}

/// A query against a Trino data source.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrinoQuery {
    /// The raw SQL text, possibly containing template variables and macros.
    #[serde(rename = "rawSQL", default)]
    pub raw_sql: String,

    /// The shape of the results.
    #[serde(default)]
    pub format: Format,

    /// Client tags to send with this query, overriding the data source's tags.
    #[serde(default)]
    pub client_tags: Option<String>,

    /// Template variables to apply before execution.
    #[serde(default)]
    pub scoped_vars: TemplateVariables,
}

impl TrinoQuery {
    /// Create a query with the given SQL and format.
    pub fn new(raw_sql: impl Into<String>, format: Format) -> Self {
        Self {
            raw_sql: raw_sql.into(),
            format,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn deserialize_editor_query() {
        let q: TrinoQuery = serde_json::from_value(json!({
            "refId": "A",
            "rawSQL": "select 1",
            "format": 0,
            "clientTags": "team-a",
        }))
        .unwrap();
        assert_eq!(q.raw_sql, "select 1");
        assert_eq!(q.format, Format::TimeSeries);
        assert_eq!(q.client_tags.as_deref(), Some("team-a"));
        assert!(q.scoped_vars.is_empty());
    }

    #[test]
    fn defaults() {
        let q: TrinoQuery = serde_json::from_value(json!({"refId": "A"})).unwrap();
        assert_eq!(q, TrinoQuery::default());
        assert_eq!(q.format, Format::Table);
    }

    #[test]
    fn format_accepts_names() {
        let f: Format = serde_json::from_value(json!("logs")).unwrap();
        assert_eq!(f, Format::Logs);
        assert!(serde_json::from_value::<Format>(json!(7)).is_err());
        assert_eq!(serde_json::to_value(Format::Logs).unwrap(), json!(2));
    }
}
