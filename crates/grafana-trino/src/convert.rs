//! Conversion of Trino results into Grafana data frames.
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use grafana_plugin_sdk::{
    data::{Field, Frame, Metadata, VisType},
    prelude::*,
};
use serde_json::Value;
use thiserror::Error;

use crate::{
    client::{Column, ResultSet},
    query::Format,
};

/// Errors that can occur when converting results.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConvertError {
    /// A value did not match its column's type.
    #[error("unexpected value {value} in column {column:?} of type {type_}")]
    UnexpectedValue {
        /// The column name.
        column: String,
        /// The column's Trino type.
        type_: String,
        /// The offending value.
        value: Value,
    },

    /// A date, time or timestamp could not be parsed.
    #[error("invalid time value {value:?} in column {column:?}")]
    InvalidTime {
        /// The column name.
        column: String,
        /// The offending value.
        value: String,
    },

    /// A time series was requested but the results have no time column.
    #[error("time series format requires a date, time or timestamp column")]
    MissingTimeColumn,
}

/// The kind of Grafana field a Trino type maps to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    /// Nullable string; used for every type without a better mapping.
    String,
    /// Nullable 64-bit float.
    Float,
    /// Nullable 64-bit integer.
    Int,
    /// Nullable timestamp.
    Time,
    /// Nullable boolean.
    Bool,
}

impl FieldKind {
    /// Determine the field kind for a Trino type such as `timestamp(3) with time zone`.
    pub fn for_trino_type(type_: &str) -> Self {
        let base = type_
            .split(|c: char| c == '(' || c.is_whitespace())
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        match base.as_str() {
            "real" | "double" => Self::Float,
            "tinyint" | "smallint" | "integer" | "bigint" => Self::Int,
            "date" | "time" | "timestamp" => Self::Time,
            "boolean" => Self::Bool,
            _ => Self::String,
        }
    }
}

/// The converted values of a single column.
#[derive(Clone, Debug, PartialEq)]
enum Values {
    String(Vec<Option<String>>),
    Float(Vec<Option<f64>>),
    Int(Vec<Option<i64>>),
    Time(Vec<Option<DateTime<Utc>>>),
    Bool(Vec<Option<bool>>),
}

impl Values {
    fn take(&self, rows: &[usize]) -> Self {
        fn pick<T: Clone>(v: &[Option<T>], rows: &[usize]) -> Vec<Option<T>> {
            rows.iter().map(|&i| v[i].clone()).collect()
        }
        match self {
            Self::String(v) => Self::String(pick(v, rows)),
            Self::Float(v) => Self::Float(pick(v, rows)),
            Self::Int(v) => Self::Int(pick(v, rows)),
            Self::Time(v) => Self::Time(pick(v, rows)),
            Self::Bool(v) => Self::Bool(pick(v, rows)),
        }
    }

    fn into_field(self, name: &str) -> Field {
        match self {
            Self::String(v) => v.into_opt_field(name),
            Self::Float(v) => v.into_opt_field(name),
            Self::Int(v) => v.into_opt_field(name),
            Self::Time(v) => v.into_opt_field(name),
            Self::Bool(v) => v.into_opt_field(name),
        }
    }

    fn label(&self, row: usize) -> String {
        match self {
            Self::String(v) => v[row].clone().unwrap_or_default(),
            _ => String::new(),
        }
    }
}

struct ConvertedColumn {
    name: String,
    kind: FieldKind,
    values: Values,
}

fn convert_column(
    index: usize,
    column: &Column,
    rows: &[Vec<Value>],
) -> Result<ConvertedColumn, ConvertError> {
    let kind = FieldKind::for_trino_type(&column.type_);
    let cells = rows.iter().map(|row| row.get(index).unwrap_or(&Value::Null));
    let unexpected = |value: &Value| ConvertError::UnexpectedValue {
        column: column.name.clone(),
        type_: column.type_.clone(),
        value: value.clone(),
    };
    let values = match kind {
        FieldKind::String => Values::String(
            cells
                .map(|v| match v {
                    Value::Null => None,
                    Value::String(s) => Some(s.clone()),
                    other => Some(other.to_string()),
                })
                .collect(),
        ),
        FieldKind::Float => Values::Float(
            cells
                .map(|v| match v {
                    Value::Null => Ok(None),
                    // Trino sends NaN and infinities as strings.
                    Value::String(s) => s.parse().map(Some).map_err(|_| unexpected(v)),
                    other => other.as_f64().map(Some).ok_or_else(|| unexpected(v)),
                })
                .collect::<Result<_, _>>()?,
        ),
        FieldKind::Int => Values::Int(
            cells
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::String(s) => s.parse().map(Some).map_err(|_| unexpected(v)),
                    other => other.as_i64().map(Some).ok_or_else(|| unexpected(v)),
                })
                .collect::<Result<_, _>>()?,
        ),
        FieldKind::Bool => Values::Bool(
            cells
                .map(|v| match v {
                    Value::Null => Ok(None),
                    other => other.as_bool().map(Some).ok_or_else(|| unexpected(v)),
                })
                .collect::<Result<_, _>>()?,
        ),
        FieldKind::Time => Values::Time(
            cells
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::String(s) => parse_time(s).map(Some).ok_or_else(|| {
                        ConvertError::InvalidTime {
                            column: column.name.clone(),
                            value: s.clone(),
                        }
                    }),
                    other => Err(unexpected(other)),
                })
                .collect::<Result<_, _>>()?,
        ),
    };
    Ok(ConvertedColumn {
        name: column.name.clone(),
        kind,
        values,
    })
}

/// Drop fractional digits beyond nanoseconds; Trino supports up to picoseconds.
fn truncate_fraction(s: &str) -> std::borrow::Cow<'_, str> {
    match s.split_once('.') {
        Some((whole, frac)) if frac.len() > 9 => format!("{whole}.{}", &frac[..9]).into(),
        _ => s.into(),
    }
}

fn parse_zone(naive: NaiveDateTime, zone: &str) -> Option<DateTime<Utc>> {
    if zone == "UTC" || zone == "Z" {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if zone.starts_with(['+', '-']) {
        let dated = format!("2000-01-01 00:00:00 {zone}");
        let offset = *DateTime::parse_from_str(&dated, "%Y-%m-%d %H:%M:%S %:z")
            .ok()?
            .offset();
        return offset_to_utc(naive, offset);
    }
    let tz: Tz = zone.parse().ok()?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

fn offset_to_utc(naive: NaiveDateTime, offset: FixedOffset) -> Option<DateTime<Utc>> {
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse a Trino `date`, `time` or `timestamp` value, with or without a zone.
///
/// Times without a date are placed on 1970-01-01. Values without a zone are
/// interpreted as UTC.
pub fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    let mut parts = s.splitn(3, ' ');
    let first = parts.next()?;
    if let Ok(date) = NaiveDate::parse_from_str(first, "%Y-%m-%d") {
        let time = parts.next()?;
        let time = NaiveTime::parse_from_str(&truncate_fraction(time), "%H:%M:%S%.f").ok()?;
        let naive = date.and_time(time);
        return match parts.next() {
            Some(zone) => parse_zone(naive, zone.trim()),
            None => Some(Utc.from_utc_datetime(&naive)),
        };
    }
    // A time of day, possibly followed directly by an offset, e.g. `12:00:00.000+01:00`.
    let (time, offset) = match first.find(['+', '-']) {
        Some(idx) => (&first[..idx], Some(&first[idx..])),
        None => (first, None),
    };
    let time = NaiveTime::parse_from_str(&truncate_fraction(time), "%H:%M:%S%.f").ok()?;
    let naive = NaiveDate::from_ymd_opt(1970, 1, 1)?.and_time(time);
    match offset {
        Some(offset) => parse_zone(naive, offset),
        None => Some(Utc.from_utc_datetime(&naive)),
    }
}

fn metadata(sql: &str, format: Format) -> Metadata {
    let mut meta = Metadata::default();
    meta.executed_query_string = Some(sql.to_string());
    meta.preferred_visualisation = Some(match format {
        Format::TimeSeries => VisType::Graph,
        Format::Table => VisType::Table,
        Format::Logs => VisType::Logs,
    });
    meta
}

/// Convert a result set into frames of the requested format.
///
/// Table and log results produce a single frame. Time series results produce
/// one frame per distinct combination of string column values; those columns
/// become labels on the remaining value fields.
pub fn to_frames(
    name: &str,
    results: &ResultSet,
    format: Format,
    sql: &str,
) -> Result<Vec<Frame>, ConvertError> {
    let columns = results
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| convert_column(i, c, &results.rows))
        .collect::<Result<Vec<_>, _>>()?;
    match format {
        Format::Table | Format::Logs => Ok(vec![Frame::new(name)
            .with_fields(columns.into_iter().map(|c| c.values.into_field(&c.name)))
            .with_metadata(metadata(sql, format))]),
        Format::TimeSeries => time_series_frames(name, columns, results.rows.len(), sql),
    }
}

fn time_series_frames(
    name: &str,
    columns: Vec<ConvertedColumn>,
    n_rows: usize,
    sql: &str,
) -> Result<Vec<Frame>, ConvertError> {
    let time_idx = columns
        .iter()
        .position(|c| c.kind == FieldKind::Time && c.name.eq_ignore_ascii_case("time"))
        .or_else(|| columns.iter().position(|c| c.kind == FieldKind::Time))
        .ok_or(ConvertError::MissingTimeColumn)?;
    let (label_cols, value_cols): (Vec<_>, Vec<_>) = columns
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != time_idx)
        .map(|(_, c)| c)
        .partition(|c| c.kind == FieldKind::String);

    // Group rows by their label values, keeping the order of first appearance.
    let mut groups: Vec<(BTreeMap<String, String>, Vec<usize>)> = Vec::new();
    let mut index: HashMap<Vec<String>, usize> = HashMap::new();
    for row in 0..n_rows {
        let key: Vec<String> = label_cols.iter().map(|c| c.values.label(row)).collect();
        let group = *index.entry(key.clone()).or_insert_with(|| {
            let labels = label_cols
                .iter()
                .map(|c| c.name.clone())
                .zip(key)
                .collect();
            groups.push((labels, Vec::new()));
            groups.len() - 1
        });
        groups[group].1.push(row);
    }
    if groups.is_empty() {
        groups.push((BTreeMap::new(), Vec::new()));
    }

    let time = &columns[time_idx];
    Ok(groups
        .into_iter()
        .map(|(labels, rows)| {
            let fields = std::iter::once(time.values.take(&rows).into_field(&time.name)).chain(
                value_cols.iter().map(|c| {
                    c.values
                        .take(&rows)
                        .into_field(&c.name)
                        .with_labels(labels.clone())
                }),
            );
            Frame::new(name)
                .with_fields(fields)
                .with_metadata(metadata(sql, Format::TimeSeries))
        })
        .collect())
}
