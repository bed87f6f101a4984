//! Expansion of time-range macros in SQL, rendered as Trino SQL.
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

/// Errors that can occur when expanding macros.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MacroError {
    /// A macro was called with the wrong number of arguments.
    #[error("macro {name} expects {expected} argument(s), got {got}")]
    Arity {
        /// The macro name, including the `$__` prefix.
        name: String,
        /// The expected argument count.
        expected: usize,
        /// The number of arguments supplied.
        got: usize,
    },

    /// A macro call was missing its closing parenthesis.
    #[error("unterminated arguments for macro {0}")]
    Unterminated(String),

    /// An interval argument could not be parsed.
    #[error("invalid interval {0:?}")]
    InvalidInterval(String),
}

/// The time range a query is evaluated over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueryRange {
    /// Start of the range.
    pub from: DateTime<Utc>,
    /// End of the range.
    pub to: DateTime<Utc>,
}

/// Parse an interval such as `100ms`, `30s`, `5m`, `1h`, `1d` or `1w`.
pub fn parse_interval(s: &str) -> Result<Duration, MacroError> {
    let invalid = || MacroError::InvalidInterval(s.to_string());
    let s = s.trim().trim_matches('\'');
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (amount, unit) = s.split_at(split);
    let amount: u64 = amount.parse().map_err(|_| invalid())?;
    let seconds = match unit {
        "ms" => return Ok(Duration::from_millis(amount)),
        "s" | "" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        "w" => 7 * 24 * 60 * 60,
        _ => return Err(invalid()),
    };
    amount
        .checked_mul(seconds)
        .map(Duration::from_secs)
        .ok_or_else(invalid)
}

const KNOWN: [&str; 5] = [
    "$__timeFilter",
    "$__timeFrom",
    "$__timeTo",
    "$__timeGroup",
    "$__unixEpochFilter",
];

fn timestamp(t: DateTime<Utc>) -> String {
    format!(
        "from_iso8601_timestamp('{}')",
        t.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

fn expect_args(name: &str, args: &[&str], expected: usize) -> Result<(), MacroError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(MacroError::Arity {
            name: name.to_string(),
            expected,
            got: args.len(),
        })
    }
}

fn render(
    name: &str,
    args: &[&str],
    range: &QueryRange,
) -> Result<Option<String>, MacroError> {
    let rendered = match name {
        "$__timeFilter" => {
            expect_args(name, args, 1)?;
            format!(
                "{} BETWEEN {} AND {}",
                args[0],
                timestamp(range.from),
                timestamp(range.to)
            )
        }
        "$__timeFrom" => {
            expect_args(name, args, 0)?;
            timestamp(range.from)
        }
        "$__timeTo" => {
            expect_args(name, args, 0)?;
            timestamp(range.to)
        }
        "$__timeGroup" => {
            expect_args(name, args, 2)?;
            let interval = parse_interval(args[1])?;
            if interval.is_zero() {
                return Err(MacroError::InvalidInterval(args[1].to_string()));
            }
            let secs = interval.as_secs_f64();
            format!(
                "from_unixtime(floor(to_unixtime({}) / {secs}) * {secs})",
                args[0]
            )
        }
        "$__unixEpochFilter" => {
            expect_args(name, args, 1)?;
            format!(
                "{col} >= {} AND {col} <= {}",
                range.from.timestamp(),
                range.to.timestamp(),
                col = args[0]
            )
        }
        _ => return Ok(None),
    };
    Ok(Some(rendered))
}

/// Split a macro's argument list on top-level commas.
fn split_args(args: &str) -> Vec<&str> {
    if args.trim().is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in args.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(args[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(args[start..].trim());
    out
}

/// Find the index of the parenthesis closing the one opening `s`.
fn closing_paren(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Expand all known macros in `sql` for the given time range.
///
/// Unknown `$__` names are left as they are.
pub fn expand(sql: &str, range: &QueryRange) -> Result<String, MacroError> {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(start) = rest.find("$__") {
        out.push_str(&rest[..start]);
        let candidate = &rest[start..];
        let name_len = 3 + candidate[3..]
            .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .unwrap_or(candidate.len() - 3);
        let name = &candidate[..name_len];
        let after = &candidate[name_len..];
        if !KNOWN.contains(&name) {
            out.push_str(name);
            rest = after;
            continue;
        }
        let (args, consumed) = if after.starts_with('(') {
            let close = closing_paren(after)
                .ok_or_else(|| MacroError::Unterminated(name.to_string()))?;
            (split_args(&after[1..close]), name_len + close + 1)
        } else {
            (Vec::new(), name_len)
        };
        match render(name, &args, range)? {
            Some(rendered) => {
                out.push_str(&rendered);
                rest = &candidate[consumed..];
            }
            None => {
                out.push_str(name);
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}
