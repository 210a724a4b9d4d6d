//! Per-column type coercion rules, grounded on
//! `original_source/scripts/tables.py::DataCoreClient.change_columns` and
//! `convert_format_date`.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;

/// Date/time format try-list, in order.
pub const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%SZ",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%z",
    "%d.%m.%YT%H:%M:%SZ",
    "%d.%m.%YT%H:%M:%S",
    "%d.%m.%YT%H:%M:%S%z",
    "%d.%m.%Y %H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%d.%m.%Y",
    "%Y-%m-%d",
];

/// Sentinel lower bound for date/datetime columns.
pub fn sentinel_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1925, 1, 1).expect("1925-01-01 is a valid date")
}

pub enum DateKind {
    Date,
    DateTime,
}

/// Result of coercing one date/datetime value: the value to store, plus an
/// optional note to append to the sentinel column.
pub struct CoercedDate {
    pub value: Value,
    pub sentinel_note: Option<String>,
}

/// float: strip internal whitespace between digits, replace `,` with `.`,
/// parse; empty/null -> null.
pub fn coerce_float(raw: &Value) -> Value {
    let Some(s) = scalar_as_str(raw) else {
        return Value::Null;
    };
    let cleaned = strip_internal_whitespace(&s).replace(',', ".");
    if cleaned.is_empty() {
        return Value::Null;
    }
    match cleaned.parse::<f64>() {
        Ok(f) => serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        Err(_) => Value::String(cleaned),
    }
}

/// int: strip internal whitespace, parse; empty/null -> null.
pub fn coerce_int(raw: &Value) -> Value {
    let Some(s) = scalar_as_str(raw) else {
        return Value::Null;
    };
    let cleaned = strip_internal_whitespace(&s);
    if cleaned.is_empty() {
        return Value::Null;
    }
    match cleaned.parse::<i64>() {
        Ok(i) => Value::Number(i.into()),
        Err(_) => Value::String(cleaned),
    }
}

/// bool: if the value is a string, map `"ДА"` (case-insensitive) -> true, else false.
pub fn coerce_bool(raw: &Value) -> Value {
    match raw {
        Value::String(s) => Value::Bool(s.to_uppercase() == "ДА"),
        Value::Bool(b) => Value::Bool(*b),
        Value::Null => Value::Null,
        _ => Value::Bool(false),
    }
}

/// date / datetime: try the ordered format list; apply the 1925-01-01
/// sentinel floor on success; on total parse failure, keep the raw string.
pub fn coerce_date(raw: &Value, column: &str, kind: DateKind) -> CoercedDate {
    let Some(s) = scalar_as_str(raw) else {
        return CoercedDate {
            value: Value::Null,
            sentinel_note: None,
        };
    };
    if s.is_empty() {
        return CoercedDate {
            value: Value::Null,
            sentinel_note: None,
        };
    }

    match try_parse(&s) {
        Some(parsed) => {
            if parsed.date() < sentinel_date() {
                let floor = sentinel_date();
                let value = format_for_kind(floor.and_hms_opt(0, 0, 0).unwrap(), &kind);
                let Value::String(parsed_iso) = format_for_kind(parsed, &kind) else {
                    unreachable!("format_for_kind always returns Value::String")
                };
                CoercedDate {
                    value,
                    sentinel_note: Some(format!("({column}: {parsed_iso})\n")),
                }
            } else {
                CoercedDate {
                    value: format_for_kind(parsed, &kind),
                    sentinel_note: None,
                }
            }
        }
        None => CoercedDate {
            value: Value::String(s),
            sentinel_note: None,
        },
    }
}

fn format_for_kind(dt: NaiveDateTime, kind: &DateKind) -> Value {
    match kind {
        DateKind::Date => Value::String(dt.date().format("%Y-%m-%d").to_string()),
        DateKind::DateTime => Value::String(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
    }
}

fn try_parse(raw: &str) -> Option<NaiveDateTime> {
    for fmt in DATE_FORMATS {
        if fmt.contains("%z") {
            if let Ok(dt) = DateTime::parse_from_str(raw, fmt) {
                return Some(dt.naive_utc());
            }
        } else if fmt.contains("%H") {
            if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
                return Some(dt);
            }
        } else if let Ok(d) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(d.and_hms_opt(0, 0, 0).unwrap());
        }
    }
    None
}

fn scalar_as_str(raw: &Value) -> Option<String> {
    match raw {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Remove whitespace that sits strictly between two digits, matching the
/// source's `re.sub(r'(?<=\d)\s+(?=\d)', '', str(value))`.
fn strip_internal_whitespace(s: &str) -> String {
    let chars: Vec<char> = s.trim().chars().collect();
    let mut out = String::with_capacity(chars.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            let prev_digit = out.chars().last().map(char::is_numeric).unwrap_or(false);
            let next_digit = chars.get(i + 1).map(|c| c.is_numeric()).unwrap_or(false);
            if prev_digit && next_digit {
                i += 1;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }
    out
}
