//! Scalar values and typed views over arrow columns.

use crate::error::{EngineError, Result};
use crate::event::ColumnKind;
use arrow::array::{
    Array, ArrayRef, AsArray, Date32Array, DictionaryArray, Float64Array, Int32Array, Int64Array,
    StringArray, TimestampMillisecondArray, UInt32Array,
};
use arrow::datatypes::{DataType, Int32Type, TimeUnit};
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// A single cell of an event row, group key or result row.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Int(_) | Value::Float(_) => 1,
            Value::Str(_) => 2,
            Value::Date(_) => 3,
            Value::DateTime(_) => 4,
        }
    }

    /// Sortable text used as an index key.
    pub fn index_key(&self) -> Option<String> {
        match self {
            Value::Str(s) => Some(s.clone()),
            Value::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            _ => None,
        }
    }

    /// Coerce a JSON literal to the domain of a column.
    pub fn from_json(kind: ColumnKind, literal: &serde_json::Value) -> Result<Value> {
        let invalid = || {
            EngineError::query(format!(
                "literal {} is not a valid {:?} value",
                literal, kind
            ))
        };
        if literal.is_null() {
            return Ok(Value::Null);
        }
        let text = literal.as_str();
        match kind {
            ColumnKind::Int => literal
                .as_i64()
                .or_else(|| text.and_then(|s| s.trim().parse().ok()))
                .map(Value::Int)
                .ok_or_else(invalid),
            ColumnKind::Float => literal
                .as_f64()
                .or_else(|| text.and_then(|s| s.trim().parse().ok()))
                .map(Value::Float)
                .ok_or_else(invalid),
            ColumnKind::Str => match literal {
                serde_json::Value::String(s) => Ok(Value::Str(s.clone())),
                serde_json::Value::Number(n) => Ok(Value::Str(n.to_string())),
                _ => Err(invalid()),
            },
            ColumnKind::Date => text
                .and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
                .map(Value::Date)
                .ok_or_else(invalid),
            ColumnKind::DateTime => text
                .and_then(|s| {
                    let s = s.trim();
                    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
                        .ok()
                })
                .map(Value::DateTime)
                .ok_or_else(invalid),
        }
    }

    /// SQL-style literal, used in query signatures and plan logging.
    pub fn to_literal(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => format!("{:?}", v),
            other => format!("'{}'", other),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).total_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.total_cmp(&(*b as f64)),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(s) => f.write_str(s),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

const UNIX_EPOCH_DAY: i32 = 719_163;

pub fn date_to_days(date: NaiveDate) -> i32 {
    use chrono::Datelike;
    date.num_days_from_ce() - UNIX_EPOCH_DAY
}

pub fn datetime_to_millis(dt: NaiveDateTime) -> i64 {
    dt.and_utc().timestamp_millis()
}

/// Build an arrow array of the given kind from values. Values that do not
/// fit the kind are written as nulls.
pub fn values_to_array<'a>(kind: ColumnKind, values: impl Iterator<Item = &'a Value>) -> ArrayRef {
    match kind {
        ColumnKind::Int => Arc::new(
            values
                .map(|v| match v {
                    Value::Int(i) => Some(*i),
                    _ => None,
                })
                .collect::<Int64Array>(),
        ),
        ColumnKind::Float => Arc::new(values.map(Value::as_f64).collect::<Float64Array>()),
        ColumnKind::Str => Arc::new(
            values
                .map(|v| match v {
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .collect::<StringArray>(),
        ),
        ColumnKind::Date => Arc::new(
            values
                .map(|v| match v {
                    Value::Date(d) => Some(date_to_days(*d)),
                    _ => None,
                })
                .collect::<Date32Array>(),
        ),
        ColumnKind::DateTime => Arc::new(
            values
                .map(|v| match v {
                    Value::DateTime(dt) => Some(datetime_to_millis(*dt)),
                    _ => None,
                })
                .collect::<TimestampMillisecondArray>(),
        ),
    }
}

/// Infer the kind of a result column from its first non-null value.
pub fn infer_kind<'a>(mut values: impl Iterator<Item = &'a Value>) -> ColumnKind {
    match values.find(|v| !v.is_null()) {
        Some(Value::Int(_)) => ColumnKind::Int,
        Some(Value::Float(_)) => ColumnKind::Float,
        Some(Value::Date(_)) => ColumnKind::Date,
        Some(Value::DateTime(_)) => ColumnKind::DateTime,
        _ => ColumnKind::Str,
    }
}

/// Typed read access to one arrow column, downcast once per batch.
pub enum ColumnView<'a> {
    Int64(&'a Int64Array),
    Int32(&'a Int32Array),
    UInt32(&'a UInt32Array),
    Float64(&'a Float64Array),
    Utf8(&'a StringArray),
    Dictionary(&'a DictionaryArray<Int32Type>, &'a StringArray),
    Date32(&'a Date32Array),
    TimestampMs(&'a TimestampMillisecondArray),
}

impl<'a> ColumnView<'a> {
    pub fn try_new(array: &'a ArrayRef) -> Result<Self> {
        macro_rules! downcast {
            ($arr_type:ty) => {
                array.as_any().downcast_ref::<$arr_type>().ok_or_else(|| {
                    EngineError::Conversion(format!(
                        "Failed to downcast column to {}",
                        stringify!($arr_type)
                    ))
                })?
            };
        }

        Ok(match array.data_type() {
            DataType::Int64 => ColumnView::Int64(downcast!(Int64Array)),
            DataType::Int32 => ColumnView::Int32(downcast!(Int32Array)),
            DataType::UInt32 => ColumnView::UInt32(downcast!(UInt32Array)),
            DataType::Float64 => ColumnView::Float64(downcast!(Float64Array)),
            DataType::Utf8 => ColumnView::Utf8(downcast!(StringArray)),
            DataType::Date32 => ColumnView::Date32(downcast!(Date32Array)),
            DataType::Timestamp(TimeUnit::Millisecond, _) => {
                ColumnView::TimestampMs(downcast!(TimestampMillisecondArray))
            }
            DataType::Dictionary(key_type, value_type)
                if **key_type == DataType::Int32 && **value_type == DataType::Utf8 =>
            {
                let dict = downcast!(DictionaryArray<Int32Type>);
                let values = dict.values().as_string::<i32>();
                ColumnView::Dictionary(dict, values)
            }
            other => {
                return Err(EngineError::UnsupportedType(format!(
                    "Unsupported column data type: {:?}",
                    other
                )))
            }
        })
    }

    pub fn value(&self, row: usize) -> Value {
        match self {
            ColumnView::Int64(arr) => {
                if arr.is_null(row) {
                    Value::Null
                } else {
                    Value::Int(arr.value(row))
                }
            }
            ColumnView::Int32(arr) => {
                if arr.is_null(row) {
                    Value::Null
                } else {
                    Value::Int(i64::from(arr.value(row)))
                }
            }
            ColumnView::UInt32(arr) => {
                if arr.is_null(row) {
                    Value::Null
                } else {
                    Value::Int(i64::from(arr.value(row)))
                }
            }
            ColumnView::Float64(arr) => {
                if arr.is_null(row) {
                    Value::Null
                } else {
                    Value::Float(arr.value(row))
                }
            }
            ColumnView::Utf8(arr) => {
                if arr.is_null(row) {
                    Value::Null
                } else {
                    Value::Str(arr.value(row).to_string())
                }
            }
            ColumnView::Dictionary(dict, values) => {
                if dict.is_null(row) {
                    Value::Null
                } else {
                    let key = dict.keys().value(row) as usize;
                    Value::Str(values.value(key).to_string())
                }
            }
            ColumnView::Date32(arr) => arr
                .value_as_date(row)
                .filter(|_| !arr.is_null(row))
                .map_or(Value::Null, Value::Date),
            ColumnView::TimestampMs(arr) => arr
                .value_as_datetime(row)
                .filter(|_| !arr.is_null(row))
                .map_or(Value::Null, Value::DateTime),
        }
    }

    /// Numeric value of a row, without allocating.
    pub fn f64(&self, row: usize) -> Option<f64> {
        match self {
            ColumnView::Int64(arr) if !arr.is_null(row) => Some(arr.value(row) as f64),
            ColumnView::Int32(arr) if !arr.is_null(row) => Some(f64::from(arr.value(row))),
            ColumnView::UInt32(arr) if !arr.is_null(row) => Some(f64::from(arr.value(row))),
            ColumnView::Float64(arr) if !arr.is_null(row) => Some(arr.value(row)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ordering_mixes_ints_and_floats() {
        assert!(Value::Int(2) < Value::Float(2.5));
        assert_eq!(Value::Int(3), Value::Float(3.0));
        assert!(Value::Null < Value::Int(i64::MIN));
        assert!(Value::Str("DE".into()) < Value::Str("JP".into()));
    }

    #[test]
    fn json_literals_coerce_to_column_kind() {
        assert_eq!(
            Value::from_json(ColumnKind::Date, &json!("2024-10-20")).unwrap(),
            Value::Date(NaiveDate::from_ymd_opt(2024, 10, 20).unwrap())
        );
        assert_eq!(
            Value::from_json(ColumnKind::Int, &json!("42")).unwrap(),
            Value::Int(42)
        );
        assert_eq!(
            Value::from_json(ColumnKind::Float, &json!(1)).unwrap(),
            Value::Float(1.0)
        );
        assert!(Value::from_json(ColumnKind::Date, &json!("yesterday")).is_err());
        assert!(Value::from_json(ColumnKind::Int, &json!([1])).is_err());
    }

    #[test]
    fn dates_round_trip_through_arrow() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let array = values_to_array(ColumnKind::Date, [Value::Date(date), Value::Null].iter());
        let view = ColumnView::try_new(&array).unwrap();
        assert_eq!(view.value(0), Value::Date(date));
        assert_eq!(view.value(1), Value::Null);
        assert_eq!(date_to_days(NaiveDate::from_ymd_opt(1970, 1, 2).unwrap()), 1);
    }
}
